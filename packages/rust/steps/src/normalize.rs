//! Whitespace normalization (single shape).

use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tracing::debug;

use kbflow_core::{Executable, Invocation, Output, PayloadKind, StepResult, Task};
use kbflow_shared::Result;

use crate::require_text;

/// Trim and collapse runs of whitespace; blank inputs are dropped.
pub fn normalize_task() -> Result<Task> {
    Task::builder("normalize", Executable::single(normalize))
        .accepts(PayloadKind::Any)
        .produces(PayloadKind::named("text"))
        .idempotent(true)
        .build()
}

fn normalize(inv: Invocation) -> StepResult<Output> {
    let Some(unit) = inv.into_unit() else {
        return Ok(Output::Drop);
    };
    let collapsed = collapse_whitespace(require_text(&unit)?);
    if collapsed.is_empty() {
        debug!(item = %unit.provenance.source_item_id, "dropping blank unit");
        return Ok(Output::Drop);
    }
    Ok(unit.derive(json!(collapsed)).into())
}

fn collapse_whitespace(text: &str) -> String {
    static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

    WS_RE.replace_all(text.trim(), " ").into_owned()
}
