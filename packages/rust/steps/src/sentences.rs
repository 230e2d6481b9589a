//! Sentence splitting (suspending lazy shape).

use std::sync::LazyLock;

use futures::stream::{self, Stream, StreamExt};
use regex::Regex;
use serde_json::json;

use kbflow_core::{Executable, Invocation, PayloadKind, StepResult, Task};
use kbflow_shared::{ProcessingUnit, Result};

use crate::require_text;

pub fn sentences_task() -> Result<Task> {
    Task::builder("sentences", Executable::suspending_lazy(sentences))
        .accepts(PayloadKind::named("text"))
        .produces(PayloadKind::named("sentence"))
        .idempotent(true)
        .build()
}

fn sentences(inv: Invocation) -> impl Stream<Item = StepResult<ProcessingUnit>> + Send + 'static {
    let items: Vec<StepResult<ProcessingUnit>> = match inv.into_unit() {
        None => Vec::new(),
        Some(unit) => match require_text(&unit) {
            Ok(text) => split_sentences(text)
                .into_iter()
                .map(|sentence| Ok(unit.derive(json!(sentence))))
                .collect(),
            Err(failure) => vec![Err(failure.into())],
        },
    };
    // One scheduling point per sentence.
    stream::iter(items).then(|item| async move {
        tokio::task::yield_now().await;
        item
    })
}

fn split_sentences(text: &str) -> Vec<String> {
    static SENTENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]*").expect("valid regex"));

    SENTENCE_RE
        .find_iter(text)
        .map(|m| m.as_str().trim())
        .filter(|s| s.chars().any(char::is_alphanumeric))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbflow_core::StepContext;
    use kbflow_shared::{DatasetId, ItemId, Params, RunId};

    #[test]
    fn splits_on_terminators() {
        assert_eq!(
            split_sentences("First one. Second?! third without end"),
            vec!["First one.", "Second?!", "third without end"]
        );
        assert!(split_sentences(" ... ").is_empty());
    }

    #[tokio::test]
    async fn streams_each_sentence() {
        let dataset_id = DatasetId::new();
        let inv = Invocation {
            units: vec![ProcessingUnit::new(dataset_id, ItemId::new(), json!("A b. C d."))],
            params: Params::new(),
            context: StepContext {
                run_id: RunId::new(),
                dataset_id,
                pipeline_name: "p".into(),
                task_name: "sentences".into(),
            },
        };
        let task = sentences_task().unwrap();
        let out: Vec<_> = task
            .executable()
            .drive(inv)
            .map(|r| r.unwrap().payload)
            .collect()
            .await;
        assert_eq!(out, vec![json!("A b."), json!("C d.")]);
    }
}
