//! Keyword extraction (suspending shape, batched).
//!
//! Term counting runs on the blocking pool; each unit is tagged with its
//! `top_n` most frequent terms, ties broken by first occurrence.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use kbflow_core::{Executable, Invocation, PayloadKind, StepResult, Task};
use kbflow_shared::{ProcessingUnit, Result};

use crate::{StepFailure, require_text};

/// Keywords kept per unit unless `top_n` is set.
pub const DEFAULT_TOP_N: u64 = 5;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "her", "was", "one",
    "our", "out", "has", "have", "had", "its", "into", "than", "that", "this", "then", "them",
    "they", "with", "from", "will", "would", "there", "their", "what", "when", "which", "while",
    "who", "how", "also", "been", "were", "your",
];

pub fn keywords_task(batch_size: usize) -> Result<Task> {
    Task::builder("keywords", Executable::suspending(extract).batched())
        .batch_size(batch_size)
        .param("top_n", DEFAULT_TOP_N)
        .accepts(PayloadKind::Any)
        .produces(PayloadKind::named("keywords"))
        .idempotent(true)
        .build()
}

async fn extract(inv: Invocation) -> StepResult<Vec<ProcessingUnit>> {
    let top_n = match inv.params.get("top_n") {
        None => DEFAULT_TOP_N as usize,
        Some(value) => value.as_u64().map(|n| n as usize).ok_or_else(|| {
            StepFailure::InvalidParam {
                name: "top_n".into(),
                reason: format!("expected a non-negative integer, got {value}"),
            }
        })?,
    };

    let units = inv.units;
    let tagged = tokio::task::spawn_blocking(move || {
        units
            .iter()
            .map(|unit| {
                let text = require_text(unit)?;
                let keywords = top_keywords(text, top_n);
                Ok(unit.derive(json!({ "text": text, "keywords": keywords })))
            })
            .collect::<std::result::Result<Vec<_>, StepFailure>>()
    })
    .await
    .map_err(|e| StepFailure::Worker(e.to_string()))??;
    Ok(tagged)
}

fn top_keywords(text: &str, top_n: usize) -> Vec<String> {
    static WORD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[\p{L}\p{N}][\p{L}\p{N}'-]*").expect("valid regex"));

    // term -> (count, first position)
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, m) in WORD_RE.find_iter(text).enumerate() {
        let term = m.as_str().to_lowercase();
        if term.chars().count() < 3 || STOPWORDS.contains(&term.as_str()) {
            continue;
        }
        counts.entry(term).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0).then(a.1.1.cmp(&b.1.1)));
    ranked.into_iter().take(top_n).map(|(term, _)| term).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use kbflow_core::StepContext;
    use kbflow_shared::{DatasetId, ItemId, Params, RunId};

    fn invocation(payloads: &[serde_json::Value], params: Params) -> Invocation {
        let dataset_id = DatasetId::new();
        Invocation {
            units: payloads
                .iter()
                .map(|p| ProcessingUnit::new(dataset_id, ItemId::new(), p.clone()))
                .collect(),
            params,
            context: StepContext {
                run_id: RunId::new(),
                dataset_id,
                pipeline_name: "p".into(),
                task_name: "keywords".into(),
            },
        }
    }

    #[test]
    fn ranks_by_frequency_then_position() {
        let text = "Rust streams units. Units flow through tasks; rust tasks batch units.";
        assert_eq!(top_keywords(text, 3), vec!["units", "rust", "tasks"]);
        assert!(top_keywords("the and for", 5).is_empty());
    }

    #[tokio::test]
    async fn tags_every_unit_in_a_batch() {
        let task = keywords_task(2).unwrap();
        let inv = invocation(
            &[json!("apple apple pear"), json!({"text": "plum plum plum kiwi"})],
            Params::new().with("top_n", 1),
        );
        let out: Vec<ProcessingUnit> = task.executable().drive(inv).try_collect().await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload["keywords"], json!(["apple"]));
        assert_eq!(out[1].payload["keywords"], json!(["plum"]));
        assert_eq!(out[1].payload["text"], json!("plum plum plum kiwi"));
    }

    #[tokio::test]
    async fn missing_text_fails_the_batch() {
        let task = keywords_task(2).unwrap();
        let inv = invocation(&[json!("fine text"), json!(7)], Params::new());
        let result: StepResult<Vec<ProcessingUnit>> =
            task.executable().drive(inv).try_collect().await;
        assert_eq!(result.unwrap_err().to_string(), "unit has no text payload");
    }
}
