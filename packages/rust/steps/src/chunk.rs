//! Fixed-size text chunking (lazy shape).
//!
//! Chunks are cut at the last whitespace before `max_chars` bytes, or at a
//! character boundary when a single word is longer than that.

use serde_json::json;

use kbflow_core::{Executable, Invocation, PayloadKind, StepResult, Task};
use kbflow_shared::{ProcessingUnit, Result};

use crate::{StepFailure, require_text};

/// Default upper bound on chunk length, in bytes.
pub const DEFAULT_MAX_CHARS: u64 = 512;

pub fn chunk_task(max_chars: u64) -> Result<Task> {
    Task::builder("chunk", Executable::lazy(chunk))
        .param("max_chars", max_chars)
        .accepts(PayloadKind::named("text"))
        .produces(PayloadKind::named("chunk"))
        .idempotent(true)
        .build()
}

fn chunk(inv: Invocation) -> Chunks {
    let max_chars = match inv.params.get("max_chars") {
        None => Ok(DEFAULT_MAX_CHARS as usize),
        Some(value) => value
            .as_u64()
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .ok_or_else(|| StepFailure::InvalidParam {
                name: "max_chars".into(),
                reason: format!("expected a positive integer, got {value}"),
            }),
    };
    let max_chars = match max_chars {
        Ok(n) => n,
        Err(failure) => return Chunks::failed(failure),
    };
    let Some(unit) = inv.into_unit() else {
        return Chunks::empty();
    };
    let text = match require_text(&unit) {
        Ok(text) => text.to_string(),
        Err(failure) => return Chunks::failed(failure),
    };
    Chunks {
        source: Some(unit),
        text,
        pos: 0,
        index: 0,
        max_chars,
        failure: None,
    }
}

/// Yields one chunk unit per call to `next`.
struct Chunks {
    source: Option<ProcessingUnit>,
    text: String,
    pos: usize,
    index: usize,
    max_chars: usize,
    failure: Option<StepFailure>,
}

impl Chunks {
    fn empty() -> Self {
        Self {
            source: None,
            text: String::new(),
            pos: 0,
            index: 0,
            max_chars: 1,
            failure: None,
        }
    }

    fn failed(failure: StepFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::empty()
        }
    }

    fn next_span(&mut self) -> Option<(usize, usize)> {
        let text = self.text.as_str();
        let len = text.len();

        let skipped = text[self.pos..].len() - text[self.pos..].trim_start().len();
        let start = self.pos + skipped;
        if start >= len {
            self.pos = len;
            return None;
        }

        let mut end = (start + self.max_chars).min(len);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // max_chars is smaller than the next character.
            end = start + text[start..].chars().next().map_or(1, char::len_utf8);
        } else if end < len {
            if let Some(ws) = text[start..end].rfind(char::is_whitespace) {
                if ws > 0 {
                    end = start + ws;
                }
            }
        }

        self.pos = end;
        Some((start, end))
    }
}

impl Iterator for Chunks {
    type Item = StepResult<ProcessingUnit>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(failure) = self.failure.take() {
            return Some(Err(failure.into()));
        }
        let (start, end) = self.next_span()?;
        let source = self.source.as_ref()?;
        let piece = self.text[start..end].trim_end();
        let unit = source.derive(json!({ "text": piece, "index": self.index }));
        self.index += 1;
        Some(Ok(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbflow_core::StepContext;
    use kbflow_shared::{DatasetId, ItemId, Params, RunId};

    fn pieces(text: &str, max_chars: u64) -> Vec<String> {
        let dataset_id = DatasetId::new();
        let inv = Invocation {
            units: vec![ProcessingUnit::new(dataset_id, ItemId::new(), json!(text))],
            params: Params::new().with("max_chars", max_chars),
            context: StepContext {
                run_id: RunId::new(),
                dataset_id,
                pipeline_name: "p".into(),
                task_name: "chunk".into(),
            },
        };
        chunk(inv)
            .map(|r| r.unwrap().text().unwrap().to_string())
            .collect()
    }

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(
            pieces("alpha beta gamma delta", 11),
            vec!["alpha beta", "gamma delta"]
        );
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(pieces("tiny", 512), vec!["tiny"]);
        assert!(pieces("   ", 512).is_empty());
    }

    #[test]
    fn long_words_are_cut_at_char_boundaries() {
        assert_eq!(pieces("ééééé", 4), vec!["éé", "éé", "é"]);
        assert_eq!(pieces("日本", 1), vec!["日", "本"]);
    }

    #[test]
    fn chunks_are_indexed_and_keep_provenance() {
        let dataset_id = DatasetId::new();
        let source = ProcessingUnit::new(dataset_id, ItemId::new(), json!("one two three"));
        let inv = Invocation {
            units: vec![source.clone()],
            params: Params::new().with("max_chars", 5),
            context: StepContext {
                run_id: RunId::new(),
                dataset_id,
                pipeline_name: "p".into(),
                task_name: "chunk".into(),
            },
        };
        let units: Vec<_> = chunk(inv).map(|r| r.unwrap()).collect();
        assert_eq!(units.len(), 3);
        assert_eq!(units[2].payload, json!({"text": "three", "index": 2}));
        assert!(units.iter().all(|u| u.provenance == source.provenance));
    }

    #[test]
    fn zero_max_chars_is_rejected() {
        let dataset_id = DatasetId::new();
        let inv = Invocation {
            units: vec![ProcessingUnit::new(dataset_id, ItemId::new(), json!("x"))],
            params: Params::new().with("max_chars", 0),
            context: StepContext {
                run_id: RunId::new(),
                dataset_id,
                pipeline_name: "p".into(),
                task_name: "chunk".into(),
            },
        };
        let results: Vec<_> = chunk(inv).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap_err().to_string().contains("max_chars"));
    }
}
