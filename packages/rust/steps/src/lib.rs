//! Built-in text steps and the catalog the CLI builds pipelines from.
//!
//! Each step is written in a different execution shape:
//!
//! | step | shape | accepts → produces |
//! |---|---|---|
//! | `normalize` | single | any → text |
//! | `chunk` | lazy | text → chunk |
//! | `sentences` | suspending lazy | text → sentence |
//! | `keywords` | suspending, batched | any → keywords |

mod chunk;
mod keywords;
mod normalize;
mod sentences;

use kbflow_core::{Pipeline, Task};
use kbflow_shared::{KbflowError, ProcessingUnit, Result};

pub use chunk::{DEFAULT_MAX_CHARS, chunk_task};
pub use keywords::{DEFAULT_TOP_N, keywords_task};
pub use normalize::normalize_task;
pub use sentences::sentences_task;

/// Names accepted by [`build_task`].
pub const STEP_NAMES: [&str; 4] = ["normalize", "chunk", "sentences", "keywords"];

/// Steps run when none are named.
pub const DEFAULT_STEPS: [&str; 3] = ["normalize", "chunk", "keywords"];

/// Failures raised by built-in steps.
#[derive(Debug, thiserror::Error)]
pub enum StepFailure {
    #[error("unit has no text payload")]
    MissingText,

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("worker failed: {0}")]
    Worker(String),
}

/// Text of a unit, or [`StepFailure::MissingText`].
pub(crate) fn require_text(unit: &ProcessingUnit) -> std::result::Result<&str, StepFailure> {
    unit.text().ok_or(StepFailure::MissingText)
}

/// Build a catalog step by name. `batch_size` applies to batched steps only.
pub fn build_task(name: &str, batch_size: usize) -> Result<Task> {
    match name {
        "normalize" => normalize_task(),
        "chunk" => chunk_task(DEFAULT_MAX_CHARS),
        "sentences" => sentences_task(),
        "keywords" => keywords_task(batch_size),
        other => Err(KbflowError::validation(format!(
            "unknown step '{other}' (available: {})",
            STEP_NAMES.join(", ")
        ))),
    }
}

/// Build a pipeline from step names, in order.
pub fn build_pipeline(name: &str, steps: &[&str], batch_size: usize) -> Result<Pipeline> {
    let tasks = steps
        .iter()
        .map(|step| build_task(step, batch_size))
        .collect::<Result<Vec<_>>>()?;
    Pipeline::new(name, tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kbflow_core::{CoordinatorConfig, MemoryBackend, RunCoordinator, RunRequest, Services};
    use kbflow_shared::{DatasetRef, DatasetRegistry, Principal, RunStatus};
    use serde_json::json;

    #[test]
    fn catalog_knows_every_step() {
        for name in STEP_NAMES {
            let task = build_task(name, 4).expect("catalog step");
            assert_eq!(task.name(), name);
        }
        assert!(build_task("embed", 1).is_err());
    }

    #[test]
    fn default_steps_compose() {
        let pipeline = build_pipeline("cognify", &DEFAULT_STEPS, 8).unwrap();
        assert_eq!(pipeline.len(), 3);
        assert_eq!(pipeline.tasks()[2].batch_size(), 8);
    }

    #[test]
    fn chunk_cannot_follow_chunk() {
        let err = build_pipeline("bad", &["chunk", "chunk"], 1).unwrap_err();
        assert!(matches!(err, KbflowError::Composition { .. }));
    }

    #[tokio::test]
    async fn default_pipeline_end_to_end() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = Principal::new("alice");
        let id = backend.create_if_absent("notes", &alice).await.unwrap();
        backend
            .add_item(id, json!("  Rust   ownership keeps memory safe.\n\nBorrowing rules apply. "))
            .await
            .unwrap();
        backend.add_item(id, json!({"text": "Pipelines stream units."})).await.unwrap();
        backend.add_item(id, json!("   ")).await.unwrap();

        let coordinator =
            RunCoordinator::new(Services::shared(backend.clone()), CoordinatorConfig::default());
        let pipeline = Arc::new(build_pipeline("cognify", &DEFAULT_STEPS, 2).unwrap());
        let results = coordinator
            .run_pipeline(RunRequest::new(pipeline.clone(), alice.clone()).dataset(DatasetRef::name("notes")))
            .await
            .unwrap();
        assert_eq!(results[0].status, RunStatus::Completed);
        // Two non-blank items, each short enough for a single chunk.
        assert_eq!(results[0].processed_count, 2);

        let rerun = coordinator
            .run_pipeline(
                RunRequest::new(pipeline, alice)
                    .dataset(DatasetRef::name("notes"))
                    .incremental(true),
            )
            .await
            .unwrap();
        assert_eq!(rerun[0].status, RunStatus::Completed);
        assert_eq!(rerun[0].processed_count, 0);
        assert_eq!(rerun[0].skipped_count, 3);
    }
}
