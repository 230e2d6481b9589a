//! Ordered composition of tasks.

use kbflow_shared::{KbflowError, Result};

use crate::task::{FlowStream, RunContext, Task};

/// A named, non-empty, immutable sequence of tasks.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    tasks: Vec<Task>,
}

impl Pipeline {
    /// Build a pipeline, checking that each task's output kind feeds the next
    /// task's input kind.
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(KbflowError::composition("pipeline name must not be empty"));
        }
        if tasks.is_empty() {
            return Err(KbflowError::composition(format!(
                "pipeline '{name}' has no tasks"
            )));
        }
        for pair in tasks.windows(2) {
            let (upstream, downstream) = (&pair[0], &pair[1]);
            if !upstream.produces().feeds(downstream.accepts()) {
                return Err(KbflowError::composition(format!(
                    "pipeline '{name}': '{}' produces {}, '{}' accepts {}",
                    upstream.name(),
                    upstream.produces(),
                    downstream.name(),
                    downstream.accepts()
                )));
            }
        }
        Ok(Self { name, tasks })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Chain every task over `initial`. Nothing runs until the result is polled.
    pub fn run(&self, initial: FlowStream, ctx: &RunContext) -> FlowStream {
        self.tasks
            .iter()
            .fold(initial, |stream, task| task.run(stream, ctx.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, StreamExt, TryStreamExt};
    use kbflow_shared::{DatasetId, ItemId, ProcessingUnit, RunId, StepError};
    use serde_json::json;

    use crate::executable::{Executable, Invocation};
    use crate::task::{Flow, PayloadKind};

    fn map_text(name: &str, f: fn(&str) -> String) -> Task {
        Task::new(
            name,
            Executable::single(move |inv: Invocation| {
                Ok::<_, StepError>(
                    inv.into_unit()
                        .map(|u| u.derive(json!(f(u.text().unwrap_or_default())))),
                )
            }),
        )
        .unwrap()
    }

    #[test]
    fn empty_pipeline_rejected() {
        let err = Pipeline::new("empty", Vec::new()).unwrap_err();
        assert!(matches!(err, KbflowError::Composition { .. }));
    }

    #[test]
    fn incompatible_kinds_rejected() {
        let exec = Executable::single(|inv: Invocation| Ok::<_, StepError>(inv.into_unit()));
        let chunk = Task::builder("chunk", exec.clone())
            .produces(PayloadKind::named("chunk"))
            .build()
            .unwrap();
        let embed = Task::builder("embed", exec.clone())
            .accepts(PayloadKind::named("text"))
            .build()
            .unwrap();
        let err = Pipeline::new("p", vec![chunk.clone(), embed]).unwrap_err();
        assert!(err.to_string().contains("'chunk' produces chunk"));

        let anything = Task::new("log", exec).unwrap();
        assert_eq!(Pipeline::new("p", vec![chunk, anything]).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn tasks_apply_in_order() {
        let pipeline = Pipeline::new(
            "p",
            vec![
                map_text("upper", |s| s.to_uppercase()),
                map_text("exclaim", |s| format!("{s}!")),
            ],
        )
        .unwrap();

        let dataset_id = DatasetId::new();
        let input = stream::iter(
            ["a", "b"]
                .map(|p| Ok(Flow::Unit(ProcessingUnit::new(dataset_id, ItemId::new(), json!(p))))),
        )
        .boxed();
        let ctx = RunContext::new(RunId::new(), dataset_id, "p");
        let out: Vec<Flow> = pipeline.run(input, &ctx).try_collect().await.unwrap();
        let texts: Vec<_> = out
            .iter()
            .map(|f| f.unit().text().unwrap_or_default().to_string())
            .collect();
        assert_eq!(texts, vec!["A!", "B!"]);
    }
}
