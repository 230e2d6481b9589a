//! A named, configured step and the streaming loop that drives it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use kbflow_shared::{
    DatasetId, Fingerprint, FingerprintStore, KbflowError, Params, ProcessingUnit, Result, RunId,
};

use crate::executable::{Executable, Invocation, StepContext, StepStream};

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// An item travelling between tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Live unit to be processed by the next task.
    Unit(ProcessingUnit),
    /// Already-converged unit; passed through untouched.
    Skipped(ProcessingUnit),
}

impl Flow {
    pub fn unit(&self) -> &ProcessingUnit {
        match self {
            Self::Unit(u) | Self::Skipped(u) => u,
        }
    }

    pub fn into_unit(self) -> ProcessingUnit {
        match self {
            Self::Unit(u) | Self::Skipped(u) => u,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// Stream of flow items between tasks. Errors end the run.
pub type FlowStream = BoxStream<'static, Result<Flow>>;

/// Per-run values every task sees.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub dataset_id: DatasetId,
    pub pipeline_name: String,
    /// Skip units an idempotent task has already completed.
    pub incremental: bool,
    /// Run-level overrides merged over each task's bound parameters.
    pub params: Arc<Params>,
    pub fingerprints: Option<Arc<dyn FingerprintStore>>,
    /// Groups drained by idempotent tasks during this run, not yet recorded.
    pub drained: Arc<FingerprintLog>,
}

impl RunContext {
    pub fn new(run_id: RunId, dataset_id: DatasetId, pipeline_name: impl Into<String>) -> Self {
        Self {
            run_id,
            dataset_id,
            pipeline_name: pipeline_name.into(),
            incremental: false,
            params: Arc::new(Params::new()),
            fingerprints: None,
            drained: Arc::new(FingerprintLog::default()),
        }
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = Arc::new(params);
        self
    }

    pub fn with_fingerprints(mut self, store: Arc<dyn FingerprintStore>) -> Self {
        self.fingerprints = Some(store);
        self
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("dataset_id", &self.dataset_id)
            .field("pipeline_name", &self.pipeline_name)
            .field("incremental", &self.incremental)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Fingerprint log
// ---------------------------------------------------------------------------

/// Input fingerprints of groups idempotent tasks have drained in one run.
///
/// A unit has only converged once it clears the whole pipeline, so entries
/// are held here and written to the [`FingerprintStore`] by [`commit`] after
/// the run succeeds.
///
/// [`commit`]: FingerprintLog::commit
#[derive(Debug, Default)]
pub struct FingerprintLog {
    pending: Mutex<BTreeMap<String, Vec<Fingerprint>>>,
}

impl FingerprintLog {
    fn push(&self, task_name: &str, fingerprints: Vec<Fingerprint>) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending
            .entry(task_name.to_string())
            .or_default()
            .extend(fingerprints);
    }

    fn take(&self) -> BTreeMap<String, Vec<Fingerprint>> {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *pending)
    }

    /// Number of fingerprints waiting to be committed.
    pub fn len(&self) -> usize {
        match self.pending.lock() {
            Ok(guard) => guard.values().map(Vec::len).sum(),
            Err(poisoned) => poisoned.into_inner().values().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record every pending fingerprint as completed and clear the log.
    pub async fn commit(&self, dataset_id: DatasetId, store: &dyn FingerprintStore) -> Result<usize> {
        let pending = self.take();
        let mut recorded = 0;
        for (task_name, fingerprints) in pending {
            store
                .record_completed(dataset_id, &task_name, &fingerprints)
                .await?;
            recorded += fingerprints.len();
        }
        Ok(recorded)
    }
}

// ---------------------------------------------------------------------------
// Payload kinds
// ---------------------------------------------------------------------------

/// Declared kind of the payloads a task accepts or produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Compatible with every kind.
    Any,
    Named(String),
}

impl PayloadKind {
    pub fn named(kind: impl Into<String>) -> Self {
        Self::Named(kind.into())
    }

    /// Whether output of kind `self` may feed a task accepting `next`.
    pub fn feeds(&self, next: &PayloadKind) -> bool {
        match (self, next) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Named(a), Self::Named(b)) => a == b,
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

struct TaskInner {
    name: String,
    executable: Executable,
    batch_size: usize,
    params: Params,
    idempotent: bool,
    accepts: PayloadKind,
    produces: PayloadKind,
}

/// Immutable step configuration. Clones share the same definition.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Task with batch size 1 and no bound parameters.
    pub fn new(name: impl Into<String>, executable: Executable) -> Result<Self> {
        Self::builder(name, executable).build()
    }

    pub fn builder(name: impl Into<String>, executable: Executable) -> TaskBuilder {
        TaskBuilder {
            name: name.into(),
            executable,
            batch_size: 1,
            params: Params::new(),
            idempotent: false,
            accepts: PayloadKind::Any,
            produces: PayloadKind::Any,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    pub fn params(&self) -> &Params {
        &self.inner.params
    }

    pub fn is_idempotent(&self) -> bool {
        self.inner.idempotent
    }

    pub fn accepts(&self) -> &PayloadKind {
        &self.inner.accepts
    }

    pub fn produces(&self) -> &PayloadKind {
        &self.inner.produces
    }

    pub fn executable(&self) -> &Executable {
        &self.inner.executable
    }

    /// Apply this task to `input`, yielding its outputs in order.
    ///
    /// Skipped units pass through untouched. The first step error is yielded
    /// as [`KbflowError::TaskExecution`] and ends the stream.
    pub fn run(&self, input: FlowStream, ctx: RunContext) -> FlowStream {
        let params = self.inner.params.merged(&ctx.params);
        let state = TaskRun {
            task: self.clone(),
            ctx,
            params,
            input,
            input_done: false,
            active: None,
            held: None,
            failed: false,
        };
        stream::unfold(state, |mut state| async move {
            let item = state.next_item().await?;
            Some((item, state))
        })
        .boxed()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("executable", &self.inner.executable)
            .field("batch_size", &self.inner.batch_size)
            .field("idempotent", &self.inner.idempotent)
            .field("accepts", &self.inner.accepts)
            .field("produces", &self.inner.produces)
            .finish()
    }
}

/// Builder for [`Task`].
pub struct TaskBuilder {
    name: String,
    executable: Executable,
    batch_size: usize,
    params: Params,
    idempotent: bool,
    accepts: PayloadKind,
    produces: PayloadKind,
}

impl TaskBuilder {
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params = self.params.with(key, value);
        self
    }

    /// Mark the step as safe to skip for inputs it has already completed.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn accepts(mut self, kind: PayloadKind) -> Self {
        self.accepts = kind;
        self
    }

    pub fn produces(mut self, kind: PayloadKind) -> Self {
        self.produces = kind;
        self
    }

    pub fn build(self) -> Result<Task> {
        if self.name.trim().is_empty() {
            return Err(KbflowError::composition("task name must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(KbflowError::composition(format!(
                "task '{}': batch size must be at least 1",
                self.name
            )));
        }
        if self.batch_size > 1 && !self.executable.accepts_batch() {
            return Err(KbflowError::composition(format!(
                "task '{}': batch size {} requires a batched executable",
                self.name, self.batch_size
            )));
        }
        Ok(Task {
            inner: Arc::new(TaskInner {
                name: self.name,
                executable: self.executable,
                batch_size: self.batch_size,
                params: self.params,
                idempotent: self.idempotent,
                accepts: self.accepts,
                produces: self.produces,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Streaming loop
// ---------------------------------------------------------------------------

/// Upper bound on the up-front allocation for one group.
const MAX_PREALLOCATED_GROUP: usize = 64;

struct ActiveGroup {
    outputs: StepStream,
    fingerprints: Vec<Fingerprint>,
}

struct TaskRun {
    task: Task,
    ctx: RunContext,
    params: Params,
    input: FlowStream,
    input_done: bool,
    active: Option<ActiveGroup>,
    /// Item to emit once the current group has drained.
    held: Option<Result<Flow>>,
    failed: bool,
}

impl TaskRun {
    async fn next_item(&mut self) -> Option<Result<Flow>> {
        loop {
            if self.failed {
                return None;
            }

            if let Some(active) = self.active.as_mut() {
                let next = active.outputs.next().await;
                match next {
                    Some(Ok(unit)) => return Some(Ok(Flow::Unit(unit))),
                    Some(Err(source)) => {
                        self.failed = true;
                        self.active = None;
                        return Some(Err(KbflowError::task(self.task.name(), source)));
                    }
                    None => {
                        if let Some(group) = self.active.take() {
                            if self.task.is_idempotent() && !group.fingerprints.is_empty() {
                                self.ctx.drained.push(self.task.name(), group.fingerprints);
                            }
                        }
                        continue;
                    }
                }
            }

            if let Some(item) = self.held.take() {
                return Some(item);
            }
            if self.input_done {
                return None;
            }

            let units = match self.gather().await {
                Ok(units) => units,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            if !units.is_empty() {
                self.start_group(units);
            }
        }
    }

    /// Pull up to `batch_size` live units. Stops early at a skipped or
    /// converged unit, or an upstream error, which is held for later.
    async fn gather(&mut self) -> Result<Vec<ProcessingUnit>> {
        let batch_size = self.task.batch_size();
        let mut units = Vec::with_capacity(batch_size.min(MAX_PREALLOCATED_GROUP));
        while units.len() < batch_size {
            match self.input.next().await {
                None => {
                    self.input_done = true;
                    break;
                }
                Some(Ok(Flow::Unit(unit))) => {
                    if is_converged(&self.task, &self.ctx, &unit).await? {
                        self.held = Some(Ok(Flow::Skipped(unit)));
                        break;
                    }
                    units.push(unit);
                }
                Some(other) => {
                    self.held = Some(other);
                    break;
                }
            }
        }
        Ok(units)
    }

    fn start_group(&mut self, units: Vec<ProcessingUnit>) {
        debug!(
            task = self.task.name(),
            shape = self.task.executable().shape_name(),
            units = units.len(),
            "invoking step"
        );
        let fingerprints = units.iter().map(|u| u.fingerprint.clone()).collect();
        let invocation = Invocation {
            units,
            params: self.params.clone(),
            context: StepContext {
                run_id: self.ctx.run_id,
                dataset_id: self.ctx.dataset_id,
                pipeline_name: self.ctx.pipeline_name.clone(),
                task_name: self.task.name().to_string(),
            },
        };
        self.active = Some(ActiveGroup {
            outputs: self.task.executable().drive(invocation),
            fingerprints,
        });
    }
}

// Only `Sync` parts of the run state may be borrowed across awaits.

async fn is_converged(task: &Task, ctx: &RunContext, unit: &ProcessingUnit) -> Result<bool> {
    if !ctx.incremental || !task.is_idempotent() {
        return Ok(false);
    }
    match &ctx.fingerprints {
        Some(store) => {
            store
                .is_completed(ctx.dataset_id, task.name(), &unit.fingerprint)
                .await
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::TryStreamExt;
    use kbflow_shared::{ItemId, StepError};
    use serde_json::json;

    use crate::executable::{Output, StepResult};
    use crate::memory::MemoryBackend;

    fn source(dataset_id: DatasetId, payloads: &[&str]) -> FlowStream {
        let units: Vec<_> = payloads
            .iter()
            .map(|p| Ok(Flow::Unit(ProcessingUnit::new(dataset_id, ItemId::new(), json!(p)))))
            .collect();
        stream::iter(units).boxed()
    }

    fn texts(flows: &[Flow]) -> Vec<String> {
        flows
            .iter()
            .map(|f| f.unit().text().unwrap_or_default().to_string())
            .collect()
    }

    fn upper_batched() -> Executable {
        Executable::single(|inv: Invocation| {
            Ok::<_, StepError>(
                inv.units
                    .iter()
                    .map(|u| u.derive(json!(u.text().unwrap_or_default().to_uppercase())))
                    .collect::<Vec<_>>(),
            )
        })
        .batched()
    }

    fn ctx(dataset_id: DatasetId) -> RunContext {
        RunContext::new(RunId::new(), dataset_id, "test")
    }

    #[tokio::test]
    async fn batching_is_transparent() {
        let dataset_id = DatasetId::new();
        let input = ["a", "b", "c", "d", "e"];
        for batch_size in 1..=6 {
            let task = Task::builder("upper", upper_batched())
                .batch_size(batch_size)
                .build()
                .unwrap();
            let out: Vec<Flow> = task
                .run(source(dataset_id, &input), ctx(dataset_id))
                .try_collect()
                .await
                .unwrap();
            assert_eq!(texts(&out), vec!["A", "B", "C", "D", "E"], "batch {batch_size}");
        }
    }

    #[tokio::test]
    async fn lazy_outputs_keep_input_order() {
        let dataset_id = DatasetId::new();
        let exec = Executable::lazy(|inv: Invocation| {
            inv.units
                .into_iter()
                .flat_map(|u| {
                    let text = u.text().unwrap_or_default().to_string();
                    vec![
                        Ok(u.derive(json!(format!("{text}1")))),
                        Ok(u.derive(json!(format!("{text}2")))),
                    ]
                })
                .collect::<Vec<StepResult<ProcessingUnit>>>()
        })
        .batched();
        for batch_size in 1..=4 {
            let task = Task::builder("split", exec.clone())
                .batch_size(batch_size)
                .build()
                .unwrap();
            let out: Vec<Flow> = task
                .run(source(dataset_id, &["a", "b", "c"]), ctx(dataset_id))
                .try_collect()
                .await
                .unwrap();
            assert_eq!(texts(&out), vec!["a1", "a2", "b1", "b2", "c1", "c2"]);
        }
    }

    #[tokio::test]
    async fn drop_removes_units() {
        let dataset_id = DatasetId::new();
        let exec = Executable::single(|inv: Invocation| {
            let unit = inv.into_unit();
            Ok::<_, StepError>(match unit {
                Some(u) if u.text() == Some("drop") => Output::Drop,
                Some(u) => Output::One(u),
                None => Output::Drop,
            })
        });
        let task = Task::new("filter", exec).unwrap();
        let out: Vec<Flow> = task
            .run(source(dataset_id, &["a", "drop", "b"]), ctx(dataset_id))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(texts(&out), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn step_error_aborts_task() {
        let dataset_id = DatasetId::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let exec = Executable::single(move |inv: Invocation| -> StepResult<Output> {
            counter.fetch_add(1, Ordering::SeqCst);
            match inv.into_unit() {
                Some(u) if u.text() == Some("bad") => Err("cannot parse 'bad'".into()),
                other => Ok(other.into()),
            }
        });
        let task = Task::new("parse", exec).unwrap();
        let results: Vec<Result<Flow>> = task
            .run(source(dataset_id, &["ok", "bad", "never"]), ctx(dataset_id))
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(KbflowError::TaskExecution { task, source }) => {
                assert_eq!(task, "parse");
                assert_eq!(source.to_string(), "cannot parse 'bad'");
            }
            other => panic!("expected task error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn params_and_context_are_injected() {
        let dataset_id = DatasetId::new();
        let exec = Executable::single(|inv: Invocation| {
            let suffix = inv.params.get_str("suffix").unwrap_or("?").to_string();
            let task = inv.context.task_name.clone();
            Ok::<_, StepError>(
                inv.into_unit()
                    .map(|u| u.derive(json!(format!("{}{suffix}@{task}", u.text().unwrap_or_default())))),
            )
        });
        let task = Task::builder("tag", exec)
            .param("suffix", "-default")
            .build()
            .unwrap();

        let out: Vec<Flow> = task
            .run(source(dataset_id, &["x"]), ctx(dataset_id))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(texts(&out), vec!["x-default@tag"]);

        let overridden = ctx(dataset_id).with_params(Params::new().with("suffix", "-run"));
        let out: Vec<Flow> = task
            .run(source(dataset_id, &["x"]), overridden)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(texts(&out), vec!["x-run@tag"]);
    }

    #[tokio::test]
    async fn idempotent_task_skips_converged_units_when_incremental() {
        let dataset_id = DatasetId::new();
        let store = Arc::new(MemoryBackend::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let exec = Executable::single(move |inv: Invocation| {
            counter.fetch_add(inv.units.len(), Ordering::SeqCst);
            Ok::<_, StepError>(inv.units)
        })
        .batched();
        let task = Task::builder("embed", exec)
            .batch_size(2)
            .idempotent(true)
            .build()
            .unwrap();

        // First run logs fingerprints even without incremental; nothing is
        // recorded until the log is committed.
        let first = ctx(dataset_id).with_fingerprints(store.clone());
        let log = first.drained.clone();
        let out: Vec<Flow> = task
            .run(source(dataset_id, &["a", "b"]), first)
            .try_collect()
            .await
            .unwrap();
        assert!(out.iter().all(|f| !f.is_skipped()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.commit(dataset_id, store.as_ref()).await.unwrap(), 2);
        assert!(log.is_empty());

        // Non-incremental run re-processes everything.
        let full = ctx(dataset_id).with_fingerprints(store.clone());
        let _: Vec<Flow> = task
            .run(source(dataset_id, &["a", "b"]), full)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // Incremental run skips a and b, processes c, keeps order.
        let incremental = ctx(dataset_id)
            .with_fingerprints(store.clone())
            .with_incremental(true);
        let out: Vec<Flow> = task
            .run(source(dataset_id, &["a", "c", "b"]), incremental)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(texts(&out), vec!["a", "c", "b"]);
        assert_eq!(
            out.iter().map(Flow::is_skipped).collect::<Vec<_>>(),
            vec![true, false, true]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn uncommitted_fingerprints_do_not_skip() {
        let dataset_id = DatasetId::new();
        let store = Arc::new(MemoryBackend::new());
        let task = Task::builder("embed", upper_batched())
            .idempotent(true)
            .build()
            .unwrap();

        let first = ctx(dataset_id).with_fingerprints(store.clone());
        let _: Vec<Flow> = task
            .run(source(dataset_id, &["a"]), first)
            .try_collect()
            .await
            .unwrap();

        let rerun = ctx(dataset_id)
            .with_fingerprints(store.clone())
            .with_incremental(true);
        let out: Vec<Flow> = task
            .run(source(dataset_id, &["a"]), rerun)
            .try_collect()
            .await
            .unwrap();
        assert!(!out[0].is_skipped());
        assert_eq!(texts(&out), vec!["A"]);
    }

    #[tokio::test]
    async fn huge_batch_size_does_not_preallocate() {
        let dataset_id = DatasetId::new();
        let task = Task::builder("upper", upper_batched())
            .batch_size(usize::MAX / 2)
            .build()
            .unwrap();
        let out: Vec<Flow> = task
            .run(source(dataset_id, &["a", "b", "c"]), ctx(dataset_id))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(texts(&out), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn skipped_units_pass_through_untouched() {
        let dataset_id = DatasetId::new();
        let unit = ProcessingUnit::new(dataset_id, ItemId::new(), json!("keep"));
        let input = stream::iter(vec![
            Ok(Flow::Unit(ProcessingUnit::new(dataset_id, ItemId::new(), json!("a")))),
            Ok(Flow::Skipped(unit.clone())),
            Ok(Flow::Unit(ProcessingUnit::new(dataset_id, ItemId::new(), json!("b")))),
        ])
        .boxed();
        let task = Task::builder("upper", upper_batched())
            .batch_size(4)
            .build()
            .unwrap();
        let out: Vec<Flow> = task.run(input, ctx(dataset_id)).try_collect().await.unwrap();
        assert_eq!(texts(&out), vec!["A", "keep", "B"]);
        assert_eq!(out[1], Flow::Skipped(unit));
    }

    #[test]
    fn invalid_batch_sizes_rejected() {
        let single = Executable::single(|inv: Invocation| Ok::<_, StepError>(inv.into_unit()));
        assert!(matches!(
            Task::builder("t", single.clone()).batch_size(0).build(),
            Err(KbflowError::Composition { .. })
        ));
        assert!(matches!(
            Task::builder("t", single).batch_size(2).build(),
            Err(KbflowError::Composition { .. })
        ));
        assert!(Task::builder("t", upper_batched()).batch_size(8).build().is_ok());
    }

    #[test]
    fn payload_kind_compatibility() {
        let text = PayloadKind::named("text");
        assert!(text.feeds(&PayloadKind::named("text")));
        assert!(text.feeds(&PayloadKind::Any));
        assert!(PayloadKind::Any.feeds(&text));
        assert!(!text.feeds(&PayloadKind::named("chunk")));
    }
}
