//! Multi-dataset entry point: resolve, authorize, then run blocking or in
//! the background.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use kbflow_shared::{
    Action, AppConfig, Dataset, DatasetId, DatasetRef, KbflowError, Params, Permission,
    Principal, Result, RunError, RunId, RunLedgerEntry, RunResult, RunStatus,
};

use crate::ledger::{LedgerQueue, LedgerSink, LedgerWriter};
use crate::orchestrator::{DEFAULT_PROGRESS_INTERVAL, DatasetOrchestrator, PreparedRun, Services};
use crate::pipeline::Pipeline;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// How `run_pipeline` waits for its datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Return once every dataset reached a terminal status.
    #[default]
    Blocking,
    /// Return right after the ledger entries are opened.
    Background,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking => f.write_str("blocking"),
            Self::Background => f.write_str("background"),
        }
    }
}

impl FromStr for RunMode {
    type Err = KbflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "blocking" => Ok(Self::Blocking),
            "background" => Ok(Self::Background),
            other => Err(KbflowError::validation(format!(
                "unknown run mode '{other}' (expected 'blocking' or 'background')"
            ))),
        }
    }
}

/// One call to [`RunCoordinator::run_pipeline`].
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub pipeline: Arc<Pipeline>,
    /// Datasets to run against. Empty means every dataset the principal owns.
    pub datasets: Vec<DatasetRef>,
    pub principal: Principal,
    pub mode: RunMode,
    pub incremental: bool,
    /// Overrides merged over every task's bound parameters.
    pub params: Params,
}

impl RunRequest {
    pub fn new(pipeline: Arc<Pipeline>, principal: Principal) -> Self {
        Self {
            pipeline,
            datasets: Vec::new(),
            principal,
            mode: RunMode::Blocking,
            incremental: false,
            params: Params::new(),
        }
    }

    pub fn dataset(mut self, reference: impl Into<DatasetRef>) -> Self {
        self.datasets.push(reference.into());
        self
    }

    pub fn datasets(mut self, references: impl IntoIterator<Item = DatasetRef>) -> Self {
        self.datasets.extend(references);
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

/// Latest run state of one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetStatus {
    pub dataset: Dataset,
    pub latest_run: Option<RunLedgerEntry>,
}

/// Tuning for [`RunCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Capacity of the background ledger queue.
    pub queue_capacity: usize,
    /// Drained units between progress writes.
    pub progress_interval: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl From<&AppConfig> for CoordinatorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            queue_capacity: config.ledger.queue_capacity,
            progress_interval: config.ledger.progress_interval,
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Runs pipelines across datasets and answers status queries.
pub struct RunCoordinator {
    services: Services,
    config: CoordinatorConfig,
    /// Single writer over `services.ledger`, shared by every background call.
    ledger_queue: Mutex<Option<LedgerQueue>>,
    background: tokio::sync::Mutex<JoinSet<()>>,
    background_cancel: Mutex<CancellationToken>,
}

impl RunCoordinator {
    pub fn new(services: Services, config: CoordinatorConfig) -> Self {
        Self {
            services,
            config,
            ledger_queue: Mutex::new(None),
            background: tokio::sync::Mutex::new(JoinSet::new()),
            background_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Run `request` without an external cancellation signal.
    pub async fn run_pipeline(&self, request: RunRequest) -> Result<Vec<RunResult>> {
        self.run_pipeline_until(request, CancellationToken::new())
            .await
    }

    /// Run `request`, stopping cooperatively once `cancel` fires.
    ///
    /// Every dataset is authorized before any ledger entry is opened, so a
    /// permission failure leaves no trace in the ledger. Per-dataset failures
    /// are reported in the results, not returned as `Err`.
    #[instrument(skip_all, fields(
        pipeline = request.pipeline.name(),
        principal = %request.principal,
        mode = %request.mode,
    ))]
    pub async fn run_pipeline_until(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<RunResult>> {
        let dataset_ids = self
            .resolve_datasets(&request.datasets, &request.principal, true)
            .await?;

        let orchestrator = DatasetOrchestrator::new(self.services.clone(), request.pipeline.clone())
            .with_incremental(request.incremental)
            .with_params(request.params.clone())
            .with_progress_interval(self.config.progress_interval);

        let mut authorized = Vec::with_capacity(dataset_ids.len());
        for dataset_id in dataset_ids {
            authorized.push(orchestrator.authorize(&request.principal, dataset_id).await?);
        }
        info!(datasets = authorized.len(), "datasets authorized");

        match request.mode {
            RunMode::Blocking => {
                let sink = LedgerSink::Direct(self.services.ledger.clone());
                let prepared = open_all(&orchestrator, authorized, &sink).await?;
                Ok(execute_all(prepared, cancel, &sink).await)
            }
            RunMode::Background => {
                let sink = LedgerSink::Queued(self.ledger_queue());
                let prepared = open_all(&orchestrator, authorized, &sink).await?;
                let results = prepared
                    .iter()
                    .map(|run| RunResult {
                        dataset_id: run.dataset_id(),
                        run_id: run.run_id(),
                        status: RunStatus::Started,
                        processed_count: 0,
                        skipped_count: 0,
                        error: None,
                    })
                    .collect();

                let linked = self.background_token().child_token();
                self.background
                    .lock()
                    .await
                    .spawn(supervise(prepared, sink, cancel, linked));
                info!("background runs scheduled");
                Ok(results)
            }
        }
    }

    /// Wait for every background run scheduled so far.
    pub async fn wait_background(&self) {
        let mut set = std::mem::take(&mut *self.background.lock().await);
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "background supervisor failed");
            }
        }
    }

    /// Cancel every background run scheduled so far and wait for them to
    /// close. Later calls are unaffected.
    pub async fn cancel_background(&self) {
        let token = match self.background_cancel.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        token.cancel();
        warn!("background runs cancelled");
        self.wait_background().await;
    }

    /// Ledger entry for `run_id`.
    pub async fn get_status(&self, run_id: RunId) -> Result<RunLedgerEntry> {
        self.services
            .ledger
            .get_entry(run_id)
            .await?
            .ok_or(KbflowError::RunNotFound(run_id))
    }

    /// Latest run of each dataset. Requires `Read` on every dataset.
    #[instrument(skip_all, fields(principal = %principal))]
    pub async fn dataset_status(
        &self,
        references: &[DatasetRef],
        principal: &Principal,
    ) -> Result<Vec<DatasetStatus>> {
        let dataset_ids = self.resolve_datasets(references, principal, false).await?;
        let mut statuses = Vec::with_capacity(dataset_ids.len());
        for dataset_id in dataset_ids {
            if let Permission::Denied(reason) = self
                .services
                .permissions
                .check(principal, dataset_id, Action::Read)
                .await?
            {
                return Err(KbflowError::PermissionDenied {
                    dataset_id,
                    action: Action::Read,
                    reason,
                });
            }
            let dataset = self
                .services
                .registry
                .get_dataset(dataset_id)
                .await?
                .ok_or_else(|| KbflowError::DatasetResolution {
                    reference: dataset_id.to_string(),
                })?;
            let latest_run = self.services.ledger.latest_for_dataset(dataset_id).await?;
            statuses.push(DatasetStatus { dataset, latest_run });
        }
        Ok(statuses)
    }

    /// Map references to ids in order, dropping duplicates. Unknown names are
    /// created when `create` is set; unknown ids always fail.
    async fn resolve_datasets(
        &self,
        references: &[DatasetRef],
        principal: &Principal,
        create: bool,
    ) -> Result<Vec<DatasetId>> {
        let registry = &self.services.registry;
        if references.is_empty() {
            return registry.list_owned(principal).await;
        }

        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(references.len());
        for reference in references {
            let id = match (registry.resolve(reference).await?, reference) {
                (Some(id), _) => id,
                (None, DatasetRef::Name(name)) if create => {
                    let id = registry.create_if_absent(name, principal).await?;
                    info!(dataset = %name, %id, "created dataset");
                    id
                }
                (None, _) => {
                    return Err(KbflowError::DatasetResolution {
                        reference: reference.to_string(),
                    });
                }
            };
            if seen.insert(id) {
                ids.push(id);
            } else {
                debug!(%id, "duplicate dataset reference ignored");
            }
        }
        Ok(ids)
    }

    /// Queue to the ledger writer, spawning the writer on first use or after
    /// it has stopped.
    fn ledger_queue(&self) -> LedgerQueue {
        let mut slot = match self.ledger_queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slot.as_ref() {
            Some(queue) if !queue.is_closed() => queue.clone(),
            _ => {
                let (queue, _writer) =
                    LedgerWriter::spawn(self.services.ledger.clone(), self.config.queue_capacity);
                debug!("ledger writer started");
                *slot = Some(queue.clone());
                queue
            }
        }
    }

    fn background_token(&self) -> CancellationToken {
        match self.background_cancel.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution helpers
// ---------------------------------------------------------------------------

/// Open a ledger entry per dataset. If one fails, entries already opened are
/// closed as errored.
async fn open_all(
    orchestrator: &DatasetOrchestrator,
    datasets: Vec<Dataset>,
    sink: &LedgerSink,
) -> Result<Vec<PreparedRun>> {
    let mut prepared: Vec<PreparedRun> = Vec::with_capacity(datasets.len());
    for dataset in datasets {
        match orchestrator.open(dataset, sink.clone()).await {
            Ok(run) => prepared.push(run),
            Err(e) => {
                let run_error = RunError::from(&e);
                for run in &prepared {
                    let _ = sink
                        .close(run.run_id(), RunStatus::Errored, Some(run_error.clone()))
                        .await;
                }
                return Err(e);
            }
        }
    }
    Ok(prepared)
}

/// Execute every prepared run on its own task and collect results in input
/// order. A run that fails outside the pipeline is closed as errored.
async fn execute_all(
    prepared: Vec<PreparedRun>,
    cancel: CancellationToken,
    sink: &LedgerSink,
) -> Vec<RunResult> {
    let handles: Vec<(DatasetId, RunId, JoinHandle<Result<RunLedgerEntry>>)> = prepared
        .into_iter()
        .map(|run| {
            let (dataset_id, run_id) = (run.dataset_id(), run.run_id());
            (dataset_id, run_id, tokio::spawn(run.execute(cancel.clone())))
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (dataset_id, run_id, handle) in handles {
        let failure = match handle.await {
            Ok(Ok(entry)) => {
                results.push(RunResult::from(entry));
                continue;
            }
            Ok(Err(e)) => RunError::from(&e),
            Err(join_error) => RunError {
                kind: "panic".into(),
                task: None,
                message: join_error.to_string(),
            },
        };
        error!(%dataset_id, %run_id, error = %failure.message, "dataset run aborted");
        if let Err(e) = sink
            .close(run_id, RunStatus::Errored, Some(failure.clone()))
            .await
        {
            warn!(%run_id, error = %e, "could not close aborted run");
        }
        // A run may already be terminal when the failure happened after its
        // close, so report what the ledger holds.
        let ledgered = match sink.get(run_id).await {
            Ok(entry) => entry.filter(|entry| entry.status.is_terminal()),
            Err(e) => {
                warn!(%run_id, error = %e, "could not read back aborted run");
                None
            }
        };
        results.push(match ledgered {
            Some(entry) => RunResult::from(entry),
            None => RunResult {
                dataset_id,
                run_id,
                status: RunStatus::Errored,
                processed_count: 0,
                skipped_count: 0,
                error: Some(failure),
            },
        });
    }
    results
}

/// Background body: run every dataset, forwarding the caller's cancellation
/// to `linked`.
async fn supervise(
    prepared: Vec<PreparedRun>,
    sink: LedgerSink,
    caller: CancellationToken,
    linked: CancellationToken,
) {
    let work = execute_all(prepared, linked.clone(), &sink);
    let results = until_either(work, &caller, &linked).await;
    for result in &results {
        debug!(
            dataset_id = %result.dataset_id,
            run_id = %result.run_id,
            status = %result.status,
            "background run finished"
        );
    }
}

async fn until_either<F: Future>(
    work: F,
    caller: &CancellationToken,
    linked: &CancellationToken,
) -> F::Output {
    tokio::pin!(work);
    let mut forwarded = false;
    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = caller.cancelled(), if !forwarded => {
                forwarded = true;
                linked.cancel();
            }
        }
    }
}
