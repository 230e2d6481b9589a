//! Runs one pipeline against one dataset and records the outcome.
//!
//! A run goes through three steps so callers can check every dataset before
//! any ledger entry exists:
//!
//! 1. [`DatasetOrchestrator::authorize`]: dataset exists and the principal may write
//! 2. [`DatasetOrchestrator::open`]: ledger entry created in `Started`
//! 3. [`PreparedRun::execute`]: drain the pipeline and close the entry

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use kbflow_shared::{
    Action, Dataset, DatasetId, DatasetRegistry, FingerprintStore, ItemId, KbflowError, Params,
    Permission, PermissionChecker, Principal, ProgressDelta, Result, RunError, RunId,
    RunLedgerEntry, RunLedgerStore, RunStatus,
};

use crate::ledger::LedgerSink;
use crate::pipeline::Pipeline;
use crate::task::{FingerprintLog, Flow, RunContext};

/// Collaborators an orchestrator talks to.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<dyn DatasetRegistry>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub fingerprints: Arc<dyn FingerprintStore>,
    pub ledger: Arc<dyn RunLedgerStore>,
}

impl Services {
    /// Use one backend for every collaborator.
    pub fn shared<B>(backend: Arc<B>) -> Self
    where
        B: DatasetRegistry + PermissionChecker + FingerprintStore + RunLedgerStore + 'static,
    {
        Self {
            registry: backend.clone(),
            permissions: backend.clone(),
            fingerprints: backend.clone(),
            ledger: backend,
        }
    }
}

/// Default number of drained units between progress writes.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 32;

/// Runs a pipeline against single datasets.
#[derive(Clone)]
pub struct DatasetOrchestrator {
    services: Services,
    pipeline: Arc<Pipeline>,
    incremental: bool,
    params: Arc<Params>,
    progress_interval: u64,
}

impl DatasetOrchestrator {
    pub fn new(services: Services, pipeline: Arc<Pipeline>) -> Self {
        Self {
            services,
            pipeline,
            incremental: false,
            params: Arc::new(Params::new()),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
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

    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval.max(1);
        self
    }

    /// Check that the dataset exists and `principal` may write to it.
    #[instrument(skip_all, fields(dataset_id = %dataset_id, principal = %principal))]
    pub async fn authorize(&self, principal: &Principal, dataset_id: DatasetId) -> Result<Dataset> {
        let dataset = self
            .services
            .registry
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| KbflowError::DatasetResolution {
                reference: dataset_id.to_string(),
            })?;

        match self
            .services
            .permissions
            .check(principal, dataset_id, Action::Write)
            .await?
        {
            Permission::Allowed => Ok(dataset),
            Permission::Denied(reason) => {
                warn!(%reason, "write permission denied");
                Err(KbflowError::PermissionDenied {
                    dataset_id,
                    action: Action::Write,
                    reason,
                })
            }
        }
    }

    /// Create the ledger entry for an authorized dataset.
    pub async fn open(&self, dataset: Dataset, ledger: LedgerSink) -> Result<PreparedRun> {
        let run_id = ledger.open(dataset.id, self.pipeline.name()).await?;
        info!(
            %run_id,
            dataset = %dataset.name,
            pipeline = self.pipeline.name(),
            "run opened"
        );
        Ok(PreparedRun {
            orchestrator: self.clone(),
            dataset,
            run_id,
            ledger,
        })
    }

    /// Authorize, open and execute in one call.
    pub async fn run(
        &self,
        principal: &Principal,
        dataset_id: DatasetId,
        ledger: LedgerSink,
        cancel: CancellationToken,
    ) -> Result<RunLedgerEntry> {
        let dataset = self.authorize(principal, dataset_id).await?;
        self.open(dataset, ledger).await?.execute(cancel).await
    }
}

/// Counters for one run, written to the ledger in batches.
struct RunProgress {
    run_id: RunId,
    pending: ProgressDelta,
    interval: u64,
}

impl RunProgress {
    fn new(run_id: RunId, interval: u64) -> Self {
        Self {
            run_id,
            pending: ProgressDelta::default(),
            interval,
        }
    }

    fn due(&self) -> bool {
        self.pending.processed + self.pending.skipped >= self.interval
    }

    async fn flush(&mut self, ledger: &LedgerSink) -> Result<()> {
        let delta = std::mem::take(&mut self.pending);
        ledger.progress(self.run_id, delta).await
    }
}

/// A run with an open ledger entry, ready to execute.
pub struct PreparedRun {
    orchestrator: DatasetOrchestrator,
    dataset: Dataset,
    run_id: RunId,
    ledger: LedgerSink,
}

impl PreparedRun {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn dataset_id(&self) -> DatasetId {
        self.dataset.id
    }

    /// Drive the pipeline over the dataset's items and close the entry.
    ///
    /// Step failures and cancellation are recorded in the ledger, not
    /// returned. `Err` means the ledger itself could not be written.
    #[instrument(skip_all, fields(run_id = %self.run_id, dataset = %self.dataset.name))]
    pub async fn execute(self, cancel: CancellationToken) -> Result<RunLedgerEntry> {
        let start = Instant::now();
        let mut progress = RunProgress::new(self.run_id, self.orchestrator.progress_interval);
        let registry = self.orchestrator.services.registry.clone();

        let drained = Arc::new(FingerprintLog::default());
        let (status, run_error) = match self.drain(&cancel, &mut progress, drained.clone()).await {
            Ok(source_ids) => match self.converge(&drained, &source_ids).await {
                Ok(()) => (RunStatus::Completed, None),
                Err(e) => (RunStatus::Errored, Some(RunError::from(&e))),
            },
            Err(KbflowError::Cancelled) => {
                warn!("run cancelled");
                (
                    RunStatus::PartiallyCompleted,
                    Some(RunError::from(&KbflowError::Cancelled)),
                )
            }
            Err(e) => {
                error!(error = %e, "run failed");
                (RunStatus::Errored, Some(RunError::from(&e)))
            }
        };

        if let Err(e) = progress.flush(&self.ledger).await {
            warn!(error = %e, "final progress write failed");
        }
        self.ledger.close(self.run_id, status, run_error).await?;
        if let Err(e) = registry.set_last_run(self.dataset.id, self.run_id).await {
            warn!(error = %e, "could not update the dataset's last run");
        }

        let entry = self
            .ledger
            .get(self.run_id)
            .await?
            .ok_or(KbflowError::RunNotFound(self.run_id))?;
        info!(
            status = %entry.status,
            processed = entry.processed_count,
            skipped = entry.skipped_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "run finished"
        );
        Ok(entry)
    }

    /// Record what a clean run converged: task fingerprints first, then the
    /// source items for the pipeline.
    async fn converge(&self, drained: &FingerprintLog, source_ids: &[ItemId]) -> Result<()> {
        let services = &self.orchestrator.services;
        let recorded = drained
            .commit(self.dataset.id, services.fingerprints.as_ref())
            .await?;
        debug!(recorded, "task fingerprints recorded");
        services
            .registry
            .mark_items_completed(self.dataset.id, self.orchestrator.pipeline.name(), source_ids)
            .await
    }

    async fn drain(
        &self,
        cancel: &CancellationToken,
        progress: &mut RunProgress,
        drained: Arc<FingerprintLog>,
    ) -> Result<Vec<ItemId>> {
        if cancel.is_cancelled() {
            return Err(KbflowError::Cancelled);
        }
        let orchestrator = &self.orchestrator;
        let registry = &orchestrator.services.registry;
        let pipeline = &orchestrator.pipeline;

        self.ledger.begin_processing(self.run_id).await?;

        let items = if orchestrator.incremental {
            let pending = registry
                .list_unprocessed_items(self.dataset.id, pipeline.name())
                .await?;
            let total = registry.list_items(self.dataset.id).await?.len();
            progress.pending.skipped += total.saturating_sub(pending.len()) as u64;
            pending
        } else {
            registry.list_items(self.dataset.id).await?
        };
        info!(
            items = items.len(),
            incremental = orchestrator.incremental,
            "processing dataset"
        );

        let source_ids: Vec<ItemId> = items.iter().map(|u| u.provenance.source_item_id).collect();
        let initial = stream::iter(items.into_iter().map(|u| Ok(Flow::Unit(u)))).boxed();
        let ctx = RunContext {
            run_id: self.run_id,
            dataset_id: self.dataset.id,
            pipeline_name: pipeline.name().to_string(),
            incremental: orchestrator.incremental,
            params: orchestrator.params.clone(),
            fingerprints: Some(orchestrator.services.fingerprints.clone()),
            drained,
        };

        let mut flow = pipeline.run(initial, &ctx);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(KbflowError::Cancelled),
                next = flow.next() => next,
            };
            match next {
                None => break,
                Some(Ok(Flow::Unit(_))) => progress.pending.processed += 1,
                Some(Ok(Flow::Skipped(_))) => progress.pending.skipped += 1,
                Some(Err(e)) => return Err(e),
            }
            if progress.due() {
                progress.flush(&self.ledger).await?;
            }
        }
        Ok(source_ids)
    }
}
