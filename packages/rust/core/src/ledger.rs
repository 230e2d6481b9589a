//! Ledger access for orchestrators: direct calls or a single-writer queue.
//!
//! Blocking runs await the store directly. Background runs send commands to
//! one [`LedgerWriter`] task that owns the store handle, so ledger writes for
//! a call are applied one at a time in the order they were sent.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use kbflow_shared::{
    DatasetId, KbflowError, ProgressDelta, Result, RunError, RunId, RunLedgerEntry,
    RunLedgerStore, RunStatus,
};

// ---------------------------------------------------------------------------
// Queue protocol
// ---------------------------------------------------------------------------

enum LedgerCommand {
    Open {
        dataset_id: DatasetId,
        pipeline_name: String,
        reply: oneshot::Sender<Result<RunId>>,
    },
    BeginProcessing {
        run_id: RunId,
        reply: oneshot::Sender<Result<()>>,
    },
    Progress {
        run_id: RunId,
        delta: ProgressDelta,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        run_id: RunId,
        status: RunStatus,
        error: Option<RunError>,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        run_id: RunId,
        reply: oneshot::Sender<Result<Option<RunLedgerEntry>>>,
    },
}

impl LedgerCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::BeginProcessing { .. } => "begin_processing",
            Self::Progress { .. } => "progress",
            Self::Close { .. } => "close",
            Self::Get { .. } => "get",
        }
    }
}

fn writer_gone() -> KbflowError {
    KbflowError::Storage("ledger writer has stopped".into())
}

/// Sending half of the single-writer queue. Cheap to clone.
#[derive(Clone)]
pub struct LedgerQueue {
    tx: mpsc::Sender<LedgerCommand>,
}

impl LedgerQueue {
    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both queues feed the same writer.
    pub fn same_writer(&self, other: &LedgerQueue) -> bool {
        self.tx.same_channel(&other.tx)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LedgerCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())?
    }
}

/// Owns the store and applies queued commands in arrival order.
pub struct LedgerWriter {
    store: Arc<dyn RunLedgerStore>,
    rx: mpsc::Receiver<LedgerCommand>,
}

impl LedgerWriter {
    /// Start a writer task. It stops once every [`LedgerQueue`] clone is dropped.
    pub fn spawn(store: Arc<dyn RunLedgerStore>, capacity: usize) -> (LedgerQueue, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = Self { store, rx };
        let handle = tokio::spawn(writer.run());
        (LedgerQueue { tx }, handle)
    }

    async fn run(mut self) {
        let mut applied = 0u64;
        while let Some(command) = self.rx.recv().await {
            debug!(command = command.name(), "ledger write");
            apply(self.store.as_ref(), command).await;
            applied += 1;
        }
        debug!(applied, "ledger writer stopped");
    }
}

// A dropped reply receiver means the caller went away; the write still
// happened, so the send result is ignored.
async fn apply(store: &dyn RunLedgerStore, command: LedgerCommand) {
    match command {
        LedgerCommand::Open {
            dataset_id,
            pipeline_name,
            reply,
        } => {
            let _ = reply.send(store.open_entry(dataset_id, &pipeline_name).await);
        }
        LedgerCommand::BeginProcessing { run_id, reply } => {
            let _ = reply.send(store.begin_processing(run_id).await);
        }
        LedgerCommand::Progress {
            run_id,
            delta,
            reply,
        } => {
            let _ = reply.send(store.append_progress(run_id, delta).await);
        }
        LedgerCommand::Close {
            run_id,
            status,
            error,
            reply,
        } => {
            let _ = reply.send(store.close(run_id, status, error).await);
        }
        LedgerCommand::Get { run_id, reply } => {
            let _ = reply.send(store.get_entry(run_id).await);
        }
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// The orchestrator's handle on the ledger.
#[derive(Clone)]
pub enum LedgerSink {
    /// Awaited calls against the store.
    Direct(Arc<dyn RunLedgerStore>),
    /// Commands routed through a single writer.
    Queued(LedgerQueue),
}

impl LedgerSink {
    pub async fn open(&self, dataset_id: DatasetId, pipeline_name: &str) -> Result<RunId> {
        match self {
            Self::Direct(store) => store.open_entry(dataset_id, pipeline_name).await,
            Self::Queued(queue) => {
                queue
                    .request(|reply| LedgerCommand::Open {
                        dataset_id,
                        pipeline_name: pipeline_name.to_string(),
                        reply,
                    })
                    .await
            }
        }
    }

    pub async fn begin_processing(&self, run_id: RunId) -> Result<()> {
        match self {
            Self::Direct(store) => store.begin_processing(run_id).await,
            Self::Queued(queue) => {
                queue
                    .request(|reply| LedgerCommand::BeginProcessing { run_id, reply })
                    .await
            }
        }
    }

    /// Apply counter increments. Empty deltas are not written.
    pub async fn progress(&self, run_id: RunId, delta: ProgressDelta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        match self {
            Self::Direct(store) => store.append_progress(run_id, delta).await,
            Self::Queued(queue) => {
                queue
                    .request(|reply| LedgerCommand::Progress {
                        run_id,
                        delta,
                        reply,
                    })
                    .await
            }
        }
    }

    pub async fn close(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<RunError>,
    ) -> Result<()> {
        match self {
            Self::Direct(store) => store.close(run_id, status, error).await,
            Self::Queued(queue) => {
                queue
                    .request(|reply| LedgerCommand::Close {
                        run_id,
                        status,
                        error,
                        reply,
                    })
                    .await
            }
        }
    }

    pub async fn get(&self, run_id: RunId) -> Result<Option<RunLedgerEntry>> {
        match self {
            Self::Direct(store) => store.get_entry(run_id).await,
            Self::Queued(queue) => {
                queue
                    .request(|reply| LedgerCommand::Get { run_id, reply })
                    .await
            }
        }
    }
}
