//! Task/pipeline execution engine for kbflow.
//!
//! Steps written in any of four callable shapes are wrapped as [`Task`]s,
//! chained into a [`Pipeline`], and run per dataset by the
//! [`DatasetOrchestrator`]. The [`RunCoordinator`] fans a pipeline out over
//! many datasets, blocking or in the background, and records every run in
//! the ledger.

pub mod coordinator;
pub mod executable;
pub mod ledger;
pub mod memory;
pub mod orchestrator;
pub mod pipeline;
pub mod task;

pub use coordinator::{CoordinatorConfig, DatasetStatus, RunCoordinator, RunMode, RunRequest};
pub use executable::{Executable, Invocation, Output, StepContext, StepResult, StepStream};
pub use ledger::{LedgerQueue, LedgerSink, LedgerWriter};
pub use memory::MemoryBackend;
pub use orchestrator::{DatasetOrchestrator, PreparedRun, Services};
pub use pipeline::Pipeline;
pub use task::{FingerprintLog, Flow, FlowStream, PayloadKind, RunContext, Task, TaskBuilder};
