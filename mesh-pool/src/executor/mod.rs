//! Job execution
//!
//! The manager partitions the inputs, scatters them over a spawned pool and
//! gathers the combined columns back; each worker runs [`WorkerRuntime`]
//! over its parent link and applies the job's [`CombineOp`] to its share.

pub mod kernel;
pub mod ledger;
pub mod manager;
pub mod report;
pub mod worker;

pub use kernel::CombineOp;
pub use ledger::{Phase, TransferLedger, TransferRecord};
pub use manager::{AmbientGroup, Manager, ManagerConfig, WORLD_SIZE_ENV};
pub use report::{JobOutput, JobReport, PhaseTimings};
pub use worker::{run_from_env, JobInfo, ParentLink, WorkerRuntime, WorkerState, WorkerSummary};
