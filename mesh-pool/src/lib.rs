//! Manager/worker pool for elementwise matrix jobs
//!
//! A [`Manager`] spawns a fresh pool of workers for every job, splits the
//! columns of two equally shaped matrices across them, scatters the pieces,
//! gathers the combined columns and tears the pool down again. Workers are
//! either native processes (`mesh-worker`, see [`ProcessLauncher`]) or tokio
//! tasks in the same process ([`TaskLauncher`]).

pub mod config;
pub mod errors;
pub mod executor;
pub mod group;
pub mod matrix;
pub mod network;
pub mod observability;
pub mod partition;

pub use config::Config;
pub use errors::{ErrorKind, PoolError, Result, WorkerError};
pub use executor::{
    run_from_env, AmbientGroup, CombineOp, JobOutput, JobReport, Manager, ManagerConfig,
    WorkerRuntime, WorkerSummary,
};
pub use group::{
    GroupMode, Launcher, PoolHandle, ProcessGroup, ProcessLauncher, SpawnRequest, TaskLauncher,
    UnifiedGroup, WorkerExit,
};
pub use matrix::Matrix;
pub use observability::{init_production_logging, init_simple_logging, init_worker_logging};
pub use partition::{partition, Partition};
