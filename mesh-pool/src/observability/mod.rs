//! Logging setup for the manager CLI and worker processes

pub mod logging;

pub use logging::{
    default_log_dir, init_production_logging, init_simple_logging, init_worker_logging,
};
