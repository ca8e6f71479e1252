//! Pool worker entry point
//!
//! Started by the process launcher with the parent address and worker index
//! in the environment. Takes no arguments; the exit status is the only
//! report of how the job went.

use mesh_pool::{init_worker_logging, run_from_env};
use std::process::ExitCode;

/// Log level for workers (RUST_LOG still takes precedence)
const LOG_ENV: &str = "MESH_POOL_LOG";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let level = std::env::var(LOG_ENV).unwrap_or_else(|_| "warn".to_string());
    if let Err(e) = init_worker_logging(&level) {
        eprintln!("mesh-worker: {}", e);
    }

    match run_from_env().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker exiting");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
