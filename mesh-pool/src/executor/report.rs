//! Job report
//!
//! Everything the manager observed while running one job: the partition
//! plan, per-worker transfers and how long each phase took.

use crate::executor::ledger::{Phase, TransferLedger};
use crate::group::GroupMode;
use crate::matrix::Matrix;
use crate::partition::Partition;
use serde::Serialize;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Wall-clock time spent in each phase of a job
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseTimings {
    pub spawn: Duration,
    /// Zero for disjoint jobs
    pub merge: Duration,
    pub scatter: Duration,
    pub gather: Duration,
    pub teardown: Duration,
}

impl PhaseTimings {
    pub fn total(&self) -> Duration {
        self.spawn + self.merge + self.scatter + self.gather + self.teardown
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub mode: GroupMode,
    pub worker_count: usize,
    pub rows: usize,
    pub cols: usize,
    pub partitions: Vec<Partition>,
    pub transfers: TransferLedger,
    pub timings: PhaseTimings,
}

impl JobReport {
    pub fn new(job_id: Uuid, mode: GroupMode, worker_count: usize, rows: usize, cols: usize) -> Self {
        Self {
            job_id,
            mode,
            worker_count,
            rows,
            cols,
            partitions: Vec::new(),
            transfers: TransferLedger::new(rows * cols),
            timings: PhaseTimings::default(),
        }
    }

    /// Workers that were assigned no columns
    pub fn idle_workers(&self) -> usize {
        self.partitions.iter().filter(|p| p.is_empty()).count()
    }

    /// Log the report as a single structured event
    pub fn log_summary(&self) {
        let widths: Vec<usize> = self.partitions.iter().map(|p| p.column_count).collect();
        info!(
            job_id = %self.job_id,
            mode = %self.mode,
            workers = self.worker_count,
            shape = format!("{}x{}", self.rows, self.cols),
            widths = ?widths,
            idle_workers = self.idle_workers(),
            scattered_bytes = self.transfers.total_bytes(Phase::Scatter),
            gathered_bytes = self.transfers.total_bytes(Phase::Gather),
            spawn_ms = format!("{:.2}", ms(self.timings.spawn)),
            merge_ms = format!("{:.2}", ms(self.timings.merge)),
            scatter_ms = format!("{:.2}", ms(self.timings.scatter)),
            gather_ms = format!("{:.2}", ms(self.timings.gather)),
            teardown_ms = format!("{:.2}", ms(self.timings.teardown)),
            total_ms = format!("{:.2}", ms(self.timings.total())),
            "Job statistics"
        );
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Result of a successful job
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub output: Matrix,
    pub report: JobReport,
}
