//! Manager side of the pool protocol
//!
//! ```text
//! preconditions → spawn → hello → [merge] → scatter → gather → teardown
//!                   │                                              ▲
//!                   └──────────── any failure after spawn ─────────┘
//! ```
//!
//! Once a pool exists it is torn down exactly once, whatever happened in
//! between. Precondition failures are reported before anything is spawned.

use crate::errors::{ErrorKind, PoolError, Result};
use crate::executor::ledger::Phase;
use crate::executor::report::{JobOutput, JobReport};
use crate::executor::CombineOp;
use crate::group::{GroupMode, Launcher, ProcessGroup, SpawnRequest, WorkerExit};
use crate::matrix::Matrix;
use crate::network::Tag;
use crate::partition::{partition, Partition};
use futures::stream::{FuturesUnordered, TryStreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Size of the group the manager itself was started in
pub const WORLD_SIZE_ENV: &str = "MESH_POOL_WORLD_SIZE";

/// The group the manager process belongs to before spawning anything.
///
/// A manager must run alone; it is the single parent of its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmbientGroup {
    size: usize,
}

impl AmbientGroup {
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    /// Read the ambient group size from `MESH_POOL_WORLD_SIZE` (default 1)
    pub fn detect() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        match lookup(WORLD_SIZE_ENV) {
            None => Ok(Self::new(1)),
            Some(raw) => raw.trim().parse::<usize>().map(Self::new).map_err(|e| {
                PoolError::Precondition(format!("invalid {}={:?}: {}", WORLD_SIZE_ENV, raw, e))
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Default for AmbientGroup {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Manager tuning knobs
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub worker_count: usize,
    pub mode: GroupMode,
    pub op: CombineOp,
    /// Upper bound accepted for `worker_count`
    pub max_workers: usize,
    /// Bound on each send/receive; `None` waits forever
    pub exchange_timeout: Option<Duration>,
    /// How long teardown waits for workers before killing them
    pub teardown_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            mode: GroupMode::Disjoint,
            op: CombineOp::Add,
            max_workers: 256,
            exchange_timeout: None,
            teardown_grace: Duration::from_secs(5),
        }
    }
}

/// Runs jobs on freshly spawned worker pools
pub struct Manager {
    config: ManagerConfig,
    launcher: Arc<dyn Launcher>,
    ambient: AmbientGroup,
}

impl Manager {
    pub fn new(config: ManagerConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config,
            launcher,
            ambient: AmbientGroup::default(),
        }
    }

    pub fn with_ambient(mut self, ambient: AmbientGroup) -> Self {
        self.ambient = ambient;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn check_preconditions(&self, a: &Matrix, b: &Matrix) -> Result<()> {
        if self.ambient.size() != 1 {
            return Err(PoolError::Precondition(format!(
                "manager must run alone, ambient group has {} members",
                self.ambient.size()
            )));
        }
        let n = self.config.worker_count;
        if n == 0 {
            return Err(PoolError::Precondition(
                "worker count must be at least 1".into(),
            ));
        }
        if n > self.config.max_workers {
            return Err(PoolError::Precondition(format!(
                "worker count {} exceeds the maximum of {}",
                n, self.config.max_workers
            )));
        }
        a.validate()?;
        b.validate()?;
        a.ensure_same_shape(b)
    }

    /// Combine `a` and `b` elementwise on a new worker pool.
    ///
    /// The pool is spawned for this call and gone when it returns.
    #[instrument(skip_all, fields(workers = self.config.worker_count, mode = %self.config.mode))]
    pub async fn run(&self, a: &Matrix, b: &Matrix) -> Result<JobOutput> {
        self.check_preconditions(a, b)?;

        let (rows, cols) = a.shape();
        let job_id = Uuid::new_v4();
        let mut report = JobReport::new(job_id, self.config.mode, self.config.worker_count, rows, cols);
        info!(%job_id, rows, cols, op = %self.config.op, "Starting job");

        let started = Instant::now();
        let request = SpawnRequest {
            job_id,
            worker_count: self.config.worker_count,
            mode: self.config.mode,
            exchange_timeout: self.config.exchange_timeout,
        };
        let mut group = self.launcher.spawn(&request).await?;
        report.timings.spawn = started.elapsed();

        let outcome = self.execute(&mut group, a, b, &mut report).await;

        let started = Instant::now();
        let teardown = group.teardown(self.config.teardown_grace).await;
        report.timings.teardown = started.elapsed();
        debug!(
            %job_id,
            unreachable = ?teardown.unreachable,
            exits = teardown.exits.len(),
            "Pool released"
        );

        match outcome {
            Ok(output) => {
                report.log_summary();
                Ok(JobOutput { output, report })
            }
            Err(e) => {
                let e = blame_worker(e, &teardown.exits);
                error!(%job_id, kind = %e.kind(), error = %e, "Job failed");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        group: &mut ProcessGroup,
        a: &Matrix,
        b: &Matrix,
        report: &mut JobReport,
    ) -> Result<Matrix> {
        let n = self.config.worker_count;
        if group.remote_size() != n {
            return Err(PoolError::GroupSize {
                expected: n,
                actual: group.remote_size(),
            });
        }

        group.hello(report.job_id, self.config.op).await?;

        if self.config.mode == GroupMode::Merged {
            let started = Instant::now();
            let unified = group.merge().await?;
            debug!(rank = unified.rank(), size = unified.size(), "Merged");
            report.timings.merge = started.elapsed();
        }

        let (rows, cols) = a.shape();
        let partitions = partition(cols, n, rows);
        report.partitions = partitions.clone();

        let started = Instant::now();
        scatter(group, &partitions, a, b, report).await?;
        report.transfers.verify(Phase::Scatter)?;
        report.timings.scatter = started.elapsed();

        let started = Instant::now();
        let output = gather(group, &partitions, rows, cols, report).await?;
        report.transfers.verify(Phase::Gather)?;
        report.timings.gather = started.elapsed();

        Ok(output)
    }
}

/// A broken link to a worker that then exited with a failure status is
/// reported as that worker's failure.
fn blame_worker(err: PoolError, exits: &[WorkerExit]) -> PoolError {
    if err.kind() != ErrorKind::Transport {
        return err;
    }
    let failed = exits
        .iter()
        .find_map(|exit| exit.status.filter(|&s| s != 0).map(|s| (exit.worker, s)));
    match failed {
        Some((worker, status)) => {
            debug!(worker, status, transport_error = %err, "Attributing failure to worker");
            PoolError::WorkerExited { worker, status }
        }
        None => err,
    }
}

/// Send every worker its columns of both inputs, in worker order
async fn scatter(
    group: &mut ProcessGroup,
    partitions: &[Partition],
    a: &Matrix,
    b: &Matrix,
    report: &mut JobReport,
) -> Result<()> {
    let rows = a.shape().0;
    for (session, part) in group.sessions_mut().iter_mut().zip(partitions) {
        let count = part.element_count(rows);
        session.send_size(count).await?;
        session
            .send_payload(Tag::PayloadA, a.columns(part.column_offset, part.column_count))
            .await?;
        session
            .send_payload(Tag::PayloadB, b.columns(part.column_offset, part.column_count))
            .await?;
        report
            .transfers
            .record(Phase::Scatter, part.worker_index, count);
        debug!(worker = part.worker_index, elements = count, "Scattered");
    }
    Ok(())
}

/// Collect results in whatever order workers finish
async fn gather(
    group: &mut ProcessGroup,
    partitions: &[Partition],
    rows: usize,
    cols: usize,
    report: &mut JobReport,
) -> Result<Matrix> {
    let mut output = Matrix::zeros(rows, cols);
    let mut pending: FuturesUnordered<_> = group
        .sessions_mut()
        .iter_mut()
        .zip(partitions)
        .map(|(session, part)| async move {
            let data = session
                .receive_payload(Tag::Result, part.element_count(rows))
                .await?;
            Ok::<_, PoolError>((part, data))
        })
        .collect();

    while let Some((part, data)) = pending.try_next().await? {
        output.write_columns(part.column_offset, &data)?;
        report
            .transfers
            .record(Phase::Gather, part.worker_index, data.len());
        debug!(worker = part.worker_index, elements = data.len(), "Gathered");
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::TaskLauncher;

    fn manager(worker_count: usize) -> Manager {
        Manager::new(
            ManagerConfig {
                worker_count,
                max_workers: 8,
                ..ManagerConfig::default()
            },
            Arc::new(TaskLauncher::default()),
        )
    }

    #[test]
    fn test_ambient_group_detection() {
        assert_eq!(AmbientGroup::from_lookup(|_| None).unwrap().size(), 1);
        let two = AmbientGroup::from_lookup(|_| Some("2".into())).unwrap();
        assert_eq!(two.size(), 2);
        let err = AmbientGroup::from_lookup(|_| Some("many".into())).unwrap_err();
        assert!(matches!(err, PoolError::Precondition(_)));
    }

    #[test]
    fn test_preconditions() {
        let a = Matrix::filled(2, 3, 1.0);
        let b = Matrix::filled(2, 3, 1.0);
        assert!(manager(2).check_preconditions(&a, &b).is_ok());

        let err = manager(0).check_preconditions(&a, &b).unwrap_err();
        assert!(matches!(err, PoolError::Precondition(_)));

        let err = manager(9).check_preconditions(&a, &b).unwrap_err();
        assert!(matches!(err, PoolError::Precondition(_)));

        let err = manager(2)
            .with_ambient(AmbientGroup::new(3))
            .check_preconditions(&a, &b)
            .unwrap_err();
        assert!(err.to_string().contains("3 members"));

        let short = Matrix {
            rows: 2,
            cols: 3,
            data: vec![1.0; 5],
        };
        let err = manager(2).check_preconditions(&a, &short).unwrap_err();
        assert!(matches!(err, PoolError::Precondition(_)));

        let c = Matrix::filled(3, 2, 1.0);
        let err = manager(2).check_preconditions(&a, &c).unwrap_err();
        assert!(matches!(err, PoolError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_blame_worker() {
        let exits = vec![
            WorkerExit {
                worker: 0,
                status: Some(0),
            },
            WorkerExit {
                worker: 1,
                status: Some(1),
            },
        ];
        let eof = || {
            PoolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "eof",
            ))
        };

        let err = blame_worker(eof(), &exits);
        assert!(matches!(err, PoolError::WorkerExited { worker: 1, status: 1 }));
        assert_eq!(err.kind(), ErrorKind::WorkerSide);

        // Clean exits leave the transport error alone
        assert!(matches!(blame_worker(eof(), &exits[..1]), PoolError::Io(_)));

        // Only transport failures are attributed
        let err = blame_worker(PoolError::Merge("x".into()), &exits);
        assert!(matches!(err, PoolError::Merge(_)));
    }

    #[tokio::test]
    async fn test_run_small_job() {
        let a = Matrix::from_fn(2, 4, |r, c| (r * 4 + c) as f64);
        let b = Matrix::filled(2, 4, 0.5);
        let job = manager(3).run(&a, &b).await.unwrap();

        assert_eq!(job.output, a.combine(&b, CombineOp::Add).unwrap());
        let widths: Vec<usize> = job.report.partitions.iter().map(|p| p.column_count).collect();
        assert_eq!(widths, vec![2, 1, 1]);
        assert_eq!(job.report.transfers.total(Phase::Gather), 8);
    }

    #[tokio::test]
    async fn test_run_merged_with_op() {
        let a = Matrix::from_fn(3, 3, |r, c| (r + c) as f64);
        let b = Matrix::filled(3, 3, 2.0);
        let m = Manager::new(
            ManagerConfig {
                worker_count: 2,
                mode: GroupMode::Merged,
                op: CombineOp::Mul,
                ..ManagerConfig::default()
            },
            Arc::new(TaskLauncher::default()),
        );
        let job = m.run(&a, &b).await.unwrap();
        assert_eq!(job.output, a.combine(&b, CombineOp::Mul).unwrap());
        assert_eq!(job.report.mode, GroupMode::Merged);
    }
}
