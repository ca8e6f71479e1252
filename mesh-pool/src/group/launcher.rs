//! Launch facilities for worker pools
//!
//! A launcher starts `worker_count` workers, waits for each to `Join` over
//! its own link and hands back a [`ProcessGroup`] with one session per
//! worker, ordered by worker index. The launcher does not judge the result:
//! if fewer workers join than requested, the group simply reports a smaller
//! remote size and the manager decides what to do about it.

use super::{GroupMode, ProcessGroup};
use crate::errors::{PoolError, Result};
use crate::executor::worker::{WorkerRuntime, INDEX_ENV, PARENT_ENV};
use crate::executor::WORLD_SIZE_ENV;
use crate::network::{read_frame, Link, Message, Session, Tag};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time allowed for all spawned workers to join
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// What the manager asks a launcher for
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub job_id: Uuid,
    pub worker_count: usize,
    pub mode: GroupMode,
    /// Applied to every session of the new group
    pub exchange_timeout: Option<Duration>,
}

/// How a worker ended, as seen at teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker: usize,
    /// Exit status; `None` if the worker was killed or its status is unknown
    pub status: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Ownership of the spawned workers themselves (processes, tasks)
#[async_trait]
pub trait PoolHandle: Send {
    /// Wait for every worker to finish, killing those still running after
    /// `grace`. Called exactly once per pool.
    async fn disconnect(&mut self, grace: Duration) -> Vec<WorkerExit>;
}

/// Process-launch facility
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> Result<ProcessGroup>;
}

/// Read the `Join` a worker sends first on a fresh link
async fn read_join<L: Link>(link: &mut L, limit: Duration) -> Result<usize> {
    let frame = tokio::time::timeout(limit, read_frame(link))
        .await
        .map_err(|_| PoolError::Spawn("worker connected but never sent Join".into()))??;
    match frame.message {
        Message::Join { worker_index } if frame.tag == Tag::Control => Ok(worker_index as usize),
        other => Err(PoolError::Protocol(format!(
            "Expected Join on {:?}, got {} on {:?}",
            Tag::Control,
            other.name(),
            frame.tag
        ))),
    }
}

/// Launches workers as native OS processes.
///
/// The manager listens on a loopback port and passes its address to each
/// worker through the environment; workers connect back and identify
/// themselves with `Join`.
pub struct ProcessLauncher {
    worker_exe: PathBuf,
    join_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(worker_exe: impl Into<PathBuf>) -> Self {
        Self {
            worker_exe: worker_exe.into(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    pub fn worker_exe(&self) -> &Path {
        &self.worker_exe
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn spawn(&self, request: &SpawnRequest) -> Result<ProcessGroup> {
        let n = request.worker_count;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| PoolError::Spawn(format!("Failed to bind parent listener: {}", e)))?;
        let addr = listener.local_addr()?;

        let mut handle = ProcessHandle {
            children: Vec::with_capacity(n),
        };
        for worker in 0..n {
            let spawned = Command::new(&self.worker_exe)
                .env(PARENT_ENV, addr.to_string())
                .env(INDEX_ENV, worker.to_string())
                .env_remove(WORLD_SIZE_ENV)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn();
            match spawned {
                Ok(child) => handle.children.push((worker, child)),
                Err(e) => {
                    // Don't leave the ones already started behind
                    handle.kill_all().await;
                    return Err(PoolError::Spawn(format!(
                        "Failed to launch {} for worker {}: {}",
                        self.worker_exe.display(),
                        worker,
                        e
                    )));
                }
            }
        }
        debug!(job_id = %request.job_id, workers = n, %addr, "Workers launched, waiting for joins");

        let mut slots: Vec<Option<Session>> = (0..n).map(|_| None).collect();
        let mut joined = 0;
        let deadline = Instant::now() + self.join_timeout;
        while joined < n {
            let (mut stream, peer_addr) =
                match tokio::time::timeout_at(deadline, listener.accept()).await {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Accept failed");
                        break;
                    }
                    Err(_) => {
                        warn!(joined, expected = n, "Timed out waiting for workers to join");
                        break;
                    }
                };
            let _ = stream.set_nodelay(true);

            let remaining = deadline.saturating_duration_since(Instant::now());
            match read_join(&mut stream, remaining).await {
                Ok(index) if index < n && slots[index].is_none() => {
                    debug!(worker = index, %peer_addr, "Worker joined");
                    slots[index] = Some(
                        Session::new(index, Box::new(stream))
                            .with_timeout(request.exchange_timeout),
                    );
                    joined += 1;
                }
                Ok(index) => warn!(worker = index, "Ignoring invalid or duplicate join"),
                Err(e) => warn!(%peer_addr, error = %e, "Connection did not join"),
            }
        }

        let sessions: Vec<Session> = slots.into_iter().flatten().collect();
        info!(job_id = %request.job_id, joined = sessions.len(), requested = n, "Process pool spawned");
        Ok(ProcessGroup::new(request.mode, sessions, Box::new(handle)))
    }
}

struct ProcessHandle {
    children: Vec<(usize, Child)>,
}

impl ProcessHandle {
    async fn kill_all(&mut self) {
        for (worker, child) in &mut self.children {
            if let Err(e) = child.kill().await {
                debug!(worker = *worker, error = %e, "Kill failed");
            }
        }
        self.children.clear();
    }
}

#[async_trait]
impl PoolHandle for ProcessHandle {
    async fn disconnect(&mut self, grace: Duration) -> Vec<WorkerExit> {
        let deadline = Instant::now() + grace;
        let mut exits = Vec::with_capacity(self.children.len());
        for (worker, child) in &mut self.children {
            let status = match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                Ok(Err(e)) => {
                    warn!(worker = *worker, error = %e, "Failed to wait for worker");
                    None
                }
                Err(_) => {
                    warn!(worker = *worker, "Worker still running after grace period, killing");
                    if let Err(e) = child.kill().await {
                        debug!(worker = *worker, error = %e, "Kill failed");
                    }
                    None
                }
            };
            exits.push(WorkerExit {
                worker: *worker,
                status,
            });
        }
        self.children.clear();
        exits
    }
}

/// Runs workers as tokio tasks in this process, linked by in-memory pipes.
///
/// Same protocol and worker runtime as the process launcher, without the
/// process boundary. Useful for embedding and for tests.
pub struct TaskLauncher {
    buffer_size: usize,
}

impl TaskLauncher {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

impl Default for TaskLauncher {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

#[async_trait]
impl Launcher for TaskLauncher {
    async fn spawn(&self, request: &SpawnRequest) -> Result<ProcessGroup> {
        let n = request.worker_count;
        let mut handle = TaskHandle {
            tasks: Vec::with_capacity(n),
        };
        let mut sessions = Vec::with_capacity(n);

        for worker in 0..n {
            let (mut manager_end, worker_end) = tokio::io::duplex(self.buffer_size);
            let runtime = WorkerRuntime::new(worker, Box::new(worker_end));
            handle.tasks.push((worker, tokio::spawn(runtime.run())));

            let joined = match read_join(&mut manager_end, DEFAULT_JOIN_TIMEOUT).await {
                Ok(index) if index == worker => Ok(()),
                Ok(index) => Err(PoolError::Protocol(format!(
                    "Worker {} joined as {}",
                    worker, index
                ))),
                Err(e) => Err(e),
            };
            if let Err(e) = joined {
                handle.abort_all();
                return Err(e);
            }
            sessions.push(
                Session::new(worker, Box::new(manager_end)).with_timeout(request.exchange_timeout),
            );
        }

        debug!(job_id = %request.job_id, workers = n, "Task pool spawned");
        Ok(ProcessGroup::new(request.mode, sessions, Box::new(handle)))
    }
}

type WorkerTask = JoinHandle<std::result::Result<crate::executor::WorkerSummary, crate::errors::WorkerError>>;

struct TaskHandle {
    tasks: Vec<(usize, WorkerTask)>,
}

impl TaskHandle {
    fn abort_all(&mut self) {
        for (_, task) in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl PoolHandle for TaskHandle {
    async fn disconnect(&mut self, grace: Duration) -> Vec<WorkerExit> {
        let deadline = Instant::now() + grace;
        let mut exits = Vec::with_capacity(self.tasks.len());
        for (worker, mut task) in self.tasks.drain(..) {
            let status = match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(Ok(_))) => Some(0),
                Ok(Ok(Err(e))) => {
                    debug!(worker, error = %e, "Worker task failed");
                    Some(e.exit_code())
                }
                Ok(Err(e)) => {
                    warn!(worker, error = %e, "Worker task panicked or was cancelled");
                    None
                }
                Err(_) => {
                    warn!(worker, "Worker task still running after grace period, aborting");
                    task.abort();
                    None
                }
            };
            exits.push(WorkerExit { worker, status });
        }
        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{write_frame, Frame};

    fn request(worker_count: usize) -> SpawnRequest {
        SpawnRequest {
            job_id: Uuid::new_v4(),
            worker_count,
            mode: GroupMode::Disjoint,
            exchange_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_read_join() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(
            &mut b,
            &Frame::new(Tag::Control, Message::Join { worker_index: 4 }),
        )
        .await
        .unwrap();
        assert_eq!(read_join(&mut a, Duration::from_secs(1)).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_read_join_rejects_other_messages() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut b, &Frame::new(Tag::Control, Message::Leave))
            .await
            .unwrap();
        let err = read_join(&mut a, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, PoolError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_join_times_out() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let err = read_join(&mut a, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_task_launcher_spawns_requested_size() {
        let group = TaskLauncher::default().spawn(&request(3)).await.unwrap();
        assert_eq!(group.remote_size(), 3);
        let report = group.teardown(Duration::from_secs(5)).await;
        assert_eq!(report.exits.len(), 3);
        // Workers were told to leave before Hello, which they treat as failure
        assert!(report.exits.iter().all(|e| e.status.is_some()));
    }

    #[tokio::test]
    async fn test_process_launcher_missing_executable() {
        let launcher = ProcessLauncher::new("/nonexistent/mesh-worker")
            .with_join_timeout(Duration::from_millis(100));
        let err = launcher.spawn(&request(2)).await.unwrap_err();
        assert!(matches!(err, PoolError::Spawn(_)));
    }

    #[test]
    fn test_worker_exit_success() {
        assert!(WorkerExit {
            worker: 0,
            status: Some(0)
        }
        .success());
        assert!(!WorkerExit {
            worker: 0,
            status: None
        }
        .success());
    }
}
