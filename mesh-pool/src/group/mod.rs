//! Process groups: the manager plus the workers it spawned
//!
//! A freshly spawned pool is *disjoint*: the manager reaches each worker over
//! its own link and the workers form a separate group. A job may request a
//! one-way *merge* into a single unified group where the manager holds rank 0
//! and worker `i` holds rank `i + 1`.
//!
//! The merge is a collective rendezvous in three rounds over the control tag:
//!
//! ```text
//! manager                         worker i
//!   ── MergeIntent ──────────────▶
//!   ◀───────────── MergeJoin{i} ──        (all workers, before commit)
//!   ── MergeCommit{i+1, N+1} ─────▶
//!   ◀───────────── MergeAck{i+1} ─        (all workers, before returning)
//! ```
//!
//! No commit is sent until every worker has joined, and the manager does not
//! return until every worker acknowledged, so the group is formed for all
//! participants or for none.

pub mod launcher;

pub use launcher::{
    Launcher, PoolHandle, ProcessLauncher, SpawnRequest, TaskLauncher, WorkerExit,
};

use crate::errors::{PoolError, Result};
use crate::network::{unexpected, Message, Session, Tag};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shape of the process group for a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    /// Manager and workers stay in separate groups joined by per-worker links
    #[default]
    Disjoint,
    /// Manager and workers merge into one group, manager at rank 0
    Merged,
}

impl std::fmt::Display for GroupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupMode::Disjoint => f.write_str("disjoint"),
            GroupMode::Merged => f.write_str("merged"),
        }
    }
}

/// Membership in a merged group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedGroup {
    rank: usize,
    size: usize,
    freed: bool,
}

impl UnifiedGroup {
    pub fn new(rank: usize, size: usize) -> Self {
        Self {
            rank,
            size,
            freed: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Unified rank held by worker `worker_index`
    pub fn rank_of_worker(worker_index: usize) -> usize {
        worker_index + 1
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }

    /// Release the membership; idempotent
    pub fn free(&mut self) {
        if !self.freed {
            debug!(rank = self.rank, size = self.size, "Freeing unified group");
            self.freed = true;
        }
    }
}

/// What teardown observed
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Workers that could not be sent `Leave`
    pub unreachable: Vec<usize>,
    pub exits: Vec<WorkerExit>,
}

/// The manager's view of a spawned pool
pub struct ProcessGroup {
    mode: GroupMode,
    sessions: Vec<Session>,
    handle: Box<dyn PoolHandle>,
    unified: Option<UnifiedGroup>,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("mode", &self.mode)
            .field("remote_size", &self.sessions.len())
            .field("unified", &self.unified)
            .finish_non_exhaustive()
    }
}

impl ProcessGroup {
    /// `sessions` must be ordered by worker index
    pub fn new(mode: GroupMode, sessions: Vec<Session>, handle: Box<dyn PoolHandle>) -> Self {
        Self {
            mode,
            sessions,
            handle,
            unified: None,
        }
    }

    pub fn mode(&self) -> GroupMode {
        self.mode
    }

    /// Number of workers that actually joined
    pub fn remote_size(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions_mut(&mut self) -> &mut [Session] {
        &mut self.sessions
    }

    pub fn unified(&self) -> Option<&UnifiedGroup> {
        self.unified.as_ref()
    }

    /// Replace the pool handle, keeping everything else
    pub fn map_handle(
        mut self,
        f: impl FnOnce(Box<dyn PoolHandle>) -> Box<dyn PoolHandle>,
    ) -> Self {
        self.handle = f(self.handle);
        self
    }

    /// Answer every worker's `Join` with the job description
    pub async fn hello(&mut self, job_id: Uuid, op: crate::executor::CombineOp) -> Result<()> {
        let worker_count = self.sessions.len() as u32;
        for session in &mut self.sessions {
            session
                .send(
                    Tag::Control,
                    Message::Hello {
                        job_id,
                        version: crate::network::PROTOCOL_VERSION,
                        parent_group_size: 1,
                        worker_count,
                        mode: self.mode,
                        op,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Merge manager and workers into one group (collective).
    ///
    /// Every worker must take part; any deviation fails the merge for all.
    pub async fn merge(&mut self) -> Result<&UnifiedGroup> {
        if self.unified.is_some() {
            return Err(PoolError::Merge("group is already merged".into()));
        }
        let size = self.sessions.len() + 1;

        for session in &mut self.sessions {
            let peer = session.peer();
            session
                .send(Tag::Control, Message::MergeIntent)
                .await
                .map_err(|e| merge_error(peer, e))?;
        }

        for session in &mut self.sessions {
            let peer = session.peer();
            match session.receive(Tag::Control).await {
                Ok(Message::MergeJoin { worker_index }) if worker_index as usize == peer => {}
                Ok(Message::MergeJoin { worker_index }) => {
                    return Err(PoolError::Merge(format!(
                        "worker {} joined the merge as {}",
                        peer, worker_index
                    )))
                }
                Ok(other) => return Err(merge_error(peer, unexpected(peer, Tag::Control, &other))),
                Err(e) => return Err(merge_error(peer, e)),
            }
        }
        debug!(workers = self.sessions.len(), "All workers joined merge");

        for session in &mut self.sessions {
            let peer = session.peer();
            let rank = UnifiedGroup::rank_of_worker(peer) as u32;
            session
                .send(
                    Tag::Control,
                    Message::MergeCommit {
                        rank,
                        size: size as u32,
                    },
                )
                .await
                .map_err(|e| merge_error(peer, e))?;
        }

        for session in &mut self.sessions {
            let peer = session.peer();
            let expected = UnifiedGroup::rank_of_worker(peer) as u32;
            match session.receive(Tag::Control).await {
                Ok(Message::MergeAck { rank }) if rank == expected => {}
                Ok(Message::MergeAck { rank }) => {
                    return Err(PoolError::Merge(format!(
                        "worker {} acknowledged rank {}, expected {}",
                        peer, rank, expected
                    )))
                }
                Ok(other) => return Err(merge_error(peer, unexpected(peer, Tag::Control, &other))),
                Err(e) => return Err(merge_error(peer, e)),
            }
        }

        info!(size, "Unified group formed, manager at rank 0");
        let unified = self.unified.insert(UnifiedGroup::new(0, size));
        Ok(&*unified)
    }

    /// Disconnect every worker and release the group.
    ///
    /// Best effort throughout: unreachable workers are recorded, stragglers
    /// are killed after `grace`.
    pub async fn teardown(mut self, grace: Duration) -> TeardownReport {
        let mut report = TeardownReport::default();

        for session in &mut self.sessions {
            let peer = session.peer();
            let leave = async {
                session.send(Tag::Control, Message::Leave).await?;
                session.close().await
            };
            match tokio::time::timeout(grace, leave).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(worker = peer, error = %e, "Could not send Leave");
                    report.unreachable.push(peer);
                }
                Err(_) => {
                    debug!(worker = peer, "Timed out sending Leave");
                    report.unreachable.push(peer);
                }
            }
        }

        if let Some(unified) = self.unified.as_mut() {
            unified.free();
        }

        report.exits = self.handle.disconnect(grace).await;
        for exit in report.exits.iter().filter(|e| !e.success()) {
            warn!(worker = exit.worker, status = ?exit.status, "Worker did not exit cleanly");
        }

        debug!(
            unreachable = report.unreachable.len(),
            exits = report.exits.len(),
            "Teardown complete"
        );
        report
    }
}

fn merge_error(peer: usize, err: PoolError) -> PoolError {
    match err {
        PoolError::Merge(_) => err,
        other => PoolError::Merge(format!("worker {}: {}", peer, other)),
    }
}
