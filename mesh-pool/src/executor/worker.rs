//! Worker side of the pool protocol
//!
//! A worker runs through a fixed sequence of states:
//!
//! ```text
//! Joining → Ready → Receiving → Computing → Sending → Leaving → Terminated
//! ```
//!
//! `Leaving` runs on every path, including failures while joining, so the
//! link is always released. A worker reports failure only through its exit
//! status (see [`WorkerError::exit_code`]).

use crate::errors::{PoolError, WorkerError};
use crate::executor::CombineOp;
use crate::group::{GroupMode, UnifiedGroup};
use crate::network::{
    is_disconnect, unexpected, BoxedLink, Message, Session, Tag, PROTOCOL_VERSION,
};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Address of the manager's listener, set by the process launcher
pub const PARENT_ENV: &str = "MESH_POOL_PARENT";
/// This worker's index in the pool, set by the process launcher
pub const INDEX_ENV: &str = "MESH_POOL_WORKER_INDEX";

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Joining,
    Ready,
    Receiving,
    Computing,
    Sending,
    Leaving,
    Terminated,
}

/// Job parameters received in `Hello`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobInfo {
    pub job_id: Uuid,
    pub worker_count: usize,
    pub mode: GroupMode,
    pub op: CombineOp,
}

/// What a worker did, returned on success
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSummary {
    pub worker_index: usize,
    pub job_id: Uuid,
    /// Unified rank, if the job merged the groups
    pub rank: Option<usize>,
    pub element_count: usize,
}

/// Parent link coordinates taken from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub addr: String,
    pub worker_index: usize,
}

impl ParentLink {
    /// Resolve the parent from `MESH_POOL_PARENT` / `MESH_POOL_WORKER_INDEX`
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WorkerError> {
        let addr = lookup(PARENT_ENV)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WorkerError::NoParent(format!("{} is not set", PARENT_ENV)))?;
        let worker_index = lookup(INDEX_ENV)
            .ok_or_else(|| WorkerError::NoParent(format!("{} is not set", INDEX_ENV)))?
            .parse::<usize>()
            .map_err(|e| WorkerError::NoParent(format!("invalid {}: {}", INDEX_ENV, e)))?;
        Ok(Self { addr, worker_index })
    }

    pub async fn connect(&self) -> Result<BoxedLink, WorkerError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| WorkerError::NoParent(format!("connect to {}: {}", self.addr, e)))?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

/// Resolve the parent link from the environment and run the worker
pub async fn run_from_env() -> Result<WorkerSummary, WorkerError> {
    let parent = ParentLink::from_env()?;
    let link = parent.connect().await?;
    WorkerRuntime::new(parent.worker_index, link).run().await
}

/// One worker's protocol runtime over an established link
pub struct WorkerRuntime {
    worker_index: usize,
    state: WorkerState,
    session: Session,
    job: Option<JobInfo>,
    unified: Option<UnifiedGroup>,
}

impl WorkerRuntime {
    pub fn new(worker_index: usize, link: BoxedLink) -> Self {
        Self {
            worker_index,
            state: WorkerState::Joining,
            session: Session::new(0, link),
            job: None,
            unified: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Job parameters, once `Hello` arrived
    pub fn job(&self) -> Option<&JobInfo> {
        self.job.as_ref()
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(worker = self.worker_index, from = ?self.state, to = ?next, "State change");
        self.state = next;
    }

    /// Run the worker to completion; always ends in `Terminated`
    #[instrument(skip(self), fields(worker = self.worker_index))]
    pub async fn run(mut self) -> Result<WorkerSummary, WorkerError> {
        let outcome = self.drive().await;
        self.leave(outcome.is_ok()).await;
        self.transition(WorkerState::Terminated);

        match &outcome {
            Ok(summary) => info!(
                elements = summary.element_count,
                rank = ?summary.rank,
                "Worker finished"
            ),
            Err(e) => warn!(error = %e, exit_code = e.exit_code(), "Worker failed"),
        }
        outcome
    }

    async fn drive(&mut self) -> Result<WorkerSummary, WorkerError> {
        let job = self.join().await?;
        self.transition(WorkerState::Ready);

        if job.mode == GroupMode::Merged {
            self.merge().await?;
        }

        self.transition(WorkerState::Receiving);
        let count = self.session.receive_size().await?;
        let a = self.session.receive_payload(Tag::PayloadA, count).await?;
        let b = self.session.receive_payload(Tag::PayloadB, count).await?;
        debug!(elements = count, "Partition received");

        self.transition(WorkerState::Computing);
        let result = job.op.apply(&a, &b);
        // Inputs are no longer needed once combined
        drop((a, b));

        self.transition(WorkerState::Sending);
        self.session.send_payload(Tag::Result, &result).await?;

        Ok(WorkerSummary {
            worker_index: self.worker_index,
            job_id: job.job_id,
            rank: self.unified.as_ref().map(UnifiedGroup::rank),
            element_count: count,
        })
    }

    async fn join(&mut self) -> Result<JobInfo, WorkerError> {
        self.session
            .send(
                Tag::Control,
                Message::Join {
                    worker_index: self.worker_index as u32,
                },
            )
            .await?;

        match self.session.receive(Tag::Control).await? {
            Message::Hello {
                job_id,
                version,
                parent_group_size,
                worker_count,
                mode,
                op,
            } => {
                if version != PROTOCOL_VERSION {
                    return Err(PoolError::Protocol(format!(
                        "Manager speaks protocol {}, worker speaks {}",
                        version, PROTOCOL_VERSION
                    ))
                    .into());
                }
                if parent_group_size != 1 {
                    return Err(WorkerError::BadParent(parent_group_size));
                }
                let job = JobInfo {
                    job_id,
                    worker_count: worker_count as usize,
                    mode,
                    op,
                };
                debug!(%job_id, workers = worker_count, %mode, %op, "Joined job");
                self.job = Some(job);
                Ok(job)
            }
            Message::Leave => {
                Err(PoolError::Protocol("Manager left before sending Hello".into()).into())
            }
            other => Err(unexpected(0, Tag::Control, &other).into()),
        }
    }

    /// Worker half of the collective merge
    async fn merge(&mut self) -> Result<(), WorkerError> {
        match self.session.receive(Tag::Control).await? {
            Message::MergeIntent => {}
            other => return Err(merge_violation(&other)),
        }
        self.session
            .send(
                Tag::Control,
                Message::MergeJoin {
                    worker_index: self.worker_index as u32,
                },
            )
            .await?;

        let (rank, size) = match self.session.receive(Tag::Control).await? {
            Message::MergeCommit { rank, size } => (rank, size),
            other => return Err(merge_violation(&other)),
        };
        if rank as usize != UnifiedGroup::rank_of_worker(self.worker_index) || rank >= size {
            return Err(PoolError::Merge(format!(
                "assigned rank {} of {} does not fit worker {}",
                rank, size, self.worker_index
            ))
            .into());
        }

        self.session
            .send(Tag::Control, Message::MergeAck { rank })
            .await?;
        self.unified = Some(UnifiedGroup::new(rank as usize, size as usize));
        debug!(rank, size, "Merged into unified group");
        Ok(())
    }

    /// Release the parent link; never fails
    async fn leave(&mut self, wait_for_manager: bool) {
        self.transition(WorkerState::Leaving);

        if wait_for_manager {
            // The manager disconnects collectively at teardown
            match self.session.receive(Tag::Control).await {
                Ok(Message::Leave) => {}
                Ok(other) => warn!(message = other.name(), "Expected Leave"),
                Err(e) if is_disconnect(&e) => debug!("Manager closed the link"),
                Err(e) => warn!(error = %e, "Error while waiting for Leave"),
            }
        }

        if let Some(unified) = self.unified.as_mut() {
            unified.free();
        }
        if let Err(e) = self.session.close().await {
            debug!(error = %e, "Error closing parent link");
        }
    }
}

fn merge_violation(message: &Message) -> WorkerError {
    PoolError::Merge(format!("unexpected {} during merge", message.name())).into()
}
