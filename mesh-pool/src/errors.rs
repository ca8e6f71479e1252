use thiserror::Error;

/// Coarse classification of a job failure, reported alongside the message so
/// callers can tell environmental faults apart from logic defects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad arguments or environment, detected before anything was spawned
    Precondition,
    /// Spawning the pool or reshaping the process group failed
    Spawn,
    /// A send or receive failed, or a peer violated the message protocol
    Transport,
    /// Transfer accounting does not add up (a partitioning bug)
    Consistency,
    /// A worker exited on its own fatal path
    WorkerSide,
    /// Configuration could not be loaded or is invalid
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Precondition => "precondition",
            ErrorKind::Spawn => "spawn",
            ErrorKind::Transport => "transport",
            ErrorKind::Consistency => "consistency",
            ErrorKind::WorkerSide => "worker",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while running a pool job.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Invalid job arguments (worker count, ambient group size, ...)
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Input matrices do not share a shape
    #[error("Dimension mismatch: {a_rows}x{a_cols} vs {b_rows}x{b_cols}")]
    DimensionMismatch {
        a_rows: usize,
        a_cols: usize,
        b_rows: usize,
        b_cols: usize,
    },

    /// The launch facility could not start the pool
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// The spawned group does not have the requested size
    #[error("Remote group size mismatch: expected {expected}, got {actual}")]
    GroupSize { expected: usize, actual: usize },

    /// The collective merge did not complete
    #[error("Merge error: {0}")]
    Merge(String),

    /// IO error on a worker link
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer sent something the protocol does not allow at this point
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A blocking exchange exceeded the configured timeout
    #[error("Timed out after {0:?} waiting on worker {1}")]
    Timeout(std::time::Duration, usize),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Accumulated transfer counts do not match the matrix size
    #[error("Internal consistency error in {phase}: expected {expected} elements, accounted {actual}")]
    Consistency {
        phase: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A worker terminated with a non-zero status
    #[error("Worker {worker} exited with status {status}")]
    WorkerExited { worker: usize, status: i32 },

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// Classify this error for reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Precondition(_) | PoolError::DimensionMismatch { .. } => {
                ErrorKind::Precondition
            }
            PoolError::Spawn(_) | PoolError::GroupSize { .. } | PoolError::Merge(_) => {
                ErrorKind::Spawn
            }
            PoolError::Io(_)
            | PoolError::Protocol(_)
            | PoolError::Timeout(..)
            | PoolError::Serialization(_) => ErrorKind::Transport,
            PoolError::Consistency { .. } => ErrorKind::Consistency,
            PoolError::WorkerExited { .. } => ErrorKind::WorkerSide,
            PoolError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

impl From<toml::ser::Error> for PoolError {
    fn from(e: toml::ser::Error) -> Self {
        PoolError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for PoolError {
    fn from(e: toml::de::Error) -> Self {
        PoolError::Config(e.to_string())
    }
}

/// Fatal conditions on the worker side of the protocol.
///
/// Workers have no structured way to report these to the manager; the
/// process exit code is the only signal.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("No parent link: {0}")]
    NoParent(String),

    #[error("Parent group has {0} members, expected exactly 1")]
    BadParent(u32),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl WorkerError {
    pub const EXIT_FAILURE: i32 = 1;
    pub const EXIT_NO_PARENT: i32 = 2;
    pub const EXIT_BAD_PARENT: i32 = 3;

    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::NoParent(_) => Self::EXIT_NO_PARENT,
            WorkerError::BadParent(_) => Self::EXIT_BAD_PARENT,
            WorkerError::Pool(_) => Self::EXIT_FAILURE,
        }
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        WorkerError::Pool(PoolError::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PoolError::Config("workers must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: workers must be at least 1"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let pool_err: PoolError = io_err.into();
        assert!(pool_err.to_string().contains("IO error"));
        assert_eq!(pool_err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_consistency_is_distinct_kind() {
        let err = PoolError::Consistency {
            phase: "scatter",
            expected: 8,
            actual: 7,
        };
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_ne!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("scatter"));
    }

    #[test]
    fn test_kind_classification() {
        let mismatch = PoolError::DimensionMismatch {
            a_rows: 2,
            a_cols: 4,
            b_rows: 4,
            b_cols: 2,
        };
        assert_eq!(mismatch.kind(), ErrorKind::Precondition);
        assert_eq!(
            PoolError::GroupSize {
                expected: 3,
                actual: 2
            }
            .kind(),
            ErrorKind::Spawn
        );
        assert_eq!(PoolError::Merge("x".into()).kind(), ErrorKind::Spawn);
        assert_eq!(
            PoolError::WorkerExited {
                worker: 0,
                status: 2
            }
            .kind(),
            ErrorKind::WorkerSide
        );
    }

    #[test]
    fn test_worker_exit_codes() {
        assert_eq!(WorkerError::NoParent("unset".into()).exit_code(), 2);
        assert_eq!(WorkerError::BadParent(2).exit_code(), 3);
        let err: WorkerError = PoolError::Protocol("bad".into()).into();
        assert_eq!(err.exit_code(), 1);
    }
}
