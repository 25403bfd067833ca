use medsync_core::CheckpointPosition;
use medsync_portal::PortalError;
use medsync_storage::StorageError;
use thiserror::Error;

/// Repository failure during reconciliation, tagged with the operation that hit it.
#[derive(Debug, Error)]
#[error("{context}")]
pub struct ReconcileError {
    pub context: String,
    #[source]
    pub source: StorageError,
}

impl ReconcileError {
    pub fn new(context: impl Into<String>, source: StorageError) -> Self {
        Self {
            context: context.into(),
            source,
        }
    }
}

pub(crate) trait ReconcileContext<T> {
    fn reconcile_context<F, S>(self, context: F) -> Result<T, ReconcileError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ReconcileContext<T> for Result<T, StorageError> {
    fn reconcile_context<F, S>(self, context: F) -> Result<T, ReconcileError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| ReconcileError::new(context(), source))
    }
}

/// Why a single traversal step failed.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

#[derive(Debug, Error)]
#[error("traversal failed at {position}: {source}")]
pub struct TraversalError {
    pub position: CheckpointPosition,
    #[source]
    pub source: StepError,
}

impl TraversalError {
    pub fn new(position: CheckpointPosition, source: impl Into<StepError>) -> Self {
        Self {
            position,
            source: source.into(),
        }
    }

    /// Portal hiccups are retried from the failing position; repository failures end the run.
    pub fn is_retryable(&self) -> bool {
        matches!(self.source, StepError::Portal(_))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("portal session failed: {0}")]
    Session(#[from] PortalError),
    #[error(transparent)]
    Traversal(#[from] TraversalError),
    #[error("giving up at {position} after {attempts} consecutive failures")]
    RetriesExhausted {
        position: CheckpointPosition,
        attempts: u32,
        #[source]
        source: TraversalError,
    },
    #[error("preparing sync run: {0:#}")]
    Setup(anyhow::Error),
    #[error("writing run report: {0:#}")]
    Report(anyhow::Error),
}

impl SyncError {
    /// Position an operator should restart from, when the run got far enough to have one.
    pub fn failed_position(&self) -> Option<CheckpointPosition> {
        match self {
            SyncError::Traversal(err) => Some(err.position),
            SyncError::RetriesExhausted { position, .. } => Some(*position),
            SyncError::Session(_) | SyncError::Setup(_) | SyncError::Report(_) => None,
        }
    }
}
