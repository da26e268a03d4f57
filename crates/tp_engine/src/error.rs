//! Structured submission-rejection reasons (spec §7, [ADDED] per SPEC_FULL
//! §7 — grounded on the teacher workspace's `vc_ecs::entity::error`, which
//! derives `thiserror` enums for its own "operation rejected" cases).

use thiserror::Error;

/// Why [`Pool::submit`](crate::Pool::submit) rejected a submission.
///
/// `Pool::submit` still returns `Option<TaskPromise>` per spec §4.4.1 (a
/// null promise on rejection); this is the reason logged alongside it, for
/// callers that want more than a bare `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SubmitError {
    /// The pool was constructed or started with zero workers.
    #[error("pool has no workers")]
    NoWorkers,
    /// `desc.specifyWorkerId` named a worker outside `[0, numWorkers)`.
    #[error("worker id {0} is out of range")]
    InvalidWorkerId(u32),
    /// Every eligible worker's queue was at capacity.
    #[error("no worker has queue capacity")]
    QueueFull,
    /// A dependency was already `Cancelled`; the new task is cancelled
    /// instead of being enqueued.
    #[error("dependency was cancelled")]
    DependencyCancelled,
}
