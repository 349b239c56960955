//! Stage-level error taxonomy and its mapping onto the task runtime.

use std::time::Duration;
use thiserror::Error;

use crate::kernel::tasks::TaskFailure;
use crate::kernel::traits::ProviderError;

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Upstream stage output not available yet. The task is deferred, not
    /// failed.
    #[error("dependency not ready: {0}")]
    DependencyMissing(String),

    /// The session reached a terminal state; the task short-circuits.
    #[error("session cancelled")]
    Cancelled,

    /// Store or storage hiccup; retried like a transient provider failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StageError {
    /// Translate into the task runtime's retry vocabulary.
    pub fn into_task_failure(self, defer_interval: Duration) -> TaskFailure {
        match self {
            StageError::Provider(ProviderError::Transient(m)) => TaskFailure::transient(m),
            StageError::Provider(ProviderError::RateLimited(m)) => TaskFailure::rate_limited(m),
            StageError::Provider(ProviderError::Permanent(m)) => TaskFailure::permanent(m),
            // Circuit open: worth retrying once the cooldown passes.
            StageError::Provider(ProviderError::Unavailable(m)) => TaskFailure::transient(m),
            StageError::DependencyMissing(m) => TaskFailure::deferred(defer_interval, m),
            StageError::Cancelled => TaskFailure::Cancelled,
            StageError::Internal(e) => TaskFailure::transient(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tasks::TaskErrorKind;

    #[test]
    fn provider_classification_maps_to_retry_policy() {
        let failure = StageError::Provider(ProviderError::RateLimited("429".into()))
            .into_task_failure(Duration::from_secs(1));
        assert!(matches!(
            failure,
            TaskFailure::Retryable {
                kind: TaskErrorKind::RateLimited,
                ..
            }
        ));

        let failure = StageError::Provider(ProviderError::Permanent("400".into()))
            .into_task_failure(Duration::from_secs(1));
        assert!(matches!(failure, TaskFailure::Permanent { .. }));
    }

    #[test]
    fn dependency_missing_defers() {
        let failure = StageError::DependencyMissing("translate not complete".into())
            .into_task_failure(Duration::from_secs(2));
        assert!(matches!(failure, TaskFailure::Deferred { .. }));
    }
}
