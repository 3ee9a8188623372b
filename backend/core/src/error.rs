use thiserror::Error;

/// Top-level error type for the Flowline runtime.
#[derive(Debug, Error)]
pub enum FlowlineError {
    /// The caller supplied a bad spec. Returned synchronously, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Recipient computation failed against a collaborator. The start stays
    /// pending so a retry driver can re-attempt.
    #[error("resolution failed while {operation}: {message}")]
    Resolution { operation: String, message: String },

    /// Lost a race to claim a fire, schedule or start. Expected under
    /// concurrency; callers skip rather than report.
    #[error("lost claim race for {0}")]
    ClaimConflict(String),

    /// Per-contact flow entry failure from the external engine.
    #[error("flow engine error: {0}")]
    Engine(String),

    /// A named advisory lock is held by another process. Skip the tick.
    #[error("advisory lock '{0}' held elsewhere")]
    LockUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowlineError {
    /// Wrap a collaborator failure with the name of the resolution step.
    pub fn resolution(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::Resolution {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_claim_conflict(&self) -> bool {
        matches!(self, Self::ClaimConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_wrapping() {
        let err = FlowlineError::resolution("resolving query", "index unreachable");
        assert_eq!(
            err.to_string(),
            "resolution failed while resolving query: index unreachable"
        );
    }

    #[test]
    fn test_claim_conflict_detection() {
        assert!(FlowlineError::ClaimConflict("start 3".into()).is_claim_conflict());
        assert!(!FlowlineError::Validation("no recipients".into()).is_claim_conflict());
    }
}
