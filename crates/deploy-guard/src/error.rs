//! Error taxonomy for the deployment safety engine.

use thiserror::Error;

use crate::executor::ActionType;

/// Errors surfaced by the engine's components.
#[derive(Debug, Error)]
pub enum GuardError {
    /// One or more critical safeguard checks failed
    #[error("Deployment blocked by failed critical checks: {}", reasons.join(", "))]
    DeploymentBlocked { reasons: Vec<String> },

    /// A single remediation action failed or timed out
    #[error("Remediation action {action} failed: {cause:#}")]
    ActionFailed {
        action: ActionType,
        #[source]
        cause: anyhow::Error,
    },

    /// Rollback issued but the deployment never reached steady state
    #[error("Rollback of {deployment} did not reach steady state after {attempts} status checks")]
    RollbackTimeout { deployment: String, attempts: u32 },

    /// Rollback could not be issued or failed verification
    #[error("Rollback of {deployment} failed: {reason}")]
    RollbackFailed { deployment: String, reason: String },

    /// No revision in history satisfies the stability predicate
    #[error("No stable revision available for {deployment}; operator intervention required")]
    NoStableRevision { deployment: String },

    /// Actions completed but the target still breaches its recovery criteria
    #[error("Recovery of {target} from {incident} not verified: {detail}")]
    RecoveryNotVerified {
        target: String,
        incident: String,
        detail: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A collaborator call failed and the failure is not recoverable locally
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl GuardError {
    /// Whether this failure should page an operator rather than wait for the next cycle.
    #[must_use]
    pub fn requires_escalation(&self) -> bool {
        matches!(
            self,
            Self::RollbackTimeout { .. } | Self::RollbackFailed { .. } | Self::NoStableRevision { .. }
        )
    }

    /// Process exit code used by the CLI.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DeploymentBlocked { .. } => 2,
            Self::RollbackTimeout { .. }
            | Self::RollbackFailed { .. }
            | Self::NoStableRevision { .. } => 3,
            _ => 1,
        }
    }
}

/// A bounded status poll exhausted its attempts.
#[derive(Debug, Error)]
#[error("{operation} did not complete after {attempts} attempts")]
pub struct PollTimeout {
    pub operation: String,
    pub attempts: u32,
}

/// Convenience alias for engine results.
pub type Result<T, E = GuardError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_message_lists_reasons() {
        let err = GuardError::DeploymentBlocked {
            reasons: vec!["backup-status".to_string(), "cluster-health".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Deployment blocked by failed critical checks: backup-status, cluster-health"
        );
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_rollback_errors_escalate() {
        let err = GuardError::NoStableRevision {
            deployment: "prod/api".to_string(),
        };
        assert!(err.requires_escalation());
        assert_eq!(err.exit_code(), 3);

        let err = GuardError::Config("bad".to_string());
        assert!(!err.requires_escalation());
    }

    #[test]
    fn test_action_failed_keeps_cause() {
        let err = GuardError::ActionFailed {
            action: ActionType::Restart,
            cause: anyhow::Error::new(PollTimeout {
                operation: "restart api".to_string(),
                attempts: 3,
            }),
        };
        assert!(err.to_string().contains("did not complete after 3 attempts"));
        let GuardError::ActionFailed { cause, .. } = err else {
            panic!("expected ActionFailed");
        };
        assert!(cause.downcast_ref::<PollTimeout>().is_some());
    }
}
