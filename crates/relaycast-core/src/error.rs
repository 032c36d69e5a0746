//! Dispatch engine errors

use relaycast_common::types::CampaignId;
use relaycast_storage::CampaignStatus;
use thiserror::Error;

/// Errors surfaced by the dispatch engine's exposed operations
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No server of a required kind is available; never retried
    #[error("Configuration fault: {0}")]
    ConfigurationFault(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    #[error("Invalid campaign transition from {from} to {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] relaycast_common::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl DispatchError {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::ConfigurationFault(_) => "CONFIGURATION_FAULT",
            DispatchError::CampaignNotFound(_) => "CAMPAIGN_NOT_FOUND",
            DispatchError::InvalidTransition { .. } => "INVALID_TRANSITION",
            DispatchError::Storage(e) => e.code(),
            DispatchError::Scheduler(_) => "SCHEDULER_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_message() {
        let err = DispatchError::InvalidTransition {
            from: CampaignStatus::Completed,
            to: CampaignStatus::InProgress,
        };
        assert_eq!(
            err.to_string(),
            "Invalid campaign transition from completed to in_progress"
        );
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[test]
    fn test_storage_code_passthrough() {
        let err: DispatchError = relaycast_common::Error::Database("down".into()).into();
        assert_eq!(err.code(), "DATABASE_ERROR");
    }
}
