//! Error types for engine operations.

use thiserror::Error;

use crate::model::{CampaignId, UserId};
use crate::store::StoreError;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("account {0} not found")]
    AccountNotFound(UserId),

    #[error("account {0} is already registered")]
    AlreadyRegistered(UserId),

    #[error("insufficient points for {user}: have {have}, need {need}")]
    InsufficientBalance { user: UserId, have: u64, need: u64 },

    #[error("users cannot invite themselves")]
    SelfInvite,

    #[error("{invitee} was already invited by {inviter}")]
    AlreadyInvited { inviter: UserId, invitee: UserId },

    #[error("campaign {0} not found")]
    CampaignNotFound(CampaignId),

    #[error("campaign {0} is closed")]
    CampaignClosed(CampaignId),

    #[error("{helper} already helped campaign {campaign}")]
    AlreadyHelped {
        campaign: CampaignId,
        helper: UserId,
    },

    #[error("operation lost the race after retries; try again")]
    TransactionConflict,

    #[error("store failure: {0}")]
    Upstream(String),
}

impl EngineError {
    /// Conflicts are worth retrying against fresh state; everything else is
    /// settled.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransactionConflict)
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => EngineError::TransactionConflict,
            // Operations that create keyed records (referrals, payment events)
            // map AlreadyExists themselves; one reaching this fallback means a
            // uniqueness guard tripped where none was expected.
            StoreError::AlreadyExists { key } => {
                EngineError::Upstream(format!("unexpected duplicate: {key}"))
            }
            StoreError::Unavailable(reason) => EngineError::Upstream(reason),
        }
    }
}
