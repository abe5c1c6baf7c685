//! Core domain types for the points ledger and campaign engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User identifier, issued by the external identity provider.
pub type UserId = String;

/// Campaign identifier.
pub type CampaignId = Uuid;

/// Account role claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// Loyalty level, derived from how many users an account has invited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    Starter,
    Bronze,
    Silver,
    Gold,
    Diamond,
}

/// A user account with its point balance.
///
/// `points` is unsigned: no mutation may drive a balance negative, and debits
/// are checked inside the transaction that applies them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub points: u64,
    pub level: Level,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invited_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserAccount {
    /// Create a fresh account with a zero balance and default claims.
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            points: 0,
            level: Level::default(),
            role: Role::default(),
            invited_by: None,
            email: None,
            created_at,
        }
    }
}

/// Kind of balance mutation a ledger entry documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Reward,
    Consume,
    Recharge,
}

/// Immutable record of one balance mutation.
///
/// `amount` is the exact signed delta applied to the owning account's balance
/// in the same transaction that created the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub amount: i64,
    pub remark: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        entry_type: EntryType,
        amount: i64,
        remark: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_type,
            amount,
            remark: remark.into(),
            created_at,
        }
    }
}

/// Campaign lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Active,
    Closed,
}

/// Outcome category of one help-cut, selected by weighted draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CutScenario {
    SmallCut,
    BigCut,
    Free,
    Bonus,
}

/// A price-cut campaign.
///
/// `current_price` starts at `original_price`, never increases, and never
/// drops below `target_price`. Each distinct helper appears in `helpers` at
/// most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub creator: UserId,
    pub original_price: u64,
    pub target_price: u64,
    pub current_price: u64,
    pub helpers: Vec<UserId>,
    pub status: CampaignStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scenario: Option<CutScenario>,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    /// Create an active campaign with no helpers yet.
    pub fn new(
        creator: UserId,
        original_price: u64,
        target_price: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            creator,
            original_price,
            target_price,
            current_price: original_price,
            helpers: Vec::new(),
            status: CampaignStatus::Active,
            last_scenario: None,
            created_at,
        }
    }

    pub fn has_helper(&self, user: &UserId) -> bool {
        self.helpers.iter().any(|h| h == user)
    }

    pub fn at_floor(&self) -> bool {
        self.current_price == self.target_price
    }
}

/// Record of one successful referral. Unique per `(inviter, invitee)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Referral {
    pub inviter_id: UserId,
    pub invitee_id: UserId,
    pub inviter_reward: u64,
    pub invitee_reward: u64,
    pub created_at: DateTime<Utc>,
}
