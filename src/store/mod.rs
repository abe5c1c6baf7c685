//! Transactional document-store interface.
//!
//! The engine never mutates state through independent read-then-write: every
//! mutation is a [`Commit`] carrying the versions its reads were made at, and
//! the store applies it all-or-nothing. A version mismatch means another
//! writer got there first; callers retry against fresh state.

use async_trait::async_trait;

use crate::model::{Campaign, CampaignId, LedgerEntry, Referral, UserAccount, UserId};

mod memory;
pub use memory::MemoryStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Monotonic per-document version used for optimistic concurrency.
pub type Version = u64;

/// A document together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: Version,
    pub value: T,
}

/// Errors from the document store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An optimistic precondition failed: a document changed (or appeared)
    /// after it was read. Retryable against fresh state.
    #[error("write conflict on {key}")]
    Conflict { key: String },

    /// A keyed create hit an existing record. Not retryable.
    #[error("already exists: {key}")]
    AlreadyExists { key: String },

    /// The backend is unreachable or failing.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Balance write paired with the ledger entries that document it.
#[derive(Debug, Clone)]
pub struct UserWrite {
    pub id: UserId,
    /// Version the account was read at. `None` creates the document and
    /// conflicts if it appeared concurrently.
    pub expected: Option<Version>,
    pub account: UserAccount,
    pub ledger: Vec<LedgerEntry>,
}

/// Campaign write with the same versioning rules as [`UserWrite`].
#[derive(Debug, Clone)]
pub struct CampaignWrite {
    pub id: CampaignId,
    pub expected: Option<Version>,
    pub campaign: Campaign,
}

/// One atomic multi-document write: either every piece applies or none does.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub users: Vec<UserWrite>,
    pub campaigns: Vec<CampaignWrite>,
    /// Referral records to create. A duplicate `(inviter, invitee)` pair fails
    /// the whole commit with [`StoreError::AlreadyExists`].
    pub referrals: Vec<Referral>,
    /// External payment event ids to mark processed. Duplicates fail with
    /// [`StoreError::AlreadyExists`].
    pub events: Vec<String>,
}

/// Interface the engine uses to persist accounts, ledgers, campaigns and
/// referral records.
///
/// `commit` must be atomic with respect to concurrent commits: all
/// precondition checks against current state, then all writes, with nothing
/// interleaved in between.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get_user(&self, id: &UserId) -> Result<Option<Versioned<UserAccount>>>;

    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Versioned<Campaign>>>;

    /// Ledger entries for an account, oldest first.
    async fn user_ledger(&self, id: &UserId) -> Result<Vec<LedgerEntry>>;

    async fn referral_exists(&self, inviter: &UserId, invitee: &UserId) -> Result<bool>;

    /// Number of referral records with this inviter.
    async fn referral_count(&self, inviter: &UserId) -> Result<usize>;

    async fn event_processed(&self, event_id: &str) -> Result<bool>;

    /// All known account ids, for scheduled bulk jobs.
    async fn list_users(&self) -> Result<Vec<UserId>>;

    async fn commit(&self, commit: Commit) -> Result<()>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    async fn get_user(&self, id: &UserId) -> Result<Option<Versioned<UserAccount>>> {
        (**self).get_user(id).await
    }

    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Versioned<Campaign>>> {
        (**self).get_campaign(id).await
    }

    async fn user_ledger(&self, id: &UserId) -> Result<Vec<LedgerEntry>> {
        (**self).user_ledger(id).await
    }

    async fn referral_exists(&self, inviter: &UserId, invitee: &UserId) -> Result<bool> {
        (**self).referral_exists(inviter, invitee).await
    }

    async fn referral_count(&self, inviter: &UserId) -> Result<usize> {
        (**self).referral_count(inviter).await
    }

    async fn event_processed(&self, event_id: &str) -> Result<bool> {
        (**self).event_processed(event_id).await
    }

    async fn list_users(&self) -> Result<Vec<UserId>> {
        (**self).list_users().await
    }

    async fn commit(&self, commit: Commit) -> Result<()> {
        (**self).commit(commit).await
    }
}
