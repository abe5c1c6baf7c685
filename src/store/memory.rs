//! In-memory document store with optimistic versioning.
//!
//! Commits are serialized behind a single lock, which gives the linearizable
//! per-document read-modify-write the engine relies on. Fault hooks let tests
//! exercise the conflict-retry and outage paths.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Commit, Result, Store, StoreError, Version, Versioned};
use crate::model::{Campaign, CampaignId, LedgerEntry, Referral, UserAccount, UserId};

#[derive(Debug, Clone)]
struct UserDoc {
    version: Version,
    account: UserAccount,
    ledger: Vec<LedgerEntry>,
}

#[derive(Debug, Clone)]
struct CampaignDoc {
    version: Version,
    campaign: Campaign,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, UserDoc>,
    campaigns: HashMap<CampaignId, CampaignDoc>,
    referrals: HashMap<(UserId, UserId), Referral>,
    events: HashSet<String>,
}

#[derive(Default)]
struct Faults {
    conflicts: u32,
    unavailable: bool,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    faults: RwLock<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a write conflict.
    pub async fn inject_conflicts(&self, n: u32) {
        self.faults.write().await.conflicts = n;
    }

    /// Make every store operation fail as unreachable until reset.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.faults.write().await.unavailable = unavailable;
    }

    async fn check_available(&self) -> Result<()> {
        if self.faults.read().await.unavailable {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, id: &UserId) -> Result<Option<Versioned<UserAccount>>> {
        self.check_available().await?;
        Ok(self.inner.read().await.users.get(id).map(|doc| Versioned {
            version: doc.version,
            value: doc.account.clone(),
        }))
    }

    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Versioned<Campaign>>> {
        self.check_available().await?;
        Ok(self
            .inner
            .read()
            .await
            .campaigns
            .get(id)
            .map(|doc| Versioned {
                version: doc.version,
                value: doc.campaign.clone(),
            }))
    }

    async fn user_ledger(&self, id: &UserId) -> Result<Vec<LedgerEntry>> {
        self.check_available().await?;
        Ok(self
            .inner
            .read()
            .await
            .users
            .get(id)
            .map(|doc| doc.ledger.clone())
            .unwrap_or_default())
    }

    async fn referral_exists(&self, inviter: &UserId, invitee: &UserId) -> Result<bool> {
        self.check_available().await?;
        Ok(self
            .inner
            .read()
            .await
            .referrals
            .contains_key(&(inviter.clone(), invitee.clone())))
    }

    async fn referral_count(&self, inviter: &UserId) -> Result<usize> {
        self.check_available().await?;
        Ok(self
            .inner
            .read()
            .await
            .referrals
            .keys()
            .filter(|(i, _)| i == inviter)
            .count())
    }

    async fn event_processed(&self, event_id: &str) -> Result<bool> {
        self.check_available().await?;
        Ok(self.inner.read().await.events.contains(event_id))
    }

    async fn list_users(&self) -> Result<Vec<UserId>> {
        self.check_available().await?;
        let mut ids: Vec<UserId> = self.inner.read().await.users.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn commit(&self, commit: Commit) -> Result<()> {
        {
            let mut faults = self.faults.write().await;
            if faults.unavailable {
                return Err(StoreError::Unavailable("injected outage".to_string()));
            }
            if faults.conflicts > 0 {
                faults.conflicts -= 1;
                return Err(StoreError::Conflict {
                    key: "injected".to_string(),
                });
            }
        }

        let mut inner = self.inner.write().await;

        // Check every precondition before touching anything.
        for write in &commit.users {
            let current = inner.users.get(&write.id).map(|doc| doc.version);
            if current != write.expected {
                return Err(StoreError::Conflict {
                    key: format!("users/{}", write.id),
                });
            }
        }
        for write in &commit.campaigns {
            let current = inner.campaigns.get(&write.id).map(|doc| doc.version);
            if current != write.expected {
                return Err(StoreError::Conflict {
                    key: format!("campaigns/{}", write.id),
                });
            }
        }
        for referral in &commit.referrals {
            let key = (referral.inviter_id.clone(), referral.invitee_id.clone());
            if inner.referrals.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    key: format!("referrals/{}:{}", key.0, key.1),
                });
            }
        }
        for event in &commit.events {
            if inner.events.contains(event) {
                return Err(StoreError::AlreadyExists {
                    key: format!("events/{event}"),
                });
            }
        }

        for write in commit.users {
            match inner.users.entry(write.id) {
                Entry::Occupied(mut occupied) => {
                    let doc = occupied.get_mut();
                    doc.version += 1;
                    doc.account = write.account;
                    doc.ledger.extend(write.ledger);
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(UserDoc {
                        version: 1,
                        account: write.account,
                        ledger: write.ledger,
                    });
                }
            }
        }
        for write in commit.campaigns {
            match inner.campaigns.entry(write.id) {
                Entry::Occupied(mut occupied) => {
                    let doc = occupied.get_mut();
                    doc.version += 1;
                    doc.campaign = write.campaign;
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(CampaignDoc {
                        version: 1,
                        campaign: write.campaign,
                    });
                }
            }
        }
        for referral in commit.referrals {
            let key = (referral.inviter_id.clone(), referral.invitee_id.clone());
            inner.referrals.insert(key, referral);
        }
        for event in commit.events {
            inner.events.insert(event);
        }

        Ok(())
    }
}
