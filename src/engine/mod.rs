//! Points ledger and campaign engine.
//!
//! The engine owns every balance mutation. Each operation is one atomic
//! read-compute-commit transaction against the injected store, pairing the
//! balance write with an immutable ledger entry. Referrals, campaign help and
//! webhook recharges are idempotent per their natural keys; commits that lose
//! a race are retried with backoff a bounded number of times.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{
    Campaign, CampaignId, CampaignStatus, CutScenario, EntryType, LedgerEntry, Referral,
    UserAccount, UserId,
};
use crate::policy::{PolicyError, RewardPolicy, level_for_invites};
use crate::store::{Commit, CampaignWrite, Store, StoreError, UserWrite, Version, Versioned};

mod error;
pub use error::EngineError;

/// Outcome of a balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceReceipt {
    pub new_balance: u64,
}

/// Outcome of a successful referral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferralReceipt {
    pub inviter_reward: u64,
    pub invitee_reward: u64,
}

/// Outcome of starting a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignReceipt {
    pub campaign_id: CampaignId,
    pub original_price: u64,
    pub target_price: u64,
}

/// Outcome of one help-cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutReceipt {
    pub scenario: CutScenario,
    pub new_price: u64,
    pub helper_reward: u64,
}

/// Outcome of a recharge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RechargeOutcome {
    Credited(BalanceReceipt),
    /// The payment event was already processed; nothing was written.
    Duplicate,
}

/// Backoff for optimistic commit retries. Contention on a single account or
/// campaign document resolves within a few attempts.
fn conflict_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(640))
        .with_max_times(8)
        .with_jitter()
}

/// The points ledger engine.
///
/// Holds the injected store, the policy table, and a seeded RNG so reward
/// draws are deterministic under test.
pub struct Engine<S> {
    store: S,
    policy: RewardPolicy,
    rng: Mutex<StdRng>,
}

/// Public API
impl<S: Store> Engine<S> {
    pub fn new(store: S, policy: RewardPolicy) -> Result<Self, PolicyError> {
        let rng = StdRng::from_rng(&mut rand::rng());
        Self::with_rng(store, policy, rng)
    }

    /// Construct with an explicit RNG. Tests seed it for determinism.
    pub fn with_rng(store: S, policy: RewardPolicy, rng: StdRng) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self {
            store,
            policy,
            rng: Mutex::new(rng),
        })
    }

    pub fn policy(&self) -> &RewardPolicy {
        &self.policy
    }

    /// Create an account and grant the one-time signup bonus.
    ///
    /// The bonus is only granted on the creating call: re-registration fails
    /// without touching the existing account.
    pub async fn register(
        &self,
        uid: &UserId,
        email: Option<String>,
    ) -> Result<UserAccount, EngineError> {
        let result = (|| async { self.try_register(uid, email.clone()).await })
            .retry(conflict_backoff())
            .when(EngineError::is_retryable)
            .await;
        log_outcome("register", uid, &result);
        result
    }

    /// Atomically adjust a balance and append the paired ledger entry.
    ///
    /// Credits lazily create the account; debits against a missing account
    /// fail with [`EngineError::AccountNotFound`], and debits that would drive
    /// the balance negative fail with [`EngineError::InsufficientBalance`]
    /// before anything is written.
    pub async fn adjust_balance(
        &self,
        uid: &UserId,
        delta: i64,
        entry_type: EntryType,
        remark: &str,
    ) -> Result<BalanceReceipt, EngineError> {
        let result = (|| async { self.try_adjust(uid, delta, entry_type, remark).await })
            .retry(conflict_backoff())
            .when(EngineError::is_retryable)
            .await;
        match &result {
            Ok(receipt) => info!(
                user = %uid,
                delta,
                kind = ?entry_type,
                balance = receipt.new_balance,
                "balance adjusted"
            ),
            Err(e) => log_failure("balance adjustment", uid, e),
        }
        result
    }

    /// Record a referral and reward both sides, all-or-nothing.
    pub async fn referral(
        &self,
        inviter: &UserId,
        invitee: &UserId,
    ) -> Result<ReferralReceipt, EngineError> {
        if inviter == invitee {
            return Err(EngineError::SelfInvite);
        }
        let result = (|| async { self.try_referral(inviter, invitee).await })
            .retry(conflict_backoff())
            .when(EngineError::is_retryable)
            .await;
        match &result {
            Ok(receipt) => info!(
                inviter = %inviter,
                invitee = %invitee,
                inviter_reward = receipt.inviter_reward,
                invitee_reward = receipt.invitee_reward,
                "referral recorded"
            ),
            Err(e) => log_failure("referral", inviter, e),
        }
        result
    }

    /// Start a price-cut campaign at `amount`, with the floor price computed
    /// from policy.
    pub async fn start_campaign(
        &self,
        creator: &UserId,
        amount: u64,
    ) -> Result<CampaignReceipt, EngineError> {
        let target_price = self.policy.target_price(amount);
        let campaign_id = Uuid::new_v4();
        let campaign = Campaign::new(creator.clone(), amount, target_price, Utc::now());
        self.store
            .commit(Commit {
                campaigns: vec![CampaignWrite {
                    id: campaign_id,
                    expected: None,
                    campaign,
                }],
                ..Commit::default()
            })
            .await?;
        info!(
            creator = %creator,
            campaign = %campaign_id,
            original = amount,
            target = target_price,
            "campaign started"
        );
        Ok(CampaignReceipt {
            campaign_id,
            original_price: amount,
            target_price,
        })
    }

    /// Apply one helper's cut to a campaign and credit the helper, in a
    /// single transaction with the duplicate-helper check.
    pub async fn help_cut(
        &self,
        campaign_id: &CampaignId,
        helper: &UserId,
    ) -> Result<CutReceipt, EngineError> {
        let result = (|| async { self.try_help_cut(campaign_id, helper).await })
            .retry(conflict_backoff())
            .when(EngineError::is_retryable)
            .await;
        match &result {
            Ok(receipt) => info!(
                campaign = %campaign_id,
                helper = %helper,
                scenario = ?receipt.scenario,
                new_price = receipt.new_price,
                "cut applied"
            ),
            Err(e) => log_failure("help cut", helper, e),
        }
        result
    }

    /// Debit points for using a feature.
    pub async fn consume(
        &self,
        uid: &UserId,
        cost: u64,
        feature: &str,
    ) -> Result<BalanceReceipt, EngineError> {
        let delta = -clamp_delta(cost);
        self.adjust_balance(uid, delta, EntryType::Consume, &format!("used {feature}"))
            .await
    }

    /// Credit purchased points from a payment-completion event.
    ///
    /// When an event id is present, re-delivery of the same id is
    /// acknowledged as [`RechargeOutcome::Duplicate`] with no writes.
    pub async fn recharge(
        &self,
        uid: &UserId,
        points: u64,
        event_id: Option<&str>,
    ) -> Result<RechargeOutcome, EngineError> {
        if let Some(id) = event_id {
            if self.store.event_processed(id).await? {
                info!(user = %uid, event = id, "payment event already processed");
                return Ok(RechargeOutcome::Duplicate);
            }
        }
        let result = (|| async { self.try_recharge(uid, points, event_id).await })
            .retry(conflict_backoff())
            .when(EngineError::is_retryable)
            .await;
        match &result {
            Ok(RechargeOutcome::Credited(receipt)) => {
                info!(user = %uid, points, balance = receipt.new_balance, "recharge credited")
            }
            Ok(RechargeOutcome::Duplicate) => {
                info!(user = %uid, "payment event already processed")
            }
            Err(e) => log_failure("recharge", uid, e),
        }
        result
    }

    /// Manual admin grant. The caller's admin role is enforced at the
    /// transport boundary before this is reached; the target account must
    /// already exist.
    pub async fn grant(&self, uid: &UserId, amount: u64) -> Result<BalanceReceipt, EngineError> {
        if self.store.get_user(uid).await?.is_none() {
            return Err(EngineError::AccountNotFound(uid.clone()));
        }
        self.adjust_balance(uid, clamp_delta(amount), EntryType::Reward, "manual admin grant")
            .await
    }

    /// Scheduled bulk credit: every account receives the daily bonus with a
    /// paired ledger entry. Per-account failures are logged and skipped.
    pub async fn daily_bonus(&self) -> Result<usize, EngineError> {
        let bonus = clamp_delta(self.policy.daily_bonus);
        let mut credited = 0;
        for uid in self.store.list_users().await? {
            match self
                .adjust_balance(&uid, bonus, EntryType::Reward, "daily bonus")
                .await
            {
                Ok(_) => credited += 1,
                Err(e) => warn!(user = %uid, reason = %e, "daily bonus skipped"),
            }
        }
        info!(credited, "daily bonus run complete");
        Ok(credited)
    }

    /// Scheduled level recompute from referral counts. Returns how many
    /// accounts changed level.
    pub async fn update_levels(&self) -> Result<usize, EngineError> {
        let mut changed = 0;
        for uid in self.store.list_users().await? {
            let invites = self.store.referral_count(&uid).await?;
            let level = level_for_invites(invites);
            let result = (|| async { self.try_set_level(&uid, level).await })
                .retry(conflict_backoff())
                .when(EngineError::is_retryable)
                .await;
            match result {
                Ok(true) => {
                    info!(user = %uid, level = ?level, invites, "level updated");
                    changed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(user = %uid, reason = %e, "level update skipped"),
            }
        }
        Ok(changed)
    }

    pub async fn account(&self, uid: &UserId) -> Result<UserAccount, EngineError> {
        Ok(self
            .store
            .get_user(uid)
            .await?
            .ok_or_else(|| EngineError::AccountNotFound(uid.clone()))?
            .value)
    }

    pub async fn ledger(&self, uid: &UserId) -> Result<Vec<LedgerEntry>, EngineError> {
        if self.store.get_user(uid).await?.is_none() {
            return Err(EngineError::AccountNotFound(uid.clone()));
        }
        Ok(self.store.user_ledger(uid).await?)
    }

    pub async fn campaign(&self, id: &CampaignId) -> Result<Campaign, EngineError> {
        Ok(self
            .store
            .get_campaign(id)
            .await?
            .ok_or(EngineError::CampaignNotFound(*id))?
            .value)
    }
}

/// Private API
impl<S: Store> Engine<S> {
    async fn load_or_new(
        &self,
        uid: &UserId,
        now: DateTime<Utc>,
    ) -> Result<(Option<Version>, UserAccount), EngineError> {
        Ok(match self.store.get_user(uid).await? {
            Some(versioned) => (Some(versioned.version), versioned.value),
            None => (None, UserAccount::new(now)),
        })
    }

    async fn try_register(
        &self,
        uid: &UserId,
        email: Option<String>,
    ) -> Result<UserAccount, EngineError> {
        if self.store.get_user(uid).await?.is_some() {
            return Err(EngineError::AlreadyRegistered(uid.clone()));
        }
        let now = Utc::now();
        let mut account = UserAccount::new(now);
        account.email = email;
        account.points = self.policy.signup_bonus;

        let ledger = if self.policy.signup_bonus > 0 {
            vec![LedgerEntry::new(
                EntryType::Reward,
                clamp_delta(self.policy.signup_bonus),
                "signup bonus",
                now,
            )]
        } else {
            Vec::new()
        };

        self.store
            .commit(Commit {
                users: vec![UserWrite {
                    id: uid.clone(),
                    expected: None,
                    account: account.clone(),
                    ledger,
                }],
                ..Commit::default()
            })
            .await?;
        Ok(account)
    }

    async fn try_adjust(
        &self,
        uid: &UserId,
        delta: i64,
        entry_type: EntryType,
        remark: &str,
    ) -> Result<BalanceReceipt, EngineError> {
        let now = Utc::now();
        let (expected, mut account) = match self.store.get_user(uid).await? {
            Some(versioned) => (Some(versioned.version), versioned.value),
            None if delta >= 0 => (None, UserAccount::new(now)),
            None => return Err(EngineError::AccountNotFound(uid.clone())),
        };

        let new_balance = apply_delta(uid, &account, delta)?;
        account.points = new_balance;

        self.store
            .commit(Commit {
                users: vec![UserWrite {
                    id: uid.clone(),
                    expected,
                    account,
                    ledger: vec![LedgerEntry::new(entry_type, delta, remark, now)],
                }],
                ..Commit::default()
            })
            .await?;
        Ok(BalanceReceipt { new_balance })
    }

    async fn try_referral(
        &self,
        inviter: &UserId,
        invitee: &UserId,
    ) -> Result<ReferralReceipt, EngineError> {
        if self.store.referral_exists(inviter, invitee).await? {
            return Err(EngineError::AlreadyInvited {
                inviter: inviter.clone(),
                invitee: invitee.clone(),
            });
        }

        let now = Utc::now();
        let (inviter_reward, invitee_reward) = {
            let mut rng = self.rng.lock().await;
            (
                self.policy.referral_inviter.draw(&mut *rng),
                self.policy.referral_invitee.draw(&mut *rng),
            )
        };

        let (inviter_expected, mut inviter_account) = self.load_or_new(inviter, now).await?;
        let (invitee_expected, mut invitee_account) = self.load_or_new(invitee, now).await?;
        inviter_account.points = inviter_account.points.saturating_add(inviter_reward);
        invitee_account.points = invitee_account.points.saturating_add(invitee_reward);
        invitee_account.invited_by = Some(inviter.clone());

        let commit = Commit {
            users: vec![
                UserWrite {
                    id: inviter.clone(),
                    expected: inviter_expected,
                    account: inviter_account,
                    ledger: vec![LedgerEntry::new(
                        EntryType::Reward,
                        clamp_delta(inviter_reward),
                        "referral reward",
                        now,
                    )],
                },
                UserWrite {
                    id: invitee.clone(),
                    expected: invitee_expected,
                    account: invitee_account,
                    ledger: vec![LedgerEntry::new(
                        EntryType::Reward,
                        clamp_delta(invitee_reward),
                        "referral welcome reward",
                        now,
                    )],
                },
            ],
            referrals: vec![Referral {
                inviter_id: inviter.clone(),
                invitee_id: invitee.clone(),
                inviter_reward,
                invitee_reward,
                created_at: now,
            }],
            ..Commit::default()
        };

        match self.store.commit(commit).await {
            Ok(()) => Ok(ReferralReceipt {
                inviter_reward,
                invitee_reward,
            }),
            // Another call recorded the same pair between our check and the
            // commit; the uniqueness guard makes that a duplicate, not a race
            // to retry.
            Err(StoreError::AlreadyExists { .. }) => Err(EngineError::AlreadyInvited {
                inviter: inviter.clone(),
                invitee: invitee.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_help_cut(
        &self,
        campaign_id: &CampaignId,
        helper: &UserId,
    ) -> Result<CutReceipt, EngineError> {
        let Versioned {
            version,
            value: mut campaign,
        } = self
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or(EngineError::CampaignNotFound(*campaign_id))?;

        if campaign.status == CampaignStatus::Closed {
            return Err(EngineError::CampaignClosed(*campaign_id));
        }
        if campaign.has_helper(helper) {
            return Err(EngineError::AlreadyHelped {
                campaign: *campaign_id,
                helper: helper.clone(),
            });
        }

        let now = Utc::now();
        let (scenario, cut) = {
            let mut rng = self.rng.lock().await;
            let rule = self.policy.pick_cut(&mut *rng);
            let cut = match rule.scenario {
                CutScenario::Free => campaign.current_price,
                _ => percent_of(campaign.original_price, rule.percent.draw(&mut *rng)),
            };
            (rule.scenario, cut)
        };

        // The floor is mandatory whatever the scenario drew.
        let new_price = campaign
            .current_price
            .saturating_sub(cut)
            .max(campaign.target_price);
        campaign.current_price = new_price;
        campaign.helpers.push(helper.clone());
        campaign.last_scenario = Some(scenario);
        if self.policy.close_at_floor && campaign.at_floor() {
            campaign.status = CampaignStatus::Closed;
        }

        let helper_reward = match scenario {
            CutScenario::Bonus => self.policy.bonus_helper_reward,
            _ => self.policy.helper_reward,
        };
        let (expected, mut helper_account) = self.load_or_new(helper, now).await?;
        helper_account.points = helper_account.points.saturating_add(helper_reward);

        self.store
            .commit(Commit {
                users: vec![UserWrite {
                    id: helper.clone(),
                    expected,
                    account: helper_account,
                    ledger: vec![LedgerEntry::new(
                        EntryType::Reward,
                        clamp_delta(helper_reward),
                        "price-cut help",
                        now,
                    )],
                }],
                campaigns: vec![CampaignWrite {
                    id: *campaign_id,
                    expected: Some(version),
                    campaign,
                }],
                ..Commit::default()
            })
            .await?;

        Ok(CutReceipt {
            scenario,
            new_price,
            helper_reward,
        })
    }

    async fn try_recharge(
        &self,
        uid: &UserId,
        points: u64,
        event_id: Option<&str>,
    ) -> Result<RechargeOutcome, EngineError> {
        let now = Utc::now();
        let (expected, mut account) = self.load_or_new(uid, now).await?;
        account.points = account.points.saturating_add(points);
        let new_balance = account.points;

        let commit = Commit {
            users: vec![UserWrite {
                id: uid.clone(),
                expected,
                account,
                ledger: vec![LedgerEntry::new(
                    EntryType::Recharge,
                    clamp_delta(points),
                    "points recharge",
                    now,
                )],
            }],
            events: event_id.map(String::from).into_iter().collect(),
            ..Commit::default()
        };

        match self.store.commit(commit).await {
            Ok(()) => Ok(RechargeOutcome::Credited(BalanceReceipt { new_balance })),
            Err(StoreError::AlreadyExists { .. }) => Ok(RechargeOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_set_level(
        &self,
        uid: &UserId,
        level: crate::model::Level,
    ) -> Result<bool, EngineError> {
        let Some(Versioned {
            version,
            value: mut account,
        }) = self.store.get_user(uid).await?
        else {
            return Ok(false);
        };
        if account.level == level {
            return Ok(false);
        }
        account.level = level;
        self.store
            .commit(Commit {
                users: vec![UserWrite {
                    id: uid.clone(),
                    expected: Some(version),
                    account,
                    ledger: Vec::new(),
                }],
                ..Commit::default()
            })
            .await?;
        Ok(true)
    }
}

/// Compute the post-delta balance, rejecting debits that would go negative.
fn apply_delta(uid: &UserId, account: &UserAccount, delta: i64) -> Result<u64, EngineError> {
    if delta >= 0 {
        Ok(account.points.saturating_add(delta as u64))
    } else {
        let need = delta.unsigned_abs();
        account
            .points
            .checked_sub(need)
            .ok_or_else(|| EngineError::InsufficientBalance {
                user: uid.clone(),
                have: account.points,
                need,
            })
    }
}

fn percent_of(base: u64, percent: u64) -> u64 {
    (base as u128 * percent as u128 / 100) as u64
}

/// Ledger amounts are signed; clamp unsigned policy values into range.
fn clamp_delta(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

fn log_outcome<T>(op: &str, user: &UserId, result: &Result<T, EngineError>) {
    match result {
        Ok(_) => info!(user = %user, "{op} applied"),
        Err(e) => log_failure(op, user, e),
    }
}

fn log_failure(op: &str, user: &UserId, err: &EngineError) {
    match err {
        EngineError::TransactionConflict | EngineError::Upstream(_) => {
            warn!(user = %user, reason = %err, "{op} failed")
        }
        _ => info!(user = %user, reason = %err, "{op} rejected"),
    }
}
