//! Reward policy: every tunable number in the engine lives here.
//!
//! The table is deserializable so deployments can swap reward ranges and cut
//! weights without a rebuild. Defaults match the production growth handlers.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{CutScenario, Level};

/// Inclusive integer range a reward or cut percentage is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRange {
    pub min: u64,
    pub max: u64,
}

impl RewardRange {
    pub const fn fixed(value: u64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn draw(&self, rng: &mut impl Rng) -> u64 {
        if self.min >= self.max {
            return self.min;
        }
        rng.random_range(self.min..=self.max)
    }
}

/// One row of the cut table: a scenario, its selection weight, and the
/// percentage of the original price it removes.
///
/// `percent` is ignored for [`CutScenario::Free`], which removes the entire
/// remaining price (the clamp against the floor still applies).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CutRule {
    pub scenario: CutScenario,
    pub weight: u32,
    pub percent: RewardRange,
}

/// Errors loading or validating a policy table.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse policy file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cut table must not be empty")]
    EmptyCutTable,

    #[error("cut table weights must not all be zero")]
    ZeroWeights,

    #[error("range min {min} exceeds max {max}")]
    InvertedRange { min: u64, max: u64 },

    #[error("floor percent {0} exceeds 100")]
    FloorPercentTooLarge(u64),
}

/// The full reward policy table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RewardPolicy {
    /// One-time credit on registration.
    pub signup_bonus: u64,
    /// Reward range for the inviting side of a referral.
    pub referral_inviter: RewardRange,
    /// Reward range for the invited side of a referral.
    pub referral_invitee: RewardRange,
    /// Scheduled bulk credit per account.
    pub daily_bonus: u64,
    /// Credit for helping a campaign.
    pub helper_reward: u64,
    /// Credit for helping a campaign when the bonus scenario lands.
    pub bonus_helper_reward: u64,
    /// Campaign floor price as a percent of the original price.
    pub floor_percent: u64,
    /// Absolute minimum floor price.
    pub floor_min: u64,
    /// Close a campaign in the same commit that reaches its floor. Off by
    /// default: further cuts clamp to zero change.
    pub close_at_floor: bool,
    pub cut_table: Vec<CutRule>,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            signup_bonus: 100,
            referral_inviter: RewardRange { min: 80, max: 200 },
            referral_invitee: RewardRange { min: 120, max: 260 },
            daily_bonus: 10,
            helper_reward: 10,
            bonus_helper_reward: 30,
            floor_percent: 15,
            floor_min: 5,
            close_at_floor: false,
            cut_table: vec![
                CutRule {
                    scenario: CutScenario::SmallCut,
                    weight: 60,
                    percent: RewardRange { min: 2, max: 6 },
                },
                CutRule {
                    scenario: CutScenario::BigCut,
                    weight: 25,
                    percent: RewardRange { min: 8, max: 15 },
                },
                CutRule {
                    scenario: CutScenario::Free,
                    weight: 5,
                    percent: RewardRange::fixed(0),
                },
                CutRule {
                    scenario: CutScenario::Bonus,
                    weight: 10,
                    percent: RewardRange { min: 4, max: 9 },
                },
            ],
        }
    }
}

impl RewardPolicy {
    /// Load a policy from a JSON file. Missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let file = File::open(path)?;
        let policy: Self = serde_json::from_reader(BufReader::new(file))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Check the table is usable: a non-empty cut table with at least one
    /// positive weight, well-ordered ranges, and a sane floor percent.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.cut_table.is_empty() {
            return Err(PolicyError::EmptyCutTable);
        }
        if self.cut_table.iter().all(|r| r.weight == 0) {
            return Err(PolicyError::ZeroWeights);
        }
        for range in [self.referral_inviter, self.referral_invitee]
            .iter()
            .chain(self.cut_table.iter().map(|r| &r.percent))
        {
            if range.min > range.max {
                return Err(PolicyError::InvertedRange {
                    min: range.min,
                    max: range.max,
                });
            }
        }
        if self.floor_percent > 100 {
            return Err(PolicyError::FloorPercentTooLarge(self.floor_percent));
        }
        Ok(())
    }

    /// Floor price for a campaign: `floor_percent` of the original, at least
    /// `floor_min`, and never above the original itself.
    pub fn target_price(&self, original_price: u64) -> u64 {
        let scaled = (original_price as u128 * self.floor_percent as u128 / 100) as u64;
        scaled.max(self.floor_min).min(original_price)
    }

    /// Select a cut scenario by weighted draw.
    ///
    /// Draws a uniform value in `[0, total_weight)` and walks the table in
    /// order, so the selection is a total function: integer weights cannot
    /// drift, and a zero-weight row is never chosen while any other row has
    /// weight. Returns the first row if the walk somehow falls through.
    pub fn pick_cut(&self, rng: &mut impl Rng) -> &CutRule {
        let total: u32 = self.cut_table.iter().map(|r| r.weight).sum();
        if total == 0 {
            return &self.cut_table[0];
        }
        let mut draw = rng.random_range(0..total);
        for rule in &self.cut_table {
            if draw < rule.weight {
                return rule;
            }
            draw -= rule.weight;
        }
        &self.cut_table[0]
    }
}

/// Level ladder by invite count.
pub fn level_for_invites(invites: usize) -> Level {
    if invites >= 100 {
        Level::Diamond
    } else if invites >= 30 {
        Level::Gold
    } else if invites >= 10 {
        Level::Silver
    } else if invites >= 3 {
        Level::Bronze
    } else {
        Level::Starter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::Write;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn default_policy_is_valid() {
        RewardPolicy::default().validate().expect("default policy");
    }

    #[test]
    fn target_price_applies_percent_floor() {
        let policy = RewardPolicy::default();
        assert_eq!(policy.target_price(100), 15);
        assert_eq!(policy.target_price(1000), 150);
    }

    #[test]
    fn target_price_respects_absolute_minimum() {
        let policy = RewardPolicy::default();
        // 15% of 10 is 1, below the absolute minimum of 5.
        assert_eq!(policy.target_price(10), 5);
    }

    #[test]
    fn target_price_never_exceeds_original() {
        let policy = RewardPolicy::default();
        assert_eq!(policy.target_price(3), 3);
        assert_eq!(policy.target_price(0), 0);
    }

    #[test]
    fn draw_fixed_range_is_constant() {
        let range = RewardRange::fixed(42);
        assert_eq!(range.draw(&mut rng()), 42);
    }

    #[test]
    fn draw_stays_within_bounds() {
        let range = RewardRange { min: 80, max: 200 };
        let mut rng = rng();
        for _ in 0..1000 {
            let value = range.draw(&mut rng);
            assert!((80..=200).contains(&value), "out of range: {value}");
        }
    }

    #[test]
    fn pick_cut_single_row_always_selected() {
        let policy = RewardPolicy {
            cut_table: vec![CutRule {
                scenario: CutScenario::Free,
                weight: 1,
                percent: RewardRange::fixed(0),
            }],
            ..RewardPolicy::default()
        };
        let mut rng = rng();
        for _ in 0..100 {
            assert_eq!(policy.pick_cut(&mut rng).scenario, CutScenario::Free);
        }
    }

    #[test]
    fn pick_cut_skips_zero_weight_rows() {
        let policy = RewardPolicy {
            cut_table: vec![
                CutRule {
                    scenario: CutScenario::SmallCut,
                    weight: 0,
                    percent: RewardRange::fixed(5),
                },
                CutRule {
                    scenario: CutScenario::BigCut,
                    weight: 1,
                    percent: RewardRange::fixed(10),
                },
            ],
            ..RewardPolicy::default()
        };
        let mut rng = rng();
        for _ in 0..100 {
            assert_eq!(policy.pick_cut(&mut rng).scenario, CutScenario::BigCut);
        }
    }

    #[test]
    fn pick_cut_all_zero_weights_falls_back_to_first() {
        let policy = RewardPolicy {
            cut_table: vec![
                CutRule {
                    scenario: CutScenario::SmallCut,
                    weight: 0,
                    percent: RewardRange::fixed(5),
                },
                CutRule {
                    scenario: CutScenario::Bonus,
                    weight: 0,
                    percent: RewardRange::fixed(5),
                },
            ],
            ..RewardPolicy::default()
        };
        assert_eq!(policy.pick_cut(&mut rng()).scenario, CutScenario::SmallCut);
    }

    #[test]
    fn pick_cut_reaches_every_default_scenario() {
        let policy = RewardPolicy::default();
        let mut rng = rng();
        let mut seen = [false; 4];
        for _ in 0..10_000 {
            match policy.pick_cut(&mut rng).scenario {
                CutScenario::SmallCut => seen[0] = true,
                CutScenario::BigCut => seen[1] = true,
                CutScenario::Free => seen[2] = true,
                CutScenario::Bonus => seen[3] = true,
            }
        }
        assert_eq!(seen, [true; 4]);
    }

    #[test]
    fn level_ladder_thresholds() {
        assert_eq!(level_for_invites(0), Level::Starter);
        assert_eq!(level_for_invites(2), Level::Starter);
        assert_eq!(level_for_invites(3), Level::Bronze);
        assert_eq!(level_for_invites(10), Level::Silver);
        assert_eq!(level_for_invites(30), Level::Gold);
        assert_eq!(level_for_invites(99), Level::Gold);
        assert_eq!(level_for_invites(100), Level::Diamond);
    }

    #[test]
    fn validate_rejects_empty_cut_table() {
        let policy = RewardPolicy {
            cut_table: Vec::new(),
            ..RewardPolicy::default()
        };
        assert!(matches!(policy.validate(), Err(PolicyError::EmptyCutTable)));
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let policy = RewardPolicy {
            referral_inviter: RewardRange { min: 200, max: 80 },
            ..RewardPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::InvertedRange { min: 200, max: 80 })
        ));
    }

    #[test]
    fn from_file_overrides_subset_of_fields() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"signupBonus": 50, "dailyBonus": 3}}"#).expect("write");

        let policy = RewardPolicy::from_file(file.path()).expect("load");
        assert_eq!(policy.signup_bonus, 50);
        assert_eq!(policy.daily_bonus, 3);
        // untouched fields keep defaults
        assert_eq!(policy.helper_reward, 10);
        assert_eq!(policy.cut_table.len(), 4);
    }

    #[test]
    fn from_file_rejects_invalid_table() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"cutTable": []}}"#).expect("write");
        assert!(matches!(
            RewardPolicy::from_file(file.path()),
            Err(PolicyError::EmptyCutTable)
        ));
    }
}
