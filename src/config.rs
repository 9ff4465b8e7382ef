//! Thresholds, rates and windows for the quality pipeline.
//!
//! A single immutable [`QualityConfig`] is loaded once (TOML file or built-in
//! defaults), validated, and handed to every engine by reference.

use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;

use crate::error::{QualityError, Result};
use crate::numeric::{Money, Percent, Rate};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualityConfig {
    pub consensus: ConsensusConfig,
    pub tiers: TierConfig,
    pub payment: PaymentConfig,
    pub flags: FlagConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsensusConfig {
    /// Images with fewer answers get no consensus row.
    pub minimum_responses: usize,
    /// Consensus strictly below this requires human review.
    pub review_threshold: Percent,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            minimum_responses: 3,
            review_threshold: Percent::from_hundredths(6000),
        }
    }
}

/// Lower bounds (inclusive) of each quality tier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierConfig {
    pub excellent: Percent,
    pub good: Percent,
    pub fair: Percent,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            excellent: Percent::from_hundredths(9000),
            good: Percent::from_hundredths(8000),
            fair: Percent::from_hundredths(7000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PaymentConfig {
    /// Flat daily rate paid for any day with answers.
    pub base_pay: Money,
    pub bonus_excellent: Rate,
    pub bonus_good: Rate,
    pub bonus_fair: Rate,
    pub bonus_poor: Rate,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            base_pay: Money::from_cents(76_000),
            bonus_excellent: Rate::from_basis_points(3000),
            bonus_good: Rate::from_basis_points(2000),
            bonus_fair: Rate::from_basis_points(1000),
            bonus_poor: Rate::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlagConfig {
    /// Consecutive days below the fair cutoff before a low-consensus flag.
    pub low_consensus_days: u32,
    pub low_consensus_cooldown_days: i64,
    pub high_speed_cooldown_days: i64,
    /// A worker is anomalously fast below this fraction of the average time per task.
    pub speed_ratio: Rate,
    pub speed_min_tasks: i32,
    pub high_severity_below: Percent,
    pub medium_severity_below: Percent,
}

impl Default for FlagConfig {
    fn default() -> Self {
        Self {
            low_consensus_days: 3,
            low_consensus_cooldown_days: 7,
            high_speed_cooldown_days: 1,
            speed_ratio: Rate::from_basis_points(5000),
            speed_min_tasks: 10,
            high_severity_below: Percent::from_hundredths(5000),
            medium_severity_below: Percent::from_hundredths(6000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Offset of the workers' calendar day from UTC.
    pub utc_offset_minutes: i32,
    /// A run lease older than this is considered abandoned.
    pub run_lease_minutes: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            run_lease_minutes: 60,
        }
    }
}

impl QualityConfig {
    /// Load from `path`, or fall back to the built-in defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| QualityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: QualityConfig =
            toml::from_str(text).map_err(|e| QualityError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consensus.minimum_responses == 0 {
            return Err(QualityError::Config(
                "consensus.minimum_responses must be at least 1".to_string(),
            ));
        }
        let tiers = &self.tiers;
        if tiers.excellent < tiers.good || tiers.good < tiers.fair {
            return Err(QualityError::Config(format!(
                "tier cutoffs must satisfy excellent ({}) >= good ({}) >= fair ({})",
                tiers.excellent, tiers.good, tiers.fair
            )));
        }
        let flags = &self.flags;
        if flags.low_consensus_days == 0 {
            return Err(QualityError::Config(
                "flags.low_consensus_days must be at least 1".to_string(),
            ));
        }
        if flags.low_consensus_cooldown_days < 0 || flags.high_speed_cooldown_days < 0 {
            return Err(QualityError::Config(
                "flag cooldowns must not be negative".to_string(),
            ));
        }
        if flags.speed_min_tasks < 0 {
            return Err(QualityError::Config(
                "flags.speed_min_tasks must not be negative".to_string(),
            ));
        }
        if flags.medium_severity_below < flags.high_severity_below {
            return Err(QualityError::Config(format!(
                "flags.medium_severity_below ({}) must be >= flags.high_severity_below ({})",
                flags.medium_severity_below, flags.high_severity_below
            )));
        }
        if self.schedule.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(QualityError::Config(format!(
                "schedule.utc_offset_minutes out of range: {}",
                self.schedule.utc_offset_minutes
            )));
        }
        if self.schedule.run_lease_minutes < 1 {
            return Err(QualityError::Config(
                "schedule.run_lease_minutes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The workers' calendar date of a submission timestamp.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        (at + Duration::minutes(self.schedule.utc_offset_minutes as i64)).date_naive()
    }

    /// UTC instants `[start, end)` covering one local calendar day.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = (date.and_time(NaiveTime::MIN)
            - Duration::minutes(self.schedule.utc_offset_minutes as i64))
        .and_utc();
        (start, start + Duration::days(1))
    }
}
