use crate::config::{FlagConfig, PaymentConfig, TierConfig};
use crate::models::{QualityTier, Severity};
use crate::numeric::{Money, Percent, Rate};

/// Daily pay for one worker on one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pay {
    pub base: Money,
    pub bonus: Money,
    pub total: Money,
}

/// Step function from daily consensus score to tier; each cutoff is inclusive.
pub fn quality_tier(score: Percent, tiers: &TierConfig) -> QualityTier {
    if score >= tiers.excellent {
        QualityTier::Excellent
    } else if score >= tiers.good {
        QualityTier::Good
    } else if score >= tiers.fair {
        QualityTier::Fair
    } else {
        QualityTier::Poor
    }
}

pub fn bonus_rate(tier: QualityTier, payment: &PaymentConfig) -> Rate {
    match tier {
        QualityTier::Excellent => payment.bonus_excellent,
        QualityTier::Good => payment.bonus_good,
        QualityTier::Fair => payment.bonus_fair,
        QualityTier::Poor => payment.bonus_poor,
    }
}

pub fn daily_pay(tier: QualityTier, payment: &PaymentConfig) -> Pay {
    let base = payment.base_pay;
    let bonus = base.apply_rate(bonus_rate(tier, payment));
    Pay {
        base,
        bonus,
        total: base + bonus,
    }
}

/// Severity of a low-consensus flag from the worker's average score over the window.
pub fn low_consensus_severity(average: Percent, flags: &FlagConfig) -> Severity {
    if average < flags.high_severity_below {
        Severity::High
    } else if average < flags.medium_severity_below {
        Severity::Medium
    } else {
        Severity::Low
    }
}
