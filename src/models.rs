use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::numeric::{Money, Percent, Seconds};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            #[cfg(test)]
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseEnumError {
                        kind: $kind,
                        value: value.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(ReviewStatus, "review status", {
    Pending => "pending",
    Approved => "approved",
    UnderReview => "under_review",
});

text_enum!(QualityTier, "quality tier", {
    Excellent => "excellent",
    Good => "good",
    Fair => "fair",
    Poor => "poor",
});

text_enum!(PaymentStatus, "payment status", {
    Pending => "pending",
    Approved => "approved",
    Paid => "paid",
});

text_enum!(FlagType, "flag type", {
    LowConsensus => "low_consensus",
    HighSpeed => "high_speed",
    Manual => "manual",
});

text_enum!(Severity, "severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// A single worker response. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub id: i64,
    pub worker_id: String,
    pub question_id: i64,
    pub image_id: i64,
    pub answer: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAnswer {
    pub worker_id: String,
    pub question_id: i64,
    pub image_id: i64,
    pub answer: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusResult {
    pub id: i64,
    pub question_id: i64,
    pub image_id: i64,
    pub ground_truth: Option<String>,
    pub total_responses: i32,
    pub consensus_percentage: Percent,
    pub requires_review: bool,
    pub review_status: ReviewStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Freshly computed consensus for one image, before it is upserted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusDraft {
    pub question_id: i64,
    pub image_id: i64,
    pub ground_truth: String,
    pub total_responses: i32,
    pub consensus_percentage: Percent,
    pub requires_review: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerDailyPerformance {
    pub id: i64,
    pub worker_id: String,
    pub question_id: i64,
    pub date: NaiveDate,
    pub tasks_completed: i32,
    pub correct_answers: i32,
    pub incorrect_answers: i32,
    pub consensus_score: Percent,
    /// Seconds between consecutive submissions; absent below two answers.
    pub average_time_per_task: Option<Seconds>,
    pub quality_tier: QualityTier,
    pub base_pay: Money,
    pub bonus_amount: Money,
    pub total_payment: Money,
    pub payment_status: PaymentStatus,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Freshly computed daily performance, before it is upserted.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceDraft {
    pub worker_id: String,
    pub question_id: i64,
    pub date: NaiveDate,
    pub tasks_completed: i32,
    pub correct_answers: i32,
    pub incorrect_answers: i32,
    pub consensus_score: Percent,
    pub average_time_per_task: Option<Seconds>,
    pub quality_tier: QualityTier,
    pub base_pay: Money,
    pub bonus_amount: Money,
    pub total_payment: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityFlag {
    pub id: i64,
    pub worker_id: String,
    pub question_id: i64,
    pub flag_type: FlagType,
    pub severity: Severity,
    pub description: String,
    pub flagged_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub resolution_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFlag {
    pub worker_id: String,
    pub question_id: i64,
    pub flag_type: FlagType,
    pub severity: Severity,
    pub description: String,
    pub flagged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlagResolution {
    pub resolved_by: String,
    pub notes: String,
    pub action: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusStatistics {
    pub question_id: i64,
    pub total_images: usize,
    pub with_consensus: usize,
    pub requiring_review: usize,
    pub average_consensus_percentage: Percent,
    pub threshold: Percent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
    pub poor: usize,
}

impl TierCounts {
    pub fn add(&mut self, tier: QualityTier) {
        match tier {
            QualityTier::Excellent => self.excellent += 1,
            QualityTier::Good => self.good += 1,
            QualityTier::Fair => self.fair += 1,
            QualityTier::Poor => self.poor += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentSummary {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub question_id: Option<i64>,
    pub total_workers: usize,
    pub total_base_pay: Money,
    pub total_bonuses: Money,
    pub total_payment: Money,
    pub by_tier: TierCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub days_worked: usize,
    pub total_tasks: i64,
    pub average_consensus_score: Percent,
    pub total_earnings: Money,
    pub tiers: TierCounts,
    pub days: Vec<WorkerDailyPerformance>,
    pub flags: Vec<QualityFlag>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStanding {
    pub worker_id: String,
    pub average_consensus_score: Percent,
    pub total_tasks: i64,
    pub total_earnings: Money,
    pub days_worked: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlagTypeCounts {
    pub low_consensus: usize,
    pub high_speed: usize,
    pub manual: usize,
}

impl SeverityCounts {
    pub fn add(&mut self, severity: Severity) {
        match severity {
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }
}

impl FlagTypeCounts {
    pub fn add(&mut self, flag_type: FlagType) {
        match flag_type {
            FlagType::LowConsensus => self.low_consensus += 1,
            FlagType::HighSpeed => self.high_speed += 1,
            FlagType::Manual => self.manual += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagStatistics {
    pub question_id: Option<i64>,
    pub total: usize,
    pub unresolved: usize,
    pub resolved: usize,
    pub by_severity: SeverityCounts,
    pub by_type: FlagTypeCounts,
}
