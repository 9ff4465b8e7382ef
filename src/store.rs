//! Repository seam shared by the consensus, performance and flagging engines.
//!
//! Every write is a single-row atomic statement; no operation here spans rows,
//! so a failed item never leaves a half-written record behind.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::models::{
    Answer, ConsensusDraft, ConsensusResult, FlagResolution, FlagType, NewAnswer, NewFlag,
    PaymentStatus, PerformanceDraft, QualityFlag, ReviewStatus, Severity, WorkerDailyPerformance,
};

#[async_trait]
pub trait QualityStore: Send + Sync {
    // ========================================================================
    // ANSWERS
    // ========================================================================

    /// Insert an answer; a second answer for the same (worker, question, image)
    /// is ignored and reported as `false`.
    async fn insert_answer(&self, answer: &NewAnswer) -> Result<bool>;

    async fn answers_for_question(&self, question_id: i64) -> Result<Vec<Answer>>;

    /// Answers submitted in `[from, to)`, optionally restricted to one worker.
    async fn answers_in_range(
        &self,
        question_id: i64,
        worker_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Answer>>;

    /// Questions that have at least one answer, ascending.
    async fn active_question_ids(&self) -> Result<Vec<i64>>;

    // ========================================================================
    // CONSENSUS
    // ========================================================================

    /// Insert or overwrite the consensus row for `(question_id, image_id)`.
    ///
    /// A new row starts `pending` when it requires review and `approved`
    /// otherwise. An existing row keeps its review status while it still
    /// requires review and becomes `approved` once it no longer does.
    async fn upsert_consensus(
        &self,
        draft: &ConsensusDraft,
        now: DateTime<Utc>,
    ) -> Result<ConsensusResult>;

    async fn consensus_for_image(
        &self,
        question_id: i64,
        image_id: i64,
    ) -> Result<Option<ConsensusResult>>;

    async fn consensus_for_question(&self, question_id: i64) -> Result<Vec<ConsensusResult>>;

    async fn set_review_status(
        &self,
        result_id: i64,
        status: ReviewStatus,
        reviewer: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<ConsensusResult>>;

    // ========================================================================
    // DAILY PERFORMANCE
    // ========================================================================

    /// Insert or overwrite the row for `(worker_id, question_id, date)`.
    ///
    /// Task, score and tier fields are always overwritten. Pay fields are only
    /// overwritten while the stored payment status is still `pending`.
    async fn upsert_performance(
        &self,
        draft: &PerformanceDraft,
        now: DateTime<Utc>,
    ) -> Result<WorkerDailyPerformance>;

    async fn performance_by_id(&self, id: i64) -> Result<Option<WorkerDailyPerformance>>;

    /// Rows with `start <= date <= end`, filtered by any of the optional keys,
    /// ordered by date then worker.
    async fn performance_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        question_id: Option<i64>,
        worker_id: Option<&str>,
    ) -> Result<Vec<WorkerDailyPerformance>>;

    async fn performance_worker_ids(&self, question_id: i64) -> Result<Vec<String>>;

    /// Compare-and-set on payment status: only a row currently in one of `from`
    /// moves to `to`. Returns `false` when the row is missing or in another status.
    ///
    /// Moving to `paid` without a reference keeps the stored one; every other
    /// move stores `reference` as given, clearing it when `None`.
    async fn transition_payment(
        &self,
        id: i64,
        from: &[PaymentStatus],
        to: PaymentStatus,
        reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // ========================================================================
    // QUALITY FLAGS
    // ========================================================================

    async fn insert_flag(&self, flag: &NewFlag) -> Result<QualityFlag>;

    async fn flag_by_id(&self, id: i64) -> Result<Option<QualityFlag>>;

    /// Most recent unresolved flag of `flag_type` for the worker raised at or after `since`.
    async fn latest_unresolved_flag(
        &self,
        worker_id: &str,
        flag_type: FlagType,
        since: DateTime<Utc>,
    ) -> Result<Option<QualityFlag>>;

    /// Resolve an open flag. Returns `None` if the flag is missing or already resolved.
    async fn resolve_flag(&self, id: i64, resolution: &FlagResolution)
        -> Result<Option<QualityFlag>>;

    /// Flags ordered newest first, filtered by any of the optional keys.
    async fn list_flags(
        &self,
        question_id: Option<i64>,
        worker_id: Option<&str>,
        resolved: Option<bool>,
        severity: Option<Severity>,
    ) -> Result<Vec<QualityFlag>>;

    // ========================================================================
    // RUN LEASES
    // ========================================================================

    /// Claim the `(job, question_id)` lease. A lease taken before `stale_before`
    /// is treated as abandoned and may be reclaimed.
    async fn try_claim_run(
        &self,
        job: &str,
        question_id: i64,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop the lease taken at `started_at`. Returns `false` when the lease is
    /// gone or has since been reclaimed by another run, which keeps it.
    async fn release_run(
        &self,
        job: &str,
        question_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<bool>;
}
