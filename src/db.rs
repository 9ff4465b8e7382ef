use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::error::Result;
use crate::models::{
    Answer, ConsensusDraft, ConsensusResult, FlagResolution, FlagType, NewAnswer, NewFlag,
    PaymentStatus, PerformanceDraft, QualityFlag, ReviewStatus, Severity, WorkerDailyPerformance,
};
use crate::numeric::{Money, Percent, Seconds};
use crate::store::QualityStore;

const ANSWER_COLUMNS: &str = "id, worker_id, question_id, image_id, answer, submitted_at";

/// Percentages, money and durations leave the database as integer hundredths.
const CONSENSUS_COLUMNS: &str = "id, question_id, image_id, ground_truth, total_responses, \
     (consensus_percentage * 100)::bigint AS consensus_hundredths, requires_review, \
     review_status, reviewed_by, reviewed_at, created_at, updated_at";

const PERFORMANCE_COLUMNS: &str = "id, worker_id, question_id, date, tasks_completed, \
     correct_answers, incorrect_answers, (consensus_score * 100)::bigint AS score_hundredths, \
     (average_time_per_task * 100)::bigint AS time_hundredths, quality_tier, \
     (base_pay * 100)::bigint AS base_cents, (bonus_amount * 100)::bigint AS bonus_cents, \
     (total_payment * 100)::bigint AS total_cents, payment_status, payment_reference, \
     created_at, updated_at";

const FLAG_COLUMNS: &str = "id, worker_id, question_id, flag_type, severity, description, \
     flagged_at, resolved, resolved_by, resolved_at, resolution_notes, resolution_action";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn answer_from_row(row: &PgRow) -> Result<Answer> {
    Ok(Answer {
        id: row.try_get("id")?,
        worker_id: row.try_get("worker_id")?,
        question_id: row.try_get("question_id")?,
        image_id: row.try_get("image_id")?,
        answer: row.try_get("answer")?,
        submitted_at: row.try_get("submitted_at")?,
    })
}

fn consensus_from_row(row: &PgRow) -> Result<ConsensusResult> {
    let review_status: String = row.try_get("review_status")?;
    Ok(ConsensusResult {
        id: row.try_get("id")?,
        question_id: row.try_get("question_id")?,
        image_id: row.try_get("image_id")?,
        ground_truth: row.try_get("ground_truth")?,
        total_responses: row.try_get("total_responses")?,
        consensus_percentage: Percent::from_hundredths(row.try_get("consensus_hundredths")?),
        requires_review: row.try_get("requires_review")?,
        review_status: review_status.parse()?,
        reviewed_by: row.try_get("reviewed_by")?,
        reviewed_at: row.try_get("reviewed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn performance_from_row(row: &PgRow) -> Result<WorkerDailyPerformance> {
    let quality_tier: String = row.try_get("quality_tier")?;
    let payment_status: String = row.try_get("payment_status")?;
    Ok(WorkerDailyPerformance {
        id: row.try_get("id")?,
        worker_id: row.try_get("worker_id")?,
        question_id: row.try_get("question_id")?,
        date: row.try_get("date")?,
        tasks_completed: row.try_get("tasks_completed")?,
        correct_answers: row.try_get("correct_answers")?,
        incorrect_answers: row.try_get("incorrect_answers")?,
        consensus_score: Percent::from_hundredths(row.try_get("score_hundredths")?),
        average_time_per_task: row
            .try_get::<Option<i64>, _>("time_hundredths")?
            .map(Seconds::from_hundredths),
        quality_tier: quality_tier.parse()?,
        base_pay: Money::from_cents(row.try_get("base_cents")?),
        bonus_amount: Money::from_cents(row.try_get("bonus_cents")?),
        total_payment: Money::from_cents(row.try_get("total_cents")?),
        payment_status: payment_status.parse()?,
        payment_reference: row.try_get("payment_reference")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn flag_from_row(row: &PgRow) -> Result<QualityFlag> {
    let flag_type: String = row.try_get("flag_type")?;
    let severity: String = row.try_get("severity")?;
    Ok(QualityFlag {
        id: row.try_get("id")?,
        worker_id: row.try_get("worker_id")?,
        question_id: row.try_get("question_id")?,
        flag_type: flag_type.parse()?,
        severity: severity.parse()?,
        description: row.try_get("description")?,
        flagged_at: row.try_get("flagged_at")?,
        resolved: row.try_get("resolved")?,
        resolved_by: row.try_get("resolved_by")?,
        resolved_at: row.try_get("resolved_at")?,
        resolution_notes: row.try_get("resolution_notes")?,
        resolution_action: row.try_get("resolution_action")?,
    })
}

fn map_rows<T>(rows: &[PgRow], map: fn(&PgRow) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(map).collect()
}

/// Postgres-backed store over the `microtask_quality` schema.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QualityStore for PgStore {
    // ========================================================================
    // ANSWERS
    // ========================================================================

    async fn insert_answer(&self, answer: &NewAnswer) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO microtask_quality.answers
            (worker_id, question_id, image_id, answer, submitted_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (worker_id, question_id, image_id) DO NOTHING
            "#,
        )
        .bind(&answer.worker_id)
        .bind(answer.question_id)
        .bind(answer.image_id)
        .bind(&answer.answer)
        .bind(answer.submitted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn answers_for_question(&self, question_id: i64) -> Result<Vec<Answer>> {
        let query = format!(
            "SELECT {ANSWER_COLUMNS} FROM microtask_quality.answers \
             WHERE question_id = $1 ORDER BY image_id, submitted_at, id"
        );
        let rows = sqlx::query(&query)
            .bind(question_id)
            .fetch_all(&self.pool)
            .await?;
        map_rows(&rows, answer_from_row)
    }

    async fn answers_in_range(
        &self,
        question_id: i64,
        worker_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Answer>> {
        let query = format!(
            "SELECT {ANSWER_COLUMNS} FROM microtask_quality.answers \
             WHERE question_id = $1 AND submitted_at >= $2 AND submitted_at < $3 \
             AND ($4::text IS NULL OR worker_id = $4) \
             ORDER BY submitted_at, id"
        );
        let rows = sqlx::query(&query)
            .bind(question_id)
            .bind(from)
            .bind(to)
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await?;
        map_rows(&rows, answer_from_row)
    }

    async fn active_question_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT question_id FROM microtask_quality.answers ORDER BY question_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("question_id").map_err(Into::into))
            .collect()
    }

    // ========================================================================
    // CONSENSUS
    // ========================================================================

    async fn upsert_consensus(
        &self,
        draft: &ConsensusDraft,
        now: DateTime<Utc>,
    ) -> Result<ConsensusResult> {
        let query = format!(
            r#"
            INSERT INTO microtask_quality.consensus_results AS c
            (question_id, image_id, ground_truth, total_responses, consensus_percentage,
             requires_review, review_status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5::bigint / 100.0, $6,
                    CASE WHEN $6 THEN 'pending' ELSE 'approved' END, $7, $7)
            ON CONFLICT (question_id, image_id) DO UPDATE SET
                ground_truth = EXCLUDED.ground_truth,
                total_responses = EXCLUDED.total_responses,
                consensus_percentage = EXCLUDED.consensus_percentage,
                requires_review = EXCLUDED.requires_review,
                review_status = CASE WHEN EXCLUDED.requires_review
                                     THEN c.review_status ELSE 'approved' END,
                updated_at = CASE
                    WHEN (c.ground_truth, c.total_responses, c.consensus_percentage,
                          c.requires_review, c.review_status)
                         IS DISTINCT FROM
                         (EXCLUDED.ground_truth, EXCLUDED.total_responses,
                          EXCLUDED.consensus_percentage, EXCLUDED.requires_review,
                          CASE WHEN EXCLUDED.requires_review
                               THEN c.review_status ELSE 'approved' END)
                    THEN EXCLUDED.updated_at
                    ELSE c.updated_at
                END
            RETURNING {CONSENSUS_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(draft.question_id)
            .bind(draft.image_id)
            .bind(&draft.ground_truth)
            .bind(draft.total_responses)
            .bind(draft.consensus_percentage.hundredths())
            .bind(draft.requires_review)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        consensus_from_row(&row)
    }

    async fn consensus_for_image(
        &self,
        question_id: i64,
        image_id: i64,
    ) -> Result<Option<ConsensusResult>> {
        let query = format!(
            "SELECT {CONSENSUS_COLUMNS} FROM microtask_quality.consensus_results \
             WHERE question_id = $1 AND image_id = $2"
        );
        let row = sqlx::query(&query)
            .bind(question_id)
            .bind(image_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(consensus_from_row).transpose()
    }

    async fn consensus_for_question(&self, question_id: i64) -> Result<Vec<ConsensusResult>> {
        let query = format!(
            "SELECT {CONSENSUS_COLUMNS} FROM microtask_quality.consensus_results \
             WHERE question_id = $1 ORDER BY image_id"
        );
        let rows = sqlx::query(&query)
            .bind(question_id)
            .fetch_all(&self.pool)
            .await?;
        map_rows(&rows, consensus_from_row)
    }

    async fn set_review_status(
        &self,
        result_id: i64,
        status: ReviewStatus,
        reviewer: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<ConsensusResult>> {
        let query = format!(
            "UPDATE microtask_quality.consensus_results \
             SET review_status = $2, reviewed_by = $3, reviewed_at = $4, updated_at = $4 \
             WHERE id = $1 RETURNING {CONSENSUS_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(result_id)
            .bind(status.as_str())
            .bind(reviewer)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(consensus_from_row).transpose()
    }

    // ========================================================================
    // DAILY PERFORMANCE
    // ========================================================================

    async fn upsert_performance(
        &self,
        draft: &PerformanceDraft,
        now: DateTime<Utc>,
    ) -> Result<WorkerDailyPerformance> {
        let query = format!(
            r#"
            INSERT INTO microtask_quality.worker_daily_performance AS p
            (worker_id, question_id, date, tasks_completed, correct_answers, incorrect_answers,
             consensus_score, average_time_per_task, quality_tier, base_pay, bonus_amount,
             total_payment, payment_status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7::bigint / 100.0, $8::bigint / 100.0,
                    $9, $10::bigint / 100.0, $11::bigint / 100.0, $12::bigint / 100.0,
                    'pending', $13, $13)
            ON CONFLICT (worker_id, question_id, date) DO UPDATE SET
                tasks_completed = EXCLUDED.tasks_completed,
                correct_answers = EXCLUDED.correct_answers,
                incorrect_answers = EXCLUDED.incorrect_answers,
                consensus_score = EXCLUDED.consensus_score,
                average_time_per_task = EXCLUDED.average_time_per_task,
                quality_tier = EXCLUDED.quality_tier,
                base_pay = CASE WHEN p.payment_status = 'pending'
                                THEN EXCLUDED.base_pay ELSE p.base_pay END,
                bonus_amount = CASE WHEN p.payment_status = 'pending'
                                    THEN EXCLUDED.bonus_amount ELSE p.bonus_amount END,
                total_payment = CASE WHEN p.payment_status = 'pending'
                                     THEN EXCLUDED.total_payment ELSE p.total_payment END,
                updated_at = EXCLUDED.updated_at
            RETURNING {PERFORMANCE_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(&draft.worker_id)
            .bind(draft.question_id)
            .bind(draft.date)
            .bind(draft.tasks_completed)
            .bind(draft.correct_answers)
            .bind(draft.incorrect_answers)
            .bind(draft.consensus_score.hundredths())
            .bind(draft.average_time_per_task.map(Seconds::hundredths))
            .bind(draft.quality_tier.as_str())
            .bind(draft.base_pay.cents())
            .bind(draft.bonus_amount.cents())
            .bind(draft.total_payment.cents())
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        performance_from_row(&row)
    }

    async fn performance_by_id(&self, id: i64) -> Result<Option<WorkerDailyPerformance>> {
        let query = format!(
            "SELECT {PERFORMANCE_COLUMNS} FROM microtask_quality.worker_daily_performance \
             WHERE id = $1"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(performance_from_row).transpose()
    }

    async fn performance_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        question_id: Option<i64>,
        worker_id: Option<&str>,
    ) -> Result<Vec<WorkerDailyPerformance>> {
        let query = format!(
            "SELECT {PERFORMANCE_COLUMNS} FROM microtask_quality.worker_daily_performance \
             WHERE date BETWEEN $1 AND $2 \
             AND ($3::bigint IS NULL OR question_id = $3) \
             AND ($4::text IS NULL OR worker_id = $4) \
             ORDER BY date, worker_id, question_id"
        );
        let rows = sqlx::query(&query)
            .bind(start)
            .bind(end)
            .bind(question_id)
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await?;
        map_rows(&rows, performance_from_row)
    }

    async fn performance_worker_ids(&self, question_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT worker_id FROM microtask_quality.worker_daily_performance \
             WHERE question_id = $1 ORDER BY worker_id",
        )
        .bind(question_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("worker_id").map_err(Into::into))
            .collect()
    }

    async fn transition_payment(
        &self,
        id: i64,
        from: &[PaymentStatus],
        to: PaymentStatus,
        reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let result = sqlx::query(
            r#"
            UPDATE microtask_quality.worker_daily_performance
            SET payment_status = $3,
                payment_reference = CASE WHEN $3 = 'paid'
                                         THEN COALESCE($4, payment_reference) ELSE $4 END,
                updated_at = $5
            WHERE id = $1 AND payment_status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to.as_str())
        .bind(reference)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // QUALITY FLAGS
    // ========================================================================

    async fn insert_flag(&self, flag: &NewFlag) -> Result<QualityFlag> {
        let query = format!(
            "INSERT INTO microtask_quality.quality_flags \
             (worker_id, question_id, flag_type, severity, description, flagged_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {FLAG_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(&flag.worker_id)
            .bind(flag.question_id)
            .bind(flag.flag_type.as_str())
            .bind(flag.severity.as_str())
            .bind(&flag.description)
            .bind(flag.flagged_at)
            .fetch_one(&self.pool)
            .await?;
        flag_from_row(&row)
    }

    async fn flag_by_id(&self, id: i64) -> Result<Option<QualityFlag>> {
        let query = format!("SELECT {FLAG_COLUMNS} FROM microtask_quality.quality_flags WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(flag_from_row).transpose()
    }

    async fn latest_unresolved_flag(
        &self,
        worker_id: &str,
        flag_type: FlagType,
        since: DateTime<Utc>,
    ) -> Result<Option<QualityFlag>> {
        let query = format!(
            "SELECT {FLAG_COLUMNS} FROM microtask_quality.quality_flags \
             WHERE worker_id = $1 AND flag_type = $2 AND NOT resolved AND flagged_at >= $3 \
             ORDER BY flagged_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(worker_id)
            .bind(flag_type.as_str())
            .bind(since)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(flag_from_row).transpose()
    }

    async fn resolve_flag(
        &self,
        id: i64,
        resolution: &FlagResolution,
    ) -> Result<Option<QualityFlag>> {
        let query = format!(
            "UPDATE microtask_quality.quality_flags \
             SET resolved = TRUE, resolved_by = $2, resolved_at = $3, \
                 resolution_notes = $4, resolution_action = $5 \
             WHERE id = $1 AND NOT resolved RETURNING {FLAG_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(&resolution.resolved_by)
            .bind(resolution.resolved_at)
            .bind(&resolution.notes)
            .bind(resolution.action.as_deref())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(flag_from_row).transpose()
    }

    async fn list_flags(
        &self,
        question_id: Option<i64>,
        worker_id: Option<&str>,
        resolved: Option<bool>,
        severity: Option<Severity>,
    ) -> Result<Vec<QualityFlag>> {
        let query = format!(
            "SELECT {FLAG_COLUMNS} FROM microtask_quality.quality_flags \
             WHERE ($1::bigint IS NULL OR question_id = $1) \
             AND ($2::text IS NULL OR worker_id = $2) \
             AND ($3::boolean IS NULL OR resolved = $3) \
             AND ($4::text IS NULL OR severity = $4) \
             ORDER BY flagged_at DESC, id DESC"
        );
        let rows = sqlx::query(&query)
            .bind(question_id)
            .bind(worker_id)
            .bind(resolved)
            .bind(severity.map(Severity::as_str))
            .fetch_all(&self.pool)
            .await?;
        map_rows(&rows, flag_from_row)
    }

    // ========================================================================
    // RUN LEASES
    // ========================================================================

    async fn try_claim_run(
        &self,
        job: &str,
        question_id: i64,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO microtask_quality.job_runs AS r (job, question_id, started_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (job, question_id) DO UPDATE SET started_at = EXCLUDED.started_at
            WHERE r.started_at < $4
            "#,
        )
        .bind(job)
        .bind(question_id)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_run(
        &self,
        job: &str,
        question_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM microtask_quality.job_runs \
             WHERE job = $1 AND question_id = $2 AND started_at = $3",
        )
        .bind(job)
        .bind(question_id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Load a small labelled batch: six workers, twelve images a day over three days.
/// `w-006` disagrees often and `w-005` answers in a rush.
pub async fn seed(store: &PgStore, first_day: NaiveDate) -> anyhow::Result<usize> {
    const QUESTION_ID: i64 = 1;
    const WORKERS: [&str; 6] = ["w-001", "w-002", "w-003", "w-004", "w-005", "w-006"];

    let mut inserted = 0usize;
    for day in 0..3i64 {
        let date = first_day + Duration::days(day);
        let opening = date
            .and_hms_opt(8, 0, 0)
            .context("invalid seed time")?
            .and_utc();

        for image in 1..=12i64 {
            let image_id = day * 100 + image;
            for (index, worker) in WORKERS.iter().enumerate() {
                let index = index as i64;
                let wrong = match *worker {
                    "w-006" => image % 3 != 0,
                    _ => (image + index + day) % 11 == 0,
                };
                let seconds_per_task = if *worker == "w-005" { 6 } else { 45 + index * 5 };

                let answer = NewAnswer {
                    worker_id: worker.to_string(),
                    question_id: QUESTION_ID,
                    image_id,
                    answer: if wrong { "no" } else { "yes" }.to_string(),
                    submitted_at: opening
                        + Duration::minutes(index * 15)
                        + Duration::seconds(image * seconds_per_task),
                };
                if store.insert_answer(&answer).await? {
                    inserted += 1;
                }
            }
        }
    }

    Ok(inserted)
}

/// Import answers from a CSV with columns `worker_id, question_id, image_id,
/// answer, submitted_at` (RFC 3339). Returns the number of new answers.
pub async fn import_answers_csv(
    store: &PgStore,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        worker_id: String,
        question_id: i64,
        image_id: i64,
        answer: String,
        submitted_at: DateTime<Utc>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid answer row {}", line + 1))?;
        let answer = NewAnswer {
            worker_id: row.worker_id.trim().to_string(),
            question_id: row.question_id,
            image_id: row.image_id,
            answer: row.answer.trim().to_string(),
            submitted_at: row.submitted_at,
        };
        if store.insert_answer(&answer).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}
