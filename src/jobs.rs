//! Scheduler entry points: the nightly pipeline and the weekly payment rollup.
//!
//! Each step runs per question under a `(job, question)` lease so two
//! overlapping invocations never work on the same question at once.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::batch::BatchReport;
use crate::config::QualityConfig;
use crate::consensus::ConsensusEngine;
use crate::error::Result;
use crate::flagging::QualityFlaggingEngine;
use crate::performance::PerformanceEngine;
use crate::store::QualityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Consensus,
    Performance,
    QualityCheck,
    WeeklyPayments,
}

impl Step {
    fn job(self) -> &'static str {
        match self {
            Step::Consensus => "consensus",
            Step::Performance => "performance",
            Step::QualityCheck => "quality_check",
            Step::WeeklyPayments => "weekly_payments",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRunReport {
    pub as_of: NaiveDate,
    pub consensus: BatchReport,
    pub performance: BatchReport,
    pub quality: BatchReport,
}

impl DailyRunReport {
    pub fn error_count(&self) -> usize {
        self.consensus.error_count() + self.performance.error_count() + self.quality.error_count()
    }
}

/// Consensus, then performance for `as_of`, then quality checks, for every
/// question with answers.
pub async fn run_daily<S: QualityStore + ?Sized>(
    store: &S,
    config: &QualityConfig,
    as_of: NaiveDate,
    now: DateTime<Utc>,
) -> Result<DailyRunReport> {
    let questions = store.active_question_ids().await?;
    info!(%as_of, questions = questions.len(), "daily run starting");

    let consensus = run_step(store, config, Step::Consensus, &questions, as_of, now).await;
    let performance = run_step(store, config, Step::Performance, &questions, as_of, now).await;
    let quality = run_step(store, config, Step::QualityCheck, &questions, as_of, now).await;

    let report = DailyRunReport {
        as_of,
        consensus,
        performance,
        quality,
    };
    info!(
        %as_of,
        consensus_results = report.consensus.produced,
        performance_rows = report.performance.produced,
        flags = report.quality.produced,
        errors = report.error_count(),
        "daily run finished"
    );
    Ok(report)
}

/// Recompute daily performance for the seven days ending at `week_end`.
pub async fn run_weekly_payments<S: QualityStore + ?Sized>(
    store: &S,
    config: &QualityConfig,
    week_end: NaiveDate,
    now: DateTime<Utc>,
) -> Result<BatchReport> {
    let questions = store.active_question_ids().await?;
    Ok(run_step(store, config, Step::WeeklyPayments, &questions, week_end, now).await)
}

async fn run_step<S: QualityStore + ?Sized>(
    store: &S,
    config: &QualityConfig,
    step: Step,
    questions: &[i64],
    as_of: NaiveDate,
    now: DateTime<Utc>,
) -> BatchReport {
    let job = step.job();
    let mut report = BatchReport::new(job, now);
    let stale_before = now - Duration::minutes(config.schedule.run_lease_minutes);

    for &question_id in questions {
        match store.try_claim_run(job, question_id, now, stale_before).await {
            Ok(true) => {}
            Ok(false) => {
                info!(job, question_id, "run already in progress, skipping question");
                report.skipped += 1;
                continue;
            }
            Err(err) => {
                report.fail(format!("question {question_id}"), err);
                continue;
            }
        }

        let result = execute(store, config, step, question_id, as_of, now, &mut report).await;
        match store.release_run(job, question_id, now).await {
            Ok(true) => {}
            Ok(false) => warn!(job, question_id, "run lease was reclaimed before release"),
            Err(err) => warn!(job, question_id, error = %err, "failed to release run lease"),
        }
        if let Err(err) = result {
            report.fail(format!("question {question_id}"), err);
        }
    }

    info!(
        job,
        run_id = %report.run_id,
        succeeded = report.succeeded,
        skipped = report.skipped,
        produced = report.produced,
        errors = report.error_count(),
        "job step finished"
    );
    report
}

async fn execute<S: QualityStore + ?Sized>(
    store: &S,
    config: &QualityConfig,
    step: Step,
    question_id: i64,
    as_of: NaiveDate,
    now: DateTime<Utc>,
    report: &mut BatchReport,
) -> Result<()> {
    match step {
        Step::Consensus => {
            let outcome = ConsensusEngine::new(store, config)
                .calculate_for_question(question_id, now)
                .await?;
            report.absorb(outcome);
        }
        Step::Performance => {
            let outcome = PerformanceEngine::new(store, config)
                .calculate_daily_for_question(question_id, as_of, now)
                .await?;
            report.absorb(outcome);
        }
        Step::QualityCheck => {
            let engine = QualityFlaggingEngine::new(store, config);
            let mut outcome = engine.flag_low_performers(question_id, as_of, now).await?;
            outcome.extend(engine.flag_anomalous_speed(question_id, as_of, now).await?);
            report.absorb(outcome);
        }
        Step::WeeklyPayments => {
            let start = as_of - Duration::days(6);
            let outcome = PerformanceEngine::new(store, config)
                .calculate_period(start, as_of, Some(question_id), now)
                .await?;
            report.absorb(outcome);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::NewAnswer;
    use chrono::TimeZone;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 23, 30, 0).unwrap()
    }

    async fn answer(store: &MemoryStore, worker: &str, question: i64, image: i64, value: &str, date: NaiveDate) {
        let submitted_at = Utc.from_utc_datetime(&date.and_hms_opt(10, 0, 0).unwrap())
            + Duration::minutes(image);
        store
            .insert_answer(&NewAnswer {
                worker_id: worker.to_string(),
                question_id: question,
                image_id: image,
                answer: value.to_string(),
                submitted_at,
            })
            .await
            .unwrap();
    }

    /// Three workers label four images; "carol" disagrees on one.
    async fn labelled_day(store: &MemoryStore, question: i64, date: NaiveDate) {
        for image in 1..=4 {
            answer(store, "alice", question, image, "yes", date).await;
            answer(store, "bob", question, image, "yes", date).await;
            let value = if image == 4 { "no" } else { "yes" };
            answer(store, "carol", question, image, value, date).await;
        }
    }

    #[tokio::test]
    async fn daily_run_chains_the_three_steps() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        labelled_day(&store, 1, as_of()).await;

        let report = run_daily(&store, &config, as_of(), now()).await.unwrap();

        assert_eq!(report.consensus.produced, 4);
        assert_eq!(report.performance.produced, 3);
        assert_eq!(report.quality.produced, 0);
        assert_eq!(report.quality.succeeded, 1);
        assert_eq!(report.error_count(), 0);
        let carol = store
            .performance_rows()
            .into_iter()
            .find(|r| r.worker_id == "carol")
            .unwrap();
        assert_eq!(carol.correct_answers, 3);
    }

    #[tokio::test]
    async fn one_failing_question_does_not_stop_the_others() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        labelled_day(&store, 1, as_of()).await;
        labelled_day(&store, 2, as_of()).await;
        store.fail_question(2);

        let report = run_daily(&store, &config, as_of(), now()).await.unwrap();

        assert_eq!(report.consensus.succeeded, 1);
        assert_eq!(report.consensus.produced, 4);
        assert_eq!(report.consensus.failures.len(), 1);
        assert_eq!(report.consensus.failures[0].key, "question 2");
        assert_eq!(report.performance.failures.len(), 1);
        assert_eq!(report.performance.produced, 3);
    }

    #[tokio::test]
    async fn held_lease_skips_the_question_until_stale() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        labelled_day(&store, 1, as_of()).await;
        let held_since = now() - Duration::minutes(10);
        assert!(store
            .try_claim_run("consensus", 1, held_since, held_since - Duration::hours(1))
            .await
            .unwrap());

        let report = run_daily(&store, &config, as_of(), now()).await.unwrap();
        assert_eq!(report.consensus.skipped, 1);
        assert_eq!(report.consensus.produced, 0);
        assert_eq!(report.performance.succeeded, 1);

        let later = now() + Duration::hours(2);
        let rerun = run_daily(&store, &config, as_of(), later).await.unwrap();
        assert_eq!(rerun.consensus.skipped, 0);
        assert_eq!(rerun.consensus.produced, 4);

        let again = run_daily(&store, &config, as_of(), later).await.unwrap();
        assert_eq!(again.consensus.skipped, 0);
    }

    #[tokio::test]
    async fn overrun_release_leaves_the_reclaimed_lease_alone() {
        let store = MemoryStore::new();
        let first = now();
        let second = first + Duration::hours(2);
        let stale = |at: DateTime<Utc>| at - Duration::minutes(60);

        assert!(store.try_claim_run("consensus", 1, first, stale(first)).await.unwrap());
        assert!(store.try_claim_run("consensus", 1, second, stale(second)).await.unwrap());

        assert!(!store.release_run("consensus", 1, first).await.unwrap());
        let third = second + Duration::minutes(1);
        assert!(!store.try_claim_run("consensus", 1, third, stale(third)).await.unwrap());

        assert!(store.release_run("consensus", 1, second).await.unwrap());
        assert!(store.try_claim_run("consensus", 1, third, stale(third)).await.unwrap());
    }

    #[tokio::test]
    async fn weekly_rollup_covers_seven_days() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        for offset in 0..8 {
            let date = as_of() - Duration::days(offset);
            for image in 1..=3 {
                let image = offset * 10 + image;
                for worker in ["alice", "bob", "carol"] {
                    answer(&store, worker, 1, image, "yes", date).await;
                }
            }
        }
        run_daily(&store, &config, as_of(), now()).await.unwrap();

        let report = run_weekly_payments(&store, &config, as_of(), now()).await.unwrap();

        assert_eq!(report.job, "weekly_payments");
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.produced, 7 * 3);
        let dates: std::collections::BTreeSet<NaiveDate> =
            store.performance_rows().iter().map(|r| r.date).collect();
        assert_eq!(dates.len(), 7);
        assert!(!dates.contains(&(as_of() - Duration::days(7))));
    }
}
