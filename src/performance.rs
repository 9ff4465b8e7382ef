//! Daily worker accuracy against consensus, quality tiers, and the payment lifecycle.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::batch::Outcome;
use crate::config::QualityConfig;
use crate::error::{QualityError, Result};
use crate::models::{
    Answer, PaymentStatus, PaymentSummary, PerformanceDraft, TierCounts, WorkerDailyPerformance,
    WorkerStanding, WorkerSummary,
};
use crate::numeric::{Money, Percent, Seconds};
use crate::scoring::{daily_pay, quality_tier};
use crate::store::QualityStore;

/// Mean gap in seconds between consecutive submissions, or `None` below two answers.
pub fn average_seconds_between(answers: &[&Answer]) -> Option<Seconds> {
    if answers.len() < 2 {
        return None;
    }
    let first = answers.iter().map(|a| a.submitted_at).min()?;
    let last = answers.iter().map(|a| a.submitted_at).max()?;
    let span = (last - first).num_milliseconds();
    Some(Seconds::per_item(span, (answers.len() - 1) as u64))
}

/// Score one worker's day on one question against the known ground truths.
///
/// Answers for images without consensus count as completed tasks but are
/// neither correct nor incorrect. A repeated answer to the same image counts once.
pub fn score_day(
    worker_id: &str,
    question_id: i64,
    date: NaiveDate,
    answers: &[&Answer],
    ground_truth: &HashMap<i64, String>,
    config: &QualityConfig,
) -> PerformanceDraft {
    let mut ordered: Vec<&Answer> = answers.to_vec();
    ordered.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
    let mut seen = HashSet::new();
    ordered.retain(|a| seen.insert(a.image_id));

    let tasks_completed = ordered.len();
    let mut correct = 0usize;
    let mut incorrect = 0usize;
    for answer in &ordered {
        match ground_truth.get(&answer.image_id) {
            Some(truth) if *truth == answer.answer => correct += 1,
            Some(_) => incorrect += 1,
            None => {}
        }
    }

    let consensus_score = Percent::ratio(correct as u64, tasks_completed as u64);
    let tier = quality_tier(consensus_score, &config.tiers);
    let pay = daily_pay(tier, &config.payment);

    PerformanceDraft {
        worker_id: worker_id.to_string(),
        question_id,
        date,
        tasks_completed: tasks_completed as i32,
        correct_answers: correct as i32,
        incorrect_answers: incorrect as i32,
        consensus_score,
        average_time_per_task: average_seconds_between(&ordered),
        quality_tier: tier,
        base_pay: pay.base,
        bonus_amount: pay.bonus,
        total_payment: pay.total,
    }
}

/// Workers ranked by mean daily score, then by total tasks.
pub fn rank_workers(rows: &[WorkerDailyPerformance], limit: usize) -> Vec<WorkerStanding> {
    let mut by_worker: BTreeMap<&str, Vec<&WorkerDailyPerformance>> = BTreeMap::new();
    for row in rows {
        by_worker.entry(row.worker_id.as_str()).or_default().push(row);
    }

    let mut standings: Vec<WorkerStanding> = by_worker
        .into_iter()
        .map(|(worker_id, days)| WorkerStanding {
            worker_id: worker_id.to_string(),
            average_consensus_score: Percent::mean(days.iter().map(|d| d.consensus_score)),
            total_tasks: days.iter().map(|d| d.tasks_completed as i64).sum(),
            total_earnings: days.iter().map(|d| d.total_payment).sum(),
            days_worked: days.len(),
        })
        .collect();

    standings.sort_by(|a, b| {
        b.average_consensus_score
            .cmp(&a.average_consensus_score)
            .then(b.total_tasks.cmp(&a.total_tasks))
            .then_with(|| a.worker_id.cmp(&b.worker_id))
    });
    standings.truncate(limit);
    standings
}

fn check_range(start: NaiveDate, end: NaiveDate) -> Result<()> {
    if start > end {
        return Err(QualityError::InvalidDateRange { start, end });
    }
    Ok(())
}

pub struct PerformanceEngine<'a, S: QualityStore + ?Sized> {
    store: &'a S,
    config: &'a QualityConfig,
}

impl<'a, S: QualityStore + ?Sized> PerformanceEngine<'a, S> {
    pub fn new(store: &'a S, config: &'a QualityConfig) -> Self {
        Self { store, config }
    }

    async fn ground_truths(&self, question_id: i64) -> Result<HashMap<i64, String>> {
        let rows = self.store.consensus_for_question(question_id).await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.ground_truth.map(|truth| (r.image_id, truth)))
            .collect())
    }

    async fn score_and_store(
        &self,
        worker_id: &str,
        question_id: i64,
        date: NaiveDate,
        answers: &[&Answer],
        ground_truth: &HashMap<i64, String>,
        now: DateTime<Utc>,
    ) -> Result<WorkerDailyPerformance> {
        let draft = score_day(worker_id, question_id, date, answers, ground_truth, self.config);
        let stored = self.store.upsert_performance(&draft, now).await?;

        if stored.payment_status != PaymentStatus::Pending
            && stored.total_payment != draft.total_payment
        {
            warn!(
                worker_id,
                question_id,
                %date,
                status = %stored.payment_status,
                frozen_total = %stored.total_payment,
                recomputed_total = %draft.total_payment,
                "payment already {}; keeping stored amounts",
                stored.payment_status
            );
        }
        info!(
            worker_id,
            question_id,
            %date,
            tasks = stored.tasks_completed,
            score = %stored.consensus_score,
            tier = %stored.quality_tier,
            total = %stored.total_payment,
            "daily performance calculated"
        );
        Ok(stored)
    }

    /// Score one worker for one question and calendar day; `None` when the
    /// worker submitted nothing that day.
    pub async fn calculate_daily(
        &self,
        worker_id: &str,
        question_id: i64,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerDailyPerformance>> {
        let (from, to) = self.config.day_bounds(date);
        let answers = self
            .store
            .answers_in_range(question_id, Some(worker_id), from, to)
            .await?;
        if answers.is_empty() {
            debug!(worker_id, question_id, %date, "no answers for worker on date");
            return Ok(None);
        }
        let ground_truth = self.ground_truths(question_id).await?;
        let refs: Vec<&Answer> = answers.iter().collect();
        self.score_and_store(worker_id, question_id, date, &refs, &ground_truth, now)
            .await
            .map(Some)
    }

    /// Score every worker who answered the question on `date`.
    pub async fn calculate_daily_for_question(
        &self,
        question_id: i64,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Outcome<WorkerDailyPerformance>> {
        let (from, to) = self.config.day_bounds(date);
        let answers = self.store.answers_in_range(question_id, None, from, to).await?;
        let mut outcome = Outcome::new();
        if answers.is_empty() {
            debug!(question_id, %date, "no answers on date");
            return Ok(outcome);
        }

        let ground_truth = self.ground_truths(question_id).await?;
        let mut by_worker: BTreeMap<&str, Vec<&Answer>> = BTreeMap::new();
        for answer in &answers {
            by_worker.entry(answer.worker_id.as_str()).or_default().push(answer);
        }

        for (worker_id, worker_answers) in &by_worker {
            let result = self
                .score_and_store(worker_id, question_id, date, worker_answers, &ground_truth, now)
                .await;
            outcome.record(
                format!("worker {worker_id} question {question_id} date {date}"),
                result,
            );
        }

        info!(
            question_id,
            %date,
            workers = outcome.items.len(),
            errors = outcome.failures.len(),
            "daily performance calculated for question"
        );
        Ok(outcome)
    }

    /// Recompute every day in `[start, end]`, for one question or for every
    /// question that has answers.
    pub async fn calculate_period(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        question_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Outcome<WorkerDailyPerformance>> {
        check_range(start, end)?;
        let questions = match question_id {
            Some(id) => vec![id],
            None => self.store.active_question_ids().await?,
        };

        let mut outcome = Outcome::new();
        for date in start.iter_days().take_while(|d| *d <= end) {
            for &question in &questions {
                match self.calculate_daily_for_question(question, date, now).await {
                    Ok(daily) => outcome.extend(daily),
                    Err(err) => outcome.fail(format!("question {question} date {date}"), err),
                }
            }
        }

        info!(
            %start,
            %end,
            questions = questions.len(),
            records = outcome.items.len(),
            errors = outcome.failures.len(),
            "period payments calculated"
        );
        Ok(outcome)
    }

    /// Move pending rows to approved. Ids that are missing or not pending are
    /// skipped without error and not counted.
    pub async fn approve_payments(
        &self,
        ids: &[i64],
        approved_by: &str,
        reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut approved = 0;
        for &id in ids {
            if self
                .store
                .transition_payment(
                    id,
                    &[PaymentStatus::Pending],
                    PaymentStatus::Approved,
                    reference,
                    now,
                )
                .await?
            {
                approved += 1;
            } else {
                match self.store.performance_by_id(id).await? {
                    Some(row) => {
                        debug!(id, status = %row.payment_status, "payment not pending, skipped")
                    }
                    None => warn!(id, "payment row not found, skipped"),
                }
            }
        }
        info!(requested = ids.len(), approved, approved_by, "payments approved");
        Ok(approved)
    }

    /// Advance or reset payment status. Allowed moves are pending→approved,
    /// approved→paid, and approved/paid→pending; anything else is skipped
    /// silently. `transaction_ids` pair with `ids` by position.
    pub async fn update_payment_status(
        &self,
        ids: &[i64],
        status: PaymentStatus,
        transaction_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let from: &[PaymentStatus] = match status {
            PaymentStatus::Approved => &[PaymentStatus::Pending],
            PaymentStatus::Paid => &[PaymentStatus::Approved],
            PaymentStatus::Pending => &[PaymentStatus::Approved, PaymentStatus::Paid],
        };

        let mut updated = 0;
        for (index, &id) in ids.iter().enumerate() {
            let reference = transaction_ids.get(index).map(String::as_str);
            if self
                .store
                .transition_payment(id, from, status, reference, now)
                .await?
            {
                updated += 1;
            } else {
                debug!(id, %status, "payment transition not allowed, skipped");
            }
        }
        info!(requested = ids.len(), updated, %status, "payment status updated");
        Ok(updated)
    }

    pub async fn payment_summary(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        question_id: Option<i64>,
    ) -> Result<PaymentSummary> {
        check_range(start, end)?;
        let rows = self
            .store
            .performance_in_range(start, end, question_id, None)
            .await?;

        let workers: HashSet<&str> = rows.iter().map(|r| r.worker_id.as_str()).collect();
        let mut by_tier = TierCounts::default();
        for row in &rows {
            by_tier.add(row.quality_tier);
        }

        Ok(PaymentSummary {
            period_start: start,
            period_end: end,
            question_id,
            total_workers: workers.len(),
            total_base_pay: rows.iter().map(|r| r.base_pay).sum(),
            total_bonuses: rows.iter().map(|r| r.bonus_amount).sum(),
            total_payment: rows.iter().map(|r| r.total_payment).sum(),
            by_tier,
        })
    }

    /// Per-worker rollup over a period; `None` when the worker has no rows in it.
    pub async fn worker_summary(
        &self,
        worker_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        question_id: Option<i64>,
    ) -> Result<Option<WorkerSummary>> {
        check_range(start, end)?;
        let mut days = self
            .store
            .performance_in_range(start, end, question_id, Some(worker_id))
            .await?;
        if days.is_empty() {
            return Ok(None);
        }
        days.sort_by(|a, b| b.date.cmp(&a.date).then(a.question_id.cmp(&b.question_id)));

        let flags = self
            .store
            .list_flags(question_id, Some(worker_id), None, None)
            .await?
            .into_iter()
            .filter(|f| {
                let day = self.config.local_date(f.flagged_at);
                day >= start && day <= end
            })
            .collect();

        let mut tiers = TierCounts::default();
        for day in &days {
            tiers.add(day.quality_tier);
        }
        let dates: HashSet<NaiveDate> = days.iter().map(|d| d.date).collect();

        Ok(Some(WorkerSummary {
            worker_id: worker_id.to_string(),
            period_start: start,
            period_end: end,
            days_worked: dates.len(),
            total_tasks: days.iter().map(|d| d.tasks_completed as i64).sum(),
            average_consensus_score: Percent::mean(days.iter().map(|d| d.consensus_score)),
            total_earnings: days.iter().map(|d| d.total_payment).sum::<Money>(),
            tiers,
            days,
            flags,
        }))
    }

    pub async fn leaderboard(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        question_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<WorkerStanding>> {
        check_range(start, end)?;
        let rows = self
            .store
            .performance_in_range(start, end, question_id, None)
            .await?;
        Ok(rank_workers(&rows, limit))
    }
}
