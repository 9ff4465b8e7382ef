//! Raises and resolves quality flags from persisted daily performance.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::batch::Outcome;
use crate::config::QualityConfig;
use crate::error::Result;
use crate::models::{
    FlagResolution, FlagStatistics, FlagType, FlagTypeCounts, NewFlag, QualityFlag, Severity,
    SeverityCounts, WorkerDailyPerformance,
};
use crate::numeric::{Percent, Seconds};
use crate::scoring::low_consensus_severity;
use crate::store::QualityStore;

pub struct QualityFlaggingEngine<'a, S: QualityStore + ?Sized> {
    store: &'a S,
    config: &'a QualityConfig,
}

impl<'a, S: QualityStore + ?Sized> QualityFlaggingEngine<'a, S> {
    pub fn new(store: &'a S, config: &'a QualityConfig) -> Self {
        Self { store, config }
    }

    /// True when the worker already has an unresolved flag of this type raised
    /// within the cooldown.
    async fn cooling_down(
        &self,
        worker_id: &str,
        flag_type: FlagType,
        cooldown_days: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let since = now - Duration::days(cooldown_days);
        let existing = self
            .store
            .latest_unresolved_flag(worker_id, flag_type, since)
            .await?;
        if let Some(flag) = &existing {
            debug!(
                worker_id,
                flag_id = flag.id,
                %flag_type,
                flagged_at = %flag.flagged_at,
                "open flag within cooldown, skipping"
            );
        }
        Ok(existing.is_some())
    }

    /// Flag every worker on the question whose score stayed below the fair
    /// cutoff on each of the last `low_consensus_days` days ending at `as_of`.
    pub async fn flag_low_performers(
        &self,
        question_id: i64,
        as_of: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Outcome<QualityFlag>> {
        let workers = self.store.performance_worker_ids(question_id).await?;
        let mut outcome = Outcome::new();
        for worker_id in &workers {
            match self.check_low_consensus(worker_id, question_id, as_of, now).await {
                Ok(Some(flag)) => outcome.push(flag),
                Ok(None) => {}
                Err(err) => outcome.fail(format!("worker {worker_id} question {question_id}"), err),
            }
        }
        info!(
            question_id,
            %as_of,
            checked = workers.len(),
            flagged = outcome.items.len(),
            errors = outcome.failures.len(),
            "low consensus check finished"
        );
        Ok(outcome)
    }

    async fn check_low_consensus(
        &self,
        worker_id: &str,
        question_id: i64,
        as_of: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<QualityFlag>> {
        let flags = &self.config.flags;
        let fair = self.config.tiers.fair;
        let days = flags.low_consensus_days;
        let start = as_of - Duration::days(i64::from(days) - 1);
        let window = self
            .store
            .performance_in_range(start, as_of, Some(question_id), Some(worker_id))
            .await?;

        if window.len() < days as usize || window.iter().any(|d| d.consensus_score >= fair) {
            return Ok(None);
        }
        let average = Percent::mean(window.iter().map(|d| d.consensus_score));

        if self
            .cooling_down(worker_id, FlagType::LowConsensus, flags.low_consensus_cooldown_days, now)
            .await?
        {
            return Ok(None);
        }

        let flag = self
            .store
            .insert_flag(&NewFlag {
                worker_id: worker_id.to_string(),
                question_id,
                flag_type: FlagType::LowConsensus,
                severity: low_consensus_severity(average, flags),
                description: format!(
                    "Worker consensus score below {fair}% for {days} consecutive days (avg: {average}%)"
                ),
                flagged_at: now,
            })
            .await?;
        warn!(
            worker_id,
            question_id,
            flag_id = flag.id,
            average = %average,
            severity = %flag.severity,
            "flagged worker for low consensus"
        );
        Ok(Some(flag))
    }

    /// Flag workers on `as_of` whose average time per task is below
    /// `speed_ratio` of the cross-worker average.
    pub async fn flag_anomalous_speed(
        &self,
        question_id: i64,
        as_of: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Outcome<QualityFlag>> {
        let flags = &self.config.flags;
        let rows = self
            .store
            .performance_in_range(as_of, as_of, Some(question_id), None)
            .await?;
        let timed: Vec<(&WorkerDailyPerformance, Seconds)> = rows
            .iter()
            .filter_map(|r| r.average_time_per_task.map(|t| (r, t)))
            .collect();

        let mut outcome = Outcome::new();
        if timed.is_empty() {
            debug!(question_id, %as_of, "no timed performance rows");
            return Ok(outcome);
        }

        let overall = Seconds::mean(timed.iter().map(|(_, t)| *t));

        for (row, seconds) in timed {
            if !seconds.below_share_of(overall, flags.speed_ratio)
                || row.tasks_completed < flags.speed_min_tasks
            {
                continue;
            }
            let result = self
                .raise_speed_flag(row, seconds, overall, now)
                .await;
            match result {
                Ok(Some(flag)) => outcome.push(flag),
                Ok(None) => {}
                Err(err) => outcome.fail(
                    format!("worker {} question {question_id}", row.worker_id),
                    err,
                ),
            }
        }

        info!(
            question_id,
            %as_of,
            average_seconds = %overall,
            flagged = outcome.items.len(),
            errors = outcome.failures.len(),
            "speed check finished"
        );
        Ok(outcome)
    }

    async fn raise_speed_flag(
        &self,
        row: &WorkerDailyPerformance,
        seconds: Seconds,
        overall: Seconds,
        now: DateTime<Utc>,
    ) -> Result<Option<QualityFlag>> {
        if self
            .cooling_down(
                &row.worker_id,
                FlagType::HighSpeed,
                self.config.flags.high_speed_cooldown_days,
                now,
            )
            .await?
        {
            return Ok(None);
        }

        let factor = if seconds > Seconds::ZERO {
            overall.as_f64() / seconds.as_f64()
        } else {
            f64::INFINITY
        };
        let flag = self
            .store
            .insert_flag(&NewFlag {
                worker_id: row.worker_id.clone(),
                question_id: row.question_id,
                flag_type: FlagType::HighSpeed,
                severity: Severity::Medium,
                description: format!(
                    "Completed tasks {factor:.1}x faster than average ({seconds}s vs {overall}s avg)"
                ),
                flagged_at: now,
            })
            .await?;
        warn!(
            worker_id = %row.worker_id,
            question_id = row.question_id,
            flag_id = flag.id,
            %seconds,
            average_seconds = %overall,
            "flagged worker for high speed"
        );
        Ok(Some(flag))
    }

    /// Resolve a flag. Resolving an already resolved flag changes nothing and
    /// returns it as stored; `None` only when the id does not exist.
    pub async fn resolve_flag(
        &self,
        flag_id: i64,
        resolved_by: &str,
        notes: &str,
        action: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<QualityFlag>> {
        let resolution = FlagResolution {
            resolved_by: resolved_by.to_string(),
            notes: notes.to_string(),
            action: action.map(str::to_string),
            resolved_at: now,
        };
        if let Some(flag) = self.store.resolve_flag(flag_id, &resolution).await? {
            info!(flag_id, resolved_by, action = ?action, "flag resolved");
            return Ok(Some(flag));
        }

        let existing = self.store.flag_by_id(flag_id).await?;
        match &existing {
            Some(_) => debug!(flag_id, "flag already resolved"),
            None => debug!(flag_id, "flag not found"),
        }
        Ok(existing)
    }

    /// Raise a flag by hand. No cooldown applies.
    pub async fn create_manual_flag(
        &self,
        worker_id: &str,
        question_id: i64,
        description: &str,
        severity: Severity,
        flagged_by: &str,
        now: DateTime<Utc>,
    ) -> Result<QualityFlag> {
        let flag = self
            .store
            .insert_flag(&NewFlag {
                worker_id: worker_id.to_string(),
                question_id,
                flag_type: FlagType::Manual,
                severity,
                description: format!("Manual flag by {flagged_by}: {description}"),
                flagged_at: now,
            })
            .await?;
        info!(worker_id, question_id, flag_id = flag.id, flagged_by, "manual flag created");
        Ok(flag)
    }

    pub async fn unresolved_flags(
        &self,
        question_id: Option<i64>,
        severity: Option<Severity>,
    ) -> Result<Vec<QualityFlag>> {
        self.store
            .list_flags(question_id, None, Some(false), severity)
            .await
    }

    pub async fn worker_flags(
        &self,
        worker_id: &str,
        resolved: Option<bool>,
    ) -> Result<Vec<QualityFlag>> {
        self.store
            .list_flags(None, Some(worker_id), resolved, None)
            .await
    }

    pub async fn flag_statistics(&self, question_id: Option<i64>) -> Result<FlagStatistics> {
        let flags = self.store.list_flags(question_id, None, None, None).await?;
        let mut by_severity = SeverityCounts::default();
        let mut by_type = FlagTypeCounts::default();
        for flag in &flags {
            by_severity.add(flag.severity);
            by_type.add(flag.flag_type);
        }
        let unresolved = flags.iter().filter(|f| !f.resolved).count();
        Ok(FlagStatistics {
            question_id,
            total: flags.len(),
            unresolved,
            resolved: flags.len() - unresolved,
            by_severity,
            by_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::{PaymentStatus, QualityTier};
    use crate::numeric::Money;
    use chrono::TimeZone;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 12).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 12, 23, 30, 0).unwrap()
    }

    fn row(worker: &str, question: i64, date: NaiveDate, score: i64) -> WorkerDailyPerformance {
        WorkerDailyPerformance {
            id: 0,
            worker_id: worker.to_string(),
            question_id: question,
            date,
            tasks_completed: 20,
            correct_answers: 0,
            incorrect_answers: 0,
            consensus_score: Percent::from_hundredths(score),
            average_time_per_task: None,
            quality_tier: QualityTier::Poor,
            base_pay: Money::from_cents(76_000),
            bonus_amount: Money::ZERO,
            total_payment: Money::from_cents(76_000),
            payment_status: PaymentStatus::Pending,
            payment_reference: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn timed(worker: &str, hundredths: i64, tasks: i32) -> WorkerDailyPerformance {
        let mut r = row(worker, 1, as_of(), 9000);
        r.average_time_per_task = Some(Seconds::from_hundredths(hundredths));
        r.tasks_completed = tasks;
        r
    }

    /// Scores on the three days ending at `as_of`, oldest first.
    fn three_days(store: &MemoryStore, worker: &str, scores: [i64; 3]) {
        for (offset, score) in scores.into_iter().enumerate() {
            let date = as_of() - Duration::days(2 - offset as i64);
            store.put_performance(row(worker, 1, date, score));
        }
    }

    #[tokio::test]
    async fn three_low_days_raise_one_flag() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        three_days(&store, "W", [5000, 6000, 5500]);

        let outcome = QualityFlaggingEngine::new(&store, &config)
            .flag_low_performers(1, as_of(), now())
            .await
            .unwrap();

        assert_eq!(outcome.items.len(), 1);
        let flag = &outcome.items[0];
        assert_eq!(flag.flag_type, FlagType::LowConsensus);
        assert_eq!(flag.severity, Severity::Medium);
        assert!(!flag.resolved);
        assert!(flag.description.contains("avg: 55.00%"), "{}", flag.description);
    }

    #[tokio::test]
    async fn severity_follows_the_average() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        three_days(&store, "high", [4000, 4500, 5000]);
        three_days(&store, "low", [6500, 6900, 6600]);

        let outcome = QualityFlaggingEngine::new(&store, &config)
            .flag_low_performers(1, as_of(), now())
            .await
            .unwrap();

        let severities: Vec<(&str, Severity)> = outcome
            .items
            .iter()
            .map(|f| (f.worker_id.as_str(), f.severity))
            .collect();
        assert_eq!(severities, vec![("high", Severity::High), ("low", Severity::Low)]);
    }

    #[tokio::test]
    async fn one_good_day_or_a_missing_day_prevents_the_flag() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        three_days(&store, "recovered", [5000, 7000, 5000]);
        store.put_performance(row("gap", 1, as_of(), 4000));
        store.put_performance(row("gap", 1, as_of() - Duration::days(1), 4000));
        store.put_performance(row("gap", 1, as_of() - Duration::days(3), 4000));

        let outcome = QualityFlaggingEngine::new(&store, &config)
            .flag_low_performers(1, as_of(), now())
            .await
            .unwrap();

        assert!(outcome.items.is_empty());
        assert!(store.flag_rows().is_empty());
    }

    #[tokio::test]
    async fn open_flag_within_cooldown_blocks_a_second() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        three_days(&store, "W", [5000, 5000, 5000]);
        let engine = QualityFlaggingEngine::new(&store, &config);

        let first = engine.flag_low_performers(1, as_of(), now()).await.unwrap();
        let second = engine
            .flag_low_performers(1, as_of(), now() + Duration::days(6))
            .await
            .unwrap();

        assert_eq!(first.items.len(), 1);
        assert!(second.items.is_empty());
        assert_eq!(store.flag_rows().len(), 1);

        let later = engine
            .flag_low_performers(1, as_of(), now() + Duration::days(8))
            .await
            .unwrap();
        assert_eq!(later.items.len(), 1);
    }

    #[tokio::test]
    async fn resolved_flags_do_not_block() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        three_days(&store, "W", [5000, 5000, 5000]);
        store.put_flag(
            &NewFlag {
                worker_id: "W".to_string(),
                question_id: 1,
                flag_type: FlagType::LowConsensus,
                severity: Severity::High,
                description: "earlier".to_string(),
                flagged_at: now() - Duration::days(1),
            },
            true,
        );

        let outcome = QualityFlaggingEngine::new(&store, &config)
            .flag_low_performers(1, as_of(), now())
            .await
            .unwrap();

        assert_eq!(outcome.items.len(), 1);
    }

    #[tokio::test]
    async fn fast_workers_with_enough_tasks_are_flagged() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        store.put_performance(timed("steady", 3000, 40));
        store.put_performance(timed("steady2", 3400, 40));
        store.put_performance(timed("rusher", 800, 40));
        store.put_performance(timed("few", 800, 9));
        let engine = QualityFlaggingEngine::new(&store, &config);

        let outcome = engine.flag_anomalous_speed(1, as_of(), now()).await.unwrap();

        assert_eq!(outcome.items.len(), 1);
        let flag = &outcome.items[0];
        assert_eq!(flag.worker_id, "rusher");
        assert_eq!(flag.flag_type, FlagType::HighSpeed);
        assert_eq!(flag.severity, Severity::Medium);
        assert!(flag.description.contains("8.00s vs 20.00s avg"), "{}", flag.description);

        let again = engine
            .flag_anomalous_speed(1, as_of(), now() + Duration::hours(12))
            .await
            .unwrap();
        assert!(again.items.is_empty());
        let next_day = engine
            .flag_anomalous_speed(1, as_of(), now() + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(next_day.items.len(), 1);
    }

    #[tokio::test]
    async fn speed_check_without_timings_is_empty() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        store.put_performance(row("W", 1, as_of(), 9000));

        let outcome = QualityFlaggingEngine::new(&store, &config)
            .flag_anomalous_speed(1, as_of(), now())
            .await
            .unwrap();
        assert!(outcome.items.is_empty());
        assert!(outcome.is_clean());
    }

    #[tokio::test]
    async fn manual_flags_bypass_cooldown() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        let engine = QualityFlaggingEngine::new(&store, &config);

        let first = engine
            .create_manual_flag("W", 1, "copying answers", Severity::High, "admin", now())
            .await
            .unwrap();
        engine
            .create_manual_flag("W", 1, "again", Severity::Low, "admin", now())
            .await
            .unwrap();

        assert_eq!(first.description, "Manual flag by admin: copying answers");
        assert_eq!(first.flag_type, FlagType::Manual);
        assert_eq!(store.flag_rows().len(), 2);
    }

    #[tokio::test]
    async fn resolving_twice_keeps_the_first_resolution() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        let engine = QualityFlaggingEngine::new(&store, &config);
        let flag = engine
            .create_manual_flag("W", 1, "check", Severity::Low, "admin", now())
            .await
            .unwrap();

        let resolved = engine
            .resolve_flag(flag.id, "lead", "talked to worker", Some("warning"), now())
            .await
            .unwrap()
            .unwrap();
        let again = engine
            .resolve_flag(flag.id, "other", "second pass", None, now() + Duration::hours(1))
            .await
            .unwrap()
            .unwrap();

        assert!(resolved.resolved);
        assert_eq!(resolved.resolution_action.as_deref(), Some("warning"));
        assert_eq!(again, resolved);
        assert!(engine
            .resolve_flag(9_999, "lead", "missing", None, now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn statistics_and_queries_filter_flags() {
        let store = MemoryStore::new();
        let config = QualityConfig::default();
        let engine = QualityFlaggingEngine::new(&store, &config);
        let a = engine
            .create_manual_flag("A", 1, "x", Severity::High, "admin", now())
            .await
            .unwrap();
        engine
            .create_manual_flag("B", 1, "y", Severity::Low, "admin", now())
            .await
            .unwrap();
        engine
            .create_manual_flag("A", 2, "z", Severity::High, "admin", now())
            .await
            .unwrap();
        engine.resolve_flag(a.id, "lead", "ok", None, now()).await.unwrap();

        let stats = engine.flag_statistics(Some(1)).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unresolved, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.by_severity.high, 1);
        assert_eq!(stats.by_severity.low, 1);
        assert_eq!(stats.by_type.manual, 2);

        let all = engine.flag_statistics(None).await.unwrap();
        assert_eq!(all.total, 3);

        let open_high = engine.unresolved_flags(None, Some(Severity::High)).await.unwrap();
        assert_eq!(open_high.len(), 1);
        assert_eq!(open_high[0].question_id, 2);

        assert_eq!(engine.worker_flags("A", None).await.unwrap().len(), 2);
        assert_eq!(engine.worker_flags("A", Some(true)).await.unwrap().len(), 1);
    }
}
