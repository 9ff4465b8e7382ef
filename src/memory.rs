//! In-memory `QualityStore` for unit tests, with optional injected faults.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{QualityError, Result};
use crate::models::{
    Answer, ConsensusDraft, ConsensusResult, FlagResolution, FlagType, NewAnswer, NewFlag,
    PaymentStatus, PerformanceDraft, QualityFlag, ReviewStatus, Severity, WorkerDailyPerformance,
};
use crate::store::QualityStore;

#[derive(Default)]
struct State {
    next_id: i64,
    answers: Vec<Answer>,
    consensus: Vec<ConsensusResult>,
    performance: Vec<WorkerDailyPerformance>,
    flags: Vec<QualityFlag>,
    runs: HashMap<(String, i64), DateTime<Utc>>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Keys whose writes or reads fail, to exercise per-item error isolation.
#[derive(Default)]
struct Faults {
    questions: HashSet<i64>,
    images: HashSet<i64>,
    workers: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    faults: Mutex<Faults>,
}

fn injected(what: &str) -> QualityError {
    QualityError::Database(sqlx::Error::Protocol(format!("injected fault: {what}")))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reading answers for this question fails.
    pub fn fail_question(&self, question_id: i64) {
        self.faults.lock().unwrap().questions.insert(question_id);
    }

    /// Upserting consensus for this image fails.
    pub fn fail_image(&self, image_id: i64) {
        self.faults.lock().unwrap().images.insert(image_id);
    }

    /// Upserting performance for this worker fails.
    pub fn fail_worker(&self, worker_id: &str) {
        self.faults.lock().unwrap().workers.insert(worker_id.to_string());
    }

    pub fn consensus_rows(&self) -> Vec<ConsensusResult> {
        self.state.lock().unwrap().consensus.clone()
    }

    pub fn performance_rows(&self) -> Vec<WorkerDailyPerformance> {
        self.state.lock().unwrap().performance.clone()
    }

    pub fn flag_rows(&self) -> Vec<QualityFlag> {
        self.state.lock().unwrap().flags.clone()
    }

    /// Place a performance row directly, bypassing the engines.
    pub fn put_performance(&self, mut row: WorkerDailyPerformance) -> WorkerDailyPerformance {
        let mut state = self.state.lock().unwrap();
        row.id = state.next_id();
        state.performance.push(row.clone());
        row
    }

    /// Place a flag directly with a chosen timestamp and resolution state.
    pub fn put_flag(&self, flag: &NewFlag, resolved: bool) -> QualityFlag {
        let mut state = self.state.lock().unwrap();
        let row = QualityFlag {
            id: state.next_id(),
            worker_id: flag.worker_id.clone(),
            question_id: flag.question_id,
            flag_type: flag.flag_type,
            severity: flag.severity,
            description: flag.description.clone(),
            flagged_at: flag.flagged_at,
            resolved,
            resolved_by: None,
            resolved_at: None,
            resolution_notes: None,
            resolution_action: None,
        };
        state.flags.push(row.clone());
        row
    }
}

#[async_trait]
impl QualityStore for MemoryStore {
    async fn insert_answer(&self, answer: &NewAnswer) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let duplicate = state.answers.iter().any(|a| {
            a.worker_id == answer.worker_id
                && a.question_id == answer.question_id
                && a.image_id == answer.image_id
        });
        if duplicate {
            return Ok(false);
        }
        let id = state.next_id();
        state.answers.push(Answer {
            id,
            worker_id: answer.worker_id.clone(),
            question_id: answer.question_id,
            image_id: answer.image_id,
            answer: answer.answer.clone(),
            submitted_at: answer.submitted_at,
        });
        Ok(true)
    }

    async fn answers_for_question(&self, question_id: i64) -> Result<Vec<Answer>> {
        if self.faults.lock().unwrap().questions.contains(&question_id) {
            return Err(injected("answers"));
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .answers
            .iter()
            .filter(|a| a.question_id == question_id)
            .cloned()
            .collect())
    }

    async fn answers_in_range(
        &self,
        question_id: i64,
        worker_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Answer>> {
        if self.faults.lock().unwrap().questions.contains(&question_id) {
            return Err(injected("answers"));
        }
        let state = self.state.lock().unwrap();
        let mut answers: Vec<Answer> = state
            .answers
            .iter()
            .filter(|a| a.question_id == question_id)
            .filter(|a| worker_id.map_or(true, |w| a.worker_id == w))
            .filter(|a| a.submitted_at >= from && a.submitted_at < to)
            .cloned()
            .collect();
        answers.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        Ok(answers)
    }

    async fn active_question_ids(&self) -> Result<Vec<i64>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<i64> = state.answers.iter().map(|a| a.question_id).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn upsert_consensus(
        &self,
        draft: &ConsensusDraft,
        now: DateTime<Utc>,
    ) -> Result<ConsensusResult> {
        if self.faults.lock().unwrap().images.contains(&draft.image_id) {
            return Err(injected("consensus"));
        }
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state
            .consensus
            .iter_mut()
            .find(|c| c.question_id == draft.question_id && c.image_id == draft.image_id)
        {
            let status = if draft.requires_review {
                row.review_status
            } else {
                ReviewStatus::Approved
            };
            let changed = row.ground_truth.as_deref() != Some(draft.ground_truth.as_str())
                || row.total_responses != draft.total_responses
                || row.consensus_percentage != draft.consensus_percentage
                || row.requires_review != draft.requires_review
                || row.review_status != status;
            row.ground_truth = Some(draft.ground_truth.clone());
            row.total_responses = draft.total_responses;
            row.consensus_percentage = draft.consensus_percentage;
            row.requires_review = draft.requires_review;
            row.review_status = status;
            if changed {
                row.updated_at = now;
            }
            return Ok(row.clone());
        }
        let row = ConsensusResult {
            id: state.next_id(),
            question_id: draft.question_id,
            image_id: draft.image_id,
            ground_truth: Some(draft.ground_truth.clone()),
            total_responses: draft.total_responses,
            consensus_percentage: draft.consensus_percentage,
            requires_review: draft.requires_review,
            review_status: if draft.requires_review {
                ReviewStatus::Pending
            } else {
                ReviewStatus::Approved
            },
            reviewed_by: None,
            reviewed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.consensus.push(row.clone());
        Ok(row)
    }

    async fn consensus_for_image(
        &self,
        question_id: i64,
        image_id: i64,
    ) -> Result<Option<ConsensusResult>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .consensus
            .iter()
            .find(|c| c.question_id == question_id && c.image_id == image_id)
            .cloned())
    }

    async fn consensus_for_question(&self, question_id: i64) -> Result<Vec<ConsensusResult>> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<ConsensusResult> = state
            .consensus
            .iter()
            .filter(|c| c.question_id == question_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.image_id);
        Ok(rows)
    }

    async fn set_review_status(
        &self,
        result_id: i64,
        status: ReviewStatus,
        reviewer: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<ConsensusResult>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.consensus.iter_mut().find(|c| c.id == result_id).map(|row| {
            row.review_status = status;
            row.reviewed_by = Some(reviewer.to_string());
            row.reviewed_at = Some(at);
            row.updated_at = at;
            row.clone()
        }))
    }

    async fn upsert_performance(
        &self,
        draft: &PerformanceDraft,
        now: DateTime<Utc>,
    ) -> Result<WorkerDailyPerformance> {
        if self.faults.lock().unwrap().workers.contains(&draft.worker_id) {
            return Err(injected("performance"));
        }
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.performance.iter_mut().find(|p| {
            p.worker_id == draft.worker_id
                && p.question_id == draft.question_id
                && p.date == draft.date
        }) {
            row.tasks_completed = draft.tasks_completed;
            row.correct_answers = draft.correct_answers;
            row.incorrect_answers = draft.incorrect_answers;
            row.consensus_score = draft.consensus_score;
            row.average_time_per_task = draft.average_time_per_task;
            row.quality_tier = draft.quality_tier;
            if row.payment_status == PaymentStatus::Pending {
                row.base_pay = draft.base_pay;
                row.bonus_amount = draft.bonus_amount;
                row.total_payment = draft.total_payment;
            }
            row.updated_at = now;
            return Ok(row.clone());
        }
        let row = WorkerDailyPerformance {
            id: state.next_id(),
            worker_id: draft.worker_id.clone(),
            question_id: draft.question_id,
            date: draft.date,
            tasks_completed: draft.tasks_completed,
            correct_answers: draft.correct_answers,
            incorrect_answers: draft.incorrect_answers,
            consensus_score: draft.consensus_score,
            average_time_per_task: draft.average_time_per_task,
            quality_tier: draft.quality_tier,
            base_pay: draft.base_pay,
            bonus_amount: draft.bonus_amount,
            total_payment: draft.total_payment,
            payment_status: PaymentStatus::Pending,
            payment_reference: None,
            created_at: now,
            updated_at: now,
        };
        state.performance.push(row.clone());
        Ok(row)
    }

    async fn performance_by_id(&self, id: i64) -> Result<Option<WorkerDailyPerformance>> {
        let state = self.state.lock().unwrap();
        Ok(state.performance.iter().find(|p| p.id == id).cloned())
    }

    async fn performance_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        question_id: Option<i64>,
        worker_id: Option<&str>,
    ) -> Result<Vec<WorkerDailyPerformance>> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<WorkerDailyPerformance> = state
            .performance
            .iter()
            .filter(|p| p.date >= start && p.date <= end)
            .filter(|p| question_id.map_or(true, |q| p.question_id == q))
            .filter(|p| worker_id.map_or(true, |w| p.worker_id == w))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
                .then(a.question_id.cmp(&b.question_id))
        });
        Ok(rows)
    }

    async fn performance_worker_ids(&self, question_id: i64) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state
            .performance
            .iter()
            .filter(|p| p.question_id == question_id)
            .map(|p| p.worker_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn transition_payment(
        &self,
        id: i64,
        from: &[PaymentStatus],
        to: PaymentStatus,
        reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(row) = state
            .performance
            .iter_mut()
            .find(|p| p.id == id && from.contains(&p.payment_status))
        else {
            return Ok(false);
        };
        row.payment_status = to;
        match (to, reference) {
            (PaymentStatus::Paid, None) => {}
            (_, reference) => row.payment_reference = reference.map(str::to_string),
        }
        row.updated_at = now;
        Ok(true)
    }

    async fn insert_flag(&self, flag: &NewFlag) -> Result<QualityFlag> {
        Ok(self.put_flag(flag, false))
    }

    async fn flag_by_id(&self, id: i64) -> Result<Option<QualityFlag>> {
        let state = self.state.lock().unwrap();
        Ok(state.flags.iter().find(|f| f.id == id).cloned())
    }

    async fn latest_unresolved_flag(
        &self,
        worker_id: &str,
        flag_type: FlagType,
        since: DateTime<Utc>,
    ) -> Result<Option<QualityFlag>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .flags
            .iter()
            .filter(|f| {
                f.worker_id == worker_id
                    && f.flag_type == flag_type
                    && !f.resolved
                    && f.flagged_at >= since
            })
            .max_by_key(|f| (f.flagged_at, f.id))
            .cloned())
    }

    async fn resolve_flag(
        &self,
        id: i64,
        resolution: &FlagResolution,
    ) -> Result<Option<QualityFlag>> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .flags
            .iter_mut()
            .find(|f| f.id == id && !f.resolved)
            .map(|flag| {
                flag.resolved = true;
                flag.resolved_by = Some(resolution.resolved_by.clone());
                flag.resolved_at = Some(resolution.resolved_at);
                flag.resolution_notes = Some(resolution.notes.clone());
                flag.resolution_action = resolution.action.clone();
                flag.clone()
            }))
    }

    async fn list_flags(
        &self,
        question_id: Option<i64>,
        worker_id: Option<&str>,
        resolved: Option<bool>,
        severity: Option<Severity>,
    ) -> Result<Vec<QualityFlag>> {
        let state = self.state.lock().unwrap();
        let mut flags: Vec<QualityFlag> = state
            .flags
            .iter()
            .filter(|f| question_id.map_or(true, |q| f.question_id == q))
            .filter(|f| worker_id.map_or(true, |w| f.worker_id == w))
            .filter(|f| resolved.map_or(true, |r| f.resolved == r))
            .filter(|f| severity.map_or(true, |s| f.severity == s))
            .cloned()
            .collect();
        flags.sort_by(|a, b| b.flagged_at.cmp(&a.flagged_at).then(b.id.cmp(&a.id)));
        Ok(flags)
    }

    async fn try_claim_run(
        &self,
        job: &str,
        question_id: i64,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let key = (job.to_string(), question_id);
        match state.runs.get(&key) {
            Some(started) if *started >= stale_before => Ok(false),
            _ => {
                state.runs.insert(key, now);
                Ok(true)
            }
        }
    }

    async fn release_run(
        &self,
        job: &str,
        question_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let key = (job.to_string(), question_id);
        if state.runs.get(&key) != Some(&started_at) {
            return Ok(false);
        }
        state.runs.remove(&key);
        Ok(true)
    }
}
