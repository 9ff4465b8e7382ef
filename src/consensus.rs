//! Majority-vote consensus over redundant image labels.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::batch::Outcome;
use crate::config::{ConsensusConfig, QualityConfig};
use crate::error::Result;
use crate::models::{Answer, ConsensusDraft, ConsensusResult, ConsensusStatistics, ReviewStatus};
use crate::numeric::Percent;
use crate::store::QualityStore;

/// The most frequent value and its count. Ties go to the lexicographically
/// smallest value so the result never depends on input order.
pub fn majority<'a, I>(values: I) -> Option<(&'a str, usize)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((value, count));
        }
    }
    best
}

/// Consensus for one image, or `None` below the minimum response count.
///
/// Only a worker's earliest answer counts, so a duplicate submission that
/// slipped past ingestion is not double-counted.
pub fn draft_for_image(
    question_id: i64,
    image_id: i64,
    answers: &[&Answer],
    config: &ConsensusConfig,
) -> Option<ConsensusDraft> {
    let mut ordered: Vec<&Answer> = answers.to_vec();
    ordered.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
    let mut seen = HashSet::new();
    let unique: Vec<&Answer> = ordered
        .into_iter()
        .filter(|a| seen.insert(a.worker_id.clone()))
        .collect();

    if unique.len() < config.minimum_responses {
        return None;
    }
    let (ground_truth, count) = majority(unique.iter().map(|a| a.answer.as_str()))?;
    let consensus_percentage = Percent::ratio(count as u64, unique.len() as u64);
    Some(ConsensusDraft {
        question_id,
        image_id,
        ground_truth: ground_truth.to_string(),
        total_responses: unique.len() as i32,
        consensus_percentage,
        requires_review: consensus_percentage < config.review_threshold,
    })
}

pub struct ConsensusEngine<'a, S: QualityStore + ?Sized> {
    store: &'a S,
    config: &'a ConsensusConfig,
}

impl<'a, S: QualityStore + ?Sized> ConsensusEngine<'a, S> {
    pub fn new(store: &'a S, config: &'a QualityConfig) -> Self {
        Self {
            store,
            config: &config.consensus,
        }
    }

    /// Recompute and upsert consensus for every eligible image of the question.
    pub async fn calculate_for_question(
        &self,
        question_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Outcome<ConsensusResult>> {
        let answers = self.store.answers_for_question(question_id).await?;
        if answers.is_empty() {
            debug!(question_id, "no answers for question");
            return Ok(Outcome::new());
        }
        self.apply(question_id, &answers, None, now).await
    }

    /// Same as [`Self::calculate_for_question`] limited to `image_ids`; an
    /// empty slice means every image.
    pub async fn recalculate(
        &self,
        question_id: i64,
        image_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Outcome<ConsensusResult>> {
        if image_ids.is_empty() {
            return self.calculate_for_question(question_id, now).await;
        }
        let answers = self.store.answers_for_question(question_id).await?;
        let subset: HashSet<i64> = image_ids.iter().copied().collect();
        self.apply(question_id, &answers, Some(&subset), now).await
    }

    async fn apply(
        &self,
        question_id: i64,
        answers: &[Answer],
        only: Option<&HashSet<i64>>,
        now: DateTime<Utc>,
    ) -> Result<Outcome<ConsensusResult>> {
        let mut by_image: BTreeMap<i64, Vec<&Answer>> = BTreeMap::new();
        for answer in answers {
            if only.map_or(true, |ids| ids.contains(&answer.image_id)) {
                by_image.entry(answer.image_id).or_default().push(answer);
            }
        }

        let mut outcome = Outcome::new();
        for (image_id, image_answers) in &by_image {
            let Some(draft) = draft_for_image(question_id, *image_id, image_answers, self.config)
            else {
                debug!(
                    question_id,
                    image_id,
                    responses = image_answers.len(),
                    "below minimum responses, skipping"
                );
                continue;
            };
            let result = self.store.upsert_consensus(&draft, now).await;
            outcome.record(format!("question {question_id} image {image_id}"), result);
        }

        let requiring_review = outcome.items.iter().filter(|r| r.requires_review).count();
        info!(
            question_id,
            images = outcome.items.len(),
            requiring_review,
            errors = outcome.failures.len(),
            "consensus calculated"
        );
        Ok(outcome)
    }

    pub async fn ground_truth(
        &self,
        question_id: i64,
        image_id: i64,
    ) -> Result<Option<ConsensusResult>> {
        self.store.consensus_for_image(question_id, image_id).await
    }

    pub async fn images_requiring_review(&self, question_id: i64) -> Result<Vec<ConsensusResult>> {
        let rows = self.store.consensus_for_question(question_id).await?;
        Ok(rows.into_iter().filter(|r| r.requires_review).collect())
    }

    /// Record a reviewer's decision on a consensus row.
    pub async fn review(
        &self,
        result_id: i64,
        status: ReviewStatus,
        reviewer: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ConsensusResult>> {
        let reviewed = self
            .store
            .set_review_status(result_id, status, reviewer, now)
            .await?;
        match &reviewed {
            Some(row) => info!(result_id, status = %row.review_status, reviewer, "consensus reviewed"),
            None => debug!(result_id, "consensus row not found for review"),
        }
        Ok(reviewed)
    }

    pub async fn statistics(&self, question_id: i64) -> Result<ConsensusStatistics> {
        let rows = self.store.consensus_for_question(question_id).await?;
        let requiring_review = rows.iter().filter(|r| r.requires_review).count();
        Ok(ConsensusStatistics {
            question_id,
            total_images: rows.len(),
            with_consensus: rows.len() - requiring_review,
            requiring_review,
            average_consensus_percentage: Percent::mean(
                rows.iter().map(|r| r.consensus_percentage),
            ),
            threshold: self.config.review_threshold,
        })
    }
}
