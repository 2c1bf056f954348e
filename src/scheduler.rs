use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::NaiveDate;
use chrono::Utc;

use crate::config::PipelineConfig;
use crate::conversation::{ConversationOrchestrator, Participant};
use crate::database::{
    log_entry, ConversationStatus, MatchRecord, MatchmakerDatabase, ProgressUnit,
};
use crate::evaluate::OutcomeEvaluator;
use crate::llm::GenerationCapability;
use crate::pairing::{plan_pairs, MatchCandidate};
use crate::ratelimit::RateLimiter;
use crate::report::ReportAggregator;

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub force_regenerate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub pairs_planned: usize,
    pub pairs_resumed: usize,
    pub pairs_deadline_skipped: usize,
    pub matches_completed: usize,
    pub matches_failed: usize,
    pub users_skipped_empty_story: usize,
    pub cooldown_excluded: usize,
    pub reports_generated: usize,
    pub matches_folded: usize,
}

struct PairJob {
    candidate: MatchCandidate,
}

#[derive(Debug)]
struct PairResult {
    completed: bool,
}

/// Top-level control loop for one nightly run: pairing, conversations with
/// bounded parallelism, evaluation, aggregation. Each stage leaves progress
/// markers so a crash mid-run resumes from the last completed unit.
pub struct BatchScheduler {
    db: Arc<MatchmakerDatabase>,
    capability: Arc<dyn GenerationCapability>,
    limiter: Arc<RateLimiter>,
    config: PipelineConfig,
}

impl BatchScheduler {
    pub fn new(
        db: Arc<MatchmakerDatabase>,
        capability: Arc<dyn GenerationCapability>,
        limiter: Arc<RateLimiter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            capability,
            limiter,
            config,
        }
    }

    /// Run the whole pipeline for one date. Idempotent without
    /// `force_regenerate`: completed pairs and reported matches are
    /// skipped on re-invocation.
    pub async fn run_nightly_batch(
        &self,
        date: NaiveDate,
        options: &BatchOptions,
    ) -> Result<BatchSummary> {
        if !self.db.acquire_run_lock(date)? {
            anyhow::bail!("Nightly run for {} is already in progress", date);
        }

        let result = self.run_locked(date, options).await;
        if let Err(e) = self.db.release_run_lock(date) {
            tracing::error!("Failed to release run lock for {}: {}", date, e);
        }
        result
    }

    async fn run_locked(&self, date: NaiveDate, options: &BatchOptions) -> Result<BatchSummary> {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.config.run_deadline_secs);

        if let Err(e) = self.capability.health().await {
            let mut entry = log_entry("scheduler", "preflight", "error");
            entry.error_message = Some(e.to_string());
            self.db.log(&entry)?;
            return Err(e.context("Preflight failed: generation capability unreachable"));
        }

        let participants = self.load_participants()?;
        let mut summary = BatchSummary::default();

        if participants.len() < 2 {
            let mut entry = log_entry("scheduler", "run_nightly_batch", "ok");
            entry.detail = Some(format!(
                "date={} no-op: {} eligible participant(s)",
                date,
                participants.len()
            ));
            self.db.log(&entry)?;
            tracing::info!("Fewer than two eligible participants for {}; nothing to do", date);
            return Ok(summary);
        }

        // Pairing.
        let cutoff = date - chrono::Duration::days(self.config.cooldown_days);
        let recent_pairs = self.db.pairs_since(cutoff)?;
        let stories: Vec<_> = participants.values().map(|p| p.story.clone()).collect();
        let plan = plan_pairs(&stories, &recent_pairs);

        summary.pairs_planned = plan.pairs.len();
        summary.users_skipped_empty_story = plan.skipped_empty.len();
        summary.cooldown_excluded = plan.cooldown_excluded;
        for user_id in &plan.skipped_empty {
            let mut entry = log_entry("pairing_engine", "skip_user", "ok");
            entry.detail = Some(format!("user={} reason=empty_story", user_id));
            self.db.log(&entry)?;
        }
        tracing::info!(
            "Pairing for {}: {} pair(s), {} user(s) skipped, {} pair(s) in cool-down",
            date,
            plan.pairs.len(),
            plan.skipped_empty.len(),
            plan.cooldown_excluded
        );

        // Conversations + evaluation over a bounded worker pool.
        let (completed, failed, resumed, deadline_skipped) = self
            .process_pairs(date, plan.pairs, Arc::new(participants), deadline)
            .await?;
        summary.matches_completed = completed;
        summary.matches_failed = failed;
        summary.pairs_resumed = resumed;
        summary.pairs_deadline_skipped = deadline_skipped;

        // Aggregation.
        let aggregator = ReportAggregator::new(
            self.db.clone(),
            self.capability.clone(),
            self.limiter.clone(),
            self.config.concurrency,
        );
        let aggregation = aggregator
            .aggregate(date, options.force_regenerate, deadline)
            .await?;
        summary.reports_generated = aggregation.reports_generated;
        summary.matches_folded = aggregation.matches_folded;

        let mut entry = log_entry("scheduler", "run_nightly_batch", "ok");
        entry.detail = Some(format!(
            "date={} pairs={} completed={} failed={} resumed={} deadline_skipped={} reports={}",
            date,
            summary.pairs_planned,
            summary.matches_completed,
            summary.matches_failed,
            summary.pairs_resumed,
            summary.pairs_deadline_skipped,
            summary.reports_generated
        ));
        entry.processing_time_ms = Some(started.elapsed().as_millis() as i64);
        self.db.log(&entry)?;

        tracing::info!(
            "Nightly run for {} finished in {:?}: {} completed, {} failed, {} report(s)",
            date,
            started.elapsed(),
            summary.matches_completed,
            summary.matches_failed,
            summary.reports_generated
        );
        Ok(summary)
    }

    fn load_participants(&self) -> Result<HashMap<String, Participant>> {
        let mut participants = HashMap::new();
        for profile in self.db.list_approved_profiles()? {
            match self.db.get_story(&profile.user_id)? {
                Some(story) => {
                    participants.insert(profile.user_id.clone(), Participant { profile, story });
                }
                None => {
                    tracing::warn!(
                        "Approved user {} has no story; skipping",
                        profile.user_id
                    );
                    let mut entry = log_entry("pairing_engine", "skip_user", "ok");
                    entry.detail = Some(format!("user={} reason=missing_story", profile.user_id));
                    self.db.log(&entry)?;
                }
            }
        }
        Ok(participants)
    }

    async fn process_pairs(
        &self,
        date: NaiveDate,
        pairs: Vec<MatchCandidate>,
        participants: Arc<HashMap<String, Participant>>,
        deadline: Instant,
    ) -> Result<(usize, usize, usize, usize)> {
        let already_done = self.db.completed_units(date, ProgressUnit::Pair)?;
        // A crash between persisting the match and writing the progress
        // marker leaves a row without a marker; both count as done.
        let already_matched = self.db.matched_pairs_for_date(date)?;

        let worker_count = self.config.concurrency.max(1);
        let (jobs_tx, jobs_rx) = flume::bounded::<PairJob>(worker_count);
        let (results_tx, results_rx) = flume::unbounded::<PairResult>();

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let jobs_rx = jobs_rx.clone();
            let results_tx = results_tx.clone();
            let db = self.db.clone();
            let participants = participants.clone();
            let orchestrator = Arc::new(ConversationOrchestrator::new(
                self.capability.clone(),
                self.limiter.clone(),
                self.config.turn_cap,
            ));
            let evaluator = Arc::new(OutcomeEvaluator::new(
                self.capability.clone(),
                self.limiter.clone(),
            ));

            workers.push(tokio::spawn(async move {
                while let Ok(job) = jobs_rx.recv_async().await {
                    let completed = process_one_pair(
                        &db,
                        &orchestrator,
                        &evaluator,
                        &participants,
                        date,
                        &job.candidate,
                    )
                    .await;
                    let _ = results_tx.send(PairResult { completed });
                }
            }));
        }
        drop(jobs_rx);
        drop(results_tx);

        let mut resumed = 0usize;
        let mut deadline_skipped = 0usize;
        for candidate in pairs {
            let normalized = (candidate.user_a.clone(), candidate.user_b.clone());
            if already_done.contains(&candidate.pair_key()) || already_matched.contains(&normalized)
            {
                resumed += 1;
                continue;
            }
            if Instant::now() >= deadline {
                // Past the window: stop dispatching, let in-flight work finish.
                deadline_skipped += 1;
                continue;
            }
            if jobs_tx.send_async(PairJob { candidate }).await.is_err() {
                break;
            }
        }
        drop(jobs_tx);

        let mut completed = 0usize;
        let mut failed = 0usize;
        while let Ok(result) = results_rx.recv_async().await {
            if result.completed {
                completed += 1;
            } else {
                failed += 1;
            }
        }
        for worker in workers {
            let _ = worker.await;
        }

        Ok((completed, failed, resumed, deadline_skipped))
    }
}

/// One unit of nightly work: converse, evaluate, persist, mark progress.
/// Returns whether the conversation completed. Never propagates generation
/// failure upward; a degraded pair becomes a failed match row.
async fn process_one_pair(
    db: &MatchmakerDatabase,
    orchestrator: &ConversationOrchestrator,
    evaluator: &OutcomeEvaluator,
    participants: &HashMap<String, Participant>,
    date: NaiveDate,
    candidate: &MatchCandidate,
) -> bool {
    let started = Instant::now();
    let (a, b) = match (
        participants.get(&candidate.user_a),
        participants.get(&candidate.user_b),
    ) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            tracing::error!(
                "Pair {} references unknown participant; skipping",
                candidate.pair_key()
            );
            return false;
        }
    };

    let dialogue = orchestrator.run_dialogue(a, b).await;
    let conversation_failed = dialogue.status == ConversationStatus::Failed;

    let (outcome, opportunity_score, synergies) = if conversation_failed {
        (None, 0.0, Vec::new())
    } else {
        let evaluation = evaluator.evaluate(&dialogue.transcript).await;
        if let Some(anomaly) = &evaluation.anomaly {
            let mut entry = log_entry("outcome_evaluator", "classify", "anomaly");
            entry.detail = Some(format!("pair={}", candidate.pair_key()));
            entry.error_message = Some(anomaly.clone());
            if let Err(e) = db.log(&entry) {
                tracing::error!("Failed to log classification anomaly: {}", e);
            }
        }
        (
            Some(evaluation.outcome),
            evaluation.score,
            evaluation.synergies,
        )
    };

    let record = MatchRecord {
        id: uuid::Uuid::new_v4().to_string(),
        run_date: date,
        user_a: candidate.user_a.clone(),
        user_b: candidate.user_b.clone(),
        match_type: candidate.match_type,
        compatibility: candidate.compatibility,
        transcript: dialogue.transcript,
        status: dialogue.status,
        outcome,
        opportunity_score,
        synergies,
        reported: false,
        created_at: Utc::now(),
    };

    let persisted = match db.insert_match(&record) {
        Ok(inserted) => {
            if !inserted {
                tracing::warn!(
                    "Match row for {} on {} already exists; keeping the earlier attempt",
                    candidate.pair_key(),
                    date
                );
            }
            true
        }
        Err(e) => {
            tracing::error!("Failed to persist match for {}: {}", candidate.pair_key(), e);
            false
        }
    };

    // A failed conversation stays out of pair history so the pair is
    // eligible to requeue on the next run.
    if persisted && !conversation_failed {
        if let Err(e) = db.record_pair(&candidate.user_a, &candidate.user_b, date) {
            tracing::error!("Failed to record pair history: {}", e);
        }
    }

    if let Err(e) = db.mark_unit_complete(date, ProgressUnit::Pair, &candidate.pair_key()) {
        tracing::error!("Failed to mark pair progress: {}", e);
    }

    let mut entry = log_entry(
        "conversation_orchestrator",
        "process_pair",
        if conversation_failed { "error" } else { "ok" },
    );
    entry.detail = Some(format!("pair={} date={}", candidate.pair_key(), date));
    entry.processing_time_ms = Some(started.elapsed().as_millis() as i64);
    entry.error_message = dialogue.error;
    if let Err(e) = db.log(&entry) {
        tracing::error!("Failed to log pair processing: {}", e);
    }

    !conversation_failed
}
