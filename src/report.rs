use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::NaiveDate;
use serde::Deserialize;

use crate::database::{
    log_entry, AgentInsights, MatchNotification, MatchRecord, MatchType, MatchmakerDatabase,
    ProgressUnit, ReportDraft,
};
use crate::llm::{extract_json_block, GenerationCapability, Message};
use crate::ratelimit::{QuotaBucket, RateLimiter};

#[derive(Debug, Default, Clone)]
pub struct AggregationSummary {
    pub reports_generated: usize,
    pub reports_failed: usize,
    pub matches_folded: usize,
}

#[derive(Debug, Deserialize)]
struct InsightsResponse {
    #[serde(default)]
    patterns_observed: Vec<String>,
    #[serde(default)]
    top_opportunities: Vec<String>,
}

/// Folds newly evaluated matches into one morning report per affected
/// user. Per-user drafts are built on a bounded worker pool (each report
/// needs one generation call), then persisted in a single transaction
/// that also flips each match's `reported` flag. The flag never commits
/// without its report, so an interrupted pass leaves every match
/// claimable for the next run and re-running never double-counts.
#[derive(Clone)]
pub struct ReportAggregator {
    db: Arc<MatchmakerDatabase>,
    capability: Arc<dyn GenerationCapability>,
    limiter: Arc<RateLimiter>,
    concurrency: usize,
}

impl ReportAggregator {
    pub fn new(
        db: Arc<MatchmakerDatabase>,
        capability: Arc<dyn GenerationCapability>,
        limiter: Arc<RateLimiter>,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            capability,
            limiter,
            concurrency: concurrency.max(1),
        }
    }

    /// Aggregate a date's unreported matches into reports. The deadline is
    /// checked before any work starts: a folded match must land in both
    /// participants' reports, so the stage runs whole or not at all.
    pub async fn aggregate(
        &self,
        date: NaiveDate,
        force_regenerate: bool,
        deadline: Instant,
    ) -> Result<AggregationSummary> {
        let started = Instant::now();

        if Instant::now() >= deadline {
            tracing::warn!("Run deadline passed before aggregation for {}; skipping", date);
            return Ok(AggregationSummary::default());
        }

        if force_regenerate {
            let deleted = self.db.delete_reports_for_date(date)?;
            let reset = self.db.reset_reported_for_date(date)?;
            self.db.clear_progress(date, ProgressUnit::Report)?;
            tracing::info!(
                "Force regenerate for {}: deleted {} reports, reset {} matches",
                date,
                deleted,
                reset
            );
        }

        let eligible = self.db.unreported_matches_for_date(date)?;
        if eligible.is_empty() {
            tracing::info!("No unreported matches for {}; aggregation is a no-op", date);
            return Ok(AggregationSummary::default());
        }
        let eligible_ids: HashSet<String> = eligible.iter().map(|r| r.id.clone()).collect();

        let mut by_user: BTreeMap<String, Vec<MatchRecord>> = BTreeMap::new();
        for record in &eligible {
            by_user
                .entry(record.user_a.clone())
                .or_default()
                .push(record.clone());
            by_user
                .entry(record.user_b.clone())
                .or_default()
                .push(record.clone());
        }
        let total_users = by_user.len();

        // Draft phase: build report content off-transaction. Nothing is
        // claimed yet, so a crash or panic here strands nothing.
        let worker_count = self.concurrency.min(total_users);
        let (jobs_tx, jobs_rx) = flume::bounded::<(String, Vec<MatchRecord>)>(worker_count);
        let (results_tx, results_rx) = flume::unbounded::<Option<ReportDraft>>();

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let aggregator = self.clone();
            let jobs_rx = jobs_rx.clone();
            let results_tx = results_tx.clone();
            workers.push(tokio::spawn(async move {
                while let Ok((user_id, records)) = jobs_rx.recv_async().await {
                    let draft = aggregator.process_user(date, user_id, records).await;
                    let _ = results_tx.send(draft);
                }
            }));
        }
        drop(jobs_rx);
        drop(results_tx);

        for job in by_user {
            if jobs_tx.send_async(job).await.is_err() {
                break;
            }
        }
        drop(jobs_tx);

        let mut drafts: Vec<ReportDraft> = Vec::new();
        let mut received = 0usize;
        let mut summary = AggregationSummary::default();
        while let Ok(result) = results_rx.recv_async().await {
            received += 1;
            match result {
                Some(draft) => drafts.push(draft),
                None => summary.reports_failed += 1,
            }
        }
        for worker in workers {
            let _ = worker.await;
        }
        // A worker that panicked never sent its result; its users count
        // as failures and their matches stay unclaimed.
        summary.reports_failed += total_users - received;

        // Commit phase: flip `reported` and write the report rows in one
        // transaction, claiming only matches a surviving draft carries.
        let mut claims: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for draft in &drafts {
            for notification in &draft.notifications {
                if eligible_ids.contains(&notification.match_id)
                    && seen.insert(notification.match_id.as_str())
                {
                    claims.push(notification.match_id.clone());
                }
            }
        }
        if !drafts.is_empty() {
            let outcome = self.db.commit_reports(date, &claims, &drafts, force_regenerate)?;
            summary.reports_generated = outcome.reports_written;
            summary.matches_folded = outcome.matches_claimed;
        }

        let mut entry = log_entry("report_aggregator", "aggregate", "ok");
        entry.detail = Some(format!(
            "date={} reports={} failed={} matches={}",
            date, summary.reports_generated, summary.reports_failed, summary.matches_folded
        ));
        entry.processing_time_ms = Some(started.elapsed().as_millis() as i64);
        self.db.log(&entry)?;

        Ok(summary)
    }

    /// Build one user's draft. Failures degrade to a logged error; the
    /// rest of the batch keeps going.
    async fn process_user(
        &self,
        date: NaiveDate,
        user_id: String,
        mut records: Vec<MatchRecord>,
    ) -> Option<ReportDraft> {
        records.sort_by(|x, y| {
            y.opportunity_score
                .partial_cmp(&x.opportunity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| x.id.cmp(&y.id))
        });

        match self.build_draft(date, &user_id, &records).await {
            Ok(draft) => Some(draft),
            Err(e) => {
                tracing::error!("Report build failed for {} on {}: {}", user_id, date, e);
                let mut entry = log_entry("report_aggregator", "build_report", "error");
                entry.detail = Some(format!("user={} date={}", user_id, date));
                entry.error_message = Some(e.to_string());
                if let Err(log_err) = self.db.log(&entry) {
                    tracing::error!("Failed to log report failure: {}", log_err);
                }
                None
            }
        }
    }

    async fn build_draft(
        &self,
        date: NaiveDate,
        user_id: &str,
        records: &[MatchRecord],
    ) -> Result<ReportDraft> {
        let mut notifications: Vec<MatchNotification> = Vec::new();
        for record in records {
            notifications.push(self.build_notification(user_id, record)?);
        }

        // Incremental mode: fold onto an existing report for the date
        // instead of dropping its earlier notifications.
        if let Some(existing) = self.db.get_report(user_id, date)? {
            for notification in existing.notifications {
                if !notifications
                    .iter()
                    .any(|n| n.match_id == notification.match_id)
                {
                    notifications.push(notification);
                }
            }
            notifications.sort_by(|x, y| {
                y.score
                    .partial_cmp(&x.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| x.match_id.cmp(&y.match_id))
            });
        }

        let insights = self.build_insights(user_id, records).await;
        Ok(ReportDraft {
            user_id: user_id.to_string(),
            notifications,
            insights,
        })
    }

    fn build_notification(&self, user_id: &str, record: &MatchRecord) -> Result<MatchNotification> {
        let counterpart_id = record.counterpart_of(user_id);
        let counterpart_handle = self
            .db
            .get_profile(counterpart_id)?
            .map(|p| p.display_name)
            .unwrap_or_else(|| counterpart_id.to_string());

        let reasoning = if record.synergies.is_empty() {
            format!(
                "{} conversation with {}",
                match_type_label(record.match_type),
                counterpart_handle
            )
        } else {
            format!(
                "{} conversation with {}; synergies: {}",
                match_type_label(record.match_type),
                counterpart_handle,
                record.synergies.join(", ")
            )
        };

        let introduction = format!(
            "Your agent spoke with {}'s agent overnight and rated the opportunity {:.2}. \
             An introduction could be worth your time.",
            counterpart_handle, record.opportunity_score
        );

        Ok(MatchNotification {
            match_id: record.id.clone(),
            counterpart_handle,
            score: record.opportunity_score,
            reasoning,
            introduction,
        })
    }

    /// One generation call per user over the whole match set. Insights are
    /// presentation, not data: a failed call falls back to a deterministic
    /// summary instead of failing the report.
    async fn build_insights(&self, user_id: &str, records: &[MatchRecord]) -> AgentInsights {
        let rendered: String = records
            .iter()
            .map(|r| {
                format!(
                    "- counterpart={} type={} score={:.2} synergies=[{}]\n",
                    r.counterpart_of(user_id),
                    r.match_type.as_db_str(),
                    r.opportunity_score,
                    r.synergies.join(", ")
                )
            })
            .collect();

        let messages = vec![
            Message::system(
                "You summarize a night of agent matchmaking for one user. Respond with JSON \
                 only:\n{\"patterns_observed\": [\"...\"], \"top_opportunities\": [\"...\"]}",
            ),
            Message::user(format!("Tonight's evaluated matches:\n{}", rendered)),
        ];

        self.limiter.acquire(QuotaBucket::Generation).await;
        match self.capability.generate(&messages).await {
            Ok(raw) => match serde_json::from_str::<InsightsResponse>(extract_json_block(&raw)) {
                Ok(parsed) => AgentInsights {
                    patterns_observed: parsed.patterns_observed,
                    top_opportunities: parsed.top_opportunities,
                },
                Err(_) => {
                    tracing::warn!("Insights output unparseable for {}; using fallback", user_id);
                    fallback_insights(user_id, records)
                }
            },
            Err(e) => {
                tracing::warn!("Insights call failed for {}: {}; using fallback", user_id, e);
                fallback_insights(user_id, records)
            }
        }
    }
}

fn match_type_label(match_type: MatchType) -> &'static str {
    match match_type {
        MatchType::Targeted => "Targeted",
        MatchType::Exploratory => "Exploratory",
        MatchType::Serendipitous => "Serendipitous",
    }
}

fn fallback_insights(user_id: &str, records: &[MatchRecord]) -> AgentInsights {
    let mut type_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        *type_counts.entry(record.match_type.as_db_str()).or_default() += 1;
    }
    let patterns_observed = type_counts
        .into_iter()
        .map(|(kind, count)| format!("{} {} conversation(s)", count, kind))
        .collect();

    let top_opportunities = records
        .iter()
        .take(3)
        .map(|r| {
            format!(
                "{} (score {:.2})",
                r.counterpart_of(user_id),
                r.opportunity_score
            )
        })
        .collect();

    AgentInsights {
        patterns_observed,
        top_opportunities,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{
        AgentProfile, CommunicationStyle, ConversationStatus, Outcome, ProfileStatus,
        TranscriptTurn,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::time::Duration;

    struct InsightsCapability;

    #[async_trait]
    impl GenerationCapability for InsightsCapability {
        async fn generate(&self, _messages: &[Message]) -> Result<String> {
            Ok(r#"{"patterns_observed": ["strong infra theme"], "top_opportunities": ["Agent bob"]}"#
                .to_string())
        }

        async fn classify(&self, _messages: &[Message]) -> Result<String> {
            Ok("{}".to_string())
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("nightshift_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    fn seed_profile(db: &MatchmakerDatabase, user_id: &str) {
        db.upsert_profile(&AgentProfile {
            user_id: user_id.to_string(),
            display_name: format!("Agent {}", user_id),
            email: format!("{}@example.com", user_id),
            style: CommunicationStyle::ProfessionalFocused,
            status: ProfileStatus::Approved,
            updated_at: Utc::now(),
        })
        .expect("seed profile");
    }

    fn seed_match(db: &MatchmakerDatabase, id: &str, date: NaiveDate, a: &str, b: &str, score: f64) {
        db.insert_match(&MatchRecord {
            id: id.to_string(),
            run_date: date,
            user_a: a.to_string(),
            user_b: b.to_string(),
            match_type: MatchType::Targeted,
            compatibility: 0.8,
            transcript: vec![TranscriptTurn {
                speaker: a.to_string(),
                content: "Hello.".to_string(),
            }],
            status: ConversationStatus::Completed,
            outcome: Some(Outcome::StrongMatch),
            opportunity_score: score,
            synergies: vec!["infra".to_string()],
            reported: false,
            created_at: Utc::now(),
        })
        .expect("seed match");
    }

    fn aggregator(db: Arc<MatchmakerDatabase>) -> ReportAggregator {
        ReportAggregator::new(
            db,
            Arc::new(InsightsCapability),
            Arc::new(RateLimiter::new(10_000, 10_000)),
            2,
        )
    }

    #[tokio::test]
    async fn each_participant_gets_one_report() {
        let db = Arc::new(MatchmakerDatabase::new(temp_db_path("agg_basic")).expect("db"));
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        seed_profile(&db, "alice");
        seed_profile(&db, "bob");
        seed_match(&db, "m1", date, "alice", "bob", 0.75);

        let summary = aggregator(db.clone())
            .aggregate(date, false, far_deadline())
            .await
            .expect("aggregate");
        assert_eq!(summary.reports_generated, 2);
        assert_eq!(summary.matches_folded, 1);

        for user in ["alice", "bob"] {
            let report = db.get_report(user, date).expect("get").expect("present");
            assert_eq!(report.notification_count, 1);
            assert!((report.total_opportunity_score - 0.75).abs() < 1e-9);
            assert_eq!(report.notifications[0].match_id, "m1");
            assert_eq!(report.insights.patterns_observed, vec!["strong infra theme"]);
            assert!(!report.email_sent);
        }

        let stored = db.get_match("m1").expect("get").expect("present");
        assert!(stored.reported);
    }

    #[tokio::test]
    async fn rerun_without_force_is_a_no_op() {
        let db = Arc::new(MatchmakerDatabase::new(temp_db_path("agg_idem")).expect("db"));
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        seed_profile(&db, "alice");
        seed_profile(&db, "bob");
        seed_match(&db, "m1", date, "alice", "bob", 0.75);

        let agg = aggregator(db.clone());
        agg.aggregate(date, false, far_deadline()).await.expect("first");
        let second = agg.aggregate(date, false, far_deadline()).await.expect("second");
        assert_eq!(second.reports_generated, 0);
        assert_eq!(second.matches_folded, 0);

        let report = db.get_report("alice", date).expect("get").expect("present");
        assert_eq!(report.notification_count, 1);
    }

    #[tokio::test]
    async fn new_matches_fold_into_existing_report() {
        let db = Arc::new(MatchmakerDatabase::new(temp_db_path("agg_fold")).expect("db"));
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        for user in ["alice", "bob", "carol"] {
            seed_profile(&db, user);
        }
        seed_match(&db, "m1", date, "alice", "bob", 0.9);

        let agg = aggregator(db.clone());
        agg.aggregate(date, false, far_deadline()).await.expect("first");

        seed_match(&db, "m2", date, "alice", "carol", 0.5);
        agg.aggregate(date, false, far_deadline()).await.expect("second");

        let report = db.get_report("alice", date).expect("get").expect("present");
        assert_eq!(report.notification_count, 2);
        // Ranked by score descending.
        assert_eq!(report.notifications[0].match_id, "m1");
        assert_eq!(report.notifications[1].match_id, "m2");
        assert!((report.total_opportunity_score - 1.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn force_regenerate_rebuilds_and_resets_delivery() {
        let db = Arc::new(MatchmakerDatabase::new(temp_db_path("agg_force")).expect("db"));
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        seed_profile(&db, "alice");
        seed_profile(&db, "bob");
        seed_match(&db, "m1", date, "alice", "bob", 0.75);

        let agg = aggregator(db.clone());
        agg.aggregate(date, false, far_deadline()).await.expect("first");
        let report = db.get_report("alice", date).expect("get").expect("present");
        db.mark_email_sent(&report.id, false).expect("send");

        let summary = agg.aggregate(date, true, far_deadline()).await.expect("forced");
        assert_eq!(summary.reports_generated, 2);
        assert_eq!(summary.matches_folded, 1);

        let rebuilt = db.get_report("alice", date).expect("get").expect("present");
        assert_eq!(rebuilt.notification_count, 1);
        assert!(!rebuilt.email_sent);
    }

    #[tokio::test]
    async fn expired_deadline_defers_aggregation_without_claiming() {
        let db = Arc::new(MatchmakerDatabase::new(temp_db_path("agg_deadline")).expect("db"));
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        seed_profile(&db, "alice");
        seed_profile(&db, "bob");
        seed_match(&db, "m1", date, "alice", "bob", 0.75);

        let summary = aggregator(db.clone())
            .aggregate(date, false, Instant::now())
            .await
            .expect("aggregate");
        assert_eq!(summary.reports_generated, 0);

        // The match stays unclaimed for the next run.
        let stored = db.get_match("m1").expect("get").expect("present");
        assert!(!stored.reported);
        assert!(db.get_report("alice", date).expect("get").is_none());
    }

    struct PanickingCapability;

    #[async_trait]
    impl GenerationCapability for PanickingCapability {
        async fn generate(&self, _messages: &[Message]) -> Result<String> {
            panic!("insights generation blew up");
        }

        async fn classify(&self, _messages: &[Message]) -> Result<String> {
            Ok("{}".to_string())
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn interrupted_aggregation_leaves_matches_claimable() {
        let db = Arc::new(MatchmakerDatabase::new(temp_db_path("agg_interrupt")).expect("db"));
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        seed_profile(&db, "alice");
        seed_profile(&db, "bob");
        seed_match(&db, "m1", date, "alice", "bob", 0.75);

        let failing = ReportAggregator::new(
            db.clone(),
            Arc::new(PanickingCapability),
            Arc::new(RateLimiter::new(10_000, 10_000)),
            2,
        );
        let summary = failing
            .aggregate(date, false, far_deadline())
            .await
            .expect("aggregate");
        assert_eq!(summary.reports_generated, 0);
        assert_eq!(summary.reports_failed, 2);
        assert_eq!(summary.matches_folded, 0);

        // No claim without a report: the match is still reportable and
        // neither participant holds a half-written row.
        let stored = db.get_match("m1").expect("get").expect("present");
        assert!(!stored.reported);
        assert!(db.get_report("alice", date).expect("get").is_none());
        assert!(db.get_report("bob", date).expect("get").is_none());

        // The next pass picks the match up cleanly.
        let summary = aggregator(db.clone())
            .aggregate(date, false, far_deadline())
            .await
            .expect("retry");
        assert_eq!(summary.reports_generated, 2);
        assert_eq!(summary.matches_folded, 1);
        let stored = db.get_match("m1").expect("get").expect("present");
        assert!(stored.reported);
    }

    struct NoisyInsightsCapability;

    #[async_trait]
    impl GenerationCapability for NoisyInsightsCapability {
        async fn generate(&self, _messages: &[Message]) -> Result<String> {
            Ok("patterns} observed {incomplete".to_string())
        }

        async fn classify(&self, _messages: &[Message]) -> Result<String> {
            Ok("{}".to_string())
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn malformed_insights_fall_back_without_losing_the_match() {
        let db = Arc::new(MatchmakerDatabase::new(temp_db_path("agg_noisy")).expect("db"));
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        seed_profile(&db, "alice");
        seed_profile(&db, "bob");
        seed_match(&db, "m1", date, "alice", "bob", 0.75);

        let noisy = ReportAggregator::new(
            db.clone(),
            Arc::new(NoisyInsightsCapability),
            Arc::new(RateLimiter::new(10_000, 10_000)),
            2,
        );
        let summary = noisy
            .aggregate(date, false, far_deadline())
            .await
            .expect("aggregate");
        assert_eq!(summary.reports_generated, 2);
        assert_eq!(summary.reports_failed, 0);

        let report = db.get_report("alice", date).expect("get").expect("present");
        assert_eq!(report.notifications[0].match_id, "m1");
        assert_eq!(
            report.insights.patterns_observed,
            vec!["1 targeted conversation(s)"]
        );
    }
}
