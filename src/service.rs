use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;

use crate::config::PipelineConfig;
use crate::database::{
    AgentProfile, AnalyticsSummary, LogFilter, MatchRecord, MatchmakerDatabase, MorningReport,
    PersonalStory, ProcessingLogEntry, ReportFilter,
};
use crate::email::{DispatchSummary, EmailTransport, HttpEmailTransport, NotificationDispatcher, SendOptions};
use crate::llm::{GenerationCapability, LlmClient};
use crate::ratelimit::RateLimiter;
use crate::scheduler::{BatchOptions, BatchScheduler, BatchSummary};

/// Single entry point for everything callers do with the matchmaker:
/// the nightly batch, delivery, and the read surface. Owns the shared
/// database handle, rate limiter, and external clients.
pub struct MatchmakerService {
    config: PipelineConfig,
    db: Arc<MatchmakerDatabase>,
    limiter: Arc<RateLimiter>,
    capability: Arc<dyn GenerationCapability>,
    transport: Arc<dyn EmailTransport>,
}

impl MatchmakerService {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let db = Arc::new(MatchmakerDatabase::new(&config.database_path)?);
        let capability = Arc::new(LlmClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            config.classify_model.clone(),
            config.max_attempts,
            Duration::from_millis(config.retry_base_ms),
        ));
        let transport = Arc::new(HttpEmailTransport::new(
            config.email_api_url.clone(),
            config.email_api_key.clone(),
            config.email_from.clone(),
        ));
        Ok(Self::with_components(config, db, capability, transport))
    }

    /// Wire in replacement capability and transport. Used by tests and
    /// by callers embedding the pipeline behind their own clients.
    pub fn with_components(
        config: PipelineConfig,
        db: Arc<MatchmakerDatabase>,
        capability: Arc<dyn GenerationCapability>,
        transport: Arc<dyn EmailTransport>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.generation_per_minute,
            config.email_per_minute,
        ));
        Self {
            config,
            db,
            limiter,
            capability,
            transport,
        }
    }

    pub fn database(&self) -> &Arc<MatchmakerDatabase> {
        &self.db
    }

    pub async fn run_nightly_batch(
        &self,
        date: NaiveDate,
        options: &BatchOptions,
    ) -> Result<BatchSummary> {
        let scheduler = BatchScheduler::new(
            self.db.clone(),
            self.capability.clone(),
            self.limiter.clone(),
            self.config.clone(),
        );
        scheduler.run_nightly_batch(date, options).await
    }

    pub async fn send_morning_report_emails(
        &self,
        date: NaiveDate,
        options: &SendOptions,
    ) -> Result<DispatchSummary> {
        let dispatcher = NotificationDispatcher::new(
            self.db.clone(),
            self.transport.clone(),
            self.limiter.clone(),
        );
        dispatcher.dispatch(date, options).await
    }

    pub fn get_morning_reports(&self, filter: &ReportFilter) -> Result<Vec<MorningReport>> {
        self.db.get_morning_reports(filter)
    }

    pub fn get_matches_for_date(&self, date: NaiveDate) -> Result<Vec<MatchRecord>> {
        self.db.list_matches_for_date(date)
    }

    pub fn get_analytics(&self, from: NaiveDate, to: NaiveDate) -> Result<AnalyticsSummary> {
        self.db.analytics(from, to)
    }

    pub fn get_processing_logs(&self, filter: &LogFilter) -> Result<Vec<ProcessingLogEntry>> {
        self.db.get_processing_logs(filter)
    }

    pub fn upsert_profile(&self, profile: &AgentProfile) -> Result<()> {
        self.db.upsert_profile(profile)
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<AgentProfile>> {
        self.db.get_profile(user_id)
    }

    pub fn upsert_story(&self, story: &PersonalStory) -> Result<()> {
        self.db.upsert_story(story)
    }

    pub fn get_story(&self, user_id: &str) -> Result<Option<PersonalStory>> {
        self.db.get_story(user_id)
    }
}
