use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// Communication style the external profile flow assigns to an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationStyle {
    ProfessionalFocused,
    WarmConversational,
    DirectEfficient,
}

impl CommunicationStyle {
    fn as_db_str(self) -> &'static str {
        match self {
            CommunicationStyle::ProfessionalFocused => "professional_focused",
            CommunicationStyle::WarmConversational => "warm_conversational",
            CommunicationStyle::DirectEfficient => "direct_efficient",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "warm_conversational" => CommunicationStyle::WarmConversational,
            "direct_efficient" => CommunicationStyle::DirectEfficient,
            _ => CommunicationStyle::ProfessionalFocused,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Pending,
    Approved,
    Rejected,
}

impl ProfileStatus {
    fn as_db_str(self) -> &'static str {
        match self {
            ProfileStatus::Pending => "pending",
            ProfileStatus::Approved => "approved",
            ProfileStatus::Rejected => "rejected",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approved" => ProfileStatus::Approved,
            "rejected" => ProfileStatus::Rejected,
            _ => ProfileStatus::Pending,
        }
    }
}

/// One agent profile per user. Owned by the external profile-edit flow;
/// the pipeline reads it and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub user_id: String,
    pub display_name: String,
    pub email: String,
    pub style: CommunicationStyle,
    pub status: ProfileStatus,
    pub updated_at: DateTime<Utc>,
}

/// The "professional essence" produced by the external onboarding flow.
/// At most one current story per user; upserts replace wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalStory {
    pub user_id: String,
    pub narrative: String,
    pub current_focus: Vec<String>,
    pub seeking_connections: Vec<String>,
    pub offering_expertise: Vec<String>,
    /// Whether the narrative may be shown to a counterpart's agent.
    /// Structured fields are always shareable; the free-text narrative
    /// is only exposed when this is set.
    pub shareable: bool,
    pub updated_at: DateTime<Utc>,
}

impl PersonalStory {
    /// A story with no structured fields cannot be scored or grounded;
    /// such users sit out the nightly run.
    pub fn is_empty(&self) -> bool {
        self.current_focus.is_empty()
            && self.seeking_connections.is_empty()
            && self.offering_expertise.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Targeted,
    Exploratory,
    Serendipitous,
}

impl MatchType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MatchType::Targeted => "targeted",
            MatchType::Exploratory => "exploratory",
            MatchType::Serendipitous => "serendipitous",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "targeted" => MatchType::Targeted,
            "exploratory" => MatchType::Exploratory,
            _ => MatchType::Serendipitous,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    StrongMatch,
    ExploratoryValue,
    FuturePotential,
    NoMatch,
}

impl Outcome {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Outcome::StrongMatch => "strong_match",
            Outcome::ExploratoryValue => "exploratory_value",
            Outcome::FuturePotential => "future_potential",
            Outcome::NoMatch => "no_match",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strong_match" => Outcome::StrongMatch,
            "exploratory_value" => Outcome::ExploratoryValue,
            "future_potential" => Outcome::FuturePotential,
            _ => Outcome::NoMatch,
        }
    }

    /// Parse a classification label from model output. Accepts the
    /// canonical snake_case form and the shouty wire form.
    pub fn parse_label(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strong_match" => Some(Outcome::StrongMatch),
            "exploratory_value" => Some(Outcome::ExploratoryValue),
            "future_potential" => Some(Outcome::FuturePotential),
            "no_match" => Some(Outcome::NoMatch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Completed,
    Failed,
}

impl ConversationStatus {
    fn as_db_str(self) -> &'static str {
        match self {
            ConversationStatus::Completed => "completed",
            ConversationStatus::Failed => "failed",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "failed" => ConversationStatus::Failed,
            _ => ConversationStatus::Completed,
        }
    }
}

/// One line of a simulated dialogue. `speaker` is the user id whose
/// agent produced the line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptTurn {
    pub speaker: String,
    pub content: String,
}

/// Durable record of one simulated dialogue between two agents.
/// Immutable after evaluation except for the `reported` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: String,
    pub run_date: NaiveDate,
    pub user_a: String,
    pub user_b: String,
    pub match_type: MatchType,
    pub compatibility: f64,
    pub transcript: Vec<TranscriptTurn>,
    pub status: ConversationStatus,
    pub outcome: Option<Outcome>,
    pub opportunity_score: f64,
    pub synergies: Vec<String>,
    pub reported: bool,
    pub created_at: DateTime<Utc>,
}

impl MatchRecord {
    pub fn counterpart_of(&self, user_id: &str) -> &str {
        if self.user_a == user_id {
            &self.user_b
        } else {
            &self.user_a
        }
    }
}

/// One entry of a morning report, pointing back at the match it explains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchNotification {
    pub match_id: String,
    pub counterpart_handle: String,
    pub score: f64,
    pub reasoning: String,
    pub introduction: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInsights {
    pub patterns_observed: Vec<String>,
    pub top_opportunities: Vec<String>,
}

/// The per-user daily digest. Created by the aggregator; only the
/// dispatcher flips `email_sent`/`sent_at` afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MorningReport {
    pub id: String,
    pub user_id: String,
    pub report_date: NaiveDate,
    pub notification_count: usize,
    pub total_opportunity_score: f64,
    pub notifications: Vec<MatchNotification>,
    pub insights: AgentInsights,
    pub email_sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One user's report content built off-transaction by the aggregator,
/// handed to `commit_reports` to persist alongside the `reported` flips.
#[derive(Debug, Clone)]
pub struct ReportDraft {
    pub user_id: String,
    pub notifications: Vec<MatchNotification>,
    pub insights: AgentInsights,
}

#[derive(Debug, Clone, Default)]
pub struct ReportCommitOutcome {
    pub reports_written: usize,
    pub matches_claimed: usize,
}

/// Append-only audit trail entry. Every pipeline stage writes these;
/// nothing ever updates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub id: String,
    pub process_type: String,
    pub action: String,
    pub status: String,
    pub detail: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub tokens_used: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Resume granularity for a nightly run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUnit {
    Pair,
    Report,
}

impl ProgressUnit {
    fn as_db_str(self) -> &'static str {
        match self {
            ProgressUnit::Pair => "pair",
            ProgressUnit::Report => "report",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub user_id: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub process_type: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// Operational aggregates for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    pub total_matches: u64,
    pub matches_failed: u64,
    pub matches_reported: u64,
    pub reports_generated: u64,
    pub emails_sent: u64,
    /// Fraction of completed matches that made it into a report.
    pub conversion_rate: f64,
    pub avg_processing_time_ms: f64,
    /// Fraction of processing-log entries with status "error".
    pub error_rate: f64,
    /// Reportable matches not yet folded into any report.
    pub backlog_size: u64,
}

/// How old a run lock may get before a new invocation is allowed to
/// take it over (covers crashed runs that never released).
const RUN_LOCK_STALE_HOURS: i64 = 24;

pub struct MatchmakerDatabase {
    conn: Mutex<Connection>,
}

impl MatchmakerDatabase {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agent_profiles (
                user_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                email TEXT NOT NULL,
                style TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS personal_stories (
                user_id TEXT PRIMARY KEY,
                narrative TEXT NOT NULL,
                current_focus_json TEXT NOT NULL,
                seeking_connections_json TEXT NOT NULL,
                offering_expertise_json TEXT NOT NULL,
                shareable INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS matches (
                id TEXT PRIMARY KEY,
                run_date TEXT NOT NULL,
                user_a TEXT NOT NULL,
                user_b TEXT NOT NULL,
                match_type TEXT NOT NULL,
                compatibility REAL NOT NULL,
                transcript_json TEXT NOT NULL,
                status TEXT NOT NULL,
                outcome TEXT,
                opportunity_score REAL NOT NULL DEFAULT 0.0,
                synergies_json TEXT NOT NULL,
                reported INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(run_date, user_a, user_b)
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_matches_run_date ON matches(run_date)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_matches_reported ON matches(reported)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS morning_reports (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                report_date TEXT NOT NULL,
                notification_count INTEGER NOT NULL,
                total_opportunity_score REAL NOT NULL,
                notifications_json TEXT NOT NULL,
                insights_json TEXT NOT NULL,
                email_sent INTEGER NOT NULL DEFAULT 0,
                sent_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, report_date)
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_morning_reports_date ON morning_reports(report_date)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS processing_log (
                id TEXT PRIMARY KEY,
                process_type TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                processing_time_ms INTEGER,
                tokens_used INTEGER,
                error_message TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_processing_log_created_at ON processing_log(created_at DESC)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS run_locks (
                run_date TEXT PRIMARY KEY,
                acquired_at TEXT NOT NULL,
                released INTEGER NOT NULL DEFAULT 0
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS run_progress (
                run_date TEXT NOT NULL,
                unit_kind TEXT NOT NULL,
                unit_key TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                PRIMARY KEY (run_date, unit_kind, unit_key)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS pair_history (
                user_a TEXT NOT NULL,
                user_b TEXT NOT NULL,
                run_date TEXT NOT NULL,
                PRIMARY KEY (user_a, user_b, run_date)
            )"#,
            [],
        )?;

        Ok(())
    }

    // === Profiles and stories (written by external flows, read by the core) ===

    pub fn upsert_profile(&self, profile: &AgentProfile) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT INTO agent_profiles (user_id, display_name, email, style, status, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)
               ON CONFLICT(user_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   email = excluded.email,
                   style = excluded.style,
                   status = excluded.status,
                   updated_at = excluded.updated_at"#,
            params![
                profile.user_id,
                profile.display_name,
                profile.email,
                profile.style.as_db_str(),
                profile.status.as_db_str(),
                profile.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<AgentProfile>> {
        let conn = self.lock_conn()?;
        let profile = conn
            .query_row(
                "SELECT user_id, display_name, email, style, status, updated_at
                 FROM agent_profiles WHERE user_id = ?1",
                [user_id],
                Self::row_to_profile,
            )
            .optional()?;
        Ok(profile)
    }

    pub fn list_approved_profiles(&self) -> Result<Vec<AgentProfile>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, display_name, email, style, status, updated_at
             FROM agent_profiles WHERE status = 'approved' ORDER BY user_id",
        )?;
        let profiles = stmt
            .query_map([], Self::row_to_profile)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(profiles)
    }

    fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentProfile> {
        Ok(AgentProfile {
            user_id: row.get(0)?,
            display_name: row.get(1)?,
            email: row.get(2)?,
            style: CommunicationStyle::from_db(&row.get::<_, String>(3)?),
            status: ProfileStatus::from_db(&row.get::<_, String>(4)?),
            updated_at: parse_datetime(&row.get::<_, String>(5)?),
        })
    }

    /// Replace a user's story wholesale. Updates never merge silently.
    pub fn upsert_story(&self, story: &PersonalStory) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT INTO personal_stories
               (user_id, narrative, current_focus_json, seeking_connections_json,
                offering_expertise_json, shareable, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
               ON CONFLICT(user_id) DO UPDATE SET
                   narrative = excluded.narrative,
                   current_focus_json = excluded.current_focus_json,
                   seeking_connections_json = excluded.seeking_connections_json,
                   offering_expertise_json = excluded.offering_expertise_json,
                   shareable = excluded.shareable,
                   updated_at = excluded.updated_at"#,
            params![
                story.user_id,
                story.narrative,
                serde_json::to_string(&story.current_focus)?,
                serde_json::to_string(&story.seeking_connections)?,
                serde_json::to_string(&story.offering_expertise)?,
                story.shareable as i64,
                story.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_story(&self, user_id: &str) -> Result<Option<PersonalStory>> {
        let conn = self.lock_conn()?;
        let story = conn
            .query_row(
                "SELECT user_id, narrative, current_focus_json, seeking_connections_json,
                        offering_expertise_json, shareable, updated_at
                 FROM personal_stories WHERE user_id = ?1",
                [user_id],
                Self::row_to_story,
            )
            .optional()?;
        Ok(story)
    }

    pub fn list_stories(&self) -> Result<Vec<PersonalStory>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, narrative, current_focus_json, seeking_connections_json,
                    offering_expertise_json, shareable, updated_at
             FROM personal_stories ORDER BY user_id",
        )?;
        let stories = stmt
            .query_map([], Self::row_to_story)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stories)
    }

    fn row_to_story(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersonalStory> {
        Ok(PersonalStory {
            user_id: row.get(0)?,
            narrative: row.get(1)?,
            current_focus: parse_json_list(&row.get::<_, String>(2)?),
            seeking_connections: parse_json_list(&row.get::<_, String>(3)?),
            offering_expertise: parse_json_list(&row.get::<_, String>(4)?),
            shareable: row.get::<_, i64>(5)? != 0,
            updated_at: parse_datetime(&row.get::<_, String>(6)?),
        })
    }

    // === Matches ===

    /// Insert a match row. A resumed run racing a still-running prior
    /// attempt may try the same (date, pair) twice; the unique index plus
    /// OR IGNORE makes the second write a no-op. Returns false when the
    /// row already existed.
    pub fn insert_match(&self, record: &MatchRecord) -> Result<bool> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO matches
               (id, run_date, user_a, user_b, match_type, compatibility, transcript_json,
                status, outcome, opportunity_score, synergies_json, reported, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
            params![
                record.id,
                record.run_date.to_string(),
                record.user_a,
                record.user_b,
                record.match_type.as_db_str(),
                record.compatibility,
                serde_json::to_string(&record.transcript)?,
                record.status.as_db_str(),
                record.outcome.map(|o| o.as_db_str()),
                record.opportunity_score,
                serde_json::to_string(&record.synergies)?,
                record.reported as i64,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get_match(&self, id: &str) -> Result<Option<MatchRecord>> {
        let conn = self.lock_conn()?;
        let record = conn
            .query_row(
                &format!("{} WHERE id = ?1", Self::SELECT_MATCH),
                [id],
                Self::row_to_match,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_matches_for_date(&self, date: NaiveDate) -> Result<Vec<MatchRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE run_date = ?1 ORDER BY created_at",
            Self::SELECT_MATCH
        ))?;
        let records = stmt
            .query_map([date.to_string()], Self::row_to_match)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Matches eligible for reporting: evaluated, completed, above the
    /// no-match floor, not yet folded into any report.
    pub fn unreported_matches_for_date(&self, date: NaiveDate) -> Result<Vec<MatchRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE run_date = ?1 AND reported = 0 AND status = 'completed'
                 AND outcome IS NOT NULL AND outcome != 'no_match'
             ORDER BY opportunity_score DESC, id",
            Self::SELECT_MATCH
        ))?;
        let records = stmt
            .query_map([date.to_string()], Self::row_to_match)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Force-regenerate support: make the date's matches reportable again.
    pub fn reset_reported_for_date(&self, date: NaiveDate) -> Result<usize> {
        let conn = self.lock_conn()?;
        let reset = conn.execute(
            "UPDATE matches SET reported = 0 WHERE run_date = ?1",
            [date.to_string()],
        )?;
        Ok(reset)
    }

    /// Pairs that already hold a match row for the date (used to skip
    /// re-conversing on resume).
    pub fn matched_pairs_for_date(&self, date: NaiveDate) -> Result<HashSet<(String, String)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT user_a, user_b FROM matches WHERE run_date = ?1")?;
        let pairs = stmt
            .query_map([date.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(pairs)
    }

    const SELECT_MATCH: &'static str =
        "SELECT id, run_date, user_a, user_b, match_type, compatibility, transcript_json,
                status, outcome, opportunity_score, synergies_json, reported, created_at
         FROM matches";

    fn row_to_match(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatchRecord> {
        Ok(MatchRecord {
            id: row.get(0)?,
            run_date: parse_date(&row.get::<_, String>(1)?),
            user_a: row.get(2)?,
            user_b: row.get(3)?,
            match_type: MatchType::from_db(&row.get::<_, String>(4)?),
            compatibility: row.get(5)?,
            transcript: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
            status: ConversationStatus::from_db(&row.get::<_, String>(7)?),
            outcome: row
                .get::<_, Option<String>>(8)?
                .map(|raw| Outcome::from_db(&raw)),
            opportunity_score: row.get(9)?,
            synergies: parse_json_list(&row.get::<_, String>(10)?),
            reported: row.get::<_, i64>(11)? != 0,
            created_at: parse_datetime(&row.get::<_, String>(12)?),
        })
    }

    // === Morning reports ===

    /// Insert or replace the report for (user, date). Replacement keeps
    /// the existing delivery state unless `reset_delivery` is set (the
    /// force-regenerate path).
    pub fn upsert_report(&self, report: &MorningReport, reset_delivery: bool) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::upsert_report_conn(&conn, report, reset_delivery)
    }

    fn upsert_report_conn(
        conn: &Connection,
        report: &MorningReport,
        reset_delivery: bool,
    ) -> Result<()> {
        let existing: Option<(String, i64, Option<String>)> = conn
            .query_row(
                "SELECT id, email_sent, sent_at FROM morning_reports
                 WHERE user_id = ?1 AND report_date = ?2",
                params![report.user_id, report.report_date.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (id, email_sent, sent_at) = match existing {
            Some((id, sent, sent_at)) if !reset_delivery => (id, sent, sent_at),
            Some((id, _, _)) => (id, 0, None),
            None => (
                report.id.clone(),
                report.email_sent as i64,
                report.sent_at.map(|t| t.to_rfc3339()),
            ),
        };

        conn.execute(
            r#"INSERT INTO morning_reports
               (id, user_id, report_date, notification_count, total_opportunity_score,
                notifications_json, insights_json, email_sent, sent_at, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
               ON CONFLICT(user_id, report_date) DO UPDATE SET
                   notification_count = excluded.notification_count,
                   total_opportunity_score = excluded.total_opportunity_score,
                   notifications_json = excluded.notifications_json,
                   insights_json = excluded.insights_json,
                   email_sent = excluded.email_sent,
                   sent_at = excluded.sent_at"#,
            params![
                id,
                report.user_id,
                report.report_date.to_string(),
                report.notification_count as i64,
                report.total_opportunity_score,
                serde_json::to_string(&report.notifications)?,
                serde_json::to_string(&report.insights)?,
                email_sent,
                sent_at,
                report.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Persist an aggregation pass in one transaction: flip `reported` for
    /// the claimed matches and write the report rows together, so a claim
    /// can never outlive its report. A claim that loses the conditional
    /// update (a racing prior pass got there first) drops out of every
    /// draft before the rows are written.
    pub fn commit_reports(
        &self,
        date: NaiveDate,
        claims: &[String],
        drafts: &[ReportDraft],
        reset_delivery: bool,
    ) -> Result<ReportCommitOutcome> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let mut lost: HashSet<&str> = HashSet::new();
        for match_id in claims {
            let updated = tx.execute(
                "UPDATE matches SET reported = 1 WHERE id = ?1 AND reported = 0",
                [match_id],
            )?;
            if updated == 0 {
                lost.insert(match_id.as_str());
            }
        }

        let mut outcome = ReportCommitOutcome {
            matches_claimed: claims.len() - lost.len(),
            ..Default::default()
        };

        for draft in drafts {
            let notifications: Vec<MatchNotification> = draft
                .notifications
                .iter()
                .filter(|n| !lost.contains(n.match_id.as_str()))
                .cloned()
                .collect();
            if notifications.is_empty() {
                continue;
            }

            let report = MorningReport {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: draft.user_id.clone(),
                report_date: date,
                notification_count: notifications.len(),
                total_opportunity_score: notifications.iter().map(|n| n.score).sum(),
                notifications,
                insights: draft.insights.clone(),
                email_sent: false,
                sent_at: None,
                created_at: Utc::now(),
            };
            Self::upsert_report_conn(&tx, &report, reset_delivery)?;
            tx.execute(
                "INSERT OR IGNORE INTO run_progress (run_date, unit_kind, unit_key, completed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    date.to_string(),
                    ProgressUnit::Report.as_db_str(),
                    draft.user_id,
                    Utc::now().to_rfc3339()
                ],
            )?;
            outcome.reports_written += 1;
        }

        tx.commit()?;
        Ok(outcome)
    }

    pub fn get_report(&self, user_id: &str, date: NaiveDate) -> Result<Option<MorningReport>> {
        let conn = self.lock_conn()?;
        let report = conn
            .query_row(
                &format!(
                    "{} WHERE user_id = ?1 AND report_date = ?2",
                    Self::SELECT_REPORT
                ),
                params![user_id, date.to_string()],
                Self::row_to_report,
            )
            .optional()?;
        Ok(report)
    }

    pub fn delete_reports_for_date(&self, date: NaiveDate) -> Result<usize> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM morning_reports WHERE report_date = ?1",
            [date.to_string()],
        )?;
        Ok(deleted)
    }

    pub fn get_morning_reports(&self, filter: &ReportFilter) -> Result<Vec<MorningReport>> {
        let conn = self.lock_conn()?;
        let mut sql = format!("{} WHERE 1=1", Self::SELECT_REPORT);
        let mut args: Vec<String> = Vec::new();
        if let Some(user_id) = &filter.user_id {
            args.push(user_id.clone());
            sql.push_str(&format!(" AND user_id = ?{}", args.len()));
        }
        if let Some(from) = filter.date_from {
            args.push(from.to_string());
            sql.push_str(&format!(" AND report_date >= ?{}", args.len()));
        }
        if let Some(to) = filter.date_to {
            args.push(to.to_string());
            sql.push_str(&format!(" AND report_date <= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY report_date DESC, user_id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn.prepare(&sql)?;
        let reports = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), Self::row_to_report)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(reports)
    }

    /// Reports the dispatcher should attempt for a date.
    pub fn reports_to_send(&self, date: NaiveDate, force_resend: bool) -> Result<Vec<MorningReport>> {
        let conn = self.lock_conn()?;
        let sql = if force_resend {
            format!(
                "{} WHERE report_date = ?1 ORDER BY user_id",
                Self::SELECT_REPORT
            )
        } else {
            format!(
                "{} WHERE report_date = ?1 AND email_sent = 0 ORDER BY user_id",
                Self::SELECT_REPORT
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let reports = stmt
            .query_map([date.to_string()], Self::row_to_report)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(reports)
    }

    /// Conditional delivery flip; with `force` the flag may already be
    /// set and only `sent_at` advances.
    pub fn mark_email_sent(&self, report_id: &str, force: bool) -> Result<bool> {
        let conn = self.lock_conn()?;
        let now = Utc::now().to_rfc3339();
        let updated = if force {
            conn.execute(
                "UPDATE morning_reports SET email_sent = 1, sent_at = ?2 WHERE id = ?1",
                params![report_id, now],
            )?
        } else {
            conn.execute(
                "UPDATE morning_reports SET email_sent = 1, sent_at = ?2
                 WHERE id = ?1 AND email_sent = 0",
                params![report_id, now],
            )?
        };
        Ok(updated == 1)
    }

    const SELECT_REPORT: &'static str =
        "SELECT id, user_id, report_date, notification_count, total_opportunity_score,
                notifications_json, insights_json, email_sent, sent_at, created_at
         FROM morning_reports";

    fn row_to_report(row: &rusqlite::Row<'_>) -> rusqlite::Result<MorningReport> {
        Ok(MorningReport {
            id: row.get(0)?,
            user_id: row.get(1)?,
            report_date: parse_date(&row.get::<_, String>(2)?),
            notification_count: row.get::<_, i64>(3)? as usize,
            total_opportunity_score: row.get(4)?,
            notifications: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
            insights: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
            email_sent: row.get::<_, i64>(7)? != 0,
            sent_at: row
                .get::<_, Option<String>>(8)?
                .map(|raw| parse_datetime(&raw)),
            created_at: parse_datetime(&row.get::<_, String>(9)?),
        })
    }

    // === Processing log ===

    pub fn log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT INTO processing_log
               (id, process_type, action, status, detail, processing_time_ms,
                tokens_used, error_message, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                entry.id,
                entry.process_type,
                entry.action,
                entry.status,
                entry.detail,
                entry.processing_time_ms,
                entry.tokens_used,
                entry.error_message,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_processing_logs(&self, filter: &LogFilter) -> Result<Vec<ProcessingLogEntry>> {
        let conn = self.lock_conn()?;
        let mut sql = String::from(
            "SELECT id, process_type, action, status, detail, processing_time_ms,
                    tokens_used, error_message, created_at
             FROM processing_log WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(process_type) = &filter.process_type {
            args.push(process_type.clone());
            sql.push_str(&format!(" AND process_type = ?{}", args.len()));
        }
        if let Some(status) = &filter.status {
            args.push(status.clone());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC");
        sql.push_str(&format!(" LIMIT {}", filter.limit.unwrap_or(200)));

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok(ProcessingLogEntry {
                    id: row.get(0)?,
                    process_type: row.get(1)?,
                    action: row.get(2)?,
                    status: row.get(3)?,
                    detail: row.get(4)?,
                    processing_time_ms: row.get(5)?,
                    tokens_used: row.get(6)?,
                    error_message: row.get(7)?,
                    created_at: parse_datetime(&row.get::<_, String>(8)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // === Run locks and progress markers ===

    /// Acquire the run-level lock for a date. Returns false when another
    /// invocation holds it. A lock left behind by a crashed run is taken
    /// over once it is older than `RUN_LOCK_STALE_HOURS`.
    pub fn acquire_run_lock(&self, date: NaiveDate) -> Result<bool> {
        let conn = self.lock_conn()?;
        let now = Utc::now();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO run_locks (run_date, acquired_at, released)
             VALUES (?1, ?2, 0)",
            params![date.to_string(), now.to_rfc3339()],
        )?;
        if inserted == 1 {
            return Ok(true);
        }

        let (acquired_at, released): (String, i64) = conn.query_row(
            "SELECT acquired_at, released FROM run_locks WHERE run_date = ?1",
            [date.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let stale = now - parse_datetime(&acquired_at) > chrono::Duration::hours(RUN_LOCK_STALE_HOURS);
        if released != 0 || stale {
            conn.execute(
                "UPDATE run_locks SET acquired_at = ?2, released = 0 WHERE run_date = ?1",
                params![date.to_string(), now.to_rfc3339()],
            )?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn release_run_lock(&self, date: NaiveDate) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE run_locks SET released = 1 WHERE run_date = ?1",
            [date.to_string()],
        )?;
        Ok(())
    }

    pub fn mark_unit_complete(&self, date: NaiveDate, unit: ProgressUnit, key: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO run_progress (run_date, unit_kind, unit_key, completed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                date.to_string(),
                unit.as_db_str(),
                key,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn completed_units(&self, date: NaiveDate, unit: ProgressUnit) -> Result<HashSet<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT unit_key FROM run_progress WHERE run_date = ?1 AND unit_kind = ?2",
        )?;
        let keys = stmt
            .query_map(params![date.to_string(), unit.as_db_str()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(keys)
    }

    pub fn clear_progress(&self, date: NaiveDate, unit: ProgressUnit) -> Result<usize> {
        let conn = self.lock_conn()?;
        let cleared = conn.execute(
            "DELETE FROM run_progress WHERE run_date = ?1 AND unit_kind = ?2",
            params![date.to_string(), unit.as_db_str()],
        )?;
        Ok(cleared)
    }

    // === Pair history (cool-down) ===

    pub fn record_pair(&self, user_a: &str, user_b: &str, date: NaiveDate) -> Result<()> {
        let (a, b) = normalize_pair(user_a, user_b);
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO pair_history (user_a, user_b, run_date) VALUES (?1, ?2, ?3)",
            params![a, b, date.to_string()],
        )?;
        Ok(())
    }

    /// Pairs that conversed on or after the cutoff date (normalized order).
    pub fn pairs_since(&self, cutoff: NaiveDate) -> Result<HashSet<(String, String)>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT user_a, user_b FROM pair_history WHERE run_date >= ?1")?;
        let pairs = stmt
            .query_map([cutoff.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(pairs)
    }

    // === Analytics ===

    pub fn analytics(&self, from: NaiveDate, to: NaiveDate) -> Result<AnalyticsSummary> {
        let conn = self.lock_conn()?;
        let range = params![from.to_string(), to.to_string()];

        let total_matches: u64 = conn.query_row(
            "SELECT COUNT(*) FROM matches WHERE run_date >= ?1 AND run_date <= ?2",
            range,
            |row| row.get::<_, i64>(0),
        )? as u64;
        let matches_failed: u64 = conn.query_row(
            "SELECT COUNT(*) FROM matches
             WHERE run_date >= ?1 AND run_date <= ?2 AND status = 'failed'",
            range,
            |row| row.get::<_, i64>(0),
        )? as u64;
        let matches_reported: u64 = conn.query_row(
            "SELECT COUNT(*) FROM matches
             WHERE run_date >= ?1 AND run_date <= ?2 AND reported = 1",
            range,
            |row| row.get::<_, i64>(0),
        )? as u64;
        let backlog_size: u64 = conn.query_row(
            "SELECT COUNT(*) FROM matches
             WHERE run_date >= ?1 AND run_date <= ?2 AND reported = 0
               AND status = 'completed' AND outcome IS NOT NULL AND outcome != 'no_match'",
            range,
            |row| row.get::<_, i64>(0),
        )? as u64;
        let reports_generated: u64 = conn.query_row(
            "SELECT COUNT(*) FROM morning_reports WHERE report_date >= ?1 AND report_date <= ?2",
            range,
            |row| row.get::<_, i64>(0),
        )? as u64;
        let emails_sent: u64 = conn.query_row(
            "SELECT COUNT(*) FROM morning_reports
             WHERE report_date >= ?1 AND report_date <= ?2 AND email_sent = 1",
            range,
            |row| row.get::<_, i64>(0),
        )? as u64;

        let completed = total_matches - matches_failed;
        let conversion_rate = if completed > 0 {
            matches_reported as f64 / completed as f64
        } else {
            0.0
        };

        let avg_processing_time_ms: f64 = conn
            .query_row(
                "SELECT AVG(processing_time_ms) FROM processing_log
                 WHERE processing_time_ms IS NOT NULL",
                [],
                |row| row.get::<_, Option<f64>>(0),
            )?
            .unwrap_or(0.0);

        let (log_total, log_errors): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END)
             FROM processing_log",
            [],
            |row| Ok((row.get(0)?, row.get::<_, Option<i64>>(1)?.unwrap_or(0))),
        )?;
        let error_rate = if log_total > 0 {
            log_errors as f64 / log_total as f64
        } else {
            0.0
        };

        Ok(AnalyticsSummary {
            total_matches,
            matches_failed,
            matches_reported,
            reports_generated,
            emails_sent,
            conversion_rate,
            avg_processing_time_ms,
            error_rate,
            backlog_size,
        })
    }
}

/// Order-insensitive pair key used by pair history and progress markers.
pub fn normalize_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Convenience constructor for log entries; stages fill in the optionals.
pub fn log_entry(process_type: &str, action: &str, status: &str) -> ProcessingLogEntry {
    ProcessingLogEntry {
        id: uuid::Uuid::new_v4().to_string(),
        process_type: process_type.to_string(),
        action: action.to_string(),
        status: status.to_string(),
        detail: None,
        processing_time_ms: None,
        tokens_used: None,
        error_message: None,
        created_at: Utc::now(),
    }
}

fn parse_datetime(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_date(raw: &str) -> NaiveDate {
    raw.parse()
        .unwrap_or_else(|_| Utc::now().date_naive())
}

fn parse_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("nightshift_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn profile(user_id: &str) -> AgentProfile {
        AgentProfile {
            user_id: user_id.to_string(),
            display_name: format!("Agent {}", user_id),
            email: format!("{}@example.com", user_id),
            style: CommunicationStyle::ProfessionalFocused,
            status: ProfileStatus::Approved,
            updated_at: Utc::now(),
        }
    }

    fn match_record(id: &str, date: NaiveDate, a: &str, b: &str) -> MatchRecord {
        MatchRecord {
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
            opportunity_score: 0.75,
            synergies: vec!["distributed systems".to_string()],
            reported: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn profile_and_story_round_trip() {
        let db = MatchmakerDatabase::new(temp_db_path("profiles")).expect("db init");
        db.upsert_profile(&profile("alice")).expect("upsert profile");

        let stored = db.get_profile("alice").expect("get").expect("present");
        assert_eq!(stored.display_name, "Agent alice");
        assert_eq!(stored.status, ProfileStatus::Approved);

        let story = PersonalStory {
            user_id: "alice".to_string(),
            narrative: "Platform engineer moving into developer tools.".to_string(),
            current_focus: vec!["devtools".to_string()],
            seeking_connections: vec!["design partners".to_string()],
            offering_expertise: vec!["rust".to_string()],
            shareable: true,
            updated_at: Utc::now(),
        };
        db.upsert_story(&story).expect("upsert story");

        // Upserts replace, never merge.
        let replaced = PersonalStory {
            seeking_connections: vec!["hiring managers".to_string()],
            ..story
        };
        db.upsert_story(&replaced).expect("replace story");
        let stored = db.get_story("alice").expect("get").expect("present");
        assert_eq!(stored.seeking_connections, vec!["hiring managers"]);
    }

    #[test]
    fn match_insert_is_idempotent_per_pair_and_date() {
        let db = MatchmakerDatabase::new(temp_db_path("match_idem")).expect("db init");
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();

        assert!(db
            .insert_match(&match_record("m1", date, "alice", "bob"))
            .expect("insert"));
        // Same pair and date again: ignored.
        assert!(!db
            .insert_match(&match_record("m2", date, "alice", "bob"))
            .expect("insert dup"));
        assert_eq!(db.list_matches_for_date(date).expect("list").len(), 1);
    }

    #[test]
    fn report_commit_claims_and_writes_in_one_step() {
        let db = MatchmakerDatabase::new(temp_db_path("reported")).expect("db init");
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        db.insert_match(&match_record("m1", date, "alice", "bob"))
            .expect("insert");

        let draft = ReportDraft {
            user_id: "alice".to_string(),
            notifications: vec![MatchNotification {
                match_id: "m1".to_string(),
                counterpart_handle: "Agent bob".to_string(),
                score: 0.75,
                reasoning: "Targeted conversation with Agent bob".to_string(),
                introduction: "Worth your time.".to_string(),
            }],
            insights: AgentInsights::default(),
        };
        let claims = vec!["m1".to_string()];
        let outcome = db
            .commit_reports(date, &claims, std::slice::from_ref(&draft), false)
            .expect("commit");
        assert_eq!(outcome.matches_claimed, 1);
        assert_eq!(outcome.reports_written, 1);
        assert!(db.unreported_matches_for_date(date).expect("list").is_empty());
        assert!(db.get_report("alice", date).expect("get").is_some());
        assert!(db
            .completed_units(date, ProgressUnit::Report)
            .expect("units")
            .contains("alice"));

        // A second pass loses the claim, so the draft drops its only
        // notification and no row is written.
        let outcome = db
            .commit_reports(date, &claims, std::slice::from_ref(&draft), false)
            .expect("recommit");
        assert_eq!(outcome.matches_claimed, 0);
        assert_eq!(outcome.reports_written, 0);

        assert_eq!(db.reset_reported_for_date(date).expect("reset"), 1);
        assert_eq!(db.unreported_matches_for_date(date).expect("list").len(), 1);
    }

    #[test]
    fn failed_and_no_match_rows_are_not_reportable() {
        let db = MatchmakerDatabase::new(temp_db_path("reportable")).expect("db init");
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();

        let mut failed = match_record("m1", date, "alice", "bob");
        failed.status = ConversationStatus::Failed;
        failed.outcome = None;
        db.insert_match(&failed).expect("insert failed");

        let mut no_match = match_record("m2", date, "carol", "dave");
        no_match.outcome = Some(Outcome::NoMatch);
        db.insert_match(&no_match).expect("insert no_match");

        assert!(db.unreported_matches_for_date(date).expect("list").is_empty());
    }

    #[test]
    fn report_upsert_preserves_delivery_state() {
        let db = MatchmakerDatabase::new(temp_db_path("report_upsert")).expect("db init");
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        let report = MorningReport {
            id: "r1".to_string(),
            user_id: "alice".to_string(),
            report_date: date,
            notification_count: 1,
            total_opportunity_score: 0.75,
            notifications: vec![],
            insights: AgentInsights::default(),
            email_sent: false,
            sent_at: None,
            created_at: Utc::now(),
        };
        db.upsert_report(&report, false).expect("create");
        assert!(db.mark_email_sent("r1", false).expect("send"));
        assert!(!db.mark_email_sent("r1", false).expect("resend blocked"));

        // Incremental regeneration keeps the sent flag.
        db.upsert_report(&report, false).expect("update");
        let stored = db.get_report("alice", date).expect("get").expect("present");
        assert!(stored.email_sent);

        // Forced regeneration resets delivery.
        db.upsert_report(&report, true).expect("force update");
        let stored = db.get_report("alice", date).expect("get").expect("present");
        assert!(!stored.email_sent);
        assert!(stored.sent_at.is_none());
    }

    #[test]
    fn run_lock_rejects_overlapping_invocations() {
        let db = MatchmakerDatabase::new(temp_db_path("lock")).expect("db init");
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();

        assert!(db.acquire_run_lock(date).expect("first acquire"));
        assert!(!db.acquire_run_lock(date).expect("held"));
        db.release_run_lock(date).expect("release");
        assert!(db.acquire_run_lock(date).expect("re-acquire"));
    }

    #[test]
    fn progress_markers_round_trip() {
        let db = MatchmakerDatabase::new(temp_db_path("progress")).expect("db init");
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();

        db.mark_unit_complete(date, ProgressUnit::Pair, "alice|bob")
            .expect("mark pair");
        db.mark_unit_complete(date, ProgressUnit::Report, "alice")
            .expect("mark report");

        let pairs = db.completed_units(date, ProgressUnit::Pair).expect("pairs");
        assert!(pairs.contains("alice|bob"));
        let reports = db
            .completed_units(date, ProgressUnit::Report)
            .expect("reports");
        assert!(reports.contains("alice"));
        assert!(!reports.contains("alice|bob"));

        assert_eq!(db.clear_progress(date, ProgressUnit::Report).expect("clear"), 1);
        assert!(db
            .completed_units(date, ProgressUnit::Report)
            .expect("reports")
            .is_empty());
    }

    #[test]
    fn pair_history_is_order_insensitive() {
        let db = MatchmakerDatabase::new(temp_db_path("history")).expect("db init");
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();

        db.record_pair("bob", "alice", date).expect("record");
        let recent = db.pairs_since(date).expect("since");
        assert!(recent.contains(&normalize_pair("alice", "bob")));
        assert!(db
            .pairs_since(date + chrono::Duration::days(1))
            .expect("since later")
            .is_empty());
    }

    #[test]
    fn analytics_counts_reflect_persisted_rows() {
        let db = MatchmakerDatabase::new(temp_db_path("analytics")).expect("db init");
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();

        db.insert_match(&match_record("m1", date, "alice", "bob"))
            .expect("insert");
        let mut failed = match_record("m2", date, "carol", "dave");
        failed.status = ConversationStatus::Failed;
        failed.outcome = None;
        db.insert_match(&failed).expect("insert failed");
        db.commit_reports(date, &["m1".to_string()], &[], false)
            .expect("report m1");

        let mut entry = log_entry("scheduler", "run", "ok");
        entry.processing_time_ms = Some(120);
        db.log(&entry).expect("log ok");
        db.log(&log_entry("conversation", "turn", "error"))
            .expect("log error");

        let summary = db.analytics(date, date).expect("analytics");
        assert_eq!(summary.total_matches, 2);
        assert_eq!(summary.matches_failed, 1);
        assert_eq!(summary.matches_reported, 1);
        assert_eq!(summary.backlog_size, 0);
        assert!((summary.conversion_rate - 1.0).abs() < f64::EPSILON);
        assert!((summary.error_rate - 0.5).abs() < f64::EPSILON);
    }
}
