use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;

use crate::database::{log_entry, MatchmakerDatabase, MorningReport};
use crate::ratelimit::{QuotaBucket, RateLimiter};

#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Delivery seam. The production implementation posts to an HTTP mail
/// API; tests substitute a recording stub.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<()>;
}

pub struct HttpEmailTransport {
    api_url: String,
    api_key: String,
    from: String,
    client: reqwest::Client,
}

impl HttpEmailTransport {
    pub fn new(api_url: String, api_key: Option<String>, from: String) -> Self {
        Self {
            api_url,
            api_key: api_key.unwrap_or_default(),
            from,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmailTransport for HttpEmailTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<()> {
        let payload = json!({
            "from": self.from,
            "to": email.to,
            "subject": email.subject,
            "text": email.body,
        });

        let mut req = self.client.post(&self.api_url).json(&payload);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send email request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Mail API returned error {}: {}", status, body);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub force_resend: bool,
    pub dry_run: bool,
    /// Route every send to one test address; the original recipient stays
    /// visible in the rendered body and the logs. Non-production only.
    pub email_override: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchSummary {
    pub sent: usize,
    pub failed: usize,
    pub dry_run_rendered: usize,
    pub skipped_no_address: usize,
}

/// Turns morning reports into delivery actions. The `email_sent` flag is
/// the only dedupe state: it is flipped conditionally on success, so a
/// failed send stays eligible for the next invocation.
pub struct NotificationDispatcher {
    db: Arc<MatchmakerDatabase>,
    transport: Arc<dyn EmailTransport>,
    limiter: Arc<RateLimiter>,
}

impl NotificationDispatcher {
    pub fn new(
        db: Arc<MatchmakerDatabase>,
        transport: Arc<dyn EmailTransport>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            db,
            transport,
            limiter,
        }
    }

    pub async fn dispatch(&self, date: NaiveDate, options: &SendOptions) -> Result<DispatchSummary> {
        let reports = self.db.reports_to_send(date, options.force_resend)?;
        let mut summary = DispatchSummary::default();

        for report in reports {
            let started = Instant::now();
            let recipient = match self.db.get_profile(&report.user_id)? {
                Some(profile) if !profile.email.trim().is_empty() => profile.email,
                _ => {
                    tracing::warn!(
                        "No delivery address for {}; leaving report unsent",
                        report.user_id
                    );
                    summary.skipped_no_address += 1;
                    continue;
                }
            };

            let mut email = render_report_email(&report, &recipient);
            if let Some(override_to) = &options.email_override {
                tracing::info!(
                    "Email override active: rerouting report for {} from {} to {}",
                    report.user_id,
                    recipient,
                    override_to
                );
                email.to = override_to.clone();
            }

            if options.dry_run {
                tracing::info!(
                    "Dry run: would send \"{}\" to {} ({} notification(s))",
                    email.subject,
                    email.to,
                    report.notification_count
                );
                summary.dry_run_rendered += 1;
                continue;
            }

            self.limiter.acquire(QuotaBucket::Email).await;
            match self.transport.send(&email).await {
                Ok(()) => {
                    self.db.mark_email_sent(&report.id, options.force_resend)?;
                    summary.sent += 1;

                    let mut entry = log_entry("notification_dispatcher", "send_email", "ok");
                    entry.detail = Some(format!("user={} date={}", report.user_id, date));
                    entry.processing_time_ms = Some(started.elapsed().as_millis() as i64);
                    self.db.log(&entry)?;
                }
                Err(e) => {
                    tracing::warn!("Email send failed for {}: {}", report.user_id, e);
                    summary.failed += 1;

                    let mut entry = log_entry("notification_dispatcher", "send_email", "error");
                    entry.detail = Some(format!("user={} date={}", report.user_id, date));
                    entry.error_message = Some(e.to_string());
                    entry.processing_time_ms = Some(started.elapsed().as_millis() as i64);
                    self.db.log(&entry)?;
                }
            }
        }

        tracing::info!(
            "Dispatch for {}: {} sent, {} failed, {} dry-run, {} without address",
            date,
            summary.sent,
            summary.failed,
            summary.dry_run_rendered,
            summary.skipped_no_address
        );
        Ok(summary)
    }
}

pub fn render_report_email(report: &MorningReport, recipient: &str) -> OutboundEmail {
    let subject = format!(
        "Your morning report for {}: {} new opportunit{}",
        report.report_date,
        report.notification_count,
        if report.notification_count == 1 { "y" } else { "ies" }
    );

    let mut body = format!(
        "Good morning,\n\nYour agent held conversations overnight and found {} \
         opportunit{} (combined score {:.2}).\n\n",
        report.notification_count,
        if report.notification_count == 1 { "y" } else { "ies" },
        report.total_opportunity_score
    );

    for (i, notification) in report.notifications.iter().enumerate() {
        body.push_str(&format!(
            "{}. {} (score {:.2})\n   {}\n   {}\n\n",
            i + 1,
            notification.counterpart_handle,
            notification.score,
            notification.reasoning,
            notification.introduction
        ));
    }

    if !report.insights.patterns_observed.is_empty() {
        body.push_str("Patterns your agent observed:\n");
        for pattern in &report.insights.patterns_observed {
            body.push_str(&format!("- {}\n", pattern));
        }
        body.push('\n');
    }
    if !report.insights.top_opportunities.is_empty() {
        body.push_str("Top opportunities:\n");
        for opportunity in &report.insights.top_opportunities {
            body.push_str(&format!("- {}\n", opportunity));
        }
    }

    OutboundEmail {
        to: recipient.to_string(),
        subject,
        body,
    }
}
