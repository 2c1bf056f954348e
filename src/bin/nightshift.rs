use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use tracing_subscriber::EnvFilter;

use nightshift::database::{LogFilter, ReportFilter};
use nightshift::email::SendOptions;
use nightshift::scheduler::BatchOptions;
use nightshift::{MatchmakerService, PipelineConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nightshift=debug")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("help");

    let config = PipelineConfig::load();
    let service = MatchmakerService::new(config).context("failed to open the matchmaker service")?;

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(dispatch(&service, command, &args[args.len().min(1)..]))
}

async fn dispatch(service: &MatchmakerService, command: &str, rest: &[String]) -> Result<()> {
    match command {
        "run" => run_batch(service, rest).await,
        "send-emails" => send_emails(service, rest).await,
        "reports" => show_reports(service, rest),
        "analytics" => show_analytics(service, rest),
        "logs" => show_logs(service, rest),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            anyhow::bail!("Unknown command: {}", other);
        }
    }
}

fn print_usage() {
    println!("nightshift - nightly agent matchmaking pipeline");
    println!();
    println!("Usage:");
    println!("  nightshift run [--date YYYY-MM-DD] [--force]");
    println!("  nightshift send-emails [--date YYYY-MM-DD] [--dry-run] [--force-resend] [--override ADDRESS]");
    println!("  nightshift reports [--user USER_ID] [--date YYYY-MM-DD]");
    println!("  nightshift analytics [--from YYYY-MM-DD] [--to YYYY-MM-DD]");
    println!("  nightshift logs [--process TYPE] [--status STATUS]");
}

fn arg_value(rest: &[String], flag: &str) -> Option<String> {
    rest.iter()
        .position(|a| a == flag)
        .and_then(|i| rest.get(i + 1))
        .cloned()
}

fn has_flag(rest: &[String], flag: &str) -> bool {
    rest.iter().any(|a| a == flag)
}

fn parse_date_arg(rest: &[String], flag: &str) -> Result<Option<NaiveDate>> {
    match arg_value(rest, flag) {
        Some(raw) => {
            let date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .with_context(|| format!("Invalid date for {}: {}", flag, raw))?;
            Ok(Some(date))
        }
        None => Ok(None),
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

async fn run_batch(service: &MatchmakerService, rest: &[String]) -> Result<()> {
    let date = parse_date_arg(rest, "--date")?.unwrap_or_else(today);
    let options = BatchOptions {
        force_regenerate: has_flag(rest, "--force"),
    };

    let summary = service.run_nightly_batch(date, &options).await?;
    println!(
        "Run for {}: {} pair(s) planned, {} completed, {} failed, {} resumed, {} report(s) generated",
        date,
        summary.pairs_planned,
        summary.matches_completed,
        summary.matches_failed,
        summary.pairs_resumed,
        summary.reports_generated
    );
    Ok(())
}

async fn send_emails(service: &MatchmakerService, rest: &[String]) -> Result<()> {
    let date = parse_date_arg(rest, "--date")?.unwrap_or_else(today);
    let options = SendOptions {
        force_resend: has_flag(rest, "--force-resend"),
        dry_run: has_flag(rest, "--dry-run"),
        email_override: arg_value(rest, "--override"),
    };

    let summary = service.send_morning_report_emails(date, &options).await?;
    println!(
        "Delivery for {}: {} sent, {} failed, {} rendered (dry run), {} without address",
        date, summary.sent, summary.failed, summary.dry_run_rendered, summary.skipped_no_address
    );
    Ok(())
}

fn show_reports(service: &MatchmakerService, rest: &[String]) -> Result<()> {
    let filter = ReportFilter {
        user_id: arg_value(rest, "--user"),
        date_from: parse_date_arg(rest, "--date")?,
        date_to: parse_date_arg(rest, "--date")?,
        limit: Some(50),
    };

    let reports = service.get_morning_reports(&filter)?;
    if reports.is_empty() {
        println!("No reports found.");
        return Ok(());
    }
    for report in reports {
        println!(
            "{} {} notifications={} opportunity={:.2} sent={}",
            report.report_date,
            report.user_id,
            report.notification_count,
            report.total_opportunity_score,
            report.email_sent
        );
    }
    Ok(())
}

fn show_analytics(service: &MatchmakerService, rest: &[String]) -> Result<()> {
    let to = parse_date_arg(rest, "--to")?.unwrap_or_else(today);
    let from = parse_date_arg(rest, "--from")?.unwrap_or(to - chrono::Duration::days(30));

    let summary = service.get_analytics(from, to)?;
    println!("Analytics {} .. {}", from, to);
    println!("  matches:          {}", summary.total_matches);
    println!("  failed:           {}", summary.matches_failed);
    println!("  reported:         {}", summary.matches_reported);
    println!("  reports:          {}", summary.reports_generated);
    println!("  emails sent:      {}", summary.emails_sent);
    println!("  conversion rate:  {:.1}%", summary.conversion_rate * 100.0);
    println!("  avg pair time:    {:.0}ms", summary.avg_processing_time_ms);
    println!("  error rate:       {:.1}%", summary.error_rate * 100.0);
    println!("  report backlog:   {}", summary.backlog_size);
    Ok(())
}

fn show_logs(service: &MatchmakerService, rest: &[String]) -> Result<()> {
    let filter = LogFilter {
        process_type: arg_value(rest, "--process"),
        status: arg_value(rest, "--status"),
        limit: Some(100),
    };

    let entries = service.get_processing_logs(&filter)?;
    if entries.is_empty() {
        println!("No log entries found.");
        return Ok(());
    }
    for entry in entries {
        let timing = entry
            .processing_time_ms
            .map(|ms| format!(" {}ms", ms))
            .unwrap_or_default();
        println!(
            "{} [{}] {}/{} {}{}{}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.status,
            entry.process_type,
            entry.action,
            entry.detail.unwrap_or_default(),
            timing,
            entry
                .error_message
                .map(|e| format!(" error={}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}
