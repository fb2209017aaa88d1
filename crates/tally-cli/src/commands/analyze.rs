//! Classification analysis command

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tally_core::{
    AnalysisEngine, AnalysisOptions, AnalysisReport, CancelToken, CheckpointManager, Config,
    Database, FixApplier, FixOutcome, IssueStatus, RetryPolicy,
};

use super::core::build_classifier;
use super::truncate;

/// Arguments of `tally analyze`
#[derive(Debug, Clone, Default)]
pub struct AnalyzeArgs {
    pub session: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub apply: bool,
    pub min_confidence: f64,
    pub json: bool,
}

pub async fn cmd_analyze(
    db: &Database,
    config: &Config,
    checkpoints: &CheckpointManager,
    cancel: &CancelToken,
    args: &AnalyzeArgs,
) -> Result<()> {
    let classifier = build_classifier(db, config)?;
    let engine = AnalysisEngine::new(db.clone(), classifier)
        .with_retry_policy(RetryPolicy::from(config.retry));
    let options = AnalysisOptions {
        session_id: args.session.clone(),
        start_date: args.from,
        end_date: args.to,
        max_issues: None,
    };

    if !args.json {
        match &args.session {
            Some(id) => println!("🔍 Resuming analysis session {}...", id),
            None => println!("🔍 Analyzing classifications..."),
        }
    }

    let report = match engine.analyze(cancel, &options).await {
        Ok(report) => report,
        Err(e) if e.is_canceled() => {
            println!("⏹  Analysis canceled. Resume it with 'tally analyze --session <id>'.");
            return Ok(());
        }
        Err(e) => return Err(e).context("Analysis failed"),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if args.apply {
        apply_fixes(db, checkpoints, &report, args.min_confidence)?;
    } else if !args.json && report.issues.iter().any(|i| i.fix.is_some()) {
        println!();
        println!(
            "💡 Apply fixes with 'tally analyze --session {} --apply'",
            report.session.id
        );
    }

    Ok(())
}

fn apply_fixes(
    db: &Database,
    checkpoints: &CheckpointManager,
    report: &AnalysisReport,
    min_confidence: f64,
) -> Result<()> {
    let pending = report
        .issues
        .iter()
        .filter(|i| i.status == IssueStatus::Pending && i.fix.is_some())
        .filter(|i| i.confidence >= min_confidence)
        .count();
    if pending == 0 {
        println!();
        println!(
            "Nothing to apply at confidence ≥ {:.0}%",
            min_confidence * 100.0
        );
        return Ok(());
    }

    if let Some(info) = checkpoints.auto_checkpoint(db, "analysis-fixes") {
        println!();
        println!("💾 Checkpoint {}", info.id);
    }

    let results = FixApplier::new(db.clone())
        .apply_session(&report.session.id, min_confidence)
        .context("Failed to apply fixes")?;

    println!();
    println!("🔧 Fixes");
    let mut applied = 0;
    for result in &results {
        match &result.outcome {
            FixOutcome::Applied => {
                applied += 1;
                println!(
                    "   ✅ {} {} ({} rows)",
                    result.kind, result.issue_id, result.changed
                );
            }
            FixOutcome::AlreadyApplied => {
                println!("   ✔️  {} {} (already applied)", result.kind, result.issue_id)
            }
            FixOutcome::Failed(error) => {
                println!("   ❌ {} {}: {}", result.kind, result.issue_id, error)
            }
        }
    }
    println!("   Applied {} of {}", applied, results.len());

    Ok(())
}

fn print_report(report: &AnalysisReport) {
    let session = &report.session;
    println!();
    println!("📊 Analysis {}", session.id);
    println!("   ─────────────────────────────");
    if report.resumed {
        println!("   (stored results of a completed session)");
    }
    println!("   Reviewed: {} classifications", report.reviewed);
    if let Some(score) = session.coherence_score {
        println!("   Coherence: {:.0}%", score * 100.0);
    }
    println!("   Issues: {}", report.issues.len());
    if report.dropped > 0 {
        println!("   Discarded AI findings: {}", report.dropped);
    }

    if report.issues.is_empty() {
        println!();
        println!("✅ No issues found. Your classifications look consistent!");
        return;
    }

    println!();
    println!(
        "{:<8} {:<7} {:<16} {:>5} {:<20} DESCRIPTION",
        "ID", "SEV", "TYPE", "CONF", "FIX"
    );
    println!("{}", "-".repeat(100));
    for issue in &report.issues {
        let fix = match &issue.fix {
            Some(fix) => format!("{} → {}", fix.kind(), fix.category()),
            None => "-".into(),
        };
        let status = match issue.status {
            IssueStatus::Pending => "",
            IssueStatus::Fixed => " [fixed]",
            IssueStatus::Dismissed => " [dismissed]",
            IssueStatus::Failed => " [fix failed]",
        };
        println!(
            "{:<8} {:<7} {:<16} {:>4.0}% {:<20} {}{}",
            issue.id.chars().take(8).collect::<String>(),
            issue.severity.as_str(),
            issue.issue_type.as_str(),
            issue.confidence * 100.0,
            truncate(&fix, 20),
            truncate(&issue.description, 60),
            status
        );
    }
}
