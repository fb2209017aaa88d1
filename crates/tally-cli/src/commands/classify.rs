//! Classification commands (sequential and batch)

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tally_core::{
    BatchOptions, BatchSummary, CancelToken, CheckpointManager, ClassificationEngine, Config,
    Database, Prompter, RetryPolicy, RunSummary,
};

use super::core::build_classifier;

/// Command-line overrides for the `[batch]` config section
#[derive(Debug, Clone, Default)]
pub struct BatchOverrides {
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub threshold: Option<f64>,
    pub skip_review: bool,
}

impl BatchOverrides {
    pub fn apply(&self, config: &Config) -> Result<BatchOptions> {
        let mut options = BatchOptions::from(&config.batch);
        if let Some(workers) = self.workers {
            options.workers = workers;
        }
        if let Some(batch_size) = self.batch_size {
            options.batch_size = batch_size;
        }
        if let Some(threshold) = self.threshold {
            options.auto_accept_threshold = threshold;
        }
        options.skip_manual_review = self.skip_review;
        options.validate().context("Invalid batch options")?;
        Ok(options)
    }
}

/// Interactive classification, one transaction at a time
pub async fn cmd_classify<P: Prompter>(
    db: &Database,
    config: &Config,
    cancel: &CancelToken,
    from: Option<NaiveDate>,
    prompter: P,
) -> Result<()> {
    let classifier = build_classifier(db, config)?;
    let mut engine = ClassificationEngine::new(db.clone(), classifier, prompter)
        .with_retry_policy(RetryPolicy::from(config.retry));

    println!("🏷️  Classifying transactions...");
    if let Some(from) = from {
        println!("   From: {}", from);
    }

    match engine.classify_transactions(cancel, from).await {
        Ok(summary) => {
            print_run_summary(&summary);
            Ok(())
        }
        Err(e) if e.is_canceled() => {
            let stats = engine.prompter().completion_stats();
            println!();
            println!(
                "⏹  Stopped after {} of {} transactions. Progress is saved; run again to continue.",
                stats.processed, stats.total
            );
            Ok(())
        }
        Err(e) => Err(e).context("Classification stopped"),
    }
}

/// Parallel classification with a checkpoint taken first
pub async fn cmd_classify_batch<P: Prompter>(
    db: &Database,
    config: &Config,
    checkpoints: &CheckpointManager,
    cancel: &CancelToken,
    from: Option<NaiveDate>,
    overrides: &BatchOverrides,
    prompter: P,
) -> Result<()> {
    let options = overrides.apply(config)?;
    let classifier = build_classifier(db, config)?;

    match checkpoints.auto_checkpoint(db, "classify-batch") {
        Some(info) => println!(
            "💾 Checkpoint {} (restore with 'tally checkpoint restore {}')",
            info.id, info.id
        ),
        None => println!("⚠️  Could not create a checkpoint; continuing without one"),
    }

    println!(
        "🏷️  Batch classification: {} workers, {} per call, auto-accept ≥ {:.0}%",
        options.workers,
        options.batch_size,
        options.auto_accept_threshold * 100.0
    );

    let mut engine = ClassificationEngine::new(db.clone(), classifier, prompter)
        .with_retry_policy(RetryPolicy::from(config.retry));
    let summary = engine
        .classify_transactions_batch(cancel, from, &options)
        .await
        .context("Batch classification stopped")?;

    print_batch_summary(&summary);
    Ok(())
}

pub fn print_run_summary(summary: &RunSummary) {
    println!();
    println!("📊 Classification Results");
    println!("   ─────────────────────────────");
    println!("   Transactions:     {}", summary.total);
    println!("   Matched by rules: {}", summary.rule_matched);
    println!("   AI accepted:      {}", summary.ai_accepted);
    println!("   Edited by you:    {}", summary.user_edited);
    println!("   Rejected:         {}", summary.rejected);
    if summary.skipped > 0 {
        println!("   Skipped (errors): {}", summary.skipped);
    }
    println!("   Took {:.1}s", summary.duration.as_secs_f64());
}

pub fn print_batch_summary(summary: &BatchSummary) {
    println!();
    println!("📊 Batch Results");
    println!("   ─────────────────────────────");
    println!("   Transactions:        {}", summary.total);
    println!("   Matched by rules:    {}", summary.rule_matched);
    println!("   Auto-accepted:       {}", summary.auto_accepted);
    println!("   Reviewed by you:     {}", summary.manually_classified);
    println!("   Rejected:            {}", summary.rejected);
    println!("   Awaiting review:     {}", summary.needs_review);
    println!("   Failed:              {}", summary.failed);
    println!("   Took {:.1}s", summary.duration.as_secs_f64());

    if !summary.failures.is_empty() {
        println!();
        println!("⚠️  Failed transactions:");
        for failure in summary.failures.iter().take(20) {
            println!(
                "   {} {} {}: {}",
                failure.date,
                failure.transaction_id,
                super::truncate(&failure.merchant, 30),
                failure.reason
            );
        }
        if summary.failures.len() > 20 {
            println!("   ... and {} more", summary.failures.len() - 20);
        }
    }

    if summary.canceled {
        println!();
        println!(
            "⏹  Canceled after {} of {} transactions. Run again to continue.",
            summary.processed(),
            summary.total
        );
    } else if summary.needs_review > 0 {
        println!();
        println!(
            "💡 {} transactions need review. Run 'tally classify' to go through them.",
            summary.needs_review
        );
    }
}
