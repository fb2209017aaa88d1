//! Tally CLI - Transaction classification
//!
//! Usage:
//!   tally init                        Initialize database
//!   tally classify                    Classify interactively
//!   tally classify-batch --workers 8  Classify in parallel
//!   tally checkpoint list             Show snapshots taken before bulk changes
//!   tally analyze --apply             Find and fix inconsistent classifications

mod cli;
mod commands;
mod prompter;

#[cfg(test)]
mod tests;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;
use prompter::TerminalPrompter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => commands::cmd_init(&cli.db, cli.no_encrypt),
        Commands::Categories => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_categories(&db)
        }
        Commands::Classify { from } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            let cancel = commands::cancel_on_ctrl_c();
            commands::cmd_classify(&db, &config, &cancel, from, TerminalPrompter::new()).await
        }
        Commands::ClassifyBatch {
            from,
            workers,
            batch_size,
            threshold,
            skip_review,
        } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            let checkpoints = commands::checkpoint_manager(&config)?;
            let cancel = commands::cancel_on_ctrl_c();
            let overrides = commands::BatchOverrides {
                workers,
                batch_size,
                threshold,
                skip_review,
            };
            commands::cmd_classify_batch(
                &db,
                &config,
                &checkpoints,
                &cancel,
                from,
                &overrides,
                TerminalPrompter::new(),
            )
            .await
        }
        Commands::Rules { kind } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match kind {
                RulesKind::Vendor { action } => match action {
                    None | Some(VendorAction::List) => commands::cmd_vendor_list(&db),
                    Some(VendorAction::Add {
                        merchant,
                        category,
                        regex,
                    }) => commands::cmd_vendor_add(&db, &merchant, &category, regex),
                    Some(VendorAction::Deactivate { id }) => {
                        commands::cmd_vendor_deactivate(&db, id)
                    }
                },
                RulesKind::Check { action } => match action {
                    None => commands::cmd_check_list(&db, false),
                    Some(CheckAction::List { all }) => commands::cmd_check_list(&db, all),
                    Some(CheckAction::Add {
                        name,
                        category,
                        amount,
                        min,
                        max,
                        amounts,
                        days,
                        boost,
                        notes,
                    }) => commands::cmd_check_add(
                        &db,
                        &commands::CheckPatternArgs {
                            name,
                            category,
                            amount,
                            min,
                            max,
                            amounts,
                            days,
                            boost,
                            notes,
                        },
                    ),
                    Some(CheckAction::Deactivate { id }) => commands::cmd_check_deactivate(&db, id),
                },
                RulesKind::Pattern { action } => match action {
                    None => commands::cmd_pattern_list(&db, false),
                    Some(PatternAction::List { all }) => commands::cmd_pattern_list(&db, all),
                    Some(PatternAction::Add {
                        name,
                        category,
                        merchant,
                        regex,
                        amount_op,
                        amount,
                        min,
                        max,
                        direction,
                        confidence,
                        priority,
                    }) => commands::cmd_pattern_add(
                        &db,
                        &commands::PatternRuleArgs {
                            name,
                            category,
                            merchant,
                            regex,
                            amount_op,
                            amount,
                            min,
                            max,
                            direction,
                            confidence,
                            priority,
                        },
                    ),
                    Some(PatternAction::Deactivate { id }) => {
                        commands::cmd_pattern_deactivate(&db, id)
                    }
                },
            }
        }
        Commands::Checkpoint { action } => {
            let checkpoints = commands::checkpoint_manager(&config)?;
            match action {
                CheckpointAction::Create { name, description } => {
                    let db = commands::open_db(&cli.db, cli.no_encrypt)?;
                    commands::cmd_checkpoint_create(&db, &checkpoints, name.as_deref(), &description)
                        .map(|_| ())
                }
                CheckpointAction::List => commands::cmd_checkpoint_list(&checkpoints),
                CheckpointAction::Info { id, json } => {
                    commands::cmd_checkpoint_info(&checkpoints, &id, json)
                }
                CheckpointAction::Restore { id, force } => {
                    let db = commands::open_db(&cli.db, cli.no_encrypt)?;
                    commands::cmd_checkpoint_restore(db, &checkpoints, &id, force)
                }
                CheckpointAction::Delete { id } => {
                    commands::cmd_checkpoint_delete(&checkpoints, &id)
                }
            }
        }
        Commands::Analyze {
            session,
            from,
            to,
            apply,
            min_confidence,
            json,
        } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            let checkpoints = commands::checkpoint_manager(&config)?;
            let cancel = commands::cancel_on_ctrl_c();
            let args = commands::AnalyzeArgs {
                session,
                from,
                to,
                apply,
                min_confidence,
                json,
            };
            commands::cmd_analyze(&db, &config, &checkpoints, &cancel, &args).await
        }
    }
}
