//! Core command implementations and shared utilities
//!
//! This module contains:
//! - `open_db` - Shared utility to open the database
//! - `load_config`, `build_classifier`, `checkpoint_manager` - wiring from config
//! - `cancel_on_ctrl_c` - cancellation token tied to Ctrl-C
//! - `cmd_init` - Initialize the database
//! - `cmd_categories` - List categories

use std::path::Path;

use anyhow::{Context, Result};
use tally_core::{CancelToken, CheckpointManager, ClassifierClient, Config, Database};
use tracing::{debug, warn};

/// Open database with encryption by default, or unencrypted if --no-encrypt
pub fn open_db(db_path: &Path, no_encrypt: bool) -> Result<Database> {
    if no_encrypt {
        Database::new_unencrypted(db_path).context("Failed to open database (unencrypted)")
    } else {
        Database::new(db_path).context("Failed to open database")
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path).context("Failed to load configuration")
}

/// Build the configured classifier, primed with the active category names
pub fn build_classifier(db: &Database, config: &Config) -> Result<ClassifierClient> {
    let categories: Vec<String> = db
        .list_categories()
        .context("Failed to list categories")?
        .into_iter()
        .filter(|c| c.active)
        .map(|c| c.name)
        .collect();
    let client = ClassifierClient::from_config(&config.ai).context("Failed to set up classifier")?;
    debug!(
        backend = config.ai.backend.as_str(),
        model = %config.ai.model,
        categories = categories.len(),
        "Classifier ready"
    );
    Ok(client.with_categories(categories))
}

pub fn checkpoint_manager(config: &Config) -> Result<CheckpointManager> {
    let dir = config
        .checkpoints
        .dir
        .clone()
        .unwrap_or_else(CheckpointManager::default_dir);
    let manager = CheckpointManager::new(&dir)
        .with_context(|| format!("Failed to open checkpoint directory: {}", dir.display()))?;
    Ok(manager.with_keep_auto(config.checkpoints.keep_auto))
}

/// A token that is cancelled when the user presses Ctrl-C
pub fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!();
                eprintln!("⏹  Stopping after the current transaction...");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
        }
    });
    cancel
}

pub fn cmd_init(db_path: &Path, no_encrypt: bool) -> Result<()> {
    println!("🔧 Initializing database at {}...", db_path.display());

    let db = open_db(db_path, no_encrypt)?;

    let seeded = db
        .seed_default_categories()
        .context("Failed to seed default categories")?;
    println!("   Seeded {} default categories", seeded);

    if no_encrypt {
        println!("   ⚠️  Encryption: DISABLED (--no-encrypt)");
    } else {
        println!("   🔒 Encryption: ENABLED");
    }

    println!("✅ Database initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  1. Interactive classification: tally classify");
    println!("  2. Bulk classification: tally classify-batch");

    Ok(())
}

pub fn cmd_categories(db: &Database) -> Result<()> {
    let categories = db.list_categories().context("Failed to list categories")?;

    if categories.is_empty() {
        println!("No categories. Run 'tally init' to seed the defaults.");
        return Ok(());
    }

    println!("{:<5} {:<18} DESCRIPTION", "ID", "NAME");
    println!("{}", "-".repeat(70));
    for category in categories {
        let name = if category.active {
            category.name
        } else {
            format!("{} (inactive)", category.name)
        };
        println!(
            "{:<5} {:<18} {}",
            category.id,
            name,
            super::truncate(category.description.as_deref().unwrap_or(""), 45)
        );
    }

    Ok(())
}
