//! Checkpoint management commands

use std::io::{self, Write};

use anyhow::{Context, Result};
use tally_core::{CheckpointInfo, CheckpointManager, Database};
use tracing::warn;

/// Snapshot the database now
pub fn cmd_checkpoint_create(
    db: &Database,
    manager: &CheckpointManager,
    name: Option<&str>,
    description: &str,
) -> Result<CheckpointInfo> {
    println!("Creating checkpoint...");

    let info = manager
        .create(db, name, description)
        .context("Failed to create checkpoint")?;

    println!("✅ Checkpoint created: {}", info.id);
    println!("   Location: {}", manager.dir().display());
    println!("   Size: {}", format_size(info.size_bytes));
    println!("   Transactions: {}", info.transaction_count);
    println!("   Classifications: {}", info.classification_count);
    if info.encrypted {
        println!("   🔒 Encrypted (same passphrase required to restore)");
    }

    Ok(info)
}

/// List checkpoints, newest first
pub fn cmd_checkpoint_list(manager: &CheckpointManager) -> Result<()> {
    let checkpoints = manager.list().context("Failed to list checkpoints")?;

    if checkpoints.is_empty() {
        println!("No checkpoints found");
        println!("Directory: {}", manager.dir().display());
        return Ok(());
    }

    println!("Checkpoints ({}):", manager.dir().display());
    println!();
    println!(
        "{:<42} {:>10} {:>8} {:<17}",
        "ID", "SIZE", "TXNS", "CREATED"
    );
    println!("{}", "-".repeat(80));

    for checkpoint in checkpoints {
        let created = checkpoint.created_at.format("%Y-%m-%d %H:%M");
        let flags = format!(
            "{}{}",
            if checkpoint.is_auto { "⚙️" } else { "" },
            if checkpoint.encrypted { "🔒" } else { "" }
        );
        println!(
            "{:<42} {:>10} {:>8} {:<17} {}",
            checkpoint.id,
            format_size(checkpoint.size_bytes),
            checkpoint.transaction_count,
            created,
            flags
        );
    }

    Ok(())
}

/// Show one checkpoint's metadata
pub fn cmd_checkpoint_info(manager: &CheckpointManager, id: &str, json: bool) -> Result<()> {
    let info = manager
        .info(id)
        .with_context(|| format!("Checkpoint not found: {}", id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Checkpoint: {}", info.id);
    if !info.description.is_empty() {
        println!("   Description: {}", info.description);
    }
    println!(
        "   Created: {}",
        info.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("   Kind: {}", if info.is_auto { "automatic" } else { "manual" });
    println!("   Size: {}", format_size(info.size_bytes));
    println!("   Transactions: {}", info.transaction_count);
    println!("   Categories: {}", info.category_count);
    println!("   Classifications: {}", info.classification_count);
    println!("   Encrypted: {}", if info.encrypted { "yes" } else { "no" });
    println!("   SHA-256: {}", info.checksum);

    Ok(())
}

/// Replace the database with a checkpoint
///
/// Takes a manual safety checkpoint of the current state first so the restore
/// itself can be undone. Consumes `db`: restore needs the only open handle.
pub fn cmd_checkpoint_restore(
    db: Database,
    manager: &CheckpointManager,
    id: &str,
    force: bool,
) -> Result<()> {
    let target = manager
        .info(id)
        .with_context(|| format!("Checkpoint not found: {}", id))?;

    if !force {
        println!(
            "⚠️  This will replace {} with checkpoint '{}' from {}",
            db.path().display(),
            target.id,
            target.created_at.format("%Y-%m-%d %H:%M")
        );
        print!("Continue? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled");
            return Ok(());
        }
    }

    let description = format!("Before restoring {}", target.id);
    match manager.create(&db, None, &description) {
        Ok(safety) => println!("💾 Current state saved as {}", safety.id),
        Err(e) if force => {
            warn!(error = %e, "Safety checkpoint failed, restoring anyway (--force)");
        }
        Err(e) => {
            return Err(e).context("Failed to save the current state; use --force to restore anyway")
        }
    }

    println!("Restoring checkpoint: {}", target.id);

    let guard = manager
        .prepare_for_restore(db)
        .context("Cannot take exclusive access to the database")?;
    let restored = guard.restore(id).context("Restore failed")?;
    let db = guard.reopen().context("Failed to reopen restored database")?;
    let counts = db.store_counts()?;

    println!("✅ Database restored from: {}", restored.id);
    println!("   Location: {}", db.path().display());
    println!("   Transactions: {}", counts.transactions);
    println!("   Categories: {}", counts.categories);
    println!("   Classifications: {}", counts.classifications);

    Ok(())
}

pub fn cmd_checkpoint_delete(manager: &CheckpointManager, id: &str) -> Result<()> {
    manager
        .delete(id)
        .with_context(|| format!("Failed to delete checkpoint {}", id))?;
    println!("✅ Deleted checkpoint {}", id);
    Ok(())
}

/// Format a byte size as human-readable
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
