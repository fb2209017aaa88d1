//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

/// Tally - Classify transactions with rules and a local AI
#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Rule-first transaction classification with an AI fallback", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, default_value = "tally.db", global = true)]
    pub db: PathBuf,

    /// Config file (defaults to ~/.local/share/tally/config.toml, then built-in defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable database encryption (not recommended for production)
    ///
    /// By default, the database is encrypted using SQLCipher.
    /// Set TALLY_DB_KEY environment variable with your passphrase.
    /// Use --no-encrypt only for development or testing.
    #[arg(long, global = true)]
    pub no_encrypt: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database and seed default categories
    Init,

    /// List categories
    Categories,

    /// Classify unclassified transactions one at a time, asking about AI suggestions
    Classify {
        /// Only transactions on or after this date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
    },

    /// Classify unclassified transactions in parallel, reviewing low-confidence groups at the end
    ClassifyBatch {
        /// Only transactions on or after this date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Concurrent classifier workers (defaults to config)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Merchant groups per classifier call (defaults to config)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Auto-accept suggestions at or above this confidence (defaults to config)
        #[arg(long)]
        threshold: Option<f64>,

        /// Leave low-confidence groups unclassified instead of asking
        #[arg(long)]
        skip_review: bool,
    },

    /// Manage classification rules
    Rules {
        #[command(subcommand)]
        kind: RulesKind,
    },

    /// Manage checkpoints (snapshots taken before bulk changes)
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Look for inconsistent or missing classifications
    Analyze {
        /// Resume or re-show an existing analysis session
        #[arg(long)]
        session: Option<String>,

        /// Only classifications on or after this date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Only classifications on or before this date (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Apply suggested fixes after analysis
        #[arg(long)]
        apply: bool,

        /// Minimum issue confidence for --apply
        #[arg(long, default_value = "0.8")]
        min_confidence: f64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum RulesKind {
    /// Merchant → category rules (learned or manual)
    Vendor {
        #[command(subcommand)]
        action: Option<VendorAction>,
    },

    /// Paper check patterns (amount and day of month)
    Check {
        #[command(subcommand)]
        action: Option<CheckAction>,
    },

    /// Conditional pattern rules (merchant, amount, direction)
    Pattern {
        #[command(subcommand)]
        action: Option<PatternAction>,
    },
}

#[derive(Subcommand)]
pub enum VendorAction {
    /// List vendor rules
    List,

    /// Add a manual vendor rule (never overridden by learning)
    Add {
        /// Merchant name (or regex with --regex)
        merchant: String,

        /// Category to assign
        category: String,

        /// Treat MERCHANT as a case-insensitive regex
        #[arg(long)]
        regex: bool,
    },

    /// Remove a vendor rule
    Deactivate {
        /// Rule ID
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum CheckAction {
    /// List check patterns
    List {
        /// Include deactivated patterns
        #[arg(long)]
        all: bool,
    },

    /// Add a check pattern
    ///
    /// Give exactly one of --amount, --min/--max or --amounts.
    Add {
        /// Pattern name (e.g., "Rent")
        name: String,

        /// Category to assign
        #[arg(short, long)]
        category: String,

        /// Exact check amount
        #[arg(long)]
        amount: Option<f64>,

        /// Lower bound of an inclusive amount range
        #[arg(long, requires = "max")]
        min: Option<f64>,

        /// Upper bound of an inclusive amount range
        #[arg(long, requires = "min")]
        max: Option<f64>,

        /// Comma-separated list of accepted amounts
        #[arg(long, value_delimiter = ',')]
        amounts: Vec<f64>,

        /// Day-of-month window, e.g. "1-5"
        #[arg(long)]
        days: Option<String>,

        /// Confidence assigned to matches
        #[arg(long, default_value = "0.9")]
        boost: f64,

        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Deactivate a check pattern
    Deactivate {
        /// Pattern ID
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum PatternAction {
    /// List pattern rules
    List {
        /// Include deactivated rules
        #[arg(long)]
        all: bool,
    },

    /// Add a pattern rule
    Add {
        /// Rule name
        name: String,

        /// Category to assign
        #[arg(short, long)]
        category: String,

        /// Merchant to match (case-insensitive)
        #[arg(long)]
        merchant: Option<String>,

        /// Treat --merchant as a regex
        #[arg(long, requires = "merchant")]
        regex: bool,

        /// Amount comparison: any, lt, le, eq, ge, gt, range
        #[arg(long, default_value = "any")]
        amount_op: String,

        /// Value for lt/le/eq/ge/gt
        #[arg(long)]
        amount: Option<f64>,

        /// Range lower bound
        #[arg(long)]
        min: Option<f64>,

        /// Range upper bound
        #[arg(long)]
        max: Option<f64>,

        /// income, expense or transfer
        #[arg(long)]
        direction: Option<String>,

        /// Confidence assigned to matches
        #[arg(long, default_value = "0.85")]
        confidence: f64,

        /// Higher priority wins among matching pattern rules
        #[arg(long, default_value = "0")]
        priority: i32,
    },

    /// Deactivate a pattern rule
    Deactivate {
        /// Rule ID
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum CheckpointAction {
    /// Snapshot the database now
    Create {
        /// Checkpoint name (defaults to a timestamp)
        #[arg(short, long)]
        name: Option<String>,

        /// What this checkpoint is for
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// List checkpoints, newest first
    List,

    /// Show details of one checkpoint
    Info {
        /// Checkpoint ID
        id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replace the database with a checkpoint
    Restore {
        /// Checkpoint ID
        id: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Delete a checkpoint
    Delete {
        /// Checkpoint ID
        id: String,
    },
}
