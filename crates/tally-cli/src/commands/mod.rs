//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `analyze` - Classification analysis and fixes
//! - `checkpoint` - Checkpoint management (create, list, info, restore, delete)
//! - `classify` - Sequential and batch classification
//! - `core` - Core commands (init, categories) and shared utilities (open_db, config wiring)
//! - `rules` - Vendor rules, check patterns and pattern rules

pub mod analyze;
pub mod checkpoint;
pub mod classify;
pub mod core;
pub mod rules;

// Re-export command functions for main.rs
pub use analyze::*;
pub use checkpoint::*;
pub use classify::*;
pub use core::*;
pub use rules::*;

/// Truncate a string to a maximum number of characters, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
