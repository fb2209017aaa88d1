//! Classification analysis
//!
//! Reviews existing classifications for problems and proposes fixes.
//!
//! ## Pieces
//!
//! - [`AnalysisEngine`] runs a (resumable) session: cheap local checks over the
//!   store plus an AI review through the [`crate::Classifier`].
//! - [`FixApplier`] applies the stored fixes, each in one SQLite transaction.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_core::{AnalysisEngine, AnalysisOptions, CancelToken, FixApplier};
//!
//! let engine = AnalysisEngine::new(db.clone(), classifier);
//! let report = engine.analyze(&CancelToken::new(), &AnalysisOptions::default()).await?;
//! let results = FixApplier::new(db).apply_session(&report.session.id, 0.8)?;
//! ```

mod engine;
mod fixes;
mod types;

pub use engine::{AnalysisEngine, AnalysisOptions, AnalysisReport};
pub use fixes::{FixApplier, FixOutcome, FixResult};
pub use types::{
    AnalysisIssue, AnalysisSession, Fix, IssueStatus, IssueType, SessionStatus, Severity,
};
