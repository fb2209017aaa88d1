//! Terminal prompter
//!
//! Reads accept/edit/reject answers line by line. Generic over the reader and
//! writer so tests can drive it with in-memory buffers.

use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};

use async_trait::async_trait;
use tally_core::error::{Error, Result};
use tally_core::models::Transaction;
use tally_core::{CompletionStats, PendingClassification, PromptDecision, Prompter, StatsTracker};

pub struct TerminalPrompter<R, W> {
    input: R,
    output: W,
    tracker: StatsTracker,
}

impl TerminalPrompter<BufReader<Stdin>, Stdout> {
    pub fn new() -> Self {
        Self::with_io(BufReader::new(io::stdin()), io::stdout())
    }
}

impl Default for TerminalPrompter<BufReader<Stdin>, Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: BufRead + Send, W: Write + Send> TerminalPrompter<R, W> {
    pub fn with_io(input: R, output: W) -> Self {
        Self {
            input,
            output,
            tracker: StatsTracker::new(),
        }
    }

    /// Print `prompt` and read one trimmed line; closed input stops the run
    fn ask(&mut self, prompt: &str) -> Result<String> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(Error::Canceled);
        }
        Ok(line.trim().to_string())
    }

    fn show(&mut self, pending: &PendingClassification) -> Result<()> {
        let stats = self.tracker.stats();
        let tx = &pending.transaction;
        let suggestion = &pending.suggestion;
        writeln!(self.output)?;
        writeln!(
            self.output,
            "[{}/{}] {}  {}  ${:.2}",
            stats.processed + 1,
            stats.total,
            tx.date,
            tx.merchant_key(),
            tx.amount
        )?;
        writeln!(
            self.output,
            "  Suggested: {} ({:.0}%)",
            suggestion.category,
            suggestion.confidence * 100.0
        )?;
        if let Some(reasoning) = &suggestion.reasoning {
            writeln!(self.output, "  Why: {}", reasoning)?;
        }
        if pending.group_size > 1 {
            writeln!(
                self.output,
                "  Applies to {} transactions from this merchant",
                pending.group_size
            )?;
        }
        Ok(())
    }
}

/// Parse an accept/edit/reject answer; `None` asks again
fn parse_answer(answer: &str) -> Option<Answer> {
    match answer.to_lowercase().as_str() {
        "" | "a" | "accept" | "y" | "yes" => Some(Answer::Accept),
        "r" | "reject" | "n" | "no" => Some(Answer::Reject),
        "e" | "edit" => Some(Answer::Edit(None)),
        _ => {
            // "e Coffee Shops" keeps the user's casing
            let (verb, rest) = answer.split_once(' ')?;
            matches!(verb.to_lowercase().as_str(), "e" | "edit")
                .then(|| Answer::Edit(Some(rest.trim().to_string())))
        }
    }
}

#[derive(Debug, PartialEq)]
enum Answer {
    Accept,
    Edit(Option<String>),
    Reject,
}

#[async_trait]
impl<R: BufRead + Send, W: Write + Send> Prompter for TerminalPrompter<R, W> {
    fn start(&mut self, total: usize) {
        self.tracker.start(total);
    }

    fn record_auto(&mut self, _tx: &Transaction, _category: &str) {
        self.tracker.record_auto();
    }

    async fn confirm(&mut self, pending: &PendingClassification) -> Result<PromptDecision> {
        self.show(pending)?;
        let decision = loop {
            let answer = self.ask("  [a]ccept, [e]dit, [r]eject? ")?;
            match parse_answer(&answer) {
                Some(Answer::Accept) => break PromptDecision::Accept,
                Some(Answer::Reject) => break PromptDecision::Reject,
                Some(Answer::Edit(Some(category))) if !category.is_empty() => {
                    break PromptDecision::Edit(category)
                }
                Some(Answer::Edit(_)) => {
                    let category = self.ask("  Category: ")?;
                    if !category.is_empty() {
                        break PromptDecision::Edit(category);
                    }
                }
                None => writeln!(self.output, "  Please answer a, e or r")?,
            }
        };
        self.tracker.record_decision(&decision, pending.group_size);
        Ok(decision)
    }

    async fn confirm_retry(&mut self, tx: &Transaction, error: &str) -> Result<bool> {
        writeln!(self.output)?;
        writeln!(
            self.output,
            "⚠️  Could not classify {} ({}): {}",
            tx.merchant_key(),
            tx.date,
            error
        )?;
        let answer = self.ask("  Retry? [y/N] ")?;
        let retry = matches!(answer.to_lowercase().as_str(), "y" | "yes");
        if !retry {
            self.tracker.record_skip();
        }
        Ok(retry)
    }

    fn completion_stats(&self) -> CompletionStats {
        self.tracker.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::Cursor;
    use tally_core::Suggestion;

    fn pending(group_size: usize) -> PendingClassification {
        let tx = Transaction::new(
            "t1",
            NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
            "BLUE BOTTLE",
            6.5,
        );
        PendingClassification::new(tx, Suggestion::new("Dining", 0.72)).with_group_size(group_size)
    }

    fn prompter(input: &str) -> TerminalPrompter<Cursor<Vec<u8>>, Vec<u8>> {
        TerminalPrompter::with_io(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer(""), Some(Answer::Accept));
        assert_eq!(parse_answer("A"), Some(Answer::Accept));
        assert_eq!(parse_answer("r"), Some(Answer::Reject));
        assert_eq!(parse_answer("e"), Some(Answer::Edit(None)));
        assert_eq!(
            parse_answer("e Coffee Shops"),
            Some(Answer::Edit(Some("Coffee Shops".into())))
        );
        assert_eq!(parse_answer("maybe"), None);
    }

    #[tokio::test]
    async fn test_confirm_edit_asks_for_category() {
        let mut p = prompter("x\nedit\nCoffee\n");
        p.start(4);
        let decision = p.confirm(&pending(3)).await.unwrap();
        assert_eq!(decision, PromptDecision::Edit("Coffee".into()));

        let stats = p.completion_stats();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.user_classified, 3);

        let shown = String::from_utf8(p.output.clone()).unwrap();
        assert!(shown.contains("Suggested: Dining (72%)"));
        assert!(shown.contains("Applies to 3 transactions"));
        assert!(shown.contains("Please answer"));
    }

    #[tokio::test]
    async fn test_closed_input_cancels() {
        let mut p = prompter("");
        p.start(1);
        let err = p.confirm(&pending(1)).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_retry_defaults_to_skip() {
        let mut p = prompter("\ny\n");
        p.start(2);
        let tx = pending(1).transaction;
        assert!(!p.confirm_retry(&tx, "timeout").await.unwrap());
        assert!(p.confirm_retry(&tx, "timeout").await.unwrap());
        assert_eq!(p.completion_stats().processed, 1);
    }
}
