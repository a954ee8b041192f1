//! Task results: records plus tagged non-fatal and fatal conditions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::record::Record;

/// Severity-tagged condition attached to a task result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    /// Records may be partial; the run continues.
    Warning(String),
    /// The task (or the run, for programming faults) failed.
    Fatal(String),
}

impl Outcome {
    pub fn warning(msg: impl fmt::Display) -> Self { Outcome::Warning(msg.to_string()) }
    pub fn fatal(msg: impl fmt::Display) -> Self { Outcome::Fatal(msg.to_string()) }

    pub fn is_ok(&self) -> bool { matches!(self, Outcome::Ok) }
    pub fn is_warning(&self) -> bool { matches!(self, Outcome::Warning(_)) }
    pub fn is_fatal(&self) -> bool { matches!(self, Outcome::Fatal(_)) }

    pub fn message(&self) -> &str {
        match self {
            Outcome::Ok => "",
            Outcome::Warning(m) | Outcome::Fatal(m) => m,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Outcome::Ok => 0,
            Outcome::Warning(_) => 1,
            Outcome::Fatal(_) => 2,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => write!(f, "ok"),
            Outcome::Warning(m) => write!(f, "warning: {m}"),
            Outcome::Fatal(m) => write!(f, "fatal: {m}"),
        }
    }
}

/// What one task hands back to the dispatcher.
///
/// No records and no outcomes means the gathered kind is not installed.
#[derive(Debug, Default)]
pub struct TaskOutput {
    pub records: Vec<Record>,
    pub outcomes: Vec<Outcome>,
}

impl TaskOutput {
    pub fn new() -> Self { Self::default() }

    /// Resource kind absent; a valid, silent outcome.
    pub fn not_installed() -> Self { Self::default() }

    pub fn from_records(records: Vec<Record>) -> Self { Self { records, outcomes: Vec::new() } }

    pub fn fatal(msg: impl fmt::Display) -> Self {
        Self { records: Vec::new(), outcomes: vec![Outcome::fatal(msg)] }
    }

    pub fn push(&mut self, r: Record) { self.records.push(r); }
    pub fn warn(&mut self, msg: impl fmt::Display) { self.outcomes.push(Outcome::warning(msg)); }
    pub fn fail(&mut self, msg: impl fmt::Display) { self.outcomes.push(Outcome::fatal(msg)); }

    pub fn extend(&mut self, other: TaskOutput) {
        self.records.extend(other.records);
        self.outcomes.extend(other.outcomes);
    }

    pub fn is_empty(&self) -> bool { self.records.is_empty() && self.outcomes.is_empty() }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter(|o| o.is_warning()).map(Outcome::message)
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter(|o| o.is_fatal()).map(Outcome::message)
    }

    /// The most severe outcome, `Ok` if none.
    pub fn status(&self) -> Outcome {
        self.outcomes.iter().max_by_key(|o| o.rank()).cloned().unwrap_or(Outcome::Ok)
    }
}

impl From<Vec<Record>> for TaskOutput {
    fn from(records: Vec<Record>) -> Self { Self::from_records(records) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_picks_most_severe() {
        let mut out = TaskOutput::new();
        assert_eq!(out.status(), Outcome::Ok);
        out.warn("partial");
        assert!(out.status().is_warning());
        out.fail("boom");
        out.warn("again");
        assert_eq!(out.status(), Outcome::Fatal("boom".into()));
        assert_eq!(out.warnings().count(), 2);
        assert_eq!(out.errors().collect::<Vec<_>>(), vec!["boom"]);
    }

    #[test]
    fn not_installed_is_empty() {
        assert!(TaskOutput::not_installed().is_empty());
    }
}
