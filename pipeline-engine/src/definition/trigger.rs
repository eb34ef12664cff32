// Trigger Filters
// Decides whether an incoming event (kind, branch, commit) starts a pipeline run

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

/// Kinds of events that can start a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    /// Started by hand; always passes the trigger filters
    Manual,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Push => write!(f, "push"),
            EventKind::PullRequest => write!(f, "pull_request"),
            EventKind::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            "manual" | "workflow_dispatch" => Ok(EventKind::Manual),
            _ => Err(format!(
                "Unknown event kind '{}'. Valid kinds: push, pull_request, manual",
                s
            )),
        }
    }
}

/// The external event that asks for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: EventKind,
    /// Branch name without the `refs/heads/` prefix
    pub branch: String,
    /// Commit reference the run is for
    pub commit: String,
}

impl TriggerEvent {
    pub fn new(kind: EventKind, branch: impl Into<String>, commit: impl Into<String>) -> Self {
        let branch = branch.into();
        let branch = branch
            .strip_prefix("refs/heads/")
            .map(str::to_string)
            .unwrap_or(branch);

        Self {
            kind,
            branch,
            commit: commit.into(),
        }
    }

    pub fn manual(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self::new(EventKind::Manual, branch, commit)
    }
}

/// Branch include/ignore patterns for one event kind.
///
/// `*` does not cross `/`; `**` does.
#[derive(Debug, Clone, Default)]
pub struct BranchFilter {
    branches: Vec<Pattern>,
    branches_ignore: Vec<Pattern>,
}

impl BranchFilter {
    /// Compile a filter; fails on the first malformed pattern
    pub fn new(branches: &[String], branches_ignore: &[String]) -> Result<Self, String> {
        let compile = |patterns: &[String]| -> Result<Vec<Pattern>, String> {
            patterns
                .iter()
                .map(|p| {
                    Pattern::new(p).map_err(|e| format!("invalid branch pattern '{}': {}", p, e))
                })
                .collect()
        };

        Ok(Self {
            branches: compile(branches)?,
            branches_ignore: compile(branches_ignore)?,
        })
    }

    pub fn matches(&self, branch: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        if !self.branches.is_empty()
            && !self
                .branches
                .iter()
                .any(|p| p.matches_with(branch, options))
        {
            return false;
        }

        !self
            .branches_ignore
            .iter()
            .any(|p| p.matches_with(branch, options))
    }

    pub fn branches(&self) -> Vec<&str> {
        self.branches.iter().map(Pattern::as_str).collect()
    }

    pub fn branches_ignore(&self) -> Vec<&str> {
        self.branches_ignore.iter().map(Pattern::as_str).collect()
    }
}

/// Outcome of checking an event against the trigger filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    Accepted,
    Rejected { reason: String },
}

/// Trigger conditions of a pipeline definition
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    /// False when the definition has no `on:`; such a pipeline accepts every event
    declared: bool,
    events: Vec<(EventKind, BranchFilter)>,
}

impl Trigger {
    /// A trigger that accepts every event
    pub fn any() -> Self {
        Self::default()
    }

    /// A declared trigger with no events yet; rejects everything but manual runs
    pub fn declared() -> Self {
        Self {
            declared: true,
            events: Vec::new(),
        }
    }

    pub fn on(mut self, kind: EventKind, filter: BranchFilter) -> Self {
        self.declared = true;
        self.events.retain(|(k, _)| *k != kind);
        self.events.push((kind, filter));
        self
    }

    pub fn is_declared(&self) -> bool {
        self.declared
    }

    pub fn events(&self) -> impl Iterator<Item = &(EventKind, BranchFilter)> {
        self.events.iter()
    }

    pub fn evaluate(&self, event: &TriggerEvent) -> TriggerDecision {
        if event.kind == EventKind::Manual || !self.declared {
            return TriggerDecision::Accepted;
        }

        match self.events.iter().find(|(kind, _)| *kind == event.kind) {
            None => TriggerDecision::Rejected {
                reason: format!("pipeline is not triggered by {} events", event.kind),
            },
            Some((_, filter)) if !filter.matches(&event.branch) => TriggerDecision::Rejected {
                reason: format!(
                    "branch '{}' does not match the {} branch filters",
                    event.branch, event.kind
                ),
            },
            Some(_) => TriggerDecision::Accepted,
        }
    }
}
