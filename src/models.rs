use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// OAuth token pair persisted by the credential store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: DateTime<Utc>,
}

impl Credential {
    /// A credential is treated as expired `skew` before its actual expiry
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now + skew >= self.expiry
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.trim().is_empty()
    }
}

/// A configured pairing of a search predicate and a target label name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: String,
    /// Passed verbatim to the provider's search
    pub query: String,
    pub label_name: String,
    pub enabled: bool,
}

/// Label as known to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelInfo {
    pub id: String,
    pub name: String,
}

/// One page of search results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub message_ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Why a single message could not be labeled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Forbidden,
    BadRequest,
    /// Transient failures persisted past the retry budget
    RetriesExhausted,
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::NotFound => "not found",
            FailureKind::Forbidden => "forbidden",
            FailureKind::BadRequest => "bad request",
            FailureKind::RetriesExhausted => "retries exhausted",
            FailureKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFailure {
    pub message_id: String,
    pub kind: FailureKind,
    pub detail: String,
}

/// How a rule's evaluation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RuleOutcome {
    Completed,
    Failed { reason: String },
    Cancelled,
}

/// Summary of one rule evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub rule_id: String,
    pub label_name: String,
    pub label_id: Option<String>,
    pub outcome: RuleOutcome,
    pub matched: usize,
    pub labeled: usize,
    /// Messages never attempted because the run was cancelled
    pub skipped: usize,
    pub failed: Vec<MessageFailure>,
    pub label_created: bool,
    /// Dry run only: the label does not exist yet
    pub would_create_label: bool,
}

impl RunResult {
    pub fn new(rule: &Rule) -> Self {
        Self {
            rule_id: rule.id.clone(),
            label_name: rule.label_name.clone(),
            label_id: None,
            outcome: RuleOutcome::Completed,
            matched: 0,
            labeled: 0,
            skipped: 0,
            failed: Vec::new(),
            label_created: false,
            would_create_label: false,
        }
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.outcome = RuleOutcome::Failed {
            reason: reason.into(),
        };
        self
    }

    pub fn cancelled(mut self) -> Self {
        self.outcome = RuleOutcome::Cancelled;
        self
    }

    /// Rule-level failure (not a per-message one)
    pub fn is_rule_failure(&self) -> bool {
        matches!(self.outcome, RuleOutcome::Failed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, RuleOutcome::Cancelled)
    }
}
