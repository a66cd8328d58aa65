//! Labeling orchestrator
//!
//! For every due rule: resolve the target label, page through the rule's
//! search until the provider runs out of pages, then add the label to each
//! discovered message. Message failures are recorded on the rule; rule
//! failures are recorded in the report; only authentication failures abort
//! the run.

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::MailProvider;
use crate::config::Config;
use crate::credentials::TokenSource;
use crate::error::{ErrorClass, LabelerError, Result};
use crate::label_resolver::LabelResolver;
use crate::models::{FailureKind, MessageFailure, Rule, RunResult};
use crate::rate_limiter::QuotaRateLimiter;
use crate::report::RunReport;
use crate::retry::{with_retry, RetryPolicy};
use crate::rules::RuleEngine;

#[derive(Debug, Clone)]
pub struct LabelerOptions {
    /// Label calls in flight per rule
    pub max_concurrent_requests: usize,
    /// Rules evaluated at the same time
    pub max_parallel_rules: usize,
    /// Discover and resolve only; never create labels or modify messages
    pub dry_run: bool,
}

impl Default for LabelerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            max_parallel_rules: 1,
            dry_run: false,
        }
    }
}

/// Progress notifications for interactive display
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    RuleStarted {
        rule_id: String,
        label_name: String,
    },
    PageFetched {
        rule_id: String,
        page: usize,
        discovered: usize,
    },
    LabelingStarted {
        rule_id: String,
        total: usize,
    },
    MessageProcessed {
        rule_id: String,
    },
    RuleFinished {
        result: RunResult,
    },
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

enum MessageOutcome {
    Labeled,
    Skipped,
    Failed(MessageFailure),
    Fatal(LabelerError),
}

pub struct Labeler {
    provider: Arc<dyn MailProvider>,
    resolver: Arc<LabelResolver>,
    tokens: Arc<dyn TokenSource>,
    rate_limiter: QuotaRateLimiter,
    retry: RetryPolicy,
    options: LabelerOptions,
    progress: Option<ProgressCallback>,
}

impl Labeler {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        resolver: Arc<LabelResolver>,
        tokens: Arc<dyn TokenSource>,
        rate_limiter: QuotaRateLimiter,
        retry: RetryPolicy,
        options: LabelerOptions,
    ) -> Self {
        Self {
            provider,
            resolver,
            tokens,
            rate_limiter,
            retry,
            options,
            progress: None,
        }
    }

    /// Wire a labeler from configuration, building the label resolver for
    /// this mailbox on the way
    pub fn from_config(
        config: &Config,
        provider: Arc<dyn MailProvider>,
        tokens: Arc<dyn TokenSource>,
        rate_limiter: QuotaRateLimiter,
        dry_run: bool,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let resolver = Arc::new(LabelResolver::new(
            provider.clone(),
            retry.clone(),
            config.labels.create_parents,
        ));
        let options = LabelerOptions {
            max_concurrent_requests: config.execution.max_concurrent_requests,
            max_parallel_rules: config.execution.max_parallel_rules,
            dry_run,
        };

        Self::new(provider, resolver, tokens, rate_limiter, retry, options)
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }

    /// Evaluate the due rules and report on each
    ///
    /// Returns `Err` only for failures that make the whole run meaningless:
    /// an unknown rule selection or unusable credentials.
    pub async fn run(
        &self,
        engine: &RuleEngine,
        selection: &[String],
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let mut report = RunReport::new(self.options.dry_run);
        let rules = engine.due_rules(selection)?;

        info!(
            "Starting run {} with {} rule(s){}",
            report.run_id,
            rules.len(),
            if self.options.dry_run { " (dry run)" } else { "" }
        );

        // Fail fast before touching the mailbox
        self.tokens.valid_token().await?;

        // Tripped by an auth failure so sibling rules wind down cooperatively
        let run_cancel = cancel.child_token();

        let outcomes: Vec<Result<RunResult>> = stream::iter(rules)
            .map(|rule| {
                let run_cancel = run_cancel.clone();
                async move {
                    let outcome = self.run_rule(&rule, &run_cancel).await;
                    if let Err(e) = &outcome {
                        error!("Rule '{}' aborted the run: {}", rule.id, e);
                        run_cancel.cancel();
                    }
                    outcome
                }
            })
            .buffered(self.options.max_parallel_rules.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            report.results.push(outcome?);
        }

        report.cancelled = cancel.is_cancelled();
        report.labels_created = self.resolver.created_labels().await;
        report.quota = self.rate_limiter.stats().await;
        report.finished_at = chrono::Utc::now();

        let totals = report.totals();
        info!(
            "Run {} finished: {} rule(s), {} failed, {} matched, {} labeled",
            report.run_id, totals.rules, totals.rules_failed, totals.matched, totals.labeled
        );

        Ok(report)
    }

    /// Evaluate one rule; `Err` only for run-fatal failures
    pub async fn run_rule(&self, rule: &Rule, cancel: &CancellationToken) -> Result<RunResult> {
        let mut result = RunResult::new(rule);

        if cancel.is_cancelled() {
            return Ok(self.finish(result.cancelled()));
        }

        info!("Evaluating rule '{}' -> '{}'", rule.id, rule.label_name);
        self.emit(ProgressEvent::RuleStarted {
            rule_id: rule.id.clone(),
            label_name: rule.label_name.clone(),
        });

        let label_id = if self.options.dry_run {
            match self.resolver.lookup(&rule.label_name, cancel).await {
                Ok(Some(label)) => Some(label.id),
                Ok(None) => {
                    result.would_create_label = true;
                    None
                }
                Err(e) => return self.rule_error(result, e),
            }
        } else {
            match self.resolver.resolve(&rule.label_name, cancel).await {
                Ok(resolution) => {
                    result.label_created = resolution.created;
                    Some(resolution.label.id)
                }
                Err(e) => return self.rule_error(result, e),
            }
        };
        result.label_id = label_id.clone();

        let message_ids = match self.discover(rule, cancel).await {
            Ok(ids) => ids,
            Err(e) => return self.rule_error(result, e),
        };
        result.matched = message_ids.len();

        let label_id = match label_id {
            Some(id) if !self.options.dry_run => id,
            _ => {
                info!(
                    "Rule '{}' would label {} message(s) with '{}'",
                    rule.id, result.matched, rule.label_name
                );
                return Ok(self.finish(result));
            }
        };

        self.emit(ProgressEvent::LabelingStarted {
            rule_id: rule.id.clone(),
            total: message_ids.len(),
        });

        let mut outcomes: Vec<(usize, MessageOutcome)> = stream::iter(message_ids.iter().enumerate())
            .map(|(index, message_id)| {
                let label_id = label_id.as_str();
                async move {
                    let outcome = self.apply(rule, message_id, label_id, cancel).await;
                    (index, outcome)
                }
            })
            .buffer_unordered(self.options.max_concurrent_requests.max(1))
            .collect()
            .await;

        // Report failures in discovery order
        outcomes.sort_by_key(|(index, _)| *index);

        let mut fatal = None;
        for (_, outcome) in outcomes {
            match outcome {
                MessageOutcome::Labeled => result.labeled += 1,
                MessageOutcome::Skipped => result.skipped += 1,
                MessageOutcome::Failed(failure) => result.failed.push(failure),
                MessageOutcome::Fatal(e) => {
                    result.skipped += 1;
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        if result.skipped > 0 {
            warn!(
                "Rule '{}' cancelled with {} message(s) not attempted",
                rule.id, result.skipped
            );
            result = result.cancelled();
        }

        info!(
            "Rule '{}': {} matched, {} labeled, {} failed",
            rule.id,
            result.matched,
            result.labeled,
            result.failed.len()
        );
        Ok(self.finish(result))
    }

    fn finish(&self, result: RunResult) -> RunResult {
        self.emit(ProgressEvent::RuleFinished {
            result: result.clone(),
        });
        result
    }

    fn rule_error(&self, result: RunResult, error: LabelerError) -> Result<RunResult> {
        match error.class() {
            ErrorClass::Auth | ErrorClass::Config => Err(error),
            ErrorClass::Cancelled => {
                info!("Rule '{}' cancelled", result.rule_id);
                Ok(self.finish(result.cancelled()))
            }
            _ => {
                warn!("Rule '{}' failed: {}", result.rule_id, error);
                Ok(self.finish(result.failed(error.to_string())))
            }
        }
    }

    /// Follow page tokens until the provider reports no further page
    ///
    /// Ids are de-duplicated across pages, keeping first-seen order.
    async fn discover(&self, rule: &Rule, cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut seen_tokens = HashSet::new();
        let mut message_ids = Vec::new();
        let mut page_token: Option<String> = None;
        let mut page = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(LabelerError::Cancelled(format!(
                    "discovery for rule '{}' stopped after {} page(s)",
                    rule.id, page
                )));
            }

            let result = with_retry(&self.retry, "messages.list", cancel, || {
                let provider = self.provider.clone();
                let token = page_token.clone();
                async move { provider.search(&rule.query, token).await }
            })
            .await?;

            page += 1;
            for id in result.message_ids {
                if seen.insert(id.clone()) {
                    message_ids.push(id);
                }
            }

            debug!(
                "Rule '{}' page {}: {} unique message(s) so far",
                rule.id,
                page,
                message_ids.len()
            );
            self.emit(ProgressEvent::PageFetched {
                rule_id: rule.id.clone(),
                page,
                discovered: message_ids.len(),
            });

            match result.next_page_token {
                Some(token) => {
                    if !seen_tokens.insert(token.clone()) {
                        return Err(LabelerError::ApiError(format!(
                            "provider repeated page token after page {}",
                            page
                        )));
                    }
                    page_token = Some(token);
                }
                None => break,
            }
        }

        Ok(message_ids)
    }

    async fn apply(
        &self,
        rule: &Rule,
        message_id: &str,
        label_id: &str,
        cancel: &CancellationToken,
    ) -> MessageOutcome {
        if cancel.is_cancelled() {
            return MessageOutcome::Skipped;
        }

        let result = with_retry(&self.retry, "messages.modify", cancel, || {
            let provider = self.provider.clone();
            async move { provider.add_label(message_id, label_id).await }
        })
        .await;

        let outcome = match result {
            Ok(()) => MessageOutcome::Labeled,
            Err(e) => match e.class() {
                ErrorClass::Cancelled => MessageOutcome::Skipped,
                ErrorClass::Auth | ErrorClass::Config => {
                    cancel.cancel();
                    MessageOutcome::Fatal(e)
                }
                _ => {
                    warn!("Failed to label message {} for rule '{}': {}", message_id, rule.id, e);
                    MessageOutcome::Failed(MessageFailure {
                        message_id: message_id.to_string(),
                        kind: failure_kind(&e),
                        detail: e.to_string(),
                    })
                }
            },
        };

        self.emit(ProgressEvent::MessageProcessed {
            rule_id: rule.id.clone(),
        });
        outcome
    }
}

fn failure_kind(error: &LabelerError) -> FailureKind {
    match error {
        LabelerError::MessageNotFound(_) => FailureKind::NotFound,
        LabelerError::Forbidden(_) => FailureKind::Forbidden,
        LabelerError::BadRequest(_) => FailureKind::BadRequest,
        e if e.class() == ErrorClass::Retryable => FailureKind::RetriesExhausted,
        _ => FailureKind::Other,
    }
}
