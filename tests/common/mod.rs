//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use gmail_labeler::client::MailProvider;
use gmail_labeler::credentials::TokenSource;
use gmail_labeler::error::{LabelerError, Result};
use gmail_labeler::label_resolver::LabelResolver;
use gmail_labeler::models::{LabelInfo, MessagePage, Rule};
use gmail_labeler::orchestrator::{Labeler, LabelerOptions};
use gmail_labeler::rate_limiter::QuotaRateLimiter;
use gmail_labeler::retry::RetryPolicy;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

/// Injected failure for a single message's `add_label`
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    NotFound,
    Forbidden,
    /// 503 on every attempt
    Unavailable,
    /// 503 on the first `n` attempts, then success
    UnavailableTimes(u32),
    /// Credentials rejected
    Auth,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub search: usize,
    pub list_labels: usize,
    pub create_label: usize,
    pub add_label: usize,
}

#[derive(Default)]
struct MailboxState {
    labels: Vec<LabelInfo>,
    next_label: u32,
    /// message id -> label ids
    messages: HashMap<String, BTreeSet<String>>,
    /// query -> matching message ids, in result order
    queries: HashMap<String, Vec<String>>,
    faults: HashMap<String, Fault>,
    attempts: HashMap<String, u32>,
    failing_queries: HashSet<String>,
    forbidden_labels: HashSet<String>,
    calls: CallCounts,
}

/// In-memory mailbox with Gmail's label semantics
///
/// Label names are unique ignoring case; creating a duplicate returns
/// [`LabelerError::LabelConflict`]. Adding a label a message already has
/// succeeds. Search results are paged `page_size` ids at a time.
pub struct FakeMailbox {
    state: Mutex<MailboxState>,
    page_size: usize,
    list_barrier: Option<Arc<Barrier>>,
    barrier_calls: AtomicUsize,
    barrier_limit: usize,
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(MailboxState::default()),
            page_size: page_size.max(1),
            list_barrier: None,
            barrier_calls: AtomicUsize::new(0),
            barrier_limit: 0,
        }
    }

    /// Hold the first `parties` `list_labels` calls until all have arrived
    ///
    /// Each of them sees the label list as it was before any of them returned.
    pub fn with_list_barrier(mut self, parties: usize) -> Self {
        self.list_barrier = Some(Arc::new(Barrier::new(parties)));
        self.barrier_limit = parties;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap()
    }

    /// Register messages returned by `query`
    pub fn add_query(&self, query: &str, message_ids: &[&str]) {
        let mut state = self.state();
        for id in message_ids {
            state.messages.entry(id.to_string()).or_default();
        }
        state.queries.insert(
            query.to_string(),
            message_ids.iter().map(|id| id.to_string()).collect(),
        );
    }

    /// A label that already exists before the run
    pub fn seed_label(&self, name: &str) -> LabelInfo {
        let mut state = self.state();
        insert_label(&mut state, name)
    }

    pub fn set_fault(&self, message_id: &str, fault: Fault) {
        self.state().faults.insert(message_id.to_string(), fault);
    }

    /// `search` for this query fails with a bad request
    pub fn fail_query(&self, query: &str) {
        self.state().failing_queries.insert(query.to_string());
    }

    /// `create_label` for this name is refused
    pub fn forbid_label(&self, name: &str) {
        self.state().forbidden_labels.insert(name.to_lowercase());
    }

    pub fn labels(&self) -> Vec<LabelInfo> {
        self.state().labels.clone()
    }

    pub fn labels_named(&self, name: &str) -> Vec<LabelInfo> {
        let key = name.to_lowercase();
        self.state()
            .labels
            .iter()
            .filter(|l| l.name.to_lowercase() == key)
            .cloned()
            .collect()
    }

    pub fn label_ids_of(&self, message_id: &str) -> BTreeSet<String> {
        self.state()
            .messages
            .get(message_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `message_id` carries the label called `name`
    pub fn has_label(&self, message_id: &str, name: &str) -> bool {
        let state = self.state();
        let key = name.to_lowercase();
        let Some(label) = state.labels.iter().find(|l| l.name.to_lowercase() == key) else {
            return false;
        };
        state
            .messages
            .get(message_id)
            .map(|ids| ids.contains(&label.id))
            .unwrap_or(false)
    }

    pub fn attempts(&self, message_id: &str) -> u32 {
        self.state().attempts.get(message_id).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }
}

impl Default for FakeMailbox {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_label(state: &mut MailboxState, name: &str) -> LabelInfo {
    state.next_label += 1;
    let label = LabelInfo {
        id: format!("Label_{}", state.next_label),
        name: name.to_string(),
    };
    state.labels.push(label.clone());
    label
}

fn unavailable() -> LabelerError {
    LabelerError::ServerError {
        status: 503,
        message: "backend unavailable".to_string(),
    }
}

#[async_trait]
impl MailProvider for FakeMailbox {
    async fn search(&self, query: &str, page_token: Option<String>) -> Result<MessagePage> {
        let mut state = self.state();
        state.calls.search += 1;

        if state.failing_queries.contains(query) {
            return Err(LabelerError::BadRequest(format!("Invalid query: {}", query)));
        }

        let offset = match page_token {
            Some(token) => token
                .strip_prefix("offset-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| LabelerError::BadRequest(format!("bad page token {}", token)))?,
            None => 0,
        };

        let ids = state.queries.get(query).cloned().unwrap_or_default();
        let end = (offset + self.page_size).min(ids.len());
        let page = ids.get(offset..end).map(<[String]>::to_vec).unwrap_or_default();

        Ok(MessagePage {
            message_ids: page,
            next_page_token: (end < ids.len()).then(|| format!("offset-{}", end)),
        })
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        let snapshot = {
            let mut state = self.state();
            state.calls.list_labels += 1;
            state.labels.clone()
        };

        if let Some(barrier) = &self.list_barrier {
            if self.barrier_calls.fetch_add(1, Ordering::SeqCst) < self.barrier_limit {
                barrier.wait().await;
            }
        }

        Ok(snapshot)
    }

    async fn create_label(&self, name: &str) -> Result<LabelInfo> {
        let mut state = self.state();
        state.calls.create_label += 1;

        let key = name.to_lowercase();
        if state.forbidden_labels.contains(&key) {
            return Err(LabelerError::Forbidden(format!("cannot create {}", name)));
        }
        if state.labels.iter().any(|l| l.name.to_lowercase() == key) {
            return Err(LabelerError::LabelConflict(format!(
                "Label name exists or conflicts: {}",
                name
            )));
        }

        Ok(insert_label(&mut state, name))
    }

    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.add_label += 1;

        let attempt = {
            let n = state.attempts.entry(message_id.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        match state.faults.get(message_id).copied() {
            Some(Fault::NotFound) => {
                return Err(LabelerError::MessageNotFound(message_id.to_string()))
            }
            Some(Fault::Forbidden) => return Err(LabelerError::Forbidden(message_id.to_string())),
            Some(Fault::Unavailable) => return Err(unavailable()),
            Some(Fault::UnavailableTimes(n)) if attempt <= n => return Err(unavailable()),
            Some(Fault::Auth) => {
                return Err(LabelerError::AuthError("Token has been revoked".to_string()))
            }
            _ => {}
        }

        if !state.labels.iter().any(|l| l.id == label_id) {
            return Err(LabelerError::BadRequest(format!("Invalid label: {}", label_id)));
        }

        match state.messages.get_mut(message_id) {
            Some(labels) => {
                labels.insert(label_id.to_string());
                Ok(())
            }
            None => Err(LabelerError::MessageNotFound(message_id.to_string())),
        }
    }
}

/// Which provider call trips [`CancellingMailbox`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPoint {
    /// After the first search page is returned
    FirstPage,
    /// After the first message is labeled
    FirstLabel,
}

/// Delegates to a [`FakeMailbox`] and cancels `token` once the chosen call
/// has completed, the way Ctrl-C lands between two requests
pub struct CancellingMailbox {
    pub inner: Arc<FakeMailbox>,
    pub token: CancellationToken,
    point: CancelPoint,
}

impl CancellingMailbox {
    pub fn new(inner: Arc<FakeMailbox>, point: CancelPoint) -> Self {
        Self {
            inner,
            token: CancellationToken::new(),
            point,
        }
    }

    fn trip(&self, at: CancelPoint) {
        if self.point == at {
            self.token.cancel();
        }
    }
}

#[async_trait]
impl MailProvider for CancellingMailbox {
    async fn search(&self, query: &str, page_token: Option<String>) -> Result<MessagePage> {
        let page = self.inner.search(query, page_token).await?;
        self.trip(CancelPoint::FirstPage);
        Ok(page)
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        self.inner.list_labels().await
    }

    async fn create_label(&self, name: &str) -> Result<LabelInfo> {
        self.inner.create_label(name).await
    }

    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        self.inner.add_label(message_id, label_id).await?;
        self.trip(CancelPoint::FirstLabel);
        Ok(())
    }
}

/// Token source that never touches the network
pub struct StaticTokens {
    revoked: bool,
}

impl StaticTokens {
    pub fn valid() -> Arc<Self> {
        Arc::new(Self { revoked: false })
    }

    pub fn revoked() -> Arc<Self> {
        Arc::new(Self { revoked: true })
    }
}

#[async_trait]
impl TokenSource for StaticTokens {
    async fn valid_token(&self) -> Result<String> {
        if self.revoked {
            Err(LabelerError::AuthError("refresh token revoked".to_string()))
        } else {
            Ok("ya29.test-token".to_string())
        }
    }
}

pub fn rule(id: &str, query: &str, label: &str) -> Rule {
    Rule {
        id: id.to_string(),
        query: query.to_string(),
        label_name: label.to_string(),
        enabled: true,
    }
}

pub fn test_options(dry_run: bool) -> LabelerOptions {
    LabelerOptions {
        max_concurrent_requests: 4,
        max_parallel_rules: 1,
        dry_run,
    }
}

/// A labeler over `mailbox` with instant retries and an unthrottled quota gate
pub fn labeler(mailbox: &Arc<FakeMailbox>, options: LabelerOptions) -> Labeler {
    labeler_with_tokens(mailbox, options, StaticTokens::valid())
}

pub fn labeler_with_tokens(
    mailbox: &Arc<FakeMailbox>,
    options: LabelerOptions,
    tokens: Arc<dyn TokenSource>,
) -> Labeler {
    labeler_over(mailbox.clone(), options, tokens)
}

pub fn labeler_over(
    provider: Arc<dyn MailProvider>,
    options: LabelerOptions,
    tokens: Arc<dyn TokenSource>,
) -> Labeler {
    let retry = RetryPolicy::immediate(3);
    let resolver = Arc::new(LabelResolver::new(provider.clone(), retry.clone(), true));
    Labeler::new(
        provider,
        resolver,
        tokens,
        QuotaRateLimiter::with_config(1_000_000.0, 1_000_000.0),
        retry,
        options,
    )
}
