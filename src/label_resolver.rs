//! Label name to Gmail label id resolution, creating labels on demand
//!
//! Gmail label names are unique ignoring case. Resolution is optimistic: on a
//! cache miss the remote label list is consulted (once per resolver), and if
//! the name is still unknown the label is created. A create that loses a race
//! against another process comes back as a conflict; the resolver then
//! re-lists and adopts the existing label instead of failing.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::MailProvider;
use crate::error::{ErrorClass, LabelerError, Result};
use crate::models::LabelInfo;
use crate::retry::{with_retry, RetryPolicy};

/// Outcome of a successful [`LabelResolver::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub label: LabelInfo,
    /// This call created the label remotely
    pub created: bool,
}

#[derive(Debug, Default)]
struct ResolverState {
    /// Lowercased name -> label
    cache: HashMap<String, LabelInfo>,
    remote_loaded: bool,
    created: Vec<LabelInfo>,
}

impl ResolverState {
    fn get(&self, name: &str) -> Option<&LabelInfo> {
        self.cache.get(&cache_key(name))
    }

    fn insert(&mut self, label: LabelInfo) {
        self.cache.insert(cache_key(&label.name), label);
    }

    fn absorb(&mut self, labels: Vec<LabelInfo>) {
        for label in labels {
            self.insert(label);
        }
    }
}

fn cache_key(name: &str) -> String {
    name.trim().to_lowercase()
}

pub struct LabelResolver {
    provider: Arc<dyn MailProvider>,
    retry: RetryPolicy,
    create_parents: bool,
    state: Mutex<ResolverState>,
}

impl LabelResolver {
    pub fn new(provider: Arc<dyn MailProvider>, retry: RetryPolicy, create_parents: bool) -> Self {
        Self {
            provider,
            retry,
            create_parents,
            state: Mutex::new(ResolverState::default()),
        }
    }

    /// Resolve `name` to a label id, creating the label if it does not exist
    ///
    /// Authentication failures and cancellation propagate unchanged; any other
    /// failure is reported as [`LabelerError::ResolutionError`].
    pub async fn resolve(&self, name: &str, cancel: &CancellationToken) -> Result<Resolution> {
        let name = name.trim();

        // Held for the whole miss path so concurrent rules in this process
        // never race each other to create the same label
        let mut state = self.state.lock().await;

        if let Some(label) = state.get(name) {
            return Ok(Resolution {
                label: label.clone(),
                created: false,
            });
        }

        self.ensure_loaded(&mut state, cancel)
            .await
            .map_err(|e| wrap(name, e))?;

        if let Some(label) = state.get(name) {
            debug!("Label '{}' already exists as {}", name, label.id);
            return Ok(Resolution {
                label: label.clone(),
                created: false,
            });
        }

        if self.create_parents {
            for parent in parent_paths(name) {
                if state.get(&parent).is_none() {
                    debug!("Creating parent label: {}", parent);
                    self.create_or_adopt(&mut state, &parent, cancel)
                        .await
                        .map_err(|e| wrap(name, e))?;
                }
            }
        }

        self.create_or_adopt(&mut state, name, cancel)
            .await
            .map_err(|e| wrap(name, e))
    }

    /// Look a label up without ever creating it
    pub async fn lookup(&self, name: &str, cancel: &CancellationToken) -> Result<Option<LabelInfo>> {
        let name = name.trim();
        let mut state = self.state.lock().await;

        if let Some(label) = state.get(name) {
            return Ok(Some(label.clone()));
        }

        self.ensure_loaded(&mut state, cancel)
            .await
            .map_err(|e| wrap(name, e))?;

        Ok(state.get(name).cloned())
    }

    /// Labels this resolver created, in creation order
    pub async fn created_labels(&self) -> Vec<LabelInfo> {
        self.state.lock().await.created.clone()
    }

    async fn ensure_loaded(&self, state: &mut ResolverState, cancel: &CancellationToken) -> Result<()> {
        if state.remote_loaded {
            return Ok(());
        }

        let labels = self.list_remote(cancel).await?;
        info!("Loaded {} existing labels", labels.len());
        state.absorb(labels);
        state.remote_loaded = true;
        Ok(())
    }

    async fn list_remote(&self, cancel: &CancellationToken) -> Result<Vec<LabelInfo>> {
        let provider = self.provider.clone();
        with_retry(&self.retry, "labels.list", cancel, || {
            let provider = provider.clone();
            async move { provider.list_labels().await }
        })
        .await
    }

    async fn create_or_adopt(
        &self,
        state: &mut ResolverState,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Resolution> {
        info!("Creating label: {}", name);

        let provider = self.provider.clone();
        let created = with_retry(&self.retry, "labels.create", cancel, || {
            let provider = provider.clone();
            let name = name.to_string();
            async move { provider.create_label(&name).await }
        })
        .await;

        match created {
            Ok(label) => {
                info!("Created label '{}' with ID: {}", label.name, label.id);
                state.insert(label.clone());
                state.created.push(label.clone());
                Ok(Resolution {
                    label,
                    created: true,
                })
            }
            Err(LabelerError::LabelConflict(detail)) => {
                warn!(
                    "Label '{}' was created concurrently ({}), re-resolving by name",
                    name, detail
                );
                let labels = self.list_remote(cancel).await?;
                state.absorb(labels);

                state
                    .get(name)
                    .cloned()
                    .map(|label| Resolution {
                        label,
                        created: false,
                    })
                    .ok_or_else(|| LabelerError::ResolutionError {
                        label: name.to_string(),
                        reason: format!(
                            "create reported a conflict but no such label is listed: {}",
                            detail
                        ),
                    })
            }
            Err(e) => Err(e),
        }
    }
}

/// `A/B/C` -> `["A", "A/B"]`
fn parent_paths(name: &str) -> Vec<String> {
    let parts: Vec<&str> = name.split('/').collect();
    (1..parts.len()).map(|i| parts[..i].join("/")).collect()
}

fn wrap(name: &str, error: LabelerError) -> LabelerError {
    match error.class() {
        ErrorClass::Auth | ErrorClass::Cancelled | ErrorClass::Resolution => error,
        _ => LabelerError::ResolutionError {
            label: name.to_string(),
            reason: error.to_string(),
        },
    }
}
