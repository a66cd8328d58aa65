//! Mail provider boundary and its Gmail implementation
//!
//! The provider is deliberately thin: one method per remote operation, each
//! gated by the shared quota limiter and bounded by a request timeout. It
//! never retries; callers decide what is worth another attempt.

use async_trait::async_trait;
use google_gmail1::api::{Label, ModifyMessageRequest};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::GmailHub;
use crate::error::{LabelerError, Result};
use crate::models::{LabelInfo, MessagePage};
use crate::rate_limiter::{QuotaCost, QuotaRateLimiter};

const SCOPE_MODIFY: &str = "https://www.googleapis.com/auth/gmail.modify";
const SCOPE_LABELS: &str = "https://www.googleapis.com/auth/gmail.labels";

/// Remote mailbox operations the labeling engine relies on
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// One page of message ids matching `query`
    async fn search(&self, query: &str, page_token: Option<String>) -> Result<MessagePage>;

    async fn list_labels(&self) -> Result<Vec<LabelInfo>>;

    /// Fails with [`LabelerError::LabelConflict`] if the name is taken
    async fn create_label(&self, name: &str) -> Result<LabelInfo>;

    /// Adding a label the message already carries succeeds
    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<()>;
}

#[async_trait]
impl<T: MailProvider + ?Sized> MailProvider for Arc<T> {
    async fn search(&self, query: &str, page_token: Option<String>) -> Result<MessagePage> {
        (**self).search(query, page_token).await
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        (**self).list_labels().await
    }

    async fn create_label(&self, name: &str) -> Result<LabelInfo> {
        (**self).create_label(name).await
    }

    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        (**self).add_label(message_id, label_id).await
    }
}

/// [`MailProvider`] backed by the Gmail REST API
pub struct GmailProvider {
    hub: GmailHub,
    rate_limiter: QuotaRateLimiter,
    page_size: u32,
    request_timeout: Duration,
}

impl GmailProvider {
    pub fn new(
        hub: GmailHub,
        rate_limiter: QuotaRateLimiter,
        page_size: u32,
        request_timeout: Duration,
    ) -> Self {
        Self {
            hub,
            rate_limiter,
            page_size,
            request_timeout,
        }
    }

    /// Acquire quota, then run `call` under the request timeout
    async fn call<T, Fut>(&self, operation: &str, cost: QuotaCost, call: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, google_gmail1::Error>>,
    {
        let _permit = self.rate_limiter.acquire(cost).await;

        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result.map_err(LabelerError::from),
            Err(_) => {
                warn!(
                    "Gmail API {} call timed out after {:?}",
                    operation, self.request_timeout
                );
                Err(LabelerError::NetworkError(format!(
                    "{} timed out after {:?}",
                    operation, self.request_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn search(&self, query: &str, page_token: Option<String>) -> Result<MessagePage> {
        let mut call = self
            .hub
            .users()
            .messages_list("me")
            .q(query)
            .max_results(self.page_size)
            .add_scope(SCOPE_MODIFY);

        if let Some(token) = page_token.as_deref() {
            call = call.page_token(token);
        }

        let (_, response) = self
            .call("messages.list", QuotaCost::MessagesList, call.doit())
            .await?;

        let message_ids: Vec<String> = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect();

        // Gmail sometimes returns an empty string instead of omitting the token
        let next_page_token = response.next_page_token.filter(|t| !t.is_empty());

        debug!(
            "messages.list returned {} ids (more pages: {})",
            message_ids.len(),
            next_page_token.is_some()
        );

        Ok(MessagePage {
            message_ids,
            next_page_token,
        })
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        let call = self
            .hub
            .users()
            .labels_list("me")
            .add_scope(SCOPE_LABELS)
            .doit();

        let (_, response) = self.call("labels.list", QuotaCost::LabelsList, call).await?;

        let labels: Vec<LabelInfo> = response
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter_map(|label| match (label.id, label.name) {
                (Some(id), Some(name)) => Some(LabelInfo { id, name }),
                _ => None,
            })
            .collect();

        debug!("labels.list returned {} labels", labels.len());
        Ok(labels)
    }

    async fn create_label(&self, name: &str) -> Result<LabelInfo> {
        let label = Label {
            name: Some(name.to_string()),
            message_list_visibility: Some("show".to_string()),
            label_list_visibility: Some("labelShow".to_string()),
            ..Default::default()
        };

        let call = self
            .hub
            .users()
            .labels_create(label, "me")
            .add_scope(SCOPE_LABELS)
            .doit();

        let (_, created) = self.call("labels.create", QuotaCost::LabelsCreate, call).await?;

        let id = created
            .id
            .ok_or_else(|| LabelerError::ApiError("Created label has no ID".to_string()))?;

        Ok(LabelInfo {
            id,
            name: created.name.unwrap_or_else(|| name.to_string()),
        })
    }

    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        let request = ModifyMessageRequest {
            add_label_ids: Some(vec![label_id.to_string()]),
            remove_label_ids: None,
        };

        let call = self
            .hub
            .users()
            .messages_modify(request, "me", message_id)
            .add_scope(SCOPE_MODIFY)
            .doit();

        self.call("messages.modify", QuotaCost::MessagesModify, call)
            .await?;
        Ok(())
    }
}
