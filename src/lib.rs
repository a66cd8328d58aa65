//! Rule-driven Gmail labeling
//!
//! Each rule pairs a Gmail search query with a target label. A run resolves
//! every rule's label (creating it at most once, even under concurrency),
//! pages through the matching messages, and adds the label to each one.
//! Labeling is idempotent, so repeated runs converge on the same mailbox
//! state.
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use gmail_labeler::{auth, config::Config, CredentialStore, GmailProvider, Labeler,
//!     QuotaRateLimiter, RuleEngine};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("gmail-labeler.toml".as_ref()).await?;
//!     let engine = RuleEngine::from_config(&config)?;
//!
//!     let store = Arc::new(
//!         CredentialStore::open(".gmail-labeler/credential.json", None, chrono::Duration::seconds(60))
//!             .await?,
//!     );
//!     let hub = auth::initialize_gmail_hub(store.clone())?;
//!
//!     let limiter = QuotaRateLimiter::from_config(&config.rate_limit);
//!     let provider = Arc::new(GmailProvider::new(hub, limiter.clone(), 100, Duration::from_secs(30)));
//!
//!     let labeler = Labeler::from_config(&config, provider, store, limiter, false);
//!     let report = labeler.run(&engine, &[], &CancellationToken::new()).await?;
//!     print!("{}", report.render());
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth2 consent, token refresh, and Gmail hub construction
//! - [`credentials`] - Persisted access/refresh token pair with single-flight refresh
//! - [`client`] - The [`MailProvider`] seam and its Gmail implementation
//! - [`label_resolver`] - Race-safe label name to id resolution
//! - [`rules`] - Rule set and per-run rule selection
//! - [`orchestrator`] - Runs rules: discovery, labeling, outcome accounting
//! - [`report`] - Run report rendering and persistence
//! - [`retry`] / [`rate_limiter`] - Backoff and quota pacing shared by every call
//! - [`cli`] - Command-line interface

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod label_resolver;
pub mod models;
pub mod orchestrator;
pub mod rate_limiter;
pub mod report;
pub mod retry;
pub mod rules;

pub use error::{LabelerError, Result};

pub use models::{
    Credential, FailureKind, LabelInfo, MessageFailure, MessagePage, Rule, RuleOutcome,
    RunResult,
};

pub use config::{Config, ExecutionConfig, RuleConfig};

pub use client::{GmailProvider, MailProvider};
pub use credentials::{CredentialStore, TokenRefresher, TokenSource};
pub use label_resolver::{LabelResolver, Resolution};
pub use orchestrator::{Labeler, LabelerOptions, ProgressCallback, ProgressEvent};
pub use rate_limiter::{QuotaCost, QuotaRateLimiter};
pub use report::RunReport;
pub use retry::RetryPolicy;
pub use rules::RuleEngine;
