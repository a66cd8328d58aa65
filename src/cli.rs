//! Command-line interface

use chrono::Utc;
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{self, REQUIRED_SCOPES};
use crate::client::GmailProvider;
use crate::config::Config;
use crate::credentials::{CredentialStore, TokenRefresher};
use crate::error::{LabelerError, Result};
use crate::orchestrator::{Labeler, ProgressCallback, ProgressEvent};
use crate::rate_limiter::QuotaRateLimiter;
use crate::report::RunReport;
use crate::rules::RuleEngine;

#[derive(Parser, Debug)]
#[command(name = "gmail-labeler")]
#[command(version)]
#[command(about = "Apply Gmail labels to messages matching configured search rules", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gmail-labeler.toml")]
    pub config: PathBuf,

    /// Path to OAuth2 client credentials file
    #[arg(long, default_value = "credentials.json")]
    pub credentials: PathBuf,

    /// Path to the stored access/refresh token pair
    #[arg(long, default_value = ".gmail-labeler/credential.json")]
    pub token_file: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authorize access to the mailbox (opens a browser)
    Auth {
        /// Re-run consent even if a usable credential exists
        #[arg(long)]
        force: bool,
    },

    /// Label every message matching each enabled rule
    Run {
        /// Discover and resolve only; make no changes
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Same as `run --dry-run`: print would-be match counts
    DryRun {
        #[command(flatten)]
        options: RunOptions,
    },

    /// List configured rules and their effective queries
    Rules,

    /// Show whether a credential is stored and when it expires
    Status,

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "gmail-labeler.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunOptions {
    /// Only evaluate these rule ids (repeatable)
    #[arg(long = "rule", value_name = "ID")]
    pub rules: Vec<String>,

    /// Cancel the run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Write the run report as JSON to this path
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
    rule_bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Share a MultiProgress with the log writer so log lines print above bars
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
            rule_bars: Mutex::new(HashMap::new()),
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }

    fn bars(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProgressBar>> {
        self.rule_bars
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Render orchestrator events as one spinner/bar per rule
    pub fn handle(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RuleStarted {
                rule_id,
                label_name,
            } => {
                let pb = self.add_spinner(&format!("{}: resolving label '{}'", rule_id, label_name));
                self.bars().insert(rule_id, pb);
            }
            ProgressEvent::PageFetched {
                rule_id,
                page,
                discovered,
            } => {
                if let Some(pb) = self.bars().get(&rule_id) {
                    pb.set_message(format!(
                        "{}: {} message(s) found ({} page(s))",
                        rule_id, discovered, page
                    ));
                }
            }
            ProgressEvent::LabelingStarted { rule_id, total } => {
                if let Some(pb) = self.bars().get(&rule_id) {
                    pb.set_style(self.bar_style.clone());
                    pb.set_length(total as u64);
                    pb.set_position(0);
                    pb.set_message(format!("{}: labeling", rule_id));
                }
            }
            ProgressEvent::MessageProcessed { rule_id } => {
                if let Some(pb) = self.bars().get(&rule_id) {
                    pb.inc(1);
                }
            }
            ProgressEvent::RuleFinished { result } => {
                let pb = self.bars().remove(&result.rule_id);
                let msg = if result.is_rule_failure() {
                    format!("{}: failed", result.rule_id)
                } else if result.is_cancelled() {
                    format!("{}: cancelled", result.rule_id)
                } else {
                    format!(
                        "{}: {} matched, {} labeled, {} failed",
                        result.rule_id,
                        result.matched,
                        result.labeled,
                        result.failed.len()
                    )
                };
                match pb {
                    Some(pb) => self.finish_spinner(&pb, &msg),
                    None => {
                        let _ = self.multi.println(format!("  ✓ {}", msg));
                    }
                }
            }
        }
    }

    pub fn labeling_callback(self: &Arc<Self>) -> ProgressCallback {
        let reporter = Arc::clone(self);
        Arc::new(move |event| reporter.handle(event))
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

async fn open_store(cli: &Cli, config: Option<&Config>) -> Result<Arc<CredentialStore>> {
    let auth_config = config.map(|c| c.auth.clone()).unwrap_or_default();

    let refresher: Option<Arc<dyn TokenRefresher>> =
        match auth::load_application_secret(&cli.credentials).await {
            Ok(secret) => Some(Arc::new(auth::OAuthRefresher::new(
                &secret,
                auth_config.token_endpoint.clone(),
            ))),
            Err(e) => {
                warn!("Token refresh unavailable: {}", e);
                None
            }
        };

    let store = CredentialStore::open(
        &cli.token_file,
        refresher,
        chrono::Duration::seconds(auth_config.refresh_skew_secs),
    )
    .await?;
    Ok(Arc::new(store))
}

/// Cancel `token` on Ctrl-C, and after `timeout` if one is given
fn install_cancellation(token: &CancellationToken, timeout: Option<u64>) {
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight calls");
            on_signal.cancel();
        }
    });

    if let Some(secs) = timeout {
        let on_timeout = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    warn!("Run timeout of {}s reached, cancelling", secs);
                    on_timeout.cancel();
                }
                _ = on_timeout.cancelled() => {}
            }
        });
    }
}

/// Load configuration, authenticate, and evaluate the due rules
pub async fn run_labeling(
    cli: &Cli,
    dry_run: bool,
    options: &RunOptions,
    multi: MultiProgress,
) -> Result<RunReport> {
    let reporter = Arc::new(ProgressReporter::with_multi_progress(multi));

    let config_spinner = reporter.add_spinner("Loading configuration...");
    let config = Config::load(&cli.config).await?;
    let engine = RuleEngine::from_config(&config)?;
    reporter.finish_spinner(
        &config_spinner,
        &format!(
            "Configuration loaded from {:?} ({} rules)",
            cli.config,
            engine.rules().len()
        ),
    );

    let store = open_store(cli, Some(&config)).await?;
    let hub = auth::initialize_gmail_hub(store.clone())?;

    let rate_limiter = QuotaRateLimiter::from_config(&config.rate_limit);
    let provider = Arc::new(GmailProvider::new(
        hub,
        rate_limiter.clone(),
        config.execution.page_size,
        Duration::from_secs(config.execution.request_timeout_secs),
    ));

    let labeler = Labeler::from_config(&config, provider, store, rate_limiter, dry_run)
        .with_progress(reporter.labeling_callback());

    let cancel = CancellationToken::new();
    install_cancellation(&cancel, options.timeout);

    let report = labeler.run(&engine, &options.rules, &cancel).await;
    cancel.cancel();
    let report = report?;

    if let Some(path) = &options.report {
        report.save(path).await?;
        info!("Run report written to {:?}", path);
    }

    Ok(report)
}

/// Run the consent flow unless a usable credential already exists
pub async fn authorize(cli: &Cli, force: bool) -> Result<()> {
    let secret = auth::load_application_secret(&cli.credentials).await?;
    let store = open_store(cli, None).await?;
    let status = store.status().await;

    if !force && status.present && (status.has_refresh_token || !status.expired) {
        println!("Already authorized; credential stored at {:?}", cli.token_file);
        println!("Use --force to authorize again.");
        return Ok(());
    }

    auth::authorize_interactively(secret, store.clone()).await?;

    let hub = auth::initialize_gmail_hub(store)?;
    let (_, profile) = hub
        .users()
        .get_profile("me")
        .add_scope(REQUIRED_SCOPES[0])
        .doit()
        .await
        .map_err(LabelerError::from)?;

    println!("Successfully authorized");
    println!("Credential stored at: {:?}", cli.token_file);
    println!(
        "Connected to account: {}",
        profile.email_address.unwrap_or_default()
    );
    Ok(())
}

pub async fn show_status(cli: &Cli) -> Result<()> {
    let store = CredentialStore::open(&cli.token_file, None, chrono::Duration::zero()).await?;
    let status = store.status().await;

    println!("Credential file: {:?}", cli.token_file);
    match status.expiry {
        Some(expiry) if status.present => {
            let remaining = expiry - Utc::now();
            if status.expired {
                println!("Access token: expired at {}", expiry.format("%Y-%m-%d %H:%M:%S UTC"));
            } else {
                println!(
                    "Access token: valid until {} ({} min left)",
                    expiry.format("%Y-%m-%d %H:%M:%S UTC"),
                    remaining.num_minutes()
                );
            }
            println!(
                "Refresh token: {}",
                if status.has_refresh_token { "present" } else { "missing" }
            );
        }
        _ => println!("No credential stored. Run `gmail-labeler auth`."),
    }

    if cli.config.exists() {
        let config = Config::load(&cli.config).await?;
        let enabled = config.rules.iter().filter(|r| r.enabled).count();
        println!(
            "Config: {:?} ({} rules, {} enabled)",
            cli.config,
            config.rules.len(),
            enabled
        );
    } else {
        println!("Config: {:?} not found", cli.config);
    }
    Ok(())
}

pub async fn list_rules(cli: &Cli) -> Result<()> {
    let config = Config::load(&cli.config).await?;
    let engine = RuleEngine::from_config(&config)?;

    if engine.rules().is_empty() {
        println!("No rules configured in {:?}", cli.config);
        return Ok(());
    }

    for rule in engine.rules() {
        let state = if rule.enabled { "" } else { " (disabled)" };
        println!("{}{}", rule.id, state);
        println!("  label: {}", rule.label_name);
        println!("  query: {}", rule.query);
    }
    Ok(())
}

pub async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(LabelerError::ConfigError(format!(
            "Configuration file already exists at {:?}. Use --force to overwrite.",
            output
        )));
    }

    Config::create_example(output).await?;

    println!("Created example configuration file at: {:?}", output);
    println!("\nEdit the [[rules]] entries to describe what to label:");
    println!("  - query: any Gmail search expression (e.g. from:alerts@example.com)");
    println!("  - all / any: optional clause lists combined with AND / OR");
    println!("  - label: target label; nested labels use '/' (e.g. Finance/Receipts)");
    Ok(())
}
