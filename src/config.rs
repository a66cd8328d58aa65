use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{LabelerError, Result};

static RULE_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("rule id pattern is a valid regex")
});

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Tokens expiring within this window are refreshed early
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: i64,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_skew_secs: default_refresh_skew_secs(),
            token_endpoint: default_token_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Randomization factor applied to each delay (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_respect_retry_after")]
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            respect_retry_after: default_respect_retry_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_units_per_second")]
    pub units_per_second: f64,
    #[serde(default = "default_burst_units")]
    pub burst_units: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            units_per_second: default_units_per_second(),
            burst_units: default_burst_units(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_max_parallel_rules")]
    pub max_parallel_rules: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_concurrent_requests: default_max_concurrent(),
            max_parallel_rules: default_max_parallel_rules(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    /// Resolve `A` before `A/B` so nested labels show up as a hierarchy
    #[serde(default = "default_create_parents")]
    pub create_parents: bool,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            create_parents: default_create_parents(),
        }
    }
}

/// One `[[rules]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RuleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Every clause must match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<String>,
    /// At least one clause must match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<String>,
    pub label: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_refresh_skew_secs() -> i64 {
    60
}

fn default_token_endpoint() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.5
}

fn default_respect_retry_after() -> bool {
    true
}

fn default_units_per_second() -> f64 {
    250.0
}

fn default_burst_units() -> f64 {
    500.0
}

fn default_page_size() -> u32 {
    100
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_parallel_rules() -> usize {
    1
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_create_parents() -> bool {
    true
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load and validate the configuration file
    ///
    /// Unlike most settings, the rule list has no sensible default, so a
    /// missing file is a configuration error.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LabelerError::ConfigError(format!(
                "Config file not found at {:?}. Run `gmail-labeler init-config` to create one",
                path
            )));
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LabelerError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config = Self::from_toml(&content)?;

        tracing::info!(
            "Loaded configuration from {:?} ({} rules)",
            path,
            config.rules.len()
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| LabelerError::ConfigError(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                LabelerError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| LabelerError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| LabelerError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.auth.refresh_skew_secs < 0 {
            return Err(LabelerError::ConfigError(
                "auth.refresh_skew_secs cannot be negative".to_string(),
            ));
        }
        if self.auth.token_endpoint.trim().is_empty() {
            return Err(LabelerError::ConfigError(
                "auth.token_endpoint cannot be empty".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(LabelerError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts > 10 {
            return Err(LabelerError::ConfigError(
                "retry.max_attempts cannot exceed 10".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(LabelerError::ConfigError(
                "retry.max_delay_ms cannot be smaller than retry.base_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(LabelerError::ConfigError(
                "retry.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(self.rate_limit.units_per_second.is_finite() && self.rate_limit.units_per_second > 0.0) {
            return Err(LabelerError::ConfigError(
                "rate_limit.units_per_second must be a finite number greater than 0".to_string(),
            ));
        }
        if !(self.rate_limit.burst_units.is_finite() && self.rate_limit.burst_units >= 5.0) {
            return Err(LabelerError::ConfigError(
                "rate_limit.burst_units must cover at least one request (5 units)".to_string(),
            ));
        }

        // Gmail caps messages.list at 500 results per page
        if self.execution.page_size == 0 || self.execution.page_size > 500 {
            return Err(LabelerError::ConfigError(
                "execution.page_size must be between 1 and 500".to_string(),
            ));
        }
        if self.execution.max_concurrent_requests == 0 {
            return Err(LabelerError::ConfigError(
                "execution.max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.execution.max_concurrent_requests > 50 {
            return Err(LabelerError::ConfigError(
                "execution.max_concurrent_requests cannot exceed 50 (to stay under Gmail API rate limits)".to_string(),
            ));
        }
        if self.execution.max_parallel_rules == 0 {
            return Err(LabelerError::ConfigError(
                "execution.max_parallel_rules must be at least 1".to_string(),
            ));
        }
        if self.execution.request_timeout_secs == 0 {
            return Err(LabelerError::ConfigError(
                "execution.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        self.validate_rules()?;

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    fn validate_rules(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();

        for (index, rule) in self.rules.iter().enumerate() {
            let id = rule.effective_id(index);

            if !RULE_ID_PATTERN.is_match(&id) {
                return Err(LabelerError::ConfigError(format!(
                    "rules[{}]: id '{}' may only contain letters, digits, '_', '-' and '.'",
                    index, id
                )));
            }
            if !seen_ids.insert(id.clone()) {
                return Err(LabelerError::ConfigError(format!(
                    "rules[{}]: duplicate rule id '{}'",
                    index, id
                )));
            }

            if rule.composed_query().is_none() {
                return Err(LabelerError::ConfigError(format!(
                    "rule '{}' has no query (set `query`, `all` or `any`)",
                    id
                )));
            }

            validate_label_name(&rule.label)
                .map_err(|msg| LabelerError::ConfigError(format!("rule '{}': {}", id, msg)))?;
        }

        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        Self::example().save(path).await
    }

    pub fn example() -> Self {
        Self {
            rules: vec![
                RuleConfig {
                    id: Some("notifications".to_string()),
                    query: Some("from:notify@example.com".to_string()),
                    label: "Notifications".to_string(),
                    ..RuleConfig::example_defaults()
                },
                RuleConfig {
                    id: Some("receipts".to_string()),
                    any: vec![
                        "subject:receipt".to_string(),
                        "subject:invoice".to_string(),
                    ],
                    all: vec!["-category:promotions".to_string()],
                    label: "Finance/Receipts".to_string(),
                    ..RuleConfig::example_defaults()
                },
            ],
            ..Self::default()
        }
    }
}

impl RuleConfig {
    fn example_defaults() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Rule id, falling back to its 1-based position
    pub fn effective_id(&self, index: usize) -> String {
        match &self.id {
            Some(id) => id.trim().to_string(),
            None => format!("rule-{}", index + 1),
        }
    }

    /// Combine `query`, `all` and `any` into one Gmail search expression
    ///
    /// Returns `None` when no clause is set.
    pub fn composed_query(&self) -> Option<String> {
        let mut parts = Vec::new();

        if let Some(query) = self.query.as_deref().map(str::trim) {
            if !query.is_empty() {
                parts.push(query.to_string());
            }
        }

        let all: Vec<&str> = non_empty(&self.all);
        let any: Vec<&str> = non_empty(&self.any);

        // A lone `query` passes through verbatim
        if all.is_empty() && any.is_empty() {
            return parts.pop();
        }

        if let Some(query) = parts.pop() {
            parts.push(format!("({})", query));
        }
        for clause in all {
            parts.push(format!("({})", clause));
        }
        match any.len() {
            0 => {}
            1 => parts.push(format!("({})", any[0])),
            _ => parts.push(format!(
                "{{{}}}",
                any.iter()
                    .map(|c| format!("({})", c))
                    .collect::<Vec<_>>()
                    .join(" ")
            )),
        }

        Some(parts.join(" "))
    }
}

fn non_empty(clauses: &[String]) -> Vec<&str> {
    clauses
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect()
}

fn validate_label_name(name: &str) -> std::result::Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("label name cannot be empty".to_string());
    }
    if trimmed.split('/').any(|segment| segment.trim().is_empty()) {
        return Err(format!(
            "label name '{}' has an empty path segment",
            trimmed
        ));
    }
    Ok(())
}
