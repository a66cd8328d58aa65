//! Aggregate report of one run over all due rules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::models::{LabelInfo, RuleOutcome, RunResult};
use crate::rate_limiter::QuotaStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    /// Cancellation was requested before the run finished
    pub cancelled: bool,
    /// One entry per due rule, in rule order
    pub results: Vec<RunResult>,
    pub labels_created: Vec<LabelInfo>,
    pub quota: QuotaStats,
}

/// Sums over every rule in a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub rules: usize,
    pub rules_failed: usize,
    pub matched: usize,
    pub labeled: usize,
    pub failed_messages: usize,
    pub skipped: usize,
}

impl RunReport {
    pub fn new(dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            finished_at: now,
            dry_run,
            cancelled: false,
            results: Vec::new(),
            labels_created: Vec::new(),
            quota: QuotaStats::default(),
        }
    }

    pub fn totals(&self) -> Totals {
        self.results.iter().fold(
            Totals {
                rules: self.results.len(),
                ..Totals::default()
            },
            |mut t, r| {
                if r.is_rule_failure() {
                    t.rules_failed += 1;
                }
                t.matched += r.matched;
                t.labeled += r.labeled;
                t.failed_messages += r.failed.len();
                t.skipped += r.skipped;
                t
            },
        )
    }

    /// A rule failed as a whole (message-level failures do not count)
    pub fn has_rule_failures(&self) -> bool {
        self.results.iter().any(RunResult::is_rule_failure)
    }

    /// Process exit code for a completed run
    ///
    /// 0 when every rule completed, 1 when any rule failed or the run was
    /// cancelled. Aborted runs never produce a report and exit with 2.
    pub fn exit_code(&self) -> i32 {
        if self.has_rule_failures() || self.cancelled {
            1
        } else {
            0
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Human-readable summary, one line per rule
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mode = if self.dry_run { " (DRY RUN)" } else { "" };

        let _ = writeln!(out, "Run {}{}", self.run_id, mode);
        let _ = writeln!(
            out,
            "Finished {} in {}s",
            self.finished_at.format("%Y-%m-%d %H:%M:%S"),
            self.duration().num_seconds()
        );
        let _ = writeln!(out);

        for r in &self.results {
            let status = match &r.outcome {
                RuleOutcome::Completed => "ok".to_string(),
                RuleOutcome::Failed { reason } => format!("FAILED: {}", reason),
                RuleOutcome::Cancelled => "cancelled".to_string(),
            };

            let label_note = if r.label_created {
                " (label created)"
            } else if r.would_create_label {
                " (label would be created)"
            } else {
                ""
            };

            if self.dry_run {
                let _ = writeln!(
                    out,
                    "  [{}] -> {}{}: {} matched, {}",
                    r.rule_id, r.label_name, label_note, r.matched, status
                );
            } else {
                let _ = writeln!(
                    out,
                    "  [{}] -> {}{}: {} matched, {} labeled, {} failed, {} skipped, {}",
                    r.rule_id,
                    r.label_name,
                    label_note,
                    r.matched,
                    r.labeled,
                    r.failed.len(),
                    r.skipped,
                    status
                );
            }

            for failure in &r.failed {
                let _ = writeln!(
                    out,
                    "      {} {}: {}",
                    failure.message_id, failure.kind, failure.detail
                );
            }
        }

        let totals = self.totals();
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} rules ({} failed): {} matched, {} labeled, {} failed, {} skipped",
            totals.rules,
            totals.rules_failed,
            totals.matched,
            totals.labeled,
            totals.failed_messages,
            totals.skipped
        );
        let _ = writeln!(
            out,
            "Quota: {} units over {} calls ({} waits)",
            self.quota.total_consumed, self.quota.total_operations, self.quota.total_waits
        );
        if self.cancelled {
            let _ = writeln!(out, "Run was cancelled before completion");
        }

        out
    }

    /// Save as JSON, replacing any existing file atomically
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!("Saved run report to {:?}", path);
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureKind, MessageFailure, Rule};
    use tempfile::TempDir;

    fn result(id: &str) -> RunResult {
        RunResult::new(&Rule {
            id: id.to_string(),
            query: "q".to_string(),
            label_name: "L".to_string(),
            enabled: true,
        })
    }

    fn sample() -> RunReport {
        let mut ok = result("ok");
        ok.matched = 3;
        ok.labeled = 2;
        ok.failed.push(MessageFailure {
            message_id: "m3".to_string(),
            kind: FailureKind::NotFound,
            detail: "deleted".to_string(),
        });

        let mut report = RunReport::new(false);
        report.results.push(ok);
        report
    }

    #[test]
    fn test_message_failures_do_not_fail_the_run() {
        let report = sample();
        assert!(!report.has_rule_failures());
        assert_eq!(report.exit_code(), 0);

        let totals = report.totals();
        assert_eq!(totals.matched, 3);
        assert_eq!(totals.labeled, 2);
        assert_eq!(totals.failed_messages, 1);
    }

    #[test]
    fn test_rule_failure_sets_exit_code() {
        let mut report = sample();
        report.results.push(result("broken").failed("label forbidden"));

        assert!(report.has_rule_failures());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.totals().rules_failed, 1);
    }

    #[test]
    fn test_cancelled_run_exit_code() {
        let mut report = sample();
        report.cancelled = true;
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_render_lists_rules_and_failures() {
        let mut report = sample();
        report.results.push(result("broken").failed("label forbidden"));
        let text = report.render();

        assert!(text.contains("[ok] -> L: 3 matched, 2 labeled, 1 failed"));
        assert!(text.contains("m3 not found: deleted"));
        assert!(text.contains("FAILED: label forbidden"));
        assert!(!text.contains("DRY RUN"));
    }

    #[test]
    fn test_render_dry_run() {
        let mut report = RunReport::new(true);
        let mut r = result("preview");
        r.matched = 7;
        r.would_create_label = true;
        report.results.push(r);

        let text = report.render();
        assert!(text.contains("DRY RUN"));
        assert!(text.contains("[preview] -> L (label would be created): 7 matched"));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("run.json");

        let report = sample();
        report.save(&path).await.unwrap();

        let loaded = RunReport::load(&path).await.unwrap();
        assert_eq!(loaded.run_id, report.run_id);
        assert_eq!(loaded.results, report.results);
        assert!(!dir.path().join("reports").join("run.json.tmp").exists());
    }
}
