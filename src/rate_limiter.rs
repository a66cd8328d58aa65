//! Quota-aware rate gate shared by every Gmail API call
//!
//! Gmail meters usage in "quota units" per user per second, independent of
//! which rule issues a call. A single token bucket is therefore shared (by
//! clone) between the label resolver and all concurrently running rules.
//!
//! The refill rate and burst size come from `[rate_limit]` in the config file
//! since Google adjusts per-project limits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::RateLimitConfig;

/// Gmail API quota costs for the operations this tool issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCost {
    MessagesList,
    LabelsList,
    LabelsCreate,
    MessagesModify,
}

impl QuotaCost {
    pub fn units(&self) -> u32 {
        match self {
            QuotaCost::LabelsList => 1,
            QuotaCost::MessagesList | QuotaCost::LabelsCreate | QuotaCost::MessagesModify => 5,
        }
    }

    /// API method name, used as the key in [`QuotaStats::by_operation`]
    pub fn operation(&self) -> &'static str {
        match self {
            QuotaCost::MessagesList => "messages.list",
            QuotaCost::LabelsList => "labels.list",
            QuotaCost::LabelsCreate => "labels.create",
            QuotaCost::MessagesModify => "messages.modify",
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    per_second: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn full(capacity: f64, per_second: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            per_second,
            refilled_at: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let earned = now.duration_since(self.refilled_at).as_secs_f64() * self.per_second;
        self.tokens = (self.tokens + earned).min(self.capacity);
        self.refilled_at = now;
    }

    /// Take `units` now, or report how long until they will be available
    fn take(&mut self, units: f64) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= units {
            self.tokens -= units;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((units - self.tokens) / self.per_second))
        }
    }
}

#[derive(Debug, Default)]
struct Usage {
    units: u64,
    calls: u64,
    waits: u64,
    by_operation: BTreeMap<&'static str, u64>,
}

impl Usage {
    fn record(&mut self, cost: QuotaCost, units: u32) {
        self.units += units as u64;
        self.calls += 1;
        *self.by_operation.entry(cost.operation()).or_default() += units as u64;
    }
}

#[derive(Debug)]
struct Gate {
    bucket: Bucket,
    usage: Usage,
}

/// Token bucket rate limiter for Gmail API quota management
///
/// Clones share the same bucket.
#[derive(Debug, Clone)]
pub struct QuotaRateLimiter {
    gate: Arc<Mutex<Gate>>,
}

impl QuotaRateLimiter {
    /// Gmail's documented per-user default: 250 units/s with two seconds of burst
    pub fn new() -> Self {
        Self::with_config(250.0, 500.0)
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::with_config(config.units_per_second, config.burst_units)
    }

    /// # Arguments
    /// * `units_per_second` - Quota units added per second
    /// * `burst` - Bucket capacity
    pub fn with_config(units_per_second: f64, burst: f64) -> Self {
        Self {
            gate: Arc::new(Mutex::new(Gate {
                bucket: Bucket::full(burst, units_per_second),
                usage: Usage::default(),
            })),
        }
    }

    /// Wait until `cost` units are available, then consume them
    ///
    /// A cost larger than the burst capacity is charged as the full capacity.
    pub async fn acquire(&self, cost: QuotaCost) -> QuotaPermit {
        let mut waited = false;

        loop {
            let wait = {
                let mut gate = self.gate.lock().await;
                let units = cost.units().min(gate.bucket.capacity as u32);

                trace!(
                    "{}: {:.1}/{:.0} units available, need {}",
                    cost.operation(),
                    gate.bucket.tokens,
                    gate.bucket.capacity,
                    units
                );

                match gate.bucket.take(units as f64) {
                    Ok(()) => {
                        gate.usage.record(cost, units);
                        if waited {
                            gate.usage.waits += 1;
                        }
                        return QuotaPermit { units };
                    }
                    Err(wait) => wait,
                }
            };

            waited = true;
            debug!("Quota exhausted, {} waits {:?}", cost.operation(), wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Snapshot of usage so far; `available_units` is refilled up to now
    pub async fn stats(&self) -> QuotaStats {
        let mut gate = self.gate.lock().await;
        gate.bucket.refill();
        QuotaStats {
            available_units: gate.bucket.tokens as u32,
            max_units: gate.bucket.capacity as u32,
            refill_rate: gate.bucket.per_second as u32,
            total_consumed: gate.usage.units,
            total_operations: gate.usage.calls,
            total_waits: gate.usage.waits,
            by_operation: gate
                .usage
                .by_operation
                .iter()
                .map(|(op, units)| (op.to_string(), *units))
                .collect(),
        }
    }
}

impl Default for QuotaRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Acquired quota
#[derive(Debug)]
pub struct QuotaPermit {
    units: u32,
}

impl QuotaPermit {
    pub fn units(&self) -> u32 {
        self.units
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStats {
    pub available_units: u32,
    pub max_units: u32,
    /// Units per second
    pub refill_rate: u32,
    pub total_consumed: u64,
    pub total_operations: u64,
    /// Calls that had to sleep for quota
    pub total_waits: u64,
    /// Units consumed per API method
    #[serde(default)]
    pub by_operation: BTreeMap<String, u64>,
}
