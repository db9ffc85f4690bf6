use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::clock::{day_key, Clock};
use super::pricing;

/// One spend bucket (per model or per day).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageBucket {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub requests: u64,
}

/// The whole persisted aggregate. Field names match the on-disk JSON, which
/// is pretty-printed and intended to be inspected by hand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageAggregate {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: f64,
    #[serde(default)]
    pub by_model: BTreeMap<String, UsageBucket>,
    #[serde(default)]
    pub by_day: BTreeMap<String, UsageBucket>,
    pub requests: u64,
    pub last_updated: Option<String>,
}

impl UsageAggregate {
    /// `totalCost == sum(byModel[*].cost) == sum(byDay[*].cost)`.
    pub fn totals_consistent(&self) -> bool {
        let by_model: f64 = self.by_model.values().map(|b| b.cost).sum();
        let by_day: f64 = self.by_day.values().map(|b| b.cost).sum();
        (self.total_cost - by_model).abs() < 1e-9 && (self.total_cost - by_day).abs() < 1e-9
    }
}

/// File-backed usage aggregate.
///
/// Only token counts, model names, costs and timestamps ever reach this
/// store; request and response content never does. All mutation goes through
/// the internal mutex so concurrent requests cannot drop each other's
/// increments. Another process racing on the same file is last-writer-wins,
/// a known limitation.
#[derive(Clone)]
pub struct UsageStore {
    inner: Arc<UsageStoreInner>,
}

struct UsageStoreInner {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl UsageStore {
    pub fn open(path: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(UsageStoreInner {
                path,
                clock,
                lock: Mutex::new(()),
            }),
        }
    }

    /// Read the persisted aggregate; a missing or unreadable file is a zeroed
    /// aggregate, never an error. A broken stats file must not take the proxy
    /// down with it.
    pub fn load(&self) -> UsageAggregate {
        let _g = self.inner.lock.lock();
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> UsageAggregate {
        match std::fs::read(&self.inner.path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(agg) => agg,
                Err(e) => {
                    log::warn!(
                        "usage file {} is corrupt, starting from zero: {e}",
                        self.inner.path.display()
                    );
                    UsageAggregate::default()
                }
            },
            Err(_) => UsageAggregate::default(),
        }
    }

    /// Record one completed upstream response and persist immediately.
    ///
    /// One durable write per call; a recorded request is never batched or
    /// deferred. Returns the computed cost.
    pub fn record(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> f64 {
        let cost = pricing::estimate_cost(model, input_tokens, output_tokens);
        let now = self.inner.clock.now();
        let today = day_key(&now);

        let _g = self.inner.lock.lock();
        let mut agg = self.load_unlocked();

        agg.total_input_tokens += input_tokens;
        agg.total_output_tokens += output_tokens;
        agg.total_cost += cost;
        agg.requests += 1;

        let by_model = agg.by_model.entry(model.to_string()).or_default();
        by_model.input_tokens += input_tokens;
        by_model.output_tokens += output_tokens;
        by_model.cost += cost;
        by_model.requests += 1;

        let by_day = agg.by_day.entry(today).or_default();
        by_day.input_tokens += input_tokens;
        by_day.output_tokens += output_tokens;
        by_day.cost += cost;
        by_day.requests += 1;

        agg.last_updated = Some(now.to_rfc3339());

        if let Err(e) = persist_json(&self.inner.path, &agg) {
            log::warn!("failed to persist usage aggregate: {e}");
        }
        if !agg.totals_consistent() {
            log::warn!("usage aggregate totals drifted from per-model/per-day sums");
        }

        log::info!("{provider}/{model}: {input_tokens} in, {output_tokens} out, ${cost:.4}");
        cost
    }

    /// Overwrite the persisted aggregate with the zero state.
    pub fn reset(&self) -> anyhow::Result<()> {
        let _g = self.inner.lock.lock();
        let agg = UsageAggregate {
            last_updated: Some(self.inner.clock.now().to_rfc3339()),
            ..UsageAggregate::default()
        };
        persist_json(&self.inner.path, &agg)?;
        Ok(())
    }
}

/// Write pretty JSON via a temp file + rename so a crash mid-write cannot
/// leave a half-written document behind.
pub(crate) fn persist_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
