use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};

use super::clock::{day_key, first_of_next_month, month_key, Clock};
use super::usage::{persist_json, UsageStore};

/// Persisted spend limits. Absent limit means unconstrained; present limits
/// are strictly positive (enforced on write).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetConfig {
    pub daily_limit: Option<f64>,
    pub monthly_limit: Option<f64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Partial update: an absent field leaves the stored value untouched, an
/// explicit `null` clears the limit. The nested `Option` distinguishes the
/// two, which plain `Option<f64>` cannot.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetLimitsUpdate {
    #[serde(default, deserialize_with = "some_if_present")]
    pub daily_limit: Option<Option<f64>>,
    #[serde(default, deserialize_with = "some_if_present")]
    pub monthly_limit: Option<Option<f64>>,
}

fn some_if_present<'de, D>(d: D) -> Result<Option<Option<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(d).map(Some)
}

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("{0} must be a positive number")]
    NonPositiveLimit(&'static str),
    #[error("failed to persist budget config: {0}")]
    Persist(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeriodStatus {
    pub spent: f64,
    pub limit: Option<f64>,
    pub remaining: Option<f64>,
    pub percent_used: Option<f64>,
}

impl PeriodStatus {
    fn new(spent: f64, limit: Option<f64>) -> Self {
        Self {
            spent,
            limit,
            remaining: limit.map(|l| (l - spent).max(0.0)),
            percent_used: limit.map(|l| spent / l * 100.0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub config: ConfiguredLimits,
    pub daily: PeriodStatus,
    pub monthly: PeriodStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfiguredLimits {
    pub daily_limit: Option<f64>,
    pub monthly_limit: Option<f64>,
}

/// Budget proximity, most severe first. Only the highest applicable level is
/// reported; a monthly hard stop supersedes any daily signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Blocked,
    Exceeded,
    High,
    None,
}

pub fn warning_level(status: &BudgetStatus) -> WarningLevel {
    let daily = &status.daily;
    let monthly = &status.monthly;
    if monthly.limit.is_some() && monthly.percent_used.unwrap_or(0.0) >= 100.0 {
        return WarningLevel::Blocked;
    }
    if daily.limit.is_some() && daily.percent_used.unwrap_or(0.0) >= 100.0 {
        return WarningLevel::Exceeded;
    }
    if daily.limit.is_some() && daily.percent_used.unwrap_or(0.0) >= 80.0 {
        return WarningLevel::High;
    }
    WarningLevel::None
}

/// Block descriptor returned with a 402 when the monthly hard gate trips.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetBlock {
    pub error: &'static str,
    pub message: String,
    pub monthly: MonthlySpend,
    pub blocked: bool,
    pub retry_after: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlySpend {
    pub spent: f64,
    pub limit: f64,
}

/// File-backed budget configuration plus the evaluator deriving
/// spend-vs-limit status from the usage aggregate.
#[derive(Clone)]
pub struct BudgetStore {
    inner: Arc<BudgetStoreInner>,
}

struct BudgetStoreInner {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl BudgetStore {
    pub fn open(path: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(BudgetStoreInner {
                path,
                clock,
                lock: Mutex::new(()),
            }),
        }
    }

    /// Missing or unreadable config means no limits configured.
    pub fn load(&self) -> BudgetConfig {
        match std::fs::read(&self.inner.path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(cfg) => cfg,
                Err(e) => {
                    log::warn!(
                        "budget file {} is corrupt, treating as unconfigured: {e}",
                        self.inner.path.display()
                    );
                    BudgetConfig::default()
                }
            },
            Err(_) => BudgetConfig::default(),
        }
    }

    /// Apply a partial update and persist. Rejected updates leave the stored
    /// config untouched. `createdAt` is stamped on first write only.
    pub fn set_limits(&self, update: &BudgetLimitsUpdate) -> Result<BudgetConfig, BudgetError> {
        if let Some(Some(v)) = update.daily_limit {
            if !(v > 0.0) {
                return Err(BudgetError::NonPositiveLimit("dailyLimit"));
            }
        }
        if let Some(Some(v)) = update.monthly_limit {
            if !(v > 0.0) {
                return Err(BudgetError::NonPositiveLimit("monthlyLimit"));
            }
        }

        let _g = self.inner.lock.lock();
        let mut cfg = self.load();
        if let Some(daily) = update.daily_limit {
            cfg.daily_limit = daily;
        }
        if let Some(monthly) = update.monthly_limit {
            cfg.monthly_limit = monthly;
        }
        let now = self.inner.clock.now().to_rfc3339();
        if cfg.created_at.is_none() {
            cfg.created_at = Some(now.clone());
        }
        cfg.updated_at = Some(now);
        persist_json(&self.inner.path, &cfg).map_err(BudgetError::Persist)?;
        Ok(cfg)
    }

    /// Spend-vs-limit projection for today and the current local month.
    pub fn status(&self, usage: &UsageStore) -> BudgetStatus {
        let cfg = self.load();
        let now = self.inner.clock.now();
        let agg = usage.load();

        let daily_spent = agg
            .by_day
            .get(&day_key(&now))
            .map(|b| b.cost)
            .unwrap_or(0.0);
        let month_prefix = month_key(&now);
        let monthly_spent: f64 = agg
            .by_day
            .iter()
            .filter(|(date, _)| date.starts_with(&month_prefix))
            .map(|(_, b)| b.cost)
            .sum();

        BudgetStatus {
            config: ConfiguredLimits {
                daily_limit: cfg.daily_limit,
                monthly_limit: cfg.monthly_limit,
            },
            daily: PeriodStatus::new(daily_spent, cfg.daily_limit),
            monthly: PeriodStatus::new(monthly_spent, cfg.monthly_limit),
        }
    }

    /// Pre-flight hard gate: `Some(block)` iff a monthly limit is configured
    /// and the current month's spend has reached it. No limit, no gate,
    /// regardless of spend.
    pub fn check_monthly(&self, usage: &UsageStore) -> Option<BudgetBlock> {
        let cfg = self.load();
        let limit = cfg.monthly_limit?;
        let status = self.status(usage);
        let spent = status.monthly.spent;
        if spent < limit {
            return None;
        }
        let now = self.inner.clock.now();
        Some(BudgetBlock {
            error: "monthly_budget_exceeded",
            message: format!(
                "Monthly budget limit reached (${spent:.2} spent of ${limit:.2} limit)"
            ),
            monthly: MonthlySpend { spent, limit },
            blocked: true,
            retry_after: first_of_next_month(&now).to_rfc3339(),
        })
    }
}
