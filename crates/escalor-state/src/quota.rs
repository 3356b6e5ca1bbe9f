use crate::atomic::{read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use escalor_core::{EscalorError, EscalorResult, TierSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

/// One tier's consumption window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaWindow {
    pub tier: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub consumed: u64,
    pub limit: u64,
}

impl QuotaWindow {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.consumed)
    }
}

/// Persistent per-tier admission ledger.
///
/// Admission is a single check-and-increment under one lock: a denial
/// leaves the window untouched, and two concurrent consumers can never
/// admit past the limit between them. Windows are fixed length and aligned
/// to wall-clock multiples of `window_secs`, so a 86400-second window rolls
/// at midnight UTC regardless of when the process started.
#[derive(Debug)]
pub struct QuotaLedger {
    path: PathBuf,
    window_secs: u64,
    windows: Mutex<HashMap<String, QuotaWindow>>,
}

impl QuotaLedger {
    /// Open the ledger at `path`. `window_secs` must be positive: it is
    /// the modulus for wall-clock window alignment.
    pub async fn open(path: PathBuf, window_secs: u64) -> EscalorResult<Self> {
        if window_secs == 0 {
            return Err(EscalorError::Config(
                "quota window_secs must be positive".to_string(),
            ));
        }
        let list: Vec<QuotaWindow> = read_json(&path).await?.unwrap_or_default();
        let windows = list.into_iter().map(|w| (w.tier.clone(), w)).collect();
        Ok(Self {
            path,
            window_secs,
            windows: Mutex::new(windows),
        })
    }

    /// Atomically consume `tier.cost` units from the tier's current window.
    ///
    /// Returns `false` without any side effect when the window cannot cover
    /// the cost.
    pub async fn try_consume(&self, tier: &TierSpec) -> EscalorResult<bool> {
        self.try_consume_at(tier, Utc::now()).await
    }

    async fn try_consume_at(&self, tier: &TierSpec, now: DateTime<Utc>) -> EscalorResult<bool> {
        let mut windows = self.windows.lock().await;

        let admitted = {
            let window = windows
                .entry(tier.name.clone())
                .or_insert_with(|| self.fresh_window(tier, now));
            if now >= window.window_end {
                debug!(tier = %tier.name, "rolling quota window");
                *window = self.fresh_window(tier, now);
            }
            // The configured limit is authoritative, even over a persisted window
            window.limit = tier.quota_limit;

            if window.consumed.saturating_add(tier.cost) <= window.limit {
                window.consumed += tier.cost;
                true
            } else {
                false
            }
        };

        if admitted {
            let mut snapshot: Vec<QuotaWindow> = windows.values().cloned().collect();
            snapshot.sort_by(|a, b| a.tier.cmp(&b.tier));
            write_json_atomic(&self.path, &snapshot).await?;
        }
        Ok(admitted)
    }

    /// Current windows, sorted by tier name.
    pub async fn windows(&self) -> Vec<QuotaWindow> {
        let windows = self.windows.lock().await;
        let mut snapshot: Vec<QuotaWindow> = windows.values().cloned().collect();
        snapshot.sort_by(|a, b| a.tier.cmp(&b.tier));
        snapshot
    }

    fn fresh_window(&self, tier: &TierSpec, now: DateTime<Utc>) -> QuotaWindow {
        let len = self.window_secs as i64;
        let start_ts = now.timestamp() - now.timestamp().rem_euclid(len);
        let window_start = DateTime::<Utc>::from_timestamp(start_ts, 0).unwrap_or(now);
        let window_end = DateTime::<Utc>::from_timestamp(start_ts + len, 0).unwrap_or(now);
        QuotaWindow {
            tier: tier.name.clone(),
            window_start,
            window_end,
            consumed: 0,
            limit: tier.quota_limit,
        }
    }
}
