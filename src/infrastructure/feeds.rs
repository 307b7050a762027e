//! Feed directories and filesystem read models.
//!
//! Feed clients (out of scope) drop JSON files into per-source signal
//! directories and refresh the shared state caches (prices, portfolio,
//! reconciliation, budget). This module is the only reader of those files;
//! file mtime is the authoritative freshness marker.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::domain::signal::{MarketRegime, Signal};

/// Atomic JSON write: temp file then rename.
pub fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Load a JSON state file; missing or corrupt files yield the default.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("State file {} corrupt ({e}) — using default", path.display());
            T::default()
        }),
        Err(_) => T::default(),
    }
}

/// Load a required JSON state file; errors bubble up so the caller can fail
/// closed.
pub fn load_json_required<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("State file {} not found", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("State file {} JSON parse error", path.display()))
}

#[derive(Debug, Default, Deserialize)]
struct SignalFile {
    #[serde(default)]
    signals: Vec<Signal>,
}

/// The newest file in a feed directory with its signals and age. Signals from
/// a file older than `stale_threshold_minutes` are discarded (the path and
/// age are still reported for logging).
pub fn latest_signal_file(
    directory: &Path,
    stale_threshold_minutes: i64,
    exclude_names: &[&str],
) -> (Option<PathBuf>, Vec<Signal>, f64) {
    let Ok(entries) = std::fs::read_dir(directory) else {
        return (None, Vec::new(), 999.0);
    };

    let mut newest: Option<(PathBuf, std::time::SystemTime)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && exclude_names.contains(&name)
        {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(mtime) = meta.modified() else { continue };
        if newest.as_ref().is_none_or(|(_, best)| mtime > *best) {
            newest = Some((path, mtime));
        }
    }

    let Some((path, mtime)) = newest else {
        return (None, Vec::new(), 999.0);
    };

    let age_minutes = mtime
        .elapsed()
        .map(|d| d.as_secs_f64() / 60.0)
        .unwrap_or(0.0);

    if age_minutes > stale_threshold_minutes as f64 {
        return (Some(path), Vec::new(), age_minutes);
    }

    let signals = std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str::<SignalFile>(&raw).ok())
        .map(|f| f.signals)
        .unwrap_or_default();

    (Some(path), signals, age_minutes)
}

// ── Price cache ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPrice {
    pub price: Decimal,
    #[serde(default)]
    pub volume_24h: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceCache {
    #[serde(flatten)]
    pub entries: BTreeMap<String, CachedPrice>,
}

impl PriceCache {
    pub fn load(state_dir: &Path) -> Self {
        load_json_or_default(&state_dir.join("price_cache.json"))
    }

    pub fn get(&self, symbol: &str) -> Option<&CachedPrice> {
        self.entries.get(symbol)
    }

    /// Newest entry age; the monitor skips the whole cycle when this exceeds
    /// its freshness precondition.
    pub fn newest_age_minutes(&self, now: DateTime<Utc>) -> Option<f64> {
        self.entries
            .values()
            .map(|e| (now - e.timestamp).num_seconds() as f64 / 60.0)
            .fold(None, |best, age| Some(best.map_or(age, |b: f64| b.min(age))))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
}

/// Rolling per-symbol price history for flash-crash and momentum checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceHistory {
    #[serde(flatten)]
    pub series: BTreeMap<String, Vec<PricePoint>>,
}

impl PriceHistory {
    pub fn load(state_dir: &Path) -> Self {
        load_json_or_default(&state_dir.join("price_history.json"))
    }

    /// Price roughly `minutes_ago` in the past. Accepts samples between
    /// `minutes_ago - 2` and `minutes_ago + 5` minutes old.
    pub fn price_near(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
        minutes_ago: i64,
    ) -> Option<Decimal> {
        let series = self.series.get(symbol)?;
        for point in series.iter().rev() {
            let age_min = (now - point.timestamp).num_seconds() as f64 / 60.0;
            if age_min >= (minutes_ago - 2) as f64 && age_min <= (minutes_ago + 5) as f64 {
                return Some(point.price);
            }
        }
        None
    }

    /// Most recent price no older than a minute, for crash comparisons.
    pub fn recent_price(&self, symbol: &str, now: DateTime<Utc>) -> Option<Decimal> {
        let series = self.series.get(symbol)?;
        series
            .iter()
            .rev()
            .find(|p| (now - p.timestamp).num_seconds() <= 60)
            .map(|p| p.price)
    }
}

// ── Portfolio state (single writer: the position monitor) ────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub mode: String,
    pub current_balance_usd: Decimal,
    pub starting_balance_usd: Decimal,
    pub equity_high_water_usd: Decimal,
    pub daily_pnl_pct: f64,
    pub current_drawdown_pct: f64,
    pub meme_allocation_pct: f64,
    #[serde(default)]
    pub token_exposure_pct: BTreeMap<String, f64>,
    pub open_position_count: usize,
    pub daily_reset_date: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for PortfolioState {
    fn default() -> Self {
        Self {
            mode: "paper".into(),
            current_balance_usd: Decimal::from(10_000),
            starting_balance_usd: Decimal::from(10_000),
            equity_high_water_usd: Decimal::from(10_000),
            daily_pnl_pct: 0.0,
            current_drawdown_pct: 0.0,
            meme_allocation_pct: 0.0,
            token_exposure_pct: BTreeMap::new(),
            open_position_count: 0,
            daily_reset_date: None,
            updated_at: None,
        }
    }
}

impl PortfolioState {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("portfolio.json")
    }

    pub fn load(state_dir: &Path) -> Result<Self> {
        load_json_required(&Self::path(state_dir))
    }

    pub fn load_or_default(state_dir: &Path) -> Self {
        load_json_or_default(&Self::path(state_dir))
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        save_json_atomic(&Self::path(state_dir), self)
    }
}

// ── Reconciliation / exchange health / budget read models ────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationState {
    pub last_reconciliation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub has_mismatch: bool,
    pub mismatch_details: Option<String>,
}

impl ReconciliationState {
    pub fn load(state_dir: &Path) -> Result<Self> {
        load_json_required(&state_dir.join("reconciliation.json"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeHealth {
    #[serde(default)]
    pub error_rate_pct: f64,
    pub websocket_connected: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeHealthMap {
    #[serde(flatten)]
    pub exchanges: BTreeMap<String, ExchangeHealth>,
}

impl ExchangeHealthMap {
    pub fn load(state_dir: &Path) -> Self {
        load_json_or_default(&state_dir.join("exchange_health.json"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetState {
    #[serde(default)]
    pub daily_llm_spend_usd: f64,
    #[serde(default)]
    pub monthly_llm_spend_usd: f64,
}

impl BudgetState {
    pub fn load(state_dir: &Path) -> Self {
        load_json_or_default(&state_dir.join("budget.json"))
    }
}

// ── Market regime (fear/greed feed) ──────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
struct FearGreedFile {
    value: Option<i64>,
    regime: Option<String>,
}

pub fn load_market_regime(signals_dir: &Path) -> (MarketRegime, Option<i64>) {
    let file: FearGreedFile =
        load_json_or_default(&signals_dir.join("market").join("fear_greed_latest.json"));
    let regime = match file.regime.as_deref() {
        Some("EXTREME_FEAR") => MarketRegime::ExtremeFear,
        Some("FEAR") => MarketRegime::Fear,
        Some("NEUTRAL") => MarketRegime::Neutral,
        Some("GREED") => MarketRegime::Greed,
        Some("EXTREME_GREED") => MarketRegime::ExtremeGreed,
        _ => MarketRegime::Unknown,
    };
    (regime, file.value)
}

// ── External exit signals (whale / sentiment urgency) ────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitSignal {
    pub token: String,
    pub source: String,
    pub urgency: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitSignals {
    #[serde(default)]
    pub signals: Vec<ExitSignal>,
}

impl ExitSignals {
    pub fn load(state_dir: &Path) -> Self {
        load_json_or_default(&state_dir.join("exit_signals.json"))
    }

    /// High-urgency exit for this token within the last 30 minutes.
    pub fn urgent_exit_for(&self, token: &str, now: DateTime<Utc>) -> Option<&ExitSignal> {
        self.signals.iter().find(|s| {
            s.token.eq_ignore_ascii_case(token)
                && s.urgency.eq_ignore_ascii_case("HIGH")
                && (now - s.timestamp).num_minutes() <= 30
        })
    }
}

// ── Rejection cooldown registry ──────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RejectionCooldowns {
    #[serde(flatten)]
    pub rejected_at: BTreeMap<String, DateTime<Utc>>,
}

impl RejectionCooldowns {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("rejection_cooldowns.json")
    }

    pub fn load(state_dir: &Path) -> Self {
        load_json_or_default(&Self::path(state_dir))
    }

    pub fn remaining_minutes(
        &self,
        token: &str,
        cooldown_minutes: i64,
        now: DateTime<Utc>,
    ) -> Option<i64> {
        let at = self.rejected_at.get(&token.to_uppercase())?;
        let elapsed = (now - *at).num_minutes();
        (elapsed < cooldown_minutes).then_some(cooldown_minutes - elapsed)
    }

    pub fn record(&mut self, token: &str, now: DateTime<Utc>, state_dir: &Path) -> Result<()> {
        self.rejected_at.insert(token.to_uppercase(), now);
        // Drop entries older than a day while we're here
        self.rejected_at.retain(|_, at| (now - *at).num_hours() < 24);
        save_json_atomic(&Self::path(state_dir), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("feeds_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn latest_signal_file_picks_newest_and_skips_excluded() {
        let dir = temp_dir();
        std::fs::write(dir.join("old.json"), r#"{"signals": []}"#).unwrap();
        std::fs::write(
            dir.join("global_latest.json"),
            r#"{"signals": [{"token": "X", "token_address": "", "chain": "", "source_primary": "cg", "signal_type": "T", "thesis": ""}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("newest.json"),
            r#"{"signals": [{"token": "WIF", "token_address": "a", "chain": "solana", "source_primary": "birdeye", "signal_type": "MEME_GAINER", "thesis": "momo"}]}"#,
        )
        .unwrap();

        let (path, signals, age) = latest_signal_file(&dir, 30, &["global_latest.json"]);
        assert!(path.is_some());
        assert!(age < 1.0);
        // newest.json and old.json have near-identical mtimes; either way the
        // excluded file must not be chosen
        assert_ne!(
            path.unwrap().file_name().unwrap().to_str().unwrap(),
            "global_latest.json"
        );
        assert!(signals.len() <= 1);
    }

    #[test]
    fn missing_directory_reports_no_files() {
        let (path, signals, age) = latest_signal_file(Path::new("/nonexistent/feeds"), 30, &[]);
        assert!(path.is_none());
        assert!(signals.is_empty());
        assert_eq!(age, 999.0);
    }

    #[test]
    fn price_history_window_lookup() {
        let now = Utc::now();
        let mut history = PriceHistory::default();
        history.series.insert(
            "BTCUSDT".into(),
            vec![
                PricePoint { timestamp: now - chrono::Duration::minutes(15), price: dec!(95000) },
                PricePoint { timestamp: now - chrono::Duration::seconds(30), price: dec!(66500) },
            ],
        );

        assert_eq!(history.price_near("BTCUSDT", now, 15), Some(dec!(95000)));
        assert_eq!(history.recent_price("BTCUSDT", now), Some(dec!(66500)));
        assert_eq!(history.price_near("ETHUSDT", now, 15), None);
    }

    #[test]
    fn rejection_cooldown_expires() {
        let dir = temp_dir();
        let now = Utc::now();
        let mut cooldowns = RejectionCooldowns::default();
        cooldowns.record("wif", now - chrono::Duration::minutes(10), &dir).unwrap();

        let loaded = RejectionCooldowns::load(&dir);
        assert!(loaded.remaining_minutes("WIF", 30, now).is_some());
        assert!(loaded.remaining_minutes("WIF", 30, now + chrono::Duration::minutes(25)).is_none());
        assert!(loaded.remaining_minutes("BONK", 30, now).is_none());
    }

    #[test]
    fn portfolio_round_trips() {
        let dir = temp_dir();
        let mut pf = PortfolioState::default();
        pf.daily_pnl_pct = -2.5;
        pf.token_exposure_pct.insert("WIF".into(), 3.0);
        pf.save(&dir).unwrap();

        let loaded = PortfolioState::load(&dir).unwrap();
        assert_eq!(loaded.daily_pnl_pct, -2.5);
        assert_eq!(loaded.token_exposure_pct.get("WIF"), Some(&3.0));
        assert_eq!(loaded.current_balance_usd, dec!(10000));
    }

    #[test]
    fn urgent_exit_signal_matching() {
        let now = Utc::now();
        let signals = ExitSignals {
            signals: vec![
                ExitSignal {
                    token: "WIF".into(),
                    source: "whale_tracker".into(),
                    urgency: "HIGH".into(),
                    timestamp: now - chrono::Duration::minutes(5),
                },
                ExitSignal {
                    token: "BONK".into(),
                    source: "sentiment".into(),
                    urgency: "LOW".into(),
                    timestamp: now,
                },
            ],
        };
        assert!(signals.urgent_exit_for("wif", now).is_some());
        assert!(signals.urgent_exit_for("BONK", now).is_none());
        // Stale urgency does not trigger
        assert!(signals.urgent_exit_for("WIF", now + chrono::Duration::hours(1)).is_none());
    }
}
