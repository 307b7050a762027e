//! Configuration: a single YAML thresholds document.
//!
//! Missing config at startup is fatal. Missing state *during* a gate
//! evaluation is handled by the gates themselves (fail-closed BLOCK), so the
//! structs here keep hard defaults only where the original shipped them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Paper or live execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
}

impl TradingMode {
    pub fn is_paper(self) -> bool {
        matches!(self, TradingMode::Paper)
    }
}

impl FromStr for TradingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            _ => anyhow::bail!("Invalid mode: {}. Must be 'paper' or 'live'", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_drawdown_pct: f64,
    pub daily_loss_limit_pct: f64,
    pub max_meme_allocation_pct: f64,
    pub max_single_token_pct: f64,
    pub stop_loss_default_pct: f64,
    pub take_profit_default_pct: f64,
    pub paper_max_hold_hours: f64,
    pub max_hold_hours: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    pub kelly_fraction: f64,
    pub kelly_default_pct: f64,
    pub kelly_min_trades: usize,
    pub max_position_pct: f64,
    pub paper_default_pct: f64,
    pub paper_max_position_pct: f64,
    pub paper_regime_floor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyGatesConfig {
    pub price_max_age_sec: i64,
    pub onchain_max_age_sec: i64,
    pub token_min_age_hours: f64,
    pub max_slippage_bps: i64,
    pub max_spread_bps: i64,
    pub volatility_halt_pct: f64,
    pub volatility_halt_window_minutes: u32,
    pub exchange_error_rate_pct: f64,
    pub reconciliation_max_age_sec: i64,
    pub max_concurrent_positions: usize,
    pub cooldown_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub min_trust_score: f64,
    pub min_confidence_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanadConfig {
    pub signal_max_age_minutes: i64,
    pub minimum_trade_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_llm_spend_limit_usd: f64,
    pub monthly_llm_spend_limit_usd: f64,
    pub cost_per_trade_alert_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_trip_pause")]
    pub simultaneous_trip_pause: usize,
    pub window_seconds: i64,
    pub trip_threshold: usize,
    pub cooldown_seconds: i64,
}

fn default_trip_pause() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdPathConfig {
    pub model: String,
    pub judge_model: String,
    pub timeout_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_parallel")]
    pub parallel_bull_bear: bool,
    pub catastrophic_confidence_threshold: f64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_parallel() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_minutes: i64,
    #[serde(default = "default_max_daily_runs")]
    pub max_daily_runs: u32,
    #[serde(default = "default_pipeline_timeout")]
    pub pipeline_timeout_seconds: u64,
    #[serde(default = "default_rejection_cooldown")]
    pub rejection_cooldown_minutes: i64,
}

fn default_stale_threshold() -> i64 {
    30
}

fn default_max_daily_runs() -> u32 {
    20
}

fn default_pipeline_timeout() -> u64 {
    300
}

fn default_rejection_cooldown() -> i64 {
    30
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            stale_threshold_minutes: default_stale_threshold(),
            max_daily_runs: default_max_daily_runs(),
            pipeline_timeout_seconds: default_pipeline_timeout(),
            rejection_cooldown_minutes: default_rejection_cooldown(),
        }
    }
}

/// The thresholds document. One file, every tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mode: TradingMode,
    pub policy_version: String,
    pub risk: RiskConfig,
    pub sizing: SizingConfig,
    pub policy_gates: PolicyGatesConfig,
    pub scoring: ScoringConfig,
    pub sanad: SanadConfig,
    pub budget: BudgetConfig,
    pub circuit_breakers: BreakerConfig,
    pub cold_path: ColdPathConfig,
    #[serde(default)]
    pub router: RouterConfig,
    /// Base directory for state files, leases, flags and feed directories.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_db_url")]
    pub database_url: String,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("trading")
}

fn default_db_url() -> String {
    "sqlite://state/sanad_trader.db".to_string()
}

impl Config {
    /// Load from YAML. Missing file or malformed document fails startup.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join("state")
    }

    pub fn signals_dir(&self) -> PathBuf {
        self.base_dir.join("signals")
    }

    pub fn leases_dir(&self) -> PathBuf {
        self.base_dir.join("leases")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn kill_switch_path(&self) -> PathBuf {
        self.base_dir.join("config").join("kill_switch.flag")
    }

    pub fn pause_flag_path(&self) -> PathBuf {
        self.base_dir.join("config").join("router_pause.flag")
    }

    pub fn fast_path_flag_path(&self) -> PathBuf {
        self.base_dir.join("config").join("fast_path.flag")
    }

    /// Max hold differs by mode; paper cycles positions faster.
    pub fn max_hold_hours(&self) -> f64 {
        if self.mode.is_paper() {
            self.risk.paper_max_hold_hours
        } else {
            self.risk.max_hold_hours
        }
    }

    pub fn max_position_pct(&self) -> f64 {
        if self.mode.is_paper() {
            self.sizing.paper_max_position_pct
        } else {
            self.sizing.max_position_pct
        }
    }
}
