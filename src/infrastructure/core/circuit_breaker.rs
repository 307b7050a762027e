//! Per-component circuit breakers.
//!
//! closed → open after `trip_threshold` errors inside `window_seconds`;
//! open → half-open after `cooldown_seconds`; half-open closes on a
//! successful probe and reopens on a failed one. The counter is a sliding
//! window of error timestamps, so stale errors age out naturally.
//!
//! State persists to a shared JSON file because workers are short-lived cron
//! processes; the policy engine (Gate 10 pre-check) and the heartbeat read
//! the same snapshot.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub error_timestamps: Vec<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            error_timestamps: Vec::new(),
            opened_at: None,
            cooldown_until: None,
            last_error: None,
        }
    }
}

/// File-backed registry of breakers keyed by component name.
pub struct CircuitBreakerPool {
    path: PathBuf,
    config: BreakerConfig,
    records: BTreeMap<String, BreakerRecord>,
}

impl CircuitBreakerPool {
    pub fn load(path: &Path, config: BreakerConfig) -> Self {
        let records = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self { path: path.to_path_buf(), config, records }
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create breaker state directory")?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&self.records)?)
            .context("Failed to write breaker state")?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace breaker state")?;
        Ok(())
    }

    /// Check whether a call to `component` may proceed, advancing
    /// open → half-open when the cooldown has elapsed.
    pub fn allow_request(&mut self, component: &str, now: DateTime<Utc>) -> bool {
        let record = self.records.entry(component.to_string()).or_default();
        match record.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if record.cooldown_until.is_some_and(|until| now >= until) {
                    info!("CircuitBreaker [{component}]: Open -> HalfOpen (cooldown elapsed)");
                    record.state = CircuitState::HalfOpen;
                    let _ = self.persist();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a failed call. Trips the breaker when the windowed error count
    /// reaches the threshold; a half-open probe failure reopens immediately.
    pub fn record_failure(&mut self, component: &str, error: &str, now: DateTime<Utc>) {
        let window = chrono::Duration::seconds(self.config.window_seconds);
        let cooldown = chrono::Duration::seconds(self.config.cooldown_seconds);
        let threshold = self.config.trip_threshold;

        let record = self.records.entry(component.to_string()).or_default();
        record.last_error = Some(error.to_string());
        record.error_timestamps.push(now);
        record.error_timestamps.retain(|ts| now - *ts <= window);

        match record.state {
            CircuitState::Closed => {
                if record.error_timestamps.len() >= threshold {
                    error!(
                        "CircuitBreaker [{component}]: Closed -> Open ({} errors in {}s)",
                        record.error_timestamps.len(),
                        self.config.window_seconds
                    );
                    record.state = CircuitState::Open;
                    record.opened_at = Some(now);
                    record.cooldown_until = Some(now + cooldown);
                }
            }
            CircuitState::HalfOpen => {
                warn!("CircuitBreaker [{component}]: HalfOpen -> Open (probe failed)");
                record.state = CircuitState::Open;
                record.opened_at = Some(now);
                record.cooldown_until = Some(now + cooldown);
            }
            CircuitState::Open => {}
        }
        let _ = self.persist();
    }

    /// Record a successful call. Closes a half-open breaker and clears the
    /// error window.
    pub fn record_success(&mut self, component: &str, now: DateTime<Utc>) {
        let record = self.records.entry(component.to_string()).or_default();
        match record.state {
            CircuitState::HalfOpen => {
                info!("CircuitBreaker [{component}]: HalfOpen -> Closed (probe succeeded)");
                record.state = CircuitState::Closed;
                record.error_timestamps.clear();
                record.opened_at = None;
                record.cooldown_until = None;
            }
            CircuitState::Closed => {
                record.error_timestamps.retain(|ts| {
                    now - *ts <= chrono::Duration::seconds(self.config.window_seconds)
                });
            }
            CircuitState::Open => {}
        }
        let _ = self.persist();
    }

    pub fn state(&self, component: &str) -> CircuitState {
        self.records.get(component).map(|r| r.state).unwrap_or(CircuitState::Closed)
    }

    /// Components currently open, for the pre-gate simultaneous-trip check.
    pub fn open_components(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, r)| r.state == CircuitState::Open)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> &BTreeMap<String, BreakerRecord> {
        &self.records
    }
}

/// Read-only view of the shared breaker file, for workers that never record
/// outcomes (policy engine, heartbeat).
pub fn read_open_components(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<BTreeMap<String, BreakerRecord>>(&raw).ok())
        .map(|records| {
            records
                .into_iter()
                .filter(|(_, r)| r.state == CircuitState::Open)
                .map(|(name, _)| name)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> CircuitBreakerPool {
        let path = std::env::temp_dir().join(format!("breakers_{}.json", uuid::Uuid::new_v4()));
        CircuitBreakerPool::load(
            &path,
            BreakerConfig {
                simultaneous_trip_pause: 3,
                window_seconds: 300,
                trip_threshold: 3,
                cooldown_seconds: 300,
            },
        )
    }

    #[test]
    fn trips_after_threshold_within_window() {
        let mut pool = pool();
        let now = Utc::now();

        for i in 0..3 {
            assert!(pool.allow_request("birdeye", now));
            pool.record_failure("birdeye", "HTTP 500", now + chrono::Duration::seconds(i));
        }

        assert_eq!(pool.state("birdeye"), CircuitState::Open);
        assert!(!pool.allow_request("birdeye", now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn stale_errors_age_out_of_window() {
        let mut pool = pool();
        let now = Utc::now();

        pool.record_failure("dexscreener", "timeout", now);
        pool.record_failure("dexscreener", "timeout", now + chrono::Duration::seconds(1));
        // Third error arrives after the first two left the window
        pool.record_failure("dexscreener", "timeout", now + chrono::Duration::seconds(400));

        assert_eq!(pool.state("dexscreener"), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_closes_or_reopens() {
        let mut pool = pool();
        let now = Utc::now();

        for i in 0..3 {
            pool.record_failure("coingecko", "HTTP 503", now + chrono::Duration::seconds(i));
        }
        assert_eq!(pool.state("coingecko"), CircuitState::Open);

        // Cooldown elapses: next request is allowed as a probe
        let later = now + chrono::Duration::seconds(301);
        assert!(pool.allow_request("coingecko", later));
        assert_eq!(pool.state("coingecko"), CircuitState::HalfOpen);

        pool.record_failure("coingecko", "HTTP 503", later);
        assert_eq!(pool.state("coingecko"), CircuitState::Open);

        let much_later = later + chrono::Duration::seconds(301);
        assert!(pool.allow_request("coingecko", much_later));
        pool.record_success("coingecko", much_later);
        assert_eq!(pool.state("coingecko"), CircuitState::Closed);
    }

    #[test]
    fn snapshot_round_trips_through_file() {
        let path = std::env::temp_dir().join(format!("breakers_{}.json", uuid::Uuid::new_v4()));
        let config = BreakerConfig {
            simultaneous_trip_pause: 3,
            window_seconds: 300,
            trip_threshold: 1,
            cooldown_seconds: 300,
        };
        let mut pool = CircuitBreakerPool::load(&path, config.clone());
        pool.record_failure("mexc", "connection refused", Utc::now());
        assert_eq!(pool.state("mexc"), CircuitState::Open);

        // A fresh process sees the same open breaker
        let reloaded = CircuitBreakerPool::load(&path, config);
        assert_eq!(reloaded.state("mexc"), CircuitState::Open);
        assert_eq!(read_open_components(&path), vec!["mexc".to_string()]);
    }
}
