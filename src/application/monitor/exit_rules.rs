//! Exit rule evaluation. Pure functions over a position and market inputs;
//! the monitor applies them in spec order and the first match closes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::domain::position::{ExitReason, Position};
use crate::infrastructure::feeds::{load_json_or_default, save_json_atomic};

/// Trailing stop activates at +4% unrealized and trails 3% from the
/// per-symbol high-water mark.
pub const TRAILING_ACTIVATION_PCT: f64 = 0.04;
pub const TRAILING_DROP_PCT: f64 = 0.03;
/// Breakeven ratchet: at +5% the stop tightens to 0.1% below entry.
pub const BREAKEVEN_ACTIVATION_PCT: f64 = 0.05;
pub const BREAKEVEN_STOP_PCT: f64 = 0.001;
/// Flash crash: any watched symbol down more than 10% over 15 minutes.
pub const FLASH_CRASH_PCT: f64 = 0.10;
pub const FLASH_CRASH_WINDOW_MIN: i64 = 15;

#[derive(Debug, Clone, PartialEq)]
pub struct ExitTrigger {
    pub reason: ExitReason,
    pub detail: String,
}

pub fn check_stop_loss(position: &Position, current: Decimal) -> Option<ExitTrigger> {
    let stop_price = position.entry_price
        * (Decimal::ONE - Decimal::from_f64(position.stop_loss_pct).unwrap_or(Decimal::ZERO));
    (current <= stop_price).then(|| ExitTrigger {
        reason: ExitReason::StopLoss,
        detail: format!(
            "Price ${current} <= stop ${stop_price:.4} (-{:.0}%)",
            position.stop_loss_pct * 100.0
        ),
    })
}

pub fn check_take_profit(position: &Position, current: Decimal) -> Option<ExitTrigger> {
    let tp_price = position.entry_price
        * (Decimal::ONE + Decimal::from_f64(position.take_profit_pct).unwrap_or(Decimal::ZERO));
    (current >= tp_price).then(|| ExitTrigger {
        reason: ExitReason::TakeProfit,
        detail: format!(
            "Price ${current} >= target ${tp_price:.4} (+{:.0}%)",
            position.take_profit_pct * 100.0
        ),
    })
}

/// Breakeven ratchet. Does not close; returns the tightened stop fraction
/// when the activation threshold is reached. Monotonic: never loosens.
pub fn breakeven_ratchet(position: &Position, current: Decimal) -> Option<f64> {
    let unrealized = position.unrealized_pct(current);
    (unrealized >= BREAKEVEN_ACTIVATION_PCT && position.stop_loss_pct > BREAKEVEN_STOP_PCT)
        .then_some(BREAKEVEN_STOP_PCT)
}

/// Per-symbol trailing stop state, persisted across monitor cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingState {
    pub high_water_mark: Decimal,
    pub activated: bool,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrailingStops {
    #[serde(flatten)]
    pub by_symbol: BTreeMap<String, TrailingState>,
}

impl TrailingStops {
    pub fn load(state_dir: &Path) -> Self {
        load_json_or_default(&state_dir.join("trailing_stops.json"))
    }

    pub fn save(&self, state_dir: &Path) -> anyhow::Result<()> {
        save_json_atomic(&state_dir.join("trailing_stops.json"), self)
    }

    pub fn remove(&mut self, symbol: &str) {
        self.by_symbol.remove(symbol);
    }
}

/// Trailing stop: activates at the configured gain, then closes on the
/// configured drop from the high-water mark. The mark is non-decreasing
/// while the position stays open.
pub fn check_trailing_stop(
    position: &Position,
    current: Decimal,
    stops: &mut TrailingStops,
    now: DateTime<Utc>,
) -> Option<ExitTrigger> {
    let unrealized = position.unrealized_pct(current);
    let entry = stops.by_symbol.get(&position.symbol).cloned();

    let mut state = match entry {
        None | Some(TrailingState { activated: false, .. }) => {
            if unrealized >= TRAILING_ACTIVATION_PCT {
                let state = TrailingState { high_water_mark: current, activated: true, activated_at: now };
                stops.by_symbol.insert(position.symbol.clone(), state);
            }
            return None;
        }
        Some(state) => state,
    };

    if current > state.high_water_mark {
        state.high_water_mark = current;
        stops.by_symbol.insert(position.symbol.clone(), state.clone());
        return None;
    }

    let hwm = state.high_water_mark;
    let drop = ((hwm - current) / hwm).to_f64().unwrap_or(0.0);
    (drop >= TRAILING_DROP_PCT).then(|| ExitTrigger {
        reason: ExitReason::TrailingStop,
        detail: format!(
            "Price ${current} dropped {:.1}% from HWM ${hwm} (threshold: {:.0}%)",
            drop * 100.0,
            TRAILING_DROP_PCT * 100.0
        ),
    })
}

pub fn check_time_exit(position: &Position, max_hold_hours: f64, now: DateTime<Utc>) -> Option<ExitTrigger> {
    let hold = position.hold_hours(now);
    (hold > max_hold_hours).then(|| ExitTrigger {
        reason: ExitReason::TimeExit,
        detail: format!("Position open {hold:.1}h > {max_hold_hours:.0}h max"),
    })
}

/// Momentum decay needs BOTH a negative two-hour return and a >30% volume
/// drop from entry; either alone is a normal pullback.
pub fn check_momentum_decay(
    position: &Position,
    current: Decimal,
    price_2h_ago: Option<Decimal>,
    current_volume_24h: Option<Decimal>,
) -> Option<ExitTrigger> {
    let price_2h_ago = price_2h_ago?;
    if price_2h_ago <= Decimal::ZERO {
        return None;
    }
    let two_hour_return = ((current - price_2h_ago) / price_2h_ago).to_f64().unwrap_or(0.0);
    if two_hour_return >= 0.0 {
        return None;
    }

    let entry_vol = position.entry_volume_24h.filter(|v| *v > Decimal::ZERO)?;
    let current_vol = current_volume_24h.filter(|v| *v > Decimal::ZERO)?;
    let vol_change = ((current_vol - entry_vol) / entry_vol).to_f64().unwrap_or(0.0);

    (vol_change < -0.30).then(|| ExitTrigger {
        reason: ExitReason::MomentumDecay,
        detail: format!(
            "2h return: {:.1}% (negative) AND volume dropped {:.0}% from entry",
            two_hour_return * 100.0,
            vol_change.abs() * 100.0
        ),
    })
}

/// Flash-crash scan over watched symbols. Returns the triggering symbols and
/// their drops.
pub fn detect_flash_crash(
    recent_and_old: &[(String, Decimal, Decimal)],
) -> Vec<(String, f64)> {
    let mut triggered = Vec::new();
    for (symbol, recent, old) in recent_and_old {
        if *old <= Decimal::ZERO {
            continue;
        }
        let change = ((*recent - *old) / *old).to_f64().unwrap_or(0.0);
        if change <= -FLASH_CRASH_PCT {
            triggered.push((symbol.clone(), change));
        }
    }
    triggered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::PositionStatus;
    use rust_decimal_macros::dec;

    fn position(entry: Decimal, sl: f64, tp: f64) -> Position {
        Position {
            position_id: "p1".into(),
            decision_id: "d1".into(),
            signal_id: "s1".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: PositionStatus::Open,
            token: "WIF".into(),
            token_address: "addr".into(),
            chain: "solana".into(),
            symbol: "WIFUSDT".into(),
            strategy_id: "meme-momentum".into(),
            entry_price: entry,
            size_usd: dec!(200),
            size_token: dec!(100),
            stop_loss_pct: sl,
            take_profit_pct: tp,
            breakeven_activated: false,
            entry_volume_24h: Some(dec!(1000000)),
            exit_price: None,
            exit_reason: None,
            closed_at: None,
            pnl_usd: None,
            pnl_pct: None,
            risk_flag: None,
            async_analysis_complete: false,
            async_analysis_json: None,
            regime_tag: None,
            source_primary: None,
            execution_mode: None,
        }
    }

    #[test]
    fn stop_loss_and_take_profit_boundaries() {
        let pos = position(dec!(2.00), 0.15, 0.30);
        assert!(check_stop_loss(&pos, dec!(1.70)).is_some());
        assert!(check_stop_loss(&pos, dec!(1.71)).is_none());
        assert!(check_take_profit(&pos, dec!(2.60)).is_some());
        assert!(check_take_profit(&pos, dec!(2.59)).is_none());
    }

    #[test]
    fn breakeven_ratchet_activates_once_and_is_monotonic() {
        let mut pos = position(dec!(2.00), 0.15, 0.30);
        assert_eq!(breakeven_ratchet(&pos, dec!(2.08)).is_some(), false); // +4% — not yet
        let tightened = breakeven_ratchet(&pos, dec!(2.10)).unwrap(); // +5%
        assert_eq!(tightened, BREAKEVEN_STOP_PCT);
        assert!(tightened < pos.stop_loss_pct);

        // Already tightened: never widens, never re-fires
        pos.stop_loss_pct = BREAKEVEN_STOP_PCT;
        assert!(breakeven_ratchet(&pos, dec!(2.50)).is_none());
    }

    #[test]
    fn trailing_stop_tracks_high_water_mark() {
        let pos = position(dec!(2.00), 0.15, 0.50);
        let mut stops = TrailingStops::default();
        let now = Utc::now();

        // Below activation: nothing recorded
        assert!(check_trailing_stop(&pos, dec!(2.04), &mut stops, now).is_none());
        assert!(!stops.by_symbol.contains_key("WIFUSDT"));

        // +4% activates at HWM 2.08
        assert!(check_trailing_stop(&pos, dec!(2.08), &mut stops, now).is_none());
        assert!(stops.by_symbol["WIFUSDT"].activated);

        // New high raises the mark
        assert!(check_trailing_stop(&pos, dec!(2.20), &mut stops, now).is_none());
        assert_eq!(stops.by_symbol["WIFUSDT"].high_water_mark, dec!(2.20));

        // Dip under 3% of HWM holds
        assert!(check_trailing_stop(&pos, dec!(2.15), &mut stops, now).is_none());
        // HWM is non-decreasing
        assert_eq!(stops.by_symbol["WIFUSDT"].high_water_mark, dec!(2.20));

        // 2.20 * 0.97 = 2.134
        let trigger = check_trailing_stop(&pos, dec!(2.13), &mut stops, now).unwrap();
        assert_eq!(trigger.reason, ExitReason::TrailingStop);
    }

    #[test]
    fn time_exit_after_max_hold() {
        let mut pos = position(dec!(2.00), 0.15, 0.30);
        pos.created_at = Utc::now() - chrono::Duration::hours(13);
        assert!(check_time_exit(&pos, 12.0, Utc::now()).is_some());
        assert!(check_time_exit(&pos, 24.0, Utc::now()).is_none());
    }

    #[test]
    fn momentum_decay_requires_both_conditions() {
        let pos = position(dec!(2.00), 0.15, 0.30);

        // Negative 2h return, volume holding: no exit
        assert!(check_momentum_decay(&pos, dec!(1.95), Some(dec!(2.00)), Some(dec!(950000))).is_none());
        // Positive return, volume collapsed: no exit
        assert!(check_momentum_decay(&pos, dec!(2.05), Some(dec!(2.00)), Some(dec!(500000))).is_none());
        // Both: exit
        let trigger =
            check_momentum_decay(&pos, dec!(1.95), Some(dec!(2.00)), Some(dec!(500000))).unwrap();
        assert_eq!(trigger.reason, ExitReason::MomentumDecay);
        // Missing history: no exit
        assert!(check_momentum_decay(&pos, dec!(1.95), None, Some(dec!(500000))).is_none());
    }

    #[test]
    fn flash_crash_detection_at_threshold() {
        // 95000 -> 66500 is a 30% drop
        let triggered = detect_flash_crash(&[
            ("BTCUSDT".into(), dec!(66500), dec!(95000)),
            ("ETHUSDT".into(), dec!(3050), dec!(3100)),
        ]);
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].0, "BTCUSDT");
        assert!((triggered[0].1 + 0.30).abs() < 1e-9);
    }
}
