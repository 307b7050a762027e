//! Strategy selection and sizing math: Thompson sampling over per-regime
//! Beta posteriors, UCB1 source scoring, and fractional Kelly sizing.
//!
//! The contracts matter here, not the derivations: selection must be
//! reproducible given an injected RNG, and sizing must respect the cold-start
//! default and mode caps.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Posterior for one (strategy, regime) arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditStat {
    pub strategy_id: String,
    pub regime_tag: String,
    pub alpha: f64,
    pub beta: f64,
    pub n: u64,
}

impl BanditStat {
    pub fn fresh(strategy_id: &str, regime_tag: &str) -> Self {
        BanditStat {
            strategy_id: strategy_id.to_string(),
            regime_tag: regime_tag.to_string(),
            alpha: 1.0,
            beta: 1.0,
            n: 0,
        }
    }

    /// Posterior update from a trade outcome.
    pub fn record_outcome(&mut self, win: bool) {
        if win {
            self.alpha += 1.0;
        } else {
            self.beta += 1.0;
        }
        self.n += 1;
    }
}

/// Marsaglia–Tsang gamma sampler (shape >= 0, unit scale).
fn sample_gamma<R: Rng>(rng: &mut R, shape: f64) -> f64 {
    if shape < 1.0 {
        // Boost trick: Gamma(a) = Gamma(a+1) * U^(1/a)
        let u: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
        return sample_gamma(rng, shape + 1.0) * u.powf(1.0 / shape);
    }

    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    loop {
        // Standard normal via Box-Muller
        let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = rng.random();
        let x = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();

        let v = (1.0 + c * x).powi(3);
        if v <= 0.0 {
            continue;
        }
        let u: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
        if u.ln() < 0.5 * x * x + d - d * v + d * v.ln() {
            return d * v;
        }
    }
}

/// Draw from Beta(alpha, beta).
pub fn sample_beta<R: Rng>(rng: &mut R, alpha: f64, beta: f64) -> f64 {
    let x = sample_gamma(rng, alpha.max(f64::MIN_POSITIVE));
    let y = sample_gamma(rng, beta.max(f64::MIN_POSITIVE));
    if x + y == 0.0 { 0.5 } else { x / (x + y) }
}

/// Thompson selection over eligible arms. Returns the chosen strategy and its
/// sampled score; `None` when no arm is eligible (caller falls back to the
/// registry default).
pub fn thompson_select<R: Rng>(
    rng: &mut R,
    arms: &[BanditStat],
    eligible: &[&str],
) -> Option<(String, f64)> {
    let mut best: Option<(String, f64)> = None;
    for name in eligible {
        let (alpha, beta) = arms
            .iter()
            .find(|a| a.strategy_id == *name)
            .map(|a| (a.alpha, a.beta))
            .unwrap_or((1.0, 1.0));
        let score = sample_beta(rng, alpha, beta);
        if best.as_ref().is_none_or(|(_, s)| score > *s) {
            best = Some((name.to_string(), score));
        }
    }
    best
}

/// UCB1 score for a signal source: mean reward plus exploration bonus.
pub fn ucb1_score(n_total: u64, n_source: u64, reward_sum: f64) -> f64 {
    if n_source == 0 {
        return f64::INFINITY;
    }
    let mean = reward_sum / n_source as f64;
    let bonus = (2.0 * (n_total.max(1) as f64).ln() / n_source as f64).sqrt();
    mean + bonus
}

/// Letter grade for a source's empirical win rate, fed into the Sanad prompt.
pub fn source_grade(n: u64, reward_sum: f64) -> char {
    if n < 3 {
        return 'C';
    }
    let win_rate = reward_sum / n as f64;
    match win_rate {
        w if w >= 0.65 => 'A',
        w if w >= 0.50 => 'B',
        w if w >= 0.35 => 'C',
        _ => 'D',
    }
}

/// Aggregate view of closed trades used by Kelly sizing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TradeStats {
    pub closed_trades: usize,
    pub win_rate: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
}

/// Fractional Kelly position sizing.
///
/// Below `min_trades` of history the cold-start default applies. The result
/// is floored at 0.5% so a thin edge still produces learning trades, and the
/// caller caps it at the mode maximum.
pub fn kelly_position_pct(
    stats: TradeStats,
    min_trades: usize,
    kelly_fraction: f64,
    default_pct: f64,
) -> f64 {
    if stats.closed_trades < min_trades {
        return default_pct;
    }
    if stats.avg_loss_pct <= 0.0 {
        return (stats.win_rate * kelly_fraction).max(0.005);
    }

    let b = stats.avg_win_pct / stats.avg_loss_pct;
    if b <= 0.0 {
        return default_pct;
    }
    let kelly_full = (stats.win_rate * b - (1.0 - stats.win_rate)) / b;
    (kelly_full * kelly_fraction).max(0.005)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn beta_samples_stay_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let s = sample_beta(&mut rng, 2.0, 5.0);
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn beta_mean_tracks_posterior() {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 4000;
        let mean: f64 = (0..n).map(|_| sample_beta(&mut rng, 8.0, 2.0)).sum::<f64>() / n as f64;
        // E[Beta(8,2)] = 0.8
        assert!((mean - 0.8).abs() < 0.03, "mean was {mean}");
    }

    #[test]
    fn thompson_prefers_strong_arm() {
        let mut rng = StdRng::seed_from_u64(1);
        let arms = vec![
            BanditStat { strategy_id: "winner".into(), regime_tag: "FEAR".into(), alpha: 40.0, beta: 5.0, n: 45 },
            BanditStat { strategy_id: "loser".into(), regime_tag: "FEAR".into(), alpha: 5.0, beta: 40.0, n: 45 },
        ];
        let eligible = ["winner", "loser"];
        let mut wins = 0;
        for _ in 0..100 {
            let (picked, _) = thompson_select(&mut rng, &arms, &eligible).unwrap();
            if picked == "winner" {
                wins += 1;
            }
        }
        assert!(wins > 85, "winner picked only {wins}/100 times");
    }

    #[test]
    fn thompson_with_no_eligible_arms_is_none() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(thompson_select(&mut rng, &[], &[]).is_none());
    }

    #[test]
    fn ucb1_favors_unexplored_sources() {
        assert_eq!(ucb1_score(100, 0, 0.0), f64::INFINITY);
        let explored = ucb1_score(100, 50, 30.0);
        let fresh = ucb1_score(100, 2, 1.0);
        assert!(fresh > explored);
    }

    #[test]
    fn record_outcome_moves_posterior() {
        let mut arm = BanditStat::fresh("meme-momentum", "NEUTRAL");
        arm.record_outcome(true);
        arm.record_outcome(true);
        arm.record_outcome(false);
        assert_eq!(arm.alpha, 3.0);
        assert_eq!(arm.beta, 2.0);
        assert_eq!(arm.n, 3);
    }

    #[test]
    fn kelly_cold_start_uses_default() {
        let stats = TradeStats { closed_trades: 3, ..TradeStats::default() };
        assert_eq!(kelly_position_pct(stats, 10, 0.5, 0.02), 0.02);
    }

    #[test]
    fn kelly_scales_with_edge() {
        let stats = TradeStats {
            closed_trades: 50,
            win_rate: 0.6,
            avg_win_pct: 0.20,
            avg_loss_pct: 0.10,
        };
        // full kelly = (0.6*2 - 0.4)/2 = 0.4; half kelly = 0.2
        let pct = kelly_position_pct(stats, 10, 0.5, 0.02);
        assert!((pct - 0.20).abs() < 1e-9);
    }

    #[test]
    fn kelly_floors_negative_edge() {
        let stats = TradeStats {
            closed_trades: 50,
            win_rate: 0.2,
            avg_win_pct: 0.05,
            avg_loss_pct: 0.10,
        };
        assert_eq!(kelly_position_pct(stats, 10, 0.5, 0.02), 0.005);
    }

    #[test]
    fn source_grades_by_win_rate() {
        assert_eq!(source_grade(1, 1.0), 'C');
        assert_eq!(source_grade(10, 7.0), 'A');
        assert_eq!(source_grade(10, 5.0), 'B');
        assert_eq!(source_grade(10, 1.0), 'D');
    }
}
