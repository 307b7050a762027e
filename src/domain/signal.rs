//! Normalized signal schema.
//!
//! Feed adapters map raw source payloads into this shape; the router and the
//! pipeline only ever see normalized signals. Enrichment (on-chain evidence,
//! corroboration) fills optional fields; genuinely open fields live in
//! `extras` so the typed surface stays stable.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Corroboration tiers by number of independent confirming sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorroborationLevel {
    /// Single source.
    Ahad,
    /// Two independent sources.
    Mashhur,
    /// Three independent sources.
    Tawatur,
    /// Four or more independent sources.
    TawaturQawiy,
}

impl CorroborationLevel {
    pub fn from_source_count(count: usize) -> Self {
        match count {
            0 | 1 => CorroborationLevel::Ahad,
            2 => CorroborationLevel::Mashhur,
            3 => CorroborationLevel::Tawatur,
            _ => CorroborationLevel::TawaturQawiy,
        }
    }

    /// Trust points contributed by corroboration. WEAK quality earns partial
    /// credit above Ahad.
    pub fn trust_points(self, quality: CorroborationQuality) -> i32 {
        match (self, quality) {
            (CorroborationLevel::Ahad, _) => 10,
            (CorroborationLevel::Mashhur, CorroborationQuality::Strong) => 18,
            (CorroborationLevel::Mashhur, CorroborationQuality::Weak) => 14,
            (CorroborationLevel::Tawatur, CorroborationQuality::Strong) => 25,
            (CorroborationLevel::Tawatur, CorroborationQuality::Weak) => 18,
            (CorroborationLevel::TawaturQawiy, CorroborationQuality::Strong) => 30,
            (CorroborationLevel::TawaturQawiy, CorroborationQuality::Weak) => 22,
        }
    }

    /// Grade label recomputed from the engine source count; the LLM's own
    /// corroboration claim is never trusted verbatim.
    pub fn grade(self) -> &'static str {
        match self {
            CorroborationLevel::Ahad => "Ahad",
            CorroborationLevel::Mashhur => "Mashhur",
            CorroborationLevel::Tawatur | CorroborationLevel::TawaturQawiy => "Tawatur",
        }
    }
}

impl fmt::Display for CorroborationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CorroborationLevel::Ahad => "AHAD",
            CorroborationLevel::Mashhur => "MASHHUR",
            CorroborationLevel::Tawatur => "TAWATUR",
            CorroborationLevel::TawaturQawiy => "TAWATUR_QAWIY",
        };
        write!(f, "{s}")
    }
}

/// Whether the corroborating sources are independent enough for full credit.
/// Fail closed: an untagged signal is WEAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CorroborationQuality {
    Strong,
    #[default]
    Weak,
}

/// Trading venue for the candidate token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Venue {
    Cex,
    Dex,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Cex => write!(f, "CEX"),
            Venue::Dex => write!(f, "DEX"),
        }
    }
}

/// Market regime derived from the fear/greed feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarketRegime {
    ExtremeFear,
    Fear,
    Neutral,
    Greed,
    ExtremeGreed,
    #[default]
    Unknown,
}

impl MarketRegime {
    /// Router score adjustment: established tokens are bargains in fear,
    /// everything is overheated in greed.
    pub fn score_adjustment(self) -> i32 {
        match self {
            MarketRegime::ExtremeFear => 15,
            MarketRegime::Fear => 5,
            MarketRegime::Neutral | MarketRegime::Unknown => 0,
            MarketRegime::Greed => -5,
            MarketRegime::ExtremeGreed => -15,
        }
    }

    /// Position-size multiplier applied at strategy match.
    pub fn size_modifier(self) -> f64 {
        match self {
            MarketRegime::ExtremeFear => 0.5,
            MarketRegime::Fear => 0.75,
            MarketRegime::Neutral | MarketRegime::Unknown => 1.0,
            MarketRegime::Greed => 0.8,
            MarketRegime::ExtremeGreed => 0.5,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            MarketRegime::ExtremeFear => "EXTREME_FEAR",
            MarketRegime::Fear => "FEAR",
            MarketRegime::Neutral => "NEUTRAL",
            MarketRegime::Greed => "GREED",
            MarketRegime::ExtremeGreed => "EXTREME_GREED",
            MarketRegime::Unknown => "UNKNOWN",
        }
    }
}

/// On-chain evidence attached during Sanad enrichment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnchainEvidence {
    pub is_honeypot: Option<bool>,
    pub rugpull_verdict: Option<String>,
    pub rugpull_flags: Vec<String>,
    pub sybil_risk: Option<String>,
    pub holder_risk_score: Option<f64>,
    pub lp_locked: Option<bool>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl OnchainEvidence {
    pub fn is_hard_blocked(&self) -> Option<String> {
        if self.is_honeypot == Some(true) {
            return Some("HONEYPOT detected".into());
        }
        if let Some(v) = self.rugpull_verdict.as_deref()
            && matches!(v, "RUG" | "BLACKLISTED")
        {
            return Some(format!("Rugpull scan verdict: {v}"));
        }
        if self.sybil_risk.as_deref() == Some("CRITICAL") {
            return Some(format!(
                "CRITICAL Sybil risk (holder risk score: {})",
                self.holder_risk_score
                    .map(|s| format!("{s:.0}"))
                    .unwrap_or_else(|| "?".into())
            ));
        }
        None
    }
}

/// A candidate trading opportunity, normalized across feed sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Signal {
    pub token: String,
    pub token_address: String,
    pub chain: String,
    pub source_primary: String,
    pub signal_type: String,
    pub thesis: String,
    pub timestamp: DateTime<Utc>,
    pub source_event_id: Option<String>,

    // Market metrics (optional; missing means the feed did not supply them)
    pub volume_24h: Option<Decimal>,
    pub liquidity_usd: Option<Decimal>,
    pub market_cap_usd: Option<Decimal>,
    pub fdv_usd: Option<Decimal>,
    pub price: Option<Decimal>,
    pub price_change_1h_pct: Option<f64>,
    pub price_change_24h_pct: Option<f64>,
    pub buy_sell_ratio: Option<f64>,
    pub token_age_hours: Option<f64>,
    pub holder_count: Option<u64>,
    pub top10_holder_pct: Option<f64>,
    pub smart_money_signal: bool,
    pub cex_listed: bool,
    pub boost_amount: Option<u32>,
    pub trending_rank: Option<u32>,
    pub rugcheck_score: Option<f64>,
    pub rug_flags: Vec<String>,
    pub volatility_30min_pct: Option<f64>,
    pub verified_catalyst: bool,

    // Cross-source corroboration (annotated by the router)
    pub cross_source_count: usize,
    pub cross_sources: Vec<String>,
    #[serde(default)]
    pub corroboration_quality: CorroborationQuality,

    // Enrichment
    pub onchain_evidence: Option<OnchainEvidence>,

    /// Open extension fields from source adapters.
    #[serde(default)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl Signal {
    pub fn corroboration_level(&self) -> CorroborationLevel {
        CorroborationLevel::from_source_count(self.cross_source_count.max(1))
    }

    /// CEX pairs trade against USDT; DEX tokens trade by address.
    pub fn symbol(&self) -> String {
        if self.cex_listed || self.chain.is_empty() {
            format!("{}USDT", self.token.to_uppercase())
        } else {
            self.token.to_uppercase()
        }
    }

    pub fn venue(&self) -> Venue {
        if !self.chain.is_empty() && !self.cex_listed {
            Venue::Dex
        } else {
            Venue::Cex
        }
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> f64 {
        (now - self.timestamp).num_seconds() as f64 / 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corroboration_level_from_counts() {
        assert_eq!(CorroborationLevel::from_source_count(1), CorroborationLevel::Ahad);
        assert_eq!(CorroborationLevel::from_source_count(2), CorroborationLevel::Mashhur);
        assert_eq!(CorroborationLevel::from_source_count(3), CorroborationLevel::Tawatur);
        assert_eq!(CorroborationLevel::from_source_count(5), CorroborationLevel::TawaturQawiy);
    }

    #[test]
    fn weak_quality_earns_partial_credit() {
        assert_eq!(CorroborationLevel::Tawatur.trust_points(CorroborationQuality::Strong), 25);
        assert_eq!(CorroborationLevel::Tawatur.trust_points(CorroborationQuality::Weak), 18);
        // Ahad is unaffected by quality
        assert_eq!(CorroborationLevel::Ahad.trust_points(CorroborationQuality::Weak), 10);
    }

    #[test]
    fn venue_follows_chain_and_listing() {
        let mut s = Signal { chain: "solana".into(), ..Signal::default() };
        assert_eq!(s.venue(), Venue::Dex);
        s.cex_listed = true;
        assert_eq!(s.venue(), Venue::Cex);
    }

    #[test]
    fn hard_block_detection() {
        let mut ev = OnchainEvidence::default();
        assert!(ev.is_hard_blocked().is_none());
        ev.rugpull_verdict = Some("RUG".into());
        assert!(ev.is_hard_blocked().unwrap().contains("RUG"));
        ev.rugpull_verdict = None;
        ev.is_honeypot = Some(true);
        assert!(ev.is_hard_blocked().unwrap().contains("HONEYPOT"));
    }

    #[test]
    fn regime_adjustments_are_symmetric_around_neutral() {
        assert_eq!(MarketRegime::Neutral.score_adjustment(), 0);
        assert!(MarketRegime::ExtremeFear.score_adjustment() > 0);
        assert!(MarketRegime::ExtremeGreed.score_adjustment() < 0);
    }
}
