//! Token profiling and tier classification.
//!
//! Every candidate is classified into a detailed tier, then simplified to
//! SKIP / TIER_1 / TIER_2 / TIER_3 / WHALE. The simple tier determines
//! eligible strategies, debate prompt templates and veto rules. TIER_3 runs
//! a deterministic safety gate before any LLM spend.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::signal::Signal;

/// Detailed asset classification, first-match-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetTier {
    Stable,
    Tier1Macro,
    Tier2AltLarge,
    Tier2AltMid,
    Tier2AltSmall,
    Tier3MemeCex,
    Tier3MemeMid,
    Tier3MemeMicro,
    Tier3Micro,
    Whale,
    Unknown,
}

impl fmt::Display for AssetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetTier::Stable => "STABLE",
            AssetTier::Tier1Macro => "TIER_1_MACRO",
            AssetTier::Tier2AltLarge => "TIER_2_ALT_LARGE",
            AssetTier::Tier2AltMid => "TIER_2_ALT_MID",
            AssetTier::Tier2AltSmall => "TIER_2_ALT_SMALL",
            AssetTier::Tier3MemeCex => "TIER_3_MEME_CEX",
            AssetTier::Tier3MemeMid => "TIER_3_MEME_MID",
            AssetTier::Tier3MemeMicro => "TIER_3_MEME_MICRO",
            AssetTier::Tier3Micro => "TIER_3_MICRO",
            AssetTier::Whale => "WHALE",
            AssetTier::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Simplified tier used by strategy constraints, prompts and vetoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimpleTier {
    Skip,
    Tier1,
    Tier2,
    Tier3,
    Whale,
}

impl fmt::Display for SimpleTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SimpleTier::Skip => "SKIP",
            SimpleTier::Tier1 => "TIER_1",
            SimpleTier::Tier2 => "TIER_2",
            SimpleTier::Tier3 => "TIER_3",
            SimpleTier::Whale => "WHALE",
        };
        write!(f, "{s}")
    }
}

impl AssetTier {
    pub fn simplify(self) -> SimpleTier {
        match self {
            AssetTier::Stable => SimpleTier::Skip,
            AssetTier::Tier1Macro => SimpleTier::Tier1,
            AssetTier::Tier2AltLarge | AssetTier::Tier2AltMid | AssetTier::Tier2AltSmall => {
                SimpleTier::Tier2
            }
            AssetTier::Tier3MemeCex
            | AssetTier::Tier3MemeMid
            | AssetTier::Tier3MemeMicro
            | AssetTier::Tier3Micro => SimpleTier::Tier3,
            AssetTier::Whale => SimpleTier::Whale,
            // Most conservative analysis for unclassifiable tokens
            AssetTier::Unknown => SimpleTier::Tier3,
        }
    }
}

/// Classified view of a token: tier, safety signals, liquidity metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenProfile {
    pub symbol: String,
    pub chain: Option<String>,
    pub address: Option<String>,
    pub market_cap: Option<Decimal>,
    pub fdv: Option<Decimal>,
    pub circulating_pct: Option<f64>,
    pub liquidity_usd: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    pub age_days: Option<f64>,
    pub cex_listed: bool,
    pub dex_only: bool,
    pub rugcheck_score: Option<f64>,
    pub lp_locked_pct: Option<f64>,
    pub holder_top10_pct: Option<f64>,
    pub honeypot_verdict: Option<String>,
    pub rugpull_verdict: Option<String>,
    pub security_flags: Vec<String>,
    pub mc_to_liquidity_ratio: Option<f64>,
    pub whale_signal: bool,
    pub asset_tier: Option<AssetTier>,
}

impl TokenProfile {
    /// Build a profile from an enriched signal.
    pub fn from_signal(signal: &Signal) -> Self {
        let mut profile = TokenProfile {
            symbol: signal.token.clone(),
            chain: (!signal.chain.is_empty()).then(|| signal.chain.clone()),
            address: (!signal.token_address.is_empty()).then(|| signal.token_address.clone()),
            market_cap: signal.market_cap_usd,
            fdv: signal.fdv_usd,
            liquidity_usd: signal.liquidity_usd,
            volume_24h: signal.volume_24h,
            age_days: signal.token_age_hours.map(|h| h / 24.0),
            cex_listed: signal.cex_listed,
            dex_only: !signal.cex_listed && !signal.chain.is_empty(),
            rugcheck_score: signal.rugcheck_score,
            holder_top10_pct: signal.top10_holder_pct,
            security_flags: signal.rug_flags.clone(),
            whale_signal: signal.smart_money_signal && signal.signal_type.contains("WHALE"),
            ..TokenProfile::default()
        };

        if let (Some(mc), Some(fdv)) = (profile.market_cap, profile.fdv)
            && fdv > Decimal::ZERO
        {
            profile.circulating_pct = (mc / fdv).to_f64().map(|f| f * 100.0);
        }

        if let Some(ev) = &signal.onchain_evidence {
            if ev.is_honeypot == Some(true) {
                profile.honeypot_verdict = Some("HONEYPOT".into());
            }
            profile.rugpull_verdict = ev.rugpull_verdict.clone();
            profile.security_flags.extend(ev.rugpull_flags.iter().cloned());
            if let Some(locked) = ev.lp_locked {
                profile.lp_locked_pct = Some(if locked { 100.0 } else { 0.0 });
            }
        }

        if let (Some(mc), Some(liq)) = (profile.market_cap, profile.liquidity_usd)
            && liq > Decimal::ZERO
        {
            profile.mc_to_liquidity_ratio = (mc / liq).to_f64();
        }

        profile.asset_tier = Some(classify_asset(&profile));
        profile
    }

    pub fn simple_tier(&self) -> SimpleTier {
        self.asset_tier.unwrap_or(AssetTier::Unknown).simplify()
    }
}

const STABLE_KEYWORDS: &[&str] = &["usd", "usdt", "usdc", "dai", "busd", "tusd", "frax"];

const MEME_PATTERNS: &[&str] = &[
    "inu", "pepe", "doge", "dog", "cat", "wif", "bonk", "meme", "trump", "elon", "moon",
    "rocket", "safe", "baby", "floki",
];

/// Symbol-pattern meme detection, shared with the flash-crash override.
pub fn looks_like_meme(symbol: &str) -> bool {
    let lower = symbol.to_lowercase();
    MEME_PATTERNS.iter().any(|p| lower.contains(p))
}

fn dec_from(n: u64) -> Decimal {
    Decimal::from(n)
}

/// Tier classification, first-match-wins. A $3B meme is still a meme:
/// symbol pattern takes priority over market cap above the $20B macro line.
pub fn classify_asset(profile: &TokenProfile) -> AssetTier {
    let symbol = profile.symbol.to_lowercase();
    let mc = profile.market_cap.unwrap_or(Decimal::ZERO);
    let liq = profile.liquidity_usd.unwrap_or(Decimal::ZERO);

    if STABLE_KEYWORDS.iter().any(|kw| symbol.contains(kw)) {
        return AssetTier::Stable;
    }

    if profile.whale_signal {
        return AssetTier::Whale;
    }

    if mc > dec_from(20_000_000_000) {
        return AssetTier::Tier1Macro;
    }

    if looks_like_meme(&symbol) {
        if profile.cex_listed && mc >= dec_from(100_000_000) {
            return AssetTier::Tier3MemeCex;
        } else if mc >= dec_from(10_000_000) {
            return AssetTier::Tier3MemeMid;
        }
        return AssetTier::Tier3MemeMicro;
    }

    if mc < dec_from(50_000_000) && profile.dex_only && liq < dec_from(2_000_000) {
        return AssetTier::Tier3Micro;
    }

    if mc >= dec_from(5_000_000_000) {
        return AssetTier::Tier2AltLarge;
    } else if mc >= dec_from(200_000_000) {
        return AssetTier::Tier2AltMid;
    } else if mc >= dec_from(50_000_000) {
        return AssetTier::Tier2AltSmall;
    }

    if profile.cex_listed {
        return AssetTier::Tier2AltSmall;
    }

    AssetTier::Tier3Micro
}

/// Pre-LLM safety gate for TIER_3 tokens. Hard blocks only; returns the
/// first failing check.
pub fn meme_safety_gate(profile: &TokenProfile) -> Result<(), String> {
    if profile.simple_tier() != SimpleTier::Tier3 {
        return Ok(());
    }

    if profile.honeypot_verdict.as_deref() == Some("HONEYPOT") {
        return Err("Honeypot detected".into());
    }

    if let Some(v) = profile.rugpull_verdict.as_deref()
        && matches!(v, "RUG" | "BLACKLISTED")
    {
        return Err(format!("Rugpull verdict: {v}"));
    }

    for flag in ["mint_active", "freeze_active", "honeypot"] {
        if profile.security_flags.iter().any(|f| f == flag) {
            return Err(format!("Security flag: {flag}"));
        }
    }

    if let Some(lp) = profile.lp_locked_pct
        && lp < 50.0
    {
        return Err(format!("LP locked <50%: {lp:.1}%"));
    }

    if let Some(top10) = profile.holder_top10_pct
        && top10 > 60.0
    {
        return Err(format!("Top 10 holders >60%: {top10:.1}%"));
    }

    if let Some(score) = profile.rugcheck_score
        && score < 30.0
    {
        return Err(format!("RugCheck score <30: {score:.0}/100"));
    }

    if let Some(ratio) = profile.mc_to_liquidity_ratio
        && ratio > 50.0
    {
        return Err(format!("MC/Liquidity ratio >50x: {ratio:.1}x"));
    }

    if profile.security_flags.iter().any(|f| f == "high_tax") {
        return Err("High tax detected (>10% buy or sell)".into());
    }

    Ok(())
}

/// Static per-strategy tier and liquidity constraints.
#[derive(Debug, Clone)]
pub struct StrategyConstraint {
    pub name: &'static str,
    pub allowed_tiers: &'static [SimpleTier],
    pub min_liquidity: Option<u64>,
    pub max_age_days: Option<f64>,
    pub min_market_cap: Option<u64>,
    pub max_market_cap: Option<u64>,
    pub requires_no_cex: bool,
}

pub const STRATEGY_CONSTRAINTS: &[StrategyConstraint] = &[
    StrategyConstraint {
        name: "meme-momentum",
        allowed_tiers: &[SimpleTier::Tier3],
        min_liquidity: Some(50_000),
        max_age_days: Some(30.0),
        min_market_cap: None,
        max_market_cap: None,
        requires_no_cex: false,
    },
    StrategyConstraint {
        name: "early-launch",
        allowed_tiers: &[SimpleTier::Tier3],
        min_liquidity: Some(10_000),
        max_age_days: Some(1.0),
        min_market_cap: None,
        max_market_cap: None,
        requires_no_cex: false,
    },
    StrategyConstraint {
        name: "whale-following",
        allowed_tiers: &[SimpleTier::Tier1, SimpleTier::Tier2, SimpleTier::Tier3, SimpleTier::Whale],
        min_liquidity: Some(100_000),
        max_age_days: None,
        min_market_cap: None,
        max_market_cap: None,
        requires_no_cex: false,
    },
    StrategyConstraint {
        name: "sentiment-divergence",
        allowed_tiers: &[SimpleTier::Tier1, SimpleTier::Tier2],
        min_liquidity: None,
        max_age_days: None,
        min_market_cap: Some(100_000_000),
        max_market_cap: None,
        requires_no_cex: false,
    },
    StrategyConstraint {
        name: "cex-listing-play",
        allowed_tiers: &[SimpleTier::Tier2],
        min_liquidity: None,
        max_age_days: None,
        min_market_cap: Some(50_000_000),
        max_market_cap: Some(5_000_000_000),
        requires_no_cex: true,
    },
];

/// Default strategy when Thompson sampling has no eligible arm.
pub const DEFAULT_STRATEGY: &str = "meme-momentum";

/// Filter the strategy registry by tier constraints.
pub fn eligible_strategies(profile: &TokenProfile) -> Vec<&'static str> {
    let tier = profile.simple_tier();
    if tier == SimpleTier::Skip {
        return Vec::new();
    }

    STRATEGY_CONSTRAINTS
        .iter()
        .filter(|c| c.allowed_tiers.contains(&tier))
        .filter(|c| match c.min_liquidity {
            Some(min) => profile.liquidity_usd.is_some_and(|l| l >= Decimal::from(min)),
            None => true,
        })
        .filter(|c| match c.max_age_days {
            Some(max) => profile.age_days.is_some_and(|a| a <= max),
            None => true,
        })
        .filter(|c| match c.min_market_cap {
            Some(min) => profile.market_cap.is_some_and(|m| m >= Decimal::from(min)),
            None => true,
        })
        .filter(|c| match c.max_market_cap {
            Some(max) => profile.market_cap.is_none_or(|m| m <= Decimal::from(max)),
            None => true,
        })
        .filter(|c| !c.requires_no_cex || !profile.cex_listed)
        .map(|c| c.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn profile(symbol: &str, mc: u64) -> TokenProfile {
        TokenProfile {
            symbol: symbol.into(),
            market_cap: Some(Decimal::from(mc)),
            ..TokenProfile::default()
        }
    }

    #[test]
    fn stablecoins_classify_as_stable() {
        let p = profile("USDC", 30_000_000_000);
        assert_eq!(classify_asset(&p), AssetTier::Stable);
        assert_eq!(AssetTier::Stable.simplify(), SimpleTier::Skip);
    }

    #[test]
    fn macro_bluechip_above_20b() {
        let p = profile("SOL", 80_000_000_000);
        assert_eq!(classify_asset(&p), AssetTier::Tier1Macro);
    }

    #[test]
    fn meme_pattern_beats_market_cap_below_macro_line() {
        let mut p = profile("WIF", 3_000_000_000);
        p.cex_listed = true;
        assert_eq!(classify_asset(&p), AssetTier::Tier3MemeCex);
        assert_eq!(classify_asset(&p).simplify(), SimpleTier::Tier3);
    }

    #[test]
    fn micro_meme_is_trench_territory() {
        let p = profile("BABYCAT", 500_000);
        assert_eq!(classify_asset(&p), AssetTier::Tier3MemeMicro);
    }

    #[test]
    fn mid_caps_are_tier2() {
        assert_eq!(classify_asset(&profile("LINK", 9_000_000_000)), AssetTier::Tier2AltLarge);
        assert_eq!(classify_asset(&profile("ONDO", 900_000_000)), AssetTier::Tier2AltMid);
        assert_eq!(classify_asset(&profile("INIT", 80_000_000)), AssetTier::Tier2AltSmall);
    }

    #[test]
    fn dex_only_micro_cap_is_tier3() {
        let mut p = profile("OBSCURE", 4_000_000);
        p.dex_only = true;
        p.liquidity_usd = Some(dec!(150000));
        assert_eq!(classify_asset(&p), AssetTier::Tier3Micro);
    }

    #[test]
    fn safety_gate_only_applies_to_tier3() {
        let mut p = profile("LINK", 9_000_000_000);
        p.honeypot_verdict = Some("HONEYPOT".into());
        p.asset_tier = Some(classify_asset(&p));
        assert!(meme_safety_gate(&p).is_ok());
    }

    #[test]
    fn safety_gate_hard_blocks() {
        let mut p = profile("BABYCAT", 500_000);
        p.asset_tier = Some(classify_asset(&p));

        p.lp_locked_pct = Some(20.0);
        assert!(meme_safety_gate(&p).unwrap_err().contains("LP locked"));

        p.lp_locked_pct = Some(90.0);
        p.holder_top10_pct = Some(75.0);
        assert!(meme_safety_gate(&p).unwrap_err().contains("Top 10"));

        p.holder_top10_pct = Some(30.0);
        p.rugcheck_score = Some(12.0);
        assert!(meme_safety_gate(&p).unwrap_err().contains("RugCheck"));

        p.rugcheck_score = Some(80.0);
        p.mc_to_liquidity_ratio = Some(120.0);
        assert!(meme_safety_gate(&p).unwrap_err().contains("MC/Liquidity"));

        p.mc_to_liquidity_ratio = Some(5.0);
        p.security_flags.push("mint_active".into());
        assert!(meme_safety_gate(&p).unwrap_err().contains("mint_active"));
    }

    #[test]
    fn eligible_strategies_respect_tier_and_liquidity() {
        let mut p = profile("BABYCAT", 500_000);
        p.liquidity_usd = Some(dec!(80000));
        p.age_days = Some(5.0);
        p.asset_tier = Some(classify_asset(&p));
        let eligible = eligible_strategies(&p);
        assert!(eligible.contains(&"meme-momentum"));
        assert!(!eligible.contains(&"sentiment-divergence"));
        // age 5d excludes early-launch (max 1d)
        assert!(!eligible.contains(&"early-launch"));
    }

    #[test]
    fn cex_listing_play_requires_unlisted_tier2() {
        let mut p = profile("MOVE", 300_000_000);
        p.asset_tier = Some(classify_asset(&p));
        assert!(eligible_strategies(&p).contains(&"cex-listing-play"));
        p.cex_listed = true;
        assert!(!eligible_strategies(&p).contains(&"cex-listing-play"));
    }

    #[test]
    fn skip_tier_has_no_strategies() {
        let mut p = profile("USDT", 100_000_000_000);
        p.asset_tier = Some(classify_asset(&p));
        assert!(eligible_strategies(&p).is_empty());
    }
}
