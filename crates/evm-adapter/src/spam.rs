//! Spam-token filtering at the adapter boundary.
//!
//! Airdropped scam tokens advertise themselves through their metadata:
//! URLs, lookalike domains, and "claim your reward" phrasing in the symbol
//! or name. Adapters run discovery results through this filter before
//! returning them, so the rest of the stack never sees the junk.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::types::Asset;

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNALS
// ═══════════════════════════════════════════════════════════════════════════════

/// Case-insensitive signals matched against `"{symbol} {name}"`.
/// Any single match marks the asset as spam.
static SPAM_SIGNALS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)https?://",
        r"(?i)\.com|\.io|\.live|\.xyz|\.finance",
        r"(?i)claim|reward|airdrop",
        r"(?i)visit|redeem",
    ]
    .iter()
    .map(|pattern| {
        #[allow(clippy::unwrap_used)] // patterns are compile-time constants
        let signal = Regex::new(pattern).unwrap();
        signal
    })
    .collect()
});

// ═══════════════════════════════════════════════════════════════════════════════
// FILTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Drops assets whose metadata matches known spam signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpamFilter;

impl SpamFilter {
    /// Create a filter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Whether an asset's metadata trips any spam signal.
    #[must_use]
    pub fn is_spam(&self, asset: &Asset) -> bool {
        let haystack = format!("{} {}", asset.symbol, asset.name);
        SPAM_SIGNALS.iter().any(|signal| signal.is_match(&haystack))
    }

    /// Keep only non-spam assets.
    #[must_use]
    pub fn filter(&self, assets: Vec<Asset>) -> Vec<Asset> {
        let before = assets.len();
        let kept: Vec<Asset> = assets.into_iter().filter(|a| !self.is_spam(a)).collect();
        let dropped = before - kept.len();
        if dropped > 0 {
            debug!(dropped, kept = kept.len(), "Filtered spam tokens");
        }
        kept
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use alloy::primitives::Address;

    use super::*;

    fn token(symbol: &str, name: &str) -> Asset {
        Asset::token(Address::ZERO, symbol, name, 18)
    }

    #[test]
    fn url_bearing_tokens_are_spam() {
        assert!(SpamFilter::new().is_spam(&token("USDT", "Visit https://usdt-bonus.example")));
        assert!(SpamFilter::new().is_spam(&token("WIN", "win-eth.com")));
    }

    #[test]
    fn lookalike_domains_are_spam() {
        for name in ["rewards.io", "stake.live", "free.xyz", "yield.finance"] {
            assert!(SpamFilter::new().is_spam(&token("X", name)), "{name} should be spam");
        }
    }

    #[test]
    fn giveaway_phrasing_is_spam() {
        assert!(SpamFilter::new().is_spam(&token("CLAIM", "Claim your tokens")));
        assert!(SpamFilter::new().is_spam(&token("X", "AIRDROP winner")));
        assert!(SpamFilter::new().is_spam(&token("X", "Redeem now")));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(SpamFilter::new().is_spam(&token("x", "VISIT SITE")));
        assert!(SpamFilter::new().is_spam(&token("x", "HTTPS://scam.example")));
    }

    #[test]
    fn legitimate_tokens_pass() {
        let filter = SpamFilter::new();
        for (symbol, name) in [
            ("USDC", "USD Coin"),
            ("WETH", "Wrapped Ether"),
            ("UNI", "Uniswap"),
            ("DAI", "Dai Stablecoin"),
        ] {
            assert!(!filter.is_spam(&token(symbol, name)), "{symbol} flagged wrongly");
        }
    }

    #[test]
    fn filter_drops_only_spam() {
        let assets = vec![
            token("USDC", "USD Coin"),
            token("SCAM", "claim at scam.xyz"),
            token("WETH", "Wrapped Ether"),
        ];
        let kept = SpamFilter::new().filter(assets);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|a| a.symbol != "SCAM"));
    }
}
