use std::collections::HashMap;

use once_cell::sync::Lazy;

/// All tradable pairs as `(pair_index, name, category)`. Indexes are
/// venue-assigned and sparse: crypto occupies 1-26, forex 51-52 and
/// commodities 61-62.
pub static TRADING_PAIRS: &[(u16, &str, &str)] = &[
    (1, "BTC/USD", "Crypto"),
    (2, "ETH/USD", "Crypto"),
    (3, "SOL/USD", "Crypto"),
    (4, "BNB/USD", "Crypto"),
    (5, "AVAX/USD", "Crypto"),
    (6, "NEAR/USD", "Crypto"),
    (7, "SUI/USD", "Crypto"),
    (8, "SEI/USD", "Crypto"),
    (9, "INJ/USD", "Crypto"),
    (10, "TIA/USD", "Crypto"),
    (11, "ARB/USD", "Crypto"),
    (12, "OP/USD", "Crypto"),
    (13, "STX/USD", "Crypto"),
    (14, "LINK/USD", "Crypto"),
    (15, "AAVE/USD", "Crypto"),
    (16, "LDO/USD", "Crypto"),
    (17, "DOGE/USD", "Crypto"),
    (18, "SHIB/USD", "Crypto"),
    (19, "PEPE/USD", "Crypto"),
    (20, "WIF/USD", "Crypto"),
    (21, "BONK/USD", "Crypto"),
    (22, "XRP/USD", "Crypto"),
    (23, "APE/USD", "Crypto"),
    (24, "JUP/USD", "Crypto"),
    (25, "WLD/USD", "Crypto"),
    (26, "ORDI/USD", "Crypto"),
    (51, "EUR/USD", "Forex"),
    (52, "GBP/USD", "Forex"),
    (61, "XAU/USD", "Commodities"),
    (62, "XAG/USD", "Commodities"),
];

static PAIRS_BY_NAME: Lazy<HashMap<&'static str, (u16, &'static str)>> = Lazy::new(|| {
    TRADING_PAIRS
        .iter()
        .map(|&(index, name, category)| (name, (index, category)))
        .collect()
});

pub fn pair_index(name: &str) -> Option<u16> {
    PAIRS_BY_NAME.get(name).map(|&(index, _)| index)
}

pub fn pair_name(index: u16) -> Option<&'static str> {
    TRADING_PAIRS
        .iter()
        .find(|&&(candidate, _, _)| candidate == index)
        .map(|&(_, name, _)| name)
}

pub fn pair_category(name: &str) -> &'static str {
    PAIRS_BY_NAME
        .get(name)
        .map(|&(_, category)| category)
        .unwrap_or("Unknown")
}

pub fn pair_names() -> Vec<&'static str> {
    TRADING_PAIRS.iter().map(|&(_, name, _)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_pairs_resolve_in_both_directions() {
        assert_eq!(pair_index("BTC/USD"), Some(1));
        assert_eq!(pair_index("XAU/USD"), Some(61));
        assert_eq!(pair_name(2), Some("ETH/USD"));
        assert_eq!(pair_name(52), Some("GBP/USD"));
    }

    #[test]
    fn unknown_pairs_are_rejected() {
        assert_eq!(pair_index("FOO/BAR"), None);
        assert_eq!(pair_name(999), None);
    }

    #[test]
    fn categories_fall_back_to_unknown() {
        assert_eq!(pair_category("EUR/USD"), "Forex");
        assert_eq!(pair_category("XAG/USD"), "Commodities");
        assert_eq!(pair_category("FOO/BAR"), "Unknown");
    }

    #[test]
    fn pair_names_lists_every_entry() {
        let names = pair_names();
        assert_eq!(names.len(), TRADING_PAIRS.len());
        assert!(names.contains(&"SOL/USD"));
    }
}
