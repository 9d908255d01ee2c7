//! Wallet-key canonicalization and balance aggregation.
//!
//! Exchanges report one asset under several keys: a legacy four-letter code
//! (`XXBT`), the plain symbol (`XBT`), and per-wallet suffixes (`XBT.F` for
//! the funding wallet). Everything that names the same asset is summed.

use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use tracing::warn;

use crate::models::BalanceView;

/// Wallet suffixes folded into the base asset.
const WALLET_SUFFIXES: &[&str] = &[".F"];

/// Legacy asset codes and their canonical symbols.
const LEGACY_ASSETS: &[(&str, &str)] = &[
    ("XXBT", "XBT"),
    ("XETH", "ETH"),
    ("XETC", "ETC"),
    ("XLTC", "LTC"),
    ("XXRP", "XRP"),
    ("XXLM", "XLM"),
    ("XXMR", "XMR"),
    ("XZEC", "ZEC"),
    ("XREP", "REP"),
    ("XMLN", "MLN"),
    ("XXDG", "XDG"),
    ("ZUSD", "USD"),
    ("ZEUR", "EUR"),
    ("ZGBP", "GBP"),
    ("ZCAD", "CAD"),
    ("ZJPY", "JPY"),
    ("ZAUD", "AUD"),
    ("ZCHF", "CHF"),
];

/// Quote currencies recognized at the end of a pair, longest first.
const QUOTE_ASSETS: &[&str] = &[
    "ZUSD", "ZEUR", "ZGBP", "ZCAD", "ZJPY", "ZAUD", "ZCHF", "USDT", "USDC", "USD", "EUR", "GBP",
    "CAD", "JPY", "AUD", "CHF", "XXBT", "XBT", "XETH", "ETH",
];

/// Canonical symbol for a raw wallet key.
///
/// Unrecognized suffixes are left in place so they stay distinct assets.
pub fn canonical_asset(raw_key: &str) -> String {
    let key = raw_key.trim().to_ascii_uppercase();
    let base = WALLET_SUFFIXES
        .iter()
        .find_map(|suffix| key.strip_suffix(suffix))
        .unwrap_or(&key);

    LEGACY_ASSETS
        .iter()
        .find(|(legacy, _)| *legacy == base)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| base.to_string())
}

/// Canonical base asset of a trading pair, if a known quote currency ends it.
pub fn base_asset(pair: &str) -> Option<String> {
    let pair = pair.trim().to_ascii_uppercase();
    if let Some((base, _)) = pair.split_once('/') {
        return (!base.is_empty()).then(|| canonical_asset(base));
    }
    QUOTE_ASSETS.iter().find_map(|quote| {
        pair.strip_suffix(quote)
            .filter(|base| base.len() >= 2)
            .map(canonical_asset)
    })
}

/// Sum raw exchange balances by canonical asset.
///
/// Amounts that are not decimals are skipped with a warning.
pub fn aggregate(raw: &HashMap<String, String>) -> BalanceView {
    let mut view = BalanceView::new();
    let mut keys: Vec<&String> = raw.keys().collect();
    keys.sort();

    for key in keys {
        let value = &raw[key];
        match Decimal::from_str(value.trim()) {
            Ok(amount) => view.add(canonical_asset(key), key.clone(), amount),
            Err(e) => warn!(key = %key, value = %value, error = %e, "Skipping unparseable balance"),
        }
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_funding_wallet_and_legacy_key_merge() {
        let view = aggregate(&raw(&[("XXBT", "0.0"), ("XBT.F", "0.01069060")]));

        let btc = view.get("XBT").expect("XBT present");
        assert_eq!(btc.total, dec!(0.01069060));
        assert_eq!(
            btc.sources,
            vec![
                ("XBT.F".to_string(), dec!(0.01069060)),
                ("XXBT".to_string(), dec!(0.0)),
            ]
        );
        assert_eq!(view.assets().count(), 1);
    }

    #[test]
    fn test_all_spellings_sum() {
        let view = aggregate(&raw(&[
            ("XETH", "1.5"),
            ("ETH", "0.25"),
            ("ETH.F", "0.25"),
            ("ZUSD", "100"),
        ]));
        assert_eq!(view.total("ETH"), dec!(2.0));
        assert_eq!(view.total("USD"), dec!(100));
        assert_eq!(view.get("ETH").unwrap().sources.len(), 3);
    }

    #[test]
    fn test_unknown_suffix_stays_distinct() {
        let view = aggregate(&raw(&[("DOT", "10"), ("DOT.S", "5")]));
        assert_eq!(view.total("DOT"), dec!(10));
        assert_eq!(view.total("DOT.S"), dec!(5));
    }

    #[test]
    fn test_bad_amount_is_skipped() {
        let view = aggregate(&raw(&[("XXBT", "abc"), ("XBT.F", "0.5")]));
        assert_eq!(view.total("XBT"), dec!(0.5));
        assert_eq!(view.get("XBT").unwrap().sources.len(), 1);
    }

    #[test]
    fn test_canonical_asset_table() {
        assert_eq!(canonical_asset("XXBT"), "XBT");
        assert_eq!(canonical_asset("xbt.f"), "XBT");
        assert_eq!(canonical_asset("ZUSD"), "USD");
        assert_eq!(canonical_asset("SOL"), "SOL");
        assert_eq!(canonical_asset("XTZ"), "XTZ");
    }

    #[test]
    fn test_base_asset_resolution() {
        assert_eq!(base_asset("XXBTZUSD").as_deref(), Some("XBT"));
        assert_eq!(base_asset("XBTUSDT").as_deref(), Some("XBT"));
        assert_eq!(base_asset("XETHZEUR").as_deref(), Some("ETH"));
        assert_eq!(base_asset("SOLUSD").as_deref(), Some("SOL"));
        assert_eq!(base_asset("ETH/USD").as_deref(), Some("ETH"));
        assert_eq!(base_asset("ETHXBT").as_deref(), Some("ETH"));
        assert_eq!(base_asset("USD"), None);
    }
}
