//! Kraken asset symbol normalization.
//!
//! Kraken prefixes crypto assets with `X` and fiat with `Z` in REST
//! responses (`XXBT`, `ZUSD`) and uses `XBT` for Bitcoin everywhere. The
//! engine works in canonical codes; this module maps both directions.

use cross_arb_core::{ExchangeError, Result, TradingPair};

/// Maps a Kraken asset code to the canonical currency code.
#[must_use]
pub fn to_canonical(asset: &str) -> String {
    let upper = asset.to_uppercase();
    match upper.as_str() {
        "XXBT" | "XBT" => "BTC".to_string(),
        "XETH" => "ETH".to_string(),
        "XXRP" => "XRP".to_string(),
        "XLTC" => "LTC".to_string(),
        "XXLM" => "XLM".to_string(),
        "XXMR" => "XMR".to_string(),
        "XZEC" => "ZEC".to_string(),
        "XXDG" | "XDG" => "DOGE".to_string(),
        "ZUSD" => "USD".to_string(),
        "ZEUR" => "EUR".to_string(),
        "ZGBP" => "GBP".to_string(),
        "ZJPY" => "JPY".to_string(),
        "ZCAD" => "CAD".to_string(),
        "ZAUD" => "AUD".to_string(),
        _ => upper,
    }
}

/// Maps a canonical currency code to the name Kraken uses in pair strings.
#[must_use]
pub fn from_canonical(currency: &str) -> String {
    let upper = currency.to_uppercase();
    match upper.as_str() {
        "BTC" => "XBT".to_string(),
        "DOGE" => "XDG".to_string(),
        _ => upper,
    }
}

/// Pair name for the WebSocket feed, e.g. `XBT/USDT`.
#[must_use]
pub fn ws_pair_name(pair: &TradingPair) -> String {
    format!("{}/{}", from_canonical(pair.base()), from_canonical(pair.quote()))
}

/// Pair name for REST endpoints, e.g. `XBTUSDT`.
#[must_use]
pub fn rest_pair_name(pair: &TradingPair) -> String {
    format!("{}{}", from_canonical(pair.base()), from_canonical(pair.quote()))
}

/// Parses a WebSocket pair name back into a canonical pair.
///
/// # Errors
/// Returns `Protocol` when the name is not `BASE/QUOTE`.
pub fn parse_ws_pair(name: &str) -> Result<TradingPair> {
    let (base, quote) = name
        .split_once('/')
        .ok_or_else(|| ExchangeError::protocol(format!("bad pair name: {name}")))?;
    Ok(TradingPair::new(to_canonical(base), to_canonical(quote)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_assets_to_canonical() {
        assert_eq!(to_canonical("XXBT"), "BTC");
        assert_eq!(to_canonical("XETH"), "ETH");
        assert_eq!(to_canonical("ZUSD"), "USD");
        assert_eq!(to_canonical("ZEUR"), "EUR");
        assert_eq!(to_canonical("xxbt"), "BTC");
    }

    #[test]
    fn test_unprefixed_assets_pass_through() {
        assert_eq!(to_canonical("USDT"), "USDT");
        assert_eq!(to_canonical("SOL"), "SOL");
    }

    #[test]
    fn test_from_canonical() {
        assert_eq!(from_canonical("BTC"), "XBT");
        assert_eq!(from_canonical("USDT"), "USDT");
        assert_eq!(from_canonical("eth"), "ETH");
    }

    #[test]
    fn test_pair_names() {
        let pair = TradingPair::new("BTC", "USDT");
        assert_eq!(ws_pair_name(&pair), "XBT/USDT");
        assert_eq!(rest_pair_name(&pair), "XBTUSDT");
    }

    #[test]
    fn test_parse_ws_pair_round_trip() {
        let pair = TradingPair::new("BTC", "USDT");
        assert_eq!(parse_ws_pair("XBT/USDT").unwrap(), pair);
        assert_eq!(parse_ws_pair(&ws_pair_name(&pair)).unwrap(), pair);
        assert!(parse_ws_pair("XBTUSDT").is_err());
    }
}
