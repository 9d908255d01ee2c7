//! Public REST client for ticker prices and the tradable-pair listing.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::types::{ApiResponse, AssetPairsResponse, TickerResponse};
use super::{ExchangeError, MarketData};

const PUBLIC_API_BASE: &str = "https://api.kraken.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Read-only market data client.
///
/// The ticker answers with canonical pair names (`XXBTZUSD`) even when asked
/// for an alias (`XBTUSD`), so aliases learned from the pair listing are used
/// to key prices by the name the caller asked for.
pub struct MarketDataClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    /// Any accepted spelling, uppercased, to canonical pair name
    aliases: Mutex<HashMap<String, String>>,
}

impl MarketDataClient {
    pub fn new() -> Result<Self, ExchangeError> {
        Self::with_base_url(PUBLIC_API_BASE.to_string(), DEFAULT_TIMEOUT)
    }

    /// Create with custom base URL and request timeout.
    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            timeout,
            aliases: Mutex::new(HashMap::new()),
        })
    }

    async fn get_public<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ExchangeError> {
        let url = format!("{}/0/public/{}", self.base_url, path);
        debug!(url = %url, "Fetching public endpoint");

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::Timeout {
                        operation: "public request",
                        after: self.timeout,
                    }
                } else {
                    ExchangeError::from(e)
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExchangeError::RateLimited(format!("{} returned 429", path)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Network(format!("{} request failed: {} - {}", path, status, body)));
        }

        let envelope: ApiResponse<T> = response.json().await?;
        if let Some(first) = envelope.error.first() {
            return Err(classify_api_error(first));
        }
        envelope
            .result
            .ok_or_else(|| ExchangeError::Malformed(format!("{} response has no result", path)))
    }

    fn canonical_name(&self, pair: &str) -> String {
        let key = pair.to_ascii_uppercase();
        self.aliases
            .lock()
            .ok()
            .and_then(|aliases| aliases.get(&key).cloned())
            .unwrap_or(key)
    }

    fn learn_aliases(&self, listing: &AssetPairsResponse) {
        if let Ok(mut aliases) = self.aliases.lock() {
            *aliases = alias_map(listing);
        }
    }
}

#[async_trait]
impl MarketData for MarketDataClient {
    async fn get_prices(&self, pairs: &[String]) -> Result<HashMap<String, Decimal>, ExchangeError> {
        if pairs.is_empty() {
            return Ok(HashMap::new());
        }
        let mut requested: Vec<String> = pairs.iter().map(|p| self.canonical_name(p)).collect();
        requested.sort();
        requested.dedup();
        let ticker: TickerResponse = self.get_public("Ticker", &[("pair", requested.join(","))]).await?;

        let mut prices = HashMap::new();
        for pair in pairs {
            let info = ticker
                .get(pair)
                .or_else(|| ticker.get(&self.canonical_name(pair)))
                .or_else(|| (pairs.len() == 1 && ticker.len() == 1).then(|| ticker.values().next()).flatten());

            let Some(info) = info else {
                warn!(pair = %pair, "No ticker entry for pair");
                continue;
            };
            match info.c.first().map(|p| Decimal::from_str(p)) {
                Some(Ok(price)) => {
                    prices.insert(pair.clone(), price);
                }
                _ => warn!(pair = %pair, "Ticker entry has no usable last price"),
            }
        }
        Ok(prices)
    }

    async fn get_asset_pairs(&self) -> Result<HashSet<String>, ExchangeError> {
        let listing: AssetPairsResponse = self.get_public("AssetPairs", &[]).await?;
        self.learn_aliases(&listing);
        Ok(alias_map(&listing).into_keys().collect())
    }
}

/// Every spelling of each listed pair mapped to its canonical name.
fn alias_map(listing: &AssetPairsResponse) -> HashMap<String, String> {
    let mut aliases = HashMap::new();
    for (name, info) in listing {
        let canonical = name.to_ascii_uppercase();
        aliases.insert(canonical.clone(), name.clone());
        if !info.altname.is_empty() {
            aliases.insert(info.altname.to_ascii_uppercase(), name.clone());
        }
        if let Some(ws) = &info.wsname {
            aliases.insert(ws.to_ascii_uppercase(), name.clone());
        }
    }
    aliases
}

fn classify_api_error(message: &str) -> ExchangeError {
    if message.contains("Rate limit") || message.contains("Too many requests") {
        ExchangeError::RateLimited(message.to_string())
    } else if message.starts_with("EAPI:Invalid key") || message.starts_with("EAPI:Invalid signature") {
        ExchangeError::Auth(message.to_string())
    } else if message.starts_with("EService:Unavailable") || message.starts_with("EService:Busy") {
        ExchangeError::Network(message.to_string())
    } else {
        ExchangeError::Rejected(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::AssetPairInfo;

    fn listing() -> AssetPairsResponse {
        HashMap::from([
            (
                "XXBTZUSD".to_string(),
                AssetPairInfo {
                    altname: "XBTUSD".to_string(),
                    wsname: Some("XBT/USD".to_string()),
                    base: "XXBT".to_string(),
                    quote: "ZUSD".to_string(),
                },
            ),
            (
                "SOLUSD".to_string(),
                AssetPairInfo {
                    altname: "SOLUSD".to_string(),
                    wsname: Some("SOL/USD".to_string()),
                    base: "SOL".to_string(),
                    quote: "ZUSD".to_string(),
                },
            ),
        ])
    }

    #[test]
    fn test_alias_map_covers_all_spellings() {
        let aliases = alias_map(&listing());
        assert_eq!(aliases.get("XBTUSD").map(String::as_str), Some("XXBTZUSD"));
        assert_eq!(aliases.get("XBT/USD").map(String::as_str), Some("XXBTZUSD"));
        assert_eq!(aliases.get("XXBTZUSD").map(String::as_str), Some("XXBTZUSD"));
        assert_eq!(aliases.get("SOL/USD").map(String::as_str), Some("SOLUSD"));
        assert_eq!(aliases.len(), 5);
    }

    #[test]
    fn test_canonical_name_uses_learned_aliases() {
        let client = MarketDataClient::new().unwrap();
        assert_eq!(client.canonical_name("xbtusd"), "XBTUSD");
        client.learn_aliases(&listing());
        assert_eq!(client.canonical_name("xbtusd"), "XXBTZUSD");
    }

    #[test]
    fn test_classify_api_error() {
        assert!(matches!(
            classify_api_error("EAPI:Rate limit exceeded"),
            ExchangeError::RateLimited(_)
        ));
        assert!(matches!(
            classify_api_error("EQuery:Unknown asset pair"),
            ExchangeError::Rejected(_)
        ));
        assert!(matches!(
            classify_api_error("EService:Unavailable"),
            ExchangeError::Network(_)
        ));
    }

    #[test]
    fn test_ticker_envelope_parses() {
        let body = r#"{"error":[],"result":{"XXBTZUSD":{"a":["1","1","1"],"c":["50123.4","0.01"]}}}"#;
        let parsed: ApiResponse<TickerResponse> = serde_json::from_str(body).unwrap();
        let result = parsed.result.unwrap();
        assert_eq!(result["XXBTZUSD"].c[0], "50123.4");
    }
}
