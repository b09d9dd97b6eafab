use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::gateway::GatewayError;

/// Read-only price lookup, separate from the order gateway so the paper
/// connector can mark its book against the same feed the live path uses.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Latest price for `pair`. Zero means the feed had no fresh update.
    async fn latest_price(&self, pair: &str) -> Result<Decimal, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
    converted_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    parsed: Vec<FeedEntry>,
}

/// HTTP client for the price feed service.
pub struct FeedClient {
    http: reqwest::Client,
    endpoint: String,
}

impl FeedClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PriceSource for FeedClient {
    async fn latest_price(&self, pair: &str) -> Result<Decimal, GatewayError> {
        let url = format!("{}/latest_price_updates", self.endpoint);
        let resp = self
            .http
            .get(&url)
            .query(&[("pair", pair)])
            .send()
            .await?
            .error_for_status()?;
        let body: FeedResponse = resp.json().await?;
        Ok(body
            .parsed
            .first()
            .map(|entry| entry.converted_price)
            .unwrap_or(Decimal::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_normalized_without_trailing_slash() {
        let client = FeedClient::new("https://feed.example.com/");
        assert_eq!(client.endpoint, "https://feed.example.com");
        let client = FeedClient::new("https://feed.example.com");
        assert_eq!(client.endpoint, "https://feed.example.com");
    }

    #[test]
    fn feed_response_parses_converted_price() {
        let json = r#"{"parsed":[{"converted_price":50123.45}]}"#;
        let body: FeedResponse = serde_json::from_str(json).unwrap();
        assert_eq!(body.parsed.len(), 1);
        assert_eq!(body.parsed[0].converted_price.to_string(), "50123.45");
    }
}
