use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::TraderApiConfig;
use crate::feed::PriceSource;
use crate::gateway::{
    ExchangeGateway, GatewayError, OpenTrades, OrderKind, OrderRequest, OrderSide, OrderTicket,
};

const HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Serialize)]
struct OpenOrderBody<'a> {
    trader: &'a str,
    pair_index: u16,
    is_long: bool,
    collateral: Decimal,
    leverage: u32,
    open_price: Decimal,
    tp: Decimal,
    sl: Decimal,
    order_type: OrderKind,
    slippage_pct: f64,
}

#[derive(Debug, Deserialize)]
struct OpenOrderReply {
    order_index: u32,
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct AllowanceReply {
    allowance: Decimal,
}

#[derive(Debug, Serialize)]
struct ApproveBody<'a> {
    owner: &'a str,
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct ApproveReply {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: String,
}

/// Order gateway backed by the venue's REST API. Prices come from the shared
/// feed client rather than the trading API.
pub struct RestGateway {
    http: reqwest::Client,
    base_url: String,
    wallet_address: String,
    slippage_pct: f64,
    feed: Arc<dyn PriceSource + Send + Sync>,
}

impl RestGateway {
    pub fn create(
        rest_endpoint: &str,
        trader: TraderApiConfig,
        feed: Arc<dyn PriceSource + Send + Sync>,
    ) -> Result<Self, GatewayError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &trader.api_key {
            let value = HeaderValue::from_str(api_key)
                .map_err(|e| GatewayError::Other(format!("invalid api key header: {}", e)))?;
            headers.insert("X-API-KEY", value);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: rest_endpoint.trim_end_matches('/').to_string(),
            wallet_address: trader.wallet_address,
            slippage_pct: trader.slippage_pct,
            feed,
        })
    }

    async fn error_from_response(resp: reqwest::Response, what: &str) -> GatewayError {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorReply>(&text)
            .map(|reply| reply.error)
            .unwrap_or(text);
        GatewayError::Rejected(format!("{} failed with {}: {}", what, status, detail))
    }
}

#[async_trait]
impl ExchangeGateway for RestGateway {
    async fn get_price(&self, pair: &str) -> Result<Decimal, GatewayError> {
        self.feed.latest_price(pair).await
    }

    async fn place_limit_order(&self, req: &OrderRequest) -> Result<OrderTicket, GatewayError> {
        let url = format!("{}/v1/orders", self.base_url);
        let body = OpenOrderBody {
            trader: &self.wallet_address,
            pair_index: req.pair_index,
            is_long: req.side == OrderSide::Long,
            collateral: req.collateral,
            leverage: req.leverage,
            open_price: req.limit_price,
            tp: req.tp_price,
            sl: req.sl_price,
            order_type: req.kind,
            slippage_pct: self.slippage_pct,
        };
        let resp = self.http.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp, "order submission").await);
        }
        let reply: OpenOrderReply = resp
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        log::info!(
            "[ORDER] {} {} at ${}: {}",
            req.side,
            req.kind,
            req.limit_price,
            reply.tx_hash
        );
        Ok(OrderTicket {
            order_index: reply.order_index,
            tx_hash: reply.tx_hash,
        })
    }

    async fn cancel_order(&self, pair_index: u16, order_index: u32) -> Result<(), GatewayError> {
        let url = format!("{}/v1/orders/{}/{}", self.base_url, pair_index, order_index);
        let resp = self
            .http
            .delete(&url)
            .query(&[("trader", self.wallet_address.as_str())])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            log::debug!("[CANCEL] order {} already gone", order_index);
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp, "order cancellation").await);
        }
        log::info!("[CANCEL] order {} cancelled", order_index);
        Ok(())
    }

    async fn get_open_trades(&self) -> Result<OpenTrades, GatewayError> {
        let url = format!("{}/v1/trades", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("trader", self.wallet_address.as_str())])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp, "trade snapshot").await);
        }
        resp.json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }

    async fn ensure_allowance(&self, amount: Decimal) -> Result<(), GatewayError> {
        let url = format!("{}/v1/allowance", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("owner", self.wallet_address.as_str())])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp, "allowance check").await);
        }
        let reply: AllowanceReply = resp
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        if reply.allowance >= amount {
            log::info!(
                "[APPROVE] USDC allowance {} covers {}",
                reply.allowance,
                amount
            );
            return Ok(());
        }

        let url = format!("{}/v1/allowance/approve", self.base_url);
        let body = ApproveBody {
            owner: &self.wallet_address,
            amount,
        };
        let resp = self.http.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp, "allowance approval").await);
        }
        let reply: ApproveReply = resp
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        log::info!("[APPROVE] approved {} USDC: {}", amount, reply.tx_hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct NoFeed;

    #[async_trait]
    impl PriceSource for NoFeed {
        async fn latest_price(&self, _pair: &str) -> Result<Decimal, GatewayError> {
            Ok(Decimal::ZERO)
        }
    }

    fn trader() -> TraderApiConfig {
        TraderApiConfig {
            wallet_address: "0xabc".to_string(),
            api_key: None,
            slippage_pct: 1.0,
        }
    }

    #[test]
    fn create_normalizes_endpoint() {
        let gateway =
            RestGateway::create("https://api.example.com/", trader(), Arc::new(NoFeed)).unwrap();
        assert_eq!(gateway.base_url, "https://api.example.com");
    }

    #[test]
    fn order_body_serializes_wire_fields() {
        let body = OpenOrderBody {
            trader: "0xabc",
            pair_index: 1,
            is_long: true,
            collateral: dec!(10),
            leverage: 75,
            open_price: dec!(49750),
            tp: dec!(50280.67),
            sl: dec!(49219.33),
            order_type: OrderKind::StopLimit,
            slippage_pct: 1.0,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["is_long"], serde_json::json!(true));
        assert_eq!(json["order_type"], "STOP_LIMIT");
        assert_eq!(json["pair_index"], serde_json::json!(1));
    }
}
