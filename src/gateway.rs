//! Exchange-facing order gateway: the trait the cycle engine drives, plus the
//! order and position types shared by the live REST implementation and the
//! paper connector.

use std::fmt;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http error: {0}")]
    Http(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("price unavailable: {0}")]
    PriceUnavailable(String),
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Http(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Long,
    Short,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Long => write!(f, "LONG"),
            OrderSide::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Limit,
    StopLimit,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Limit => write!(f, "LIMIT"),
            OrderKind::StopLimit => write!(f, "STOP_LIMIT"),
        }
    }
}

/// One leg of a cycle, ready for submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub pair: String,
    pub pair_index: u16,
    pub side: OrderSide,
    pub collateral: Decimal,
    pub leverage: u32,
    pub limit_price: Decimal,
    pub tp_price: Decimal,
    pub sl_price: Decimal,
    pub kind: OrderKind,
}

/// Venue acknowledgement of a submitted order.
#[derive(Debug, Clone)]
pub struct OrderTicket {
    pub order_index: u32,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub pair_index: u16,
    pub order_index: u32,
    pub side: OrderSide,
    pub limit_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub pair_index: u16,
    pub trade_index: u32,
    pub side: OrderSide,
    pub open_price: Decimal,
    pub collateral: Decimal,
    pub leverage: u32,
    pub tp_price: Decimal,
    pub sl_price: Decimal,
}

/// Snapshot of everything the account holds at the venue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenTrades {
    pub positions: Vec<OpenPosition>,
    pub pending: Vec<PendingOrder>,
}

/// Venue operations the cycle engine needs. Implemented by the live REST
/// gateway and by the in-process paper connector for dry runs.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Latest mark price for `pair`, zero when the feed has nothing.
    async fn get_price(&self, pair: &str) -> Result<Decimal, GatewayError>;

    /// Submit one leg. The ticket's `order_index` identifies the resting
    /// order for later cancellation.
    async fn place_limit_order(&self, req: &OrderRequest) -> Result<OrderTicket, GatewayError>;

    /// Cancel a resting order. Cancelling an order that no longer exists is
    /// not an error.
    async fn cancel_order(&self, pair_index: u16, order_index: u32) -> Result<(), GatewayError>;

    /// Current open positions and still-pending orders.
    async fn get_open_trades(&self) -> Result<OpenTrades, GatewayError>;

    /// Make sure the venue may draw at least `amount` of margin currency.
    async fn ensure_allowance(&self, amount: Decimal) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn sides_and_kinds_display_as_wire_names() {
        assert_eq!(OrderSide::Long.to_string(), "LONG");
        assert_eq!(OrderSide::Short.to_string(), "SHORT");
        assert_eq!(OrderKind::Limit.to_string(), "LIMIT");
        assert_eq!(OrderKind::StopLimit.to_string(), "STOP_LIMIT");
    }

    #[test]
    fn sides_and_kinds_serialize_as_wire_names() {
        assert_eq!(serde_json::to_string(&OrderSide::Long).unwrap(), "\"LONG\"");
        assert_eq!(
            serde_json::to_string(&OrderKind::StopLimit).unwrap(),
            "\"STOP_LIMIT\""
        );
    }

    #[test]
    fn gateway_errors_format_with_context() {
        let e = GatewayError::Rejected("insufficient margin".to_string());
        assert_eq!(e.to_string(), "order rejected: insufficient margin");
        let e = GatewayError::PriceUnavailable("BTC/USD".to_string());
        assert_eq!(e.to_string(), "price unavailable: BTC/USD");
    }

    #[test]
    fn open_trades_snapshot_round_trips_through_json() {
        let snapshot = OpenTrades {
            positions: vec![OpenPosition {
                pair_index: 1,
                trade_index: 3,
                side: OrderSide::Long,
                open_price: dec!(49750),
                collateral: dec!(10),
                leverage: 75,
                tp_price: dec!(50280.67),
                sl_price: dec!(49219.33),
            }],
            pending: vec![PendingOrder {
                pair_index: 1,
                order_index: 4,
                side: OrderSide::Short,
                limit_price: dec!(49750),
            }],
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: OpenTrades = serde_json::from_str(&json).unwrap();
        assert_eq!(back.positions.len(), 1);
        assert_eq!(back.positions[0].side, OrderSide::Long);
        assert_eq!(back.pending[0].limit_price, dec!(49750));
    }
}
