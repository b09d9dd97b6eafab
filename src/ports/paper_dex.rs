use std::env;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::feed::PriceSource;
use crate::gateway::{
    ExchangeGateway, GatewayError, OpenPosition, OpenTrades, OrderRequest, OrderSide, OrderTicket,
    PendingOrder,
};

lazy_static! {
    static ref FILL_PROBABILITY_IN_EMULATION: f64 = {
        match env::var("FILL_PROBABILITY_IN_EMULATION") {
            Ok(val) => val.parse::<f64>().unwrap_or(1.0),
            Err(_) => 1.0,
        }
    };
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_index: u32,
    request: OrderRequest,
    // Which way the mark must move to reach the entry, captured at placement
    fills_on_rise: bool,
}

impl PaperOrder {
    fn crossed(&self, price: Decimal) -> bool {
        if self.fills_on_rise {
            price >= self.request.limit_price
        } else {
            price <= self.request.limit_price
        }
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    last_price: Decimal,
    symbol: String,
    pending: Vec<PaperOrder>,
    positions: Vec<OpenPosition>,
}

/// In-process stand-in for the live venue. Orders rest in a local book and
/// fill when the feed price crosses their entry; filled positions close when
/// the price reaches their take-profit or stop-loss.
pub struct PaperConnector {
    source: Arc<dyn PriceSource + Send + Sync>,
    book: Mutex<PaperBook>,
    next_index: AtomicU32,
}

impl PaperConnector {
    pub fn new(source: Arc<dyn PriceSource + Send + Sync>) -> Self {
        Self {
            source,
            book: Mutex::new(PaperBook::default()),
            next_index: AtomicU32::new(0),
        }
    }

    fn advance(book: &mut PaperBook, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        book.last_price = price;

        if book.pending.iter().any(|order| order.crossed(price))
            && rand::random::<f64>() < *FILL_PROBABILITY_IN_EMULATION
        {
            let pending = std::mem::take(&mut book.pending);
            let (filled, resting): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|order| order.crossed(price));
            book.pending = resting;
            for order in filled {
                log::info!(
                    "[PAPER] filled {} {} {} at {}",
                    order.request.side,
                    order.request.kind,
                    order.request.pair,
                    order.request.limit_price
                );
                book.positions.push(OpenPosition {
                    pair_index: order.request.pair_index,
                    trade_index: order.order_index,
                    side: order.request.side,
                    open_price: order.request.limit_price,
                    collateral: order.request.collateral,
                    leverage: order.request.leverage,
                    tp_price: order.request.tp_price,
                    sl_price: order.request.sl_price,
                });
            }
        }

        book.positions.retain(|position| {
            let closed = match position.side {
                OrderSide::Long => price >= position.tp_price || price <= position.sl_price,
                OrderSide::Short => price <= position.tp_price || price >= position.sl_price,
            };
            if closed {
                log::info!(
                    "[PAPER] closed {} position (entry {}) at {}",
                    position.side,
                    position.open_price,
                    price
                );
            }
            !closed
        });
    }
}

#[async_trait]
impl ExchangeGateway for PaperConnector {
    async fn get_price(&self, pair: &str) -> Result<Decimal, GatewayError> {
        let price = self.source.latest_price(pair).await?;
        let mut book = self.book.lock().await;
        book.symbol = pair.to_string();
        Self::advance(&mut book, price);
        Ok(price)
    }

    async fn place_limit_order(&self, req: &OrderRequest) -> Result<OrderTicket, GatewayError> {
        let mut book = self.book.lock().await;
        let mut mark = book.last_price;
        if mark <= Decimal::ZERO {
            mark = self.source.latest_price(&req.pair).await?;
        }
        if mark <= Decimal::ZERO {
            return Err(GatewayError::PriceUnavailable(req.pair.clone()));
        }
        book.symbol = req.pair.clone();
        book.last_price = mark;

        let order_index = self.next_index.fetch_add(1, AtomicOrdering::SeqCst);
        log::info!(
            "[PAPER] resting {} {} {} at {} (mark {})",
            req.side,
            req.kind,
            req.pair,
            req.limit_price,
            mark
        );
        book.pending.push(PaperOrder {
            order_index,
            request: req.clone(),
            fills_on_rise: mark < req.limit_price,
        });

        Ok(OrderTicket {
            order_index,
            tx_hash: "DRY_RUN".to_string(),
        })
    }

    async fn cancel_order(&self, pair_index: u16, order_index: u32) -> Result<(), GatewayError> {
        let mut book = self.book.lock().await;
        let before = book.pending.len();
        book.pending.retain(|order| {
            !(order.request.pair_index == pair_index && order.order_index == order_index)
        });
        if book.pending.len() < before {
            log::info!("[PAPER] cancelled order {}", order_index);
        } else {
            log::debug!("[PAPER] order {} already gone", order_index);
        }
        Ok(())
    }

    async fn get_open_trades(&self) -> Result<OpenTrades, GatewayError> {
        let mut book = self.book.lock().await;
        if !book.symbol.is_empty() {
            let symbol = book.symbol.clone();
            match self.source.latest_price(&symbol).await {
                Ok(price) => Self::advance(&mut book, price),
                Err(e) => log::debug!("[PAPER] price refresh failed: {}", e),
            }
        }
        Ok(OpenTrades {
            positions: book.positions.clone(),
            pending: book
                .pending
                .iter()
                .map(|order| PendingOrder {
                    pair_index: order.request.pair_index,
                    order_index: order.order_index,
                    side: order.request.side,
                    limit_price: order.request.limit_price,
                })
                .collect(),
        })
    }

    async fn ensure_allowance(&self, amount: Decimal) -> Result<(), GatewayError> {
        log::debug!("[PAPER] allowance check skipped for {}", amount);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::OrderKind;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    struct StubFeed {
        price: StdMutex<Decimal>,
    }

    impl StubFeed {
        fn new(price: Decimal) -> Arc<Self> {
            Arc::new(Self {
                price: StdMutex::new(price),
            })
        }

        fn set(&self, price: Decimal) {
            *self.price.lock().unwrap() = price;
        }
    }

    #[async_trait]
    impl PriceSource for StubFeed {
        async fn latest_price(&self, _pair: &str) -> Result<Decimal, GatewayError> {
            Ok(*self.price.lock().unwrap())
        }
    }

    fn leg(side: OrderSide, kind: OrderKind, limit: Decimal, tp: Decimal, sl: Decimal) -> OrderRequest {
        OrderRequest {
            pair: "BTC/USD".to_string(),
            pair_index: 1,
            side,
            collateral: dec!(10),
            leverage: 75,
            limit_price: limit,
            tp_price: tp,
            sl_price: sl,
            kind,
        }
    }

    #[tokio::test]
    async fn fills_both_legs_when_price_drops_to_entry() {
        let feed = StubFeed::new(dec!(50000));
        let connector = PaperConnector::new(feed.clone());

        connector.get_price("BTC/USD").await.unwrap();
        connector
            .place_limit_order(&leg(
                OrderSide::Long,
                OrderKind::Limit,
                dec!(49750),
                dec!(50280.67),
                dec!(49219.33),
            ))
            .await
            .unwrap();
        connector
            .place_limit_order(&leg(
                OrderSide::Short,
                OrderKind::StopLimit,
                dec!(49750),
                dec!(49219.33),
                dec!(50280.67),
            ))
            .await
            .unwrap();

        feed.set(dec!(49700));
        let trades = connector.get_open_trades().await.unwrap();
        assert_eq!(trades.pending.len(), 0);
        assert_eq!(trades.positions.len(), 2);
        assert!(trades
            .positions
            .iter()
            .all(|p| p.open_price == dec!(49750)));
    }

    #[tokio::test]
    async fn above_market_orders_arm_on_rise() {
        let feed = StubFeed::new(dec!(50000));
        let connector = PaperConnector::new(feed.clone());

        connector.get_price("BTC/USD").await.unwrap();
        connector
            .place_limit_order(&leg(
                OrderSide::Long,
                OrderKind::StopLimit,
                dec!(50250),
                dec!(50786),
                dec!(49714),
            ))
            .await
            .unwrap();
        connector
            .place_limit_order(&leg(
                OrderSide::Short,
                OrderKind::Limit,
                dec!(50250),
                dec!(49714),
                dec!(50786),
            ))
            .await
            .unwrap();

        feed.set(dec!(49800));
        let trades = connector.get_open_trades().await.unwrap();
        assert_eq!(trades.pending.len(), 2);
        assert_eq!(trades.positions.len(), 0);

        feed.set(dec!(50300));
        let trades = connector.get_open_trades().await.unwrap();
        assert_eq!(trades.pending.len(), 0);
        assert_eq!(trades.positions.len(), 2);
    }

    #[tokio::test]
    async fn closes_leg_when_take_profit_crossed() {
        let feed = StubFeed::new(dec!(50000));
        let connector = PaperConnector::new(feed.clone());

        connector.get_price("BTC/USD").await.unwrap();
        connector
            .place_limit_order(&leg(
                OrderSide::Long,
                OrderKind::Limit,
                dec!(49750),
                dec!(50280.67),
                dec!(49219.33),
            ))
            .await
            .unwrap();
        // Short with a wide stop so only the long leg exits on the rally
        connector
            .place_limit_order(&leg(
                OrderSide::Short,
                OrderKind::StopLimit,
                dec!(49750),
                dec!(49219.33),
                dec!(50500),
            ))
            .await
            .unwrap();

        feed.set(dec!(49700));
        connector.get_open_trades().await.unwrap();

        feed.set(dec!(50300));
        let trades = connector.get_open_trades().await.unwrap();
        assert_eq!(trades.positions.len(), 1);
        assert_eq!(trades.positions[0].side, OrderSide::Short);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let feed = StubFeed::new(dec!(50000));
        let connector = PaperConnector::new(feed.clone());

        connector.get_price("BTC/USD").await.unwrap();
        let ticket = connector
            .place_limit_order(&leg(
                OrderSide::Long,
                OrderKind::Limit,
                dec!(49750),
                dec!(50280.67),
                dec!(49219.33),
            ))
            .await
            .unwrap();

        connector.cancel_order(1, ticket.order_index).await.unwrap();
        let trades = connector.get_open_trades().await.unwrap();
        assert!(trades.pending.is_empty());

        // Second cancel of the same order is a no-op
        connector.cancel_order(1, ticket.order_index).await.unwrap();
    }

    #[tokio::test]
    async fn placing_without_any_price_is_rejected() {
        let feed = StubFeed::new(Decimal::ZERO);
        let connector = PaperConnector::new(feed);

        let err = connector
            .place_limit_order(&leg(
                OrderSide::Long,
                OrderKind::Limit,
                dec!(49750),
                dec!(50280.67),
                dec!(49219.33),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PriceUnavailable(_)));
    }
}
