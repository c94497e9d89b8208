//! In-memory paper venue for dry runs and tests.
//!
//! Simulates resting-order fills when price reaches the entry, stop-loss and
//! take-profit closures, stop validation and deal history. Fault injection
//! hooks let tests script rejections, transport failures and stalled feeds.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::Direction;

use super::types::*;
use super::{CancelOutcome, GatewayError, OrderGateway, PriceSource};

#[derive(Debug, Clone, Copy)]
struct Quote {
    bid: Decimal,
    ask: Decimal,
}

impl Quote {
    fn side(&self, side: PriceSide) -> Decimal {
        match side {
            PriceSide::Bid => self.bid,
            PriceSide::Ask => self.ask,
        }
    }
}

#[derive(Default)]
struct VenueState {
    quotes: HashMap<String, Quote>,
    last_ticket: Ticket,
    orders: BTreeMap<Ticket, OrderSnapshot>,
    positions: BTreeMap<Ticket, PositionSnapshot>,
    deals: HashMap<Ticket, Decimal>,
    placed: Vec<OrderRequest>,
    stop_history: HashMap<Ticket, Vec<Decimal>>,
    cancelled: Vec<Ticket>,
    stalled: HashSet<String>,
    reject_orders: usize,
    reject_modifications: usize,
    fail_cancels: usize,
}

impl VenueState {
    fn next_ticket(&mut self) -> Ticket {
        self.last_ticket += 1;
        self.last_ticket
    }

    fn quote(&self, symbol: &str) -> Option<Quote> {
        self.quotes.get(symbol).copied()
    }

    /// Fill resting orders and close positions whose stops or targets were reached.
    fn settle(&mut self, symbol: &str) {
        let Some(quote) = self.quote(symbol) else {
            return;
        };

        let filled: Vec<Ticket> = self
            .orders
            .values()
            .filter(|o| o.symbol == symbol)
            .filter(|o| o.direction.reached(quote.side(o.direction.entry_side()), o.entry_price))
            .map(|o| o.ticket)
            .collect();
        for ticket in filled {
            if let Some(order) = self.orders.remove(&ticket) {
                debug!(ticket, price = %order.entry_price, "Paper order filled");
                self.positions.insert(
                    ticket,
                    PositionSnapshot {
                        ticket,
                        symbol: order.symbol,
                        direction: order.direction,
                        volume: order.volume,
                        open_price: order.entry_price,
                        stop_loss: order.stop_loss,
                        take_profit: order.take_profit,
                        current_price: quote.side(order.direction.exit_side()),
                        client_tag: order.client_tag,
                    },
                );
            }
        }

        let mut closed = Vec::new();
        for position in self.positions.values_mut().filter(|p| p.symbol == symbol) {
            let price = quote.side(position.direction.exit_side());
            position.current_price = price;
            let stopped = position
                .stop_loss
                .is_some_and(|sl| !position.direction.improves(price, sl));
            let target = position
                .take_profit
                .is_some_and(|tp| position.direction.reached(price, tp));
            if stopped || target {
                closed.push((position.ticket, price));
            }
        }
        for (ticket, price) in closed {
            debug!(ticket, price = %price, "Paper position closed");
            self.positions.remove(&ticket);
            self.deals.insert(ticket, price);
        }
    }
}

/// Stops must sit behind `price` and targets ahead of it.
fn stops_valid(
    direction: Direction,
    price: Decimal,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
) -> bool {
    stop_loss.map_or(true, |sl| direction.improves(price, sl))
        && take_profit.map_or(true, |tp| direction.improves(tp, price))
}

/// Simulated venue implementing both [`PriceSource`] and [`OrderGateway`].
#[derive(Default)]
pub struct PaperVenue {
    state: Mutex<VenueState>,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bid/ask for a symbol and settle fills and closures at the new quote.
    pub async fn set_quote(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let mut state = self.state.lock().await;
        state.quotes.insert(symbol.to_string(), Quote { bid, ask });
        state.settle(symbol);
    }

    /// Zero-spread quote.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.set_quote(symbol, price, price).await;
    }

    /// Fill a resting order at its entry price regardless of the quote.
    pub async fn fill_order(&self, ticket: Ticket) -> bool {
        let mut state = self.state.lock().await;
        let Some(order) = state.orders.remove(&ticket) else {
            return false;
        };
        let current_price = state
            .quote(&order.symbol)
            .map_or(order.entry_price, |q| q.side(order.direction.exit_side()));
        state.positions.insert(
            ticket,
            PositionSnapshot {
                ticket,
                symbol: order.symbol,
                direction: order.direction,
                volume: order.volume,
                open_price: order.entry_price,
                stop_loss: order.stop_loss,
                take_profit: order.take_profit,
                current_price,
                client_tag: order.client_tag,
            },
        );
        true
    }

    /// Close a position as if by manual action.
    pub async fn close_position(&self, ticket: Ticket, price: Decimal) -> bool {
        let mut state = self.state.lock().await;
        match state.positions.remove(&ticket) {
            Some(_) => {
                state.deals.insert(ticket, price);
                true
            }
            None => false,
        }
    }

    /// Remove a resting order as if it expired on the venue.
    pub async fn expire_order(&self, ticket: Ticket) -> bool {
        self.state.lock().await.orders.remove(&ticket).is_some()
    }

    pub async fn reject_next_orders(&self, count: usize) {
        self.state.lock().await.reject_orders = count;
    }

    pub async fn reject_next_modifications(&self, count: usize) {
        self.state.lock().await.reject_modifications = count;
    }

    pub async fn fail_next_cancels(&self, count: usize) {
        self.state.lock().await.fail_cancels = count;
    }

    /// Make price requests for `symbol` hang until the caller gives up.
    pub async fn stall_prices(&self, symbol: &str) {
        self.state.lock().await.stalled.insert(symbol.to_string());
    }

    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().await.placed.clone()
    }

    pub async fn stop_history(&self, ticket: Ticket) -> Vec<Decimal> {
        self.state
            .lock()
            .await
            .stop_history
            .get(&ticket)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn cancelled_orders(&self) -> Vec<Ticket> {
        self.state.lock().await.cancelled.clone()
    }

    pub async fn position(&self, ticket: Ticket) -> Option<PositionSnapshot> {
        self.state.lock().await.positions.get(&ticket).cloned()
    }
}

#[async_trait]
impl PriceSource for PaperVenue {
    async fn get_price(&self, symbol: &str, side: PriceSide) -> Result<Decimal, GatewayError> {
        let (stalled, quote) = {
            let state = self.state.lock().await;
            (state.stalled.contains(symbol), state.quote(symbol))
        };
        if stalled {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        quote
            .map(|q| q.side(side))
            .ok_or_else(|| GatewayError::PriceUnavailable(symbol.to_string()))
    }
}

#[async_trait]
impl OrderGateway for PaperVenue {
    async fn place_order(&self, request: &OrderRequest) -> Result<Ticket, GatewayError> {
        let mut state = self.state.lock().await;
        if state.reject_orders > 0 {
            state.reject_orders -= 1;
            return Err(GatewayError::Rejected("not enough money".to_string()));
        }
        let quote = state
            .quote(&request.symbol)
            .ok_or_else(|| GatewayError::Rejected(format!("symbol {} disabled", request.symbol)))?;

        let direction = request.direction;
        let ticket = match request.kind {
            OrderKind::Market => {
                let fill = quote.side(direction.entry_side());
                let mark = quote.side(direction.exit_side());
                if !stops_valid(direction, mark, request.stop_loss, request.take_profit) {
                    return Err(GatewayError::Rejected("invalid stops".to_string()));
                }
                let ticket = state.next_ticket();
                state.positions.insert(
                    ticket,
                    PositionSnapshot {
                        ticket,
                        symbol: request.symbol.clone(),
                        direction,
                        volume: request.volume,
                        open_price: fill,
                        stop_loss: request.stop_loss,
                        take_profit: request.take_profit,
                        current_price: mark,
                        client_tag: Some(request.client_tag.clone()),
                    },
                );
                ticket
            }
            OrderKind::Limit => {
                if !stops_valid(direction, request.price, request.stop_loss, request.take_profit) {
                    return Err(GatewayError::Rejected("invalid stops".to_string()));
                }
                let ticket = state.next_ticket();
                state.orders.insert(
                    ticket,
                    OrderSnapshot {
                        ticket,
                        symbol: request.symbol.clone(),
                        direction,
                        volume: request.volume,
                        entry_price: request.price,
                        stop_loss: request.stop_loss,
                        take_profit: request.take_profit,
                        client_tag: Some(request.client_tag.clone()),
                    },
                );
                ticket
            }
        };
        state.placed.push(request.clone());
        Ok(ticket)
    }

    async fn modify_stop_loss(&self, ticket: Ticket, stop_loss: Decimal) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        if state.reject_modifications > 0 {
            state.reject_modifications -= 1;
            return Err(GatewayError::Rejected("invalid stops".to_string()));
        }
        let position = state
            .positions
            .get_mut(&ticket)
            .ok_or_else(|| GatewayError::Rejected(format!("position {ticket} not found")))?;
        if !position.direction.improves(position.current_price, stop_loss) {
            return Err(GatewayError::Rejected("invalid stops".to_string()));
        }
        position.stop_loss = Some(stop_loss);
        state.stop_history.entry(ticket).or_default().push(stop_loss);
        Ok(())
    }

    async fn cancel_order(&self, ticket: Ticket) -> Result<CancelOutcome, GatewayError> {
        let mut state = self.state.lock().await;
        if state.fail_cancels > 0 {
            state.fail_cancels -= 1;
            return Err(GatewayError::Transport("connection reset".to_string()));
        }
        match state.orders.remove(&ticket) {
            Some(_) => {
                state.cancelled.push(ticket);
                Ok(CancelOutcome::Cancelled)
            }
            None => Ok(CancelOutcome::AlreadyGone),
        }
    }

    async fn list_open_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        Ok(self.state.lock().await.positions.values().cloned().collect())
    }

    async fn list_pending_orders(&self) -> Result<Vec<OrderSnapshot>, GatewayError> {
        Ok(self.state.lock().await.orders.values().cloned().collect())
    }

    async fn closing_price(&self, ticket: Ticket) -> Result<Option<Decimal>, GatewayError> {
        Ok(self.state.lock().await.deals.get(&ticket).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limit(direction: Direction, price: Decimal, sl: Decimal, tp: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: "XAUUSD".to_string(),
            direction,
            kind: OrderKind::Limit,
            price,
            volume: dec!(0.01),
            stop_loss: Some(sl),
            take_profit: Some(tp),
            client_tag: "abc_leg1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_resting_order_fills_then_hits_target() {
        let venue = PaperVenue::new();
        venue.set_price("XAUUSD", dec!(2645)).await;

        let ticket = venue
            .place_order(&limit(Direction::Buy, dec!(2650), dec!(2640), dec!(2660)))
            .await
            .unwrap();
        assert_eq!(venue.list_pending_orders().await.unwrap().len(), 1);

        venue.set_price("XAUUSD", dec!(2650.2)).await;
        let positions = venue.list_open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticket, ticket);
        assert_eq!(positions[0].open_price, dec!(2650));

        venue.set_price("XAUUSD", dec!(2661)).await;
        assert!(venue.list_open_positions().await.unwrap().is_empty());
        assert_eq!(venue.closing_price(ticket).await.unwrap(), Some(dec!(2661)));
    }

    #[tokio::test]
    async fn test_sell_market_order_stopped_out() {
        let venue = PaperVenue::new();
        venue.set_quote("EURUSD", dec!(1.0840), dec!(1.0841)).await;

        let request = OrderRequest {
            symbol: "EURUSD".to_string(),
            kind: OrderKind::Market,
            ..limit(Direction::Sell, dec!(1.0840), dec!(1.0870), dec!(1.0800))
        };
        let ticket = venue.place_order(&request).await.unwrap();
        let position = venue.position(ticket).await.unwrap();
        assert_eq!(position.open_price, dec!(1.0840));
        assert_eq!(position.current_price, dec!(1.0841));

        venue.set_quote("EURUSD", dec!(1.0869), dec!(1.0870)).await;
        assert!(venue.position(ticket).await.is_none());
        assert_eq!(venue.closing_price(ticket).await.unwrap(), Some(dec!(1.0870)));
    }

    #[tokio::test]
    async fn test_modify_rejects_stop_through_price() {
        let venue = PaperVenue::new();
        venue.set_price("XAUUSD", dec!(2655)).await;
        let request = OrderRequest {
            kind: OrderKind::Market,
            ..limit(Direction::Buy, dec!(2655), dec!(2640), dec!(2670))
        };
        let ticket = venue.place_order(&request).await.unwrap();

        let err = venue.modify_stop_loss(ticket, dec!(2656)).await.unwrap_err();
        assert_eq!(err, GatewayError::Rejected("invalid stops".to_string()));

        venue.modify_stop_loss(ticket, dec!(2650)).await.unwrap();
        assert_eq!(venue.stop_history(ticket).await, vec![dec!(2650)]);
    }

    #[tokio::test]
    async fn test_cancel_reports_already_gone() {
        let venue = PaperVenue::new();
        venue.set_price("XAUUSD", dec!(2645)).await;
        let ticket = venue
            .place_order(&limit(Direction::Buy, dec!(2650), dec!(2640), dec!(2660)))
            .await
            .unwrap();

        assert_eq!(venue.cancel_order(ticket).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(venue.cancel_order(ticket).await.unwrap(), CancelOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn test_unknown_symbol() {
        let venue = PaperVenue::new();
        let err = venue.get_price("BTCUSD", PriceSide::Bid).await.unwrap_err();
        assert!(matches!(err, GatewayError::PriceUnavailable(_)));
    }
}
