//! Collaborator interfaces: price source and order gateway, plus the
//! paper venue and HTTP bridge implementations.

mod http_gateway;
mod paper;
mod types;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

pub use http_gateway::HttpGateway;
pub use paper::PaperVenue;
pub use types::*;

/// Failures reported by the price source or order gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("price unavailable for {0}")]
    PriceUnavailable(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    /// Failures worth retrying on the next tick rather than reporting as a refusal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_) | GatewayError::Transport(_) | GatewayError::PriceUnavailable(_)
        )
    }
}

/// Result of a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Already filled, cancelled or expired on the venue
    AlreadyGone,
}

/// Current quotes on demand.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn get_price(&self, symbol: &str, side: PriceSide) -> Result<Decimal, GatewayError>;
}

/// Order placement and position management on a trading venue.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<Ticket, GatewayError>;

    async fn modify_stop_loss(&self, ticket: Ticket, stop_loss: Decimal) -> Result<(), GatewayError>;

    async fn cancel_order(&self, ticket: Ticket) -> Result<CancelOutcome, GatewayError>;

    async fn list_open_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError>;

    async fn list_pending_orders(&self) -> Result<Vec<OrderSnapshot>, GatewayError>;

    /// Exit price of a closed position, if the venue keeps deal history.
    async fn closing_price(&self, _ticket: Ticket) -> Result<Option<Decimal>, GatewayError> {
        Ok(None)
    }
}

/// Bound a collaborator call; an elapsed deadline becomes [`GatewayError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(limit)),
    }
}
