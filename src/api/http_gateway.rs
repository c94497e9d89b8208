//! REST bridge client for a broker terminal.
//!
//! The bridge is a thin JSON adapter in front of the venue; this client maps
//! its responses onto [`GatewayError`] so rejections and transport failures
//! stay distinguishable.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::*;
use super::{CancelOutcome, GatewayError, OrderGateway, PriceSource};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    bid: Decimal,
    ask: Decimal,
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    ticket: Ticket,
}

#[derive(Debug, Serialize)]
struct StopLossRequest {
    stop_loss: Decimal,
}

#[derive(Debug, Deserialize)]
struct DealResponse {
    #[serde(default)]
    close_price: Option<Decimal>,
}

/// Client for the HTTP order bridge.
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, GatewayError> {
        request.send().await.map_err(transport)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let url = self.url(path);
        debug!(url = %url, "Bridge GET");
        let response = self.send(self.client.get(&url)).await?;
        decode(checked(response).await?).await
    }
}

fn transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(DEFAULT_TIMEOUT)
    } else {
        GatewayError::Transport(err.to_string())
    }
}

/// Client errors are venue rejections; server errors are transport failures.
async fn checked(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        Err(GatewayError::Rejected(format!("{status}: {body}")))
    } else {
        Err(GatewayError::Transport(format!("{status}: {body}")))
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Transport(format!("malformed bridge response: {e}")))
}

#[async_trait]
impl PriceSource for HttpGateway {
    async fn get_price(&self, symbol: &str, side: PriceSide) -> Result<Decimal, GatewayError> {
        let url = self.url(&format!("/price/{symbol}"));
        let response = self.send(self.client.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::PriceUnavailable(symbol.to_string()));
        }
        let quote: QuoteResponse = decode(checked(response).await?).await?;
        Ok(match side {
            PriceSide::Bid => quote.bid,
            PriceSide::Ask => quote.ask,
        })
    }
}

#[async_trait]
impl OrderGateway for HttpGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<Ticket, GatewayError> {
        let response = self
            .send(self.client.post(self.url("/orders")).json(request))
            .await?;
        let placed: TicketResponse = decode(checked(response).await?).await?;
        Ok(placed.ticket)
    }

    async fn modify_stop_loss(&self, ticket: Ticket, stop_loss: Decimal) -> Result<(), GatewayError> {
        let url = self.url(&format!("/positions/{ticket}/stop-loss"));
        let response = self
            .send(self.client.post(&url).json(&StopLossRequest { stop_loss }))
            .await?;
        checked(response).await?;
        Ok(())
    }

    async fn cancel_order(&self, ticket: Ticket) -> Result<CancelOutcome, GatewayError> {
        let url = self.url(&format!("/orders/{ticket}"));
        let response = self.send(self.client.delete(&url)).await?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Ok(CancelOutcome::AlreadyGone);
        }
        checked(response).await?;
        Ok(CancelOutcome::Cancelled)
    }

    async fn list_open_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        self.get_json("/positions").await
    }

    async fn list_pending_orders(&self) -> Result<Vec<OrderSnapshot>, GatewayError> {
        self.get_json("/orders").await
    }

    async fn closing_price(&self, ticket: Ticket) -> Result<Option<Decimal>, GatewayError> {
        let url = self.url(&format!("/deals/{ticket}"));
        let response = self.send(self.client.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let deal: DealResponse = decode(checked(response).await?).await?;
        Ok(deal.close_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let gateway = HttpGateway::new("http://127.0.0.1:8080/").unwrap();
        assert_eq!(gateway.url("/orders"), "http://127.0.0.1:8080/orders");
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_transient() {
        // Port 9 (discard) is not expected to serve HTTP locally.
        let gateway = HttpGateway::new("http://127.0.0.1:9").unwrap();
        let err = gateway.list_open_positions().await.unwrap_err();
        assert!(err.is_transient());
    }
}
