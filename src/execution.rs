// =============================================================================
// ORDER EXECUTION
// Exchange adapter behind a trait so the engine runs identically in
// dry-run (paper fills) and live mode. The live client retries on
// server errors and rate limiting with exponential backoff; 4xx auth
// failures are surfaced as unrecoverable so the engine suspends
// instead of hammering a dead account.
// =============================================================================

use crate::error::EngineError;
use crate::types::Direction;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;
use tracing::{error, info, warn};

/// Confirmed fill from the exchange.
#[derive(Debug, Clone)]
pub struct Fill {
    pub price: Decimal,
    pub filled_at: DateTime<Utc>,
}

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Latest reference price. Live executors ignore this; the paper
    /// executor fills closes at the last marked price.
    fn mark_price(&self, _price: Decimal) {}

    async fn open(
        &self,
        direction: Direction,
        size: Decimal,
        price: Decimal,
    ) -> Result<Fill, EngineError>;

    async fn close(
        &self,
        position_id: Uuid,
        direction: Direction,
        size: Decimal,
    ) -> Result<Fill, EngineError>;
}

// =============================================================================
// LIVE HTTP EXECUTOR
// =============================================================================

#[derive(Debug, Serialize, Clone)]
enum Side {
    #[serde(rename = "buy")]
    Buy,
    #[serde(rename = "sell")]
    Sell,
}

impl Side {
    fn for_entry(direction: Direction) -> Self {
        match direction {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    fn for_exit(direction: Direction) -> Self {
        match direction {
            Direction::Long => Side::Sell,
            Direction::Short => Side::Buy,
        }
    }
}

#[derive(Debug, Serialize, Clone)]
struct OrderRequest {
    symbol: String,
    side: Side,
    qty: Decimal,
    #[serde(rename = "type")]
    order_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    filled_avg_price: Option<Decimal>,
    filled_at: Option<DateTime<Utc>>,
}

pub struct HttpExecutor {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    symbol: String,
}

impl HttpExecutor {
    pub fn new(base_url: String, api_key: String, api_secret: String, symbol: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            api_secret,
            symbol,
        }
    }

    /// Submit with exponential backoff. Retries 5xx and 429 only;
    /// 401/403 mean the credentials are gone and no retry will help.
    async fn submit_with_retry(
        &self,
        op: &'static str,
        order: OrderRequest,
    ) -> Result<Fill, EngineError> {
        const MAX_RETRIES: u32 = 3;
        const INITIAL_BACKOFF_MS: u64 = 1000;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.submit_once(&order).await {
                Ok(fill) => return Ok(fill),
                Err(SubmitError::Unrecoverable(msg)) => {
                    error!("❌ {} rejected with auth failure: {}", op, msg);
                    return Err(EngineError::ExecutionUnrecoverable(msg));
                }
                Err(SubmitError::Retryable(e)) if attempt >= MAX_RETRIES => {
                    error!("❌ {} failed after {} attempts: {}", op, MAX_RETRIES, e);
                    return Err(EngineError::OrderExecution { op, source: e });
                }
                Err(SubmitError::Retryable(e)) => {
                    let backoff =
                        Duration::from_millis(INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1));
                    warn!(
                        "⚠️ {} attempt {}/{} failed: {}. Retrying in {:?}...",
                        op, attempt, MAX_RETRIES, e, backoff
                    );
                    sleep(backoff).await;
                }
            }
        }
    }

    async fn submit_once(&self, order: &OrderRequest) -> Result<Fill, SubmitError> {
        let url = format!("{}/v2/orders", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
            .json(order)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| SubmitError::Retryable(e.into()))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let text = resp.text().await.unwrap_or_default();
            return Err(SubmitError::Unrecoverable(format!("{}: {}", status, text)));
        }
        if status.is_server_error() || status.as_u16() == 429 {
            let text = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
            return Err(SubmitError::Retryable(anyhow::anyhow!(
                "retryable ({}): {}",
                status,
                text
            )));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SubmitError::Retryable(anyhow::anyhow!(
                "order rejected ({}): {}",
                status,
                text
            )));
        }

        let parsed: OrderResponse = resp
            .json()
            .await
            .map_err(|e| SubmitError::Retryable(e.into()))?;
        let price = parsed.filled_avg_price.ok_or_else(|| {
            SubmitError::Retryable(anyhow::anyhow!(
                "order {} in status {} without fill price",
                parsed.id,
                parsed.status
            ))
        })?;
        info!("✅ order filled: id={} status={}", parsed.id, parsed.status);
        Ok(Fill {
            price,
            filled_at: parsed.filled_at.unwrap_or_else(Utc::now),
        })
    }
}

enum SubmitError {
    Retryable(anyhow::Error),
    Unrecoverable(String),
}

#[async_trait]
impl OrderExecutor for HttpExecutor {
    async fn open(
        &self,
        direction: Direction,
        size: Decimal,
        _price: Decimal,
    ) -> Result<Fill, EngineError> {
        let order = OrderRequest {
            symbol: self.symbol.clone(),
            side: Side::for_entry(direction),
            qty: size,
            order_type: "market",
            client_order_id: None,
        };
        self.submit_with_retry("open", order).await
    }

    async fn close(
        &self,
        position_id: Uuid,
        direction: Direction,
        size: Decimal,
    ) -> Result<Fill, EngineError> {
        let order = OrderRequest {
            symbol: self.symbol.clone(),
            side: Side::for_exit(direction),
            qty: size,
            order_type: "market",
            client_order_id: Some(format!("close-{}", position_id)),
        };
        self.submit_with_retry("close", order).await
    }
}

// =============================================================================
// PAPER EXECUTOR (dry-run)
// =============================================================================

/// Fills every order instantly at the requested reference price. Close
/// fills at the last price it was told about via `mark_price`.
pub struct PaperExecutor {
    last_price: std::sync::Mutex<Decimal>,
}

impl PaperExecutor {
    pub fn new() -> Self {
        Self {
            last_price: std::sync::Mutex::new(Decimal::ZERO),
        }
    }
}

impl Default for PaperExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    fn mark_price(&self, price: Decimal) {
        *self.last_price.lock().expect("price mutex poisoned") = price;
    }

    async fn open(
        &self,
        direction: Direction,
        size: Decimal,
        price: Decimal,
    ) -> Result<Fill, EngineError> {
        self.mark_price(price);
        info!("📝 paper open: {} qty={} @ {}", direction, size, price);
        Ok(Fill {
            price,
            filled_at: Utc::now(),
        })
    }

    async fn close(
        &self,
        position_id: Uuid,
        _direction: Direction,
        _size: Decimal,
    ) -> Result<Fill, EngineError> {
        let price = *self.last_price.lock().expect("price mutex poisoned");
        info!("📝 paper close: {} @ {}", position_id, price);
        Ok(Fill {
            price,
            filled_at: Utc::now(),
        })
    }
}
