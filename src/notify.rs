// =============================================================================
// NOTIFICATIONS
// Fire-and-forget operator alerts. Delivery failures are logged and
// dropped; nothing here may ever stall or fail the trading path.
// =============================================================================

use crate::types::{Direction, ExitReason};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    PositionOpened {
        position_id: Uuid,
        direction: Direction,
        entry_price: Decimal,
    },
    PositionClosed {
        position_id: Uuid,
        exit_reason: ExitReason,
        pnl: Decimal,
    },
    EntryFailed {
        direction: Direction,
        error: String,
    },
    CloseRetriesExhausted {
        position_id: Uuid,
        attempts: u32,
    },
    EngineSuspended {
        reason: String,
        at: DateTime<Utc>,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent);
}

/// Spawn the delivery so the caller returns immediately.
pub fn send_event(notifier: &Arc<dyn Notifier>, event: NotifyEvent) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        notifier.notify(event).await;
    });
}

pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: NotifyEvent) {
        let result = self
            .client
            .post(&self.url)
            .json(&event)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!("🔔 notification delivered");
            }
            Ok(resp) => warn!("🔔 notification rejected: {}", resp.status()),
            Err(e) => warn!("🔔 notification failed: {}", e),
        }
    }
}

/// Used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: NotifyEvent) {}
}
