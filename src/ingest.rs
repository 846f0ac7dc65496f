// =============================================================================
// MARKET SNAPSHOT INGESTOR
// Pulls one ribbon snapshot per timeframe from the data source and
// feeds it into the decision channel. One polling task per timeframe;
// a slow oracle can never stall ingestion because the tasks only ever
// touch the channel.
// =============================================================================

use crate::error::EngineError;
use crate::types::{Color, IndicatorReading, Intensity, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, warn};

/// One ingested snapshot tagged with its timeframe, as delivered to the
/// decision task.
#[derive(Debug, Clone)]
pub struct TimeframeTick {
    pub timeframe: String,
    pub snapshot: Snapshot,
}

#[async_trait]
pub trait MarketSnapshotIngestor: Send + Sync {
    async fn pull(&self, timeframe: &str) -> Result<Snapshot, EngineError>;
}

// =============================================================================
// HTTP IMPLEMENTATION
// =============================================================================

// The feed reports color/intensity as free-form lowercase labels;
// they are forced into the closed variants right at the boundary.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireColor {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireIntensity {
    Light,
    Dark,
    Normal,
}

#[derive(Debug, Deserialize)]
struct WireReading {
    color: WireColor,
    intensity: WireIntensity,
    value: Decimal,
}

#[derive(Debug, Deserialize)]
struct WireSnapshot {
    timestamp: DateTime<Utc>,
    price: Decimal,
    readings: Vec<WireReading>,
}

impl From<WireReading> for IndicatorReading {
    fn from(w: WireReading) -> Self {
        IndicatorReading {
            color: match w.color {
                WireColor::Bullish => Color::Bullish,
                WireColor::Bearish => Color::Bearish,
                WireColor::Neutral => Color::Neutral,
            },
            intensity: match w.intensity {
                WireIntensity::Light => Intensity::Light,
                WireIntensity::Dark => Intensity::Dark,
                WireIntensity::Normal => Intensity::Normal,
            },
            value: w.value,
        }
    }
}

pub struct HttpIngestor {
    client: Client,
    base_url: String,
    symbol: String,
}

impl HttpIngestor {
    pub fn new(base_url: String, symbol: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            symbol,
        }
    }
}

#[async_trait]
impl MarketSnapshotIngestor for HttpIngestor {
    async fn pull(&self, timeframe: &str) -> Result<Snapshot, EngineError> {
        let url = format!(
            "{}/ribbon/{}?timeframe={}",
            self.base_url, self.symbol, timeframe
        );
        let wrap = |e: reqwest::Error| EngineError::Ingestion {
            timeframe: timeframe.to_string(),
            source: e.into(),
        };

        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(wrap)?
            .error_for_status()
            .map_err(wrap)?;

        let wire: WireSnapshot = resp.json().await.map_err(wrap)?;
        if wire.readings.is_empty() {
            warn!("📡 empty ribbon from feed for {}", timeframe);
        }
        Ok(Snapshot {
            timestamp: wire.timestamp,
            price: wire.price,
            readings: wire.readings.into_iter().map(Into::into).collect(),
        })
    }
}

// =============================================================================
// POLLING TASK
// =============================================================================

/// Poll one timeframe forever, pushing ticks into the bounded channel.
/// Pull failures back off exponentially up to a cap and never panic;
/// the feed coming back simply resumes the flow. Exits when the
/// decision task drops the receiver.
pub async fn run_polling_task(
    ingestor: std::sync::Arc<dyn MarketSnapshotIngestor>,
    timeframe: String,
    poll_interval: Duration,
    tx: mpsc::Sender<TimeframeTick>,
) {
    const MAX_BACKOFF_SECS: u64 = 300;
    let mut consecutive_failures = 0u32;

    loop {
        match ingestor.pull(&timeframe).await {
            Ok(snapshot) => {
                consecutive_failures = 0;
                let tick = TimeframeTick {
                    timeframe: timeframe.clone(),
                    snapshot,
                };
                if tx.send(tick).await.is_err() {
                    return;
                }
                sleep(poll_interval).await;
            }
            Err(e) => {
                consecutive_failures += 1;
                let backoff = poll_interval
                    .saturating_mul(2u32.saturating_pow(consecutive_failures.min(8)))
                    .min(Duration::from_secs(MAX_BACKOFF_SECS));
                error!(
                    "📡 pull failed for {} (attempt {}): {}. Backing off {:?}",
                    timeframe, consecutive_failures, e, backoff
                );
                sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_snapshot_parses_lowercase_labels() {
        let json = r#"{
            "timestamp": "2026-08-01T12:00:00Z",
            "price": "64250.5",
            "readings": [
                {"color": "bullish", "intensity": "dark", "value": "64200"},
                {"color": "neutral", "intensity": "normal", "value": "64180"}
            ]
        }"#;
        let wire: WireSnapshot = serde_json::from_str(json).unwrap();
        let readings: Vec<IndicatorReading> =
            wire.readings.into_iter().map(Into::into).collect();
        assert_eq!(readings[0].color, Color::Bullish);
        assert_eq!(readings[0].intensity, Intensity::Dark);
        assert_eq!(readings[1].color, Color::Neutral);
    }

    #[test]
    fn unknown_label_is_rejected_at_the_boundary() {
        let json = r#"{"color": "sideways", "intensity": "normal", "value": "1"}"#;
        assert!(serde_json::from_str::<WireReading>(json).is_err());
    }

    #[tokio::test]
    async fn polling_task_stops_when_receiver_drops() {
        struct StaticIngestor;
        #[async_trait]
        impl MarketSnapshotIngestor for StaticIngestor {
            async fn pull(&self, _tf: &str) -> Result<Snapshot, EngineError> {
                Ok(Snapshot {
                    timestamp: Utc::now(),
                    price: Decimal::from(100),
                    readings: vec![],
                })
            }
        }

        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_polling_task(
            std::sync::Arc::new(StaticIngestor),
            "1m".to_string(),
            Duration::from_millis(1),
            tx,
        ));
        assert!(rx.recv().await.is_some());
        drop(rx);
        // Task notices the closed channel on its next send.
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("polling task did not exit")
            .unwrap();
    }
}
