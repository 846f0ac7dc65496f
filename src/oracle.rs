// =============================================================================
// DECISION ORACLE ADAPTER
// Opaque request/response advisory model. Stateless from the engine's
// perspective; every call is timeout-bounded, and any failure resolves
// the cycle to "no entry". The oracle is never trusted blindly: the
// quality gate still decides.
// =============================================================================

use crate::error::EngineError;
use crate::types::{
    Classification, Direction, Recommendation, Signal, ThresholdConfig,
};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Per-timeframe market context sent to the oracle. A condensed view,
/// not the raw history; the oracle never sees internal state it could
/// drift against.
#[derive(Debug, Clone, Serialize)]
pub struct TimeframeContext {
    pub timeframe: String,
    pub classification: Classification,
    pub price: Decimal,
    pub light_bullish: usize,
    pub light_bearish: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    pub contexts: Vec<TimeframeContext>,
    pub active_signals: Vec<Signal>,
    pub thresholds: ThresholdConfig,
    /// "idle" or "open:<direction>".
    pub position_state: String,
}

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn recommend(&self, request: &OracleRequest) -> Result<Recommendation, EngineError>;
}

/// Wrap any oracle call in a hard timeout. On expiry the cycle gets an
/// error, never a default recommendation; "assume enter" on a silent
/// oracle is exactly the failure mode this guards against.
pub async fn recommend_bounded(
    oracle: &dyn DecisionOracle,
    request: &OracleRequest,
    timeout_secs: u64,
) -> Result<Recommendation, EngineError> {
    match tokio::time::timeout(Duration::from_secs(timeout_secs), oracle.recommend(request)).await
    {
        Ok(result) => result,
        Err(_) => Err(EngineError::OracleTimeout { timeout_secs }),
    }
}

// =============================================================================
// HTTP IMPLEMENTATION
// =============================================================================

#[derive(Debug, Deserialize)]
struct WireRecommendation {
    direction: String,
    entry_recommended: bool,
    confidence: f64,
    stop_loss: Decimal,
    take_profit: Decimal,
    #[serde(default)]
    reasoning: String,
}

pub struct HttpOracle {
    client: Client,
    endpoint: String,
}

impl HttpOracle {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    fn parse(wire: WireRecommendation) -> Result<Recommendation, EngineError> {
        let direction = match wire.direction.to_ascii_lowercase().as_str() {
            "long" => Direction::Long,
            "short" => Direction::Short,
            other => {
                return Err(EngineError::OracleMalformed(format!(
                    "unknown direction {:?}",
                    other
                )))
            }
        };
        if !(0.0..=1.0).contains(&wire.confidence) || !wire.confidence.is_finite() {
            return Err(EngineError::OracleMalformed(format!(
                "confidence {} out of [0,1]",
                wire.confidence
            )));
        }
        if wire.entry_recommended {
            let inverted = match direction {
                Direction::Long => wire.stop_loss >= wire.take_profit,
                Direction::Short => wire.stop_loss <= wire.take_profit,
            };
            if inverted {
                return Err(EngineError::OracleMalformed(format!(
                    "stop {} / target {} inverted for {}",
                    wire.stop_loss, wire.take_profit, direction
                )));
            }
        }
        Ok(Recommendation {
            direction,
            entry_recommended: wire.entry_recommended,
            confidence: wire.confidence,
            stop_loss: wire.stop_loss,
            take_profit: wire.take_profit,
            reasoning: wire.reasoning,
        })
    }
}

#[async_trait]
impl DecisionOracle for HttpOracle {
    async fn recommend(&self, request: &OracleRequest) -> Result<Recommendation, EngineError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| EngineError::OracleMalformed(format!("transport: {}", e)))?
            .error_for_status()
            .map_err(|e| EngineError::OracleMalformed(format!("status: {}", e)))?;

        let wire: WireRecommendation = resp
            .json()
            .await
            .map_err(|e| EngineError::OracleMalformed(format!("decode: {}", e)))?;

        let rec = Self::parse(wire)?;
        debug!(
            "🔮 oracle: {} entry={} conf={:.2}",
            rec.direction, rec.entry_recommended, rec.confidence
        );
        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(direction: &str, confidence: f64, sl: i64, tp: i64) -> WireRecommendation {
        WireRecommendation {
            direction: direction.to_string(),
            entry_recommended: true,
            confidence,
            stop_loss: Decimal::from(sl),
            take_profit: Decimal::from(tp),
            reasoning: String::new(),
        }
    }

    #[test]
    fn parses_valid_long_recommendation() {
        let rec = HttpOracle::parse(wire("long", 0.8, 95, 110)).unwrap();
        assert_eq!(rec.direction, Direction::Long);
        assert!(rec.entry_recommended);
    }

    #[test]
    fn rejects_unknown_direction() {
        let err = HttpOracle::parse(wire("sideways", 0.8, 95, 110)).unwrap_err();
        assert!(matches!(err, EngineError::OracleMalformed(_)));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        assert!(HttpOracle::parse(wire("long", 1.4, 95, 110)).is_err());
        assert!(HttpOracle::parse(wire("long", f64::NAN, 95, 110)).is_err());
    }

    #[test]
    fn rejects_inverted_stop_and_target() {
        // Long with stop above target makes no sense.
        assert!(HttpOracle::parse(wire("long", 0.8, 110, 95)).is_err());
        // Mirrored for shorts.
        assert!(HttpOracle::parse(wire("short", 0.8, 95, 110)).is_err());
    }

    #[tokio::test]
    async fn slow_oracle_times_out_to_error() {
        struct SlowOracle;
        #[async_trait]
        impl DecisionOracle for SlowOracle {
            async fn recommend(
                &self,
                _request: &OracleRequest,
            ) -> Result<Recommendation, EngineError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
        }

        tokio::time::pause();
        let request = OracleRequest {
            contexts: vec![],
            active_signals: vec![],
            thresholds: ThresholdConfig::default(),
            position_state: "idle".to_string(),
        };
        let fut = recommend_bounded(&SlowOracle, &request, 30);
        let err = fut.await.unwrap_err();
        assert!(matches!(err, EngineError::OracleTimeout { timeout_secs: 30 }));
    }
}
