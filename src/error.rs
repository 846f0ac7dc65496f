use thiserror::Error;

/// Engine error taxonomy. Each class maps to a distinct recovery path:
/// ingestion errors are retried in the polling task, oracle errors
/// resolve the cycle to "no entry", order errors are retried from the
/// pending lifecycle state, config errors keep the previous thresholds.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("ingestion failed for {timeframe}: {source}")]
    Ingestion {
        timeframe: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("oracle timed out after {timeout_secs}s")]
    OracleTimeout { timeout_secs: u64 },

    #[error("oracle returned malformed response: {0}")]
    OracleMalformed(String),

    #[error("order execution failed ({op}): {source}")]
    OrderExecution {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Execution failure that retrying cannot fix (auth revoked,
    /// account disabled). Suspends new-entry evaluation.
    #[error("unrecoverable execution failure: {0}")]
    ExecutionUnrecoverable(String),

    #[error("invalid threshold config: {0}")]
    ConfigCorruption(String),
}

impl EngineError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, EngineError::ExecutionUnrecoverable(_))
    }
}
