// Error types shared by the breaker, the session pool, the adapters and the orchestrator

use crate::circuit_breaker::CircuitState;
use thiserror::Error;

// Failure of a single supplier call. Never aborts a whole search.
#[derive(Error, Debug, Clone)]
pub enum SupplierError {
    #[error("Supplier not configured: {0}")]
    NotConfigured(String),

    #[error("Circuit breaker {state} for {supplier}")]
    CircuitBreakerOpen {
        supplier: String,
        state: CircuitState,
        retry_after_ms: Option<u64>,
    },

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error: {status_code} - {message}")]
    ApiResponseError {
        status_code: u16,
        message: String,
        is_retryable: bool,
    },

    #[error("Invalid search criteria: {0}")]
    InvalidCriteria(String),

    #[error("No hotels mapped for supplier: {0}")]
    NoMappedHotels(String),

    #[error("Unparseable supplier response: {0}")]
    ParseError(String),

    #[error("Session pool is closed")]
    SessionPoolClosed,

    #[error("Other error: {0}")]
    Other(String),
}

impl SupplierError {
    pub fn api(status_code: u16, message: impl Into<String>) -> Self {
        SupplierError::ApiResponseError {
            status_code,
            message: message.into(),
            is_retryable: is_retryable_status(status_code),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        SupplierError::ParseError(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        SupplierError::InvalidCriteria(message.into())
    }

    /// Whether another attempt against the same supplier could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SupplierError::NotConfigured(_)
            | SupplierError::CircuitBreakerOpen { .. }
            | SupplierError::InvalidCriteria(_)
            | SupplierError::NoMappedHotels(_)
            | SupplierError::SessionPoolClosed => false,
            SupplierError::ApiResponseError { is_retryable, .. } => *is_retryable,
            SupplierError::Timeout(_)
            | SupplierError::NetworkError(_)
            | SupplierError::ParseError(_)
            | SupplierError::Other(_) => true,
        }
    }

    /// Whether this failure counts against the supplier's circuit breaker.
    /// Errors caused by the request itself say nothing about supplier health.
    pub fn trips_breaker(&self) -> bool {
        !matches!(
            self,
            SupplierError::NotConfigured(_)
                | SupplierError::CircuitBreakerOpen { .. }
                | SupplierError::InvalidCriteria(_)
                | SupplierError::NoMappedHotels(_)
                | SupplierError::SessionPoolClosed
        )
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, SupplierError::CircuitBreakerOpen { .. })
    }
}

// 408, 429 and 5xx are worth another attempt
pub fn is_retryable_status(status_code: u16) -> bool {
    status_code == 408 || status_code == 429 || (500..600).contains(&status_code)
}

impl From<reqwest::Error> for SupplierError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return SupplierError::Timeout(0);
        }
        if let Some(status) = err.status() {
            return SupplierError::api(status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            return SupplierError::ParseError(err.to_string());
        }
        SupplierError::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for SupplierError {
    fn from(err: serde_json::Error) -> Self {
        SupplierError::ParseError(err.to_string())
    }
}

// Boot-time failures
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Initialization error: {0}")]
    InitError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(SupplierError::Timeout(100), true, true; "timeout")]
    #[test_case(SupplierError::NetworkError("reset".into()), true, true; "network")]
    #[test_case(SupplierError::api(503, "unavailable"), true, true; "server error")]
    #[test_case(SupplierError::api(400, "bad request"), false, true; "client status")]
    #[test_case(SupplierError::invalid("too many guests"), false, false; "invalid criteria")]
    #[test_case(SupplierError::NoMappedHotels("tbo".into()), false, false; "unmapped hotels")]
    #[test_case(SupplierError::CircuitBreakerOpen { supplier: "tbo".into(), state: CircuitState::Open, retry_after_ms: Some(10) }, false, false; "breaker open")]
    #[test_case(SupplierError::parse("not json"), true, true; "parse")]
    fn test_error_classification(err: SupplierError, retryable: bool, trips: bool) {
        assert_eq!(err.is_retryable(), retryable);
        assert_eq!(err.trips_breaker(), trips);
    }

    #[test]
    fn test_retryable_status_codes() {
        assert!(is_retryable_status(408));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(502));
        assert!(!is_retryable_status(403));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn test_circuit_open_message_names_state() {
        let err = SupplierError::CircuitBreakerOpen {
            supplier: "rate_hawk".to_string(),
            state: CircuitState::Open,
            retry_after_ms: Some(1500),
        };
        assert_eq!(err.to_string(), "Circuit breaker open for rate_hawk");
        assert!(err.is_circuit_open());
    }
}
