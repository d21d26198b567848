// Concrete supplier integrations and the helpers they share

pub mod goglobal;
pub mod rate_hawk;
pub mod tbo;

pub use goglobal::GoGlobalAdapter;
pub use rate_hawk::RateHawkAdapter;
pub use tbo::TboAdapter;

use crate::error::{is_retryable_status, SupplierError};
use crate::session_pool::HttpReply;
use serde_json::Value;

const ERROR_BODY_PREVIEW: usize = 200;

// Non-2xx reply to an error carrying a short preview of the body
pub(crate) fn http_failure(supplier: &str, reply: &HttpReply) -> SupplierError {
    let text = reply.text();
    let preview: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
    SupplierError::ApiResponseError {
        status_code: reply.status,
        message: format!("{} returned HTTP {}: {}", supplier, reply.status, preview),
        is_retryable: is_retryable_status(reply.status),
    }
}

// Numbers arrive both as JSON numbers and as strings
pub(crate) fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
