use crate::domain::request::RequestId;
use thiserror::Error;

/// Failures reported by the negotiation engine and the stores around it.
///
/// Every variant is terminal for the call that produced it. `Conflict` is the only one the
/// orchestration layer retries on its own.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Request {0} has expired and was closed")]
    RequestExpired(RequestId),
    #[error("Unable to set price type to [{0}]. Options are FLAT, PER_HOUR, PER_DAY")]
    InvalidPriceType(String),
    #[error("Unable to set {field} to [{value}]")]
    InvalidStatus { field: &'static str, value: String },
    #[error("Concurrent modification of request {0}")]
    Conflict(RequestId),
    #[error("Notification delivery failed: {0}")]
    Notification(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

impl NegotiationError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for malformed caller input (unknown price type or status string).
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidPriceType(_) | Self::InvalidStatus { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, NegotiationError>;
