use super::notification::NotificationIntent;
use super::request::{Request, RequestId};
use super::response::{Response, ResponseId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Unconditional upsert.
    async fn save(&self, request: Request) -> Result<()>;
    /// Writes `request` only if the stored version still equals `expected_version`.
    ///
    /// Returns the stored copy with its version bumped, or `NegotiationError::Conflict`.
    async fn save_if(&self, request: Request, expected_version: u64) -> Result<Request>;
    async fn get(&self, id: &RequestId) -> Result<Option<Request>>;
    async fn all(&self) -> Result<Vec<Request>>;
}

#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Unconditional upsert.
    async fn save(&self, response: Response) -> Result<()>;
    /// Writes `response` only if the stored version, zero when absent, still equals
    /// `expected_version`.
    ///
    /// Returns the stored copy with its version bumped, or `NegotiationError::Conflict`.
    async fn save_if(&self, response: Response, expected_version: u64) -> Result<Response>;
    async fn get(&self, id: &ResponseId) -> Result<Option<Response>>;
    /// All offers made against `request_id`, most recent `response_time` first.
    async fn find_by_request(&self, request_id: &RequestId) -> Result<Vec<Response>>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &NotificationIntent) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type RequestStoreBox = Box<dyn RequestStore>;
pub type ResponseStoreBox = Box<dyn ResponseStore>;
pub type NotifierBox = Box<dyn Notifier>;
pub type ClockBox = Box<dyn Clock>;
