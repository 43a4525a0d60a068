use crate::domain::response::{Response, ResponseId};
use crate::error::{NegotiationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a posted request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a user acting as requester (buyer) or responder (seller).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Open,
    Fulfilled,
    Closed,
}

impl RequestStatus {
    /// Legal moves: OPEN -> FULFILLED, OPEN -> CLOSED, FULFILLED -> CLOSED.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Open, Fulfilled) | (Open, Closed) | (Fulfilled, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Open => "OPEN",
            RequestStatus::Fulfilled => "FULFILLED",
            RequestStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for posting a new request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    pub id: Option<RequestId>,
    pub owner_id: UserId,
    pub item_name: String,
    pub location: GeoPoint,
    pub expire_date: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub rental: bool,
    pub category: Option<String>,
}

/// A want posted by a user, open for competing offers until fulfilled or expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub owner_id: UserId,
    pub item_name: String,
    pub location: GeoPoint,
    pub post_date: DateTime<Utc>,
    pub expire_date: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub rental: bool,
    pub category: Option<String>,
    status: RequestStatus,
    fulfilled_by_response_id: Option<ResponseId>,
    /// Offer writes committed together with this version of the request but possibly not yet
    /// applied to the offer store. Whoever reads them next applies them before deciding.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    staged_offers: Vec<Response>,
    /// Bumped by the store on every precondition-checked write.
    pub version: u64,
}

impl Request {
    pub fn open(new: NewRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id.unwrap_or_else(RequestId::generate),
            owner_id: new.owner_id,
            item_name: new.item_name,
            location: new.location,
            post_date: now,
            expire_date: new.expire_date,
            description: new.description,
            rental: new.rental,
            category: new.category,
            status: RequestStatus::Open,
            fulfilled_by_response_id: None,
            staged_offers: Vec::new(),
            version: 0,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn fulfilled_by(&self) -> Option<&ResponseId> {
        self.fulfilled_by_response_id.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.status == RequestStatus::Open
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_date.is_some_and(|expires| expires < now)
    }

    pub fn staged_offers(&self) -> &[Response] {
        &self.staged_offers
    }

    pub(crate) fn stage_offers(&mut self, offers: Vec<Response>) {
        self.staged_offers = offers;
    }

    pub(crate) fn clear_staged_offers(&mut self) {
        self.staged_offers.clear();
    }

    /// Marks the request as won by `response_id`.
    pub(crate) fn fulfill(&mut self, response_id: ResponseId) -> Result<()> {
        self.transition(RequestStatus::Fulfilled)?;
        self.fulfilled_by_response_id = Some(response_id);
        Ok(())
    }

    /// Closes the request. Closing a closed request is a no-op.
    pub(crate) fn close(&mut self) -> Result<()> {
        if self.status == RequestStatus::Closed {
            return Ok(());
        }
        self.transition(RequestStatus::Closed)
    }

    fn transition(&mut self, next: RequestStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(NegotiationError::BadRequest(format!(
                "request {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}
