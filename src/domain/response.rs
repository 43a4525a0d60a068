use crate::domain::request::{RequestId, UserId};
use crate::error::{NegotiationError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of an offer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(String);

impl ResponseId {
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

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceType {
    Flat,
    PerHour,
    PerDay,
}

impl FromStr for PriceType {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FLAT" => Ok(PriceType::Flat),
            "PER_HOUR" => Ok(PriceType::PerHour),
            "PER_DAY" => Ok(PriceType::PerDay),
            _ => Err(NegotiationError::InvalidPriceType(s.to_string())),
        }
    }
}

impl fmt::Display for PriceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PriceType::Flat => "FLAT",
            PriceType::PerHour => "PER_HOUR",
            PriceType::PerDay => "PER_DAY",
        })
    }
}

/// Status the seller controls.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SellerStatus {
    Offered,
    Accepted,
    Declined,
}

impl FromStr for SellerStatus {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFFERED" => Ok(SellerStatus::Offered),
            "ACCEPTED" => Ok(SellerStatus::Accepted),
            "DECLINED" => Ok(SellerStatus::Declined),
            _ => Err(NegotiationError::InvalidStatus {
                field: "seller status",
                value: s.to_string(),
            }),
        }
    }
}

/// Status the buyer (request owner) controls.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuyerStatus {
    Pending,
    Accepted,
    Declined,
    Closed,
}

impl FromStr for BuyerStatus {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(BuyerStatus::Pending),
            "ACCEPTED" => Ok(BuyerStatus::Accepted),
            "DECLINED" => Ok(BuyerStatus::Declined),
            "CLOSED" => Ok(BuyerStatus::Closed),
            _ => Err(NegotiationError::InvalidStatus {
                field: "buyer status",
                value: s.to_string(),
            }),
        }
    }
}

/// Aggregate status derived from the buyer and seller statuses.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Pending,
    Accepted,
    Closed,
}

impl ResponseStatus {
    /// Legal moves: PENDING -> ACCEPTED, PENDING -> CLOSED, ACCEPTED -> CLOSED.
    pub fn can_transition_to(self, next: ResponseStatus) -> bool {
        use ResponseStatus::*;
        matches!(
            (self, next),
            (Pending, Accepted) | (Pending, Closed) | (Accepted, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStatus::Pending => "PENDING",
            ResponseStatus::Accepted => "ACCEPTED",
            ResponseStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// Terms a seller proposes when responding to a request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OfferDetails {
    pub offer_price: Decimal,
    pub price_type: String,
    pub exchange_location: Option<String>,
    pub exchange_time: Option<DateTime<Utc>>,
    pub return_location: Option<String>,
    pub return_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Changes either party submits against an existing offer. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OfferUpdate {
    pub offer_price: Option<Decimal>,
    pub price_type: Option<String>,
    pub exchange_location: Option<String>,
    pub exchange_time: Option<DateTime<Utc>>,
    pub return_location: Option<String>,
    pub return_time: Option<DateTime<Utc>>,
    pub buyer_status: Option<String>,
    pub seller_status: Option<String>,
    pub message: Option<String>,
}

/// An offer submitted by a seller against a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: ResponseId,
    pub request_id: RequestId,
    pub seller_id: UserId,
    pub offer_price: Decimal,
    pub price_type: PriceType,
    pub exchange_location: Option<String>,
    pub exchange_time: Option<DateTime<Utc>>,
    pub return_location: Option<String>,
    pub return_time: Option<DateTime<Utc>>,
    pub response_time: DateTime<Utc>,
    messages: Vec<Message>,
    seller_status: SellerStatus,
    buyer_status: BuyerStatus,
    response_status: ResponseStatus,
    /// Bumped by the store on every precondition-checked write. Zero until first stored.
    #[serde(default)]
    pub version: u64,
}

impl Response {
    pub(crate) fn offered(
        request_id: RequestId,
        seller_id: UserId,
        details: &OfferDetails,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: ResponseId::generate(),
            request_id,
            seller_id,
            offer_price: details.offer_price,
            price_type: details.price_type.parse()?,
            exchange_location: details.exchange_location.clone(),
            exchange_time: details.exchange_time,
            return_location: details.return_location.clone(),
            return_time: details.return_time,
            response_time: now,
            messages: Vec::new(),
            seller_status: SellerStatus::Offered,
            buyer_status: BuyerStatus::Pending,
            response_status: ResponseStatus::Pending,
            version: 0,
        })
    }

    pub fn seller_status(&self) -> SellerStatus {
        self.seller_status
    }

    pub fn buyer_status(&self) -> BuyerStatus {
        self.buyer_status
    }

    pub fn response_status(&self) -> ResponseStatus {
        self.response_status
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_closed(&self) -> bool {
        self.response_status == ResponseStatus::Closed
    }

    pub(crate) fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Applies the non-status fields present in `update`.
    pub(crate) fn apply_fields(&mut self, update: &OfferUpdate) -> Result<()> {
        if let Some(price_type) = &update.price_type {
            self.price_type = price_type.parse()?;
        }
        if let Some(price) = update.offer_price {
            self.offer_price = price;
        }
        if let Some(location) = &update.exchange_location {
            self.exchange_location = Some(location.clone());
        }
        if let Some(time) = update.exchange_time {
            self.exchange_time = Some(time);
        }
        if let Some(location) = &update.return_location {
            self.return_location = Some(location.clone());
        }
        if let Some(time) = update.return_time {
            self.return_time = Some(time);
        }
        Ok(())
    }

    pub(crate) fn accept_as_buyer(&mut self) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.buyer_status = BuyerStatus::Accepted;
        Ok(())
    }

    pub(crate) fn decline_as_buyer(&mut self) -> Result<()> {
        self.ensure_not_accepted()?;
        self.transition(ResponseStatus::Closed)?;
        self.buyer_status = BuyerStatus::Declined;
        Ok(())
    }

    pub(crate) fn accept_as_seller(&mut self) -> Result<()> {
        self.transition(ResponseStatus::Accepted)?;
        self.seller_status = SellerStatus::Accepted;
        Ok(())
    }

    pub(crate) fn decline_as_seller(&mut self) -> Result<()> {
        self.ensure_not_accepted()?;
        self.transition(ResponseStatus::Closed)?;
        self.seller_status = SellerStatus::Declined;
        Ok(())
    }

    /// Closes the offer on behalf of the request (lost to a sibling, or expired).
    /// Returns false when the offer was already closed.
    pub(crate) fn close_by_request(&mut self) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        self.transition(ResponseStatus::Closed)?;
        self.buyer_status = BuyerStatus::Closed;
        Ok(true)
    }

    fn transition(&mut self, next: ResponseStatus) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if !self.response_status.can_transition_to(next) {
            return Err(NegotiationError::BadRequest(format!(
                "offer {} cannot move from {} to {}",
                self.id, self.response_status, next
            )));
        }
        self.response_status = next;
        Ok(())
    }

    // Withdrawing from an accepted offer would leave a fulfilled request without a winner.
    fn ensure_not_accepted(&self) -> Result<()> {
        if self.response_status == ResponseStatus::Accepted {
            return Err(NegotiationError::BadRequest(format!(
                "offer {} has already been accepted",
                self.id
            )));
        }
        Ok(())
    }

    fn closed_error(&self) -> NegotiationError {
        NegotiationError::BadRequest(format!("offer {} is closed", self.id))
    }
}
