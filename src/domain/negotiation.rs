//! The negotiation rules between a request and the offers made against it.
//!
//! `NegotiationEngine` is pure: it reads the entities it is handed, decides, and returns the
//! new state as [`Effects`] for the caller to persist and dispatch. It owns no storage, holds
//! no locks and never blocks, so it can be shared freely between tasks.
//!
//! ```text
//! Request:  OPEN ──seller accepts──> FULFILLED ──expiry──> CLOSED
//!             └──────────────expiry──────────────────────> CLOSED
//! Response: PENDING ──seller accepts──> ACCEPTED ──expiry──> CLOSED
//!              └──decline / lost to sibling / expiry──────> CLOSED
//! ```

use super::notification::{NotificationIntent, NotificationKind};
use super::request::{Request, RequestId, RequestStatus, UserId};
use super::response::{
    BuyerStatus, Message, OfferDetails, OfferUpdate, Response, ResponseId, ResponseStatus,
    SellerStatus,
};
use crate::error::{NegotiationError, Result};
use chrono::{DateTime, Utc};

/// Which side of the negotiation an actor is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The request owner.
    Buyer,
    /// The user who made the offer.
    Seller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeReason {
    Fulfilled,
    Expired,
}

/// Order to close every open offer of a request except `keep`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeClose {
    pub request_id: RequestId,
    pub keep: Option<ResponseId>,
    pub reason: CascadeReason,
}

/// State changes and notifications produced by a decision, in the order they must be applied:
/// request first, then responses, then the cascade, then notifications.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    pub request: Option<Request>,
    pub responses: Vec<Response>,
    pub notifications: Vec<NotificationIntent>,
    pub cascade: Option<CascadeClose>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.request.is_none()
            && self.responses.is_empty()
            && self.notifications.is_empty()
            && self.cascade.is_none()
    }
}

#[derive(Debug)]
pub struct Decision<T> {
    pub outcome: T,
    pub effects: Effects,
}

/// A failed decision. Some failures still change state (an expired request is closed before
/// the call is rejected), so the rejection carries effects of its own.
#[derive(Debug)]
pub struct Rejection {
    pub error: NegotiationError,
    pub effects: Effects,
}

impl From<NegotiationError> for Rejection {
    fn from(error: NegotiationError) -> Self {
        Self {
            error,
            effects: Effects::default(),
        }
    }
}

pub type Verdict<T> = std::result::Result<Decision<T>, Rejection>;

#[derive(Debug, Default, Clone, Copy)]
pub struct NegotiationEngine;

impl NegotiationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Builds a new offer from `seller_id` against an open request.
    pub fn create_offer(
        &self,
        request: &Request,
        seller_id: &UserId,
        details: &OfferDetails,
        now: DateTime<Utc>,
    ) -> Verdict<Response> {
        if !request.is_open() {
            return Err(NegotiationError::BadRequest(format!(
                "cannot create this offer because request {} was recently fulfilled or closed",
                request.id
            ))
            .into());
        }
        if request.is_expired(now) {
            return Err(self.expire(request, None));
        }
        if seller_id == &request.owner_id {
            return Err(NegotiationError::Unauthorized(format!(
                "user {} cannot respond to their own request",
                seller_id
            ))
            .into());
        }

        let mut response = Response::offered(request.id.clone(), seller_id.clone(), details, now)?;
        let mut effects = Effects::default();
        if let Some(content) = non_blank(details.message.as_deref()) {
            response.add_message(Message {
                sender_id: seller_id.clone(),
                content: content.to_string(),
                sent_at: now,
            });
            effects.notifications.push(NotificationIntent::new(
                request.owner_id.clone(),
                format!("New offer for {}", request.item_name),
                content,
                NotificationKind::NewMessage,
            ));
        }
        effects.responses.push(response.clone());

        Ok(Decision {
            outcome: response,
            effects,
        })
    }

    /// Applies `update` from `actor` to `response`.
    ///
    /// The buyer may only move the buyer status and the seller only the seller status. A seller
    /// acceptance fulfils the request and orders a cascade-close of every sibling offer.
    pub fn update_offer(
        &self,
        update: &OfferUpdate,
        response: &Response,
        request: &Request,
        actor: &UserId,
        now: DateTime<Utc>,
    ) -> Verdict<Response> {
        let role = self.role_of(actor, request, response)?;
        if response.request_id != request.id {
            return Err(NegotiationError::BadRequest(format!(
                "offer {} does not belong to request {}",
                response.id, request.id
            ))
            .into());
        }

        let is_winner = request.fulfilled_by() == Some(&response.id);
        let won = request.status() == RequestStatus::Fulfilled && is_winner;
        if !request.is_open() && !won {
            return Err(NegotiationError::Unauthorized(format!(
                "unable to update offer {} because request {} is no longer open",
                response.id, request.id
            ))
            .into());
        }
        // The request names this offer as winner but the offer write has not landed yet.
        if won && response.response_status() != ResponseStatus::Accepted {
            return Err(NegotiationError::Conflict(request.id.clone()).into());
        }
        if request.is_expired(now) {
            return Err(self.expire(request, Some(response)));
        }
        if response.is_closed() {
            return Err(
                NegotiationError::BadRequest(format!("offer {} is closed", response.id)).into(),
            );
        }

        let mut updated = response.clone();
        updated.apply_fields(update)?;

        let mut effects = Effects::default();
        if let Some(content) = non_blank(update.message.as_deref()) {
            updated.add_message(Message {
                sender_id: actor.clone(),
                content: content.to_string(),
                sent_at: now,
            });
            let recipient = match role {
                Role::Buyer => updated.seller_id.clone(),
                Role::Seller => request.owner_id.clone(),
            };
            effects.notifications.push(NotificationIntent::new(
                recipient,
                format!("New message about {}", request.item_name),
                content,
                NotificationKind::NewMessage,
            ));
        }

        match role {
            Role::Buyer => self.apply_buyer_status(update, &mut updated, request, &mut effects)?,
            Role::Seller => {
                self.apply_seller_status(update, &mut updated, request, &mut effects)?
            }
        }
        effects.responses.push(updated.clone());

        Ok(Decision {
            outcome: updated,
            effects,
        })
    }

    /// Closes every open sibling named by `cascade`. Offers that are already closed are skipped
    /// and not notified again, so running the same cascade twice yields no further effects.
    pub fn cascade_close(
        &self,
        request: &Request,
        cascade: &CascadeClose,
        siblings: Vec<Response>,
    ) -> Result<Effects> {
        let mut effects = Effects::default();
        for mut sibling in siblings {
            if sibling.request_id != cascade.request_id
                || cascade.keep.as_ref() == Some(&sibling.id)
            {
                continue;
            }
            if !sibling.close_by_request()? {
                continue;
            }
            let message = match cascade.reason {
                CascadeReason::Fulfilled => format!(
                    "The request for {} was fulfilled by another offer.",
                    request.item_name
                ),
                CascadeReason::Expired => {
                    format!("The request for {} has expired.", request.item_name)
                }
            };
            effects.notifications.push(NotificationIntent::new(
                sibling.seller_id.clone(),
                "Request closed",
                message,
                NotificationKind::OfferUpdate,
            ));
            effects.responses.push(sibling);
        }
        Ok(effects)
    }

    /// The cascade a settled request implies: every offer but the winner closed once fulfilled,
    /// every offer closed once closed. Open requests imply none.
    pub fn settled_cascade(&self, request: &Request) -> Option<CascadeClose> {
        match request.status() {
            RequestStatus::Open => None,
            RequestStatus::Fulfilled => Some(CascadeClose {
                request_id: request.id.clone(),
                keep: request.fulfilled_by().cloned(),
                reason: CascadeReason::Fulfilled,
            }),
            RequestStatus::Closed => Some(CascadeClose {
                request_id: request.id.clone(),
                keep: None,
                reason: CascadeReason::Expired,
            }),
        }
    }

    pub fn role_of(&self, actor: &UserId, request: &Request, response: &Response) -> Result<Role> {
        if actor == &request.owner_id {
            Ok(Role::Buyer)
        } else if actor == &response.seller_id {
            Ok(Role::Seller)
        } else {
            Err(NegotiationError::Unauthorized(format!(
                "user {} is not a party to offer {}",
                actor, response.id
            )))
        }
    }

    fn apply_buyer_status(
        &self,
        update: &OfferUpdate,
        response: &mut Response,
        request: &Request,
        effects: &mut Effects,
    ) -> Result<()> {
        if let Some(raw) = &update.seller_status
            && raw.parse::<SellerStatus>()? != response.seller_status()
        {
            return Err(NegotiationError::Unauthorized(
                "only the seller can change the seller status".to_string(),
            ));
        }
        let Some(raw) = &update.buyer_status else {
            return Ok(());
        };
        let target: BuyerStatus = raw.parse()?;
        if target == response.buyer_status() {
            return Ok(());
        }

        let (title, verb) = match target {
            BuyerStatus::Accepted => {
                response.accept_as_buyer()?;
                ("Offer accepted", "accepted")
            }
            BuyerStatus::Declined => {
                response.decline_as_buyer()?;
                ("Offer declined", "declined")
            }
            BuyerStatus::Pending | BuyerStatus::Closed => {
                return Err(NegotiationError::BadRequest(format!(
                    "the buyer cannot set an offer to {}",
                    raw.trim().to_ascii_uppercase()
                )));
            }
        };
        effects.notifications.push(NotificationIntent::new(
            response.seller_id.clone(),
            title,
            format!("Your offer for {} was {}.", request.item_name, verb),
            NotificationKind::OfferUpdate,
        ));
        Ok(())
    }

    fn apply_seller_status(
        &self,
        update: &OfferUpdate,
        response: &mut Response,
        request: &Request,
        effects: &mut Effects,
    ) -> Result<()> {
        if let Some(raw) = &update.buyer_status
            && raw.parse::<BuyerStatus>()? != response.buyer_status()
        {
            return Err(NegotiationError::Unauthorized(
                "only the request owner can change the buyer status".to_string(),
            ));
        }
        let Some(raw) = &update.seller_status else {
            return Ok(());
        };
        let target: SellerStatus = raw.parse()?;
        if target == response.seller_status() {
            return Ok(());
        }

        match target {
            SellerStatus::Accepted => {
                // Single winner: only an open request can be fulfilled.
                if !request.is_open() {
                    return Err(NegotiationError::Unauthorized(format!(
                        "request {} is no longer open",
                        request.id
                    )));
                }
                response.accept_as_seller()?;
                let mut fulfilled = request.clone();
                fulfilled.fulfill(response.id.clone())?;
                effects.request = Some(fulfilled);
                effects.cascade = Some(CascadeClose {
                    request_id: request.id.clone(),
                    keep: Some(response.id.clone()),
                    reason: CascadeReason::Fulfilled,
                });
                effects.notifications.push(NotificationIntent::new(
                    request.owner_id.clone(),
                    "Request fulfilled",
                    format!("Your request for {} has been fulfilled.", request.item_name),
                    NotificationKind::OfferUpdate,
                ));
            }
            SellerStatus::Declined => {
                response.decline_as_seller()?;
                effects.notifications.push(NotificationIntent::new(
                    request.owner_id.clone(),
                    "Offer withdrawn",
                    format!("An offer for {} was withdrawn.", request.item_name),
                    NotificationKind::OfferUpdate,
                ));
            }
            SellerStatus::Offered => {
                return Err(NegotiationError::BadRequest(format!(
                    "offer {} cannot return to OFFERED",
                    response.id
                )));
            }
        }
        Ok(())
    }

    /// Effects of touching an expired request: the request closes, the touched offer closes,
    /// and every other open offer is ordered closed.
    fn expire(&self, request: &Request, response: Option<&Response>) -> Rejection {
        let error = NegotiationError::RequestExpired(request.id.clone());
        let mut effects = Effects::default();

        let mut closed = request.clone();
        if let Err(e) = closed.close() {
            return e.into();
        }
        effects.request = Some(closed);

        if let Some(response) = response {
            let mut response = response.clone();
            match response.close_by_request() {
                Ok(true) => effects.responses.push(response),
                Ok(false) => {}
                Err(e) => return e.into(),
            }
        }
        effects.cascade = Some(CascadeClose {
            request_id: request.id.clone(),
            keep: None,
            reason: CascadeReason::Expired,
        });

        Rejection { error, effects }
    }
}

fn non_blank(message: Option<&str>) -> Option<&str> {
    message.filter(|m| !m.trim().is_empty())
}
