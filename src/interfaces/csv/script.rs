use super::command_reader::{CommandKind, CommandRecord};
use crate::application::service::{DeliveryWarning, OfferService};
use crate::domain::request::{GeoPoint, NewRequest, RequestId, UserId};
use crate::domain::response::{OfferDetails, OfferUpdate, ResponseId};
use crate::error::{NegotiationError, Result};
use crate::infrastructure::system::ManualClock;
use std::collections::HashMap;

/// Replays script commands against an `OfferService`.
///
/// Offers get generated ids, so the runner keeps the mapping from script labels to the ids the
/// service handed out.
pub struct ScriptRunner<'a> {
    service: &'a OfferService,
    clock: ManualClock,
    labels: HashMap<String, ResponseId>,
}

impl<'a> ScriptRunner<'a> {
    /// `clock` must be a handle to the clock the service reads.
    pub fn new(service: &'a OfferService, clock: ManualClock) -> Self {
        Self {
            service,
            clock,
            labels: HashMap::new(),
        }
    }

    pub async fn apply(&mut self, command: CommandRecord) -> Result<Vec<DeliveryWarning>> {
        if let Some(at) = command.at {
            self.clock.set(at);
        }
        let actor = UserId::new(command.actor.as_str());
        let request_id = RequestId::new(command.request.as_str());

        match command.op {
            CommandKind::Request => {
                let item_name = command.item.ok_or_else(|| {
                    NegotiationError::BadRequest(format!("request {request_id} has no item"))
                })?;
                self.service
                    .post_request(NewRequest {
                        id: Some(request_id),
                        owner_id: actor,
                        item_name,
                        location: GeoPoint::default(),
                        expire_date: command.expires,
                        description: None,
                        rental: true,
                        category: None,
                    })
                    .await?;
                Ok(Vec::new())
            }
            CommandKind::Offer => {
                let offer_price = command.price.ok_or_else(|| {
                    NegotiationError::BadRequest("offer has no price".to_string())
                })?;
                let details = OfferDetails {
                    offer_price,
                    price_type: command.price_type.unwrap_or_else(|| "FLAT".to_string()),
                    message: command.message,
                    ..Default::default()
                };
                let receipt = self.service.create_offer(&request_id, &actor, details).await?;
                let label = command
                    .response
                    .unwrap_or_else(|| receipt.value.id.to_string());
                self.labels.insert(label, receipt.value.id);
                Ok(receipt.warnings)
            }
            CommandKind::Update => {
                let label = command.response.ok_or_else(|| {
                    NegotiationError::BadRequest("update has no response label".to_string())
                })?;
                let response_id = self
                    .labels
                    .get(&label)
                    .cloned()
                    .unwrap_or_else(|| ResponseId::new(label.as_str()));
                let update = OfferUpdate {
                    offer_price: command.price,
                    price_type: command.price_type,
                    buyer_status: command.buyer_status,
                    seller_status: command.seller_status,
                    message: command.message,
                    ..Default::default()
                };
                let receipt = self.service.update_offer(&response_id, &actor, update).await?;
                Ok(receipt.warnings)
            }
        }
    }

    /// Script label for every offer the runner created, keyed by offer id.
    pub fn labels(&self) -> HashMap<ResponseId, String> {
        self.labels
            .iter()
            .map(|(label, id)| (id.clone(), label.clone()))
            .collect()
    }
}
