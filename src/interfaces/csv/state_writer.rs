use crate::domain::request::{Request, RequestStatus};
use crate::domain::response::{
    BuyerStatus, PriceType, Response, ResponseId, ResponseStatus, SellerStatus,
};
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum RowKind {
    Request,
    Offer,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
enum RowStatus {
    Request(RequestStatus),
    Offer(ResponseStatus),
}

#[derive(Debug, Serialize)]
struct StateRow<'a> {
    kind: RowKind,
    id: String,
    request: &'a str,
    actor: &'a str,
    status: RowStatus,
    seller_status: Option<SellerStatus>,
    buyer_status: Option<BuyerStatus>,
    price: Option<Decimal>,
    price_type: Option<PriceType>,
    fulfilled_by: Option<String>,
}

/// Writes the final state of requests and their offers as CSV.
///
/// Offers are shown by script label where one is known, otherwise by id.
pub struct StateWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> StateWriter<W> {
    pub fn new(dest: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(dest),
        }
    }

    /// Each request is followed by its offers, newest first.
    pub fn write_state(
        &mut self,
        entries: &[(Request, Vec<Response>)],
        labels: &HashMap<ResponseId, String>,
    ) -> Result<()> {
        let label = |id: &ResponseId| labels.get(id).cloned().unwrap_or_else(|| id.to_string());

        for (request, offers) in entries {
            self.writer.serialize(StateRow {
                kind: RowKind::Request,
                id: request.id.to_string(),
                request: "",
                actor: request.owner_id.as_str(),
                status: RowStatus::Request(request.status()),
                seller_status: None,
                buyer_status: None,
                price: None,
                price_type: None,
                fulfilled_by: request.fulfilled_by().map(label),
            })?;
            for offer in offers {
                self.writer.serialize(StateRow {
                    kind: RowKind::Offer,
                    id: label(&offer.id),
                    request: request.id.as_str(),
                    actor: offer.seller_id.as_str(),
                    status: RowStatus::Offer(offer.response_status()),
                    seller_status: Some(offer.seller_status()),
                    buyer_status: Some(offer.buyer_status()),
                    price: Some(offer.offer_price),
                    price_type: Some(offer.price_type),
                    fulfilled_by: None,
                })?;
            }
        }
        self.writer.flush()?;
        Ok(())
    }
}
