#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use nearby_negotiation::application::service::OfferService;
use nearby_negotiation::domain::notification::NotificationIntent;
use nearby_negotiation::domain::ports::{Notifier, ResponseStore, ResponseStoreBox};
use nearby_negotiation::domain::request::{GeoPoint, NewRequest, RequestId, UserId};
use nearby_negotiation::domain::response::{OfferDetails, OfferUpdate, Response, ResponseId};
use nearby_negotiation::error::{NegotiationError, Result};
use nearby_negotiation::infrastructure::in_memory::{InMemoryRequestStore, InMemoryResponseStore};
use nearby_negotiation::infrastructure::system::ManualClock;
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Keeps every intent it is handed.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<NotificationIntent>>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<NotificationIntent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<NotificationIntent> {
        self.sent()
            .into_iter()
            .filter(|n| n.recipient.as_str() == recipient)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &NotificationIntent) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _notification: &NotificationIntent) -> Result<()> {
        Err(NegotiationError::Notification("push gateway unavailable".to_string()))
    }
}

/// Holds the first conditional offer write made after `arm` until `release`, as if the
/// instance using it stalled between its request write and its offer write.
#[derive(Clone)]
pub struct GatedResponseStore {
    inner: InMemoryResponseStore,
    gate: Arc<Gate>,
}

#[derive(Default)]
struct Gate {
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl GatedResponseStore {
    pub fn new(inner: InMemoryResponseStore) -> Self {
        Self {
            inner,
            gate: Arc::default(),
        }
    }

    pub fn arm(&self) {
        self.gate.armed.store(true, Ordering::SeqCst);
    }

    /// Resolves once the held write has reached the gate.
    pub async fn reached(&self) {
        self.gate.reached.notified().await;
    }

    pub fn release(&self) {
        self.gate.release.notify_one();
    }
}

#[async_trait]
impl ResponseStore for GatedResponseStore {
    async fn save(&self, response: Response) -> Result<()> {
        self.inner.save(response).await
    }

    async fn save_if(&self, response: Response, expected_version: u64) -> Result<Response> {
        if self.gate.armed.swap(false, Ordering::SeqCst) {
            self.gate.reached.notify_one();
            self.gate.release.notified().await;
        }
        self.inner.save_if(response, expected_version).await
    }

    async fn get(&self, id: &ResponseId) -> Result<Option<Response>> {
        self.inner.get(id).await
    }

    async fn find_by_request(&self, request_id: &RequestId) -> Result<Vec<Response>> {
        self.inner.find_by_request(request_id).await
    }
}

/// A service over shared in-memory stores with a manual clock and a recording notifier.
pub struct Harness {
    pub service: OfferService,
    pub clock: ManualClock,
    pub notifier: RecordingNotifier,
    pub requests: InMemoryRequestStore,
    pub responses: InMemoryResponseStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_stores(InMemoryRequestStore::new(), InMemoryResponseStore::new())
    }

    /// A second instance over the same stores behaves like another process.
    pub fn with_stores(requests: InMemoryRequestStore, responses: InMemoryResponseStore) -> Self {
        let port = Box::new(responses.clone());
        Self::build(requests, responses, port)
    }

    fn build(
        requests: InMemoryRequestStore,
        responses: InMemoryResponseStore,
        response_port: ResponseStoreBox,
    ) -> Self {
        let clock = ManualClock::new(start());
        let notifier = RecordingNotifier::default();
        let service = OfferService::new(
            Box::new(requests.clone()),
            response_port,
            Box::new(notifier.clone()),
            Box::new(clock.clone()),
        );
        Self {
            service,
            clock,
            notifier,
            requests,
            responses,
        }
    }

    pub fn sibling(&self) -> Self {
        Self::with_stores(self.requests.clone(), self.responses.clone())
    }

    /// A second instance whose offer writes can be held at a gate.
    pub fn gated_sibling(&self) -> (Self, GatedResponseStore) {
        let gated = GatedResponseStore::new(self.responses.clone());
        let sibling = Self::build(
            self.requests.clone(),
            self.responses.clone(),
            Box::new(gated.clone()),
        );
        (sibling, gated)
    }
}

pub fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_750_000_000, 0).unwrap_or_default()
}

pub fn user(id: &str) -> UserId {
    UserId::new(id)
}

pub fn new_request(id: &str, owner: &str) -> NewRequest {
    NewRequest {
        id: Some(RequestId::new(id)),
        owner_id: user(owner),
        item_name: "pressure washer".to_string(),
        location: GeoPoint {
            latitude: 37.77,
            longitude: -122.42,
        },
        expire_date: Some(start() + Duration::days(7)),
        description: Some("for a deck".to_string()),
        rental: true,
        category: Some("tools".to_string()),
    }
}

pub fn details(price: Decimal, price_type: &str) -> OfferDetails {
    OfferDetails {
        offer_price: price,
        price_type: price_type.to_string(),
        exchange_location: Some("front porch".to_string()),
        exchange_time: Some(start() + Duration::days(1)),
        return_location: Some("front porch".to_string()),
        return_time: Some(start() + Duration::days(2)),
        message: None,
    }
}

pub fn seller_sets(status: &str) -> OfferUpdate {
    OfferUpdate {
        seller_status: Some(status.to_string()),
        ..Default::default()
    }
}

pub fn buyer_sets(status: &str) -> OfferUpdate {
    OfferUpdate {
        buyer_status: Some(status.to_string()),
        ..Default::default()
    }
}

/// Writes a command script with the full header.
pub fn write_script(path: &Path, rows: &[[&str; 12]]) -> std::result::Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record([
        "op",
        "actor",
        "request",
        "response",
        "item",
        "price",
        "price_type",
        "buyer_status",
        "seller_status",
        "message",
        "expires",
        "at",
    ])?;
    for row in rows {
        wtr.write_record(row)?;
    }

    wtr.flush()?;
    Ok(())
}
