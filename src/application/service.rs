use crate::config::EngineConfig;
use crate::domain::negotiation::{CascadeClose, Effects, NegotiationEngine, Verdict};
use crate::domain::notification::{NotificationIntent, NotificationKind};
use crate::domain::ports::{ClockBox, NotifierBox, RequestStoreBox, ResponseStoreBox};
use crate::domain::request::{NewRequest, Request, RequestId, UserId};
use crate::domain::response::{OfferDetails, OfferUpdate, Response, ResponseId};
use crate::error::{NegotiationError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// A notification that could not be delivered. The state change it belonged to stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryWarning {
    pub recipient: UserId,
    pub kind: NotificationKind,
    pub reason: String,
}

/// The result of a committed operation plus any non-fatal delivery failures.
#[derive(Debug)]
pub struct Receipt<T> {
    pub value: T,
    pub warnings: Vec<DeliveryWarning>,
}

/// One async mutex per request id. Entries nobody holds or waits on are pruned on the next
/// acquisition.
#[derive(Default)]
struct RequestLocks {
    locks: Mutex<HashMap<RequestId, Arc<Mutex<()>>>>,
}

impl RequestLocks {
    async fn acquire(&self, id: &RequestId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Gives a concurrent writer time to land the rest of its commit before the next attempt.
async fn backoff(attempt: u32) {
    let millis = 1u64 << attempt.min(6);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

/// Orchestrates the negotiation engine against the stores, the notifier and the clock.
///
/// Every mutation of a request and its offers runs under a per-request lock, and the request
/// itself is written with a version precondition that also stages the offer writes of the same
/// decision. A second service sharing the same stores can therefore never commit a decision
/// made on a stale snapshot: its write conflicts and the decision is recomputed from fresh
/// reads, after finishing whatever offer writes the winning commit staged.
pub struct OfferService {
    requests: RequestStoreBox,
    responses: ResponseStoreBox,
    notifier: NotifierBox,
    clock: ClockBox,
    engine: NegotiationEngine,
    config: EngineConfig,
    locks: RequestLocks,
}

impl OfferService {
    pub fn new(
        requests: RequestStoreBox,
        responses: ResponseStoreBox,
        notifier: NotifierBox,
        clock: ClockBox,
    ) -> Self {
        Self::with_config(requests, responses, notifier, clock, EngineConfig::default())
    }

    pub fn with_config(
        requests: RequestStoreBox,
        responses: ResponseStoreBox,
        notifier: NotifierBox,
        clock: ClockBox,
        config: EngineConfig,
    ) -> Self {
        Self {
            requests,
            responses,
            notifier,
            clock,
            engine: NegotiationEngine::new(),
            config,
            locks: RequestLocks::default(),
        }
    }

    /// Posts a new OPEN request.
    pub async fn post_request(&self, new: NewRequest) -> Result<Request> {
        let request = Request::open(new, self.clock.now());
        let _guard = self.locks.acquire(&request.id).await;
        if self.requests.get(&request.id).await?.is_some() {
            return Err(NegotiationError::BadRequest(format!(
                "request {} already exists",
                request.id
            )));
        }
        self.requests.save(request.clone()).await?;
        info!(request_id = %request.id, owner = %request.owner_id, item = %request.item_name, "request posted");
        Ok(request)
    }

    pub async fn request(&self, id: &RequestId) -> Result<Request> {
        self.requests
            .get(id)
            .await?
            .ok_or_else(|| NegotiationError::not_found("Request", id))
    }

    pub async fn requests(&self) -> Result<Vec<Request>> {
        self.requests.all().await
    }

    /// Every request posted by `owner`, oldest first.
    pub async fn requests_by_owner(&self, owner: &UserId) -> Result<Vec<Request>> {
        let mut requests = self.requests.all().await?;
        requests.retain(|request| &request.owner_id == owner);
        Ok(requests)
    }

    pub async fn offer(&self, id: &ResponseId) -> Result<Response> {
        self.responses
            .get(id)
            .await?
            .ok_or_else(|| NegotiationError::not_found("Response", id))
    }

    /// All offers made against `request_id`, newest first.
    pub async fn offers_for(&self, request_id: &RequestId) -> Result<Vec<Response>> {
        self.responses.find_by_request(request_id).await
    }

    /// Submits an offer from `seller_id` against `request_id`.
    pub async fn create_offer(
        &self,
        request_id: &RequestId,
        seller_id: &UserId,
        details: OfferDetails,
    ) -> Result<Receipt<Response>> {
        let _guard = self.locks.acquire(request_id).await;
        let mut conflicts = 0;
        loop {
            let request = self.settled_request(request_id).await?;
            let verdict =
                self.engine
                    .create_offer(&request, seller_id, &details, self.clock.now());
            match self.settle(&request, verdict).await {
                Err(e) if e.is_conflict() && conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                    warn!(request_id = %request_id, attempt = conflicts, "conflicting write, retrying offer creation");
                    backoff(conflicts).await;
                }
                result => {
                    if let Ok(receipt) = &result {
                        info!(request_id = %request_id, response_id = %receipt.value.id, seller = %seller_id, "offer created");
                    }
                    return result;
                }
            }
        }
    }

    /// Applies `update` from `actor` to an existing offer.
    pub async fn update_offer(
        &self,
        response_id: &ResponseId,
        actor: &UserId,
        update: OfferUpdate,
    ) -> Result<Receipt<Response>> {
        let request_id = self.offer(response_id).await?.request_id;
        let _guard = self.locks.acquire(&request_id).await;
        let mut conflicts = 0;
        loop {
            // The request first: once it carries no staged writes, the offer read is current.
            let request = self.settled_request(&request_id).await?;
            let response = self.offer(response_id).await?;
            let verdict = self.engine.update_offer(
                &update,
                &response,
                &request,
                actor,
                self.clock.now(),
            );
            match self.settle(&request, verdict).await {
                Err(e) if e.is_conflict() && conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                    warn!(request_id = %request_id, response_id = %response_id, attempt = conflicts, "conflicting write, retrying offer update");
                    backoff(conflicts).await;
                }
                result => {
                    if let Ok(receipt) = &result {
                        info!(
                            response_id = %response_id,
                            actor = %actor,
                            status = %receipt.value.response_status(),
                            "offer updated"
                        );
                    }
                    return result;
                }
            }
        }
    }

    /// Persists whatever the verdict carries. Rejections may still close an expired request.
    async fn settle(
        &self,
        read: &Request,
        verdict: Verdict<Response>,
    ) -> Result<Receipt<Response>> {
        match verdict {
            Ok(decision) => {
                let warnings = self.commit(read, decision.effects).await?;
                let mut value = decision.outcome;
                // The staged copy lands one version past the one it was read at.
                value.version += 1;
                Ok(Receipt { value, warnings })
            }
            Err(rejection) => {
                if !rejection.effects.is_empty() {
                    self.commit(read, rejection.effects).await?;
                }
                debug!(request_id = %read.id, error = %rejection.error, "transition rejected");
                Err(rejection.error)
            }
        }
    }

    /// Reads a request with no offer writes outstanding, finishing any that an earlier commit
    /// (from this or another instance) staged but did not see through.
    async fn settled_request(&self, id: &RequestId) -> Result<Request> {
        loop {
            let request = self.request(id).await?;
            if request.staged_offers().is_empty() {
                return Ok(request);
            }
            debug!(request_id = %id, staged = request.staged_offers().len(), "finishing staged offer writes");
            let cascade = self.engine.settled_cascade(&request);
            let notifications = self.finish(&request, cascade.as_ref()).await?;
            self.dispatch(notifications).await;
        }
    }

    /// Commits the decision's offer writes together with the request in one version-checked
    /// write, then sees them through. Until they are applied the request carries them, so no
    /// later decision can read an offer that a committed write is about to change.
    async fn commit(&self, read: &Request, effects: Effects) -> Result<Vec<DeliveryWarning>> {
        let Effects {
            request,
            responses,
            mut notifications,
            cascade,
        } = effects;

        let mut staged = request.unwrap_or_else(|| read.clone());
        staged.stage_offers(responses);
        let written = self.requests.save_if(staged, read.version).await?;
        notifications.extend(self.finish(&written, cascade.as_ref()).await?);

        Ok(self.dispatch(notifications).await)
    }

    /// Applies the offers staged on `request`, runs its cascade, then clears the staged writes.
    /// Each step tolerates a concurrent reader doing the same work.
    async fn finish(
        &self,
        request: &Request,
        cascade: Option<&CascadeClose>,
    ) -> Result<Vec<NotificationIntent>> {
        for response in request.staged_offers() {
            self.apply_offer(response).await?;
        }
        let notifications = match cascade {
            Some(cascade) => self.run_cascade(request, cascade).await?,
            None => Vec::new(),
        };
        if !request.staged_offers().is_empty() {
            let mut cleared = request.clone();
            cleared.clear_staged_offers();
            match self.requests.save_if(cleared, request.version).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    debug!(request_id = %request.id, "staged writes already cleared")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(notifications)
    }

    /// Writes one staged offer against the version it was read at. A conflict means the stored
    /// copy is already past that version, which only happens once the write has been applied.
    async fn apply_offer(&self, response: &Response) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.responses.save_if(response.clone(), response.version).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    return match self.responses.get(&response.id).await? {
                        Some(stored) if stored.version > response.version => Ok(()),
                        _ => Err(e),
                    };
                }
                Err(e) if attempt < self.config.max_write_attempts => {
                    warn!(response_id = %response.id, attempt, error = %e, "offer write failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Closes every losing sibling, re-running the whole batch until it completes or the
    /// attempt budget runs out. Re-runs skip offers that an earlier pass already closed.
    async fn run_cascade(
        &self,
        request: &Request,
        cascade: &CascadeClose,
    ) -> Result<Vec<NotificationIntent>> {
        let mut notifications = Vec::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.cascade_once(request, cascade, &mut notifications).await {
                Ok(()) => {
                    debug!(request_id = %request.id, closed = notifications.len(), "cascade close complete");
                    return Ok(notifications);
                }
                Err(e) if attempt < self.config.max_write_attempts => {
                    warn!(request_id = %request.id, attempt, error = %e, "cascade close interrupted, retrying");
                }
                Err(e) => {
                    error!(request_id = %request.id, error = %e, "cascade close failed");
                    return Err(e);
                }
            }
        }
    }

    async fn cascade_once(
        &self,
        request: &Request,
        cascade: &CascadeClose,
        notifications: &mut Vec<NotificationIntent>,
    ) -> Result<()> {
        let siblings = self.responses.find_by_request(&cascade.request_id).await?;
        let closed = self.engine.cascade_close(request, cascade, siblings)?;
        for (response, notification) in closed.responses.into_iter().zip(closed.notifications) {
            let expected = response.version;
            match self.responses.save_if(response, expected).await {
                Ok(_) => notifications.push(notification),
                // Closed by a concurrent cascade, which notifies the seller itself.
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// One delivery attempt per notification. Failures become warnings.
    async fn dispatch(&self, notifications: Vec<NotificationIntent>) -> Vec<DeliveryWarning> {
        let mut warnings = Vec::new();
        for notification in notifications {
            if let Err(e) = self.notifier.notify(&notification).await {
                warn!(
                    recipient = %notification.recipient,
                    kind = %notification.kind,
                    error = %e,
                    "notification delivery failed"
                );
                warnings.push(DeliveryWarning {
                    recipient: notification.recipient,
                    kind: notification.kind,
                    reason: e.to_string(),
                });
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Notifier, RequestStore, ResponseStore};
    use crate::domain::request::GeoPoint;
    use crate::domain::response::ResponseStatus;
    use crate::infrastructure::in_memory::{InMemoryRequestStore, InMemoryResponseStore};
    use crate::infrastructure::system::{SystemClock, TracingNotifier};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Loses the first `failures` conditional writes as if another writer got there first.
    struct ContendedRequestStore {
        inner: InMemoryRequestStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl RequestStore for ContendedRequestStore {
        async fn save(&self, request: Request) -> Result<()> {
            self.inner.save(request).await
        }

        async fn save_if(&self, request: Request, expected_version: u64) -> Result<Request> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(NegotiationError::Conflict(request.id));
            }
            self.inner.save_if(request, expected_version).await
        }

        async fn get(&self, id: &RequestId) -> Result<Option<Request>> {
            self.inner.get(id).await
        }

        async fn all(&self) -> Result<Vec<Request>> {
            self.inner.all().await
        }
    }

    /// Fails the next writes of selected offers.
    #[derive(Clone, Default)]
    struct FlakyResponseStore {
        inner: InMemoryResponseStore,
        failures: Arc<std::sync::Mutex<HashMap<ResponseId, u32>>>,
    }

    impl FlakyResponseStore {
        fn fail_next(&self, id: &ResponseId, times: u32) {
            self.failures.lock().unwrap().insert(id.clone(), times);
        }

        fn trip(&self, id: &ResponseId) -> Result<()> {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(id) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(NegotiationError::Storage("disk busy".to_string()))
                }
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl ResponseStore for FlakyResponseStore {
        async fn save(&self, response: Response) -> Result<()> {
            self.trip(&response.id)?;
            self.inner.save(response).await
        }

        async fn save_if(&self, response: Response, expected_version: u64) -> Result<Response> {
            self.trip(&response.id)?;
            self.inner.save_if(response, expected_version).await
        }

        async fn get(&self, id: &ResponseId) -> Result<Option<Response>> {
            self.inner.get(id).await
        }

        async fn find_by_request(&self, request_id: &RequestId) -> Result<Vec<Response>> {
            self.inner.find_by_request(request_id).await
        }
    }

    struct BrokenNotifier;

    #[async_trait]
    impl Notifier for BrokenNotifier {
        async fn notify(&self, notification: &NotificationIntent) -> Result<()> {
            Err(NegotiationError::Notification(format!(
                "no device registered for {}",
                notification.recipient
            )))
        }
    }

    fn new_request() -> NewRequest {
        NewRequest {
            id: Some(RequestId::new("r-1")),
            owner_id: UserId::new("alice"),
            item_name: "drill".to_string(),
            location: GeoPoint::default(),
            expire_date: None,
            description: None,
            rental: true,
            category: None,
        }
    }

    fn details(message: Option<&str>) -> OfferDetails {
        OfferDetails {
            offer_price: dec!(8),
            price_type: "PER_DAY".to_string(),
            message: message.map(str::to_string),
            ..Default::default()
        }
    }

    fn accept() -> OfferUpdate {
        OfferUpdate {
            seller_status: Some("ACCEPTED".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_conflicting_write_is_retried() {
        let service = OfferService::new(
            Box::new(ContendedRequestStore {
                inner: InMemoryRequestStore::new(),
                failures: AtomicU32::new(2),
            }),
            Box::new(InMemoryResponseStore::new()),
            Box::new(TracingNotifier),
            Box::new(SystemClock),
        );
        let request = service.post_request(new_request()).await.unwrap();
        let receipt = service
            .create_offer(&request.id, &UserId::new("bob"), details(None))
            .await
            .unwrap();

        assert_eq!(service.offers_for(&request.id).await.unwrap().len(), 1);
        assert_eq!(receipt.value.response_status(), ResponseStatus::Pending);
        // One write stages the offer, a second one clears it once applied.
        let request = service.request(&request.id).await.unwrap();
        assert_eq!(request.version, 2);
        assert!(request.staged_offers().is_empty());
        assert_eq!(service.offer(&receipt.value.id).await.unwrap(), receipt.value);
    }

    #[tokio::test]
    async fn test_conflict_budget_is_bounded() {
        let service = OfferService::with_config(
            Box::new(ContendedRequestStore {
                inner: InMemoryRequestStore::new(),
                failures: AtomicU32::new(10),
            }),
            Box::new(InMemoryResponseStore::new()),
            Box::new(TracingNotifier),
            Box::new(SystemClock),
            EngineConfig::new(2, 1),
        );
        let request = service.post_request(new_request()).await.unwrap();
        let err = service
            .create_offer(&request.id, &UserId::new("bob"), details(None))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(service.offers_for(&request.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notification_failure_is_a_warning() {
        let service = OfferService::new(
            Box::new(InMemoryRequestStore::new()),
            Box::new(InMemoryResponseStore::new()),
            Box::new(BrokenNotifier),
            Box::new(SystemClock),
        );
        let request = service.post_request(new_request()).await.unwrap();
        let receipt = service
            .create_offer(&request.id, &UserId::new("bob"), details(Some("hello")))
            .await
            .unwrap();

        assert_eq!(receipt.warnings.len(), 1);
        assert_eq!(receipt.warnings[0].recipient, UserId::new("alice"));
        assert_eq!(receipt.warnings[0].kind, NotificationKind::NewMessage);
        // The offer is committed regardless.
        let stored = service.offer(&receipt.value.id).await.unwrap();
        assert_eq!(stored.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_cascade_survives_transient_write_failures() {
        let responses = FlakyResponseStore::default();
        let service = OfferService::new(
            Box::new(InMemoryRequestStore::new()),
            Box::new(responses.clone()),
            Box::new(TracingNotifier),
            Box::new(SystemClock),
        );
        let request = service.post_request(new_request()).await.unwrap();
        let o1 = service
            .create_offer(&request.id, &UserId::new("bob"), details(None))
            .await
            .unwrap()
            .value;
        let o2 = service
            .create_offer(&request.id, &UserId::new("carol"), details(None))
            .await
            .unwrap()
            .value;

        // The winner write loses two of its three attempts, the first cascade pass loses one.
        responses.fail_next(&o1.id, 2);
        responses.fail_next(&o2.id, 1);
        service
            .update_offer(&o1.id, &UserId::new("bob"), accept())
            .await
            .unwrap();

        let winner = service.offer(&o1.id).await.unwrap();
        let loser = service.offer(&o2.id).await.unwrap();
        assert_eq!(winner.response_status(), ResponseStatus::Accepted);
        assert_eq!(loser.response_status(), ResponseStatus::Closed);
    }

    #[tokio::test]
    async fn test_staged_offer_write_is_finished_by_the_next_reader() {
        let responses = FlakyResponseStore::default();
        let service = OfferService::with_config(
            Box::new(InMemoryRequestStore::new()),
            Box::new(responses.clone()),
            Box::new(TracingNotifier),
            Box::new(SystemClock),
            EngineConfig::new(5, 1),
        );
        let request = service.post_request(new_request()).await.unwrap();
        let o1 = service
            .create_offer(&request.id, &UserId::new("bob"), details(None))
            .await
            .unwrap()
            .value;
        let o2 = service
            .create_offer(&request.id, &UserId::new("carol"), details(None))
            .await
            .unwrap()
            .value;

        // The acceptance is committed on the request but its offer write fails.
        responses.fail_next(&o1.id, 1);
        let err = service
            .update_offer(&o1.id, &UserId::new("bob"), accept())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Storage(_)));
        let stored = service.request(&request.id).await.unwrap();
        assert_eq!(stored.staged_offers().len(), 1);
        assert_eq!(
            service.offer(&o1.id).await.unwrap().response_status(),
            ResponseStatus::Pending
        );

        // The next caller applies it and the cascade before deciding.
        let err = service
            .create_offer(&request.id, &UserId::new("dave"), details(None))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::BadRequest(_)));
        assert_eq!(
            service.offer(&o1.id).await.unwrap().response_status(),
            ResponseStatus::Accepted
        );
        assert_eq!(
            service.offer(&o2.id).await.unwrap().response_status(),
            ResponseStatus::Closed
        );
        assert!(service.request(&request.id).await.unwrap().staged_offers().is_empty());
    }

    #[tokio::test]
    async fn test_requests_by_owner() {
        let service = OfferService::new(
            Box::new(InMemoryRequestStore::new()),
            Box::new(InMemoryResponseStore::new()),
            Box::new(TracingNotifier),
            Box::new(SystemClock),
        );
        service.post_request(new_request()).await.unwrap();
        service
            .post_request(NewRequest {
                id: Some(RequestId::new("r-2")),
                owner_id: UserId::new("dave"),
                ..new_request()
            })
            .await
            .unwrap();
        service
            .post_request(NewRequest {
                id: Some(RequestId::new("r-3")),
                ..new_request()
            })
            .await
            .unwrap();

        let mine = service.requests_by_owner(&UserId::new("alice")).await.unwrap();
        let ids: Vec<_> = mine.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r-1", "r-3"]);
        assert!(
            service
                .requests_by_owner(&UserId::new("nobody"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_rejected() {
        let service = OfferService::new(
            Box::new(InMemoryRequestStore::new()),
            Box::new(InMemoryResponseStore::new()),
            Box::new(TracingNotifier),
            Box::new(SystemClock),
        );
        service.post_request(new_request()).await.unwrap();
        let err = service.post_request(new_request()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_unknown_entities() {
        let service = OfferService::new(
            Box::new(InMemoryRequestStore::new()),
            Box::new(InMemoryResponseStore::new()),
            Box::new(TracingNotifier),
            Box::new(SystemClock),
        );
        let err = service
            .create_offer(&RequestId::new("nope"), &UserId::new("bob"), details(None))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::NotFound { entity: "Request", .. }));

        let err = service
            .update_offer(&ResponseId::new("nope"), &UserId::new("bob"), accept())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::NotFound { entity: "Response", .. }));
    }
}
