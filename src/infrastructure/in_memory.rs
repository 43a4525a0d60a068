use crate::domain::ports::{RequestStore, ResponseStore};
use crate::domain::request::{Request, RequestId};
use crate::domain::response::{Response, ResponseId};
use crate::error::{NegotiationError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for requests.
///
/// Uses `Arc<RwLock<HashMap<RequestId, Request>>>`; clones share the same map, so several
/// services can be pointed at one store.
#[derive(Default, Clone)]
pub struct InMemoryRequestStore {
    requests: Arc<RwLock<HashMap<RequestId, Request>>>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn save(&self, request: Request) -> Result<()> {
        let mut requests = self.requests.write().await;
        requests.insert(request.id.clone(), request);
        Ok(())
    }

    async fn save_if(&self, mut request: Request, expected_version: u64) -> Result<Request> {
        let mut requests = self.requests.write().await;
        let current = requests
            .get(&request.id)
            .ok_or_else(|| NegotiationError::not_found("Request", &request.id))?;
        if current.version != expected_version {
            return Err(NegotiationError::Conflict(request.id));
        }
        request.version = expected_version + 1;
        requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn get(&self, id: &RequestId) -> Result<Option<Request>> {
        let requests = self.requests.read().await;
        Ok(requests.get(id).cloned())
    }

    async fn all(&self) -> Result<Vec<Request>> {
        let requests = self.requests.read().await;
        let mut all: Vec<Request> = requests.values().cloned().collect();
        all.sort_by(|a, b| a.post_date.cmp(&b.post_date).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }
}

#[derive(Default)]
struct ResponseTable {
    responses: HashMap<ResponseId, Response>,
    by_request: HashMap<RequestId, HashSet<ResponseId>>,
}

/// A thread-safe in-memory store for offers, indexed by owning request so that
/// `find_by_request` never scans unrelated offers.
#[derive(Default, Clone)]
pub struct InMemoryResponseStore {
    table: Arc<RwLock<ResponseTable>>,
}

impl InMemoryResponseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseTable {
    fn insert(&mut self, response: Response) {
        self.by_request
            .entry(response.request_id.clone())
            .or_default()
            .insert(response.id.clone());
        self.responses.insert(response.id.clone(), response);
    }
}

#[async_trait]
impl ResponseStore for InMemoryResponseStore {
    async fn save(&self, response: Response) -> Result<()> {
        let mut table = self.table.write().await;
        table.insert(response);
        Ok(())
    }

    async fn save_if(&self, mut response: Response, expected_version: u64) -> Result<Response> {
        let mut table = self.table.write().await;
        let current = table.responses.get(&response.id).map_or(0, |r| r.version);
        if current != expected_version {
            return Err(NegotiationError::Conflict(response.request_id));
        }
        response.version = expected_version + 1;
        table.insert(response.clone());
        Ok(response)
    }

    async fn get(&self, id: &ResponseId) -> Result<Option<Response>> {
        let table = self.table.read().await;
        Ok(table.responses.get(id).cloned())
    }

    async fn find_by_request(&self, request_id: &RequestId) -> Result<Vec<Response>> {
        let table = self.table.read().await;
        let mut found: Vec<Response> = table
            .by_request
            .get(request_id)
            .into_iter()
            .flatten()
            .filter_map(|id| table.responses.get(id).cloned())
            .collect();
        found.sort_by(|a, b| {
            b.response_time
                .cmp(&a.response_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(found)
    }
}
