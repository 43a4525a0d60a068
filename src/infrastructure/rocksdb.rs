use crate::domain::ports::{RequestStore, ResponseStore};
use crate::domain::request::{Request, RequestId};
use crate::domain::response::{Response, ResponseId};
use crate::error::{NegotiationError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for storing requests.
pub const CF_REQUESTS: &str = "requests";
/// Column Family for storing offers.
pub const CF_RESPONSES: &str = "responses";
/// Column Family indexing offers by owning request. Keys are `request_id \0 response_id`.
pub const CF_RESPONSES_BY_REQUEST: &str = "responses_by_request";

const INDEX_SEPARATOR: u8 = 0;

/// A persistent store implementation using RocksDB.
///
/// Requests, offers and the request-to-offer index live in separate Column Families.
/// Conditional writes are serialized through one internal lock per entity so the version
/// check and the put happen as one step.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    request_writes: Arc<Mutex<()>>,
    response_writes: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [CF_REQUESTS, CF_RESPONSES, CF_RESPONSES_BY_REQUEST]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            request_writes: Arc::new(Mutex::new(())),
            response_writes: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| NegotiationError::Storage(format!("column family {name} not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_pinned_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_request(&self, request: &Request) -> Result<()> {
        let cf = self.cf(CF_REQUESTS)?;
        let value = serde_json::to_vec(request)?;
        self.db.put_cf(cf, request.id.as_str().as_bytes(), value)?;
        Ok(())
    }

    /// Writes the offer and its index entry in one batch.
    fn put_response(&self, response: &Response) -> Result<()> {
        let responses = self.cf(CF_RESPONSES)?;
        let index = self.cf(CF_RESPONSES_BY_REQUEST)?;

        let mut index_key = index_prefix(&response.request_id);
        index_key.extend_from_slice(response.id.as_str().as_bytes());
        let value = serde_json::to_vec(response)?;

        let mut batch = rocksdb::WriteBatch::default();
        batch.put_cf(responses, response.id.as_str().as_bytes(), value);
        batch.put_cf(index, index_key, b"");
        self.db.write(batch)?;
        Ok(())
    }
}

fn index_prefix(request_id: &RequestId) -> Vec<u8> {
    let mut prefix = request_id.as_str().as_bytes().to_vec();
    prefix.push(INDEX_SEPARATOR);
    prefix
}

#[async_trait]
impl RequestStore for RocksDBStore {
    async fn save(&self, request: Request) -> Result<()> {
        let _guard = self.request_writes.lock().await;
        self.put_request(&request)
    }

    async fn save_if(&self, mut request: Request, expected_version: u64) -> Result<Request> {
        let _guard = self.request_writes.lock().await;
        let current: Request = self
            .read(CF_REQUESTS, request.id.as_str().as_bytes())?
            .ok_or_else(|| NegotiationError::not_found("Request", &request.id))?;
        if current.version != expected_version {
            return Err(NegotiationError::Conflict(request.id));
        }
        request.version = expected_version + 1;
        self.put_request(&request)?;
        Ok(request)
    }

    async fn get(&self, id: &RequestId) -> Result<Option<Request>> {
        self.read(CF_REQUESTS, id.as_str().as_bytes())
    }

    async fn all(&self) -> Result<Vec<Request>> {
        let cf = self.cf(CF_REQUESTS)?;
        let mut requests = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            requests.push(serde_json::from_slice::<Request>(&value)?);
        }
        requests.sort_by(|a, b| a.post_date.cmp(&b.post_date).then_with(|| a.id.cmp(&b.id)));
        Ok(requests)
    }
}

#[async_trait]
impl ResponseStore for RocksDBStore {
    async fn save(&self, response: Response) -> Result<()> {
        let _guard = self.response_writes.lock().await;
        self.put_response(&response)
    }

    async fn save_if(&self, mut response: Response, expected_version: u64) -> Result<Response> {
        let _guard = self.response_writes.lock().await;
        let current = self
            .read::<Response>(CF_RESPONSES, response.id.as_str().as_bytes())?
            .map_or(0, |stored| stored.version);
        if current != expected_version {
            return Err(NegotiationError::Conflict(response.request_id));
        }
        response.version = expected_version + 1;
        self.put_response(&response)?;
        Ok(response)
    }

    async fn get(&self, id: &ResponseId) -> Result<Option<Response>> {
        self.read(CF_RESPONSES, id.as_str().as_bytes())
    }

    async fn find_by_request(&self, request_id: &RequestId) -> Result<Vec<Response>> {
        let index = self.cf(CF_RESPONSES_BY_REQUEST)?;
        let prefix = index_prefix(request_id);

        let mut found = Vec::new();
        let iter = self
            .db
            .iterator_cf(index, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let response_key = &key[prefix.len()..];
            if let Some(response) = self.read::<Response>(CF_RESPONSES, response_key)? {
                found.push(response);
            }
        }
        found.sort_by(|a, b| {
            b.response_time
                .cmp(&a.response_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(found)
    }
}
