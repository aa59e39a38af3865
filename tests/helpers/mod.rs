//! In-memory stand-ins for the request store, blob store and generator.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use template_spreader::models::request::{ExtractionRequest, RequestStatus, RequestUpdate};
use template_spreader::services::generation::{
    GenerationClient, GenerationRequest, Generator, GeneratorError,
};
use template_spreader::services::orchestrator::JobOrchestrator;
use template_spreader::services::request_store::{RequestStore, StoreError};
use template_spreader::services::storage::{BlobStore, StorageError};
use template_spreader::services::template::SchemaOptions;

/// Request records plus the sequence of statuses each one passed through.
#[derive(Default)]
pub struct MemoryRequestStore {
    requests: Mutex<HashMap<Uuid, ExtractionRequest>>,
    history: Mutex<HashMap<Uuid, Vec<RequestStatus>>>,
    fail_updates: AtomicBool,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: ExtractionRequest) {
        self.history
            .lock()
            .unwrap()
            .insert(request.id, vec![request.status]);
        self.requests.lock().unwrap().insert(request.id, request);
    }

    pub fn request(&self, id: Uuid) -> ExtractionRequest {
        self.requests
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .expect("request exists")
    }

    pub fn history(&self, id: Uuid) -> Vec<RequestStatus> {
        self.history
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes every later `update` fail as if the database were down.
    pub fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }

    pub fn restore_updates(&self) {
        self.fail_updates.store(false, Ordering::SeqCst);
    }

    /// Moves the request's claim time `age` into the past.
    pub fn backdate_claim(&self, id: Uuid, age: Duration) {
        let mut requests = self.requests.lock().unwrap();
        let request = requests.get_mut(&id).expect("request exists");
        let age = chrono::Duration::from_std(age).unwrap();
        request.processing_started_at = Some(Utc::now() - age);
    }

    fn record(&self, id: Uuid, status: RequestStatus) {
        self.history
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .push(status);
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn get(&self, request_id: Uuid) -> Result<Option<ExtractionRequest>, StoreError> {
        Ok(self.requests.lock().unwrap().get(&request_id).cloned())
    }

    async fn update(&self, request_id: Uuid, update: RequestUpdate) -> Result<(), StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut requests = self.requests.lock().unwrap();
        let request = requests
            .get_mut(&request_id)
            .ok_or(StoreError::RequestNotFound(request_id))?;
        update.apply_to(request);
        drop(requests);
        if let Some(status) = update.status {
            self.record(request_id, status);
        }
        Ok(())
    }

    async fn claim(&self, request_id: Uuid) -> Result<Option<ExtractionRequest>, StoreError> {
        let mut requests = self.requests.lock().unwrap();
        let claimed = match requests.get_mut(&request_id) {
            Some(request) if request.status == RequestStatus::Pending => {
                request.status = RequestStatus::Processing;
                request.processing_started_at = Some(Utc::now());
                Some(request.clone())
            }
            _ => None,
        };
        drop(requests);
        if claimed.is_some() {
            self.record(request_id, RequestStatus::Processing);
        }
        Ok(claimed)
    }

    async fn reset(
        &self,
        request_id: Uuid,
        lease: Duration,
    ) -> Result<Option<ExtractionRequest>, StoreError> {
        let mut requests = self.requests.lock().unwrap();
        let reset = match requests.get_mut(&request_id) {
            Some(request) if request.can_reset(Utc::now(), lease) => {
                RequestUpdate::reset().apply_to(request);
                Some(request.clone())
            }
            _ => None,
        };
        drop(requests);
        if reset.is_some() {
            self.record(request_id, RequestStatus::Pending);
        }
        Ok(reset)
    }
}

/// Blob store over a map, logging every read.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    reads: Mutex<Vec<String>>,
    broken: Mutex<Option<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(path.to_string(), bytes);
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }

    /// Reads of `path` fail with a server error instead of returning data.
    pub fn break_path(&self, path: &str) {
        *self.broken.lock().unwrap() = Some(path.to_string());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.reads.lock().unwrap().push(path.to_string());
        if self.broken.lock().unwrap().as_deref() == Some(path) {
            return Err(StorageError::Status {
                status: 503,
                path: path.to_string(),
            });
        }
        self.object(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn put(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<(), StorageError> {
        self.insert(path, bytes.to_vec());
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().unwrap().contains_key(path))
    }
}

/// One scripted generator reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Respond(String),
    Unreachable,
    /// Never answers; only a client timeout ends the call.
    Hang,
}

impl Reply {
    pub fn json(value: serde_json::Value) -> Self {
        Reply::Respond(value.to_string())
    }
}

/// Generator that replays a fixed script and records what it was asked.
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<GenerationRequest>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Respond(body)) => Ok(body),
            Some(Reply::Unreachable) => Err(GeneratorError::Status {
                status: 503,
                body: "overloaded".to_string(),
            }),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Err(GeneratorError::Timeout(Duration::from_secs(24 * 60 * 60)))
            }
            None => Err(GeneratorError::Status {
                status: 500,
                body: "script exhausted".to_string(),
            }),
        }
    }
}

pub const GENERATOR_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROCESSING_LEASE: Duration = Duration::from_secs(2 * 30 + 60);

pub fn client(generator: Arc<ScriptedGenerator>) -> GenerationClient {
    GenerationClient::new(generator, GENERATOR_TIMEOUT, 50_000)
}

/// Everything one pipeline test needs, wired the way the worker wires it.
pub struct Harness {
    pub requests: Arc<MemoryRequestStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub generator: Arc<ScriptedGenerator>,
    pub orchestrator: JobOrchestrator,
}

impl Harness {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        let requests = Arc::new(MemoryRequestStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let generator = ScriptedGenerator::new(replies);
        let orchestrator = JobOrchestrator::new(
            requests.clone(),
            blobs.clone(),
            client(generator.clone()),
            SchemaOptions::default(),
        );
        Self {
            requests,
            blobs,
            generator,
            orchestrator,
        }
    }

    /// Uploads a template and documents and records a pending request for them.
    pub fn submit(&self, template: Vec<u8>, documents: Vec<(&str, Vec<u8>)>) -> Uuid {
        let mut request = ExtractionRequest::new("owner-1", "", Vec::new());
        let id = request.id;
        request.template_blob = format!("{id}/template.xlsx");
        self.blobs.insert(&request.template_blob, template);
        for (i, (name, bytes)) in documents.into_iter().enumerate() {
            let path = format!("{id}/pdf_{i}_{name}");
            self.blobs.insert(&path, bytes);
            request.document_blobs.push(path);
        }
        self.requests.insert(request);
        id
    }
}
