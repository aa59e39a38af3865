use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::services::{queue::JobQueue, storage::BlobStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub storage: Arc<dyn BlobStore>,
    pub queue: Arc<JobQueue>,
    /// Age after which a `processing` request may be reset by a trigger.
    pub processing_lease: Duration,
}

impl AppState {
    pub fn new(
        db: PgPool,
        storage: Arc<dyn BlobStore>,
        queue: JobQueue,
        processing_lease: Duration,
    ) -> Self {
        Self {
            db,
            storage,
            queue: Arc::new(queue),
            processing_lease,
        }
    }
}
