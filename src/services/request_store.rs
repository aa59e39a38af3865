use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::request::{ExtractionRequest, RequestUpdate};
use crate::services::storage::StorageError;

/// Persistent request records.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn get(&self, request_id: Uuid) -> Result<Option<ExtractionRequest>, StoreError>;

    /// Applies `update`; fails with [`StoreError::RequestNotFound`] for an unknown id.
    async fn update(&self, request_id: Uuid, update: RequestUpdate) -> Result<(), StoreError>;

    /// Moves a `pending` request to `processing` in one conditional write and returns it.
    /// `None` means another execution owns the request or it is not pending.
    async fn claim(&self, request_id: Uuid) -> Result<Option<ExtractionRequest>, StoreError>;

    /// Returns a finished request, or one whose processing lease expired, to `pending`
    /// in one conditional write. `None` when the request is missing or still owned.
    async fn reset(
        &self,
        request_id: Uuid,
        lease: Duration,
    ) -> Result<Option<ExtractionRequest>, StoreError>;
}

/// Request store backed by the `extraction_requests` table.
pub struct PgRequestStore {
    pool: PgPool,
}

impl PgRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestStore for PgRequestStore {
    async fn get(&self, request_id: Uuid) -> Result<Option<ExtractionRequest>, StoreError> {
        Ok(queries::get_request(&self.pool, request_id).await?)
    }

    async fn update(&self, request_id: Uuid, update: RequestUpdate) -> Result<(), StoreError> {
        if queries::update_request(&self.pool, request_id, &update).await? {
            Ok(())
        } else {
            Err(StoreError::RequestNotFound(request_id))
        }
    }

    async fn claim(&self, request_id: Uuid) -> Result<Option<ExtractionRequest>, StoreError> {
        Ok(queries::claim_request(&self.pool, request_id).await?)
    }

    async fn reset(
        &self,
        request_id: Uuid,
        lease: Duration,
    ) -> Result<Option<ExtractionRequest>, StoreError> {
        Ok(queries::reset_request(&self.pool, request_id, lease).await?)
    }
}

/// Request store or blob store I/O failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("blob storage error: {0}")]
    Blob(#[from] StorageError),

    #[error("request {0} not found")]
    RequestNotFound(Uuid),
}
