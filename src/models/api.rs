use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::extraction::{DocumentOutcome, ResultQuality};
use crate::models::request::{ExtractionRequest, RequestStatus};

/// Response after triggering processing of a request.
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub message: String,
}

/// Response for querying request status.
#[derive(Debug, Serialize)]
pub struct RequestStatusResponse {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub document_count: usize,
    pub has_output: bool,
    pub output_blob: Option<String>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_quality: Option<ResultQuality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_outcomes: Option<Vec<DocumentOutcome>>,
}

impl From<ExtractionRequest> for RequestStatusResponse {
    fn from(request: ExtractionRequest) -> Self {
        Self {
            request_id: request.id,
            status: request.status,
            created_at: request.created_at,
            updated_at: request.updated_at,
            document_count: request.document_blobs.len(),
            has_output: request.output_blob.is_some(),
            output_blob: request.output_blob,
            error: request.error,
            result_quality: request.result_quality,
            document_outcomes: request.document_outcomes,
        }
    }
}
