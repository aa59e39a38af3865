use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::extraction::{DocumentOutcome, ResultQuality};

/// Lifecycle status of an extraction request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

/// A template-spreading request as recorded by the upload API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub id: Uuid,
    pub owner_id: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub template_blob: String,
    pub document_blobs: Vec<String>,
    pub output_blob: Option<String>,
    pub error: Option<String>,
    pub result_quality: Option<ResultQuality>,
    pub document_outcomes: Option<Vec<DocumentOutcome>>,
    /// When the current execution claimed the request; set only while `processing`.
    pub processing_started_at: Option<DateTime<Utc>>,
}

impl ExtractionRequest {
    /// A freshly uploaded request in the `pending` state.
    pub fn new(
        owner_id: impl Into<String>,
        template_blob: impl Into<String>,
        document_blobs: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            template_blob: template_blob.into(),
            document_blobs,
            output_blob: None,
            error: None,
            result_quality: None,
            document_outcomes: None,
            processing_started_at: None,
        }
    }

    /// A `processing` request whose execution has held it for longer than `lease`.
    /// The execution is presumed dead: its worker was killed, or it could not record
    /// its outcome.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        if self.status != RequestStatus::Processing {
            return false;
        }
        match self.processing_started_at {
            Some(started) => (now - started).to_std().is_ok_and(|held| held > lease),
            None => true,
        }
    }

    /// Whether a trigger may reset the request to `pending` for a fresh execution.
    pub fn can_reset(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.status.is_terminal() || self.lease_expired(now, lease)
    }
}

/// Partial update applied to a request record. `None` leaves a field untouched;
/// for nullable columns `Some(None)` clears the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestUpdate {
    pub status: Option<RequestStatus>,
    pub output_blob: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub result_quality: Option<Option<ResultQuality>>,
    pub document_outcomes: Option<Option<Vec<DocumentOutcome>>>,
}

impl RequestUpdate {
    /// Terminal success: status, output path and diagnostics land in one write so the
    /// output reference never exists outside the `completed` state.
    pub fn completed(
        output_blob: String,
        quality: ResultQuality,
        outcomes: Vec<DocumentOutcome>,
    ) -> Self {
        Self {
            status: Some(RequestStatus::Completed),
            output_blob: Some(Some(output_blob)),
            error: Some(None),
            result_quality: Some(Some(quality)),
            document_outcomes: Some(Some(outcomes)),
        }
    }

    /// Back to `pending` with the previous execution's results cleared.
    pub fn reset() -> Self {
        Self {
            status: Some(RequestStatus::Pending),
            output_blob: Some(None),
            error: Some(None),
            result_quality: Some(None),
            document_outcomes: Some(None),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(RequestStatus::Failed),
            output_blob: Some(None),
            error: Some(Some(message.into())),
            ..Self::default()
        }
    }

    /// Applies the update to an in-memory record.
    pub fn apply_to(&self, request: &mut ExtractionRequest) {
        if let Some(status) = self.status {
            request.status = status;
            request.processing_started_at = match status {
                RequestStatus::Processing => Some(Utc::now()),
                _ => None,
            };
        }
        if let Some(output) = &self.output_blob {
            request.output_blob = output.clone();
        }
        if let Some(error) = &self.error {
            request.error = error.clone();
        }
        if let Some(quality) = self.result_quality {
            request.result_quality = quality;
        }
        if let Some(outcomes) = &self.document_outcomes {
            request.document_outcomes = outcomes.clone();
        }
        request.updated_at = Utc::now();
    }
}
