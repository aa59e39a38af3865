use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::api::{RequestStatusResponse, TriggerResponse};
use crate::models::request::RequestStatus;
use crate::services::queue::QueuedJob;

/// GET /api/v1/requests/{request_id}: Current state of an extraction request.
pub async fn get_request_status(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<RequestStatusResponse>, StatusCode> {
    let request = queries::get_request(&state.db, request_id)
        .await
        .map_err(|e| {
            tracing::error!(%request_id, error = %e, "Failed to load request");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(request.into()))
}

/// POST /api/v1/requests/{request_id}/trigger: Queue a request for processing.
///
/// A request that already finished is reset to `pending` first, so a re-trigger starts a
/// fresh execution. A request that is being processed is left alone until its processing
/// lease expires; after that it is treated as abandoned and reset as well.
pub async fn trigger_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> Result<(StatusCode, Json<TriggerResponse>), StatusCode> {
    let request = queries::get_request(&state.db, request_id)
        .await
        .map_err(|e| {
            tracing::error!(%request_id, error = %e, "Failed to load request");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let abandoned = request.lease_expired(Utc::now(), state.processing_lease);
    if request.status == RequestStatus::Processing && !abandoned {
        return Err(StatusCode::CONFLICT);
    }

    let template_uploaded = state
        .storage
        .exists(&request.template_blob)
        .await
        .map_err(|e| {
            tracing::error!(%request_id, error = %e, "Failed to check template blob");
            StatusCode::BAD_GATEWAY
        })?;
    if !template_uploaded {
        tracing::warn!(%request_id, template = %request.template_blob, "Template not uploaded");
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    if request.status != RequestStatus::Pending {
        queries::reset_request(&state.db, request_id, state.processing_lease)
            .await
            .map_err(|e| {
                tracing::error!(%request_id, error = %e, "Failed to reset request");
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            // Another trigger got there first.
            .ok_or(StatusCode::CONFLICT)?;
        if abandoned {
            tracing::warn!(
                %request_id,
                started_at = ?request.processing_started_at,
                "Processing lease expired, resetting abandoned request"
            );
        }
        tracing::info!(%request_id, previous = %request.status, "Request reset for re-run");
    }

    state
        .queue
        .enqueue(&QueuedJob { request_id })
        .await
        .map_err(|e| {
            tracing::error!(%request_id, error = %e, "Failed to enqueue request");
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    metrics::counter!("extraction_requests_triggered").increment(1);
    tracing::info!(%request_id, "Request queued for processing");

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            request_id,
            status: RequestStatus::Pending,
            message: "Request queued for processing".to_string(),
        }),
    ))
}
