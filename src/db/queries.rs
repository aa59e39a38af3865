use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::models::extraction::{DocumentOutcome, ResultQuality};
use crate::models::request::{ExtractionRequest, RequestStatus, RequestUpdate};

const COLUMNS: &str = "id, owner_id, status, template_blob, document_blobs, output_blob, error, \
                       result_quality, document_outcomes, created_at, updated_at, \
                       processing_started_at";

/// Insert a new request record
pub async fn create_request(pool: &PgPool, request: &ExtractionRequest) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO extraction_requests
            (id, owner_id, status, template_blob, document_blobs, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(request.id)
    .bind(&request.owner_id)
    .bind(request.status.to_string())
    .bind(&request.template_blob)
    .bind(&request.document_blobs)
    .bind(request.created_at)
    .bind(request.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a request by ID
pub async fn get_request(
    pool: &PgPool,
    request_id: Uuid,
) -> Result<Option<ExtractionRequest>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM extraction_requests WHERE id = $1"
    ))
    .bind(request_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(request_from_row).transpose()
}

/// Apply a partial update. Returns false when the request does not exist.
pub async fn update_request(
    pool: &PgPool,
    request_id: Uuid,
    update: &RequestUpdate,
) -> Result<bool, sqlx::Error> {
    let mut query = QueryBuilder::<Postgres>::new("UPDATE extraction_requests SET updated_at = NOW()");

    if let Some(status) = update.status {
        query.push(", status = ").push_bind(status.to_string());
        match status {
            RequestStatus::Pending => {
                query.push(", processing_started_at = NULL, processing_completed_at = NULL");
            }
            RequestStatus::Processing => {
                query.push(", processing_started_at = NOW()");
            }
            RequestStatus::Completed | RequestStatus::Failed => {
                query.push(", processing_completed_at = NOW()");
            }
        }
    }
    if let Some(output_blob) = &update.output_blob {
        query.push(", output_blob = ").push_bind(output_blob.clone());
    }
    if let Some(error) = &update.error {
        query.push(", error = ").push_bind(error.clone());
    }
    if let Some(quality) = update.result_quality {
        query
            .push(", result_quality = ")
            .push_bind(quality.map(|q| q.to_string()));
    }
    if let Some(outcomes) = &update.document_outcomes {
        query
            .push(", document_outcomes = ")
            .push_bind(outcomes.clone().map(Json));
    }

    query.push(" WHERE id = ").push_bind(request_id);
    let result = query.build().execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

/// Atomically move a pending request to processing. `None` when the request is missing
/// or not pending.
pub async fn claim_request(
    pool: &PgPool,
    request_id: Uuid,
) -> Result<Option<ExtractionRequest>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE extraction_requests
        SET status = 'processing',
            processing_started_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status = 'pending'
        RETURNING {COLUMNS}
        "#
    ))
    .bind(request_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(request_from_row).transpose()
}

/// Return a request to pending, clearing the previous execution's results. Applies to
/// terminal requests and to `processing` requests claimed longer than `lease` ago.
/// `None` when the request is missing or in neither state.
pub async fn reset_request(
    pool: &PgPool,
    request_id: Uuid,
    lease: Duration,
) -> Result<Option<ExtractionRequest>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE extraction_requests
        SET status = 'pending',
            output_blob = NULL,
            error = NULL,
            result_quality = NULL,
            document_outcomes = NULL,
            processing_started_at = NULL,
            processing_completed_at = NULL,
            updated_at = NOW()
        WHERE id = $1
          AND (status IN ('completed', 'failed')
               OR (status = 'processing'
                   AND (processing_started_at IS NULL
                        OR processing_started_at < NOW() - make_interval(secs => $2))))
        RETURNING {COLUMNS}
        "#
    ))
    .bind(request_id)
    .bind(lease.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(request_from_row).transpose()
}

/// Number of requests per status (for the health endpoint)
pub async fn count_by_status(pool: &PgPool) -> Result<Vec<(String, i64)>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS count FROM extraction_requests GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| Ok((r.try_get("status")?, r.try_get("count")?)))
        .collect()
}

fn request_from_row(row: &PgRow) -> Result<ExtractionRequest, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let quality: Option<String> = row.try_get("result_quality")?;
    let outcomes: Option<Json<Vec<DocumentOutcome>>> = row.try_get("document_outcomes")?;

    Ok(ExtractionRequest {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        status: RequestStatus::from_str(&status).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        template_blob: row.try_get("template_blob")?,
        document_blobs: row.try_get("document_blobs")?,
        output_blob: row.try_get("output_blob")?,
        error: row.try_get("error")?,
        result_quality: quality
            .as_deref()
            .map(ResultQuality::from_str)
            .transpose()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        document_outcomes: outcomes.map(|Json(o)| o),
        processing_started_at: row.try_get("processing_started_at")?,
    })
}
