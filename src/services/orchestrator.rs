//! Request state machine: `pending → processing → completed | failed`.
//!
//! An execution starts by claiming the request; only the claimant writes to it afterwards.
//! Stages run strictly in order and the first fatal error moves the request to `failed`
//! with that error's message.

use std::sync::Arc;
use std::time::Instant;

use strum::Display;
use tokio::task::{spawn_blocking, JoinError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::extraction::{ExtractionResult, ResultQuality};
use crate::models::request::{ExtractionRequest, RequestUpdate};
use crate::services::documents::{extract_texts, DocumentInput, ExtractionError};
use crate::services::generation::{GenerationClient, GenerationError};
use crate::services::populate::{populate, PopulationError};
use crate::services::request_store::{RequestStore, StoreError};
use crate::services::storage::{
    document_source_name, solution_path, BlobStore, StorageError, XLSX_CONTENT_TYPE,
};
use crate::services::template::{extract_schema, ParseError, SchemaOptions};

/// Pipeline stage an execution is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Claim,
    Template,
    Documents,
    Generation,
    Population,
    Persistence,
}

/// State threaded through the stages of one execution.
#[derive(Debug)]
pub struct JobContext {
    pub request_id: Uuid,
    pub request: ExtractionRequest,
    pub stage: Stage,
    started: Instant,
}

impl JobContext {
    fn new(request: ExtractionRequest) -> Self {
        Self {
            request_id: request.id,
            request,
            stage: Stage::Claim,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        info!(request_id = %self.request_id, stage = %stage, "Entering stage");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Population(#[from] PopulationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("background task failed: {0}")]
    Task(#[from] JoinError),
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        output_blob: String,
        quality: ResultQuality,
    },
    Failed {
        stage: Stage,
        message: String,
    },
    /// The request was missing or not pending; nothing was written.
    Skipped,
}

/// Runs extraction requests end to end.
pub struct JobOrchestrator {
    requests: Arc<dyn RequestStore>,
    blobs: Arc<dyn BlobStore>,
    generation: GenerationClient,
    schema_options: SchemaOptions,
}

impl JobOrchestrator {
    pub fn new(
        requests: Arc<dyn RequestStore>,
        blobs: Arc<dyn BlobStore>,
        generation: GenerationClient,
        schema_options: SchemaOptions,
    ) -> Self {
        Self {
            requests,
            blobs,
            generation,
            schema_options,
        }
    }

    /// Executes one request. Returns `Err` only when the request store could not be
    /// reached to claim the request or to record its failure.
    pub async fn run(&self, request_id: Uuid) -> Result<RunOutcome, PipelineError> {
        let Some(request) = self.requests.claim(request_id).await? else {
            info!(%request_id, "Request is not pending, skipping");
            return Ok(RunOutcome::Skipped);
        };

        let mut ctx = JobContext::new(request);
        info!(
            %request_id,
            documents = ctx.request.document_blobs.len(),
            "Processing extraction request"
        );

        match self.execute(&mut ctx).await {
            Ok((output_blob, quality)) => {
                let elapsed = ctx.started.elapsed();
                metrics::histogram!("extraction_processing_seconds").record(elapsed.as_secs_f64());
                metrics::counter!("extraction_jobs_completed").increment(1);
                info!(
                    %request_id,
                    output_blob = %output_blob,
                    quality = %quality,
                    duration_ms = elapsed.as_millis() as u64,
                    "Extraction request completed"
                );
                Ok(RunOutcome::Completed {
                    output_blob,
                    quality,
                })
            }
            Err(e) => {
                let message = e.to_string();
                metrics::counter!("extraction_jobs_failed", "stage" => ctx.stage.to_string())
                    .increment(1);
                error!(
                    %request_id,
                    stage = %ctx.stage,
                    error = %message,
                    "Extraction request failed"
                );

                if let Err(record) = self
                    .requests
                    .update(request_id, RequestUpdate::failed(message.clone()))
                    .await
                {
                    error!(
                        %request_id,
                        error = %record,
                        "Failed to record request failure"
                    );
                    return Err(record.into());
                }

                Ok(RunOutcome::Failed {
                    stage: ctx.stage,
                    message,
                })
            }
        }
    }

    async fn execute(
        &self,
        ctx: &mut JobContext,
    ) -> Result<(String, ResultQuality), PipelineError> {
        ctx.enter(Stage::Template);
        let template = match self.blobs.get(&ctx.request.template_blob).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(path)) => return Err(ParseError::Missing(path).into()),
            Err(e) => return Err(StoreError::from(e).into()),
        };
        let options = self.schema_options.clone();
        let (template, schema) = spawn_blocking(move || {
            let schema = extract_schema(&template, &options);
            (template, schema)
        })
        .await?;
        let schema = schema?;
        info!(request_id = %ctx.request_id, cells = schema.len(), "Template schema extracted");

        ctx.enter(Stage::Documents);
        let inputs = self.load_documents(ctx).await?;
        let text = spawn_blocking(move || extract_texts(&inputs)).await??;
        let failed = text.failed_count();
        if failed > 0 {
            metrics::counter!("extraction_documents_failed").increment(failed as u64);
        }
        info!(
            request_id = %ctx.request_id,
            documents = text.documents.len(),
            failed,
            "Document text extracted"
        );

        ctx.enter(Stage::Generation);
        let result = if schema.is_empty() {
            info!(request_id = %ctx.request_id, "Template has no data cells, skipping generation");
            ExtractionResult::empty()
        } else {
            self.generation.fill(&schema, &text).await?
        };
        if result.is_degraded() {
            metrics::counter!("extraction_jobs_degraded").increment(1);
            warn!(request_id = %ctx.request_id, "Completing with placeholder values");
        }
        let quality = result.quality;

        ctx.enter(Stage::Population);
        let output = spawn_blocking(move || populate(&template, &schema, &result)).await??;

        ctx.enter(Stage::Persistence);
        let output_blob = solution_path(ctx.request_id);
        self.blobs
            .put(&output_blob, &output, XLSX_CONTENT_TYPE)
            .await
            .map_err(StoreError::from)?;
        self.requests
            .update(
                ctx.request_id,
                RequestUpdate::completed(output_blob.clone(), quality, text.outcomes()),
            )
            .await?;

        Ok((output_blob, quality))
    }

    /// Fetches every document blob in order. A missing blob becomes a failed document;
    /// any other storage error is fatal.
    async fn load_documents(&self, ctx: &JobContext) -> Result<Vec<DocumentInput>, StoreError> {
        let mut inputs = Vec::with_capacity(ctx.request.document_blobs.len());
        for path in &ctx.request.document_blobs {
            let name = document_source_name(path);
            match self.blobs.get(path).await {
                Ok(bytes) => inputs.push(DocumentInput::new(name, bytes)),
                Err(StorageError::NotFound(_)) => {
                    warn!(request_id = %ctx.request_id, path = %path, "Document blob missing");
                    inputs.push(DocumentInput::missing(name));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(inputs)
    }
}
