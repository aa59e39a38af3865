use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use uuid::Uuid;

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Object storage holding request inputs and outputs under `{request_id}/`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;
}

/// Output location of a request's populated spreadsheet.
pub fn solution_path(request_id: Uuid) -> String {
    format!("{request_id}/solution.xlsx")
}

/// Display name of an uploaded document: `7f../pdf_2_report.pdf` → `report.pdf`.
pub fn document_source_name(path: &str) -> &str {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.strip_prefix("pdf_")
        .and_then(|rest| rest.split_once('_'))
        .filter(|(index, _)| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
        .map_or(file, |(_, name)| name)
}

/// Client for an S3-compatible bucket (R2, MinIO, S3).
pub struct S3BlobStore {
    bucket: Box<Bucket>,
}

impl S3BlobStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .bucket
            .get_object(path)
            .await
            .map_err(|e| classify(e, path))?;
        check_status(response.status_code(), path)?;
        Ok(response.to_vec())
    }

    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(path, bytes, content_type)
            .await?;
        check_status(response.status_code(), path)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match self.bucket.head_object(path).await {
            Ok((_, status)) if status == 404 => Ok(false),
            Ok((_, status)) => check_status(status, path).map(|()| true),
            Err(e) => match classify(e, path) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}

fn classify(error: S3Error, path: &str) -> StorageError {
    match error {
        S3Error::HttpFailWithBody(404, _) => StorageError::NotFound(path.to_string()),
        other => StorageError::S3(other),
    }
}

fn check_status(status: u16, path: &str) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(path.to_string())),
        status => Err(StorageError::Status {
            status,
            path: path.to_string(),
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("S3 returned HTTP {status} for {path}")]
    Status { status: u16, path: String },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
