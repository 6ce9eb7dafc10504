//! HTTP fetch utilities + the remote record store seam for jobtrack.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use jobtrack_core::{RecordField, RecordFilter, RecordHandle, RecordPatch, StoredRecord};
pub use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod memory;
pub mod notion;

pub use memory::{MemoryStore, StoreOp};
pub use notion::{NotionConfig, NotionStore};

pub const CRATE_NAME: &str = "jobtrack-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

/// Single-shot GET client. Failures surface immediately; nothing is retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);

        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");

            Ok(FetchedResponse {
                status,
                final_url,
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("credential rejected by remote store (HTTP {status}): {message}")]
    Unauthorized { status: u16, message: String },
    #[error("remote store API error {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("request to remote store failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected remote store response: {0}")]
    Decode(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidCredential(_) | StoreError::Unauthorized { .. }
        )
    }
}

/// The capability set the reconciler needs from a remote table.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Cheap authenticated call used to fail fast before any fetch.
    async fn verify_access(&self) -> Result<(), StoreError>;

    /// Columns the table is missing or has with the wrong type.
    async fn missing_fields(&self) -> Result<Vec<RecordField>, StoreError> {
        Ok(Vec::new())
    }

    async fn query_records(
        &self,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    async fn create_record(&self, patch: &RecordPatch) -> Result<RecordHandle, StoreError>;

    async fn update_record(
        &self,
        handle: &RecordHandle,
        patch: &RecordPatch,
    ) -> Result<(), StoreError>;
}
