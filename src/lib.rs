use std::env;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod editor;
pub mod flag;
pub mod format;
pub mod reconcile;
pub mod store;
pub mod tracker;
mod tests;

pub use crate::editor::{Editor, EditorState};
pub use crate::reconcile::{EntityDeleted, OpFailure, Reconciler, SaveOutcome, Target, TargetKind};
pub use crate::store::{MemoryStore, Store};
pub use crate::tracker::WorkingCopy;

use crate::flag::{EditorData, EntityKind};
use crate::format::{FlagInput, RuleInput, VariantInput};
use crate::store::FlagSummary;

const BASE_URL: &str = "http://localhost:8080/admin";
const MAX_RETRIES: u32 = 3;
const TIMEOUT_SECS: u64 = 10;

/// A single failed call against the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Referential constraint: {0}")]
    ReferentialConstraint(String),

    #[error("API error: {0}")]
    ApiError(String),
}

#[derive(Debug, Error)]
pub enum EditorError {
    #[error("Failed to load flag: {0}")]
    FetchError(#[source] StoreError),

    #[error("Invalid {target}: {message}")]
    ValidationError { target: Target, message: String },

    #[error("Variant {variant_id} is still used by {referenced_by}")]
    ReferentialConstraintError { variant_id: String, referenced_by: Target },

    #[error("Save failed: {}", .0.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "))]
    SaveFailed(Vec<OpFailure>),

    #[error("Failed to delete flag: {0}")]
    DeleteFailed(#[source] StoreError),

    #[error("Not allowed while editor is {0:?}")]
    InvalidState(EditorState),

    #[error("Unknown {kind} {id}")]
    UnknownEntity { kind: EntityKind, id: String },
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// HTTP client for the flag admin API.
pub struct Client {
    base_url: String,
    http_client: reqwest::Client,
    max_retries: u32,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn debug_info(&self) -> String {
        format!(
            "Client {{ base_url: {}, max_retries: {} }}",
            self.base_url, self.max_retries
        )
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", HeaderValue::from_static("Flags-Admin-Rust"));
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, StoreError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self.http_client
            .request(method, &url)
            .headers(Self::headers());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        Ok(response.json::<T>().await?)
    }

    async fn send_for_id<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<String, StoreError>
    where
        B: Serialize + ?Sized,
    {
        let resp: IdResponse = self.send(method, path, body).await?;
        Ok(resp.id)
    }
}

fn status_error(status: StatusCode, body: &str) -> StoreError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error.or(b.message))
        .unwrap_or_else(|| format!("Unexpected status code: {}", status));

    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => StoreError::Validation(message),
        StatusCode::CONFLICT => StoreError::ReferentialConstraint(message),
        _ => StoreError::ApiError(message),
    }
}

fn child_path(flag_id: &str, kind: EntityKind) -> String {
    format!("/flags/{}/{}s", flag_id, kind)
}

const NO_BODY: Option<&()> = None;

#[async_trait]
impl Store for Client {
    async fn fetch_flag(&self, id: &str) -> Result<EditorData, StoreError> {
        let path = format!("/flags/{}", id);
        let mut last_error = None;

        for retry in 0..=self.max_retries {
            match self.send::<(), EditorData>(Method::GET, &path, NO_BODY).await {
                Ok(data) => return Ok(data),
                Err(StoreError::HttpError(e)) => {
                    warn!("Fetching flag {} failed (attempt {}): {}", id, retry + 1, e);
                    last_error = Some(StoreError::HttpError(e));
                    if retry < self.max_retries {
                        tokio::time::sleep(Duration::from_secs((retry + 1) as u64)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let e = last_error.unwrap_or_else(|| StoreError::ApiError("No attempts made".to_string()));
        error!("Giving up on flag {}: {}", id, e);
        Err(e)
    }

    async fn update_flag(&self, id: &str, input: &FlagInput) -> Result<FlagSummary, StoreError> {
        self.send(Method::PATCH, &format!("/flags/{}", id), Some(input)).await
    }

    async fn delete_flag(&self, id: &str) -> Result<String, StoreError> {
        self.send_for_id(Method::DELETE, &format!("/flags/{}", id), NO_BODY).await
    }

    async fn create_variant(&self, flag_id: &str, input: &VariantInput) -> Result<String, StoreError> {
        let path = child_path(flag_id, EntityKind::Variant);
        self.send_for_id(Method::POST, &path, Some(input)).await
    }

    async fn update_variant(&self, flag_id: &str, id: &str, input: &VariantInput) -> Result<String, StoreError> {
        let path = format!("{}/{}", child_path(flag_id, EntityKind::Variant), id);
        self.send_for_id(Method::PUT, &path, Some(input)).await
    }

    async fn delete_variant(&self, flag_id: &str, id: &str) -> Result<String, StoreError> {
        let path = format!("{}/{}", child_path(flag_id, EntityKind::Variant), id);
        self.send_for_id(Method::DELETE, &path, NO_BODY).await
    }

    async fn create_rule(&self, flag_id: &str, input: &RuleInput) -> Result<String, StoreError> {
        let path = child_path(flag_id, EntityKind::Rule);
        self.send_for_id(Method::POST, &path, Some(input)).await
    }

    async fn update_rule(&self, flag_id: &str, id: &str, input: &RuleInput) -> Result<String, StoreError> {
        let path = format!("{}/{}", child_path(flag_id, EntityKind::Rule), id);
        self.send_for_id(Method::PUT, &path, Some(input)).await
    }

    async fn delete_rule(&self, flag_id: &str, id: &str) -> Result<String, StoreError> {
        let path = format!("{}/{}", child_path(flag_id, EntityKind::Rule), id);
        self.send_for_id(Method::DELETE, &path, NO_BODY).await
    }
}

pub struct ClientBuilder {
    base_url: String,
    max_retries: u32,
    timeout: Duration,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            max_retries: MAX_RETRIES,
            timeout: Duration::from_secs(TIMEOUT_SECS),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Applies `FLAGS_ADMIN_URL`, `FLAGS_ADMIN_MAX_RETRIES` and
    /// `FLAGS_ADMIN_TIMEOUT_SECS` when they are set and parse.
    pub fn with_env(mut self) -> Self {
        if let Ok(url) = env::var("FLAGS_ADMIN_URL") {
            if !url.is_empty() {
                self = self.with_base_url(&url);
            }
        }
        if let Some(retries) = env_parse::<u32>("FLAGS_ADMIN_MAX_RETRIES") {
            self.max_retries = retries;
        }
        if let Some(secs) = env_parse::<u64>("FLAGS_ADMIN_TIMEOUT_SECS") {
            self.timeout = Duration::from_secs(secs);
        }
        self
    }

    pub fn build(self) -> Result<Client, StoreError> {
        Ok(Client {
            base_url: self.base_url,
            http_client: reqwest::Client::builder()
                .timeout(self.timeout)
                .build()?,
            max_retries: self.max_retries,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", key, value);
            None
        }
    }
}
