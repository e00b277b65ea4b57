// ABOUTME: Diff fetcher - retrieves minutely diffs from a replication repository
// ABOUTME: Distinguishes "not published yet" from transient network failures

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

use super::{latest_state_url, ReplicationState, SequenceNumber};
use crate::utils::{retry_with_backoff, RetryPolicy};

/// Outcome of a failed fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The upstream has not produced this diff yet. Try again later.
    #[error("not published yet")]
    NotAvailable,
    /// Network or server failure. Retry now, with backoff.
    #[error("{0}")]
    Transient(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// A sequence-addressed repository of minutely diffs.
#[async_trait]
pub trait DiffSource: Send + Sync {
    /// Raw (possibly compressed) payload of diff `sequence`.
    async fn fetch(&self, sequence: SequenceNumber) -> Result<Vec<u8>, FetchError>;

    /// Newest sequence published upstream.
    async fn latest(&self) -> Result<ReplicationState, FetchError>;
}

/// Fetch one diff, retrying transient failures according to `policy`.
///
/// `NotAvailable` is returned without retrying so callers can wait for the
/// upstream's publishing cadence instead of spinning.
pub async fn fetch_with_retry<S: DiffSource + ?Sized>(
    source: &S,
    sequence: SequenceNumber,
    policy: &RetryPolicy,
) -> Result<Vec<u8>, FetchError> {
    retry_with_backoff(policy, || source.fetch(sequence), FetchError::is_transient).await
}

/// HTTP client for an OSM replication repository.
pub struct HttpDiffSource {
    client: Client,
    base_url: String,
}

impl HttpDiffSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        url::Url::parse(&base_url)
            .with_context(|| format!("Invalid replication base URL '{}'", base_url))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(describe_reqwest_error(&e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotAvailable);
        }

        let body = response.text().await.unwrap_or_default();
        let body = body.trim();
        if status == StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!("Upstream is rate limiting requests (HTTP 429)");
        }
        Err(FetchError::Transient(if body.is_empty() {
            format!("HTTP {} from {}", status, url)
        } else {
            format!("HTTP {} from {}: {}", status, url, truncate(body, 200))
        }))
    }
}

#[async_trait]
impl DiffSource for HttpDiffSource {
    async fn fetch(&self, sequence: SequenceNumber) -> Result<Vec<u8>, FetchError> {
        let url = sequence.diff_url(&self.base_url);
        let response = self.get(&url).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(describe_reqwest_error(&e)))?;
        tracing::debug!("Fetched diff {} ({} bytes)", sequence, bytes.len());
        Ok(bytes.to_vec())
    }

    async fn latest(&self) -> Result<ReplicationState, FetchError> {
        let url = latest_state_url(&self.base_url);
        let body = self
            .get(&url)
            .await?
            .text()
            .await
            .map_err(|e| FetchError::Transient(describe_reqwest_error(&e)))?;
        ReplicationState::parse(&body)
            .map_err(|e| FetchError::Transient(format!("unreadable {}: {:#}", url, e)))
    }
}

fn describe_reqwest_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {}", e)
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
