// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retries transient provider failures with exponential backoff while
//! forwarding every other [`ModelProvider`] capability straight through —
//! wrapping a provider must never sever its wiring.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::catalog::{InputModality, ModelCatalogEntry};
use crate::provider::{Capabilities, ResponseStream};
use crate::{CompletionRequest, ModelProvider};

/// Coarse classification of a provider error, used to decide whether a retry
/// is worth attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network blip, 5xx, or timeout — safe to retry.
    Transient,
    /// 429 / explicit rate-limit signal — safe to retry, with backoff.
    RateLimited,
    /// The request itself was too large for the model's context window —
    /// retrying verbatim will fail identically; the caller must compact.
    ContextOverflow,
    /// Bad or missing credentials — retrying will never succeed.
    Auth,
    /// Anything else — surfaced immediately, no retry.
    Permanent,
}

/// Inspect a provider error's message for the signals the adapters in this
/// crate actually produce (`"{driver} error {status}: {text}"`, reqwest
/// connect/timeout errors) and classify it.
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    if let Some(reqwest_err) = err.chain().find_map(|c| c.downcast_ref::<reqwest::Error>()) {
        if reqwest_err.is_timeout() || reqwest_err.is_connect() {
            return ErrorClass::Transient;
        }
        if let Some(status) = reqwest_err.status() {
            return classify_status(status.as_u16());
        }
    }

    let msg = err.to_string().to_lowercase();
    for code in ["401", "403"] {
        if msg.contains(code) {
            return ErrorClass::Auth;
        }
    }
    if msg.contains("unauthorized") || msg.contains("invalid api key") || msg.contains("invalid_api_key") {
        return ErrorClass::Auth;
    }
    if msg.contains("429") || msg.contains("rate limit") || msg.contains("rate_limit") || msg.contains("too many requests") {
        return ErrorClass::RateLimited;
    }
    if (msg.contains("context") || msg.contains("token")) && (msg.contains("overflow") || msg.contains("too long") || msg.contains("maximum") || msg.contains("exceed")) {
        return ErrorClass::ContextOverflow;
    }
    for code in ["500", "502", "503", "504"] {
        if msg.contains(code) {
            return ErrorClass::Transient;
        }
    }
    if msg.contains("timeout") || msg.contains("connection") || msg.contains("network") || msg.contains("reset by peer") {
        return ErrorClass::Transient;
    }
    ErrorClass::Permanent
}

fn classify_status(status: u16) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::Auth,
        429 => ErrorClass::RateLimited,
        500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Backoff and retry-count configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    config
        .base_delay
        .saturating_mul(factor)
        .min(config.max_delay)
}

/// Wraps any [`ModelProvider`] with retry-on-transient-failure behaviour.
///
/// Every other trait method (catalog lookups, modality queries, live
/// context-window probing) is forwarded to the inner provider unchanged —
/// wrapping must be transparent to callers that only care about the
/// underlying model's declared capabilities.
pub struct RetryingProvider {
    inner: Arc<dyn ModelProvider>,
    config: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn ModelProvider>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl ModelProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let mut attempt = 0u32;
        loop {
            match self.inner.complete(req.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    let class = classify_error(&e);
                    let retryable = matches!(class, ErrorClass::Transient | ErrorClass::RateLimited);
                    if !retryable || attempt >= self.config.max_retries {
                        return Err(e);
                    }
                    let delay = backoff_delay(&self.config, attempt);
                    warn!(
                        attempt,
                        ?class,
                        delay_ms = delay.as_millis() as u64,
                        "retrying provider call after {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        self.inner.list_models().await
    }

    fn catalog_max_output_tokens(&self) -> Option<u32> {
        self.inner.catalog_max_output_tokens()
    }

    fn catalog_context_window(&self) -> Option<u32> {
        self.inner.catalog_context_window()
    }

    async fn probe_context_window(&self) -> Option<u32> {
        self.inner.probe_context_window().await
    }

    fn input_modalities(&self) -> Vec<InputModality> {
        self.inner.input_modalities()
    }

    fn supports_images(&self) -> bool {
        self.inner.supports_images()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}
