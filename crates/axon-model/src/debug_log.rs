// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Newline-delimited JSON debug log: one line per outgoing request and one
//! per stream event. Wraps any [`ModelProvider`] the same way
//! [`crate::RetryingProvider`] does, so enabling it never severs the inner
//! provider's wiring.
//!
//! Writes are best-effort — a write failure is dropped, never propagated,
//! since a broken debug log must not take down a live session. A disabled
//! writer (`DebugLogWriter::disabled`) is a no-op at every call site.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;

use crate::catalog::{InputModality, ModelCatalogEntry};
use crate::provider::{Capabilities, ResponseStream};
use crate::{CompletionRequest, ModelProvider, ResponseEvent};

/// Appends NDJSON lines per §6's persisted debug-log format. `Close` is
/// idempotent — dropping the open file handle twice is a no-op.
pub struct DebugLogWriter {
    file: Mutex<Option<File>>,
}

impl DebugLogWriter {
    /// Open `path` for appending. Creates the file if it doesn't exist.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(Some(file)) })
    }

    /// A writer with no backing file — every call is a no-op.
    pub fn disabled() -> Self {
        Self { file: Mutex::new(None) }
    }

    fn write_line(&self, value: &serde_json::Value) {
        let Ok(mut guard) = self.file.lock() else { return };
        if let Some(f) = guard.as_mut() {
            let _ = writeln!(f, "{value}");
        }
    }

    pub fn log_request(&self, provider: &str, model: &str, session_id: &str, request: &CompletionRequest) {
        self.write_line(&json!({
            "type": "request",
            "provider": provider,
            "model": model,
            "session_id": session_id,
            "request": request,
        }));
    }

    pub fn log_event(&self, event_type: &str, data: serde_json::Value, timestamp: chrono::DateTime<chrono::Utc>) {
        self.write_line(&json!({
            "type": "event",
            "event_type": event_type,
            "data": data,
            "timestamp": timestamp.to_rfc3339(),
        }));
    }

    /// Stop writing. Safe to call more than once.
    pub fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            *guard = None;
        }
    }
}

/// Render a [`ResponseEvent`] to the `(event_type, data)` pair the log
/// format wants, without requiring `Clone` (the `BridgedToolCall` variant
/// carries a non-cloneable `oneshot::Sender`, so this reads through a
/// reference instead of consuming the event).
fn describe_event(event: &ResponseEvent) -> (&'static str, serde_json::Value) {
    match event {
        ResponseEvent::TextDelta(text) => ("text_delta", json!({ "text": text })),
        ResponseEvent::ToolCall { index, id, name, arguments } => (
            "tool_call",
            json!({ "index": index, "id": id, "name": name, "arguments": arguments }),
        ),
        ResponseEvent::ThinkingDelta(text) => ("thinking_delta", json!({ "text": text })),
        ResponseEvent::Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens } => (
            "usage",
            json!({
                "input_tokens": input_tokens,
                "output_tokens": output_tokens,
                "cache_read_tokens": cache_read_tokens,
                "cache_write_tokens": cache_write_tokens,
            }),
        ),
        ResponseEvent::Done => ("done", serde_json::Value::Null),
        ResponseEvent::MaxTokens => ("max_tokens", serde_json::Value::Null),
        ResponseEvent::Error(msg) => ("error", json!({ "message": msg })),
        ResponseEvent::BridgedToolCall { index, id, name, arguments, .. } => (
            "bridged_tool_call",
            json!({ "index": index, "id": id, "name": name, "arguments": arguments }),
        ),
    }
}

/// Wraps any [`ModelProvider`], logging each request and every event of its
/// response stream to a [`DebugLogWriter`]. All other trait methods forward
/// to the inner provider unchanged.
pub struct DebugLoggingProvider {
    inner: Arc<dyn ModelProvider>,
    writer: Arc<DebugLogWriter>,
}

impl DebugLoggingProvider {
    pub fn new(inner: Arc<dyn ModelProvider>, writer: Arc<DebugLogWriter>) -> Self {
        Self { inner, writer }
    }
}

#[async_trait]
impl ModelProvider for DebugLoggingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        self.writer.log_request(
            self.inner.name(),
            self.inner.model_name(),
            req.session_id.as_deref().unwrap_or(""),
            &req,
        );
        let stream = self.inner.complete(req).await?;
        let writer = Arc::clone(&self.writer);
        let logged = stream.then(move |item| {
            let writer = Arc::clone(&writer);
            async move {
                if let Ok(event) = &item {
                    let (event_type, data) = describe_event(event);
                    writer.log_event(event_type, data, chrono::Utc::now());
                }
                item
            }
        });
        Ok(Box::pin(logged))
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
