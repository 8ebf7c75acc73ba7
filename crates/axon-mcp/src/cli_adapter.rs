// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Drives an external coding-assistant CLI that speaks newline-delimited
//! JSON on stdout, behind the same [`axon_model::ModelProvider`] seam every
//! other driver implements.
//!
//! The child is given the rendered conversation on stdin (never argv, which
//! would blow past OS length limits once tool results pile up) and, when
//! tools are in play, a small local HTTP bridge it can call back into to
//! run them.  The bridge binds `127.0.0.1` on a random port, guards every
//! request with a bearer token generated fresh per turn, and is torn down
//! as soon as the child exits.
//!
//! The bridge never executes a tool itself. A call arriving over HTTP is
//! turned into a [`ResponseEvent::BridgedToolCall`] carrying a one-shot
//! reply channel and pushed onto the same event stream the engine is
//! already draining for this turn; the engine runs it through its own tool
//! registry (so approval-gating and history recording apply exactly as for
//! a native tool call) and answers through that channel.

use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use axon_model::{
    BridgedToolResult, CompletionRequest, Message, MessageContent, ModelCatalogEntry,
    ModelProvider, ResponseEvent, ResponseStream, Role, ToolSchema,
};

/// Configuration for one subprocess CLI adapter instance.
///
/// Deserialized straight out of `model.driver_options` in config, so fields
/// use the snake_case a user would type in YAML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CliAdapterConfig {
    /// Executable to spawn (looked up on `PATH` unless it contains a `/`).
    pub command: String,
    /// Extra argv entries appended after the adapter's own streaming/turn flags.
    #[serde(default)]
    pub args: Vec<String>,
    /// Model identifier forwarded to the child via `--model`, if the child
    /// cares (most subprocess CLIs pick their own default otherwise).
    #[serde(default)]
    pub model: Option<String>,
    /// Permission mode forwarded via `--permission-mode` (e.g. `"acceptEdits"`,
    /// `"plan"`). Left unset, the child uses its own default.
    #[serde(default)]
    pub permission_mode: Option<String>,
}

impl CliAdapterConfig {
    pub fn from_driver_options(v: &serde_json::Value) -> anyhow::Result<Self> {
        let cfg: Self = serde_json::from_value(v.clone())
            .context("parsing cli_bridge driver_options")?;
        if cfg.command.trim().is_empty() {
            bail!("cli_bridge provider requires driver_options.command");
        }
        Ok(cfg)
    }
}

// ─── Tool bridge HTTP server ────────────────────────────────────────────────

#[derive(Deserialize)]
struct BridgeCallRequest {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Serialize)]
struct BridgeCallResponse {
    content: String,
    is_error: bool,
}

struct BridgeState {
    /// Feeds the same event stream the engine is draining for this turn.
    /// Tool calls are proxied as synthetic [`ResponseEvent::BridgedToolCall`]
    /// events rather than executed here, so the engine's own tool registry
    /// runs them — preserving approval-gating and session/history recording.
    event_tx: mpsc::Sender<anyhow::Result<ResponseEvent>>,
    token: String,
    next_id: AtomicUsize,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn handle_tool_call(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
    Json(req): Json<BridgeCallRequest>,
) -> (StatusCode, Json<BridgeCallResponse>) {
    if bearer_token(&headers) != Some(state.token.as_str()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(BridgeCallResponse { content: "invalid bridge token".into(), is_error: true }),
        );
    }
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let arguments = serde_json::to_string(&req.arguments).unwrap_or_default();
    let (respond_to, awaiting) = tokio::sync::oneshot::channel::<BridgedToolResult>();
    let event = ResponseEvent::BridgedToolCall {
        index: id as u32,
        id: format!("bridge-{id}"),
        name: req.name,
        arguments,
        respond_to,
    };
    if state.event_tx.send(Ok(event)).await.is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(BridgeCallResponse { content: "engine is no longer listening for tool calls".into(), is_error: true }),
        );
    }
    match awaiting.await {
        Ok(result) => (
            StatusCode::OK,
            Json(BridgeCallResponse { content: result.content, is_error: result.is_error }),
        ),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(BridgeCallResponse { content: "engine dropped the tool call without a result".into(), is_error: true }),
        ),
    }
}

/// A running tool-bridge server. Dropping this shuts the listener down.
struct BridgeServer {
    addr: SocketAddr,
    token: String,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl BridgeServer {
    async fn start(event_tx: mpsc::Sender<anyhow::Result<ResponseEvent>>) -> anyhow::Result<Self> {
        let token: String = {
            let mut rng = rand::thread_rng();
            (0..32).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
        };
        let state = Arc::new(BridgeState { event_tx, token: token.clone(), next_id: AtomicUsize::new(0) });
        let app = Router::new().route("/tool_call", post(handle_tool_call)).with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("binding tool-bridge listener")?;
        let addr = listener.local_addr().context("reading tool-bridge listener address")?;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = server.await {
                warn!("tool-bridge server exited with error: {e}");
            }
        });

        Ok(Self { addr, token, shutdown: tx, handle })
    }

    fn stop(self) {
        let _ = self.shutdown.send(());
        self.handle.abort();
    }
}

#[derive(Serialize)]
struct BridgeConfigFile<'a> {
    url: String,
    token: &'a str,
    tools: Vec<BridgeToolDescriptor<'a>>,
}

#[derive(Serialize)]
struct BridgeToolDescriptor<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

fn write_bridge_config(addr: SocketAddr, token: &str, tools: &[ToolSchema]) -> anyhow::Result<std::path::PathBuf> {
    let descriptors: Vec<BridgeToolDescriptor> = tools
        .iter()
        .map(|t| BridgeToolDescriptor { name: &t.name, description: &t.description, parameters: &t.parameters })
        .collect();
    let file = BridgeConfigFile { url: format!("http://{addr}/tool_call"), token, tools: descriptors };
    let path = std::env::temp_dir().join(format!("axon-cli-bridge-{}.json", uuid::Uuid::new_v4()));
    std::fs::write(&path, serde_json::to_vec(&file)?).context("writing tool-bridge config file")?;
    Ok(path)
}

// ─── Conversation rendering ─────────────────────────────────────────────────

/// Render the messages from `from` onward as plain text the child can read
/// off stdin. Only the tail is sent — the child's own session state is
/// authoritative for everything before it.
fn render_tail(messages: &[Message], from: usize) -> String {
    messages[from.min(messages.len())..]
        .iter()
        .map(render_message)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_message(m: &Message) -> String {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let body = match &m.content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::ContentParts(_) => m.as_text().unwrap_or_default().to_string(),
        MessageContent::ToolCall { function, .. } => {
            format!("[tool call: {} {}]", function.name, function.arguments)
        }
        MessageContent::ToolResult { content, .. } => content.to_string(),
    };
    format!("[{role}] {body}")
}

// ─── stream-json parsing ────────────────────────────────────────────────────

/// One parsed frame: an optional session id update (from `system` frames)
/// plus an optional event to forward downstream.
struct ParsedFrame {
    session_id: Option<String>,
    event: Option<ResponseEvent>,
}

fn parse_stream_json_line(line: &str) -> Option<anyhow::Result<ParsedFrame>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let v: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Some(Err(anyhow::anyhow!("malformed stream-json line: {e}"))),
    };
    let frame_type = v["type"].as_str().unwrap_or("");
    let frame = match frame_type {
        "system" => ParsedFrame {
            session_id: v["session_id"].as_str().map(str::to_string),
            event: None,
        },
        "stream_event" => {
            let delta_text = v["event"]["delta"]["text"].as_str().unwrap_or("");
            ParsedFrame { session_id: None, event: Some(ResponseEvent::TextDelta(delta_text.to_string())) }
        }
        "assistant" => {
            let content = v["message"]["content"].as_array().cloned().unwrap_or_default();
            let mut event = None;
            for (idx, block) in content.iter().enumerate() {
                if block["type"].as_str() == Some("tool_use") {
                    event = Some(ResponseEvent::ToolCall {
                        index: idx as u32,
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: serde_json::to_string(&block["input"]).unwrap_or_default(),
                    });
                    break;
                }
                if let Some(text) = block["text"].as_str() {
                    if !text.is_empty() {
                        event = Some(ResponseEvent::TextDelta(text.to_string()));
                    }
                }
            }
            ParsedFrame { session_id: None, event }
        }
        "result" => {
            let usage = &v["usage"];
            ParsedFrame {
                session_id: None,
                event: Some(ResponseEvent::Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                    cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32,
                    cache_write_tokens: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0) as u32,
                }),
            }
        }
        _ => ParsedFrame { session_id: None, event: None },
    };
    Some(Ok(frame))
}

// ─── The provider itself ────────────────────────────────────────────────────

/// A [`ModelProvider`] that delegates inference to a subprocess CLI instead
/// of calling an HTTP API directly.
pub struct CliBridgeProvider {
    config: CliAdapterConfig,
    name: String,
    model_name: String,
    /// Index into `messages` already sent to the child on a previous turn.
    /// Shared via `Arc` so the background reader task can update it directly
    /// once it observes a `system` frame's session id, and so `messages_sent`
    /// survives past the lifetime of any single `complete` call.
    messages_sent: Arc<AtomicUsize>,
    /// Session id the child assigned itself, once known.
    session_id: Arc<AsyncMutex<Option<String>>>,
}

impl CliBridgeProvider {
    pub fn new(config: CliAdapterConfig) -> Self {
        let model_name = config.model.clone().unwrap_or_else(|| config.command.clone());
        Self {
            name: "cli_bridge".to_string(),
            model_name,
            config,
            messages_sent: Arc::new(AtomicUsize::new(0)),
            session_id: Arc::new(AsyncMutex::new(None)),
        }
    }
}

#[async_trait]
impl ModelProvider for CliBridgeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let from = self.messages_sent.load(Ordering::SeqCst);
        let tail = render_tail(&req.messages, from);
        self.messages_sent.store(req.messages.len(), Ordering::SeqCst);

        // Created up front so the bridge server (if started) can feed tool
        // calls into the exact same event stream the engine drains below.
        let (tx, rx) = mpsc::channel::<anyhow::Result<ResponseEvent>>(64);

        let bridge = if !req.tools.is_empty() {
            Some(BridgeServer::start(tx.clone()).await?)
        } else {
            None
        };

        let mut args: Vec<String> =
            vec!["--output-format".into(), "stream-json".into(), "--input-format".into(), "stream-json".into()];
        args.push("--max-turns".into());
        args.push("1".into());
        if let Some(model) = &self.config.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if let Some(mode) = &self.config.permission_mode {
            args.push("--permission-mode".into());
            args.push(mode.clone());
        }
        let bridge_config_path = if let Some(b) = &bridge {
            let path = write_bridge_config(b.addr, &b.token, &req.tools)?;
            args.push("--tool-bridge-config".into());
            args.push(path.display().to_string());
            Some(path)
        } else {
            None
        };
        {
            let session = self.session_id.lock().await;
            if let Some(id) = session.as_ref() {
                args.push("--resume".into());
                args.push(id.clone());
            }
        }
        args.extend(self.config.args.iter().cloned());

        debug!(command = %self.config.command, ?args, "spawning cli_bridge subprocess");

        let mut child = Command::new(&self.config.command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning cli_bridge command {:?}", self.config.command))?;

        let mut stdin = child.stdin.take().context("child stdin not piped")?;
        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(tail.as_bytes()).await {
                warn!("writing conversation to cli_bridge stdin: {e}");
            }
            let _ = stdin.shutdown().await;
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "cli_bridge::stderr", "{line}");
            }
        });

        let session_id = Arc::clone(&self.session_id);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_stream_json_line(&line) {
                        Some(Ok(frame)) => {
                            if let Some(id) = frame.session_id {
                                *session_id.lock().await = Some(id);
                            }
                            if let Some(ev) = frame.event {
                                if tx.send(Ok(ev)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e)).await;
                        }
                        None => {}
                    },
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!("reading cli_bridge stdout: {e}"))).await;
                        break;
                    }
                }
            }
            let _ = tx.send(Ok(ResponseEvent::Done)).await;
            let _ = child.wait().await;
            if let Some(b) = bridge {
                b.stop();
            }
            if let Some(path) = bridge_config_path {
                let _ = tokio::fs::remove_file(path).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        Ok(vec![])
    }

    fn catalog_max_output_tokens(&self) -> Option<u32> {
        None
    }

    fn catalog_context_window(&self) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_model::{ContentPart, FunctionCall};

    fn msg(role: Role, text: &str) -> Message {
        Message { role, content: MessageContent::Text(text.to_string()) }
    }

    // ── CliAdapterConfig ───────────────────────────────────────────────────

    #[test]
    fn from_driver_options_requires_command() {
        let v = serde_json::json!({});
        assert!(CliAdapterConfig::from_driver_options(&v).is_err());
    }

    #[test]
    fn from_driver_options_parses_full_config() {
        let v = serde_json::json!({
            "command": "some-cli",
            "args": ["--flag"],
            "model": "some-model",
            "permission_mode": "acceptEdits",
        });
        let cfg = CliAdapterConfig::from_driver_options(&v).unwrap();
        assert_eq!(cfg.command, "some-cli");
        assert_eq!(cfg.args, vec!["--flag".to_string()]);
        assert_eq!(cfg.model.as_deref(), Some("some-model"));
        assert_eq!(cfg.permission_mode.as_deref(), Some("acceptEdits"));
    }

    // ── render_tail ─────────────────────────────────────────────────────────

    #[test]
    fn render_tail_from_zero_includes_all_messages() {
        let messages = vec![msg(Role::User, "hello"), msg(Role::Assistant, "hi")];
        let text = render_tail(&messages, 0);
        assert!(text.contains("[user] hello"));
        assert!(text.contains("[assistant] hi"));
    }

    #[test]
    fn render_tail_skips_already_sent_messages() {
        let messages = vec![msg(Role::User, "first"), msg(Role::User, "second")];
        let text = render_tail(&messages, 1);
        assert!(!text.contains("first"));
        assert!(text.contains("second"));
    }

    #[test]
    fn render_tail_out_of_bounds_from_is_empty() {
        let messages = vec![msg(Role::User, "only")];
        let text = render_tail(&messages, 5);
        assert_eq!(text, "");
    }

    #[test]
    fn render_message_tool_call_summarizes_function() {
        let m = Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: "id1".into(),
                function: FunctionCall { name: "grep".into(), arguments: "{\"pattern\":\"x\"}".into() },
            },
        };
        let text = render_message(&m);
        assert!(text.contains("grep"));
    }

    #[test]
    fn render_message_content_parts_falls_back_to_text() {
        let m = Message::user_with_parts(vec![ContentPart::text("hi")]);
        let text = render_message(&m);
        assert_eq!(text, "[user] hi");
    }

    // ── parse_stream_json_line ──────────────────────────────────────────────

    #[test]
    fn blank_line_is_ignored() {
        assert!(parse_stream_json_line("").is_none());
        assert!(parse_stream_json_line("   ").is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let result = parse_stream_json_line("{not json").unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn system_frame_captures_session_id_with_no_event() {
        let line = r#"{"type":"system","session_id":"sess-123"}"#;
        let frame = parse_stream_json_line(line).unwrap().unwrap();
        assert_eq!(frame.session_id.as_deref(), Some("sess-123"));
        assert!(frame.event.is_none());
    }

    #[test]
    fn stream_event_frame_yields_text_delta() {
        let line = r#"{"type":"stream_event","event":{"delta":{"text":"hel"}}}"#;
        let frame = parse_stream_json_line(line).unwrap().unwrap();
        assert!(matches!(frame.event, Some(ResponseEvent::TextDelta(t)) if t == "hel"));
    }

    #[test]
    fn assistant_frame_with_tool_use_yields_tool_call() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"tool_use","id":"call-1","name":"grep","input":{"pattern":"foo"}}
        ]}}"#;
        let frame = parse_stream_json_line(line).unwrap().unwrap();
        match frame.event {
            Some(ResponseEvent::ToolCall { id, name, .. }) => {
                assert_eq!(id, "call-1");
                assert_eq!(name, "grep");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn assistant_frame_with_text_yields_text_delta() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}"#;
        let frame = parse_stream_json_line(line).unwrap().unwrap();
        assert!(matches!(frame.event, Some(ResponseEvent::TextDelta(t)) if t == "done"));
    }

    #[test]
    fn result_frame_yields_usage() {
        let line = r#"{"type":"result","usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":2,"cache_creation_input_tokens":1}}"#;
        let frame = parse_stream_json_line(line).unwrap().unwrap();
        match frame.event {
            Some(ResponseEvent::Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens }) => {
                assert_eq!(input_tokens, 10);
                assert_eq!(output_tokens, 5);
                assert_eq!(cache_read_tokens, 2);
                assert_eq!(cache_write_tokens, 1);
            }
            other => panic!("expected Usage, got {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_type_yields_nothing() {
        let line = r#"{"type":"ping"}"#;
        let frame = parse_stream_json_line(line).unwrap().unwrap();
        assert!(frame.session_id.is_none());
        assert!(frame.event.is_none());
    }

    // ── CliBridgeProvider ────────────────────────────────────────────────────

    #[test]
    fn provider_name_and_model_name() {
        let cfg = CliAdapterConfig { command: "some-cli".into(), model: Some("some-model".into()), ..Default::default() };
        let provider = CliBridgeProvider::new(cfg);
        assert_eq!(provider.name(), "cli_bridge");
        assert_eq!(provider.model_name(), "some-model");
    }

    #[test]
    fn provider_model_name_falls_back_to_command() {
        let cfg = CliAdapterConfig { command: "some-cli".into(), ..Default::default() };
        let provider = CliBridgeProvider::new(cfg);
        assert_eq!(provider.model_name(), "some-cli");
    }
}
