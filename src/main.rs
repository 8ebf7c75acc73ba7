// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{self, Read, Write};
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use clap::Parser;
use cli::{Cli, Commands, McpCommands, OutputFormatArg};
use axon_config::{AgentConfig, AgentMode};
use axon_core::{Agent, AgentEvent, AgentRuntimeContext};
use axon_tools::{
    events::ToolEvent, ApprovalManager, AskQuestionTool, DeleteFileTool, EditFileTool,
    FindFileTool, GrepTool, ListDirTool, ReadFileTool, ReadImageTool, ReadLintsTool,
    RunTerminalCommandTool, SearchCodebaseTool, SwitchModeTool, TodoWriteTool, ToolPolicy,
    ToolRegistry, UpdateMemoryTool, WebFetchTool, WebSearchTool, WriteTool,
};
use tokio::sync::{mpsc, Mutex};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        return match cmd {
            Commands::Completions { shell } => {
                cli::print_completions(*shell);
                Ok(())
            }
            Commands::ShowConfig => {
                let config = axon_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                Ok(())
            }
            Commands::Mcp { command } => run_mcp_command(command).await,
            Commands::ListModels { provider, json } => list_models_cmd(provider.as_deref(), *json),
            Commands::ListProviders { verbose, json } => list_providers_cmd(*verbose, *json),
        };
    }

    let config = axon_config::load(cli.config.as_deref())?;
    run_session(cli, config).await
}

// ── MCP ───────────────────────────────────────────────────────────────────────

async fn run_mcp_command(cmd: &McpCommands) -> anyhow::Result<()> {
    match cmd {
        McpCommands::Serve { tools } => {
            let web_search_key = std::env::var("TAVILY_API_KEY")
                .ok()
                .or_else(|| std::env::var("BRAVE_API_KEY").ok());
            let registry = Arc::new(axon_mcp::build_mcp_registry(
                web_search_key,
                tools.as_deref(),
            ));
            axon_mcp::serve_stdio(registry).await
        }
    }
}

// ── Model / provider catalogs ─────────────────────────────────────────────────

fn list_models_cmd(provider: Option<&str>, as_json: bool) -> anyhow::Result<()> {
    let mut entries = axon_model::catalog::static_catalog();
    if let Some(p) = provider {
        entries.retain(|e| e.provider == p);
    }
    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for e in &entries {
        println!(
            "{:<28} {:<10} ctx={:<8} out={:<7} {}",
            e.id, e.provider, e.context_window, e.max_output_tokens, e.description
        );
    }
    Ok(())
}

fn list_providers_cmd(verbose: bool, as_json: bool) -> anyhow::Result<()> {
    if as_json {
        let rows: Vec<_> = axon_model::list_drivers()
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "name": d.name,
                    "description": d.description,
                    "default_api_key_env": d.default_api_key_env,
                    "requires_api_key": d.requires_api_key,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for d in axon_model::list_drivers() {
        if verbose {
            println!(
                "{:<14} {:<20} key_env={:<20} {}",
                d.id,
                d.name,
                d.default_api_key_env.unwrap_or("-"),
                d.description
            );
        } else {
            println!("{:<14} {}", d.id, d.name);
        }
    }
    Ok(())
}

// ── Session driver ───────────────────────────────────────────────────────────

/// Run a single agent turn for `cli.prompt` (or stdin) against the effective
/// configuration, streaming events to stdout as they arrive.
async fn run_session(cli: Cli, config: axon_config::Config) -> anyhow::Result<()> {
    let prompt = resolve_prompt(&cli)?;
    if prompt.trim().is_empty() {
        anyhow::bail!("no prompt given: pass PROMPT as an argument or pipe it on stdin");
    }

    let mut model_cfg = config.model.clone();
    if let Some(m) = &cli.model {
        model_cfg = axon_model::resolve_model_from_config(&config, m);
    }

    let agent_config = Arc::new(AgentConfig {
        default_mode: cli.mode,
        ..config.agent.clone()
    });

    let project_root = find_project_root();
    let allowed_dirs = match &project_root {
        Some(root) => vec![root.clone()],
        None => vec![std::env::current_dir().context("resolving current directory")?],
    };
    let approval = Arc::new(ApprovalManager::new(
        ToolPolicy::from_config(&config.tools),
        allowed_dirs,
        cli.yes,
    ));

    let mode_lock = Arc::new(Mutex::new(cli.mode));
    let (tool_event_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);

    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool);
    registry.register(WriteTool);
    registry.register(EditFileTool);
    registry.register(DeleteFileTool);
    registry.register(ListDirTool);
    registry.register(FindFileTool);
    registry.register(GrepTool);
    registry.register(SearchCodebaseTool);
    registry.register(ReadLintsTool);
    registry.register(ReadImageTool);
    registry.register(WebFetchTool);
    registry.register(WebSearchTool::default());
    registry.register(RunTerminalCommandTool {
        timeout_secs: config.tools.timeout_secs,
    });
    registry.register(AskQuestionTool::new_headless());
    registry.register(UpdateMemoryTool::default());
    registry.register(SwitchModeTool::new(
        Arc::clone(&mode_lock),
        tool_event_tx.clone(),
    ));
    registry.register(TodoWriteTool::new(
        Arc::new(Mutex::new(Vec::new())),
        tool_event_tx,
    ));

    let runtime = build_runtime_context(&cli, &config)?;
    let registry = Arc::new(registry);

    // The `cli_bridge` provider delegates inference to a subprocess CLI. Tool
    // calls the child makes come back as `BridgedToolCall` events on its
    // response stream and are run by the agent's own registry, so construction
    // here needs no reference to `registry` and bypasses `axon_model::from_config`
    // only because that function doesn't know about the subprocess driver.
    let model: Arc<dyn axon_model::ModelProvider> = if model_cfg.provider == "cli_bridge" {
        let adapter_cfg = axon_mcp::CliAdapterConfig::from_driver_options(&model_cfg.driver_options)
            .context("parsing cli_bridge model config")?;
        Arc::new(axon_mcp::CliBridgeProvider::new(adapter_cfg))
    } else {
        let model = axon_model::from_config(&model_cfg).context("constructing model provider")?;
        Arc::from(model)
    };
    let model: Arc<dyn axon_model::ModelProvider> = Arc::new(axon_model::RetryingProvider::new(
        model,
        axon_model::RetryConfig::default(),
    ));
    let model: Arc<dyn axon_model::ModelProvider> = match &agent_config.debug_log_path {
        Some(path) => {
            let writer = axon_model::DebugLogWriter::open(std::path::Path::new(path))
                .context("opening debug log")?;
            Arc::new(axon_model::DebugLoggingProvider::new(model, Arc::new(writer)))
        }
        None => model,
    };

    let mut agent = Agent::new(
        model,
        registry,
        agent_config,
        runtime,
        mode_lock,
        tool_event_rx,
        model_cfg.max_tokens.unwrap_or(128_000) as usize,
    )
    .with_approval(approval)
    .with_sampling(model_cfg.temperature);

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
    let submit = tokio::spawn(async move { agent.submit(&prompt, tx).await });

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut final_text = String::new();
    while let Some(event) = rx.recv().await {
        match cli.output_format {
            OutputFormatArg::Text => match &event {
                AgentEvent::TextDelta(d) => {
                    out.write_all(d.as_bytes())?;
                    out.flush()?;
                }
                AgentEvent::TextComplete(t) => final_text = t.clone(),
                AgentEvent::Error(e) => eprintln!("\n[axon:error] {e}"),
                _ => {}
            },
            OutputFormatArg::Jsonl => {
                println!("{}", render_jsonl(&event));
            }
        }
    }
    submit.await.context("agent task panicked")??;

    if matches!(cli.output_format, OutputFormatArg::Text) && !final_text.is_empty() {
        // Streamed deltas already wrote the text; ensure trailing newline.
        writeln!(out)?;
    }
    Ok(())
}

fn resolve_prompt(cli: &Cli) -> anyhow::Result<String> {
    if let Some(p) = &cli.prompt {
        return Ok(p.clone());
    }
    if cli.reads_stdin() {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("reading stdin")?;
        return Ok(buf);
    }
    Ok(String::new())
}

fn build_runtime_context(
    cli: &Cli,
    _config: &axon_config::Config,
) -> anyhow::Result<AgentRuntimeContext> {
    let project_root = find_project_root();
    let system_prompt_override = match &cli.system_prompt_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?,
        ),
        None => None,
    };
    Ok(AgentRuntimeContext {
        project_root,
        system_prompt_override,
        append_system_prompt: cli.append_system_prompt.clone(),
        ..Default::default()
    })
}

/// Walk up from the current directory looking for a `.git` marker.
fn find_project_root() -> Option<std::path::PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    loop {
        if dir.join(".git").exists() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

fn render_jsonl(event: &AgentEvent) -> String {
    let value = match event {
        AgentEvent::TextDelta(d) => serde_json::json!({"type": "text_delta", "text": d}),
        AgentEvent::TextComplete(t) => serde_json::json!({"type": "text", "text": t}),
        AgentEvent::ThinkingDelta(d) => serde_json::json!({"type": "thinking_delta", "text": d}),
        AgentEvent::ThinkingComplete(t) => serde_json::json!({"type": "thinking", "text": t}),
        AgentEvent::ToolCallStarted(tc) => {
            serde_json::json!({"type": "tool_call", "id": tc.id, "name": tc.name, "args": tc.args})
        }
        AgentEvent::ToolCallFinished {
            call_id,
            tool_name,
            output,
            is_error,
        } => {
            serde_json::json!({"type": "tool_result", "id": call_id, "name": tool_name, "output": output, "is_error": is_error})
        }
        AgentEvent::ContextCompacted {
            tokens_before,
            tokens_after,
            strategy,
            turn,
        } => {
            serde_json::json!({"type": "context_compacted", "tokens_before": tokens_before, "tokens_after": tokens_after, "strategy": format!("{:?}", strategy), "turn": turn})
        }
        AgentEvent::TokenUsage {
            input,
            output,
            cache_read,
            cache_write,
            cache_read_total,
            cache_write_total,
            max_tokens,
        } => {
            serde_json::json!({"type": "token_usage", "input": input, "output": output, "cache_read": cache_read, "cache_write": cache_write, "cache_read_total": cache_read_total, "cache_write_total": cache_write_total, "max_tokens": max_tokens})
        }
        AgentEvent::TurnComplete => serde_json::json!({"type": "turn_complete"}),
        AgentEvent::Error(e) => serde_json::json!({"type": "error", "message": e}),
        AgentEvent::TodoUpdate(items) => serde_json::json!({"type": "todo_update", "items": items}),
        AgentEvent::ModeChanged(mode) => {
            serde_json::json!({"type": "mode_changed", "mode": format!("{mode:?}")})
        }
        AgentEvent::Question { id, questions } => {
            serde_json::json!({"type": "question", "id": id, "questions": questions})
        }
        AgentEvent::QuestionAnswer { id, answer } => {
            serde_json::json!({"type": "question_answer", "id": id, "answer": answer})
        }
        AgentEvent::Aborted { partial_text } => {
            serde_json::json!({"type": "aborted", "partial_text": partial_text})
        }
    };
    value.to_string()
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .try_init();
}
