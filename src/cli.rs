// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use axon_config::AgentMode;

/// Output format for headless / scripted runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormatArg {
    /// Only the final agent response text, streamed to stdout as it arrives.
    #[default]
    Text,
    /// Full-fidelity JSONL: one JSON record per line (text, tool calls, tool
    /// results, token usage). Designed for piping between axon instances.
    Jsonl,
}

#[derive(Parser, Debug)]
#[command(
    name = "axon",
    about = "A provider-agnostic CLI coding agent",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Initial prompt or task description. Reads from stdin if omitted and
    /// stdin is not a terminal.
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    /// Agent mode
    #[arg(long, short = 'm', value_enum, default_value = "agent")]
    pub mode: AgentMode,

    /// Model to use, e.g. "gpt-4o" or "anthropic/claude-opus-4-5".
    /// Overrides `model.provider`/`model.name` from config for this run.
    #[arg(long, short = 'M', env = "AXON_MODEL")]
    pub model: Option<String>,

    /// Path to config file (overrides layered auto-discovery)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Output format for the run
    #[arg(long, value_enum, default_value = "text")]
    pub output_format: OutputFormatArg,

    /// Override the system prompt by reading from a file.
    #[arg(long, value_name = "PATH")]
    pub system_prompt_file: Option<PathBuf>,

    /// Append text to the default system prompt (after the Guidelines section).
    #[arg(long, value_name = "TEXT")]
    pub append_system_prompt: Option<String>,

    /// Auto-approve every tool call that would otherwise prompt for
    /// confirmation. Equivalent to answering "yes" to every approval prompt.
    #[arg(long)]
    pub yes: bool,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Print the effective (layered) configuration and exit
    ShowConfig,
    /// Run a Model Context Protocol server exposing axon's built-in tools.
    Mcp {
        #[command(subcommand)]
        command: McpCommands,
    },
    /// List available models for the configured provider(s).
    ListModels {
        /// Filter by provider name (e.g. "openai", "anthropic", "groq")
        #[arg(long, short = 'p')]
        provider: Option<String>,
        /// Output as JSON instead of a formatted table
        #[arg(long)]
        json: bool,
    },
    /// List all supported model providers.
    ListProviders {
        /// Show detailed information for each provider
        #[arg(long, short = 'v')]
        verbose: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum McpCommands {
    /// Serve axon's built-in tools over MCP stdio transport.
    Serve {
        /// Comma-separated subset of tool names to expose, or "all".
        /// Defaults to the safe built-in set (no interactive or stateful tools).
        #[arg(long)]
        tools: Option<String>,
    },
}

impl Cli {
    /// Returns true when the run should read its task from stdin rather than
    /// from the `prompt` positional argument.
    pub fn reads_stdin(&self) -> bool {
        self.prompt.is_none() && !std::io::stdin().is_terminal()
    }
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "axon", &mut std::io::stdout());
}

trait IsTerminal {
    fn is_terminal(&self) -> bool;
}

impl IsTerminal for std::io::Stdin {
    fn is_terminal(&self) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe { libc::isatty(self.as_raw_fd()) != 0 }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}
