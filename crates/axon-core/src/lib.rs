// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod events;
mod interrupt;
mod prompts;
mod runtime_context;
mod session;

pub use agent::Agent;
pub use compact::{
    compact_session, compact_session_with_strategy, emergency_compact, recent_user_messages,
    smart_truncate, SUMMARY_ACKNOWLEDGMENT, SUMMARY_MESSAGE_PREFIX,
};
pub use events::{AgentEvent, CompactionStrategyUsed};
pub use interrupt::{classify_interrupt, InterruptAction, InterruptActivity};
pub use prompts::system_prompt;
pub use runtime_context::AgentRuntimeContext;
pub use session::{Session, TurnRecord};
