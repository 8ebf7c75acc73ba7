// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use futures::StreamExt;

use axon_model::{CompletionRequest, Message, ModelProvider, ResponseEvent};

/// Snapshot of what the agentic loop is doing when a mid-turn user utterance
/// arrives, handed to the classifier for context.
#[derive(Debug, Clone)]
pub struct InterruptActivity {
    pub current_task: String,
    pub tools_run: u32,
    pub active_tool: Option<String>,
    pub prose_len: usize,
}

/// What to do with a mid-turn user utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Stop the in-flight turn and discard its partial work.
    Cancel,
    /// Weave the utterance into the current turn without stopping it.
    Interject,
    /// Let the current turn finish; handle the utterance as the next turn.
    Queue,
}

const CANCEL_WORDS: &[&str] = &[
    "/stop",
    "/cancel",
    "stop",
    "abort",
    "cancel",
    "never mind",
    "nevermind",
    "halt",
];

const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(3);

/// Classify a mid-turn user utterance into an [`InterruptAction`].
///
/// Tries the heuristic fast path first (cheap, deterministic); falls back to
/// a one-shot call against `classifier` with a hard timeout. Any failure,
/// timeout, or unrecognised reply defaults to `Queue` — interrupting
/// in-progress work is never the safe default.
pub async fn classify_interrupt(
    utterance: &str,
    activity: &InterruptActivity,
    classifier: Option<&(dyn ModelProvider)>,
) -> InterruptAction {
    let trimmed = utterance.trim().to_lowercase();
    if trimmed.is_empty() {
        return InterruptAction::Queue;
    }
    for word in CANCEL_WORDS {
        if trimmed == *word || trimmed.starts_with(&format!("{word} ")) {
            return InterruptAction::Cancel;
        }
    }

    let Some(model) = classifier else {
        return InterruptAction::Queue;
    };

    match tokio::time::timeout(CLASSIFY_TIMEOUT, fast_classify(model, utterance, activity)).await {
        Ok(Ok(action)) => action,
        Ok(Err(_)) | Err(_) => InterruptAction::Queue,
    }
}

async fn fast_classify(
    model: &dyn ModelProvider,
    utterance: &str,
    activity: &InterruptActivity,
) -> anyhow::Result<InterruptAction> {
    let prompt = format!(
        "You are classifying a mid-task interruption for a coding agent.\n\
         Current task: \"{}\"\n\
         Tool calls run so far: {}\n\
         Active tool: {}\n\
         Response text generated so far: {} chars\n\
         The user just said: \"{}\"\n\n\
         Reply with exactly one word: cancel, interject, or queue.",
        activity.current_task,
        activity.tools_run,
        activity.active_tool.as_deref().unwrap_or("none"),
        activity.prose_len,
        utterance,
    );

    let req = CompletionRequest {
        messages: vec![Message::user(prompt)],
        tools: vec![],
        stream: false,
        ..Default::default()
    };

    let mut stream = model.complete(req).await?;
    let mut reply = String::new();
    while let Some(event) = stream.next().await {
        if let ResponseEvent::TextDelta(delta) = event? {
            reply.push_str(&delta);
        }
    }

    let first_word = reply.trim().to_lowercase();
    let first_word = first_word.split_whitespace().next().unwrap_or("");
    Ok(match first_word {
        "cancel" | "abort" | "stop" => InterruptAction::Cancel,
        "interject" | "inject" => InterruptAction::Interject,
        "queue" | "wait" | "later" => InterruptAction::Queue,
        _ => InterruptAction::Queue,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity() -> InterruptActivity {
        InterruptActivity {
            current_task: "refactor the parser".into(),
            tools_run: 3,
            active_tool: Some("run_terminal_command".into()),
            prose_len: 120,
        }
    }

    #[tokio::test]
    async fn empty_utterance_queues() {
        let action = classify_interrupt("", &activity(), None).await;
        assert_eq!(action, InterruptAction::Queue);
    }

    #[tokio::test]
    async fn bare_stop_cancels() {
        assert_eq!(
            classify_interrupt("stop", &activity(), None).await,
            InterruptAction::Cancel
        );
        assert_eq!(
            classify_interrupt("  ABORT  ", &activity(), None).await,
            InterruptAction::Cancel
        );
        assert_eq!(
            classify_interrupt("/cancel please", &activity(), None).await,
            InterruptAction::Cancel
        );
    }

    #[tokio::test]
    async fn unmatched_prefix_is_not_cancel() {
        // "stopper" is not "stop" followed by a space boundary.
        assert_eq!(
            classify_interrupt("stopper the loop", &activity(), None).await,
            InterruptAction::Queue
        );
    }

    #[tokio::test]
    async fn no_classifier_defaults_to_queue() {
        assert_eq!(
            classify_interrupt("also add tests please", &activity(), None).await,
            InterruptAction::Queue
        );
    }
}
