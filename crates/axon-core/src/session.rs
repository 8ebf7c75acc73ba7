// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use axon_model::Message;
use uuid::Uuid;

/// One saved turn in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// In-memory conversation session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// Maximum output tokens the model may produce in a single completion
    /// (from the provider's catalog entry). Reserved out of the input budget.
    pub max_output_tokens: usize,
    /// Estimated token cost of the tool schemas + system overhead sent on
    /// every request. Recomputed each turn from the active mode's tool set.
    pub schema_overhead: usize,
    /// Multiplicative correction applied to the `chars/4` token estimate,
    /// learned from the provider's actual reported input token counts.
    /// Starts at 1.0 (no correction) and is updated via an exponential
    /// moving average after every `Usage` event.
    pub calibration_factor: f32,
    /// Running total of prompt-cache-read tokens across the session.
    pub cache_read_total: u64,
    /// Running total of prompt-cache-write tokens across the session.
    pub cache_write_total: u64,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
        }
    }

    /// Tokens available for input context: the context window minus the
    /// reserved output budget. Zero if the window is smaller than the
    /// reserved output (treated by callers as "budget checks disabled").
    pub fn input_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }

    /// Record prompt-cache token usage reported by the provider for this turn.
    pub fn add_cache_usage(&mut self, cache_read: u32, cache_write: u32) {
        self.cache_read_total += cache_read as u64;
        self.cache_write_total += cache_write as u64;
    }

    /// Update the chars/4 calibration factor from one provider-reported
    /// input token count, using an exponential moving average so a single
    /// noisy turn cannot swing the estimate.
    ///
    /// `actual` is the provider's reported input token count (including
    /// cache-read tokens); `estimated` is this crate's chars/4-based guess
    /// for the same request.
    pub fn update_calibration(&mut self, actual: u32, estimated: usize) {
        if estimated == 0 || actual == 0 {
            return;
        }
        let sample = actual as f32 / estimated as f32;
        // Clamp to a sane range — a wildly off sample (e.g. from a
        // provider that rounds usage to the nearest 100) should not be
        // allowed to push the factor to an extreme.
        let sample = sample.clamp(0.25, 4.0);
        const ALPHA: f32 = 0.2;
        self.calibration_factor = self.calibration_factor * (1.0 - ALPHA) + sample * ALPHA;
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs { self.push(m); }
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 { return 0.0; }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
