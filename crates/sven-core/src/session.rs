// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sven_model::Message;
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
    /// Reserved output budget (provider `max_tokens` for a single completion).
    /// Subtracted from `max_tokens` when computing `input_budget`.
    pub max_output_tokens: usize,
    /// Estimated token cost of the tool schemas sent with every request.
    /// Recomputed per-turn from the active mode's tool set.
    pub schema_overhead: usize,
    /// Correction factor applied to the chars/4 token estimate, derived from
    /// comparing estimates against the provider's actually-reported usage.
    /// Starts at 1.0 (no correction) and drifts as real usage comes in.
    pub calibration_factor: f32,
    /// Running total of prompt-cache-read tokens reported by the provider.
    pub cache_read_total: u64,
    /// Running total of prompt-cache-write tokens reported by the provider.
    pub cache_write_total: u64,
    /// Monotonic counter stamped onto every pushed message; gives each
    /// message a stable object identity for the token-estimate cache even
    /// though `Message` itself is a plain value type with no pointer identity.
    next_seq: u64,
    /// Per-message token estimate cache keyed by the `seq` stamped at push
    /// time. Avoids re-estimating `approx_tokens()` for messages that have
    /// already been measured once; invalidated wholesale on replace/compact.
    token_cache: HashMap<u64, usize>,
    /// Sequence number assigned to each message in `messages`, same length
    /// and order as `messages`. Used to find a message's cache entry and to
    /// detect which cache entries are now orphaned after a splice.
    seqs: Vec<u64>,
    /// Content-dedup index for tool results: sha256 hex digest of a
    /// formatted tool result body -> the call_id that produced it first.
    /// The tool orchestrator consults this before appending a new result to
    /// decide whether to emit a `[Duplicate result: see call id X]` pointer
    /// instead of the full body.
    pub dedup_index: HashMap<String, String>,
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
            next_seq: 0,
            token_cache: HashMap::new(),
            seqs: Vec::new(),
            dedup_index: HashMap::new(),
        }
    }

    pub fn push(&mut self, msg: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let tokens = msg.approx_tokens();
        self.token_cache.insert(seq, tokens);
        self.seqs.push(seq);
        self.token_count += tokens;
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Tokens available for conversation input: the context window minus the
    /// reserved output budget and the current tool-schema overhead. Zero if
    /// the window is not yet known (max_tokens == 0).
    pub fn input_budget(&self) -> usize {
        if self.max_tokens == 0 {
            return 0;
        }
        self.max_tokens
            .saturating_sub(self.max_output_tokens)
            .saturating_sub(self.schema_overhead)
    }

    /// Recalculate token count from scratch (call after compaction or any
    /// direct mutation of `messages` that bypasses `push`).
    ///
    /// Re-stamps every message with a fresh `seq` and rebuilds the token
    /// cache; any previously cached estimates for messages dropped during
    /// compaction become unreachable and are discarded with the old map.
    pub fn recalculate_tokens(&mut self) {
        self.token_cache.clear();
        self.seqs.clear();
        let mut total = 0usize;
        for msg in &self.messages {
            let seq = self.next_seq;
            self.next_seq += 1;
            let tokens = msg.approx_tokens();
            self.token_cache.insert(seq, tokens);
            self.seqs.push(seq);
            total += tokens;
        }
        self.token_count = total;
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Record cache usage reported by the provider for the turn just completed.
    pub fn add_cache_usage(&mut self, cache_read_tokens: u32, cache_write_tokens: u32) {
        self.cache_read_total += cache_read_tokens as u64;
        self.cache_write_total += cache_write_tokens as u64;
    }

    /// Nudge `calibration_factor` towards the ratio of actual-to-estimated
    /// input tokens reported by the provider for the turn just completed.
    /// Exponential moving average (alpha = 0.3) so a single outlier turn
    /// cannot swing the estimate for the rest of the session.
    pub fn update_calibration(&mut self, actual_input: u32, estimated: usize) {
        if estimated == 0 {
            return;
        }
        let observed = actual_input as f32 / estimated as f32;
        if !observed.is_finite() || observed <= 0.0 {
            return;
        }
        const ALPHA: f32 = 0.3;
        self.calibration_factor = self.calibration_factor * (1.0 - ALPHA) + observed * ALPHA;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
