// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use sven_config::AgentMode;
use sven_tools::{events::TodoItem, ToolCall};

/// Which compaction strategy actually ran for a given `ContextCompacted` event.
///
/// Distinct from [`sven_config::CompactionStrategy`] (the configured
/// preference): the emergency path can run even when the config asks for
/// `Structured` or `Narrative`, if the model-backed summarisation call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    Structured,
    Narrative,
    /// Deterministic drop-oldest-messages fallback; no model call involved.
    Emergency,
}

/// Events emitted by the agent during a single turn.
/// Consumers (CI runner, TUI) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a Thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompactionStrategyUsed,
        turn: u32,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Running total of cache-read tokens for the whole session.
        cache_read_total: u64,
        /// Running total of cache-write tokens for the whole session.
        cache_write_total: u64,
        /// The model's context window, as currently known to the session.
        max_tokens: usize,
    },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// The current turn was interrupted (user cancel or a fired activity
    /// watchdog); any text already streamed is kept in `partial_text` and
    /// committed to the session as a partial assistant message.
    Aborted { partial_text: String },
    /// A recoverable error occurred
    Error(String),
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed
    ModeChanged(AgentMode),
    /// The agent is asking the user a question (id links to QuestionAnswer)
    Question { id: String, questions: Vec<String> },
    /// Answer to a previous Question event
    QuestionAnswer { id: String, answer: String },

    // ── Activity stream: orchestration lifecycle ───────────────────────────
    /// A (possibly delegated) agent started working on a task.
    AgentStart { agent_id: String, parent_id: Option<String>, label: String },
    /// A (possibly delegated) agent finished, successfully or not.
    AgentEnd { agent_id: String, is_error: bool },
    /// A permission request was raised for a tool call awaiting approval.
    PermissionRequest { request_id: String, tool_name: String, summary: String },
    /// A previously raised permission request was resolved.
    PermissionResponse { request_id: String, approved: bool, remember: bool },
    /// The user asked to interrupt the current turn (and any delegated subtree).
    UserInterruptInitiated { agent_id: String },
}
