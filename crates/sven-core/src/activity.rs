// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed pub/sub bus that every agent in a delegation tree publishes onto.
//!
//! `AgentEvent` (see [`crate::events`]) is the projection of this stream that
//! existing consumers (TUI, CI runner) already understand: the turn loop
//! still sends `AgentEvent`s on its own `mpsc::Sender` for those paths. The
//! `ActivityStream` is the superset channel that lets orchestration-internal
//! concerns -- permission prompts, pool lifecycle, nested-agent start/stop --
//! be observed without threading a bespoke channel through every subsystem.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::warn;
use uuid::Uuid;

use sven_tools::ToolCall;

/// One event on the activity bus. `agent_id`/`parent_id` correlate events
/// produced by a delegation subtree back to the agent that spawned it.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub id: String,
    pub agent_id: String,
    pub parent_id: Option<String>,
    pub kind: EventKind,
}

/// The full event vocabulary. Request/response pairs are correlated by the
/// `id` carried on the enclosing [`ActivityEvent`] -- there is no reply
/// channel; a requester subscribes and waits for the matching response kind.
#[derive(Debug, Clone)]
pub enum EventKind {
    AgentStart { label: String },
    AgentEnd { is_error: bool },
    ToolCallStart { call: ToolCall },
    ToolOutputChunk { call_id: String, chunk: String },
    ToolCallEnd { call_id: String, is_error: bool },
    PermissionRequest { tool_name: String, summary: String },
    PermissionResponse { approved: bool, remember: bool },
    InterruptAll,
}

const LISTENER_WARN_THRESHOLD: usize = 50;

/// Shared activity bus for one top-level agent and all of its delegated
/// descendants. Cloning an `ActivityStream` shares the same broadcast
/// channel and listener-count bookkeeping; [`ActivityStream::create_scoped`]
/// derives a child view stamped with a fixed `agent_id`/`parent_id` so a
/// delegated agent doesn't have to pass those fields on every emit.
#[derive(Clone)]
pub struct ActivityStream {
    tx: broadcast::Sender<ActivityEvent>,
    agent_id: String,
    parent_id: Option<String>,
    /// One flag per distinct warning reason, shared across clones, so the
    /// "too many listeners" warning fires at most once for the bus's
    /// lifetime rather than once per emit.
    warned: Arc<Mutex<HashMap<&'static str, ()>>>,
    over_threshold_warned: Arc<AtomicBool>,
}

impl ActivityStream {
    /// Create a fresh root bus for a new top-level agent.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            agent_id: Uuid::new_v4().to_string(),
            parent_id: None,
            warned: Arc::new(Mutex::new(HashMap::new())),
            over_threshold_warned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Publish an event tagged with this stream's `agent_id`/`parent_id`.
    /// A closed channel (no subscribers left) is not an error: activity
    /// events are best-effort observability, not a control path.
    pub fn emit(&self, kind: EventKind) -> String {
        let id = Uuid::new_v4().to_string();
        let event = ActivityEvent {
            id: id.clone(),
            agent_id: self.agent_id.clone(),
            parent_id: self.parent_id.clone(),
            kind,
        };
        let _ = self.tx.send(event);

        let n = self.tx.receiver_count();
        if n > LISTENER_WARN_THRESHOLD && !self.over_threshold_warned.swap(true, Ordering::Relaxed)
        {
            warn!(
                listener_count = n,
                "activity stream has more than {} subscribers; possible listener leak",
                LISTENER_WARN_THRESHOLD
            );
        }
        id
    }

    /// Subscribe to all events on this bus (including those emitted by
    /// delegated descendants created via `create_scoped`).
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.tx.subscribe()
    }

    /// Derive a child view for a delegated agent: same underlying channel,
    /// but events emitted through it are stamped with a new `agent_id` and
    /// `parent_id` set to this stream's `agent_id`.
    pub fn create_scoped(&self, agent_id: impl Into<String>) -> Self {
        Self {
            tx: self.tx.clone(),
            agent_id: agent_id.into(),
            parent_id: Some(self.agent_id.clone()),
            warned: self.warned.clone(),
            over_threshold_warned: self.over_threshold_warned.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
