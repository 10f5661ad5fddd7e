// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! TaskTool — spawns a sub-agent to complete a focused sub-task.
//!
//! Moved from `sven-core` to `sven-bootstrap` so that TaskTool can use
//! `build_tool_registry` without creating a circular dependency
//! (sven-core → sven-tools, sven-bootstrap → sven-core + sven-tools).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use sven_config::{AgentConfig, AgentMode, Config};
use sven_core::{Agent, ActivityWatchdog, AgentEvent, AgentRuntimeContext, WatchdogPauseGuard};

use sven_tools::{
    events::{TodoItem, ToolEvent},
    policy::ApprovalPolicy,
    tool::{Tool, ToolCall, ToolOutput},
};

use crate::context::{ToolSetProfile, WatchdogCell};
use crate::registry::build_tool_registry;

pub(crate) const MAX_DEPTH: usize = 3;

/// Scanned when the sub-agent's own final text is empty (e.g. the last round
/// was tool-calls-only, or the run was interrupted mid-stream).
pub(crate) const NO_RESULT_FALLBACK: &str = "(sub-agent completed with no recoverable text output)";

/// Recover a usable result from a finished sub-agent: its streamed text if
/// non-empty, else the last non-empty assistant message in its history, else
/// a stable canned message. Dropping a sub-agent's work entirely just
/// because its very last turn produced no text would throw away useful
/// output the model already committed to its own history.
pub(crate) fn summary_fallback(agent: &Agent, streamed: String) -> String {
    let trimmed = streamed.trim();
    if !trimmed.is_empty() {
        return streamed;
    }
    agent
        .last_assistant_text()
        .unwrap_or_else(|| NO_RESULT_FALLBACK.to_string())
}

/// Pause `watchdog_cell`'s watchdog (if one has been deposited) for the
/// duration of the returned guard. Used while a delegation tool awaits a
/// child so the parent's own inactivity timer doesn't fire while it is in
/// fact busy waiting on delegated work.
pub(crate) async fn pause_own_watchdog(watchdog_cell: &WatchdogCell) -> WatchdogPauseGuard {
    let watchdog = watchdog_cell.lock().await.clone();
    WatchdogPauseGuard::new(watchdog)
}

/// Spawn a fresh activity watchdog for a newly constructed sub-agent, attach
/// it to the agent, and deposit it into `cell` so that agent's own
/// delegation tools can pause it while awaiting a grandchild.
pub(crate) async fn arm_watchdog(
    agent: &mut Agent,
    cell: &WatchdogCell,
    timeout_ms: u64,
) -> oneshot::Receiver<()> {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let watchdog = ActivityWatchdog::spawn(Duration::from_millis(timeout_ms), cancel_tx);
    agent.set_watchdog(watchdog.clone());
    *cell.lock().await = Some(watchdog);
    cancel_rx
}

/// Spawns a sub-agent to complete a focused task and returns its text output.
/// Always constructs fresh: unlike [`crate::delegation::AgentTool`], `task`
/// never reuses a pooled instance, so nothing about it survives past one
/// call.
pub struct TaskTool {
    model: Arc<dyn sven_model::ModelProvider>,
    config: Arc<Config>,
    depth: Arc<AtomicUsize>,
    /// Runtime context to pass to each sub-agent (project root, CI/git notes,
    /// AGENTS.md content).  Sub-agents inherit the parent's context so they
    /// know where to operate.
    sub_agent_runtime: AgentRuntimeContext,
    /// Slot holding the watchdog of the agent this tool is embedded in (if
    /// any), paused for the duration of each delegated call.
    own_watchdog: WatchdogCell,
}

impl TaskTool {
    pub fn new(
        model: Arc<dyn sven_model::ModelProvider>,
        config: Arc<Config>,
        depth: Arc<AtomicUsize>,
        sub_agent_runtime: AgentRuntimeContext,
        own_watchdog: WatchdogCell,
    ) -> Self {
        Self {
            model,
            config,
            depth,
            sub_agent_runtime,
            own_watchdog,
        }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to complete a focused task and return its final text output. \
         Useful for delegating isolated sub-tasks. The sub-agent has access to all standard \
         tools. Maximum nesting depth is 3."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task description for the sub-agent"
                },
                "mode": {
                    "type": "string",
                    "enum": ["research", "plan", "agent"],
                    "description": "Operating mode for the sub-agent (default: agent)"
                },
                "max_rounds": {
                    "type": "integer",
                    "description": "Maximum tool-call rounds (default: from config)"
                }
            },
            "required": ["prompt"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }
    fn is_safe_concurrent(&self) -> bool {
        true
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };
        let mode_str = call
            .args
            .get("mode")
            .and_then(|v| v.as_str())
            .unwrap_or("agent");
        let mode = match mode_str {
            "research" => AgentMode::Research,
            "plan" => AgentMode::Plan,
            "agent" => AgentMode::Agent,
            other => return ToolOutput::err(&call.id, format!("unknown mode: {other}")),
        };

        let current_depth = self.depth.load(Ordering::Relaxed);
        if current_depth >= MAX_DEPTH {
            return ToolOutput::err(
                &call.id,
                format!("maximum sub-agent depth ({MAX_DEPTH}) reached"),
            );
        }

        self.depth.fetch_add(1, Ordering::Relaxed);
        debug!(prompt = %prompt, mode = %mode, depth = current_depth + 1, "task: spawning sub-agent");

        let mut sub_config: AgentConfig = self.config.agent.clone();
        if let Some(max_rounds) = call.args.get("max_rounds").and_then(|v| v.as_u64()) {
            sub_config.max_tool_rounds = max_rounds as u32;
        }
        let activity_timeout_ms = sub_config.activity_timeout_ms;

        let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));
        let child_watchdog_cell: WatchdogCell = Arc::new(Mutex::new(None));

        let profile = ToolSetProfile::SubAgent {
            todos,
            task_depth: self.depth.clone(),
            own_watchdog: child_watchdog_cell.clone(),
        };

        // Shared mode lock and tool-event channel wired through to the agent
        // so SwitchModeTool and TodoWriteTool events are correctly observed.
        let mode_lock = Arc::new(Mutex::new(mode));
        let (tool_event_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);

        // Sub-agent pool is unused here: `task` never pools, so it never
        // registers `agent`/`explore`/`plan` in the child's own registry.
        let pool = Arc::new(sven_core::AgentPool::new(
            sven_core::AgentPoolLimits::default(),
        ));

        let tools = Arc::new(build_tool_registry(
            &self.config,
            self.model.clone(),
            profile,
            mode_lock.clone(),
            tool_event_tx,
            self.sub_agent_runtime.clone(),
            pool,
        ));

        let mut agent = Agent::new(
            self.model.clone(),
            tools,
            Arc::new(sub_config),
            self.sub_agent_runtime.clone(),
            mode_lock,
            tool_event_rx,
            128_000,
        );

        let cancel_rx = arm_watchdog(&mut agent, &child_watchdog_cell, activity_timeout_ms).await;

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);

        let guard = pause_own_watchdog(&self.own_watchdog).await;
        let submit_result = agent.submit_with_cancel(&prompt, tx, cancel_rx).await;
        drop(guard);

        let mut output = String::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                AgentEvent::TextDelta(delta) => output.push_str(&delta),
                AgentEvent::Aborted { partial_text } => {
                    if output.is_empty() {
                        output = partial_text;
                    }
                }
                _ => {}
            }
        }

        self.depth.fetch_sub(1, Ordering::Relaxed);

        match submit_result {
            Ok(_) => ToolOutput::ok(&call.id, summary_fallback(&agent, output)),
            Err(e) => ToolOutput::err(&call.id, format!("sub-agent error: {e}")),
        }
    }
}
