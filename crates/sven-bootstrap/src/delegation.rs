// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Named and pooled delegation tools: `agent`, `explore`, `plan`, `kill_agent`.
//!
//! Unlike [`crate::task_tool::TaskTool`] (always fresh, never pooled), these
//! tools reuse a previously constructed sub-agent instance when one is
//! already idle in the [`AgentPool`] under the same identity — same name,
//! same base system prompt, same tool set. `explore` and `plan` are fixed
//! specialized presets built on the same pool mechanism; `agent` resolves
//! its base prompt from a discovered, named subagent definition.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use sven_config::{AgentConfig, AgentMode, Config};
use sven_core::{
    pool_key, Agent, AgentPool, AgentPoolLimits, AgentRuntimeContext, ActivityWatchdog,
    AgentEvent,
};

use sven_tools::{
    events::{TodoItem, ToolEvent},
    policy::ApprovalPolicy,
    tool::{Tool, ToolCall, ToolOutput},
};

use crate::context::{ToolSetProfile, WatchdogCell};
use crate::registry::build_tool_registry;
use crate::task_tool::{pause_own_watchdog, summary_fallback, MAX_DEPTH};

/// Build the sub-agent tool registry and mode/event plumbing shared by every
/// pooled delegation tool's `execute`, and run `prompt` through whichever
/// instance the pool hands back (fresh or reused).
///
/// `base_prompt` identifies the pooled class (see [`pool_key`]); it is also
/// appended to the sub-agent's system prompt so the model actually adopts
/// the persona/instructions it was pooled under.
#[allow(clippy::too_many_arguments)]
async fn run_pooled(
    pool_name: &str,
    base_prompt: &str,
    prompt: &str,
    mode: AgentMode,
    model: Arc<dyn sven_model::ModelProvider>,
    config: &Arc<Config>,
    sub_agent_runtime: &AgentRuntimeContext,
    own_watchdog: &WatchdogCell,
    pool: &Arc<AgentPool>,
    required_tools: Option<&[&str]>,
) -> Result<String, String> {
    let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));
    let task_depth = Arc::new(AtomicUsize::new(0));
    let child_watchdog_cell: WatchdogCell = Arc::new(Mutex::new(None));
    let mode_lock = Arc::new(Mutex::new(mode));
    let (tool_event_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);

    let profile = ToolSetProfile::SubAgent {
        todos,
        task_depth,
        own_watchdog: child_watchdog_cell.clone(),
    };

    // Sub-agents delegate further only through the one-shot `task` tool, so
    // the pool handed to their own registry is never consulted.
    let unused_pool = Arc::new(AgentPool::new(AgentPoolLimits::default()));

    let mut runtime = sub_agent_runtime.clone();
    runtime.append_system_prompt = match &runtime.append_system_prompt {
        Some(existing) => Some(format!("{existing}\n\n{base_prompt}")),
        None => Some(base_prompt.to_string()),
    };

    let registry = build_tool_registry(
        config,
        model.clone(),
        profile,
        mode_lock.clone(),
        tool_event_tx,
        runtime.clone(),
        unused_pool,
    );
    let tool_names = registry.names();
    let key = pool_key(pool_name, base_prompt, &tool_names);

    let agent_handle = match pool.acquire(&key).await {
        Some(handle) => {
            debug!(key = %key, "delegation pool hit");
            handle
        }
        None => {
            debug!(key = %key, "delegation pool miss — constructing fresh sub-agent");
            let sub_config: AgentConfig = config.agent.clone();
            let mut agent = Agent::new(
                model,
                Arc::new(registry),
                Arc::new(sub_config),
                runtime,
                mode_lock,
                tool_event_rx,
                128_000,
            );

            if let Some(names) = required_tools {
                agent.set_required_tools(names.iter().map(|s| s.to_string()).collect());
            }

            let (cancel_tx, _cancel_rx) = oneshot::channel();
            let watchdog = ActivityWatchdog::spawn(Duration::from_millis(60_000), cancel_tx);
            agent.set_watchdog(watchdog.clone());
            *child_watchdog_cell.lock().await = Some(watchdog);

            let handle = Arc::new(Mutex::new(agent));
            pool.insert(key.clone(), handle.clone()).await;
            handle
        }
    };

    // Every call gets its own cancellation channel kept alive for the call's
    // duration; the sender is never signalled, so it never fires. Pooled
    // reuse doesn't re-arm an inactivity watchdog per call — only the
    // construction-time window is guarded; idle eviction reclaims instances
    // that are truly stuck.
    let (_keepalive_tx, cancel_rx) = oneshot::channel::<()>();

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);

    let mut agent = agent_handle.lock().await;
    let guard = pause_own_watchdog(own_watchdog).await;
    let submit_result = agent.submit_with_cancel(prompt, tx, cancel_rx).await;
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

    let result = match submit_result {
        Ok(_) => Ok(summary_fallback(&agent, output)),
        Err(e) => Err(format!("sub-agent error: {e}")),
    };
    drop(agent);
    pool.release(&key).await;
    result
}

// ─── AgentTool ─────────────────────────────────────────────────────────────

/// Generic named-pool delegation: spawns (or reuses) a sub-agent whose
/// persona is a discovered, named subagent definition.
pub struct AgentTool {
    model: Arc<dyn sven_model::ModelProvider>,
    config: Arc<Config>,
    /// Shared with `task`/`explore`/`plan`'s own depth counters at the same
    /// nesting level so `task` calls made *by* a delegated agent still
    /// respect `MAX_DEPTH`.
    depth: Arc<AtomicUsize>,
    sub_agent_runtime: AgentRuntimeContext,
    own_watchdog: WatchdogCell,
    pool: Arc<AgentPool>,
}

impl AgentTool {
    pub fn new(
        model: Arc<dyn sven_model::ModelProvider>,
        config: Arc<Config>,
        depth: Arc<AtomicUsize>,
        sub_agent_runtime: AgentRuntimeContext,
        own_watchdog: WatchdogCell,
        pool: Arc<AgentPool>,
    ) -> Self {
        Self {
            model,
            config,
            depth,
            sub_agent_runtime,
            own_watchdog,
            pool,
        }
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        "agent"
    }

    fn description(&self) -> &str {
        "Delegate a task to a named specialized sub-agent (e.g. a project-defined \
         \"math-expert\"). Reuses a warm instance of that agent when one is idle, so \
         repeated delegation to the same named agent keeps its conversation history. \
         Use `kill_agent` to force a named agent to start fresh."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Name of the discovered subagent definition to delegate to"
                },
                "prompt": {
                    "type": "string",
                    "description": "The task description for the named agent"
                },
                "mode": {
                    "type": "string",
                    "enum": ["research", "plan", "agent"],
                    "description": "Operating mode for the sub-agent (default: agent)"
                }
            },
            "required": ["name", "prompt"],
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
        let name = match call.args.get("name").and_then(|v| v.as_str()) {
            Some(n) => n.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'name'"),
        };
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };
        let mode = match call.args.get("mode").and_then(|v| v.as_str()).unwrap_or("agent") {
            "research" => AgentMode::Research,
            "plan" => AgentMode::Plan,
            "agent" => AgentMode::Agent,
            other => return ToolOutput::err(&call.id, format!("unknown mode: {other}")),
        };

        if self.depth.load(Ordering::Relaxed) >= MAX_DEPTH {
            return ToolOutput::err(&call.id, format!("maximum sub-agent depth ({MAX_DEPTH}) reached"));
        }

        let definitions = self.sub_agent_runtime.agents.get();
        let Some(info) = definitions.iter().find(|a| a.name == name) else {
            return ToolOutput::err(
                &call.id,
                format!("no subagent named '{name}' is registered — check .sven/agents/"),
            );
        };
        let base_prompt = info.content.clone();

        self.depth.fetch_add(1, Ordering::Relaxed);
        let result = run_pooled(
            &name,
            &base_prompt,
            &prompt,
            mode,
            self.model.clone(),
            &self.config,
            &self.sub_agent_runtime,
            &self.own_watchdog,
            &self.pool,
            None,
        )
        .await;
        self.depth.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(text) => ToolOutput::ok(&call.id, text),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
}

// ─── ExploreTool ───────────────────────────────────────────────────────────

const EXPLORE_BASE_PROMPT: &str = "You are a read-only research sub-agent. Investigate the \
    codebase to answer the question you were given; do not modify any files. Report your \
    findings clearly, citing file paths and line numbers where relevant.";

/// Fixed specialized preset: a read-only research sub-agent over the same
/// pool mechanism as `agent`.
pub struct ExploreTool {
    model: Arc<dyn sven_model::ModelProvider>,
    config: Arc<Config>,
    sub_agent_runtime: AgentRuntimeContext,
    own_watchdog: WatchdogCell,
    pool: Arc<AgentPool>,
}

impl ExploreTool {
    pub fn new(
        model: Arc<dyn sven_model::ModelProvider>,
        config: Arc<Config>,
        sub_agent_runtime: AgentRuntimeContext,
        own_watchdog: WatchdogCell,
        pool: Arc<AgentPool>,
    ) -> Self {
        Self {
            model,
            config,
            sub_agent_runtime,
            own_watchdog,
            pool,
        }
    }
}

#[async_trait]
impl Tool for ExploreTool {
    fn name(&self) -> &str {
        "explore"
    }

    fn description(&self) -> &str {
        "Delegate a read-only investigation to a pooled research sub-agent. Use this for \
         open-ended codebase questions that don't require editing files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The question or investigation to delegate"
                }
            },
            "required": ["prompt"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }
    fn is_safe_concurrent(&self) -> bool {
        true
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Research, AgentMode::Plan, AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };

        let result = run_pooled(
            "explore",
            EXPLORE_BASE_PROMPT,
            &prompt,
            AgentMode::Research,
            self.model.clone(),
            &self.config,
            &self.sub_agent_runtime,
            &self.own_watchdog,
            &self.pool,
            None,
        )
        .await;

        match result {
            Ok(text) => ToolOutput::ok(&call.id, text),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
}

// ─── PlanTool ──────────────────────────────────────────────────────────────

const PLAN_BASE_PROMPT: &str = "You are a planning sub-agent. Break the given task into \
    concrete, ordered steps and record them with the todo_write tool before giving your \
    final answer — a text-only reply without recording a plan is not an acceptable result.";

/// Fixed specialized preset: a planning sub-agent that must record its plan
/// via `todo_write` before finishing. Uses `Agent::set_required_tools` to
/// enforce that, same mechanism the teacher's required-tools machinery
/// already provides for ordinary turns.
pub struct PlanTool {
    model: Arc<dyn sven_model::ModelProvider>,
    config: Arc<Config>,
    sub_agent_runtime: AgentRuntimeContext,
    own_watchdog: WatchdogCell,
    pool: Arc<AgentPool>,
}

impl PlanTool {
    pub fn new(
        model: Arc<dyn sven_model::ModelProvider>,
        config: Arc<Config>,
        sub_agent_runtime: AgentRuntimeContext,
        own_watchdog: WatchdogCell,
        pool: Arc<AgentPool>,
    ) -> Self {
        Self {
            model,
            config,
            sub_agent_runtime,
            own_watchdog,
            pool,
        }
    }
}

#[async_trait]
impl Tool for PlanTool {
    fn name(&self) -> &str {
        "plan"
    }

    fn description(&self) -> &str {
        "Delegate planning to a pooled sub-agent that must record its plan via todo_write \
         before replying. Use this to break a large task into steps before executing them."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task to plan"
                }
            },
            "required": ["prompt"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }
    fn is_safe_concurrent(&self) -> bool {
        true
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Plan, AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };

        let result = run_pooled(
            "plan",
            PLAN_BASE_PROMPT,
            &prompt,
            AgentMode::Plan,
            self.model.clone(),
            &self.config,
            &self.sub_agent_runtime,
            &self.own_watchdog,
            &self.pool,
            Some(&["todo_write"]),
        )
        .await;

        match result {
            Ok(text) => ToolOutput::ok(&call.id, text),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
}

// ─── KillAgentTool ─────────────────────────────────────────────────────────

/// Explicit pool slot eviction, by exact key or by subagent name prefix.
/// Forces the next delegation to that name/key to start from a fresh
/// instance instead of continuing a stale conversation.
pub struct KillAgentTool {
    pool: Arc<AgentPool>,
}

impl KillAgentTool {
    pub fn new(pool: Arc<AgentPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Tool for KillAgentTool {
    fn name(&self) -> &str {
        "kill_agent"
    }

    fn description(&self) -> &str {
        "Evict a pooled sub-agent so the next delegation to it starts fresh instead of \
         continuing its prior conversation. Provide the subagent `name` used with `agent`, \
         or an exact pool `key` if you have one."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Subagent name whose pooled instance(s) should be evicted"
                },
                "key": {
                    "type": "string",
                    "description": "Exact pool key to evict, if known"
                }
            },
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let key = call.args.get("key").and_then(|v| v.as_str());
        let name = call.args.get("name").and_then(|v| v.as_str());

        match (key, name) {
            (Some(key), _) => {
                let evicted = self.pool.evict(key).await;
                if evicted {
                    ToolOutput::ok(&call.id, format!("evicted pool slot '{key}'"))
                } else {
                    ToolOutput::ok(&call.id, format!("no idle slot found for key '{key}'"))
                }
            }
            (None, Some(name)) => {
                let count = self.pool.evict_by_name(name).await;
                ToolOutput::ok(&call.id, format!("evicted {count} slot(s) for subagent '{name}'"))
            }
            (None, None) => ToolOutput::err(&call.id, "provide either 'name' or 'key'"),
        }
    }
}
