// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime context types for agent construction.
//!
//! [`RuntimeContext`] holds environment-detected information (project root,
//! git state, CI environment) that is not part of the config file schema.
//!
//! [`ToolSetProfile`] selects which tools to register, and carries the
//! shared state needed by stateful tools (todos, mode lock, GDB state).

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::sync::atomic::AtomicUsize;

use tokio::sync::{mpsc, Mutex};

use sven_core::{ActivityWatchdog, Agent};
use sven_tools::{
    events::TodoItem,
    QuestionRequest,
};
use sven_runtime::{CiContext, GitContext, SharedAgents, SharedSkills};

/// Slot a delegating tool deposits a freshly spawned sub-agent's watchdog
/// into, so it can pause that watchdog while awaiting a grandchild call.
/// `None` until [`crate::task_tool::arm_watchdog`] fills it in.
pub type WatchdogCell = Arc<Mutex<Option<Arc<ActivityWatchdog>>>>;

/// What an agent deposits about itself after construction, for consumption by
/// delegation tools living in its own registry.
///
/// Filled in by the delegating tool one level up, right after constructing
/// the agent this cell belongs to — never by the agent itself. Always empty
/// for a top-level, user-driven agent (it has no watchdog and nothing holds
/// an `Arc<Mutex<Agent>>` around it to take a `Weak` from).
#[derive(Default)]
pub struct OwnHandle {
    /// This agent's own activity watchdog, paused while one of its tools
    /// awaits a grandchild.
    pub watchdog: Option<Arc<ActivityWatchdog>>,
    /// A weak reference to this agent, handed to any child it delegates to
    /// as that child's `parent` — set at the child's construction rather
    /// than resolved later via an id-keyed registry.
    pub self_ref: Option<Weak<Mutex<Agent>>>,
}

pub type OwnHandleCell = Arc<Mutex<OwnHandle>>;

// ─── RuntimeContext ───────────────────────────────────────────────────────────

/// Environment-detected context for an agent session.
///
/// This is separate from [`sven_config::AgentConfig`] (which holds only
/// config-file fields) so that the two concerns — "what the user configured"
/// and "what we found at runtime" — stay cleanly separated.
#[derive(Default)]
pub struct RuntimeContext {
    /// Absolute path to the project root (detected from `.git` walk-up).
    pub project_root: Option<PathBuf>,
    /// Live git metadata (branch, commit, dirty state).
    pub git_context: Option<GitContext>,
    /// CI environment metadata.
    pub ci_context: Option<CiContext>,
    /// Contents of `.sven/context.md`, `AGENTS.md`, or `CLAUDE.md`.
    pub project_context_file: Option<String>,
    /// Text appended after the default system prompt Guidelines section.
    pub append_system_prompt: Option<String>,
    /// Full system prompt override (from `--system-prompt-file`).
    pub system_prompt_override: Option<String>,
    /// Skills discovered from the standard search hierarchy.
    pub skills: SharedSkills,
    /// Subagents discovered from the standard search hierarchy.
    pub agents: SharedAgents,
}

impl RuntimeContext {
    /// Create with auto-detected project, git, and CI context.
    pub fn auto_detect() -> Self {
        let project_root = sven_runtime::find_project_root().ok();
        let git_context = project_root.as_ref()
            .map(|r| sven_runtime::collect_git_context(r));
        let ci_context = Some(sven_runtime::detect_ci_context());
        let project_context_file = project_root.as_ref()
            .and_then(|r| sven_runtime::load_project_context_file(r));
        let skills = SharedSkills::new(sven_runtime::discover_skills(project_root.as_deref()));
        let agents = SharedAgents::new(sven_runtime::discover_agents(project_root.as_deref()));

        Self {
            project_root,
            git_context,
            ci_context,
            project_context_file,
            append_system_prompt: None,
            system_prompt_override: None,
            skills,
            agents,
        }
    }

    /// Create an empty context (no project/git/CI detection).
    pub fn empty() -> Self {
        Self::default()
    }
}

// ─── ToolSetProfile ───────────────────────────────────────────────────────────

/// Selects which tool set to register and carries the caller-owned shared
/// state that stateful tools require.
///
/// TUI and headless/CI use the same full tool set; only `--mode` (research /
/// plan / agent) controls which tools are exposed to the model. When
/// `question_tx` is `Some`, ask_question uses the TUI channel; when `None`,
/// it uses stdin (headless/CI).
///
/// `mode_lock` and the tool-event channel are intentionally **not** part of
/// this enum — `AgentBuilder::build()` creates them, wires them into the
/// registry, and passes the same instances to `Agent::new()` so that
/// `SwitchModeTool` and `TodoWriteTool` events are correctly observed by the
/// agent loop.
pub enum ToolSetProfile {
    /// Full tool set (TUI and headless/CI). Same tools; mode gates visibility.
    ///
    /// `question_tx`: when `Some`, ask_question routes to the TUI; when `None`, uses stdin.
    Full {
        question_tx: Option<mpsc::Sender<QuestionRequest>>,
        todos: Arc<Mutex<Vec<TodoItem>>>,
        task_depth: Arc<AtomicUsize>,
        own_watchdog: WatchdogCell,
    },

    /// Sub-agent tool set. Still registers a depth-gated `task` delegation
    /// tool (sharing the parent's depth counter) so nesting is genuinely
    /// bounded by `MAX_DEPTH` rather than by omitting the tool outright.
    SubAgent {
        todos: Arc<Mutex<Vec<TodoItem>>>,
        task_depth: Arc<AtomicUsize>,
        own_watchdog: WatchdogCell,
    },
}
