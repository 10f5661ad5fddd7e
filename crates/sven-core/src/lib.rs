// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod activity;
mod agent;
mod agent_pool;
mod compact;
mod events;
mod prompts;
mod reminders;
mod runtime_context;
mod session;
mod watchdog;

pub use activity::{ActivityEvent, ActivityStream, EventKind};
pub use agent::{Agent, RequiredToolsOutcome};
pub use agent_pool::{pool_key, AgentPool, AgentPoolLimits, PoolSlot};
pub use compact::{
    compact_session, compact_session_with_strategy, emergency_compact, smart_truncate,
};
pub use events::{AgentEvent, CompactionStrategyUsed};
pub use prompts::system_prompt;
pub use reminders::{cleanup_ephemeral, wrap_reminder};
pub use runtime_context::AgentRuntimeContext;
pub use session::{Session, TurnRecord};
pub use watchdog::{ActivityWatchdog, WatchdogPauseGuard};
