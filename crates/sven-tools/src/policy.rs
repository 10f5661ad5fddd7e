// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, Mutex};
use sven_config::ToolsConfig;

/// Per-tool approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Always run without asking
    Auto,
    /// Ask user before each invocation
    Ask,
    /// Never run; return an error
    Deny,
}

/// Policy engine that maps a tool call to an approval decision.
#[derive(Debug)]
pub struct ToolPolicy {
    auto_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
}

impl ToolPolicy {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            auto_patterns: compile(&cfg.auto_approve_patterns),
            deny_patterns: compile(&cfg.deny_patterns),
        }
    }

    /// Decide whether a tool call (identified by its command string) should
    /// run automatically, prompt the user, or be denied.
    pub fn decide(&self, command: &str) -> ApprovalPolicy {
        for re in &self.deny_patterns {
            if re.is_match(command) {
                return ApprovalPolicy::Deny;
            }
        }
        for re in &self.auto_patterns {
            if re.is_match(command) {
                return ApprovalPolicy::Auto;
            }
        }
        ApprovalPolicy::Ask
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// A pending permission request raised by the tool orchestrator for a tool
/// call whose [`ApprovalPolicy`] is `Ask`. Mirrors the question/answer
/// oneshot shape used by the interactive `ask_question` tool: the requester
/// sends this over a channel and awaits `answer_rx`, the UI (or a headless
/// default) resolves it exactly once.
pub struct PermissionRequest {
    pub tool_name: String,
    /// Human-readable summary of what the tool call would do, shown to the
    /// approver (e.g. the formatted command for a shell tool).
    pub summary: String,
    pub answer_tx: oneshot::Sender<PermissionDecision>,
}

/// The approver's answer to a [`PermissionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionDecision {
    pub approved: bool,
    /// If true, memoize this decision for the rest of the session so
    /// identical future calls to the same tool skip the prompt.
    pub remember: bool,
}

/// Canonicalize a JSON argument tree to a deterministic string so that two
/// structurally-equal-but-differently-ordered objects fingerprint the same.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{:?}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// Fingerprint a tool name + argument tree for the "remember for this
/// session" memoization. Two calls with the same tool name and
/// structurally-equal arguments (regardless of key order) fingerprint
/// identically.
fn fingerprint(tool_name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical_json(args).as_bytes());
    hex::encode(hasher.finalize())
}

/// Wraps [`ToolPolicy`] with session-scoped memory and an async
/// request/response path for calls that resolve to [`ApprovalPolicy::Ask`].
///
/// `ALLOW_ALWAYS` decisions are memoized by argument fingerprint for the
/// lifetime of the gate (one per session); they are not persisted to disk
/// and do not survive a process restart.
pub struct PermissionGate {
    policy: ToolPolicy,
    timeout: Duration,
    remembered: Mutex<HashSet<String>>,
}

impl PermissionGate {
    pub fn new(policy: ToolPolicy, timeout: Duration) -> Self {
        Self {
            policy,
            timeout,
            remembered: Mutex::new(HashSet::new()),
        }
    }

    /// Decide whether `tool_name`/`args` may run, consulting the memoized
    /// ALLOW_ALWAYS set first, then `decide()`. When the underlying policy
    /// says `Ask`, sends a [`PermissionRequest`] down `request_tx` and waits
    /// up to `timeout` for an answer; a timeout or a dropped channel is
    /// treated as `Deny` (fail closed).
    pub async fn check(
        &self,
        tool_name: &str,
        args: &Value,
        summary: String,
        request_tx: &tokio::sync::mpsc::Sender<PermissionRequest>,
    ) -> bool {
        let fp = fingerprint(tool_name, args);
        if self.remembered.lock().await.contains(&fp) {
            return true;
        }

        match self.policy.decide(tool_name) {
            ApprovalPolicy::Auto => true,
            ApprovalPolicy::Deny => false,
            ApprovalPolicy::Ask => {
                let (answer_tx, answer_rx) = oneshot::channel();
                let request = PermissionRequest {
                    tool_name: tool_name.to_string(),
                    summary,
                    answer_tx,
                };
                if request_tx.send(request).await.is_err() {
                    return false;
                }
                match tokio::time::timeout(self.timeout, answer_rx).await {
                    Ok(Ok(decision)) => {
                        if decision.approved && decision.remember {
                            self.remembered.lock().await.insert(fp);
                        }
                        decision.approved
                    }
                    _ => false,
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
