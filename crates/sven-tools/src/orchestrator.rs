// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Executes a batch of model-requested tool calls against a [`ToolRegistry`],
//! handling the `batch` pseudo-tool, permission gating, scheduling, and
//! content deduplication that a bare `registry.execute()` loop does not.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::policy::{PermissionGate, PermissionRequest};
use crate::registry::ToolRegistry;
use crate::tool::{ToolCall, ToolOutput};
use crate::ApprovalPolicy;

/// Wraps a [`ToolRegistry`] with the batch-unwrap/scheduling/permission/dedup
/// concerns the turn loop needs but the bare registry does not implement.
pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    gate: PermissionGate,
}

impl ToolOrchestrator {
    pub fn new(registry: Arc<ToolRegistry>, gate: PermissionGate) -> Self {
        Self { registry, gate }
    }

    /// Expand a single model-requested call into the list of calls that will
    /// actually run. A `batch(tools=[...])` call is unwrapped into one call
    /// per entry, each given a derived id `{parent_id}-unwrapped-{index}` so
    /// results can still be matched back to their own tool_call_id; any
    /// other call passes through unchanged (as a one-element list).
    fn unwrap_batch(call: ToolCall) -> Vec<ToolCall> {
        if call.name != "batch" {
            return vec![call];
        }
        let children = call
            .args
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if children.is_empty() {
            return vec![call];
        }
        children
            .into_iter()
            .enumerate()
            .filter_map(|(i, child)| {
                let name = child.get("name")?.as_str()?.to_string();
                let args = child.get("args").cloned().unwrap_or(Value::Object(Default::default()));
                Some(ToolCall {
                    id: format!("{}-unwrapped-{}", call.id, i),
                    name,
                    args,
                })
            })
            .collect()
    }

    /// Expand every `batch` call in `calls` into its children, in place at
    /// the batch's original position, leaving every other call untouched.
    /// Callers that need to correlate assistant tool-call messages or
    /// per-call events with the results from [`ToolOrchestrator::run`] must
    /// build those messages/events from *this* list, not the original
    /// model-returned `calls` -- `run`'s output has one entry per unwrapped
    /// call, which is not the same length as `calls` whenever a batch with
    /// more than one child is present.
    pub fn unwrap_calls(calls: Vec<ToolCall>) -> Vec<ToolCall> {
        calls.into_iter().flat_map(Self::unwrap_batch).collect()
    }

    /// `true` if this tool may run concurrently alongside other calls in the
    /// same round. Independent of approval policy: a tool can be
    /// auto-approved yet still need total ordering relative to reads (e.g. a
    /// filesystem write). Delegates to [`crate::tool::Tool::is_safe_concurrent`].
    fn is_safe_concurrent(&self, call: &ToolCall) -> bool {
        self.registry
            .get(&call.name)
            .map(|t| t.is_safe_concurrent())
            .unwrap_or(false)
    }

    /// Best-effort human-readable summary of a call, shown to the approver.
    fn summarize(call: &ToolCall) -> String {
        match call.args.get("command").or_else(|| call.args.get("cmd")) {
            Some(Value::String(s)) => format!("{}: {}", call.name, s),
            _ => format!("{}({})", call.name, call.args),
        }
    }

    /// The subject matched against [`crate::policy::ToolPolicy`] glob
    /// patterns: the command string for shell-like tools, the tool name
    /// otherwise.
    fn glob_subject(call: &ToolCall) -> String {
        match call.args.get("command").or_else(|| call.args.get("cmd")) {
            Some(Value::String(s)) => s.clone(),
            _ => call.name.clone(),
        }
    }

    /// Run one already-unwrapped call through the permission gate (if its
    /// default policy requires it) and then execute it.
    async fn run_one(&self, call: ToolCall, request_tx: &mpsc::Sender<PermissionRequest>) -> ToolOutput {
        let Some(tool) = self.registry.get(&call.name) else {
            return ToolOutput::err(&call.id, format!("unknown tool: {}", call.name));
        };

        match tool.default_policy() {
            ApprovalPolicy::Deny => {
                ToolOutput::err(&call.id, format!("tool '{}' is denied by policy", call.name))
            }
            ApprovalPolicy::Auto => tool.execute(&call).await,
            ApprovalPolicy::Ask => {
                let approved = self
                    .gate
                    .check(&Self::glob_subject(&call), &call.args, Self::summarize(&call), request_tx)
                    .await;
                if approved {
                    tool.execute(&call).await
                } else {
                    ToolOutput::err(&call.id, format!("user denied permission for '{}'", call.name))
                }
            }
        }
    }

    /// Execute a round of model-requested tool calls.
    ///
    /// Returns one `(call, output)` pair per **unwrapped** call (a `batch`
    /// call with N children expands to N pairs, not one) so callers can zip
    /// results against the calls that actually ran instead of the original,
    /// pre-unwrap request list — the two lists are not the same length
    /// whenever a batch call was present.
    ///
    /// `dedup_index` maps a sha256 digest of a formatted result body to the
    /// call_id that produced it first; a later call in the same session
    /// producing byte-identical output gets a short pointer back to the
    /// original instead of the full body repeated in context. Error results
    /// and empty bodies bypass dedup -- failures should always be visible in
    /// full, and an empty body has nothing worth pointing at.
    pub async fn run(
        &self,
        calls: Vec<ToolCall>,
        request_tx: mpsc::Sender<PermissionRequest>,
        dedup_index: &mut HashMap<String, String>,
    ) -> Vec<(ToolCall, ToolOutput)> {
        let unwrapped: Vec<ToolCall> = calls.into_iter().flat_map(Self::unwrap_batch).collect();

        let all_safe = unwrapped.iter().all(|c| self.is_safe_concurrent(c));

        let mut pairs = if all_safe {
            let mut handles = Vec::with_capacity(unwrapped.len());
            for call in unwrapped {
                let registry = self.registry.clone();
                let call_for_task = call.clone();
                handles.push((call, tokio::spawn(async move {
                    match registry.get(&call_for_task.name) {
                        Some(tool) => tool.execute(&call_for_task).await,
                        None => ToolOutput::err(&call_for_task.id, format!("unknown tool: {}", call_for_task.name)),
                    }
                })));
            }
            let mut pairs = Vec::with_capacity(handles.len());
            for (call, handle) in handles {
                let output = match handle.await {
                    Ok(output) => output,
                    Err(e) => ToolOutput::err(&call.id, format!("tool task panicked: {e}")),
                };
                pairs.push((call, output));
            }
            pairs
        } else {
            let mut pairs = Vec::with_capacity(unwrapped.len());
            for call in unwrapped {
                let output = self.run_one(call.clone(), &request_tx).await;
                pairs.push((call, output));
            }
            pairs
        };

        for (_, output) in &mut pairs {
            apply_dedup(output, dedup_index);
        }
        pairs
    }
}

/// If `output`'s content is a byte-identical repeat of a previously seen
/// non-error, non-empty result, replace it with a short pointer. Updates
/// `dedup_index` the first time a given content hash is seen.
fn apply_dedup(output: &mut ToolOutput, dedup_index: &mut HashMap<String, String>) {
    if output.is_error || output.content.is_empty() {
        return;
    }
    let mut hasher = Sha256::new();
    hasher.update(output.content.as_bytes());
    let digest = hex::encode(hasher.finalize());

    match dedup_index.get(&digest) {
        Some(first_call_id) if first_call_id != &output.call_id => {
            output.content = format!("[Duplicate result: see call id {first_call_id}]");
            output.parts = vec![crate::tool::ToolOutputPart::Text(output.content.clone())];
        }
        _ => {
            dedup_index.insert(digest, output.call_id.clone());
        }
    }
}

/// Append a `<system-reminder>` to a tool result's text content. Mirrors
/// [`sven_core`'s reminder wrapping] without a direct dependency on
/// `sven-core` (tool results are produced here, before the conversation
/// layer ever sees them).
pub fn append_system_reminder(output: &mut ToolOutput, text: &str, persist: bool) {
    let tag = if persist {
        format!("\n\n<system-reminder persist=\"true\">{text}</system-reminder>")
    } else {
        format!("\n\n<system-reminder>{text}</system-reminder>")
    };
    output.content.push_str(&tag);
    if let Some(crate::tool::ToolOutputPart::Text(last)) = output.parts.last_mut() {
        last.push_str(&tag);
    } else {
        output.parts.push(crate::tool::ToolOutputPart::Text(tag));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ToolPolicy;
    use crate::tool::Tool;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use sven_config::ToolsConfig;

    struct EchoTool {
        name: &'static str,
        policy: ApprovalPolicy,
        safe_concurrent: bool,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn default_policy(&self) -> ApprovalPolicy {
            self.policy
        }
        fn is_safe_concurrent(&self) -> bool {
            self.safe_concurrent
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("{}:{}", self.name, call.args))
        }
    }

    fn orchestrator_with(tools: Vec<EchoTool>) -> ToolOrchestrator {
        let mut registry = ToolRegistry::new();
        for t in tools {
            registry.register(t);
        }
        let policy = ToolPolicy::from_config(&ToolsConfig::default());
        let gate = PermissionGate::new(policy, Duration::from_millis(50));
        ToolOrchestrator::new(Arc::new(registry), gate)
    }

    #[tokio::test]
    async fn runs_safe_calls_and_returns_results_for_every_call() {
        let orch = orchestrator_with(vec![EchoTool {
            name: "safe",
            policy: ApprovalPolicy::Auto,
            safe_concurrent: true,
        }]);
        let (tx, _rx) = mpsc::channel(4);
        let mut dedup = HashMap::new();
        let calls = vec![
            ToolCall { id: "1".into(), name: "safe".into(), args: json!({"a":1}) },
            ToolCall { id: "2".into(), name: "safe".into(), args: json!({"a":2}) },
        ];
        let pairs = orch.run(calls, tx, &mut dedup).await;
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|(_, o)| !o.is_error));
    }

    #[tokio::test]
    async fn denied_tool_returns_error_without_executing() {
        let orch = orchestrator_with(vec![EchoTool {
            name: "blocked",
            policy: ApprovalPolicy::Deny,
            safe_concurrent: false,
        }]);
        let (tx, _rx) = mpsc::channel(4);
        let mut dedup = HashMap::new();
        let calls = vec![ToolCall { id: "1".into(), name: "blocked".into(), args: json!({}) }];
        let pairs = orch.run(calls, tx, &mut dedup).await;
        assert!(pairs[0].1.is_error);
        assert!(pairs[0].1.content.contains("denied"));
    }

    #[tokio::test]
    async fn unknown_tool_returns_error() {
        let orch = orchestrator_with(vec![]);
        let (tx, _rx) = mpsc::channel(4);
        let mut dedup = HashMap::new();
        let calls = vec![ToolCall { id: "1".into(), name: "ghost".into(), args: json!({}) }];
        let pairs = orch.run(calls, tx, &mut dedup).await;
        assert!(pairs[0].1.is_error);
    }

    #[tokio::test]
    async fn batch_unwraps_into_individual_results() {
        let orch = orchestrator_with(vec![EchoTool {
            name: "safe",
            policy: ApprovalPolicy::Auto,
            safe_concurrent: true,
        }]);
        let (tx, _rx) = mpsc::channel(4);
        let mut dedup = HashMap::new();
        let batch_call = ToolCall {
            id: "batch-1".into(),
            name: "batch".into(),
            args: json!({"tools": [
                {"name": "safe", "args": {"a": 1}},
                {"name": "safe", "args": {"a": 2}},
            ]}),
        };
        let pairs = orch.run(vec![batch_call], tx, &mut dedup).await;
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0.id, "batch-1-unwrapped-0");
        assert_eq!(pairs[1].0.id, "batch-1-unwrapped-1");
        assert!(pairs.iter().all(|(_, o)| !o.is_error));
    }

    #[tokio::test]
    async fn duplicate_results_are_deduplicated() {
        let orch = orchestrator_with(vec![EchoTool {
            name: "safe",
            policy: ApprovalPolicy::Auto,
            safe_concurrent: true,
        }]);
        let (tx, _rx) = mpsc::channel(4);
        let mut dedup = HashMap::new();
        let calls = vec![
            ToolCall { id: "1".into(), name: "safe".into(), args: json!({"a":1}) },
            ToolCall { id: "2".into(), name: "safe".into(), args: json!({"a":1}) },
        ];
        let pairs = orch.run(calls, tx, &mut dedup).await;
        assert!(!pairs[0].1.content.starts_with("[Duplicate"));
        assert!(pairs[1].1.content.contains("Duplicate result: see call id 1"));
    }

    #[tokio::test]
    async fn unsafe_call_mixed_with_safe_runs_sequentially_without_panicking() {
        let orch = orchestrator_with(vec![
            EchoTool { name: "safe", policy: ApprovalPolicy::Auto, safe_concurrent: true },
            EchoTool { name: "risky", policy: ApprovalPolicy::Ask, safe_concurrent: false },
        ]);
        let (tx, mut rx) = mpsc::channel(4);
        let responder = tokio::spawn(async move {
            if let Some(req) = rx.recv().await {
                let _ = req.answer_tx.send(crate::policy::PermissionDecision {
                    approved: true,
                    remember: false,
                });
            }
        });
        let mut dedup = HashMap::new();
        let calls = vec![
            ToolCall { id: "1".into(), name: "safe".into(), args: json!({}) },
            ToolCall { id: "2".into(), name: "risky".into(), args: json!({}) },
        ];
        let pairs = orch.run(calls, tx, &mut dedup).await;
        responder.await.unwrap();
        assert!(pairs.iter().all(|(_, o)| !o.is_error));
    }

    #[tokio::test]
    async fn mixed_safe_and_unsafe_tools_with_auto_policy_run_sequentially() {
        // Both tools default-approve (Auto), but only one is marked safe for
        // concurrent scheduling -- approval policy alone must not put the
        // write-like tool on the concurrent path.
        let orch = orchestrator_with(vec![
            EchoTool { name: "read_like", policy: ApprovalPolicy::Auto, safe_concurrent: true },
            EchoTool { name: "write_like", policy: ApprovalPolicy::Auto, safe_concurrent: false },
        ]);
        let (tx, _rx) = mpsc::channel(4);
        let mut dedup = HashMap::new();
        let calls = vec![
            ToolCall { id: "1".into(), name: "read_like".into(), args: json!({}) },
            ToolCall { id: "2".into(), name: "write_like".into(), args: json!({}) },
        ];
        let pairs = orch.run(calls, tx, &mut dedup).await;
        assert!(pairs.iter().all(|(_, o)| !o.is_error));
    }

    #[test]
    fn append_system_reminder_is_appended_to_content_and_parts() {
        let mut output = ToolOutput::ok("1", "body");
        append_system_reminder(&mut output, "careful", false);
        assert!(output.content.contains("careful"));
        assert!(!output.content.contains("persist"));
    }
}
