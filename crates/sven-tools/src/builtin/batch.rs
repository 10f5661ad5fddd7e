// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Transparent pseudo-tool letting the model request several independent
//! tool calls in one turn.
//!
//! [`crate::orchestrator::ToolOrchestrator`] unwraps a `batch` call into its
//! children *before* scheduling, so in the normal path this tool's
//! [`Tool::execute`] never runs — the orchestrator dispatches the children
//! directly and they get their own timing, activity events, and permission
//! checks. `execute` only runs when a `batch` call reaches the registry
//! unexpanded (empty/malformed `tools` array), in which case it does nothing
//! beyond argument validation.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct BatchTool;

#[async_trait]
impl Tool for BatchTool {
    fn name(&self) -> &str {
        "batch"
    }

    fn description(&self) -> &str {
        "Run several independent tool calls together. Each entry in `tools` is \
         dispatched as if it had been called directly: concurrently when every \
         entry is a safe/read-only tool, otherwise sequentially in the order \
         given. Use this instead of multiple separate calls when the calls do \
         not depend on each other's results."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tools": {
                    "type": "array",
                    "description": "The tool calls to run, in the order given",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string", "description": "Tool name" },
                            "args": { "type": "object", "description": "Arguments for that tool" }
                        },
                        "required": ["name"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["tools"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    /// Validate only. The orchestrator unwraps non-empty batches before this
    /// ever runs; this handles the degenerate empty/malformed case.
    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match call.args.get("tools").and_then(Value::as_array) {
            Some(tools) if !tools.is_empty() => {
                ToolOutput::ok(&call.id, "(batch already unwrapped by orchestrator)")
            }
            Some(_) => ToolOutput::err(&call.id, "batch: 'tools' must not be empty"),
            None => ToolOutput::err(&call.id, "batch: missing required parameter 'tools'"),
        }
    }
}
