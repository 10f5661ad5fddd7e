// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Injection and cleanup of `<system-reminder>` tags.
//!
//! Tool results and orchestration code append reminders to steer the model
//! within a turn ("the file you just read was truncated", "two tools are
//! still running") without polluting the durable conversation log. A
//! reminder tagged `persist="true"` survives compaction and history
//! edits; the default (no attribute, or `persist="false"`) is stripped at
//! the end of the turn it was added in.

use regex::Regex;
use std::sync::OnceLock;

use sven_model::{Message, MessageContent, ToolResultContent};

fn persistent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<system-reminder\s+persist="true"\s*>.*?</system-reminder>"#).unwrap()
    })
}

fn any_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)<system-reminder[^>]*>.*?</system-reminder>"#).unwrap())
}

/// Wrap `text` in a system-reminder tag. `persist = true` marks it to
/// survive end-of-turn cleanup and compaction.
pub fn wrap_reminder(text: &str, persist: bool) -> String {
    if persist {
        format!("\n\n<system-reminder persist=\"true\">{text}</system-reminder>")
    } else {
        format!("\n\n<system-reminder>{text}</system-reminder>")
    }
}

/// Strip ephemeral tags from `text`, preserving any `persist="true"` spans.
/// Returns `None` when the text contained no reminder tags at all (fast
/// path, nothing changed); `Some(None)` when every tag was ephemeral and
/// the remainder is empty (caller should drop the message); `Some(Some(_))`
/// with the surviving text otherwise.
fn strip_one(text: &str) -> Option<Option<String>> {
    let any = any_re();
    if !any.is_match(text) {
        return None;
    }
    let persistent = persistent_re();
    let preserved: Vec<String> = persistent.find_iter(text).map(|m| m.as_str().to_string()).collect();
    let mut stripped = any.replace_all(text, "").to_string();
    for p in preserved {
        stripped.push_str(&p);
    }
    let trimmed = stripped.trim().to_string();
    Some(if trimmed.is_empty() { None } else { Some(trimmed) })
}

/// Strip ephemeral (non-persistent) reminder tags from every message's text
/// content in place. A standalone system/user message whose text becomes
/// empty after stripping -- i.e. it consisted entirely of ephemeral
/// reminders -- is dropped from the list outright; messages with other
/// content, or persistent reminders, are kept with only the ephemeral tags
/// removed.
///
/// A tool-result message whose tags are stripped is retained with its body
/// reduced to content minus tags, even if that leaves it empty: dropping a
/// tool-result message would orphan its `tool_call_id` and violate the
/// invariant that every tool message traces back to a prior assistant
/// tool_call.
///
/// Returns the number of messages modified or dropped.
pub fn cleanup_ephemeral(messages: &mut Vec<Message>) -> usize {
    let mut changed = 0usize;
    let mut i = 0;
    while i < messages.len() {
        let keep = match &messages[i].content {
            MessageContent::Text(text) => match strip_one(text) {
                None => true,
                Some(None) => {
                    changed += 1;
                    false
                }
                Some(Some(trimmed)) => {
                    changed += 1;
                    messages[i].content = MessageContent::Text(trimmed);
                    true
                }
            },
            MessageContent::ToolResult {
                content: ToolResultContent::Text(text),
                ..
            } => match strip_one(text) {
                None => true,
                Some(stripped) => {
                    changed += 1;
                    let trimmed = stripped.unwrap_or_default();
                    if let MessageContent::ToolResult { content, .. } = &mut messages[i].content {
                        *content = ToolResultContent::Text(trimmed);
                    }
                    true
                }
            },
            _ => true,
        };
        if keep {
            i += 1;
        } else {
            messages.remove(i);
        }
    }
    changed
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_reminder_default_is_not_persistent() {
        let wrapped = wrap_reminder("hello", false);
        assert!(wrapped.contains("<system-reminder>hello</system-reminder>"));
        assert!(!wrapped.contains("persist"));
    }

    #[test]
    fn wrap_reminder_persistent_carries_attribute() {
        let wrapped = wrap_reminder("hello", true);
        assert!(wrapped.contains(r#"persist="true""#));
    }

    #[test]
    fn cleanup_strips_ephemeral_tag_leaving_rest_of_text() {
        let mut messages = vec![Message::user(
            "do the thing\n\n<system-reminder>be careful</system-reminder>",
        )];
        let changed = cleanup_ephemeral(&mut messages);
        assert_eq!(changed, 1);
        assert_eq!(messages[0].as_text(), Some("do the thing"));
    }

    #[test]
    fn cleanup_drops_message_that_is_only_an_ephemeral_reminder() {
        let mut messages = vec![
            Message::user("keep me"),
            Message::user("<system-reminder>only this</system-reminder>"),
        ];
        cleanup_ephemeral(&mut messages);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_text(), Some("keep me"));
    }

    #[test]
    fn cleanup_preserves_persistent_reminder() {
        let mut messages = vec![Message::user(
            r#"notes <system-reminder persist="true">remember this forever</system-reminder>"#,
        )];
        cleanup_ephemeral(&mut messages);
        assert!(messages[0]
            .as_text()
            .unwrap()
            .contains("remember this forever"));
    }

    #[test]
    fn cleanup_mixed_tags_strips_only_ephemeral() {
        let mut messages = vec![Message::user(
            r#"a <system-reminder>drop me</system-reminder> b <system-reminder persist="true">keep me</system-reminder>"#,
        )];
        cleanup_ephemeral(&mut messages);
        let text = messages[0].as_text().unwrap();
        assert!(!text.contains("drop me"));
        assert!(text.contains("keep me"));
    }

    #[test]
    fn cleanup_leaves_untagged_messages_untouched() {
        let mut messages = vec![Message::user("plain text, no reminders here")];
        let changed = cleanup_ephemeral(&mut messages);
        assert_eq!(changed, 0);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn cleanup_strips_tag_from_tool_result_but_keeps_the_message() {
        let mut messages = vec![Message::tool_result(
            "call-1",
            "3 files found\n\n<system-reminder>hint</system-reminder>",
        )];
        let changed = cleanup_ephemeral(&mut messages);
        assert_eq!(changed, 1);
        assert_eq!(messages.len(), 1);
        match &messages[0].content {
            MessageContent::ToolResult { tool_call_id, content } => {
                assert_eq!(tool_call_id, "call-1");
                assert_eq!(content.as_text(), Some("3 files found"));
            }
            other => panic!("expected ToolResult content, got {other:?}"),
        }
    }

    #[test]
    fn cleanup_keeps_persistent_tag_in_tool_result() {
        let mut messages = vec![Message::tool_result(
            "call-2",
            r#"done <system-reminder persist="true">task context</system-reminder>"#,
        )];
        cleanup_ephemeral(&mut messages);
        assert_eq!(messages.len(), 1);
        if let MessageContent::ToolResult { content, .. } = &messages[0].content {
            assert!(content.as_text().unwrap().contains("task context"));
        } else {
            panic!("expected ToolResult content");
        }
    }
}
