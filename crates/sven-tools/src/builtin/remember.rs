// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use sven_memory::{MemoryCategory, MemoryStore, Temporal};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Records a durable fact about the user into the cross-session
/// [`sven_memory::MemoryStore`] (C4 Memory Store).
///
/// Unlike `update_memory` (a flat key-value scratchpad), facts recorded here
/// are deduplicated by normalized content, scored for relevance against the
/// active conversation, and surfaced back to the agent as a
/// `## Relevant Memories` system-prompt block on future sessions.
#[derive(Default)]
pub struct RememberTool {
    pub memory_file: Option<std::path::PathBuf>,
}

impl RememberTool {
    fn store(&self) -> MemoryStore {
        let path = self
            .memory_file
            .clone()
            .unwrap_or_else(MemoryStore::default_path);
        MemoryStore::open(path, MemoryStore::local_device_id())
    }
}

fn parse_category(s: Option<&str>) -> MemoryCategory {
    match s {
        Some("preference") => MemoryCategory::Preference,
        Some("routine") => MemoryCategory::Routine,
        Some("relationship") => MemoryCategory::Relationship,
        _ => MemoryCategory::Fact,
    }
}

fn parse_temporal(s: Option<&str>) -> Temporal {
    match s {
        Some("recurring") => Temporal::Recurring,
        Some("one_time") => Temporal::OneTime,
        _ => Temporal::Permanent,
    }
}

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Record a durable fact about the user that should persist across sessions (a \
         preference, a routine, a relationship, or a standing fact). Duplicate content is \
         rejected. Distinct from update_memory, which stores ad-hoc key-value scratch state."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The fact to remember, in a short self-contained sentence"
                },
                "category": {
                    "type": "string",
                    "enum": ["fact", "preference", "routine", "relationship"],
                    "description": "Defaults to 'fact'"
                },
                "temporal": {
                    "type": "string",
                    "enum": ["permanent", "recurring", "one_time"],
                    "description": "Defaults to 'permanent'"
                }
            },
            "required": ["content"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let content = match call.args.get("content").and_then(|v| v.as_str()) {
            Some(c) if !c.trim().is_empty() => c.to_string(),
            _ => return ToolOutput::err(&call.id, "missing 'content'"),
        };
        let category = parse_category(call.args.get("category").and_then(|v| v.as_str()));
        let temporal = parse_temporal(call.args.get("temporal").and_then(|v| v.as_str()));

        debug!(category = ?category, temporal = ?temporal, "remember tool");

        match self.store().add(content, category, temporal) {
            Ok(memory) => ToolOutput::ok(&call.id, format!("remembered: {}", memory.content)),
            Err(sven_memory::MemoryError::DuplicateContent) => {
                ToolOutput::ok(&call.id, "already remembered")
            }
            Err(e) => ToolOutput::err(&call.id, format!("could not save memory: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::{Tool, ToolCall};

    fn tmp_tool() -> RememberTool {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        RememberTool {
            memory_file: Some(std::path::PathBuf::from(format!(
                "/tmp/sven_remember_test_{}_{n}.json",
                std::process::id()
            ))),
        }
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "r1".into(),
            name: "remember".into(),
            args,
        }
    }

    #[tokio::test]
    async fn remembers_a_fact() {
        let t = tmp_tool();
        let path = t.memory_file.clone().unwrap();

        let out = t
            .execute(&call(json!({"content": "prefers dark mode"})))
            .await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(t.store().snapshot().len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn duplicate_content_is_not_an_error() {
        let t = tmp_tool();
        let path = t.memory_file.clone().unwrap();

        t.execute(&call(json!({"content": "lives in Stockholm"})))
            .await;
        let out = t
            .execute(&call(json!({"content": "  lives in stockholm  "})))
            .await;
        assert!(!out.is_error);
        assert_eq!(t.store().snapshot().len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_content_is_error() {
        let t = tmp_tool();
        let out = t.execute(&call(json!({}))).await;
        assert!(out.is_error);
    }
}
