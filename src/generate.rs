//! Boundary between the scheduling engine and whatever produces replies. The
//! engine only ever talks to the `Generate` trait; the HTTP client in
//! `llm_client` is one implementation, test mocks are another.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub history: Vec<ChatTurn>,
    /// Tool schemas to offer the model, or None for tag-based directives.
    pub tools: Option<Vec<Value>>,
}

/// A structured directive call returned by the model alongside (or instead of)
/// text.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct GenerationReply {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
}

#[async_trait]
pub trait Generate: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationReply>;
}

/// Schemas for the structured directive encoding, OpenAI tool format.
pub fn tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "set_next_contact",
                "description": "Schedule when you will next reach out on your own. Use after every reply.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "time": {"type": "number", "description": "Amount of time"},
                        "unit": {"type": "string", "enum": ["s", "m", "h"]},
                        "reason": {"type": "string", "description": "Why you plan to reach out"},
                        "persistent": {
                            "type": "boolean",
                            "description": "Keep this contact even if they message you first (reminders, wake-up calls)"
                        }
                    },
                    "required": ["time", "unit"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "set_status",
                "description": "Declare or clear what you are currently doing (sleeping, working, out).",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["set", "clear"]},
                        "label": {"type": "string"},
                        "reason": {"type": "string"},
                        "duration": {
                            "type": "object",
                            "properties": {
                                "time": {"type": "number"},
                                "unit": {"type": "string", "enum": ["s", "m", "h"]}
                            },
                            "required": ["time", "unit"]
                        },
                        "noreply": {
                            "type": "boolean",
                            "description": "While active, incoming messages are held until the status ends"
                        },
                        "delay": {
                            "type": "object",
                            "description": "Reply delay range in seconds while this status is active",
                            "properties": {
                                "min": {"type": "integer"},
                                "max": {"type": "integer"}
                            },
                            "required": ["min", "max"]
                        },
                        "chance": {
                            "type": "number",
                            "description": "Multiplier on your chance of reaching out while active (0 disables)"
                        }
                    },
                    "required": ["action"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "modify_schedule",
                "description": "Change your recurring daily routine.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["add", "set", "remove"]},
                        "label": {"type": "string"},
                        "start": {"type": "string", "description": "HH:MM"},
                        "end": {"type": "string", "description": "HH:MM"},
                        "noreply": {"type": "boolean"},
                        "chance": {"type": "number"}
                    },
                    "required": ["action", "label"]
                }
            }
        }),
    ]
}
