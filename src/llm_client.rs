use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::generate::{ChatTurn, Generate, GenerationReply, GenerationRequest, ToolInvocation};

/// OpenAI-compatible chat completion client. Works against any endpoint
/// speaking that format, local or hosted.
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    /// Arrives as a JSON-encoded string per the OpenAI format.
    arguments: String,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Generate for LlmClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationReply> {
        let url = format!("{}/chat/completions", self.api_url);

        let mut messages = Vec::with_capacity(request.history.len() + 1);
        messages.push(WireMessage {
            role: "system".to_string(),
            content: request.system_prompt,
        });
        for ChatTurn { role, content } in request.history {
            messages.push(WireMessage { role, content });
        }

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(0.7),
            max_tokens: Some(2000),
            tools: request.tools,
        };

        let mut req = self.client.post(&url).json(&body);

        // API key header only when provided; local models don't need one.
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        let mut tool_calls = Vec::new();
        for call in choice.message.tool_calls {
            match serde_json::from_str::<Value>(&call.function.arguments) {
                Ok(arguments) => tool_calls.push(ToolInvocation {
                    name: call.function.name,
                    arguments,
                }),
                Err(e) => tracing::warn!(
                    "Dropping tool call '{}' with unparseable arguments: {}",
                    call.function.name,
                    e
                ),
            }
        }

        Ok(GenerationReply {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
        })
    }
}
