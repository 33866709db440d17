use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use cuadrilla_core::platform::{Assistant, CollaboratorResult, IntroductionJudge, TopicSource};
use cuadrilla_core::tools::ToolRegistry;
use cuadrilla_core::{CollaboratorError, MemberRef};

pub mod mock;

/// Upper bound on model/tool round trips for one question.
pub const MAX_TOOL_ROUNDS: usize = 5;

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub model: String,
    pub url: String,
}

// --- Concrete Client Implementation (OpenRouter chat completions) ---
pub struct OpenRouterClient {
    http_client: Client,
    config: OpenRouterConfig,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("model", &self.config.model)
            .field("url", &self.config.url)
            .finish()
    }
}

impl OpenRouterClient {
    pub fn new(config: OpenRouterConfig) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { http_client, config })
    }

    /// One chat completion call. Returns `choices[0].message`.
    async fn chat(&self, messages: &[Value], tools: Option<Vec<Value>>, temperature: f64) -> CollaboratorResult<Value> {
        let mut payload = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": temperature,
        });
        if let Some(tools) = tools {
            payload["tools"] = Value::Array(tools);
        }

        debug!(model = %self.config.model, messages = messages.len(), "Sending chat completion");
        let response = self
            .http_client
            .post(&self.config.url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("OpenRouter request failed: {}", e.without_url())))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Unavailable(format!(
                "OpenRouter API call failed with status: {status}. Body: {text}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("OpenRouter response unreadable: {}", e.without_url())))?;

        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .cloned()
            .ok_or_else(|| CollaboratorError::Rejected("OpenRouter response missing choices[0].message".to_string()))
    }

    async fn complete_text(&self, system: &str, user: &str, temperature: f64) -> CollaboratorResult<String> {
        let messages = vec![
            json!({ "role": "system", "content": system }),
            json!({ "role": "user", "content": user }),
        ];
        let message = self.chat(&messages, None, temperature).await?;
        Ok(content_of(&message))
    }
}

fn tool_specs(tools: &ToolRegistry) -> Vec<Value> {
    tools
        .definitions()
        .into_iter()
        .map(|d| {
            json!({
                "type": "function",
                "function": {
                    "name": d.name,
                    "description": d.description,
                    "parameters": d.parameters,
                }
            })
        })
        .collect()
}

fn content_of(message: &Value) -> String {
    message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .trim()
        .to_string()
}

fn assistant_system_prompt(member: &MemberRef) -> String {
    let today = chrono::Local::now().format("%A %Y-%m-%d");
    format!(
        "You are the assistant of a group of friends who organise plans together. Today is {today}. \
         You are talking to {}. Answer briefly and in the user's language. \
         Use the tools to look at or add plans on the agenda and to read the group's reference document; \
         never invent plans. Dates are YYYY-MM-DD and times HH:MM.",
        member.display_name
    )
}

/// Question answering over [`OpenRouterClient`] with the agenda tools
/// attached.
pub struct ToolAssistant {
    client: Arc<OpenRouterClient>,
    tools: Arc<ToolRegistry>,
}

impl std::fmt::Debug for ToolAssistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolAssistant")
            .field("client", &self.client)
            .finish()
    }
}

impl ToolAssistant {
    pub fn new(client: Arc<OpenRouterClient>, tools: Arc<ToolRegistry>) -> Self {
        Self { client, tools }
    }
}

#[async_trait]
impl Assistant for ToolAssistant {
    async fn respond(&self, member: &MemberRef, prompt: &str) -> CollaboratorResult<String> {
        let mut messages = vec![
            json!({ "role": "system", "content": assistant_system_prompt(member) }),
            json!({ "role": "user", "content": prompt }),
        ];
        let specs = tool_specs(&self.tools);

        for round in 0..MAX_TOOL_ROUNDS {
            let message = self.client.chat(&messages, Some(specs.clone()), 0.4).await?;
            let calls = message
                .get("tool_calls")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();

            if calls.is_empty() {
                return Ok(content_of(&message));
            }

            info!(member_id = member.id, round = round, calls = calls.len(), "Model requested tools");
            messages.push(message);
            for call in calls {
                let id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                let name = call
                    .pointer("/function/name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let arguments = call
                    .pointer("/function/arguments")
                    .and_then(|v| v.as_str())
                    .unwrap_or("{}");
                let result = self.tools.invoke(name, arguments, member).await;
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "content": result.to_string(),
                }));
            }
        }

        warn!(member_id = member.id, "Tool loop hit its round limit");
        Err(CollaboratorError::Rejected("too many tool rounds".to_string()))
    }
}

#[async_trait]
impl IntroductionJudge for OpenRouterClient {
    async fn is_acceptable_introduction(&self, member: &MemberRef, text: &str) -> CollaboratorResult<bool> {
        let verdict = self
            .complete_text(
                "You moderate a friends' group. Newcomers must introduce themselves (name, something about them). \
                 Reply with exactly YES if the message is a genuine introduction, otherwise NO.",
                &format!("Message from {}: {text}", member.display_name),
                0.0,
            )
            .await?;
        Ok(verdict.to_uppercase().starts_with("YES"))
    }
}

#[async_trait]
impl TopicSource for OpenRouterClient {
    async fn generate_topic(&self) -> CollaboratorResult<String> {
        self.complete_text(
            "You write one short, light-hearted debate question for a group of friends. \
             Reply with the question only.",
            "Give me today's debate question.",
            0.9,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuadrilla_core::agenda::{AgendaEngine, Catalog};
    use cuadrilla_core::clock::SystemClock;
    use cuadrilla_core::store::MemoryStore;

    #[tokio::test]
    async fn tool_specs_use_function_format() {
        let agenda = AgendaEngine::open(Arc::new(MemoryStore::new(Catalog::new())), Arc::new(SystemClock)).await;
        let tools = ToolRegistry::new(Arc::new(agenda), "info.md");
        let specs = tool_specs(&tools);
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0]["type"], "function");
        assert_eq!(specs[0]["function"]["name"], "create_event");
        assert_eq!(specs[0]["function"]["parameters"]["required"][2], "title");
    }

    #[test]
    fn content_is_trimmed_and_defaults_empty() {
        assert_eq!(content_of(&json!({ "content": "  hi \n" })), "hi");
        assert_eq!(content_of(&json!({ "content": null })), "");
    }
}
