use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;

use super::retry::{RetryPolicy, retry_after};
use super::{
    DataAttachment, Message, MessagePart, MessageRole, Provider, ProviderFuture, ProviderResponse,
    ProviderUsage, ToolSpec, get_env,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub type TextFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// OpenAI chat completions, or any server speaking the same protocol.
#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl OpenAI {
    pub fn new(key: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: get_env("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
            retry: RetryPolicy::default(),
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim().trim_end_matches('/');
        if !base_url.is_empty() {
            self.base_url = base_url.to_string();
        }
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn find_tool(&self, name: &str) -> Result<&ToolSpec> {
        self.tools
            .iter()
            .find(|tool| tool.name == name)
            .ok_or_else(|| anyhow!("tool '{}' not registered", name))
    }

    /// Plain completion without tools, for servers that do not support tool calls.
    pub fn complete_text(self) -> TextFuture {
        Box::pin(async move {
            let body = json!({
                "model": self.model,
                "messages": chat_messages(&self.messages),
                "temperature": 0.1,
            });
            let text = self.post_chat(&body).await?;
            extract_message_text(&text)
        })
    }

    async fn post_chat(&self, body: &Value) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut attempt = 0usize;
        let mut delay = self.retry.base_delay;
        loop {
            attempt += 1;
            let mut request = self.client.post(&url).json(body);
            if !self.key.is_empty() {
                request = request.bearer_auth(&self.key);
            }
            let response = request
                .send()
                .await
                .with_context(|| format!("request to {} failed", url))?;

            let status = response.status();
            let retry_after = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            if status.is_success() {
                return Ok(text);
            }
            if self.retry.should_retry(attempt, status, &text) {
                delay = self.retry.wait("OpenAI", attempt, delay, retry_after).await;
                continue;
            }
            return Err(anyhow!(
                "OpenAI API error ({}): {}",
                status,
                extract_openai_error(&text).unwrap_or(text)
            ));
        }
    }
}

impl Provider for OpenAI {
    fn append_system_input(mut self, input: String) -> Self {
        self.messages.push(Message::system(input));
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.messages.push(Message::user(input));
        self
    }

    fn append_user_data(mut self, data: DataAttachment) -> Self {
        self.messages.push(Message::user_data(data));
        self
    }

    fn register_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        let tool_name = tool_name.to_string();
        Box::pin(async move {
            let tool = self.find_tool(&tool_name)?.clone();
            let body = json!({
                "model": self.model,
                "messages": chat_messages(&self.messages),
                "tools": [
                    {
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters
                        }
                    }
                ],
                "tool_choice": {"type": "function", "function": {"name": tool.name}}
            });
            let text = self.post_chat(&body).await?;
            extract_tool_response(&text, &tool_name, &self.model)
        })
    }
}

fn chat_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
            };
            let only_text = message
                .parts
                .iter()
                .all(|part| matches!(part, MessagePart::Text(_)));
            if only_text {
                let content = message
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        MessagePart::Text(text) => Some(text.as_str()),
                        MessagePart::Data(_) => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n");
                return json!({"role": role, "content": content});
            }
            let parts = message
                .parts
                .iter()
                .map(|part| match part {
                    MessagePart::Text(text) => json!({"type": "text", "text": text}),
                    MessagePart::Data(data) => {
                        let url = format!("data:{};base64,{}", data.mime, BASE64.encode(&data.bytes));
                        json!({"type": "image_url", "image_url": {"url": url}})
                    }
                })
                .collect::<Vec<_>>();
            json!({"role": role, "content": parts})
        })
        .collect()
}

fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: OpenAIResponse =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI response JSON")?;
    let tool_call = payload
        .choices
        .first()
        .and_then(|choice| choice.message.tool_calls.first())
        .ok_or_else(|| anyhow!("no tool call returned from OpenAI"))?;

    if tool_call.function.name != tool_name {
        return Err(anyhow!(
            "unexpected tool name '{}' from OpenAI",
            tool_call.function.name
        ));
    }

    let args: Value = serde_json::from_str(&tool_call.function.arguments)
        .with_context(|| "failed to parse OpenAI tool arguments")?;
    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    });
    Ok(ProviderResponse { args, model, usage })
}

fn extract_message_text(text: &str) -> Result<String> {
    let payload: OpenAIResponse =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI response JSON")?;
    payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| anyhow!("empty completion returned"))
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<OpenAIError>,
    }

    #[derive(Deserialize)]
    struct OpenAIError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    let parts: Vec<String> = [
        error.message,
        error.kind.map(|kind| format!("type: {}", kind)),
        error.code.map(|code| format!("code: {}", code)),
    ]
    .into_iter()
    .flatten()
    .filter(|part| !part.trim().is_empty())
    .collect();
    if parts.is_empty() {
        Some("unknown error".to_string())
    } else {
        Some(parts.join(" | "))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    model: Option<String>,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    function: OpenAIFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOOL_RESPONSE: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/openai_tool_response.json"
    ));

    #[test]
    fn extracts_tool_arguments() {
        let response = extract_tool_response(TOOL_RESPONSE, "report_text_blocks", "gpt-4o-mini")
            .unwrap();
        assert_eq!(response.model.as_deref(), Some("gpt-4o-mini-2024-07-18"));
        assert_eq!(response.args["blocks"][0]["text"], "こんにちは");
        assert_eq!(response.usage.unwrap().total_tokens, Some(1312));
    }

    #[test]
    fn rejects_unexpected_tool() {
        let err = extract_tool_response(TOOL_RESPONSE, "deliver_translation", "gpt-4o-mini")
            .unwrap_err();
        assert!(err.to_string().contains("unexpected tool name"));
    }

    #[test]
    fn image_parts_become_data_urls() {
        let messages = vec![
            Message::system("sys".to_string()),
            Message::user_data(DataAttachment {
                bytes: vec![1, 2, 3],
                mime: "image/png".to_string(),
                name: None,
            }),
        ];
        let rendered = chat_messages(&messages);
        assert_eq!(rendered[0], json!({"role": "system", "content": "sys"}));
        assert_eq!(
            rendered[1]["content"][0]["image_url"]["url"],
            "data:image/png;base64,AQID"
        );
    }

    #[test]
    fn plain_completion_text_is_trimmed() {
        let body = r#"{"model":"sakura","choices":[{"message":{"content":"  Hello.\n"}}]}"#;
        assert_eq!(extract_message_text(body).unwrap(), "Hello.");
        let empty = r#"{"choices":[{"message":{"content":"  "}}]}"#;
        assert!(extract_message_text(empty).is_err());
    }

    #[test]
    fn error_body_is_summarized() {
        let body = r#"{"error":{"message":"bad key","type":"invalid_request_error","code":null}}"#;
        assert_eq!(
            extract_openai_error(body).as_deref(),
            Some("bad key | type: invalid_request_error")
        );
    }
}
