//! OpenAI-compatible streaming adapter (OpenAI, Ollama, LM Studio, OpenRouter)

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ApiChunk, ApiHandler, ApiStream, ModelInfo, TokenUsage};
use crate::agent::history::ConversationItem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub context_window: u32,
}

pub struct OpenAiHandler {
    settings: OpenAiSettings,
    http_client: HttpClient,
}

impl OpenAiHandler {
    pub fn new(settings: OpenAiSettings) -> Result<Self> {
        if settings.base_url.trim().is_empty() {
            anyhow::bail!("Base URL must not be empty");
        }
        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(300))
            .user_agent("weft/0.1")
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { settings, http_client })
    }

    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = self.settings.api_key.as_deref().map(str::trim) {
            if !api_key.is_empty() {
                let value = HeaderValue::from_str(&format!("Bearer {}", api_key))
                    .context("API key is not a valid header value")?;
                headers.insert(AUTHORIZATION, value);
            }
        }
        Ok(headers)
    }

    fn request_body(&self, system_prompt: &str, history: &[ConversationItem]) -> OpenAiRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(OpenAiMessage {
            role: "system".to_string(),
            content: system_prompt.to_string(),
        });
        messages.extend(history.iter().map(|item| OpenAiMessage {
            role: item.role.as_str().to_string(),
            content: item.content.clone(),
        }));

        OpenAiRequest {
            model: self.settings.model.clone(),
            messages,
            max_completion_tokens: self.settings.max_tokens,
            stream: true,
            stream_options: StreamOptions { include_usage: true },
        }
    }
}

impl ApiHandler for OpenAiHandler {
    fn create_message(&self, system_prompt: &str, history: &[ConversationItem]) -> ApiStream {
        let url = format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'));
        let body = self.request_body(system_prompt, history);
        let http_client = self.http_client.clone();
        let headers_res = self.build_headers();

        Box::pin(async_stream::try_stream! {
            let response = send(&http_client, &url, headers_res?, &body).await?;
            let mut stream = response.bytes_stream();
            let mut lines = LineBuffer::default();

            while let Some(chunk_res) = stream.next().await {
                let chunk = chunk_res.context("Failed to read chunk")?;
                for line in lines.push(&chunk) {
                    for event in parse_sse_line(line.trim_end()) {
                        match event {
                            SseEvent::Done => return,
                            SseEvent::Chunk(chunk) => yield chunk,
                        }
                    }
                }
            }
        })
    }

    fn model(&self) -> ModelInfo {
        ModelInfo {
            id: self.settings.model.clone(),
            context_window: self.settings.context_window,
        }
    }
}

async fn send(http_client: &HttpClient, url: &str, headers: HeaderMap, body: &OpenAiRequest) -> Result<Response> {
    let response = http_client
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .context("Failed to send streaming request")?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        anyhow::bail!("API request failed with status {}: {}", status, detail);
    }
    Ok(response)
}

/// Splits the byte stream into lines; a character cut between two network
/// chunks is only decoded once its line is complete
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(newline_pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline_pos).collect();
            let line = String::from_utf8(line).unwrap_or_else(|err| {
                warn!("stream line is not valid UTF-8");
                String::from_utf8_lossy(err.as_bytes()).into_owned()
            });
            lines.push(line);
        }
        lines
    }
}

enum SseEvent {
    Chunk(ApiChunk),
    Done,
}

/// Decode one `data:` line of the event stream
fn parse_sse_line(line: &str) -> Vec<SseEvent> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Vec::new();
    };
    if data == "[DONE]" {
        return vec![SseEvent::Done];
    }
    let Ok(parsed) = serde_json::from_str::<OpenAiStreamResponse>(data) else {
        return Vec::new();
    };

    let mut events = Vec::new();
    if let Some(delta) = parsed.choices.into_iter().next().map(|choice| choice.delta) {
        if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning).filter(|r| !r.is_empty()) {
            events.push(SseEvent::Chunk(ApiChunk::Reasoning(reasoning)));
        }
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            events.push(SseEvent::Chunk(ApiChunk::Text(content)));
        }
    }
    if let Some(usage) = parsed.usage {
        events.push(SseEvent::Chunk(ApiChunk::Usage(TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        })));
    }
    events
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::history::Role;
    use chrono::Utc;

    fn chunks(line: &str) -> Vec<ApiChunk> {
        parse_sse_line(line)
            .into_iter()
            .filter_map(|event| match event {
                SseEvent::Chunk(chunk) => Some(chunk),
                SseEvent::Done => None,
            })
            .collect()
    }

    #[test]
    fn test_parse_content_and_reasoning() {
        let line = r#"data: {"choices":[{"delta":{"content":"hi","reasoning_content":"hmm"}}]}"#;
        assert_eq!(
            chunks(line),
            vec![ApiChunk::Reasoning("hmm".to_string()), ApiChunk::Text("hi".to_string())]
        );
    }

    #[test]
    fn test_parse_usage_done_and_noise() {
        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        assert_eq!(
            chunks(line),
            vec![ApiChunk::Usage(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15
            })]
        );
        assert!(matches!(parse_sse_line("data: [DONE]").as_slice(), [SseEvent::Done]));
        assert!(parse_sse_line(": keep-alive").is_empty());
        assert!(parse_sse_line("data: {broken").is_empty());
    }

    #[test]
    fn test_character_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{e9}\"}}]}\n".as_bytes();
        let split = line.iter().position(|byte| *byte == 0xC3).unwrap() + 1;

        let mut lines = LineBuffer::default();
        assert!(lines.push(&line[..split]).is_empty());
        let decoded = lines.push(&line[split..]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(chunks(decoded[0].trim_end()), vec![ApiChunk::Text("caf\u{e9}".to_string())]);
    }

    #[test]
    fn test_line_buffer_keeps_partial_tail() {
        let mut lines = LineBuffer::default();
        assert_eq!(lines.push(b"data: one\ndata: t"), vec!["data: one\n".to_string()]);
        assert_eq!(lines.push(b"wo\n\n"), vec!["data: two\n".to_string(), "\n".to_string()]);
        assert!(lines.push(b"").is_empty());
    }

    #[test]
    fn test_request_body_includes_system_and_history() {
        let handler = OpenAiHandler::new(OpenAiSettings {
            base_url: "http://localhost:11434/v1/".to_string(),
            model: "llama3".to_string(),
            api_key: Some("secret".to_string()),
            max_tokens: None,
            context_window: 8192,
        })
        .unwrap();
        let history = vec![ConversationItem {
            role: Role::User,
            content: "<meta>historyId:1</meta>hello".to_string(),
            timestamp: Utc::now(),
        }];

        let body = serde_json::to_value(handler.request_body("be brief", &history)).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "<meta>historyId:1</meta>hello");
        assert!(body.get("max_completion_tokens").is_none());

        let headers = handler.build_headers().unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer secret");
        assert_eq!(handler.model().context_window, 8192);
    }
}
