//! Runtime for OpenAI-compatible chat completion endpoints, using the
//! user's own API key.

use super::{send, AgentEvent, AgentEventSender, AgentRuntime, AGENT_INSTRUCTIONS};
use crate::session::{ChatMessage, ConversationState};
use crate::settings::ByokSettings;
use crate::types::{TurnRequest, Usage};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatStreamResponse {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    #[serde(default)]
    delta: ChatDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// One decoded server-sent event line
#[derive(Debug, PartialEq, Eq)]
pub(super) enum SseLine {
    Text(String),
    Usage(Usage),
    Done,
}

/// Splits a byte stream into lines. Bytes of a line split across network
/// chunks are kept until the line is complete.
#[derive(Debug, Default)]
pub(super) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(super) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    pub(super) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = String::from_utf8_lossy(&rest).trim().to_string();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Decodes a `data:` line of a chat completion stream.
pub(super) fn parse_sse_line(line: &str) -> Vec<SseLine> {
    let Some(data) = line.strip_prefix("data:") else {
        return Vec::new();
    };
    let data = data.trim();
    if data == "[DONE]" {
        return vec![SseLine::Done];
    }

    match serde_json::from_str::<ChatStreamResponse>(data) {
        Ok(response) => {
            let mut out = Vec::new();
            if let Some(text) = response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
            {
                if !text.is_empty() {
                    out.push(SseLine::Text(text));
                }
            }
            if let Some(usage) = response.usage {
                out.push(SseLine::Usage(Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                }));
            }
            out
        }
        Err(e) => {
            warn!("Failed to parse stream event ({e}): '{data}'");
            Vec::new()
        }
    }
}

pub struct ByokRuntime {
    settings: ByokSettings,
    client: reqwest::Client,
}

impl ByokRuntime {
    pub fn new(settings: ByokSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn messages(&self, history: &[ChatMessage], user_message: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: AGENT_INSTRUCTIONS.to_string(),
        });
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: user_message.to_string(),
        });
        messages
    }
}

#[async_trait]
impl AgentRuntime for ByokRuntime {
    fn model(&self) -> String {
        self.settings.model.clone()
    }

    fn context_window(&self) -> u64 {
        self.settings.context_window
    }

    async fn run_turn(
        &self,
        request: &TurnRequest,
        session: &mut ConversationState,
        events: AgentEventSender,
    ) -> Result<()> {
        let Some(api_key) = self
            .settings
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
        else {
            send(
                &events,
                AgentEvent::NotConfigured("No API key configured for the byok provider".to_string()),
            );
            return Ok(());
        };

        let body = ChatRequest {
            model: &self.settings.model,
            messages: self.messages(&session.history, &request.message),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };
        debug!("Sending chat completion request to {}", self.url());

        let mut response = self
            .client
            .post(self.url())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Status {status}: {text}");
        }

        let mut lines = LineBuffer::default();
        let mut content = String::new();
        let mut usage = None;
        let mut handle = |line: &str| {
            for decoded in parse_sse_line(line) {
                match decoded {
                    SseLine::Text(text) => {
                        content.push_str(&text);
                        send(&events, AgentEvent::TextDelta(text));
                    }
                    SseLine::Usage(reported) => usage = Some(reported),
                    SseLine::Done => {}
                }
            }
        };

        while let Some(chunk) = response.chunk().await? {
            for line in lines.push(&chunk) {
                handle(&line);
            }
        }
        if let Some(line) = lines.finish() {
            handle(&line);
        }

        session.history.push(ChatMessage {
            role: "user".to_string(),
            content: request.message.clone(),
        });
        session.history.push(ChatMessage {
            role: "assistant".to_string(),
            content: content.clone(),
        });

        send(
            &events,
            AgentEvent::TurnEnd {
                final_text: Some(content),
                usage,
            },
        );
        Ok(())
    }
}
