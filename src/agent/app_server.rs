//! Runtime for agent app-servers that speak JSON-RPC over stdio.
//!
//! One server process is started per turn. Conversations continue across
//! turns through the thread id the server hands out.

use super::process::{collect_stderr, exit_error, spawn_piped};
use super::{send, AgentEvent, AgentEventSender, AgentRuntime, AGENT_INSTRUCTIONS};
use crate::session::ConversationState;
use crate::settings::AppServerSettings;
use crate::types::{TurnRequest, Usage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout};

#[derive(Debug, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

/// What the notification stream says about the running turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum TurnProgress {
    Running,
    Finished,
}

/// Translates server notifications into agent events.
#[derive(Debug, Default)]
pub(super) struct AppServerTranslator {
    /// Text of the last completed agent message
    last_message: Option<String>,
    usage: Option<Usage>,
}

impl AppServerTranslator {
    pub(super) fn notification(&mut self, method: &str, params: &Value) -> (Vec<AgentEvent>, TurnProgress) {
        let mut events = Vec::new();
        let mut progress = TurnProgress::Running;

        match method {
            "item/agentMessage/delta" => {
                if let Some(delta) = params.get("delta").and_then(Value::as_str) {
                    events.push(AgentEvent::TextDelta(delta.to_string()));
                }
            }
            "item/started" | "item/completed" => {
                let item = &params["item"];
                let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
                let completed = method == "item/completed";
                match item_type {
                    "agentMessage" => {
                        if completed {
                            if let Some(text) = item.get("text").and_then(Value::as_str) {
                                self.last_message = Some(text.to_string());
                            }
                        }
                    }
                    "userMessage" | "reasoning" | "" => {}
                    other => {
                        let name = tool_name(other, item);
                        let phase = if !completed {
                            "started"
                        } else if item.get("status").and_then(Value::as_str) == Some("failed") {
                            "failed"
                        } else {
                            "completed"
                        };
                        events.push(AgentEvent::ToolEvent {
                            name,
                            phase: phase.to_string(),
                        });
                    }
                }
            }
            "thread/tokenUsage/updated" => {
                let total = &params["tokenUsage"]["total"];
                let usage = Usage {
                    input_tokens: total["inputTokens"].as_u64().unwrap_or_default(),
                    output_tokens: total["outputTokens"].as_u64().unwrap_or_default(),
                };
                self.usage = Some(usage);
                events.push(AgentEvent::Usage(usage));
            }
            "turn/completed" => {
                progress = TurnProgress::Finished;
                let turn = &params["turn"];
                match turn.get("status").and_then(Value::as_str) {
                    Some("failed") => {
                        let message = turn["error"]["message"]
                            .as_str()
                            .unwrap_or("Turn failed")
                            .to_string();
                        events.push(AgentEvent::Error(message));
                    }
                    Some("interrupted") => {
                        events.push(AgentEvent::Error("Turn was interrupted".to_string()));
                    }
                    _ => events.push(AgentEvent::TurnEnd {
                        final_text: self.last_message.take(),
                        usage: self.usage.take(),
                    }),
                }
            }
            "error" => {
                let will_retry = params
                    .get("willRetry")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let message = params["error"]["message"]
                    .as_str()
                    .unwrap_or("Agent server error");
                if will_retry {
                    tracing::info!("App server retrying after error: {message}");
                } else {
                    events.push(AgentEvent::Error(message.to_string()));
                    progress = TurnProgress::Finished;
                }
            }
            _ => tracing::trace!("Ignoring notification {method}"),
        }

        (events, progress)
    }
}

fn tool_name(item_type: &str, item: &Value) -> String {
    match item_type {
        "commandExecution" => item
            .get("command")
            .and_then(Value::as_str)
            .map(|command| format!("command: {command}"))
            .unwrap_or_else(|| "command".to_string()),
        "mcpToolCall" => item
            .get("tool")
            .and_then(Value::as_str)
            .unwrap_or("mcp tool")
            .to_string(),
        other => other.to_string(),
    }
}

/// Line-delimited JSON-RPC over the server's stdio
struct RpcConnection {
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl RpcConnection {
    async fn write(&mut self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        tracing::trace!("app-server <- {line}");
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn send_request(&mut self, method: &str, params: Value) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        self.write(&json!({ "id": id, "method": method, "params": params }))
            .await?;
        Ok(id)
    }

    async fn next_message(&mut self) -> Result<Option<RpcMessage>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            tracing::trace!("app-server -> {line}");
            match serde_json::from_str(line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => tracing::debug!("Ignoring unparsable app-server line ({e}): {line}"),
            }
        }
        Ok(None)
    }
}

/// Drives one turn against a connected server
struct TurnSession<'a> {
    connection: RpcConnection,
    translator: AppServerTranslator,
    events: &'a AgentEventSender,
}

impl TurnSession<'_> {
    /// Sends a request and waits for its response, handling anything the
    /// server sends in between.
    async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.connection.send_request(method, params).await?;
        loop {
            let message = self
                .connection
                .next_message()
                .await?
                .with_context(|| format!("App server closed the connection during {method}"))?;
            if message.method.is_none() && message.id.as_ref().and_then(Value::as_u64) == Some(id) {
                if let Some(error) = message.error {
                    anyhow::bail!("{method} failed ({}): {}", error.code, error.message);
                }
                return Ok(message.result.unwrap_or(Value::Null));
            }
            self.handle(message).await?;
        }
    }

    /// Handles a notification or server request. Returns whether the turn
    /// finished.
    async fn handle(&mut self, message: RpcMessage) -> Result<bool> {
        let Some(method) = message.method else {
            tracing::debug!("Unexpected response with id {:?}", message.id);
            return Ok(false);
        };

        if let Some(id) = message.id {
            // The host applies edits itself and never grants approvals
            tracing::debug!("Declining server request {method}");
            self.connection
                .write(&json!({
                    "id": id,
                    "error": { "code": -32601, "message": format!("{method} is not supported by this client") }
                }))
                .await?;
            return Ok(false);
        }

        let (events, progress) = self.translator.notification(&method, &message.params);
        for event in events {
            send(self.events, event);
        }
        Ok(progress == TurnProgress::Finished)
    }
}

pub struct AppServerRuntime {
    settings: AppServerSettings,
}

impl AppServerRuntime {
    pub fn new(settings: AppServerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl AgentRuntime for AppServerRuntime {
    fn model(&self) -> String {
        self.settings
            .model
            .clone()
            .unwrap_or_else(|| self.settings.command.clone())
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
        let command = &self.settings.command;
        let Some(mut child) = spawn_piped(
            command,
            &self.settings.args,
            self.settings.working_dir.as_ref(),
        )?
        else {
            send(
                &events,
                AgentEvent::NotConfigured(format!("Agent app-server `{command}` is not installed")),
            );
            return Ok(());
        };

        let stdin = child.stdin.take().context("Child stdin not captured")?;
        let stdout = child.stdout.take().context("Child stdout not captured")?;
        let stderr = collect_stderr(child.stderr.take().context("Child stderr not captured")?);

        let mut turn = TurnSession {
            connection: RpcConnection {
                stdin,
                lines: BufReader::new(stdout).lines(),
                next_id: 1,
            },
            translator: AppServerTranslator::default(),
            events: &events,
        };

        let result = drive_turn(&mut turn, request, session, &self.settings).await;
        drop(turn);

        if let Err(e) = result {
            return match child.try_wait()? {
                Some(status) if !status.success() => Err(exit_error(command, status, stderr).await),
                _ => Err(e),
            };
        }
        // The server keeps running after the turn; it is killed on drop
        Ok(())
    }
}

async fn drive_turn(
    turn: &mut TurnSession<'_>,
    request: &TurnRequest,
    session: &mut ConversationState,
    settings: &AppServerSettings,
) -> Result<()> {
    turn.call(
        "initialize",
        json!({ "clientInfo": { "name": "ageaf-host", "version": env!("CARGO_PKG_VERSION") } }),
    )
    .await?;
    turn.connection
        .write(&json!({ "method": "initialized", "params": {} }))
        .await?;

    let thread_id = match session.app_thread_id.clone() {
        Some(thread_id) => {
            turn.call("thread/resume", json!({ "threadId": thread_id }))
                .await?;
            thread_id
        }
        None => {
            let mut params = json!({ "developerInstructions": AGENT_INSTRUCTIONS });
            if let Some(model) = &settings.model {
                params["model"] = json!(model);
            }
            if let Some(dir) = &settings.working_dir {
                params["cwd"] = json!(dir);
            }
            let result = turn.call("thread/start", params).await?;
            let thread_id = result["thread"]["id"]
                .as_str()
                .context("thread/start returned no thread id")?
                .to_string();
            session.app_thread_id = Some(thread_id.clone());
            thread_id
        }
    };

    turn.call(
        "turn/start",
        json!({
            "threadId": thread_id,
            "input": [{ "type": "text", "text": request.message }]
        }),
    )
    .await?;

    while let Some(message) = turn.connection.next_message().await? {
        if turn.handle(message).await? {
            return Ok(());
        }
    }
    anyhow::bail!("App server closed the connection before the turn completed")
}
