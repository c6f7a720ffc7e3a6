//! Runtime for coding-agent CLIs that print `stream-json` lines.

use super::process::{collect_stderr, exit_error, spawn_piped};
use super::{send, AgentEvent, AgentEventSender, AgentRuntime, AGENT_INSTRUCTIONS};
use crate::session::ConversationState;
use crate::settings::CliSettings;
use crate::types::{TurnRequest, Usage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliLine {
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    StreamEvent {
        event: StreamEvent,
    },
    Assistant {
        message: CliMessage,
    },
    User {
        message: CliMessage,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        usage: Option<CliUsage>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: BlockDelta },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CliMessage {
    #[serde(default)]
    content: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Blocks(Vec<ContentBlock>),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

impl From<CliUsage> for Usage {
    fn from(usage: CliUsage) -> Self {
        Usage {
            input_tokens: usage.input_tokens
                + usage.cache_creation_input_tokens
                + usage.cache_read_input_tokens,
            output_tokens: usage.output_tokens,
        }
    }
}

/// Turns stream-json lines into agent events.
#[derive(Debug, Default)]
pub(super) struct CliTranslator {
    session_id: Option<String>,
    /// Partial messages were seen, so full assistant messages repeat text
    streamed_text: bool,
    tool_names: HashMap<String, String>,
    finished: bool,
}

impl CliTranslator {
    pub(super) fn translate(&mut self, line: &str) -> Vec<AgentEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let parsed: CliLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("Ignoring unparsable CLI line ({e}): {line}");
                return Vec::new();
            }
        };

        match parsed {
            CliLine::System { session_id } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                Vec::new()
            }
            CliLine::StreamEvent {
                event:
                    StreamEvent::ContentBlockDelta {
                        delta: BlockDelta::TextDelta { text },
                    },
            } => {
                self.streamed_text = true;
                vec![AgentEvent::TextDelta(text)]
            }
            CliLine::StreamEvent { .. } => Vec::new(),
            CliLine::Assistant { message } => {
                let mut events = Vec::new();
                for block in message.blocks() {
                    match block {
                        ContentBlock::Text { text } if !self.streamed_text => {
                            events.push(AgentEvent::TextDelta(text));
                        }
                        ContentBlock::ToolUse { id, name } => {
                            self.tool_names.insert(id, name.clone());
                            events.push(AgentEvent::ToolEvent {
                                name,
                                phase: "started".to_string(),
                            });
                        }
                        _ => {}
                    }
                }
                events
            }
            CliLine::User { message } => message
                .blocks()
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        is_error,
                    } => {
                        let name = self
                            .tool_names
                            .remove(&tool_use_id)
                            .unwrap_or_else(|| "tool".to_string());
                        let phase = if is_error { "failed" } else { "completed" };
                        Some(AgentEvent::ToolEvent {
                            name,
                            phase: phase.to_string(),
                        })
                    }
                    _ => None,
                })
                .collect(),
            CliLine::Result {
                is_error,
                result,
                session_id,
                usage,
            } => {
                self.finished = true;
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                if is_error {
                    let message = result.unwrap_or_else(|| "Agent reported an error".to_string());
                    vec![AgentEvent::Error(message)]
                } else {
                    vec![AgentEvent::TurnEnd {
                        final_text: result,
                        usage: usage.map(Usage::from),
                    }]
                }
            }
            CliLine::Other => Vec::new(),
        }
    }
}

impl CliMessage {
    fn blocks(self) -> Vec<ContentBlock> {
        match self.content {
            Some(MessageContent::Blocks(blocks)) => blocks,
            Some(MessageContent::Text(text)) => vec![ContentBlock::Text { text }],
            None => Vec::new(),
        }
    }
}

pub struct CliRuntime {
    settings: CliSettings,
}

impl CliRuntime {
    pub fn new(settings: CliSettings) -> Self {
        Self { settings }
    }

    fn args(&self, resume: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
            "--append-system-prompt",
            AGENT_INSTRUCTIONS,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(model) = &self.settings.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(session_id) = resume {
            args.push("--resume".to_string());
            args.push(session_id.to_string());
        }
        args.extend(self.settings.args.iter().cloned());
        args
    }
}

#[async_trait]
impl AgentRuntime for CliRuntime {
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
        let args = self.args(session.cli_session_id.as_deref());
        let Some(mut child) = spawn_piped(command, &args, self.settings.working_dir.as_ref())?
        else {
            send(
                &events,
                AgentEvent::NotConfigured(format!("Agent CLI `{command}` is not installed")),
            );
            return Ok(());
        };

        let mut stdin = child.stdin.take().context("Child stdin not captured")?;
        let stdout = child.stdout.take().context("Child stdout not captured")?;
        let stderr = collect_stderr(child.stderr.take().context("Child stderr not captured")?);

        stdin
            .write_all(request.message.as_bytes())
            .await
            .context("Failed to send message to agent CLI")?;
        drop(stdin);

        let mut translator = CliTranslator::default();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            for event in translator.translate(&line) {
                send(&events, event);
            }
        }

        if translator.session_id.is_some() {
            session.cli_session_id = translator.session_id.clone();
        }

        let status = child.wait().await?;
        if !status.success() && !translator.finished {
            return Err(exit_error(command, status, stderr).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate_all(lines: &[&str]) -> (CliTranslator, Vec<AgentEvent>) {
        let mut translator = CliTranslator::default();
        let events = lines
            .iter()
            .flat_map(|line| translator.translate(line))
            .collect();
        (translator, events)
    }

    #[test]
    fn test_streamed_session() {
        let (translator, events) = translate_all(&[
            r#"{"type":"system","subtype":"init","session_id":"s-1","model":"sonnet"}"#,
            r#"{"type":"stream_event","event":{"type":"message_start"}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"},{"type":"tool_use","id":"t1","name":"Read","input":{}}]}}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#,
            r#"{"type":"result","subtype":"success","is_error":false,"result":"Hello","session_id":"s-1","usage":{"input_tokens":10,"cache_read_input_tokens":5,"output_tokens":3}}"#,
        ]);

        assert_eq!(
            events,
            vec![
                AgentEvent::TextDelta("Hel".to_string()),
                AgentEvent::TextDelta("lo".to_string()),
                AgentEvent::ToolEvent {
                    name: "Read".to_string(),
                    phase: "started".to_string()
                },
                AgentEvent::ToolEvent {
                    name: "Read".to_string(),
                    phase: "completed".to_string()
                },
                AgentEvent::TurnEnd {
                    final_text: Some("Hello".to_string()),
                    usage: Some(Usage {
                        input_tokens: 15,
                        output_tokens: 3
                    }),
                },
            ]
        );
        assert_eq!(translator.session_id.as_deref(), Some("s-1"));
        assert!(translator.finished);
    }

    #[test]
    fn test_assistant_text_without_partial_messages() {
        let (_, events) = translate_all(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Whole answer"}]}}"#,
        ]);
        assert_eq!(events, vec![AgentEvent::TextDelta("Whole answer".to_string())]);
    }

    #[test]
    fn test_error_result_and_garbage() {
        let (_, events) = translate_all(&[
            "not json at all",
            "",
            r#"{"type":"rate_limit","retry":1}"#,
            r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"Prompt is too long"}"#,
        ]);
        assert_eq!(
            events,
            vec![AgentEvent::Error("Prompt is too long".to_string())]
        );
    }

    #[test]
    fn test_args_resume_and_model() {
        let runtime = CliRuntime::new(CliSettings {
            model: Some("opus".to_string()),
            args: vec!["--permission-mode".to_string(), "plan".to_string()],
            ..CliSettings::default()
        });
        let args = runtime.args(Some("s-1"));
        assert_eq!(&args[..4], ["-p", "--output-format", "stream-json", "--verbose"]);
        let model = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model + 1], "opus");
        let resume = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume + 1], "s-1");
        assert_eq!(args.last().map(String::as_str), Some("plan"));
    }

    #[tokio::test]
    async fn test_missing_cli_reports_not_configured() {
        let runtime = CliRuntime::new(CliSettings {
            command: "ageaf-host-no-such-cli".to_string(),
            ..CliSettings::default()
        });
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut session = ConversationState::default();
        runtime
            .run_turn(&TurnRequest::default(), &mut session, tx)
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(AgentEvent::NotConfigured(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_script_and_keeps_session() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-agent.sh");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "cat > /dev/null\n",
                "echo '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"fake-1\"}'\n",
                "echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"Hi\"}]}}'\n",
                "echo '{\"type\":\"result\",\"is_error\":false,\"result\":\"Hi\"}'\n",
            ),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let runtime = CliRuntime::new(CliSettings {
            command: script.to_string_lossy().to_string(),
            ..CliSettings::default()
        });
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut session = ConversationState::default();
        let request = TurnRequest {
            message: "hello".to_string(),
            ..TurnRequest::default()
        };
        runtime.run_turn(&request, &mut session, tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(AgentEvent::TextDelta("Hi".to_string())));
        assert!(matches!(rx.recv().await, Some(AgentEvent::TurnEnd { .. })));
        assert_eq!(session.cli_session_id.as_deref(), Some("fake-1"));
    }
}
