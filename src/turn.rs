//! Runs one turn end to end: agent events in, host events out.

use crate::agent::{AgentEvent, AgentRuntime};
use crate::context::parse_snapshots;
use crate::events::{EventSink, SinkError};
use crate::session::SharedConversation;
use crate::settings::HostSettings;
use crate::streaming::{MermaidFenceRenderer, PatchStreamProcessor, TurnOutcome};
use crate::types::{DoneStatus, TurnRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Terminal condition reported by the agent through its events
enum AgentVerdict {
    Completed(Option<String>),
    Error(String),
    NotConfigured(String),
}

/// Runs `request` against `runtime`, emitting the turn's events to `sink`.
///
/// Exactly one `done` event is emitted on every path that does not fail on
/// the sink itself. Cancelling `cancel` drops the agent call and finishes
/// the turn as aborted.
pub async fn run_turn(
    runtime: Arc<dyn AgentRuntime>,
    request: TurnRequest,
    session: SharedConversation,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    settings: &HostSettings,
) -> Result<(), SinkError> {
    let snapshots = parse_snapshots(&request.message);
    tracing::info!(
        "Starting turn for {} with {} file snapshot(s)",
        request.conversation_id,
        snapshots.len()
    );
    let mut processor = PatchStreamProcessor::new(
        sink,
        Arc::new(MermaidFenceRenderer),
        snapshots,
        settings.stream_config(request.action),
    );

    let mut state = tokio::select! {
        state = session.lock() => state,
        _ = cancel.cancelled() => {
            return processor.finish(TurnOutcome::Aborted {
                message: Some("Turn was aborted before it started".to_string()),
            });
        }
    };

    let timeout_secs = settings.turn_timeout_secs;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let agent = runtime.run_turn(&request, &mut state, tx);
    tokio::pin!(agent);
    let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
    tokio::pin!(deadline);

    let mut verdict = None;
    let mut agent_result = None;
    let mut events_open = true;

    let outcome = loop {
        if !events_open {
            if let Some(result) = agent_result.take() {
                break outcome_for(result, verdict.take());
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Turn for {} aborted", request.conversation_id);
                break TurnOutcome::Aborted {
                    message: Some("Turn was aborted".to_string()),
                };
            }
            _ = &mut deadline => {
                tracing::warn!("Turn for {} timed out", request.conversation_id);
                break TurnOutcome::Failed {
                    status: DoneStatus::Error,
                    message: format!("Turn timed out after {timeout_secs} seconds"),
                };
            }
            event = rx.recv(), if events_open => match event {
                Some(event) => {
                    if let Some(found) = handle_event(&mut processor, runtime.as_ref(), event)? {
                        verdict.get_or_insert(found);
                    }
                }
                None => events_open = false,
            },
            result = &mut agent, if agent_result.is_none() => {
                agent_result = Some(result);
            }
        }
    };

    processor.finish(outcome)
}

fn handle_event(
    processor: &mut PatchStreamProcessor,
    runtime: &dyn AgentRuntime,
    event: AgentEvent,
) -> Result<Option<AgentVerdict>, SinkError> {
    match event {
        AgentEvent::TextDelta(text) => processor.push_delta(&text)?,
        AgentEvent::ToolEvent { name, phase } => processor.tool_event(&name, &phase)?,
        AgentEvent::Usage(usage) => {
            processor.usage(&runtime.model(), usage.total(), runtime.context_window())?
        }
        AgentEvent::TurnEnd { final_text, usage } => {
            if let Some(usage) = usage {
                processor.usage(&runtime.model(), usage.total(), runtime.context_window())?;
            }
            return Ok(Some(AgentVerdict::Completed(final_text)));
        }
        AgentEvent::Error(message) => return Ok(Some(AgentVerdict::Error(message))),
        AgentEvent::NotConfigured(message) => {
            return Ok(Some(AgentVerdict::NotConfigured(message)))
        }
    }
    Ok(None)
}

fn outcome_for(result: anyhow::Result<()>, verdict: Option<AgentVerdict>) -> TurnOutcome {
    match (result, verdict) {
        (_, Some(AgentVerdict::NotConfigured(message))) => TurnOutcome::Failed {
            status: DoneStatus::NotConfigured,
            message,
        },
        (_, Some(AgentVerdict::Error(message))) => TurnOutcome::Failed {
            status: DoneStatus::Error,
            message,
        },
        (Err(e), _) => {
            tracing::warn!("Agent failed: {e:#}");
            TurnOutcome::Failed {
                status: DoneStatus::Error,
                message: format!("{e:#}"),
            }
        }
        (Ok(()), Some(AgentVerdict::Completed(final_text))) => {
            TurnOutcome::Completed { final_text }
        }
        (Ok(()), None) => TurnOutcome::Completed { final_text: None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConversationState, SessionRegistry};
    use crate::types::{HostEvent, Patch, Usage};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<HostEvent>>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: HostEvent) -> Result<(), SinkError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    impl RecordingSink {
        fn done(&self) -> Vec<HostEvent> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, HostEvent::Done { .. }))
                .cloned()
                .collect()
        }
    }

    /// Replays scripted events, then optionally hangs or fails
    struct ScriptedRuntime {
        events: Vec<AgentEvent>,
        hang: bool,
        fail: Option<String>,
    }

    impl ScriptedRuntime {
        fn new(events: Vec<AgentEvent>) -> Self {
            Self {
                events,
                hang: false,
                fail: None,
            }
        }
    }

    #[async_trait]
    impl AgentRuntime for ScriptedRuntime {
        fn model(&self) -> String {
            "scripted".to_string()
        }

        fn context_window(&self) -> u64 {
            1000
        }

        async fn run_turn(
            &self,
            _request: &TurnRequest,
            session: &mut ConversationState,
            events: crate::agent::AgentEventSender,
        ) -> anyhow::Result<()> {
            session.cli_session_id = Some("scripted-session".to_string());
            for event in &self.events {
                events.send(event.clone()).unwrap();
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            match &self.fail {
                Some(message) => Err(anyhow::anyhow!(message.clone())),
                None => Ok(()),
            }
        }
    }

    async fn drive(runtime: ScriptedRuntime, cancel: CancellationToken, settings: HostSettings) -> (RecordingSink, SharedConversation) {
        let sink = RecordingSink::default();
        let registry = SessionRegistry::new();
        let session = registry.create_or_get("c1");
        let request = TurnRequest {
            conversation_id: "c1".to_string(),
            message: "Fix it\n\n[Overleaf file: main.tex]\n```latex\nHello world\n```\n".to_string(),
            ..TurnRequest::default()
        };
        run_turn(
            Arc::new(runtime),
            request,
            session.clone(),
            Arc::new(sink.clone()),
            cancel,
            &settings,
        )
        .await
        .unwrap();
        (sink, session)
    }

    #[tokio::test]
    async fn test_completed_turn_emits_patch_usage_and_done() {
        let runtime = ScriptedRuntime::new(vec![
            AgentEvent::TextDelta("Updating.\n<<<AGEAF_FILE_UPDATE path=\"main.tex\">>>\n".to_string()),
            AgentEvent::ToolEvent {
                name: "Read".to_string(),
                phase: "started".to_string(),
            },
            AgentEvent::TextDelta("Hello there\n<<<AGEAF_FILE_UPDATE_END>>>\n".to_string()),
            AgentEvent::TurnEnd {
                final_text: None,
                usage: Some(Usage {
                    input_tokens: 40,
                    output_tokens: 2,
                }),
            },
        ]);
        let (sink, session) = drive(runtime, CancellationToken::new(), HostSettings::default()).await;

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                HostEvent::Delta {
                    text: "Updating.\n".to_string()
                },
                HostEvent::FileStarted {
                    file_path: "main.tex".to_string()
                },
                HostEvent::Plan {
                    message: "Read started".to_string(),
                    tool_name: Some("Read".to_string()),
                    phase: "started".to_string(),
                },
                HostEvent::Patch(Patch::ReplaceRangeInFile {
                    file_path: "main.tex".to_string(),
                    expected_old_text: "Hello world".to_string(),
                    text: "Hello there".to_string(),
                    from: 0,
                    to: 11,
                    line_from: Some(1),
                }),
                HostEvent::Usage {
                    model: "scripted".to_string(),
                    used_tokens: 42,
                    context_window: 1000,
                },
                HostEvent::Done {
                    status: DoneStatus::Ok,
                    message: None,
                },
            ]
        );
        assert_eq!(
            session.lock().await.cli_session_id.as_deref(),
            Some("scripted-session")
        );
    }

    #[tokio::test]
    async fn test_agent_error_event_ends_with_error() {
        let runtime = ScriptedRuntime::new(vec![
            AgentEvent::TextDelta("Partial".to_string()),
            AgentEvent::Error("Prompt is too long".to_string()),
        ]);
        let (sink, _) = drive(runtime, CancellationToken::new(), HostSettings::default()).await;

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                HostEvent::Delta {
                    text: "Partial".to_string()
                },
                HostEvent::Done {
                    status: DoneStatus::Error,
                    message: Some("Prompt is too long".to_string()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_ends_with_error() {
        let mut runtime = ScriptedRuntime::new(Vec::new());
        runtime.fail = Some("connection reset".to_string());
        let (sink, _) = drive(runtime, CancellationToken::new(), HostSettings::default()).await;

        assert_eq!(
            sink.done(),
            vec![HostEvent::Done {
                status: DoneStatus::Error,
                message: Some("connection reset".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn test_not_configured() {
        let runtime = ScriptedRuntime::new(vec![AgentEvent::NotConfigured(
            "No API key".to_string(),
        )]);
        let (sink, _) = drive(runtime, CancellationToken::new(), HostSettings::default()).await;

        assert_eq!(
            sink.done(),
            vec![HostEvent::Done {
                status: DoneStatus::NotConfigured,
                message: Some("No API key".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn test_cancel_aborts_hanging_agent() {
        let mut runtime = ScriptedRuntime::new(vec![AgentEvent::TextDelta("Thinking".to_string())]);
        runtime.hang = true;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let (sink, _) = drive(runtime, cancel, HostSettings::default()).await;

        assert_eq!(
            sink.done(),
            vec![HostEvent::Done {
                status: DoneStatus::Aborted,
                message: Some("Turn was aborted".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn test_timeout_ends_with_error() {
        let mut runtime = ScriptedRuntime::new(Vec::new());
        runtime.hang = true;
        let settings = HostSettings {
            turn_timeout_secs: 1,
            ..HostSettings::default()
        };
        let (sink, _) = drive(runtime, CancellationToken::new(), settings).await;

        assert_eq!(
            sink.done(),
            vec![HostEvent::Done {
                status: DoneStatus::Error,
                message: Some("Turn timed out after 1 seconds".to_string()),
            }]
        );
    }
}
