use crate::agent::{create_runtime, AgentRuntime, Provider};
use crate::events::ChannelSink;
use crate::session::SessionRegistry;
use crate::settings::HostSettings;
use crate::turn::run_turn;
use crate::types::{HostEvent, TurnRequest};
use crate::utils::{forward_events, StreamWriter};
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// A command read from the host's input, one JSON object per line
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostCommand {
    Turn {
        #[serde(flatten)]
        request: TurnRequest,
        #[serde(default)]
        provider: Option<Provider>,
    },
    Abort {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Evict {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
}

/// Turns of one conversation that are still running
struct ActiveTurns {
    /// Distinguishes this entry from one created after an abort
    generation: u64,
    token: CancellationToken,
    running: usize,
}

type Cancellations = Arc<Mutex<HashMap<String, ActiveTurns>>>;

/// Accepts turn commands and runs each turn on its own task.
pub struct HostServer {
    settings: Arc<HostSettings>,
    default_provider: Provider,
    registry: SessionRegistry,
    runtimes: Mutex<HashMap<Provider, Arc<dyn AgentRuntime>>>,
    /// Cancels every running or queued turn of a conversation
    cancellations: Cancellations,
    next_generation: AtomicU64,
    events: mpsc::UnboundedSender<(String, HostEvent)>,
}

impl HostServer {
    pub fn new(
        settings: HostSettings,
        default_provider: Provider,
        events: mpsc::UnboundedSender<(String, HostEvent)>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            default_provider,
            registry: SessionRegistry::new(),
            runtimes: Mutex::new(HashMap::new()),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            events,
        }
    }

    /// Uses `runtime` for `provider` instead of the one built from settings.
    pub fn with_runtime(self, provider: Provider, runtime: Arc<dyn AgentRuntime>) -> Self {
        self.runtimes.lock().unwrap().insert(provider, runtime);
        self
    }

    fn runtime(&self, provider: Provider) -> Arc<dyn AgentRuntime> {
        self.runtimes
            .lock()
            .unwrap()
            .entry(provider)
            .or_insert_with(|| create_runtime(provider, &self.settings))
            .clone()
    }

    pub fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        trace!("Received command: {line}");
        match serde_json::from_str::<HostCommand>(line) {
            Ok(command) => self.handle_command(command),
            Err(e) => warn!("Ignoring invalid command: {e}"),
        }
    }

    pub fn handle_command(&self, command: HostCommand) {
        match command {
            HostCommand::Turn { request, provider } => {
                let provider = provider.unwrap_or(self.default_provider);
                self.start_turn(request, provider);
            }
            HostCommand::Abort { conversation_id } => {
                if !self.cancel_turns(&conversation_id) {
                    debug!("No running turn for {conversation_id}");
                }
            }
            HostCommand::Evict { conversation_id } => {
                self.cancel_turns(&conversation_id);
                self.registry.evict(&conversation_id);
            }
        }
    }

    /// Cancels the running turns of a conversation. Returns whether there
    /// were any.
    fn cancel_turns(&self, conversation_id: &str) -> bool {
        match self.cancellations.lock().unwrap().remove(conversation_id) {
            Some(active) => {
                debug!("Aborting turns of {conversation_id}");
                active.token.cancel();
                true
            }
            None => false,
        }
    }

    fn start_turn(&self, request: TurnRequest, provider: Provider) {
        let conversation_id = request.conversation_id.clone();
        let (generation, cancel) = {
            let mut cancellations = self.cancellations.lock().unwrap();
            let active = cancellations
                .entry(conversation_id.clone())
                .or_insert_with(|| ActiveTurns {
                    generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                    token: CancellationToken::new(),
                    running: 0,
                });
            active.running += 1;
            (active.generation, active.token.child_token())
        };
        let session = self.registry.create_or_get(&conversation_id);
        let runtime = self.runtime(provider);
        let sink = Arc::new(ChannelSink::new(conversation_id.clone(), self.events.clone()));
        let settings = self.settings.clone();
        let cancellations = self.cancellations.clone();

        debug!("Starting {provider:?} turn for {conversation_id}");
        tokio::spawn(async move {
            if let Err(e) = run_turn(runtime, request, session, sink, cancel, &settings).await {
                error!("Turn for {conversation_id} stopped: {e}");
            }
            finish_turn(&cancellations, &conversation_id, generation);
        });
    }

    #[cfg(test)]
    fn active_conversations(&self) -> usize {
        self.cancellations.lock().unwrap().len()
    }

    /// Cancels everything still running.
    pub fn shutdown(&self) {
        for (_, active) in self.cancellations.lock().unwrap().drain() {
            active.token.cancel();
        }
    }
}

/// Drops the conversation's entry once its last turn of `generation` ended.
fn finish_turn(
    cancellations: &Mutex<HashMap<String, ActiveTurns>>,
    conversation_id: &str,
    generation: u64,
) {
    let mut cancellations = cancellations.lock().unwrap();
    let Some(active) = cancellations.get_mut(conversation_id) else {
        return;
    };
    if active.generation != generation {
        return;
    }
    active.running -= 1;
    if active.running == 0 {
        cancellations.remove(conversation_id);
    }
}

/// Serves JSON-line commands from stdin and writes events to stdout until
/// stdin closes.
pub async fn serve(settings: HostSettings, default_provider: Provider) -> Result<()> {
    debug!("Starting host using stdio transport");
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(forward_events(rx, StreamWriter::new(tokio::io::stdout())));

    let server = HostServer::new(settings, default_provider, tx);
    let mut reader = BufReader::new(stdin());
    let mut line = String::new();
    while let Ok(n) = reader.read_line(&mut line).await {
        if n == 0 {
            break; // EOF
        }
        server.handle_line(&line);
        line.clear();
    }

    debug!("Input closed, shutting down");
    server.shutdown();
    drop(server);
    writer.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentEvent, AgentEventSender};
    use crate::session::ConversationState;
    use crate::settings::CliSettings;
    use crate::types::DoneStatus;
    use async_trait::async_trait;
    use std::time::Duration;

    struct HangingRuntime;

    #[async_trait]
    impl AgentRuntime for HangingRuntime {
        fn model(&self) -> String {
            "hanging".to_string()
        }

        fn context_window(&self) -> u64 {
            0
        }

        async fn run_turn(
            &self,
            _request: &TurnRequest,
            _session: &mut ConversationState,
            events: AgentEventSender,
        ) -> anyhow::Result<()> {
            let _ = events.send(AgentEvent::TextDelta("Working".to_string()));
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct QuickRuntime;

    #[async_trait]
    impl AgentRuntime for QuickRuntime {
        fn model(&self) -> String {
            "quick".to_string()
        }

        fn context_window(&self) -> u64 {
            0
        }

        async fn run_turn(
            &self,
            _request: &TurnRequest,
            _session: &mut ConversationState,
            events: AgentEventSender,
        ) -> anyhow::Result<()> {
            let _ = events.send(AgentEvent::TextDelta("Done".to_string()));
            Ok(())
        }
    }

    async fn wait_until_idle(server: &HostServer) {
        for _ in 0..100 {
            if server.active_conversations() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("conversation entries were not released");
    }

    async fn next_done(rx: &mut mpsc::UnboundedReceiver<(String, HostEvent)>) -> (String, HostEvent) {
        loop {
            let (id, event) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed");
            if matches!(event, HostEvent::Done { .. }) {
                return (id, event);
            }
        }
    }

    #[test]
    fn test_parse_commands() {
        let command: HostCommand = serde_json::from_str(
            r#"{"type":"turn","conversationId":"c1","message":"hi","action":"rewrite","provider":"byok"}"#,
        )
        .unwrap();
        match command {
            HostCommand::Turn { request, provider } => {
                assert_eq!(request.conversation_id, "c1");
                assert_eq!(request.message, "hi");
                assert_eq!(request.action, crate::types::TurnAction::Rewrite);
                assert_eq!(provider, Some(Provider::Byok));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let command: HostCommand =
            serde_json::from_str(r#"{"type":"abort","conversationId":"c1"}"#).unwrap();
        assert!(matches!(command, HostCommand::Abort { conversation_id } if conversation_id == "c1"));

        assert!(serde_json::from_str::<HostCommand>(r#"{"type":"dance"}"#).is_err());
    }

    #[tokio::test]
    async fn test_missing_cli_finishes_not_configured() {
        let settings = HostSettings {
            cli: CliSettings {
                command: "ageaf-host-no-such-cli".to_string(),
                ..CliSettings::default()
            },
            ..HostSettings::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = HostServer::new(settings, Provider::Cli, tx);
        server.handle_line(r#"{"type":"turn","conversationId":"c1","message":"hi"}"#);

        let (id, done) = next_done(&mut rx).await;
        assert_eq!(id, "c1");
        assert!(matches!(
            done,
            HostEvent::Done {
                status: DoneStatus::NotConfigured,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_abort_cancels_running_turn() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = HostServer::new(HostSettings::default(), Provider::Cli, tx)
            .with_runtime(Provider::Cli, Arc::new(HangingRuntime));
        server.handle_line(r#"{"type":"turn","conversationId":"c1","message":"hi"}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.handle_line(r#"{"type":"abort","conversationId":"c1"}"#);

        let (id, done) = next_done(&mut rx).await;
        assert_eq!(id, "c1");
        assert!(matches!(
            done,
            HostEvent::Done {
                status: DoneStatus::Aborted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_finished_turns_release_their_conversation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = HostServer::new(HostSettings::default(), Provider::Cli, tx)
            .with_runtime(Provider::Cli, Arc::new(QuickRuntime));
        server.handle_line(r#"{"type":"turn","conversationId":"c1","message":"hi"}"#);
        server.handle_line(r#"{"type":"turn","conversationId":"c2","message":"hi"}"#);

        next_done(&mut rx).await;
        next_done(&mut rx).await;
        wait_until_idle(&server).await;
    }

    #[tokio::test]
    async fn test_evict_cancels_and_releases_conversation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = HostServer::new(HostSettings::default(), Provider::Cli, tx)
            .with_runtime(Provider::Cli, Arc::new(HangingRuntime));
        server.handle_line(r#"{"type":"turn","conversationId":"c1","message":"hi"}"#);
        assert_eq!(server.active_conversations(), 1);

        server.handle_line(r#"{"type":"evict","conversationId":"c1"}"#);
        assert_eq!(server.active_conversations(), 0);

        let (_, done) = next_done(&mut rx).await;
        assert!(matches!(
            done,
            HostEvent::Done {
                status: DoneStatus::Aborted,
                ..
            }
        ));

        // A turn started after the eviction is tracked on its own
        server.handle_line(r#"{"type":"turn","conversationId":"c1","message":"again"}"#);
        assert_eq!(server.active_conversations(), 1);
        server.shutdown();
        next_done(&mut rx).await;
        assert_eq!(server.active_conversations(), 0);
    }

    #[tokio::test]
    async fn test_invalid_lines_are_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = HostServer::new(HostSettings::default(), Provider::Cli, tx);
        server.handle_line("");
        server.handle_line("not json");
        server.handle_line(r#"{"type":"evict","conversationId":"c9"}"#);
        drop(server);
        assert!(rx.recv().await.is_none());
    }
}
