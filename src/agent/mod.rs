//! Agent runtime adapters
//!
//! Each backend is translated into the same [`AgentEvent`] stream so the
//! streaming pipeline never needs to know which agent produced the text.

mod app_server;
mod byok;
mod cli_runtime;
mod process;
mod prompt;

use crate::session::ConversationState;
use crate::settings::HostSettings;
use crate::types::{TurnRequest, Usage};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use app_server::AppServerRuntime;
pub use byok::ByokRuntime;
pub use cli_runtime::CliRuntime;
pub use prompt::AGENT_INSTRUCTIONS;

/// Normalized output of an agent backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Incremental assistant text
    TextDelta(String),
    /// Informational tool progress
    ToolEvent { name: String, phase: String },
    /// Token usage reported while the turn runs
    Usage(Usage),
    /// The turn's consolidated output, if the backend has one
    TurnEnd {
        final_text: Option<String>,
        usage: Option<Usage>,
    },
    /// The backend reported a failure of this turn
    Error(String),
    /// The backend cannot run: missing executable or credentials
    NotConfigured(String),
}

pub type AgentEventSender = mpsc::UnboundedSender<AgentEvent>;

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Model name reported in usage events
    fn model(&self) -> String;

    fn context_window(&self) -> u64;

    /// Runs one turn, pushing events as they arrive. Returns once the backend
    /// is done; transport failures are returned as errors. Dropping the
    /// future aborts the turn.
    async fn run_turn(
        &self,
        request: &TurnRequest,
        session: &mut ConversationState,
        events: AgentEventSender,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[default]
    Cli,
    AppServer,
    Byok,
}

pub fn create_runtime(provider: Provider, settings: &HostSettings) -> Arc<dyn AgentRuntime> {
    match provider {
        Provider::Cli => Arc::new(CliRuntime::new(settings.cli.clone())),
        Provider::AppServer => Arc::new(AppServerRuntime::new(settings.app_server.clone())),
        Provider::Byok => Arc::new(ByokRuntime::new(settings.byok.clone())),
    }
}

/// Sends an event, ignoring a receiver that already went away.
fn send(events: &AgentEventSender, event: AgentEvent) {
    if events.send(event).is_err() {
        tracing::trace!("Agent event dropped, turn is no longer listening");
    }
}
