mod agent;
mod app;
mod cli;
mod context;
mod events;
mod logging;
mod session;
mod settings;
mod streaming;
mod turn;
mod types;
mod utils;

use crate::cli::{Args, Mode};
use crate::logging::setup_logging;
use crate::types::TurnAction;
use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let settings = settings::load_settings(args.settings.as_deref())?;

    match args.mode {
        Mode::Serve { provider } => app::serve(settings, provider).await,
        Mode::Replay {
            file,
            chunk_size,
            context,
            rewrite,
        } => {
            let options = app::ReplayOptions {
                transcript: file,
                context,
                chunk_size,
                action: if rewrite {
                    TurnAction::Rewrite
                } else {
                    TurnAction::Chat
                },
            };
            app::replay(options, &settings).await
        }
    }
}
