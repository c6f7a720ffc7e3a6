use crate::agent::Provider;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Serve turns as JSON lines over stdin/stdout
    Serve {
        /// Agent backend for turns that do not name one
        #[arg(short = 'p', long, value_enum, default_value = "cli")]
        provider: Provider,
    },

    /// Run a recorded agent response through the patch pipeline
    Replay {
        /// File with the raw agent response text
        file: PathBuf,

        /// Characters per simulated delta (0 = whole file at once)
        #[arg(long, default_value_t = 16)]
        chunk_size: usize,

        /// File with the user message carrying `[Overleaf file: ...]` blocks
        #[arg(long)]
        context: Option<PathBuf>,

        /// Treat the response as a rewrite of the selection
        #[arg(long)]
        rewrite: bool,
    },
}

/// Define the application arguments
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Mode,

    /// Enable verbose logging (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Settings file (default: ~/.config/ageaf-host/settings.json)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,
}

impl Args {
    pub fn parse() -> Self {
        <Args as Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_serve_defaults() {
        let args = Args::try_parse_from(["ageaf-host", "serve"]).expect("Failed to parse args");
        assert_eq!(args.verbose, 0);
        assert!(args.settings.is_none());
        assert!(matches!(
            args.mode,
            Mode::Serve {
                provider: Provider::Cli
            }
        ));
    }

    #[test]
    fn test_serve_with_provider_and_verbosity() {
        let args = Args::try_parse_from(["ageaf-host", "-vv", "serve", "--provider", "app-server"])
            .expect("Failed to parse args");
        assert_eq!(args.verbose, 2);
        assert!(matches!(
            args.mode,
            Mode::Serve {
                provider: Provider::AppServer
            }
        ));
    }

    #[test]
    fn test_replay_options() {
        let args = Args::try_parse_from([
            "ageaf-host",
            "replay",
            "response.txt",
            "--chunk-size",
            "3",
            "--context",
            "message.txt",
            "--rewrite",
            "--settings",
            "custom.json",
        ])
        .expect("Failed to parse args");

        assert_eq!(args.settings, Some(PathBuf::from("custom.json")));
        match args.mode {
            Mode::Replay {
                file,
                chunk_size,
                context,
                rewrite,
            } => {
                assert_eq!(file, PathBuf::from("response.txt"));
                assert_eq!(chunk_size, 3);
                assert_eq!(context, Some(PathBuf::from("message.txt")));
                assert!(rewrite);
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Args::try_parse_from(["ageaf-host"]).is_err());
        assert!(Args::try_parse_from(["ageaf-host", "serve", "--provider", "nope"]).is_err());
    }
}
