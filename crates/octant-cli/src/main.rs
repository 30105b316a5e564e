//! octantctl - operator CLI for octant nodes.
//!
//! Inspects vertices, manages membranes and flips the system-wide mode by
//! operating on the node's persisted state directory.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use octant_core::config::DEFAULT_CONFIG_PATH;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

use commands::{Context, ErrorResponse, exit_codes};

/// octantctl - octant node control
#[derive(Parser, Debug)]
#[command(name = "octantctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to node configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Vertex profiles and states
    Vertex(commands::vertex::VertexCommand),

    /// Membrane lifecycle
    Membrane(commands::membrane::MembraneCommand),

    /// System-wide mode
    Chirality(commands::chirality::ChiralityCommand),
}

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so JSON on stdout stays parseable.
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let ctx = match Context::open(&cli.config, cli.json) {
        Ok(ctx) => ctx,
        Err(e) => {
            if cli.json {
                let response = ErrorResponse {
                    code: "config".to_string(),
                    message: format!("{e:#}"),
                };
                eprintln!(
                    "{}",
                    serde_json::to_string_pretty(&response).unwrap_or_else(|_| "{}".to_string())
                );
            } else {
                eprintln!("Error: {e:#}");
            }
            std::process::exit(i32::from(exit_codes::ERROR));
        },
    };

    let code = match &cli.command {
        Commands::Vertex(cmd) => commands::vertex::run_vertex(cmd, &ctx),
        Commands::Membrane(cmd) => commands::membrane::run_membrane(cmd, &ctx),
        Commands::Chirality(cmd) => commands::chirality::run_chirality(cmd, &ctx),
    };
    std::process::exit(i32::from(code));
}
