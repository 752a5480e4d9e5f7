//! pubsub CLI - inspect topics, outboxes and broker traffic.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{ListenCommand, MatchCommand, OutboxCommand, PublishCommand};

/// pubsub CLI - a command line interface for giztoy pubsub.
///
/// Connections are read from a YAML or JSON settings file, the same file
/// services load with `Settings::load`.
#[derive(Parser)]
#[command(name = "pubsub")]
#[command(about = "Publish/subscribe and outbox tool")]
#[command(version)]
pub struct Cli {
    /// Settings file (YAML or JSON)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Connection name (default: the configured default connection)
    #[arg(short = 'c', long, global = true)]
    pub connection: Option<String>,

    /// Output as JSON (for piping)
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show which patterns match a topic
    Match(MatchCommand),
    /// Inspect and maintain an outbox
    Outbox(OutboxCommand),
    /// Publish one message
    Publish(PublishCommand),
    /// Print messages received on a topic until Ctrl-C
    Listen(ListenCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Match(cmd) => cmd.run(&cli),
        Commands::Outbox(cmd) => cmd.run(&cli),
        Commands::Publish(cmd) => cmd.run(&cli).await,
        Commands::Listen(cmd) => cmd.run(&cli).await,
    }
}
