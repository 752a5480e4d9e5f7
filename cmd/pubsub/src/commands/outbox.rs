//! Outbox maintenance commands.

use std::path::PathBuf;

use chrono::{Duration, Utc};
use clap::{Args, Subcommand, ValueEnum};
use giztoy_pubsub::Outbox;
use giztoy_pubsub::store::{BackendKind, StoreSettings};

use super::{output_json, print_info, print_success, print_verbose};
use crate::Cli;

/// Inspect and maintain an outbox.
#[derive(Args)]
pub struct OutboxCommand {
    /// Storage backend
    #[arg(long, value_enum, default_value_t = Backend::Redb)]
    backend: Backend,
    /// Database file (redb) or directory (dir)
    #[arg(long)]
    path: PathBuf,

    #[command(subcommand)]
    command: OutboxSubcommand,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Redb,
    Dir,
}

impl From<Backend> for BackendKind {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Redb => BackendKind::Redb,
            Backend::Dir => BackendKind::Dir,
        }
    }
}

#[derive(Subcommand)]
enum OutboxSubcommand {
    /// List unacknowledged messages, oldest first
    Pending,
    /// Mark a message acknowledged
    Ack {
        /// Message id
        id: String,
    },
    /// Remove messages acknowledged more than `--older-than` seconds ago
    Clean {
        #[arg(long, default_value_t = 0)]
        older_than: u64,
    },
}

impl OutboxCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let settings = StoreSettings {
            backend: self.backend.into(),
            path: self.path.clone(),
        };
        print_verbose(cli, &format!("opening outbox at {}", self.path.display()));
        let outbox = Outbox::new(settings.open()?);

        match &self.command {
            OutboxSubcommand::Pending => {
                let pending = outbox.pending_messages()?;
                if cli.json {
                    return output_json(&pending);
                }
                if pending.is_empty() {
                    print_info("no pending messages");
                }
                for msg in &pending {
                    println!(
                        "{}\t{}\tqos={}\t{}\t{} bytes",
                        msg.message_id,
                        msg.topic,
                        msg.qos.level(),
                        msg.created_at.to_rfc3339(),
                        msg.payload.len()
                    );
                }
                Ok(())
            }
            OutboxSubcommand::Ack { id } => {
                if outbox.mark_acknowledged(id)? {
                    print_success(&format!("acknowledged {id}"));
                    Ok(())
                } else {
                    anyhow::bail!("message {id:?} not found")
                }
            }
            OutboxSubcommand::Clean { older_than } => {
                let secs = i64::try_from(*older_than)?;
                let cutoff = Utc::now() - Duration::seconds(secs);
                let removed = outbox.clean_acknowledged(cutoff)?;
                print_success(&format!("removed {removed} acknowledged messages"));
                print_info(&format!("{} messages remain", outbox.len()?));
                Ok(())
            }
        }
    }
}
