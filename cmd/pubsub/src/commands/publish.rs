//! Publish command.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use giztoy_pubsub::store::RedbStore;
use giztoy_pubsub::{ConnectionRegistry, Outbox, PublishOptions, Publisher, QoS};

use super::{load_settings, parse_qos, print_success, print_verbose, print_warning};
use crate::Cli;

/// Publish one message.
#[derive(Args)]
pub struct PublishCommand {
    /// Topic to publish to
    topic: String,
    /// Payload; `-` reads it from stdin
    payload: String,
    /// QoS level (0, 1 or 2)
    #[arg(long, value_parser = parse_qos, default_value = "0")]
    qos: QoS,
    /// Ask the broker to retain the message
    #[arg(long)]
    retain: bool,
    /// Keep the message in this redb outbox until it has been sent and the
    /// session closed cleanly
    #[arg(long)]
    outbox: Option<PathBuf>,
}

impl PublishCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let settings = load_settings(cli)?;
        let shutdown = settings.timeouts.shutdown();

        let payload = if self.payload == "-" {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        } else {
            self.payload.clone().into_bytes()
        };

        let connections = Arc::new(ConnectionRegistry::new(settings)?);
        let mut publisher = Publisher::new(connections.clone());
        if let Some(path) = &self.outbox {
            print_verbose(cli, &format!("using outbox {}", path.display()));
            let store = Arc::new(RedbStore::open(path)?);
            publisher = publisher.with_outbox(Arc::new(Outbox::new(store)));
        }

        let mut options = PublishOptions::new().qos(self.qos).retain(self.retain);
        if let Some(name) = &cli.connection {
            options = options.connection(name.clone());
        }

        let id = publisher.publish_bytes(&self.topic, payload, options).await?;

        // Requests are sent in order, so a clean disconnect means the publish
        // was written to the broker connection. It is not a PUBACK/PUBCOMP:
        // for QoS 1 and 2 the outbox record is acknowledged on "sent", not on
        // "confirmed by the broker".
        match connections.shutdown(shutdown.max(Duration::from_secs(1))).await {
            Ok(()) => {
                if publisher.outbox().is_some() {
                    publisher.acknowledge(&id)?;
                }
                print_success(&format!("sent {id} to {}", self.topic));
            }
            Err(e) => {
                print_warning(&format!("sent {id} but disconnect failed: {e}"));
                if publisher.outbox().is_some() {
                    print_warning("message stays pending in the outbox");
                }
            }
        }
        Ok(())
    }
}
