//! Listen command.

use std::sync::Arc;

use clap::Args;
use giztoy_pubsub::{ConnectionRegistry, Delivery, QoS, topic};
use serde_json::json;

use super::{load_settings, parse_qos, print_info, print_warning};
use crate::Cli;

/// Print messages received on a topic until Ctrl-C.
#[derive(Args)]
pub struct ListenCommand {
    /// Topic filter (`+` and `#` wildcards allowed)
    topic: String,
    /// QoS level (0, 1 or 2)
    #[arg(long, value_parser = parse_qos, default_value = "0")]
    qos: QoS,
}

impl ListenCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        topic::validate_pattern(&self.topic)?;
        let settings = load_settings(cli)?;
        let timeouts = settings.timeouts.clone();

        let connections = ConnectionRegistry::new(settings)?;
        let client = connections.subscribe_client(cli.connection.as_deref()).await?;

        let filter = self.topic.clone();
        let as_json = cli.json;
        let listener = client.add_listener(Arc::new(move |delivery: &Delivery| {
            if topic::is_match(&delivery.topic, &filter) {
                print_delivery(delivery, as_json);
            }
        }));

        tokio::time::timeout(timeouts.operation(), client.subscribe(&self.topic, self.qos)).await??;
        print_info(&format!("listening on {} (Ctrl-C to stop)", self.topic));

        tokio::signal::ctrl_c().await?;

        client.remove_listener(listener);
        match tokio::time::timeout(timeouts.operation(), client.unsubscribe(&self.topic)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => print_warning(&format!("unsubscribe: {e}")),
            Err(_) => print_warning("unsubscribe timed out"),
        }
        connections.shutdown(timeouts.shutdown()).await?;
        Ok(())
    }
}

fn print_delivery(delivery: &Delivery, as_json: bool) {
    let payload = delivery
        .payload_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("<{} bytes>", delivery.payload.len()));

    if as_json {
        let line = json!({
            "topic": delivery.topic,
            "qos": delivery.qos.level(),
            "retain": delivery.retain,
            "messageId": delivery.message_id(),
            "receivedAt": delivery.received_at.to_rfc3339(),
            "payload": payload,
        });
        println!("{line}");
    } else {
        println!(
            "{} [{}] qos={}{} {}",
            delivery.received_at.format("%H:%M:%S%.3f"),
            delivery.topic,
            delivery.qos.level(),
            if delivery.retain { " retained" } else { "" },
            payload
        );
    }
}
