//! Topic matching command.

use clap::Args;
use giztoy_pubsub::topic;

use super::{output_json, print_warning};
use crate::Cli;

/// Show which of the given patterns match a topic.
#[derive(Args)]
pub struct MatchCommand {
    /// Topic to test
    topic: String,
    /// Subscription patterns (`+` and `#` wildcards)
    #[arg(required = true)]
    patterns: Vec<String>,
}

impl MatchCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        for pattern in &self.patterns {
            if topic::validate_pattern(pattern).is_err() {
                print_warning(&format!("{pattern:?} is not a valid pattern and never matches"));
            }
        }

        let matched: Vec<&str> = topic::find_matching_patterns(&self.topic, &self.patterns)
            .map(String::as_str)
            .collect();

        if cli.json {
            return output_json(&matched);
        }
        for pattern in &matched {
            println!("{pattern}");
        }
        if matched.is_empty() {
            anyhow::bail!("no pattern matches {:?}", self.topic);
        }
        Ok(())
    }
}
