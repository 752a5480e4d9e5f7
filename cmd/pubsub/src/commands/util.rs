//! Utility functions for CLI commands.

use giztoy_pubsub::{QoS, Settings};

use crate::Cli;

/// Loads and validates the settings file given with `--config`.
pub fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let path = cli
        .config
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("settings file is required, use --config"))?;
    let settings = Settings::load(path)?;
    settings.validate()?;
    Ok(settings)
}

/// Parses a QoS level argument.
pub fn parse_qos(s: &str) -> Result<QoS, String> {
    match s {
        "0" => Ok(QoS::AtMostOnce),
        "1" => Ok(QoS::AtLeastOnce),
        "2" => Ok(QoS::ExactlyOnce),
        other => Err(format!("invalid qos {other:?}, expected 0, 1 or 2")),
    }
}

/// Outputs a value as pretty JSON on stdout.
pub fn output_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints verbose output if enabled.
pub fn print_verbose(cli: &Cli, msg: &str) {
    if cli.verbose {
        eprintln!("[verbose] {}", msg);
    }
}

/// Prints success message.
pub fn print_success(msg: &str) {
    eprintln!("\x1b[32m✓\x1b[0m {}", msg);
}

/// Prints info message.
pub fn print_info(msg: &str) {
    eprintln!("\x1b[34mℹ\x1b[0m {}", msg);
}

/// Prints warning message.
pub fn print_warning(msg: &str) {
    eprintln!("\x1b[33m⚠\x1b[0m {}", msg);
}
