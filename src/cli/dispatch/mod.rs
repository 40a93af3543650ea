use crate::cli::actions::Action;
use anyhow::{Result, anyhow};
use std::path::PathBuf;
use tracing::info;

/// # Errors
///
/// Returns an error if required arguments are missing
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    // Get the port or return an error
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .ok_or_else(|| anyhow!("Port is required. Please provide it using the --port flag."))?;

    // Get the listen address (None means all interfaces)
    let listen = matches
        .get_one::<String>("listen")
        .map(std::string::ToString::to_string);

    let config = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .ok_or_else(|| anyhow!("Config is required. Please provide it using the --config flag."))?;

    info!(config = %config.display(), port, "using config file");

    Ok(Action::Run {
        port,
        listen,
        config,
    })
}
