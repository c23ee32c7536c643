// CLI subcommand dispatch.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;

use taskdeck_sync::store::ConnectionStatus;
use taskdeck_sync::{ClientConfig, Store};

use crate::output::OutputFormat;

pub mod plan;
pub mod snapshot;
pub mod watch;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Subcommand)]
pub enum Command {
    /// Connect, hydrate and stream board changes
    Watch(watch::WatchArgs),
    /// Fetch the initial board state over HTTP and print it
    Snapshot(snapshot::SnapshotArgs),
    /// Read or edit a task's plan
    #[command(subcommand)]
    Plan(plan::PlanCommand),
}

pub async fn run(cmd: Command, config: ClientConfig, format: OutputFormat) -> Result<()> {
    match cmd {
        Command::Watch(args) => watch::run(args, config, format).await,
        Command::Snapshot(args) => snapshot::run(args, config, format).await,
        Command::Plan(command) => plan::run(command, config, format).await,
    }
}

/// Config file (explicit path, or the global one) with the command-line
/// backend override applied.
pub fn load_config(path: Option<&Path>, backend: Option<&str>) -> Result<ClientConfig> {
    let mut config = match path {
        Some(path) => ClientConfig::load_from(path)
            .with_context(|| format!("failed to load config from `{}`", path.display()))?,
        None => ClientConfig::load(),
    };
    if let Some(backend) = backend {
        config.backend_url = Some(backend.to_string());
    }
    config.backend().context("invalid backend url")?;
    Ok(config)
}

/// Wait until the store reports an open connection.
pub async fn wait_connected(store: &Store) -> Result<()> {
    let mut rx = store.subscribe();
    let outcome = tokio::time::timeout(
        CONNECT_TIMEOUT,
        rx.wait_for(|state| state.connection.status == ConnectionStatus::Connected),
    )
    .await;
    match outcome {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(anyhow!("store closed before the connection opened")),
        Err(_) => {
            let last_error = store.snapshot().connection.last_error.clone();
            Err(anyhow!(
                "timed out connecting to backend after {CONNECT_TIMEOUT:?}{}",
                last_error.map(|error| format!(": {error}")).unwrap_or_default()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn backend_flag_overrides_file() {
        let tmp = TempDir::new().expect("temp dir should be created");
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "backend_url = \"http://from-file:9000\"\n").expect("write config");

        let config = load_config(Some(&path), None).expect("config should load");
        assert_eq!(config.backend_url.as_deref(), Some("http://from-file:9000"));

        let config = load_config(Some(&path), Some("https://deck.example.com")).expect("config should load");
        assert_eq!(config.backend_url.as_deref(), Some("https://deck.example.com"));
    }

    #[test]
    fn invalid_backend_is_rejected() {
        let tmp = TempDir::new().expect("temp dir should be created");
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "").expect("write config");
        assert!(load_config(Some(&path), Some("not a url")).is_err());
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let tmp = TempDir::new().expect("temp dir should be created");
        assert!(load_config(Some(&tmp.path().join("absent.toml")), None).is_err());
    }
}
