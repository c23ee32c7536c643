// taskdeck CLI entry point.

use std::path::PathBuf;
use std::process;

use clap::Parser;

mod commands;
mod exit_code;
mod output;

use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "taskdeck", about = "Realtime sync client for the taskdeck board")]
struct Cli {
    /// Backend base URL; overrides config and TASKDECK_BACKEND_URL.
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Config file (default: ~/.taskdeck/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Force JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::detect(cli.json);
    let result = match commands::load_config(cli.config.as_deref(), cli.backend.as_deref()) {
        Ok(config) => commands::run(cli.command, config, format).await,
        Err(error) => Err(error),
    };

    match result {
        Ok(()) => ExitCode::Success.into(),
        Err(error) => {
            output::print_anyhow_error(format, &error);
            ExitCode::from_error(&error).into()
        }
    }
}
