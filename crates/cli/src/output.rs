// Output format auto-detection for the CLI.
//
// TTY → human-readable text. Piped/redirected → structured JSON.
// `--json` flag forces JSON output regardless of terminal.

use serde::Serialize;
use std::io::{self, IsTerminal, Write};

use taskdeck_sync::config::ConfigError;
use taskdeck_sync::rpc::RequestError;

const ANSI_RED: &str = "\x1b[31m";
const ANSI_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    /// JSON if `--json` was passed or stdout is not a TTY.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    write_output(&mut io::stdout().lock(), format, value, human_fn)
}

/// Write a value to a provided writer (useful for testing).
pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => {
            writeln!(writer, "{}", human_fn(value))
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    let mut err = io::stderr().lock();
    match format {
        OutputFormat::Human => {
            let line = render_human_stderr_line("error", message, io::stderr().is_terminal());
            let _ = writeln!(err, "{line}");
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "error": {
                    "code": code,
                    "message": message,
                }
            });
            let _ = serde_json::to_writer(&mut err, &obj);
            let _ = writeln!(err);
        }
    }
}

/// Print a mapped, actionable error for a command failure.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (&'static str, String) {
    let message = format!("{error:#}");

    for cause in error.chain() {
        if let Some(request_err) = cause.downcast_ref::<RequestError>() {
            return match request_err {
                RequestError::NotConnected => (
                    "NOT_CONNECTED",
                    "Not connected to the backend. Check that it is running and TASKDECK_BACKEND_URL is correct."
                        .to_string(),
                ),
                RequestError::Timeout { .. } => ("REQUEST_TIMEOUT", message),
                RequestError::ConnectionLost { .. } => ("CONNECTION_LOST", message),
                RequestError::Server(wire) => {
                    let code = if wire.code.is_empty() { "SERVER_ERROR" } else { "SERVER_REJECTED" };
                    (code, wire.message.clone())
                }
                RequestError::Encode(_) | RequestError::Decode { .. } => ("PROTOCOL_ERROR", message),
            };
        }
        if let Some(ConfigError::InvalidUrl { url, .. }) = cause.downcast_ref::<ConfigError>() {
            return (
                "INVALID_CONFIG",
                format!("Backend URL `{url}` is invalid. Use http(s)://host[:port] or set TASKDECK_BACKEND_URL."),
            );
        }
    }

    if message.contains("timed out connecting") {
        return ("BACKEND_UNREACHABLE", message);
    }

    ("ERROR", message)
}

fn render_human_stderr_line(label: &str, message: &str, is_tty: bool) -> String {
    if is_tty {
        format!("{ANSI_RED}{label}:{ANSI_RESET} {message}")
    } else {
        format!("{label}: {message}")
    }
}
