// `taskdeck watch` — connect, hydrate and stream store changes until Ctrl-C.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use taskdeck_sync::connection::SyncSignal;
use taskdeck_sync::{ClientConfig, SyncClient};

use super::snapshot::{format_summary, scope, BoardSummary};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[arg(long)]
    pub workspace: Option<String>,

    #[arg(long)]
    pub workflow: Option<String>,

    /// Task to follow (repeatable).
    #[arg(long = "task")]
    pub tasks: Vec<String>,

    /// Agent session to follow (repeatable).
    #[arg(long = "session")]
    pub sessions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WatchEvent {
    Signal { signal: String },
    State(BoardSummary),
}

fn format_event(event: &WatchEvent) -> String {
    match event {
        WatchEvent::Signal { signal } => format!("-- {signal}"),
        WatchEvent::State(summary) => format_summary(summary),
    }
}

fn describe(signal: &SyncSignal) -> String {
    match signal {
        SyncSignal::Connected => "connected".to_string(),
        SyncSignal::Resync => "resync".to_string(),
        SyncSignal::Disconnected { reason } => format!("disconnected: {reason}"),
        SyncSignal::Closed => "closed".to_string(),
    }
}

pub async fn run(args: WatchArgs, config: ClientConfig, format: OutputFormat) -> Result<()> {
    let scope = scope(&config, args.workspace, args.workflow);
    let client = SyncClient::from_config(config)?;
    let session = client.start(scope)?;

    // Subscriptions are remembered and replayed on every (re)connect.
    for task_id in args.tasks {
        session.connection().subscribe_task(task_id)?;
    }
    for session_id in args.sessions {
        session.connection().subscribe_session(session_id)?;
    }

    let mut signals = session.signals();
    let mut changes = client.store().subscribe();
    let mut last = BoardSummary::of(&changes.borrow_and_update());
    output::print_output(format, &WatchEvent::State(last.clone()), format_event)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing");
                break;
            }
            signal = signals.recv() => match signal {
                Ok(signal) => {
                    let closed = signal == SyncSignal::Closed;
                    output::print_output(format, &WatchEvent::Signal { signal: describe(&signal) }, format_event)?;
                    if closed {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed connection signals"),
                Err(RecvError::Closed) => break,
            },
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let summary = BoardSummary::of(&changes.borrow_and_update());
                if summary != last {
                    output::print_output(format, &WatchEvent::State(summary.clone()), format_event)?;
                    last = summary;
                }
            }
        }
    }

    session.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_descriptions() {
        assert_eq!(describe(&SyncSignal::Resync), "resync");
        assert_eq!(
            describe(&SyncSignal::Disconnected { reason: "heartbeat timed out".into() }),
            "disconnected: heartbeat timed out"
        );
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = WatchEvent::Signal { signal: "connected".into() };
        let value = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(value, serde_json::json!({ "event": "signal", "signal": "connected" }));
        assert_eq!(format_event(&event), "-- connected");
    }
}
