// Session-scoped streams: agent state, turns, messages and the shell.

use taskdeck_common::protocol::events::{AgentSessionEvent, MessageEvent, ShellEvent, TurnEvent};

use super::DomainHandler;
use crate::store::{AppState, SliceKey};

pub struct AgentSessionHandler;

impl DomainHandler for AgentSessionHandler {
    type Event = AgentSessionEvent;
    const DOMAIN: &'static str = "agent_session";
    const SLICES: &'static [SliceKey] = &[SliceKey::Sessions];

    fn apply(state: &mut AppState, event: AgentSessionEvent) -> bool {
        match event {
            AgentSessionEvent::StateChanged(change) => state.apply_session_state(change),
        }
    }
}

pub struct TurnHandler;

impl DomainHandler for TurnHandler {
    type Event = TurnEvent;
    const DOMAIN: &'static str = "session.turn";
    const SLICES: &'static [SliceKey] = &[SliceKey::Turns];

    fn apply(state: &mut AppState, event: TurnEvent) -> bool {
        match event {
            TurnEvent::Started(turn) => state.start_turn(turn),
            TurnEvent::Completed(completion) => state.complete_turn(&completion),
        }
    }
}

pub struct MessageHandler;

impl DomainHandler for MessageHandler {
    type Event = MessageEvent;
    const DOMAIN: &'static str = "session.message";
    const SLICES: &'static [SliceKey] = &[SliceKey::Messages];

    fn apply(state: &mut AppState, event: MessageEvent) -> bool {
        match event {
            MessageEvent::Added(message) => state.add_message(message),
            MessageEvent::Updated(message) => state.update_message(message),
        }
    }
}

pub struct ShellHandler;

impl DomainHandler for ShellHandler {
    type Event = ShellEvent;
    const DOMAIN: &'static str = "session.shell";
    const SLICES: &'static [SliceKey] = &[SliceKey::Shells];

    fn apply(state: &mut AppState, event: ShellEvent) -> bool {
        match event {
            ShellEvent::Output(output) => state.apply_shell_output(&output),
        }
    }
}
