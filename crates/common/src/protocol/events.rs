// Typed broadcast events, one closed enum per domain.
//
// Raw `{ type, payload }` envelopes are validated here, at the boundary, so
// store mutations only ever see complete, well-typed data.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::topics;
use crate::types::{
    DiffUpdate, Executor, Message, Secret, SessionId, SessionState, ShellOutput, TaskId, TaskPr,
    Task, TerminalOutput, Turn, TurnId, UserSettings, Workflow,
};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload for `{topic}` is missing `{field}`")]
    MissingField { topic: String, field: &'static str },

    #[error("payload for `{topic}` is invalid: {source}")]
    Invalid {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("topic `{0}` does not belong to this domain")]
    UnexpectedTopic(String),
}

/// A domain's closed set of events and the topics that produce them.
pub trait DomainEvent: Sized {
    const TOPICS: &'static [&'static str];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError>;
}

/// Partial update for an existing entity: `id` plus the fields that changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Patch {
    pub fn from_payload(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        require(topic, &payload, &["id"])?;
        let Value::Object(mut fields) = payload else {
            return Err(missing(topic, "id"));
        };
        let id = match fields.remove("id") {
            Some(Value::String(id)) => id,
            _ => return Err(missing(topic, "id")),
        };
        Ok(Self { id, fields })
    }
}

/// The created/updated/deleted triplet shared by CRUD-mirrored entities.
#[derive(Debug, Clone, PartialEq)]
pub enum Crud<T> {
    Created(T),
    Updated(Patch),
    Deleted(String),
}

impl<T: DeserializeOwned> Crud<T> {
    /// `topics` is `[created, updated, deleted]`; `required` lists the fields
    /// a created entity must carry besides `id`.
    fn parse_triplet(
        topics: &[&str],
        required: &[&'static str],
        topic: &str,
        payload: Value,
    ) -> Result<Self, PayloadError> {
        match topics.iter().position(|candidate| *candidate == topic) {
            Some(0) => {
                require(topic, &payload, &["id"])?;
                require(topic, &payload, required)?;
                decode(topic, payload).map(Crud::Created)
            }
            Some(1) => Patch::from_payload(topic, payload).map(Crud::Updated),
            Some(2) => {
                require(topic, &payload, &["id"])?;
                let Some(id) = string_field(&payload, "id") else {
                    return Err(missing(topic, "id"));
                };
                Ok(Crud::Deleted(id.to_string()))
            }
            _ => Err(PayloadError::UnexpectedTopic(topic.to_string())),
        }
    }
}

pub type TaskEvent = Crud<Task>;
pub type WorkflowEvent = Crud<Workflow>;
pub type ExecutorEvent = Crud<Executor>;
pub type SecretEvent = Crud<Secret>;

impl DomainEvent for Crud<Task> {
    const TOPICS: &'static [&'static str] =
        &[topics::TASK_CREATED, topics::TASK_UPDATED, topics::TASK_DELETED];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        Self::parse_triplet(Self::TOPICS, &[], topic, payload)
    }
}

impl DomainEvent for Crud<Workflow> {
    const TOPICS: &'static [&'static str] =
        &[topics::WORKFLOW_CREATED, topics::WORKFLOW_UPDATED, topics::WORKFLOW_DELETED];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        Self::parse_triplet(Self::TOPICS, &["workspace_id"], topic, payload)
    }
}

impl DomainEvent for Crud<Executor> {
    const TOPICS: &'static [&'static str] =
        &[topics::EXECUTOR_CREATED, topics::EXECUTOR_UPDATED, topics::EXECUTOR_DELETED];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        Self::parse_triplet(Self::TOPICS, &[], topic, payload)
    }
}

impl DomainEvent for Crud<Secret> {
    const TOPICS: &'static [&'static str] =
        &[topics::SECRETS_CREATED, topics::SECRETS_UPDATED, topics::SECRETS_DELETED];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        Self::parse_triplet(Self::TOPICS, &[], topic, payload)
    }
}

/// `agent_session.state_changed` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStateChange {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub state: SessionState,
    #[serde(default)]
    pub is_primary: Option<bool>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentSessionEvent {
    StateChanged(SessionStateChange),
}

impl DomainEvent for AgentSessionEvent {
    const TOPICS: &'static [&'static str] = &[topics::AGENT_SESSION_STATE_CHANGED];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        expect_topic(Self::TOPICS, topic)?;
        require(topic, &payload, &["session_id", "task_id", "state"])?;
        decode(topic, payload).map(AgentSessionEvent::StateChanged)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageEvent {
    Added(Message),
    Updated(Message),
}

impl DomainEvent for MessageEvent {
    const TOPICS: &'static [&'static str] =
        &[topics::SESSION_MESSAGE_ADDED, topics::SESSION_MESSAGE_UPDATED];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        expect_topic(Self::TOPICS, topic)?;
        require(topic, &payload, &["id", "session_id", "task_id"])?;
        let message = decode(topic, payload)?;
        if topic == topics::SESSION_MESSAGE_ADDED {
            Ok(MessageEvent::Added(message))
        } else {
            Ok(MessageEvent::Updated(message))
        }
    }
}

/// `session.turn.completed` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnCompletion {
    pub id: TurnId,
    pub session_id: SessionId,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Started(Turn),
    Completed(TurnCompletion),
}

impl DomainEvent for TurnEvent {
    const TOPICS: &'static [&'static str] =
        &[topics::SESSION_TURN_STARTED, topics::SESSION_TURN_COMPLETED];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        expect_topic(Self::TOPICS, topic)?;
        require(topic, &payload, &["id", "session_id"])?;
        if topic == topics::SESSION_TURN_STARTED {
            decode(topic, payload).map(TurnEvent::Started)
        } else {
            decode(topic, payload).map(TurnEvent::Completed)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShellEvent {
    Output(ShellOutput),
}

impl DomainEvent for ShellEvent {
    const TOPICS: &'static [&'static str] = &[topics::SESSION_SHELL_OUTPUT];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        expect_topic(Self::TOPICS, topic)?;
        require(topic, &payload, &["session_id", "type"])?;
        decode(topic, payload).map(ShellEvent::Output)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    Output(TerminalOutput),
}

impl DomainEvent for TerminalEvent {
    const TOPICS: &'static [&'static str] = &[topics::TERMINAL_OUTPUT];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        expect_topic(Self::TOPICS, topic)?;
        require(topic, &payload, &["session_id"])?;
        decode(topic, payload).map(TerminalEvent::Output)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiffEvent {
    Update(DiffUpdate),
}

impl DomainEvent for DiffEvent {
    const TOPICS: &'static [&'static str] = &[topics::DIFF_UPDATE];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        expect_topic(Self::TOPICS, topic)?;
        require(topic, &payload, &["session_id"])?;
        decode(topic, payload).map(DiffEvent::Update)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GithubEvent {
    TaskPrUpdated(TaskPr),
}

impl DomainEvent for GithubEvent {
    const TOPICS: &'static [&'static str] = &[topics::GITHUB_TASK_PR_UPDATED];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        expect_topic(Self::TOPICS, topic)?;
        require(topic, &payload, &["task_id"])?;
        decode(topic, payload).map(GithubEvent::TaskPrUpdated)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettingsEvent {
    Updated(UserSettings),
}

impl DomainEvent for SettingsEvent {
    const TOPICS: &'static [&'static str] = &[topics::USER_SETTINGS_UPDATED];

    fn parse(topic: &str, payload: Value) -> Result<Self, PayloadError> {
        expect_topic(Self::TOPICS, topic)?;
        if !payload.is_object() {
            return Err(missing(topic, "settings"));
        }
        decode(topic, payload).map(SettingsEvent::Updated)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn decode<T: DeserializeOwned>(topic: &str, payload: Value) -> Result<T, PayloadError> {
    serde_json::from_value(payload)
        .map_err(|source| PayloadError::Invalid { topic: topic.to_string(), source })
}

fn expect_topic(known: &[&str], topic: &str) -> Result<(), PayloadError> {
    if known.contains(&topic) {
        Ok(())
    } else {
        Err(PayloadError::UnexpectedTopic(topic.to_string()))
    }
}

/// Every field must be present, non-null and, for strings, non-empty.
fn require(topic: &str, payload: &Value, fields: &[&'static str]) -> Result<(), PayloadError> {
    for field in fields {
        match payload.get(field) {
            None | Some(Value::Null) => return Err(missing(topic, field)),
            Some(Value::String(value)) if value.is_empty() => return Err(missing(topic, field)),
            Some(_) => {}
        }
    }
    Ok(())
}

fn missing(topic: &str, field: &'static str) -> PayloadError {
    PayloadError::MissingField { topic: topic.to_string(), field }
}

fn string_field<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload.get(field).and_then(Value::as_str)
}
