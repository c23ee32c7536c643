// Slice containers used by `AppState`.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use taskdeck_common::types::{
    Entity, Plan, SessionId, Task, TaskId, Turn, TurnId, UserSettings, Workflow, WorkflowId,
    WorkflowStep, WorkspaceId,
};

/// Names of the top-level slices, used for loading flags, live-touch
/// tracking and hydration routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceKey {
    Workspace,
    Workflows,
    Kanban,
    Sessions,
    Turns,
    Messages,
    Executors,
    Secrets,
    Settings,
    Plans,
    Diffs,
    Terminals,
    Shells,
    TaskPrs,
    Connection,
}

impl SliceKey {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Workflows => "workflows",
            Self::Kanban => "kanban",
            Self::Sessions => "sessions",
            Self::Turns => "turns",
            Self::Messages => "messages",
            Self::Executors => "executors",
            Self::Secrets => "secrets",
            Self::Settings => "settings",
            Self::Plans => "plans",
            Self::Diffs => "diffs",
            Self::Terminals => "terminals",
            Self::Shells => "shells",
            Self::TaskPrs => "task_prs",
            Self::Connection => "connection",
        }
    }
}

// ── List slice ──────────────────────────────────────────────────────

/// Ordered collection with load flags. Insertion order is display order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct ListSlice<T> {
    #[serde(default)]
    pub items: Vec<T>,
    #[serde(default)]
    pub loaded: bool,
    #[serde(default)]
    pub loading: bool,
}

impl<T> Default for ListSlice<T> {
    fn default() -> Self {
        Self { items: Vec::new(), loaded: false, loading: false }
    }
}

impl<T: Entity> ListSlice<T> {
    pub fn loaded(items: Vec<T>) -> Self {
        Self { items, loaded: true, loading: false }
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    /// Replace in place when the ID exists, otherwise append.
    pub fn upsert(&mut self, entity: T) -> bool
    where
        T: PartialEq,
    {
        match self.position(entity.id()) {
            Some(index) if self.items[index] == entity => false,
            Some(index) => {
                self.items[index] = entity;
                true
            }
            None => {
                self.items.push(entity);
                true
            }
        }
    }

    /// Replace in place when the ID exists, otherwise insert at the front.
    pub fn upsert_front(&mut self, entity: T) -> bool
    where
        T: PartialEq,
    {
        match self.position(entity.id()) {
            Some(_) => self.upsert(entity),
            None => {
                self.items.insert(0, entity);
                true
            }
        }
    }

    /// Apply a merge-patch to the entity with `id`. Unknown IDs are ignored.
    pub fn patch(&mut self, id: &str, fields: &Map<String, Value>) -> bool
    where
        T: Serialize + DeserializeOwned + PartialEq,
    {
        let Some(index) = self.position(id) else {
            return false;
        };
        match merge_patch(&self.items[index], fields) {
            Some(merged) if merged != self.items[index] => {
                self.items[index] = merged;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.position(id).map(|index| self.items.remove(index))
    }
}

// ── Keyed slice ─────────────────────────────────────────────────────

/// O(1) lookup by ID with arrival order kept alongside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct KeyedSlice<T> {
    #[serde(default)]
    pub by_id: HashMap<String, T>,
    #[serde(default)]
    pub order: Vec<String>,
}

impl<T> Default for KeyedSlice<T> {
    fn default() -> Self {
        Self { by_id: HashMap::new(), order: Vec::new() }
    }
}

impl<T: Entity> KeyedSlice<T> {
    pub fn from_items(items: impl IntoIterator<Item = T>) -> Self
    where
        T: PartialEq,
    {
        let mut slice = Self::default();
        for item in items {
            slice.upsert(item);
        }
        slice
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.by_id.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Items in arrival (or sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    /// Replace in place when the ID exists, otherwise append to the order.
    pub fn upsert(&mut self, entity: T) -> bool
    where
        T: PartialEq,
    {
        let id = entity.id().to_string();
        match self.by_id.get(&id) {
            Some(existing) if *existing == entity => false,
            Some(_) => {
                self.by_id.insert(id, entity);
                true
            }
            None => {
                self.order.push(id.clone());
                self.by_id.insert(id, entity);
                true
            }
        }
    }

    /// Like [`upsert`](Self::upsert), but entries are placed by `sort_key`
    /// instead of at the end, and an update that changes the key moves the
    /// entry. Equal keys keep arrival order.
    pub fn upsert_sorted_by<K, F>(&mut self, entity: T, sort_key: F) -> bool
    where
        T: PartialEq,
        K: Ord,
        F: Fn(&T) -> K,
    {
        let key = sort_key(&entity);
        if let Some(existing) = self.by_id.get(entity.id()) {
            if sort_key(existing) == key {
                return self.upsert(entity);
            }
            let id = entity.id().to_string();
            self.order.retain(|candidate| *candidate != id);
            self.by_id.remove(&id);
        }

        let index = self
            .order
            .iter()
            .rposition(|id| self.by_id.get(id).is_some_and(|existing| sort_key(existing) <= key))
            .map_or(0, |found| found + 1);
        let id = entity.id().to_string();
        self.order.insert(index, id.clone());
        self.by_id.insert(id, entity);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let removed = self.by_id.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }
}

// ── Domain slices ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceSlice {
    #[serde(default)]
    pub active_id: Option<WorkspaceId>,
}

/// Workflows are shown newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowsSlice {
    #[serde(default)]
    pub items: Vec<Workflow>,
    #[serde(default)]
    pub active_id: Option<WorkflowId>,
    #[serde(default)]
    pub loaded: bool,
    #[serde(default)]
    pub loading: bool,
}

impl WorkflowsSlice {
    pub fn get(&self, id: &str) -> Option<&Workflow> {
        self.items.iter().find(|workflow| workflow.id == id)
    }

    /// Point `active_id` at a workflow that still exists: keep it if valid,
    /// otherwise fall back to the first item or `None`.
    pub fn repair_selection(&mut self) {
        let valid = self.active_id.as_deref().is_some_and(|id| self.get(id).is_some());
        if !valid && self.active_id.is_some() {
            self.active_id = self.items.first().map(|workflow| workflow.id.clone());
        }
    }
}

/// Columns and cards of the board bound to one workflow. The board's load
/// flags live on `tasks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KanbanSlice {
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub tasks: ListSlice<Task>,
}

impl KanbanSlice {
    /// Empty board for `workflow_id`.
    pub fn for_workflow(workflow_id: Option<WorkflowId>) -> Self {
        Self { workflow_id, ..Self::default() }
    }

    pub fn sort_steps(&mut self) {
        self.steps.sort_by_key(|step| step.position);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnsSlice {
    /// Turns per session ordered by `started_at`.
    #[serde(default)]
    pub by_session: HashMap<SessionId, Vec<Turn>>,
    #[serde(default)]
    pub active_by_session: HashMap<SessionId, TurnId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SettingsSlice {
    #[serde(default)]
    pub value: Option<UserSettings>,
    #[serde(default)]
    pub loaded: bool,
    #[serde(default)]
    pub loading: bool,
}

/// Plans keyed by task. `Some(None)` means the server said the task has no
/// plan; a missing key means nobody asked yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlansSlice {
    #[serde(default)]
    pub by_task: HashMap<TaskId, Option<Plan>>,
    #[serde(default)]
    pub loading: BTreeSet<TaskId>,
}

/// Upper bound on buffered terminal or shell output per key.
pub const MAX_OUTPUT_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TerminalBuffer {
    pub data: String,
    /// Set once older output has been dropped to respect the bound.
    #[serde(default)]
    pub truncated: bool,
}

impl TerminalBuffer {
    pub fn append(&mut self, chunk: &str) {
        self.data.push_str(chunk);
        if trim_front(&mut self.data, MAX_OUTPUT_BYTES) {
            self.truncated = true;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ShellBuffer {
    pub output: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub exited: bool,
}

impl ShellBuffer {
    pub fn append(&mut self, chunk: &str) {
        self.output.push_str(chunk);
        trim_front(&mut self.output, MAX_OUTPUT_BYTES);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSlice {
    pub status: ConnectionStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Number of successful reconnects that asked dependants to refetch.
    #[serde(default)]
    pub resync_count: u64,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Overlay `fields` on the serialized form of `current` and decode the result.
pub fn merge_patch<T>(current: &T, fields: &Map<String, Value>) -> Option<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = match serde_json::to_value(current) {
        Ok(value) => value,
        Err(error) => {
            warn!(%error, "failed to encode entity for merge");
            return None;
        }
    };
    let Value::Object(object) = &mut value else {
        return None;
    };
    for (key, field) in fields {
        object.insert(key.clone(), field.clone());
    }
    match serde_json::from_value(value) {
        Ok(merged) => Some(merged),
        Err(error) => {
            warn!(%error, "merged entity failed validation, keeping previous value");
            None
        }
    }
}

/// `true` when `candidate` carries a strictly newer `updated_at` than `current`.
pub fn is_newer<T: Entity>(candidate: &T, current: &T) -> bool {
    match (candidate.updated_at(), current.updated_at()) {
        (Some(candidate), Some(current)) => candidate > current,
        _ => false,
    }
}

/// Drop bytes from the front until `text` fits in `limit`, cutting on a
/// char boundary. Returns whether anything was dropped.
fn trim_front(text: &mut String, limit: usize) -> bool {
    if text.len() <= limit {
        return false;
    }
    let mut cut = text.len() - limit;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
    true
}
