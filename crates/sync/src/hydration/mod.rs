// Hydration: seeding the store from initial-state snapshots.
//
// A slice waits for a snapshot from startup until its first one lands, and
// again while every refetch is in flight. If no live event wrote to it in that
// window, the snapshot replaces it wholesale. Otherwise the two are merged:
// the live copy of an entity wins unless the snapshot's copy has a strictly
// newer `updated_at`, entities only the live side knows about are kept, and
// entities deleted live stay deleted.

pub mod http;

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use taskdeck_common::types::{Entity, WorkflowId, WorkspaceId};

use crate::store::{
    is_newer, AppState, KanbanSlice, KeyedSlice, ListSlice, PartialState, SettingsSlice, SliceKey,
    Store, TurnsSlice, WorkflowsSlice,
};

pub use http::HttpSnapshotSource;

/// Initial state handed to the client. Absent slices mean "no data for that
/// slice, fetch it live".
pub type HydrationSnapshot = PartialState;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no route configured for `{slice}`")]
    NoRoute { slice: &'static str },

    #[error("cannot fetch `{slice}` without a {param}")]
    MissingScope { slice: &'static str, param: &'static str },

    #[error("invalid url for `{slice}`: {reason}")]
    InvalidUrl { slice: &'static str, reason: String },

    #[error("request for `{slice}` failed: {reason}")]
    Request { slice: &'static str, reason: String },

    #[error("`{slice}` returned HTTP {status}")]
    Status { slice: &'static str, status: u16 },

    #[error("failed to decode `{slice}`: {reason}")]
    Decode { slice: &'static str, reason: String },
}

/// Identifiers route templates may need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrationScope {
    pub workspace_id: Option<WorkspaceId>,
    pub workflow_id: Option<WorkflowId>,
}

/// Where initial slices come from.
pub trait SnapshotSource: Send + Sync {
    /// Slices this source can fetch.
    fn slices(&self) -> Vec<SliceKey>;

    /// Fetch one slice. The returned snapshot should only carry `key`.
    fn fetch(
        &self,
        key: SliceKey,
        scope: &HydrationScope,
    ) -> impl Future<Output = Result<HydrationSnapshot, FetchError>> + Send;
}

/// Outcome of one fetch round.
#[derive(Debug, Default)]
pub struct HydrationReport {
    pub applied: Vec<SliceKey>,
    pub failed: Vec<(SliceKey, FetchError)>,
}

impl HydrationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ── Reconciler ──────────────────────────────────────────────────────

pub struct Reconciler<S> {
    source: S,
    store: Arc<Store>,
    mounted: AtomicBool,
}

impl<S: SnapshotSource> Reconciler<S> {
    pub fn new(source: S, store: Arc<Store>) -> Self {
        Self { source, store, mounted: AtomicBool::new(false) }
    }

    /// Seed the store from a snapshot available up front. Only the first
    /// mount (seeded or fetched) runs; later calls return `false`.
    pub fn mount_with(&self, snapshot: HydrationSnapshot) -> bool {
        if self.mounted.swap(true, Ordering::SeqCst) {
            debug!("already hydrated, ignoring snapshot");
            return false;
        }
        apply_snapshot(&self.store, snapshot)
    }

    /// Fetch every slice the source offers and reconcile it. `None` when this
    /// reconciler already mounted.
    pub async fn mount(&self, scope: &HydrationScope) -> Option<HydrationReport> {
        if self.mounted.swap(true, Ordering::SeqCst) {
            debug!("already hydrated, skipping fetch");
            return None;
        }
        Some(self.refresh(scope).await)
    }

    /// Fetch and reconcile regardless of earlier mounts, e.g. after a
    /// reconnect. Each slice settles on its own.
    pub async fn refresh(&self, scope: &HydrationScope) -> HydrationReport {
        let keys = self.source.slices();
        self.store.mutate(|state| {
            state.begin_fetch(&keys);
            keys.iter().fold(false, |changed, key| state.set_loading(*key, true) | changed)
        });

        let fetches = keys.iter().map(|&key| async move { (key, self.source.fetch(key, scope).await) });
        let mut report = HydrationReport::default();
        for (key, result) in join_all(fetches).await {
            match result {
                Ok(snapshot) => {
                    apply_snapshot(&self.store, snapshot);
                    report.applied.push(key);
                }
                Err(error) => {
                    warn!(slice = key.as_str(), %error, "hydration fetch failed");
                    self.store.mutate(|state| state.mark_unloaded(key));
                    report.failed.push((key, error));
                }
            }
        }
        info!(applied = report.applied.len(), failed = report.failed.len(), "hydration finished");
        report
    }
}

/// Reconcile `snapshot` into the store in one atomic step.
pub fn apply_snapshot(store: &Store, snapshot: HydrationSnapshot) -> bool {
    let keys = snapshot.keys();
    let changed = store.mutate(|state| reconcile(state, snapshot));
    debug!(slices = ?keys, changed, "applied hydration snapshot");
    changed
}

// ── Merge ───────────────────────────────────────────────────────────

/// Fold `snapshot` into `state`: untouched slices are replaced, live-touched
/// slices are merged minus whatever a live event deleted meanwhile. Every
/// slice in the snapshot is settled afterwards. Returns whether anything
/// changed.
pub fn reconcile(state: &mut AppState, snapshot: HydrationSnapshot) -> bool {
    let keys = snapshot.keys();
    let PartialState {
        workspace,
        workflows,
        kanban,
        sessions,
        turns,
        messages,
        executors,
        secrets,
        settings,
        plans,
        diffs,
        terminals,
        shells,
        task_prs,
    } = snapshot;

    let mut rest = PartialState { workspace, ..PartialState::default() };
    let mut changed = false;

    if let Some(mut incoming) = workflows {
        if state.is_live_touched(SliceKey::Workflows) {
            without_deleted(state, SliceKey::Workflows, &mut incoming.items);
            let baseline = state.fetch_baseline(SliceKey::Workflows).cloned();
            changed |= prune_stale(baseline.as_ref(), &mut state.workflows.items, &incoming.items);
            changed |= merge_workflows(&mut state.workflows, incoming);
        } else {
            rest.workflows = Some(incoming);
        }
    }
    if let Some(mut incoming) = kanban {
        if state.is_live_touched(SliceKey::Kanban) {
            without_deleted(state, SliceKey::Kanban, &mut incoming.tasks.items);
            if incoming.workflow_id == state.kanban.workflow_id {
                let baseline = state.fetch_baseline(SliceKey::Kanban).cloned();
                changed |= prune_stale(baseline.as_ref(), &mut state.kanban.tasks.items, &incoming.tasks.items);
            }
            changed |= merge_kanban(&mut state.kanban, incoming);
        } else {
            rest.kanban = Some(incoming);
        }
    }
    if let Some(mut incoming) = sessions {
        if state.is_live_touched(SliceKey::Sessions) {
            if let Some(gone) = state.live_deleted(SliceKey::Sessions) {
                incoming.order.retain(|id| !gone.contains(id));
            }
            if let Some(baseline) = state.fetch_baseline(SliceKey::Sessions).cloned() {
                let stale: Vec<String> = state
                    .sessions
                    .order
                    .iter()
                    .filter(|id| baseline.contains(*id) && !incoming.by_id.contains_key(*id))
                    .cloned()
                    .collect();
                for id in stale {
                    changed |= state.sessions.remove(&id).is_some();
                }
            }
            changed |= merge_keyed(&mut state.sessions, incoming, KeyedSlice::upsert);
        } else {
            rest.sessions = Some(incoming);
        }
    }
    if let Some(mut incoming) = turns {
        if state.is_live_touched(SliceKey::Turns) {
            without_deleted_keys(state, SliceKey::Turns, &mut incoming.by_session);
            without_deleted_keys(state, SliceKey::Turns, &mut incoming.active_by_session);
            changed |= merge_turns(&mut state.turns, incoming);
        } else {
            rest.turns = Some(incoming);
        }
    }
    if let Some(mut incoming) = messages {
        if state.is_live_touched(SliceKey::Messages) {
            without_deleted_keys(state, SliceKey::Messages, &mut incoming);
            for (session_id, thread) in incoming {
                changed |= match state.messages.entry(session_id) {
                    Entry::Vacant(slot) => {
                        slot.insert(thread);
                        true
                    }
                    Entry::Occupied(mut slot) => merge_keyed(slot.get_mut(), thread, |live, message| {
                        live.upsert_sorted_by(message, |message| message.created_at)
                    }),
                };
            }
        } else {
            rest.messages = Some(incoming);
        }
    }
    if let Some(mut incoming) = executors {
        if state.is_live_touched(SliceKey::Executors) {
            without_deleted(state, SliceKey::Executors, &mut incoming.items);
            let baseline = state.fetch_baseline(SliceKey::Executors).cloned();
            changed |= prune_stale(baseline.as_ref(), &mut state.executors.items, &incoming.items);
            changed |= merge_list(&mut state.executors, incoming);
        } else {
            rest.executors = Some(incoming);
        }
    }
    if let Some(mut incoming) = secrets {
        if state.is_live_touched(SliceKey::Secrets) {
            without_deleted(state, SliceKey::Secrets, &mut incoming.items);
            let baseline = state.fetch_baseline(SliceKey::Secrets).cloned();
            changed |= prune_stale(baseline.as_ref(), &mut state.secrets.items, &incoming.items);
            changed |= merge_list(&mut state.secrets, incoming);
        } else {
            rest.secrets = Some(incoming);
        }
    }
    if let Some(incoming) = settings {
        if state.is_live_touched(SliceKey::Settings) {
            changed |= merge_settings(&mut state.settings, incoming);
        } else {
            rest.settings = Some(incoming);
        }
    }
    if let Some(mut incoming) = plans {
        if state.is_live_touched(SliceKey::Plans) {
            without_deleted_keys(state, SliceKey::Plans, &mut incoming.by_task);
            changed |= fill_missing(&mut state.plans.by_task, incoming.by_task);
        } else {
            rest.plans = Some(incoming);
        }
    }
    if let Some(mut incoming) = diffs {
        if state.is_live_touched(SliceKey::Diffs) {
            without_deleted_keys(state, SliceKey::Diffs, &mut incoming);
            changed |= fill_missing(&mut state.diffs, incoming);
        } else {
            rest.diffs = Some(incoming);
        }
    }
    if let Some(incoming) = terminals {
        if state.is_live_touched(SliceKey::Terminals) {
            changed |= fill_missing(&mut state.terminals, incoming);
        } else {
            rest.terminals = Some(incoming);
        }
    }
    if let Some(mut incoming) = shells {
        if state.is_live_touched(SliceKey::Shells) {
            without_deleted_keys(state, SliceKey::Shells, &mut incoming);
            changed |= fill_missing(&mut state.shells, incoming);
        } else {
            rest.shells = Some(incoming);
        }
    }
    if let Some(mut incoming) = task_prs {
        if state.is_live_touched(SliceKey::TaskPrs) {
            without_deleted_keys(state, SliceKey::TaskPrs, &mut incoming);
            changed |= fill_missing(&mut state.task_prs, incoming);
        } else {
            rest.task_prs = Some(incoming);
        }
    }

    changed |= state.hydrate(rest);
    state.settle(&keys);
    changed
}

/// Drop snapshot entries a live event deleted while the fetch was in flight.
fn without_deleted<T: Entity>(state: &AppState, key: SliceKey, items: &mut Vec<T>) {
    if let Some(gone) = state.live_deleted(key) {
        items.retain(|item| !gone.contains(item.id()));
    }
}

/// Remove live entities a refetched slice held when its fetch began but the
/// snapshot no longer lists; the server deleted them in the meantime.
fn prune_stale<T: Entity>(baseline: Option<&BTreeSet<String>>, live: &mut Vec<T>, snapshot: &[T]) -> bool {
    let Some(baseline) = baseline else {
        return false;
    };
    let listed: HashSet<&str> = snapshot.iter().map(Entity::id).collect();
    let before = live.len();
    live.retain(|entity| !baseline.contains(entity.id()) || listed.contains(entity.id()));
    live.len() != before
}

fn without_deleted_keys<V>(state: &AppState, key: SliceKey, entries: &mut HashMap<String, V>) {
    if let Some(gone) = state.live_deleted(key) {
        entries.retain(|id, _| !gone.contains(id));
    }
}

fn assign<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

#[derive(Clone, Copy)]
enum LiveOnly {
    Front,
    Back,
}

/// Snapshot order with live copies kept where they are at least as fresh;
/// entities only the live side has go to `live_only`.
fn merge_entities<T: Entity + Clone>(live: &[T], snapshot: Vec<T>, live_only: LiveOnly) -> Vec<T> {
    let current: HashMap<&str, &T> = live.iter().map(|entity| (entity.id(), entity)).collect();
    let mut merged: Vec<T> = snapshot
        .into_iter()
        .map(|incoming| match current.get(incoming.id()) {
            Some(existing) if !is_newer(&incoming, existing) => (*existing).clone(),
            _ => incoming,
        })
        .collect();

    let seen: HashSet<String> = merged.iter().map(|entity| entity.id().to_string()).collect();
    let extra = live.iter().filter(|entity| !seen.contains(entity.id())).cloned();
    match live_only {
        LiveOnly::Front => {
            let mut front: Vec<T> = extra.collect();
            front.append(&mut merged);
            front
        }
        LiveOnly::Back => {
            merged.extend(extra);
            merged
        }
    }
}

fn merge_list<T: Entity + Clone + PartialEq>(live: &mut ListSlice<T>, snapshot: ListSlice<T>) -> bool {
    let merged = ListSlice {
        items: merge_entities(&live.items, snapshot.items, LiveOnly::Back),
        loaded: true,
        loading: false,
    };
    assign(live, merged)
}

fn merge_keyed<T, F>(live: &mut KeyedSlice<T>, mut snapshot: KeyedSlice<T>, insert: F) -> bool
where
    T: Entity,
    F: Fn(&mut KeyedSlice<T>, T) -> bool,
{
    let mut changed = false;
    for id in std::mem::take(&mut snapshot.order) {
        let Some(incoming) = snapshot.by_id.remove(&id) else {
            continue;
        };
        if live.get(&id).is_some_and(|existing| !is_newer(&incoming, existing)) {
            continue;
        }
        changed |= insert(live, incoming);
    }
    changed
}

fn merge_workflows(live: &mut WorkflowsSlice, snapshot: WorkflowsSlice) -> bool {
    // Workflows created live are the newest, so they stay on top.
    let mut merged = WorkflowsSlice {
        items: merge_entities(&live.items, snapshot.items, LiveOnly::Front),
        active_id: live.active_id.clone().or(snapshot.active_id),
        loaded: true,
        loading: false,
    };
    merged.repair_selection();
    assign(live, merged)
}

fn merge_kanban(live: &mut KanbanSlice, snapshot: KanbanSlice) -> bool {
    if live.workflow_id.is_some() && snapshot.workflow_id != live.workflow_id {
        debug!(
            live = ?live.workflow_id,
            snapshot = ?snapshot.workflow_id,
            "board snapshot is for another workflow, keeping live board"
        );
        return false;
    }
    let mut merged = KanbanSlice {
        workflow_id: snapshot.workflow_id,
        steps: merge_entities(&live.steps, snapshot.steps, LiveOnly::Back),
        tasks: ListSlice {
            items: merge_entities(&live.tasks.items, snapshot.tasks.items, LiveOnly::Back),
            loaded: true,
            loading: false,
        },
    };
    merged.sort_steps();
    assign(live, merged)
}

fn merge_turns(live: &mut TurnsSlice, snapshot: TurnsSlice) -> bool {
    let mut changed = false;
    let known: HashSet<String> = live.by_session.keys().cloned().collect();

    for (session_id, turns) in snapshot.by_session {
        match live.by_session.entry(session_id) {
            Entry::Vacant(slot) => {
                slot.insert(turns);
                changed = true;
            }
            Entry::Occupied(mut slot) => {
                let mut merged = merge_entities(slot.get(), turns, LiveOnly::Back);
                merged.sort_by_key(|turn| turn.started_at);
                changed |= assign(slot.get_mut(), merged);
            }
        }
    }
    // A live completion may have cleared the active turn; only sessions the
    // live side never saw take the snapshot's.
    for (session_id, turn_id) in snapshot.active_by_session {
        if !known.contains(&session_id) {
            changed |= live.active_by_session.insert(session_id, turn_id.clone()).as_ref() != Some(&turn_id);
        }
    }
    changed
}

fn merge_settings(live: &mut SettingsSlice, snapshot: SettingsSlice) -> bool {
    let before = live.clone();
    let value = match (live.value.take(), snapshot.value) {
        (Some(current), Some(incoming)) => {
            let newer = match (incoming.updated_at, current.updated_at) {
                (Some(incoming_at), Some(current_at)) => incoming_at > current_at,
                _ => false,
            };
            Some(if newer { incoming } else { current })
        }
        (current, incoming) => current.or(incoming),
    };
    live.value = value;
    live.loaded = true;
    live.loading = false;
    *live != before
}

fn fill_missing<K: Eq + Hash, V>(live: &mut HashMap<K, V>, snapshot: HashMap<K, V>) -> bool {
    let mut changed = false;
    for (key, value) in snapshot {
        if let Entry::Vacant(slot) = live.entry(key) {
            slot.insert(value);
            changed = true;
        }
    }
    changed
}
