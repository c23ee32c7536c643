// Reactive store: one canonical `AppState` published through a watch channel.
//
// Writers go through `mutate`, which runs synchronously on the current
// snapshot (copy-on-write via `Arc::make_mut`) and notifies subscribers only
// when the closure reports a change.

mod slices;
mod state;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use taskdeck_common::types::WorkspaceId;

pub use slices::{
    is_newer, merge_patch, ConnectionSlice, ConnectionStatus, KanbanSlice, KeyedSlice, ListSlice,
    PlansSlice, SettingsSlice, ShellBuffer, SliceKey, TerminalBuffer, TurnsSlice, WorkflowsSlice,
    WorkspaceSlice, MAX_OUTPUT_BYTES,
};
pub use state::{AppState, PartialState};

pub struct Store {
    tx: watch::Sender<Arc<AppState>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::with_state(AppState::default())
    }

    pub fn with_state(state: AppState) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(state));
        Self { tx }
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<AppState> {
        self.tx.borrow().clone()
    }

    /// Observe future snapshots. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AppState>> {
        self.tx.subscribe()
    }

    /// Read a derived value without cloning the snapshot handle.
    pub fn select<R>(&self, read: impl FnOnce(&AppState) -> R) -> R {
        read(&self.tx.borrow())
    }

    /// Apply `change` atomically. Returns whether anything changed.
    pub fn mutate<F>(&self, change: F) -> bool
    where
        F: FnOnce(&mut AppState) -> bool,
    {
        self.tx.send_if_modified(|state| change(Arc::make_mut(state)))
    }

    /// Apply a mutation caused by a live event, marking `slices` as
    /// live-touched in the same step when it changed anything.
    pub fn mutate_live<F>(&self, slices: &[SliceKey], change: F) -> bool
    where
        F: FnOnce(&mut AppState) -> bool,
    {
        self.mutate(|state| {
            let changed = change(state);
            if changed {
                state.mark_live(slices);
            }
            changed
        })
    }

    /// Replace every slice present in `partial`; see [`AppState::hydrate`].
    pub fn hydrate(&self, partial: PartialState) -> bool {
        let keys = partial.keys();
        let changed = self.mutate(|state| state.hydrate(partial));
        debug!(slices = ?keys, changed, "hydrated store");
        changed
    }

    /// Clear every slice (logout).
    pub fn reset(&self) -> bool {
        self.mutate(AppState::reset)
    }

    pub fn switch_workspace(&self, workspace_id: Option<WorkspaceId>) -> bool {
        self.mutate(|state| state.switch_workspace(workspace_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_is_immutable_after_mutation() {
        let store = Store::new();
        let before = store.snapshot();
        store.mutate(|state| {
            state.add_executor(serde_json::from_value(json!({ "id": "e1" })).expect("executor"))
        });
        assert!(before.executors.items.is_empty());
        assert_eq!(store.snapshot().executors.items.len(), 1);
    }

    #[tokio::test]
    async fn subscribers_only_see_real_changes() {
        let store = Store::new();
        let mut rx = store.subscribe();

        assert!(!store.mutate(|_| false));
        assert!(!rx.has_changed().expect("sender alive"));

        store.switch_workspace(Some("ws-1".into()));
        rx.changed().await.expect("sender alive");
        assert_eq!(rx.borrow_and_update().workspace.active_id.as_deref(), Some("ws-1"));
    }

    #[test]
    fn live_mutation_marks_slices() {
        let store = Store::new();
        store.mutate_live(&[SliceKey::Executors], |state| {
            state.add_executor(serde_json::from_value(json!({ "id": "e1" })).expect("executor"))
        });
        store.mutate_live(&[SliceKey::Secrets], |_| false);
        let snapshot = store.snapshot();
        assert!(snapshot.is_live_touched(SliceKey::Executors));
        assert!(!snapshot.is_live_touched(SliceKey::Secrets));
    }

    #[test]
    fn reset_clears_live_marks() {
        let store = Store::new();
        store.mutate_live(&[SliceKey::Executors], |state| {
            state.add_executor(serde_json::from_value(json!({ "id": "e1" })).expect("executor"))
        });
        assert!(store.reset());
        assert!(!store.snapshot().is_live_touched(SliceKey::Executors));
        assert!(!store.reset());
    }
}
