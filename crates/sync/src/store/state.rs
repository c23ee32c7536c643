// Canonical client state and its mutation API.
//
// Every mutation returns whether it changed anything; `Store::mutate` only
// publishes a new snapshot when one did.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use taskdeck_common::protocol::events::{Patch, SessionStateChange, TurnCompletion};
use taskdeck_common::types::{
    DiffUpdate, Entity, Executor, Message, Plan, Secret, Session, SessionId, ShellOutput, ShellOutputKind,
    Task, TaskId, TaskPr, TerminalOutput, Turn, UserSettings, Workflow, WorkflowId, WorkflowStep,
    WorkspaceId,
};

use super::slices::{
    merge_patch, ConnectionSlice, ConnectionStatus, KanbanSlice, KeyedSlice, ListSlice,
    PlansSlice, SettingsSlice, ShellBuffer, SliceKey, TerminalBuffer, TurnsSlice, WorkflowsSlice,
    WorkspaceSlice,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppState {
    pub workspace: WorkspaceSlice,
    pub workflows: WorkflowsSlice,
    pub kanban: KanbanSlice,
    pub sessions: KeyedSlice<Session>,
    pub turns: TurnsSlice,
    pub messages: HashMap<SessionId, KeyedSlice<Message>>,
    pub executors: ListSlice<Executor>,
    pub secrets: ListSlice<Secret>,
    pub settings: SettingsSlice,
    pub plans: PlansSlice,
    pub diffs: HashMap<SessionId, DiffUpdate>,
    pub terminals: HashMap<String, TerminalBuffer>,
    pub shells: HashMap<SessionId, ShellBuffer>,
    pub task_prs: HashMap<TaskId, TaskPr>,
    pub connection: ConnectionSlice,
    #[serde(skip)]
    pub(crate) live: LiveMarks,
}

/// What live events did to slices that are waiting for a snapshot. A slice
/// waits from startup (or a reset) until its first snapshot lands, and again
/// for the duration of every refetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct LiveMarks {
    /// Slices holding a snapshot with no fetch in flight.
    settled: BTreeSet<SliceKey>,
    /// Waiting slices a live event wrote to.
    touched: BTreeSet<SliceKey>,
    /// IDs a live event removed from a waiting slice.
    deleted: BTreeMap<SliceKey, BTreeSet<String>>,
    /// IDs a refetched slice held when its fetch began.
    baseline: BTreeMap<SliceKey, BTreeSet<String>>,
}

impl LiveMarks {
    fn is_waiting(&self, key: SliceKey) -> bool {
        !self.settled.contains(&key)
    }

    fn touch(&mut self, key: SliceKey) {
        if self.is_waiting(key) {
            self.touched.insert(key);
        }
    }

    fn forget(&mut self, key: SliceKey) {
        self.touched.remove(&key);
        self.deleted.remove(&key);
        self.baseline.remove(&key);
    }
}

/// Subset of [`AppState`] handed over by a server-rendered page or a fetch.
/// Absent slices mean "no data provided".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PartialState {
    pub workspace: Option<WorkspaceSlice>,
    pub workflows: Option<WorkflowsSlice>,
    pub kanban: Option<KanbanSlice>,
    pub sessions: Option<KeyedSlice<Session>>,
    pub turns: Option<TurnsSlice>,
    pub messages: Option<HashMap<SessionId, KeyedSlice<Message>>>,
    pub executors: Option<ListSlice<Executor>>,
    pub secrets: Option<ListSlice<Secret>>,
    pub settings: Option<SettingsSlice>,
    pub plans: Option<PlansSlice>,
    pub diffs: Option<HashMap<SessionId, DiffUpdate>>,
    pub terminals: Option<HashMap<String, TerminalBuffer>>,
    pub shells: Option<HashMap<SessionId, ShellBuffer>>,
    pub task_prs: Option<HashMap<TaskId, TaskPr>>,
}

impl PartialState {
    /// Slices this snapshot provides.
    pub fn keys(&self) -> Vec<SliceKey> {
        let present = [
            (SliceKey::Workspace, self.workspace.is_some()),
            (SliceKey::Workflows, self.workflows.is_some()),
            (SliceKey::Kanban, self.kanban.is_some()),
            (SliceKey::Sessions, self.sessions.is_some()),
            (SliceKey::Turns, self.turns.is_some()),
            (SliceKey::Messages, self.messages.is_some()),
            (SliceKey::Executors, self.executors.is_some()),
            (SliceKey::Secrets, self.secrets.is_some()),
            (SliceKey::Settings, self.settings.is_some()),
            (SliceKey::Plans, self.plans.is_some()),
            (SliceKey::Diffs, self.diffs.is_some()),
            (SliceKey::Terminals, self.terminals.is_some()),
            (SliceKey::Shells, self.shells.is_some()),
            (SliceKey::TaskPrs, self.task_prs.is_some()),
        ];
        present.into_iter().filter_map(|(key, is_present)| is_present.then_some(key)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }
}

/// Replace `slot` with `incoming` if it differs. Returns whether it did.
fn replace<T: PartialEq>(slot: &mut T, incoming: Option<T>) -> bool {
    match incoming {
        Some(value) if *slot != value => {
            *slot = value;
            true
        }
        _ => false,
    }
}

impl AppState {
    // ── Lifecycle ───────────────────────────────────────────────────

    /// Shallow merge: every slice present in `partial` replaces the current
    /// one wholesale; absent slices are left alone. Applying the same
    /// snapshot twice is a no-op the second time.
    pub fn hydrate(&mut self, partial: PartialState) -> bool {
        let keys = partial.keys();
        let mut changed = false;
        changed |= replace(&mut self.workspace, partial.workspace);
        changed |= replace(&mut self.workflows, partial.workflows);
        changed |= replace(&mut self.kanban, partial.kanban);
        changed |= replace(&mut self.sessions, partial.sessions);
        changed |= replace(&mut self.turns, partial.turns);
        changed |= replace(&mut self.messages, partial.messages);
        changed |= replace(&mut self.executors, partial.executors);
        changed |= replace(&mut self.secrets, partial.secrets);
        changed |= replace(&mut self.settings, partial.settings);
        changed |= replace(&mut self.plans, partial.plans);
        changed |= replace(&mut self.diffs, partial.diffs);
        changed |= replace(&mut self.terminals, partial.terminals);
        changed |= replace(&mut self.shells, partial.shells);
        changed |= replace(&mut self.task_prs, partial.task_prs);
        self.settle(&keys);
        changed
    }

    /// Clear every slice (logout). Connection status survives because the
    /// socket does.
    pub fn reset(&mut self) -> bool {
        let fresh = AppState { connection: self.connection.clone(), ..AppState::default() };
        if *self == fresh {
            return false;
        }
        *self = fresh;
        true
    }

    /// Clear workspace-scoped data and select `workspace_id`.
    pub fn switch_workspace(&mut self, workspace_id: Option<WorkspaceId>) -> bool {
        if self.workspace.active_id == workspace_id {
            return false;
        }
        let settings = std::mem::take(&mut self.settings);
        self.reset();
        self.settings = settings;
        self.workspace.active_id = workspace_id;
        true
    }

    /// Mark `slices` as written by a live event. Slices already holding a
    /// snapshot are not marked: a later snapshot replaces them.
    pub(crate) fn mark_live(&mut self, slices: &[SliceKey]) {
        for key in slices {
            self.live.touch(*key);
        }
    }

    /// Record that a live event removed `id` from each of `slices`, so a
    /// snapshot fetched before the removal cannot bring it back.
    fn note_deleted(&mut self, slices: &[SliceKey], id: &str) {
        for &key in slices {
            if self.live.is_waiting(key) {
                self.live.touched.insert(key);
                self.live.deleted.entry(key).or_default().insert(id.to_string());
            }
        }
    }

    pub fn is_live_touched(&self, key: SliceKey) -> bool {
        self.live.touched.contains(&key)
    }

    /// IDs removed live from `key` while it waited for a snapshot.
    pub fn live_deleted(&self, key: SliceKey) -> Option<&BTreeSet<String>> {
        self.live.deleted.get(&key)
    }

    /// A fetch for `keys` is starting: they wait again, and only live events
    /// from now on count against the snapshot. Slices refetched after an
    /// earlier snapshot remember which IDs they held.
    pub fn begin_fetch(&mut self, keys: &[SliceKey]) {
        for &key in keys {
            let refetch = self.live.settled.remove(&key);
            self.live.forget(key);
            if let Some(ids) = refetch.then(|| self.entity_ids(key)).flatten() {
                self.live.baseline.insert(key, ids);
            }
        }
    }

    /// IDs `key` held when its refetch began; `None` on a first fetch.
    pub fn fetch_baseline(&self, key: SliceKey) -> Option<&BTreeSet<String>> {
        self.live.baseline.get(&key)
    }

    fn entity_ids(&self, key: SliceKey) -> Option<BTreeSet<String>> {
        fn ids<T: Entity>(items: &[T]) -> BTreeSet<String> {
            items.iter().map(|item| item.id().to_string()).collect()
        }
        let ids = match key {
            SliceKey::Workflows => ids(&self.workflows.items),
            SliceKey::Kanban => ids(&self.kanban.tasks.items),
            SliceKey::Executors => ids(&self.executors.items),
            SliceKey::Secrets => ids(&self.secrets.items),
            SliceKey::Sessions => self.sessions.order.iter().cloned().collect(),
            _ => return None,
        };
        Some(ids)
    }

    /// A snapshot for `keys` was applied.
    pub fn settle(&mut self, keys: &[SliceKey]) {
        for &key in keys {
            self.live.forget(key);
            self.live.settled.insert(key);
        }
    }

    fn load_flags(&mut self, key: SliceKey) -> Option<(&mut bool, &mut bool)> {
        match key {
            SliceKey::Workflows => Some((&mut self.workflows.loaded, &mut self.workflows.loading)),
            SliceKey::Kanban => Some((&mut self.kanban.tasks.loaded, &mut self.kanban.tasks.loading)),
            SliceKey::Executors => Some((&mut self.executors.loaded, &mut self.executors.loading)),
            SliceKey::Secrets => Some((&mut self.secrets.loaded, &mut self.secrets.loading)),
            SliceKey::Settings => Some((&mut self.settings.loaded, &mut self.settings.loading)),
            _ => None,
        }
    }

    pub fn set_loading(&mut self, key: SliceKey, loading: bool) -> bool {
        match self.load_flags(key) {
            Some((_, flag)) if *flag != loading => {
                *flag = loading;
                true
            }
            _ => false,
        }
    }

    /// Settle a slice whose fetch failed: neither loaded nor loading.
    pub fn mark_unloaded(&mut self, key: SliceKey) -> bool {
        match self.load_flags(key) {
            Some((loaded, loading)) if *loaded || *loading => {
                *loaded = false;
                *loading = false;
                true
            }
            _ => false,
        }
    }

    // ── Workflows & kanban ──────────────────────────────────────────

    /// Insert newest-first, or replace in place. Workflows of another
    /// workspace than the active one are ignored.
    pub fn add_workflow(&mut self, workflow: Workflow) -> bool {
        if let Some(active) = &self.workspace.active_id {
            if workflow.workspace_id != *active {
                return false;
            }
        }
        let items = &mut self.workflows.items;
        match items.iter().position(|existing| existing.id == workflow.id) {
            Some(index) if items[index] == workflow => false,
            Some(index) => {
                items[index] = workflow;
                true
            }
            None => {
                items.insert(0, workflow);
                true
            }
        }
    }

    pub fn update_workflow(&mut self, patch: &Patch) -> bool {
        let items = &mut self.workflows.items;
        let Some(index) = items.iter().position(|existing| existing.id == patch.id) else {
            return false;
        };
        match merge_patch(&items[index], &patch.fields) {
            Some(merged) if merged != items[index] => {
                items[index] = merged;
                true
            }
            _ => false,
        }
    }

    /// Remove a workflow. If it was active, the new first workflow (or
    /// nothing) becomes active, and the board bound to it is reset.
    pub fn remove_workflow(&mut self, id: &str) -> bool {
        let Some(index) = self.workflows.items.iter().position(|existing| existing.id == id) else {
            return false;
        };
        self.workflows.items.remove(index);
        self.note_deleted(&[SliceKey::Workflows], id);
        if self.workflows.active_id.as_deref() == Some(id) {
            self.workflows.active_id = self.workflows.items.first().map(|w| w.id.clone());
        }
        if self.kanban.workflow_id.as_deref() == Some(id) {
            self.kanban = KanbanSlice::for_workflow(self.workflows.active_id.clone());
        }
        true
    }

    pub fn set_active_workflow(&mut self, id: Option<WorkflowId>) -> bool {
        if let Some(candidate) = &id {
            if self.workflows.get(candidate).is_none() {
                return false;
            }
        }
        if self.workflows.active_id == id {
            return false;
        }
        if self.kanban.workflow_id != id {
            self.kanban = KanbanSlice::for_workflow(id.clone());
        }
        self.workflows.active_id = id;
        true
    }

    pub fn active_workflow(&self) -> Option<&Workflow> {
        self.workflows.active_id.as_deref().and_then(|id| self.workflows.get(id))
    }

    /// Load the board for `workflow_id` in one step.
    pub fn set_kanban(
        &mut self,
        workflow_id: WorkflowId,
        steps: Vec<WorkflowStep>,
        tasks: Vec<Task>,
    ) -> bool {
        let mut board = KanbanSlice {
            workflow_id: Some(workflow_id),
            steps,
            tasks: ListSlice::loaded(tasks),
        };
        board.sort_steps();
        replace(&mut self.kanban, Some(board))
    }

    fn task_belongs_to_board(&self, task: &Task) -> bool {
        match (&self.kanban.workflow_id, &task.workflow_id) {
            (Some(board), Some(workflow)) => board == workflow,
            _ => true,
        }
    }

    pub fn add_task(&mut self, task: Task) -> bool {
        if !self.task_belongs_to_board(&task) {
            return false;
        }
        self.kanban.tasks.upsert(task)
    }

    /// Merge a task update. A task moved to another workflow leaves the board.
    pub fn update_task(&mut self, patch: &Patch) -> bool {
        if !self.kanban.tasks.patch(&patch.id, &patch.fields) {
            return false;
        }
        let moved_away = self
            .kanban
            .tasks
            .get(&patch.id)
            .is_some_and(|task| !self.task_belongs_to_board(task));
        if moved_away {
            self.kanban.tasks.remove(&patch.id);
        }
        true
    }

    /// Remove a task along with its plan and pull request.
    pub fn remove_task(&mut self, id: &str) -> bool {
        let task = self.kanban.tasks.remove(id).is_some();
        let plan = self.plans.by_task.remove(id).is_some();
        let pr = self.task_prs.remove(id).is_some();
        if task {
            self.note_deleted(&[SliceKey::Kanban, SliceKey::Plans, SliceKey::TaskPrs], id);
        }
        task || plan || pr
    }

    // ── Sessions ────────────────────────────────────────────────────

    pub fn upsert_session(&mut self, session: Session) -> bool {
        self.sessions.upsert(session)
    }

    /// Apply an `agent_session.state_changed`. Changes older than what the
    /// store already holds are dropped; unknown sessions are created.
    pub fn apply_session_state(&mut self, change: SessionStateChange) -> bool {
        if !self.sessions.contains(&change.session_id) {
            return self.sessions.upsert(Session {
                id: change.session_id,
                task_id: change.task_id,
                is_primary: change.is_primary.unwrap_or(false),
                state: change.state,
                updated_at: change.updated_at,
                extra: Map::new(),
            });
        }
        let Some(session) = self.sessions.get_mut(&change.session_id) else {
            return false;
        };

        if let (Some(incoming), Some(current)) = (change.updated_at, session.updated_at) {
            if incoming < current {
                return false;
            }
        }

        let mut next = session.clone();
        next.state = change.state;
        if let Some(is_primary) = change.is_primary {
            next.is_primary = is_primary;
        }
        if change.updated_at.is_some() {
            next.updated_at = change.updated_at;
        }
        if next == *session {
            return false;
        }
        *session = next;
        true
    }

    /// Remove a session and everything streamed for it.
    pub fn remove_session(&mut self, id: &str) -> bool {
        if self.sessions.remove(id).is_none() {
            return false;
        }
        self.turns.by_session.remove(id);
        self.turns.active_by_session.remove(id);
        self.messages.remove(id);
        self.diffs.remove(id);
        self.shells.remove(id);
        self.note_deleted(
            &[
                SliceKey::Sessions,
                SliceKey::Turns,
                SliceKey::Messages,
                SliceKey::Diffs,
                SliceKey::Shells,
            ],
            id,
        );
        true
    }

    pub fn sessions_for_task<'a, 'b>(&'a self, task_id: &'b str) -> impl Iterator<Item = &'a Session> + use<'a, 'b> {
        self.sessions.iter().filter(move |session| session.task_id == task_id)
    }

    /// The session shown in a task's summary: the first flagged primary in
    /// arrival order, else the first to arrive.
    pub fn primary_session(&self, task_id: &str) -> Option<&Session> {
        let mut first = None;
        for session in self.sessions_for_task(task_id) {
            if session.is_primary {
                return Some(session);
            }
            first.get_or_insert(session);
        }
        first
    }

    // ── Turns ───────────────────────────────────────────────────────

    /// Upsert a turn, keeping the session's turns ordered by `started_at`.
    /// A running turn becomes the session's active turn.
    pub fn start_turn(&mut self, turn: Turn) -> bool {
        let turns = self.turns.by_session.entry(turn.session_id.clone()).or_default();
        let mut changed = match turns.iter().position(|existing| existing.id == turn.id) {
            Some(index) if turns[index] == turn => false,
            Some(index) => {
                turns[index] = turn.clone();
                true
            }
            None => {
                let index = turns
                    .iter()
                    .rposition(|existing| existing.started_at <= turn.started_at)
                    .map_or(0, |found| found + 1);
                turns.insert(index, turn.clone());
                true
            }
        };

        let active = &mut self.turns.active_by_session;
        if turn.is_in_progress() {
            if active.get(&turn.session_id) != Some(&turn.id) {
                active.insert(turn.session_id, turn.id);
                changed = true;
            }
        } else if active.get(&turn.session_id) == Some(&turn.id) {
            active.remove(&turn.session_id);
            changed = true;
        }
        changed
    }

    /// Mark a turn complete. Unknown turns are ignored.
    pub fn complete_turn(&mut self, completion: &TurnCompletion) -> bool {
        let Some(turns) = self.turns.by_session.get_mut(&completion.session_id) else {
            return false;
        };
        let Some(turn) = turns.iter_mut().find(|turn| turn.id == completion.id) else {
            return false;
        };

        let completed_at = completion.completed_at.or(turn.completed_at).unwrap_or_else(Utc::now);
        let mut changed = false;
        if turn.completed_at != Some(completed_at) {
            turn.completed_at = Some(completed_at);
            changed = true;
        }
        if self.turns.active_by_session.get(&completion.session_id) == Some(&completion.id) {
            self.turns.active_by_session.remove(&completion.session_id);
            changed = true;
        }
        changed
    }

    pub fn turns(&self, session_id: &str) -> &[Turn] {
        self.turns.by_session.get(session_id).map_or(&[], Vec::as_slice)
    }

    pub fn active_turn(&self, session_id: &str) -> Option<&Turn> {
        let id = self.turns.active_by_session.get(session_id)?;
        self.turns(session_id).iter().find(|turn| turn.id == *id)
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Append a message in `created_at` order. An ID already present is
    /// replaced in place.
    pub fn add_message(&mut self, message: Message) -> bool {
        self.messages
            .entry(message.session_id.clone())
            .or_default()
            .upsert_sorted_by(message, |existing| existing.created_at)
    }

    /// Replace a message in place, inserting it if it was never seen.
    pub fn update_message(&mut self, message: Message) -> bool {
        self.add_message(message)
    }

    pub fn messages(&self, session_id: &str) -> Vec<&Message> {
        self.messages.get(session_id).map(|slice| slice.iter().collect()).unwrap_or_default()
    }

    // ── Executors & secrets ─────────────────────────────────────────

    pub fn add_executor(&mut self, executor: Executor) -> bool {
        self.executors.upsert(executor)
    }

    pub fn update_executor(&mut self, patch: &Patch) -> bool {
        self.executors.patch(&patch.id, &patch.fields)
    }

    pub fn remove_executor(&mut self, id: &str) -> bool {
        let removed = self.executors.remove(id).is_some();
        if removed {
            self.note_deleted(&[SliceKey::Executors], id);
        }
        removed
    }

    pub fn add_secret(&mut self, secret: Secret) -> bool {
        self.secrets.upsert(secret)
    }

    pub fn update_secret(&mut self, patch: &Patch) -> bool {
        self.secrets.patch(&patch.id, &patch.fields)
    }

    pub fn remove_secret(&mut self, id: &str) -> bool {
        let removed = self.secrets.remove(id).is_some();
        if removed {
            self.note_deleted(&[SliceKey::Secrets], id);
        }
        removed
    }

    // ── Settings & plans ────────────────────────────────────────────

    pub fn set_settings(&mut self, settings: UserSettings) -> bool {
        let next = SettingsSlice { value: Some(settings), loaded: true, loading: false };
        replace(&mut self.settings, Some(next))
    }

    /// Record the server's answer for a task's plan; `None` means absent.
    pub fn set_plan(&mut self, task_id: &str, plan: Option<Plan>) -> bool {
        let was_loading = self.plans.loading.remove(task_id);
        let previous = self.plans.by_task.insert(task_id.to_string(), plan.clone());
        was_loading || previous != Some(plan)
    }

    pub fn set_plan_loading(&mut self, task_id: &str, loading: bool) -> bool {
        if loading {
            self.plans.loading.insert(task_id.to_string())
        } else {
            self.plans.loading.remove(task_id)
        }
    }

    pub fn plan(&self, task_id: &str) -> Option<&Plan> {
        self.plans.by_task.get(task_id).and_then(Option::as_ref)
    }

    // ── Environment output ──────────────────────────────────────────

    pub fn set_diff(&mut self, diff: DiffUpdate) -> bool {
        if self.diffs.get(&diff.session_id) == Some(&diff) {
            return false;
        }
        self.diffs.insert(diff.session_id.clone(), diff);
        true
    }

    pub fn append_terminal(&mut self, output: &TerminalOutput) -> bool {
        if output.data.is_empty() {
            return false;
        }
        self.terminals.entry(output.buffer_key().to_string()).or_default().append(&output.data);
        true
    }

    pub fn apply_shell_output(&mut self, output: &ShellOutput) -> bool {
        let shell = self.shells.entry(output.session_id.clone()).or_default();
        match output.kind {
            ShellOutputKind::Output => match output.data.as_deref() {
                Some(data) if !data.is_empty() => {
                    shell.append(data);
                    true
                }
                _ => false,
            },
            ShellOutputKind::Exit => {
                if shell.exited && shell.exit_code == output.code {
                    return false;
                }
                shell.exited = true;
                shell.exit_code = output.code;
                true
            }
        }
    }

    pub fn set_task_pr(&mut self, pr: TaskPr) -> bool {
        if self.task_prs.get(&pr.task_id) == Some(&pr) {
            return false;
        }
        self.task_prs.insert(pr.task_id.clone(), pr);
        true
    }

    // ── Connection ──────────────────────────────────────────────────

    pub fn set_connection_status(&mut self, status: ConnectionStatus, error: Option<String>) -> bool {
        let connection = &mut self.connection;
        let mut changed = false;
        if connection.status != status {
            connection.status = status;
            if status == ConnectionStatus::Connected {
                connection.connected_at = Some(Utc::now());
            }
            changed = true;
        }
        if error.is_some() || status == ConnectionStatus::Connected {
            let error = if status == ConnectionStatus::Connected { None } else { error };
            if connection.last_error != error {
                connection.last_error = error;
                changed = true;
            }
        }
        changed
    }

    pub fn record_resync(&mut self) -> bool {
        self.connection.resync_count += 1;
        true
    }
}
