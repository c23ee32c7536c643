// Topic name constants — derived from contracts/ws-topics.json.

// ── Agent sessions ─────────────────────────────────────────────────
pub const AGENT_SESSION_STATE_CHANGED: &str = "agent_session.state_changed";

// ── Tasks ──────────────────────────────────────────────────────────
pub const TASK_CREATED: &str = "task.created";
pub const TASK_UPDATED: &str = "task.updated";
pub const TASK_DELETED: &str = "task.deleted";

// ── Session stream ─────────────────────────────────────────────────
pub const SESSION_MESSAGE_ADDED: &str = "session.message.added";
pub const SESSION_MESSAGE_UPDATED: &str = "session.message.updated";
pub const SESSION_TURN_STARTED: &str = "session.turn.started";
pub const SESSION_TURN_COMPLETED: &str = "session.turn.completed";
pub const SESSION_SHELL_OUTPUT: &str = "session.shell.output";

// ── Workspace resources ────────────────────────────────────────────
pub const WORKFLOW_CREATED: &str = "workflow.created";
pub const WORKFLOW_UPDATED: &str = "workflow.updated";
pub const WORKFLOW_DELETED: &str = "workflow.deleted";
pub const EXECUTOR_CREATED: &str = "executor.created";
pub const EXECUTOR_UPDATED: &str = "executor.updated";
pub const EXECUTOR_DELETED: &str = "executor.deleted";
pub const SECRETS_CREATED: &str = "secrets.created";
pub const SECRETS_UPDATED: &str = "secrets.updated";
pub const SECRETS_DELETED: &str = "secrets.deleted";
pub const USER_SETTINGS_UPDATED: &str = "user.settings.updated";

// ── Environment output ─────────────────────────────────────────────
pub const DIFF_UPDATE: &str = "diff.update";
pub const TERMINAL_OUTPUT: &str = "terminal.output";
pub const GITHUB_TASK_PR_UPDATED: &str = "github.task_pr.updated";

// ── Requests ───────────────────────────────────────────────────────
pub const TASK_PLAN_GET: &str = "task.plan.get";
pub const TASK_PLAN_CREATE: &str = "task.plan.create";
pub const TASK_PLAN_UPDATE: &str = "task.plan.update";
pub const TASK_PLAN_DELETE: &str = "task.plan.delete";

// ── Subscriptions (client → server, fire-and-forget) ───────────────
pub const TASK_SUBSCRIBE: &str = "task.subscribe";
pub const TASK_UNSUBSCRIBE: &str = "task.unsubscribe";
pub const SESSION_SUBSCRIBE: &str = "session.subscribe";
pub const SESSION_UNSUBSCRIBE: &str = "session.unsubscribe";

/// Server → client broadcasts the client applies to its store.
pub const BROADCAST_TOPICS: &[&str] = &[
    AGENT_SESSION_STATE_CHANGED,
    TASK_CREATED,
    TASK_UPDATED,
    TASK_DELETED,
    SESSION_MESSAGE_ADDED,
    SESSION_MESSAGE_UPDATED,
    SESSION_TURN_STARTED,
    SESSION_TURN_COMPLETED,
    SESSION_SHELL_OUTPUT,
    WORKFLOW_CREATED,
    WORKFLOW_UPDATED,
    WORKFLOW_DELETED,
    EXECUTOR_CREATED,
    EXECUTOR_UPDATED,
    EXECUTOR_DELETED,
    SECRETS_CREATED,
    SECRETS_UPDATED,
    SECRETS_DELETED,
    USER_SETTINGS_UPDATED,
    DIFF_UPDATE,
    TERMINAL_OUTPUT,
    GITHUB_TASK_PR_UPDATED,
];

/// Correlated request topics answered over the same socket.
pub const REQUEST_TOPICS: &[&str] =
    &[TASK_PLAN_GET, TASK_PLAN_CREATE, TASK_PLAN_UPDATE, TASK_PLAN_DELETE];

/// Outbound fire-and-forget topics.
pub const CLIENT_TOPICS: &[&str] =
    &[TASK_SUBSCRIBE, TASK_UNSUBSCRIBE, SESSION_SUBSCRIBE, SESSION_UNSUBSCRIBE];

#[must_use]
pub fn is_broadcast_topic(topic: &str) -> bool {
    BROADCAST_TOPICS.contains(&topic)
}

/// Domain prefix of a dotted topic (`"executor.created"` → `"executor"`).
#[must_use]
pub fn domain_of(topic: &str) -> &str {
    topic.split_once('.').map_or(topic, |(domain, _)| domain)
}
