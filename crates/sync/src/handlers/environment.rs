// Per-session environment feeds: git diff, terminal output and linked PRs.

use taskdeck_common::protocol::events::{DiffEvent, GithubEvent, TerminalEvent};

use super::DomainHandler;
use crate::store::{AppState, SliceKey};

pub struct DiffHandler;

impl DomainHandler for DiffHandler {
    type Event = DiffEvent;
    const DOMAIN: &'static str = "diff";
    const SLICES: &'static [SliceKey] = &[SliceKey::Diffs];

    fn apply(state: &mut AppState, event: DiffEvent) -> bool {
        match event {
            DiffEvent::Update(diff) => state.set_diff(diff),
        }
    }
}

pub struct TerminalHandler;

impl DomainHandler for TerminalHandler {
    type Event = TerminalEvent;
    const DOMAIN: &'static str = "terminal";
    const SLICES: &'static [SliceKey] = &[SliceKey::Terminals];

    fn apply(state: &mut AppState, event: TerminalEvent) -> bool {
        match event {
            TerminalEvent::Output(output) => state.append_terminal(&output),
        }
    }
}

pub struct GithubHandler;

impl DomainHandler for GithubHandler {
    type Event = GithubEvent;
    const DOMAIN: &'static str = "github";
    const SLICES: &'static [SliceKey] = &[SliceKey::TaskPrs];

    fn apply(state: &mut AppState, event: GithubEvent) -> bool {
        match event {
            GithubEvent::TaskPrUpdated(pr) => state.set_task_pr(pr),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use taskdeck_common::protocol::envelope::Envelope;
    use taskdeck_common::protocol::topics;

    use crate::handlers::HandlerRegistry;
    use crate::store::Store;

    #[test]
    fn terminal_output_accumulates_per_terminal() {
        let store = Arc::new(Store::new());
        let registry = HandlerRegistry::with_default_handlers(&store);
        for chunk in ["npm ", "test\n"] {
            registry.dispatch(Envelope::new(
                topics::TERMINAL_OUTPUT,
                json!({ "session_id": "s1", "terminal_id": "term-1", "data": chunk }),
            ));
        }
        registry.dispatch(Envelope::new(topics::TERMINAL_OUTPUT, json!({ "session_id": "s1", "data": "x" })));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.terminals["term-1"].data, "npm test\n");
        assert_eq!(snapshot.terminals["s1"].data, "x");
    }

    #[test]
    fn diff_update_replaces_previous() {
        let store = Arc::new(Store::new());
        let registry = HandlerRegistry::with_default_handlers(&store);
        registry.dispatch(Envelope::new(
            topics::DIFF_UPDATE,
            json!({ "session_id": "s1", "files": [{ "path": "a.rs", "additions": 3 }] }),
        ));
        registry.dispatch(Envelope::new(topics::DIFF_UPDATE, json!({ "session_id": "s1", "files": [] })));
        assert!(store.snapshot().diffs["s1"].files.is_empty());
    }

    #[test]
    fn pr_update_requires_task_id() {
        let store = Arc::new(Store::new());
        let registry = HandlerRegistry::with_default_handlers(&store);
        assert!(!registry.dispatch(Envelope::new(topics::GITHUB_TASK_PR_UPDATED, json!({ "pr_number": 4 }))));
        assert!(registry.dispatch(Envelope::new(
            topics::GITHUB_TASK_PR_UPDATED,
            json!({ "task_id": "t1", "pr_number": 4, "state": "open" }),
        )));
        assert_eq!(store.snapshot().task_prs["t1"].pr_number, Some(4));
    }
}
