// Workflows of the active workspace, newest first.

use taskdeck_common::protocol::events::{Crud, WorkflowEvent};
use taskdeck_common::types::Workflow;

use super::{complete_entity, DomainHandler};
use crate::store::{AppState, SliceKey};

pub struct WorkflowHandler;

impl DomainHandler for WorkflowHandler {
    type Event = WorkflowEvent;
    const DOMAIN: &'static str = "workflow";
    const SLICES: &'static [SliceKey] = &[SliceKey::Workflows, SliceKey::Kanban];

    fn apply(state: &mut AppState, event: WorkflowEvent) -> bool {
        match event {
            Crud::Created(workflow) => state.add_workflow(workflow),
            Crud::Updated(patch) => {
                if state.workflows.get(&patch.id).is_some() {
                    state.update_workflow(&patch)
                } else {
                    complete_entity::<Workflow>(&patch)
                        .is_some_and(|workflow| state.add_workflow(workflow))
                }
            }
            Crud::Deleted(id) => state.remove_workflow(&id),
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

    fn created(id: &str) -> Envelope {
        Envelope::new(topics::WORKFLOW_CREATED, json!({ "id": id, "workspace_id": "ws-1", "name": id }))
    }

    #[test]
    fn deleting_active_workflow_repoints_selection() {
        let store = Arc::new(Store::new());
        let registry = HandlerRegistry::with_default_handlers(&store);
        store.switch_workspace(Some("ws-1".into()));

        registry.dispatch(created("w1"));
        registry.dispatch(created("w2"));
        store.mutate(|state| state.set_active_workflow(Some("w2".into())));

        assert!(registry.dispatch(Envelope::new(topics::WORKFLOW_DELETED, json!({ "id": "w2" }))));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.workflows.active_id.as_deref(), Some("w1"));
        assert_eq!(snapshot.kanban.workflow_id.as_deref(), Some("w1"));

        registry.dispatch(Envelope::new(topics::WORKFLOW_DELETED, json!({ "id": "w1" })));
        assert_eq!(store.snapshot().workflows.active_id, None);
    }

    #[test]
    fn other_workspace_is_ignored() {
        let store = Arc::new(Store::new());
        let registry = HandlerRegistry::with_default_handlers(&store);
        store.switch_workspace(Some("ws-2".into()));
        assert!(!registry.dispatch(created("w1")));
        assert!(store.snapshot().workflows.items.is_empty());
    }

    #[test]
    fn rename_preserves_other_fields() {
        let store = Arc::new(Store::new());
        let registry = HandlerRegistry::with_default_handlers(&store);
        registry.dispatch(Envelope::new(
            topics::WORKFLOW_CREATED,
            json!({ "id": "w1", "workspace_id": "ws-1", "name": "Dev", "description": "main flow" }),
        ));
        registry.dispatch(Envelope::new(topics::WORKFLOW_UPDATED, json!({ "id": "w1", "name": "Delivery" })));

        let snapshot = store.snapshot();
        let workflow = snapshot.workflows.get("w1").expect("workflow should exist");
        assert_eq!(workflow.name, "Delivery");
        assert_eq!(workflow.description.as_deref(), Some("main flow"));
    }
}
