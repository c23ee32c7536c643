// Kanban tasks of the active board.

use taskdeck_common::protocol::events::{Crud, TaskEvent};
use taskdeck_common::types::Task;

use super::{complete_entity, DomainHandler};
use crate::store::{AppState, SliceKey};

pub struct TaskHandler;

impl DomainHandler for TaskHandler {
    type Event = TaskEvent;
    const DOMAIN: &'static str = "task";
    const SLICES: &'static [SliceKey] = &[SliceKey::Kanban, SliceKey::Plans, SliceKey::TaskPrs];

    fn apply(state: &mut AppState, event: TaskEvent) -> bool {
        match event {
            Crud::Created(task) => state.add_task(task),
            Crud::Updated(patch) => {
                if state.kanban.tasks.get(&patch.id).is_some() {
                    state.update_task(&patch)
                } else {
                    complete_entity::<Task>(&patch).is_some_and(|task| state.add_task(task))
                }
            }
            Crud::Deleted(id) => state.remove_task(&id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use taskdeck_common::protocol::envelope::Envelope;
    use taskdeck_common::protocol::topics;
    use taskdeck_common::types::TaskState;

    use crate::handlers::HandlerRegistry;
    use crate::store::Store;

    #[test]
    fn task_lifecycle_on_active_board() {
        let store = Arc::new(Store::new());
        let registry = HandlerRegistry::with_default_handlers(&store);
        store.mutate(|state| state.set_kanban("w1".into(), Vec::new(), Vec::new()));

        registry.dispatch(Envelope::new(
            topics::TASK_CREATED,
            json!({ "id": "t1", "workflow_id": "w1", "title": "Fix login" }),
        ));
        registry.dispatch(Envelope::new(
            topics::TASK_CREATED,
            json!({ "id": "t2", "workflow_id": "w2", "title": "Elsewhere" }),
        ));
        registry.dispatch(Envelope::new(
            topics::TASK_UPDATED,
            json!({ "id": "t1", "state": "IN_PROGRESS" }),
        ));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.kanban.tasks.items.len(), 1);
        let task = snapshot.kanban.tasks.get("t1").expect("task should exist");
        assert_eq!(task.state, TaskState::InProgress);
        assert_eq!(task.title, "Fix login");

        assert!(registry.dispatch(Envelope::new(topics::TASK_DELETED, json!({ "id": "t1" }))));
        assert!(store.snapshot().kanban.tasks.items.is_empty());
    }

    #[test]
    fn update_for_unknown_task_inserts_when_complete() {
        let store = Arc::new(Store::new());
        let registry = HandlerRegistry::with_default_handlers(&store);
        assert!(registry.dispatch(Envelope::new(
            topics::TASK_UPDATED,
            json!({ "id": "t9", "title": "Late arrival" }),
        )));
        assert!(store.snapshot().kanban.tasks.get("t9").is_some());
    }
}
