// Workspace catalog entities mirrored as created/updated/deleted triplets.

use taskdeck_common::protocol::events::{Crud, ExecutorEvent, SecretEvent};
use taskdeck_common::types::{Executor, Secret};

use super::{complete_entity, DomainHandler};
use crate::store::{AppState, SliceKey};

pub struct ExecutorHandler;

impl DomainHandler for ExecutorHandler {
    type Event = ExecutorEvent;
    const DOMAIN: &'static str = "executor";
    const SLICES: &'static [SliceKey] = &[SliceKey::Executors];

    fn apply(state: &mut AppState, event: ExecutorEvent) -> bool {
        match event {
            Crud::Created(executor) => state.add_executor(executor),
            Crud::Updated(patch) => {
                if state.executors.get(&patch.id).is_some() {
                    state.update_executor(&patch)
                } else {
                    complete_entity::<Executor>(&patch)
                        .is_some_and(|executor| state.add_executor(executor))
                }
            }
            Crud::Deleted(id) => state.remove_executor(&id),
        }
    }
}

pub struct SecretHandler;

impl DomainHandler for SecretHandler {
    type Event = SecretEvent;
    const DOMAIN: &'static str = "secrets";
    const SLICES: &'static [SliceKey] = &[SliceKey::Secrets];

    fn apply(state: &mut AppState, event: SecretEvent) -> bool {
        match event {
            Crud::Created(secret) => state.add_secret(secret),
            Crud::Updated(patch) => {
                if state.secrets.get(&patch.id).is_some() {
                    state.update_secret(&patch)
                } else {
                    complete_entity::<Secret>(&patch).is_some_and(|secret| state.add_secret(secret))
                }
            }
            Crud::Deleted(id) => state.remove_secret(&id),
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
    fn created_for_existing_id_replaces_wholesale() {
        let store = Arc::new(Store::new());
        let registry = HandlerRegistry::with_default_handlers(&store);
        registry.dispatch(Envelope::new(
            topics::SECRETS_CREATED,
            json!({ "id": "sec1", "name": "GITHUB_TOKEN", "scope": "repo" }),
        ));
        registry.dispatch(Envelope::new(topics::SECRETS_CREATED, json!({ "id": "sec1", "name": "GH_TOKEN" })));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.secrets.items.len(), 1);
        let secret = &snapshot.secrets.items[0];
        assert_eq!(secret.name.as_deref(), Some("GH_TOKEN"));
        assert!(!secret.extra.contains_key("scope"));
    }

    #[test]
    fn delete_removes_exact_match_only() {
        let store = Arc::new(Store::new());
        let registry = HandlerRegistry::with_default_handlers(&store);
        registry.dispatch(Envelope::new(topics::EXECUTOR_CREATED, json!({ "id": "e1" })));
        registry.dispatch(Envelope::new(topics::EXECUTOR_CREATED, json!({ "id": "e10" })));

        assert!(registry.dispatch(Envelope::new(topics::EXECUTOR_DELETED, json!({ "id": "e1" }))));
        assert!(!registry.dispatch(Envelope::new(topics::EXECUTOR_DELETED, json!({ "id": "e1" }))));

        let ids: Vec<_> = store.snapshot().executors.items.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["e10".to_string()]);
    }
}
