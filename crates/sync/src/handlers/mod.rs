// Handler registry: one dispatch table from broadcast topic to store mutation.
//
// Each domain module contributes `DomainHandler`s. Payloads are parsed into
// the domain's closed event enum before anything touches the store, so a
// malformed or incomplete envelope is dropped without side effects.

mod catalog;
mod environment;
mod sessions;
mod settings;
mod tasks;
mod workflows;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

use taskdeck_common::protocol::envelope::Envelope;
use taskdeck_common::protocol::events::{DomainEvent, Patch, PayloadError};

use crate::store::{AppState, SliceKey, Store};

pub use catalog::{ExecutorHandler, SecretHandler};
pub use environment::{DiffHandler, GithubHandler, TerminalHandler};
pub use sessions::{AgentSessionHandler, MessageHandler, ShellHandler, TurnHandler};
pub use settings::SettingsHandler;
pub use tasks::TaskHandler;
pub use workflows::WorkflowHandler;

/// A domain's mapping from typed events to store mutations.
pub trait DomainHandler: 'static {
    type Event: DomainEvent;

    /// Name used in logs.
    const DOMAIN: &'static str;

    /// Slices this handler writes; marked live-touched after a change.
    const SLICES: &'static [SliceKey];

    /// Apply one event. Returns whether the state changed.
    fn apply(state: &mut AppState, event: Self::Event) -> bool;
}

type DispatchFn = Box<dyn Fn(&Store, &str, Value) -> Result<bool, PayloadError> + Send + Sync>;

struct Route {
    domain: &'static str,
    dispatch: DispatchFn,
}

pub struct HandlerRegistry {
    store: Weak<Store>,
    routes: HashMap<&'static str, Route>,
}

impl HandlerRegistry {
    /// Empty registry bound to `store`. Holds only a weak reference: once the
    /// store is dropped every dispatch is a no-op.
    pub fn new(store: &Arc<Store>) -> Self {
        Self { store: Arc::downgrade(store), routes: HashMap::new() }
    }

    /// Registry with every built-in domain registered.
    pub fn with_default_handlers(store: &Arc<Store>) -> Self {
        let mut registry = Self::new(store);
        registry
            .register::<AgentSessionHandler>()
            .register::<TaskHandler>()
            .register::<MessageHandler>()
            .register::<TurnHandler>()
            .register::<ShellHandler>()
            .register::<WorkflowHandler>()
            .register::<ExecutorHandler>()
            .register::<SecretHandler>()
            .register::<SettingsHandler>()
            .register::<DiffHandler>()
            .register::<TerminalHandler>()
            .register::<GithubHandler>();
        registry
    }

    /// Add `H`'s topics to the table. A topic that is already routed keeps
    /// its first handler; the duplicate is logged and ignored.
    pub fn register<H: DomainHandler>(&mut self) -> &mut Self {
        for &topic in <H::Event as DomainEvent>::TOPICS {
            if let Some(existing) = self.routes.get(topic) {
                warn!(topic, domain = H::DOMAIN, existing = existing.domain, "duplicate handler registration ignored");
                continue;
            }
            let dispatch: DispatchFn = Box::new(|store: &Store, topic: &str, payload: Value| {
                let event = <H::Event as DomainEvent>::parse(topic, payload)?;
                Ok(store.mutate_live(H::SLICES, |state| H::apply(state, event)))
            });
            self.routes.insert(topic, Route { domain: H::DOMAIN, dispatch });
        }
        self
    }

    pub fn handles(&self, topic: &str) -> bool {
        self.routes.contains_key(topic)
    }

    pub fn topics(&self) -> Vec<&'static str> {
        let mut topics: Vec<_> = self.routes.keys().copied().collect();
        topics.sort_unstable();
        topics
    }

    /// Route one broadcast. Returns whether the store changed.
    pub fn dispatch(&self, envelope: Envelope) -> bool {
        let Some(route) = self.routes.get(envelope.topic.as_str()) else {
            trace!(topic = %envelope.topic, "no handler for topic, dropping");
            return false;
        };
        let Some(store) = self.store.upgrade() else {
            trace!(topic = %envelope.topic, "store dropped, ignoring envelope");
            return false;
        };
        match (route.dispatch)(&store, &envelope.topic, envelope.payload) {
            Ok(changed) => changed,
            Err(error) => {
                debug!(topic = %envelope.topic, domain = route.domain, %error, "dropping invalid payload");
                false
            }
        }
    }
}

/// Decode an `*.updated` patch as a whole entity, for updates that arrive
/// before the entity is known. `None` when the payload is not complete.
pub(crate) fn complete_entity<T: DeserializeOwned>(patch: &Patch) -> Option<T> {
    let mut fields = patch.fields.clone();
    fields.insert("id".into(), Value::String(patch.id.clone()));
    serde_json::from_value(Value::Object(fields)).ok()
}
