// Snapshot source backed by the backend's REST routes.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use taskdeck_common::types::{Executor, Secret, Task, UserSettings, Workflow, WorkflowStep};

use super::{FetchError, HydrationScope, HydrationSnapshot, SnapshotSource};
use crate::config::{ClientConfig, ConfigError, HydrationConfig};
use crate::store::{KanbanSlice, ListSlice, PartialState, SettingsSlice, SliceKey, WorkflowsSlice};

/// Slices with a REST representation.
const FETCHABLE: [SliceKey; 5] =
    [SliceKey::Workflows, SliceKey::Kanban, SliceKey::Executors, SliceKey::Secrets, SliceKey::Settings];

pub struct HttpSnapshotSource {
    http: reqwest::Client,
    base: Url,
    routes: HydrationConfig,
    timeout: Duration,
}

impl HttpSnapshotSource {
    pub fn new(base: Url, routes: HydrationConfig, timeout: Duration) -> Self {
        Self { http: reqwest::Client::new(), base, routes, timeout }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.backend()?, config.hydration.clone(), config.request_timeout()))
    }

    fn endpoint(&self, key: SliceKey, scope: &HydrationScope) -> Result<Url, FetchError> {
        let slice = key.as_str();
        let template = self.routes.route(key).ok_or(FetchError::NoRoute { slice })?;
        let path = expand_route(slice, template, scope)?;
        self.base
            .join(&path)
            .map_err(|error| FetchError::InvalidUrl { slice, reason: error.to_string() })
    }

    async fn get(&self, key: SliceKey, scope: &HydrationScope) -> Result<HydrationSnapshot, FetchError> {
        let slice = key.as_str();
        let url = self.endpoint(key, scope)?;
        debug!(slice, %url, "fetching snapshot");

        let response = self
            .http
            .get(url.as_str())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| FetchError::Request { slice, reason: error.to_string() })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { slice, status: status.as_u16() });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|error| FetchError::Request { slice, reason: error.to_string() })?;
        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|error| FetchError::Decode { slice, reason: error.to_string() })?;
        decode_slice(key, scope, body)
    }
}

impl SnapshotSource for HttpSnapshotSource {
    fn slices(&self) -> Vec<SliceKey> {
        FETCHABLE.into_iter().filter(|key| self.routes.route(*key).is_some()).collect()
    }

    fn fetch(
        &self,
        key: SliceKey,
        scope: &HydrationScope,
    ) -> impl Future<Output = Result<HydrationSnapshot, FetchError>> + Send {
        self.get(key, scope)
    }
}

/// Substitute `{workspace_id}` and `{workflow_id}` in a route template.
pub fn expand_route(
    slice: &'static str,
    template: &str,
    scope: &HydrationScope,
) -> Result<String, FetchError> {
    let mut path = template.to_string();
    for (placeholder, param, value) in [
        ("{workspace_id}", "workspace id", scope.workspace_id.as_deref()),
        ("{workflow_id}", "workflow id", scope.workflow_id.as_deref()),
    ] {
        if path.contains(placeholder) {
            let value = value.ok_or(FetchError::MissingScope { slice, param })?;
            path = path.replace(placeholder, value);
        }
    }
    Ok(path)
}

/// Turn one REST body into a snapshot carrying only `key`. Bodies may be
/// bare (`[...]`) or wrapped (`{ "executors": [...] }`).
pub fn decode_slice(
    key: SliceKey,
    scope: &HydrationScope,
    body: Value,
) -> Result<HydrationSnapshot, FetchError> {
    let slice = key.as_str();
    let mut snapshot = PartialState::default();
    match key {
        SliceKey::Workflows => {
            let items: Vec<Workflow> = decode(slice, unwrap_field(body, "workflows"))?;
            // The board is fetched for the scoped workflow, so select that one.
            let active_id = scope
                .workflow_id
                .as_ref()
                .filter(|id| items.iter().any(|workflow| &workflow.id == *id))
                .or_else(|| items.first().map(|workflow| &workflow.id))
                .cloned();
            snapshot.workflows = Some(WorkflowsSlice { items, active_id, loaded: true, loading: false });
        }
        SliceKey::Kanban => {
            let mut board = unwrap_field(body, "board");
            let steps: Vec<WorkflowStep> = decode(slice, take_field(&mut board, "steps"))?;
            let tasks: Vec<Task> = decode(slice, take_field(&mut board, "tasks"))?;
            let mut kanban = KanbanSlice {
                workflow_id: scope.workflow_id.clone(),
                steps,
                tasks: ListSlice::loaded(tasks),
            };
            kanban.sort_steps();
            snapshot.kanban = Some(kanban);
        }
        SliceKey::Executors => {
            let items: Vec<Executor> = decode(slice, unwrap_field(body, "executors"))?;
            snapshot.executors = Some(ListSlice::loaded(items));
        }
        SliceKey::Secrets => {
            let items: Vec<Secret> = decode(slice, unwrap_field(body, "secrets"))?;
            snapshot.secrets = Some(ListSlice::loaded(items));
        }
        SliceKey::Settings => {
            let value: UserSettings = decode(slice, unwrap_field(body, "settings"))?;
            snapshot.settings = Some(SettingsSlice { value: Some(value), loaded: true, loading: false });
        }
        _ => return Err(FetchError::NoRoute { slice }),
    }
    Ok(snapshot)
}

fn unwrap_field(body: Value, field: &str) -> Value {
    match body {
        Value::Object(mut fields) if fields.contains_key(field) => fields.remove(field).unwrap_or_default(),
        other => other,
    }
}

fn take_field(body: &mut Value, field: &str) -> Value {
    body.get_mut(field).map(Value::take).unwrap_or_else(|| Value::Array(Vec::new()))
}

fn decode<T: DeserializeOwned>(slice: &'static str, value: Value) -> Result<T, FetchError> {
    let value = if value.is_null() { Value::Array(Vec::new()) } else { value };
    serde_json::from_value(value).map_err(|error| FetchError::Decode { slice, reason: error.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> HydrationScope {
        HydrationScope { workspace_id: Some("ws1".into()), workflow_id: Some("w1".into()) }
    }

    #[test]
    fn route_placeholders_are_filled() {
        let path = expand_route("kanban", "/api/v1/workflows/{workflow_id}/board", &scope()).unwrap();
        assert_eq!(path, "/api/v1/workflows/w1/board");
    }

    #[test]
    fn missing_scope_is_an_error() {
        let error = expand_route(
            "workflows",
            "/api/v1/workspaces/{workspace_id}/workflows",
            &HydrationScope::default(),
        )
        .unwrap_err();
        assert!(matches!(error, FetchError::MissingScope { param: "workspace id", .. }));
    }

    #[test]
    fn wrapped_and_bare_lists_decode() {
        let wrapped = decode_slice(SliceKey::Executors, &scope(), json!({ "executors": [{ "id": "e1" }] }))
            .unwrap();
        let bare = decode_slice(SliceKey::Executors, &scope(), json!([{ "id": "e1" }])).unwrap();
        assert_eq!(wrapped, bare);
        assert_eq!(wrapped.keys(), [SliceKey::Executors]);
    }

    #[test]
    fn workflows_select_the_scoped_workflow() {
        let body = json!({
            "workflows": [
                { "id": "w0", "workspace_id": "ws1", "name": "Intake" },
                { "id": "w1", "workspace_id": "ws1", "name": "Delivery" }
            ]
        });
        let snapshot = decode_slice(SliceKey::Workflows, &scope(), body.clone()).unwrap();
        assert_eq!(snapshot.workflows.expect("workflows").active_id.as_deref(), Some("w1"));

        let unknown = HydrationScope { workflow_id: Some("gone".into()), ..scope() };
        let snapshot = decode_slice(SliceKey::Workflows, &unknown, body.clone()).unwrap();
        assert_eq!(snapshot.workflows.expect("workflows").active_id.as_deref(), Some("w0"));

        let unscoped = HydrationScope { workflow_id: None, ..scope() };
        let snapshot = decode_slice(SliceKey::Workflows, &unscoped, body).unwrap();
        assert_eq!(snapshot.workflows.expect("workflows").active_id.as_deref(), Some("w0"));

        let empty = decode_slice(SliceKey::Workflows, &scope(), json!([])).unwrap();
        assert_eq!(empty.workflows.expect("workflows").active_id, None);
    }

    #[test]
    fn board_is_scoped_to_workflow() {
        let snapshot = decode_slice(
            SliceKey::Kanban,
            &scope(),
            json!({
                "steps": [
                    { "id": "s2", "workflow_id": "w1", "position": 2 },
                    { "id": "s1", "workflow_id": "w1", "position": 1 }
                ],
                "tasks": [{ "id": "t1", "workflow_id": "w1" }]
            }),
        )
        .unwrap();
        let kanban = snapshot.kanban.expect("kanban slice");
        assert_eq!(kanban.workflow_id.as_deref(), Some("w1"));
        assert_eq!(kanban.steps[0].id, "s1");
        assert!(kanban.tasks.loaded);
    }

    #[test]
    fn slices_follow_configured_routes() {
        let mut routes = HydrationConfig::default();
        routes.routes.remove("secrets");
        let source = HttpSnapshotSource::new(
            Url::parse("http://127.0.0.1:8080").unwrap(),
            routes,
            Duration::from_secs(1),
        );
        assert!(!source.slices().contains(&SliceKey::Secrets));
        assert!(source.slices().contains(&SliceKey::Settings));
    }
}
