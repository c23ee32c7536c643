// Typed task-plan calls over the request channel.
//
// Every answer is written to the store's `plans` slice; a task without a
// plan is recorded as `None`, never as an empty plan.

use serde::Serialize;
use serde_json::{json, Value};

use taskdeck_common::protocol::topics;
use taskdeck_common::types::Plan;

use super::{RequestChannel, RequestError};
use crate::store::Store;

/// Fields a caller may set when creating or updating a plan.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PlanDraft {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
}

pub async fn get_task_plan(
    channel: &RequestChannel,
    store: &Store,
    task_id: &str,
) -> Result<Option<Plan>, RequestError> {
    store.mutate(|state| state.set_plan_loading(task_id, true));
    let result = channel.request(topics::TASK_PLAN_GET, json!({ "task_id": task_id })).await;
    settle(store, task_id, topics::TASK_PLAN_GET, result)
}

pub async fn create_task_plan(
    channel: &RequestChannel,
    store: &Store,
    task_id: &str,
    draft: &PlanDraft,
) -> Result<Option<Plan>, RequestError> {
    let result = channel.request(topics::TASK_PLAN_CREATE, with_task(task_id, draft)?).await;
    settle(store, task_id, topics::TASK_PLAN_CREATE, result)
}

pub async fn update_task_plan(
    channel: &RequestChannel,
    store: &Store,
    task_id: &str,
    draft: &PlanDraft,
) -> Result<Option<Plan>, RequestError> {
    let result = channel.request(topics::TASK_PLAN_UPDATE, with_task(task_id, draft)?).await;
    settle(store, task_id, topics::TASK_PLAN_UPDATE, result)
}

pub async fn delete_task_plan(
    channel: &RequestChannel,
    store: &Store,
    task_id: &str,
) -> Result<(), RequestError> {
    channel.request(topics::TASK_PLAN_DELETE, json!({ "task_id": task_id })).await?;
    store.mutate(|state| state.set_plan(task_id, None));
    Ok(())
}

fn with_task(task_id: &str, draft: &PlanDraft) -> Result<Value, RequestError> {
    let mut payload = serde_json::to_value(draft).map_err(RequestError::Encode)?;
    if let Value::Object(fields) = &mut payload {
        fields.insert("task_id".into(), Value::String(task_id.to_string()));
    }
    Ok(payload)
}

/// Record the outcome in the store. On failure the loading flag is cleared
/// and any plan already known is kept.
fn settle(
    store: &Store,
    task_id: &str,
    topic: &str,
    result: Result<Value, RequestError>,
) -> Result<Option<Plan>, RequestError> {
    let plan = result.and_then(|value| decode_plan(task_id, topic, value));
    match &plan {
        Ok(plan) => store.mutate(|state| state.set_plan(task_id, plan.clone())),
        Err(_) => store.mutate(|state| state.set_plan_loading(task_id, false)),
    };
    plan
}

/// `null` or `{}` means the task has no plan.
pub fn decode_plan(task_id: &str, topic: &str, value: Value) -> Result<Option<Plan>, RequestError> {
    let mut fields = match value {
        Value::Null => return Ok(None),
        Value::Object(fields) if fields.is_empty() => return Ok(None),
        Value::Object(fields) => fields,
        other => {
            return Err(RequestError::Decode {
                topic: topic.to_string(),
                reason: format!("expected a plan object, got {other}"),
            })
        }
    };
    // Some backends wrap the plan: `{ "plan": {...} }`.
    if let Some(inner) = fields.remove("plan") {
        if fields.is_empty() {
            return decode_plan(task_id, topic, inner);
        }
        fields.insert("plan".into(), inner);
    }
    fields.entry("task_id").or_insert_with(|| Value::String(task_id.to_string()));
    serde_json::from_value(Value::Object(fields))
        .map(Some)
        .map_err(|error| RequestError::Decode { topic: topic.to_string(), reason: error.to_string() })
}
