// Request/response channel multiplexed over the sync socket.
//
// A call is sent as `{ type, payload, correlation_id }` and settles exactly
// once: with the matching response, a timeout, or connection loss. Calls made
// while no link is open fail immediately; they are never queued.

mod pending;
pub mod plans;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use taskdeck_common::protocol::envelope::{CorrelatedRequest, CorrelationId, Response, WireError};

use pending::PendingCalls;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("not connected")]
    NotConnected,

    #[error("request `{topic}` timed out after {after:?}")]
    Timeout { topic: String, after: Duration },

    #[error("connection lost before `{topic}` was answered")]
    ConnectionLost { topic: String },

    #[error("server rejected request: {}", .0.message)]
    Server(WireError),

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unexpected response to `{topic}`: {reason}")]
    Decode { topic: String, reason: String },
}

pub struct RequestChannel {
    pending: Mutex<PendingCalls>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    timeout: Duration,
}

impl Default for RequestChannel {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RequestChannel {
    pub fn new(timeout: Duration) -> Self {
        Self { pending: Mutex::new(PendingCalls::default()), writer: Mutex::new(None), timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.writer).as_ref().is_some_and(|writer| !writer.is_closed())
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Route outgoing calls through a freshly opened link.
    pub(crate) fn attach(&self, writer: mpsc::UnboundedSender<String>) {
        *lock(&self.writer) = Some(writer);
    }

    /// Forget the link and reject every call still waiting on it.
    pub(crate) fn detach(&self) {
        lock(&self.writer).take();
        let drained = lock(&self.pending).drain();
        if !drained.is_empty() {
            debug!(count = drained.len(), "rejecting in-flight requests after connection loss");
        }
        for (_, topic, reply) in drained {
            let _ = reply.send(Err(RequestError::ConnectionLost { topic }));
        }
    }

    /// Send `topic` with `payload` and wait for the matching response.
    pub async fn request(&self, topic: &str, payload: Value) -> Result<Value, RequestError> {
        let writer = lock(&self.writer).clone().ok_or(RequestError::NotConnected)?;

        let correlation_id = CorrelationId::new();
        let frame = serde_json::to_string(&CorrelatedRequest {
            topic: topic.to_string(),
            payload,
            correlation_id,
        })
        .map_err(RequestError::Encode)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(correlation_id, topic, reply_tx);
        let _guard = PendingGuard { channel: self, id: correlation_id };

        if writer.send(frame).is_err() {
            return Err(RequestError::NotConnected);
        }
        debug!(%correlation_id, topic, "request sent");

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RequestError::ConnectionLost { topic: topic.to_string() }),
            Err(_) => {
                warn!(%correlation_id, topic, "request timed out");
                Err(RequestError::Timeout { topic: topic.to_string(), after: self.timeout })
            }
        }
    }

    /// Settle the pending call matching `response`. Responses for unknown or
    /// expired correlation IDs are ignored. Returns whether one matched.
    pub(crate) fn resolve(&self, response: Response) -> bool {
        let Some(id) = CorrelationId::parse(&response.correlation_id) else {
            debug!(correlation_id = %response.correlation_id, "ignoring response with foreign correlation id");
            return false;
        };
        let Some((_, reply)) = lock(&self.pending).take(&id) else {
            debug!(%id, topic = %response.topic, "ignoring response for unknown or expired request");
            return false;
        };
        let _ = reply.send(response.outcome.map_err(RequestError::Server));
        true
    }
}

/// Removes a call's slot when its future finishes or is dropped.
struct PendingGuard<'a> {
    channel: &'a RequestChannel,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.channel.pending).take(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sent_id(frame: &str) -> String {
        let value: Value = serde_json::from_str(frame).expect("request frame should be json");
        value["correlation_id"].as_str().expect("correlation id").to_string()
    }

    #[tokio::test]
    async fn rejects_immediately_without_link() {
        let channel = RequestChannel::default();
        let error = channel.request("task.plan.get", json!({ "task_id": "t1" })).await;
        assert!(matches!(error, Err(RequestError::NotConnected)));
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn resolves_matching_response() {
        let channel = RequestChannel::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.attach(tx);

        let call = channel.request("task.plan.get", json!({ "task_id": "t1" }));
        let answer = async {
            let frame = rx.recv().await.expect("request should be written");
            let id = sent_id(&frame);
            assert!(channel.resolve(Response {
                topic: "task.plan.get".into(),
                correlation_id: id,
                outcome: Ok(json!({ "content": "plan" })),
            }));
        };
        let (result, ()) = tokio::join!(call, answer);
        assert_eq!(result.expect("call should succeed")["content"], "plan");
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn server_error_rejects_call() {
        let channel = RequestChannel::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.attach(tx);

        let call = channel.request("task.plan.create", json!({ "task_id": "t1" }));
        let answer = async {
            let frame = rx.recv().await.expect("request should be written");
            channel.resolve(Response {
                topic: "task.plan.create".into(),
                correlation_id: sent_id(&frame),
                outcome: Err(WireError { code: "NOT_FOUND".into(), message: "no task".into() }),
            });
        };
        let (result, ()) = tokio::join!(call, answer);
        match result {
            Err(RequestError::Server(error)) => assert_eq!(error.message, "no task"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_frees_slot() {
        let channel = RequestChannel::new(Duration::from_millis(100));
        let (tx, _rx) = mpsc::unbounded_channel();
        channel.attach(tx);

        let result = channel.request("task.plan.get", json!({ "task_id": "t1" })).await;
        assert!(matches!(result, Err(RequestError::Timeout { .. })));
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn detach_rejects_in_flight_calls() {
        let channel = RequestChannel::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.attach(tx);

        let call = channel.request("task.plan.get", json!({ "task_id": "t1" }));
        let drop_link = async {
            rx.recv().await.expect("request should be written");
            channel.detach();
        };
        let (result, ()) = tokio::join!(call, drop_link);
        assert!(matches!(result, Err(RequestError::ConnectionLost { .. })));
        assert!(!channel.is_connected());
    }

    #[test]
    fn unknown_correlation_is_ignored() {
        let channel = RequestChannel::default();
        assert!(!channel.resolve(Response {
            topic: "task.plan.get".into(),
            correlation_id: CorrelationId::new().to_string(),
            outcome: Ok(Value::Null),
        }));
        assert!(!channel.resolve(Response {
            topic: "task.plan.get".into(),
            correlation_id: "not-a-uuid".into(),
            outcome: Ok(Value::Null),
        }));
    }
}
