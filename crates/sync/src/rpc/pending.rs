// Arena of in-flight correlated calls.
//
// Slots are reused through a free list; the index map is the only way in, so
// a stale correlation ID can never reach a recycled slot.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use taskdeck_common::protocol::envelope::CorrelationId;

use super::RequestError;

pub(crate) type Reply = oneshot::Sender<Result<Value, RequestError>>;

#[derive(Debug)]
struct Slot {
    id: CorrelationId,
    topic: String,
    reply: Reply,
}

#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<CorrelationId, usize>,
}

impl PendingCalls {
    pub(crate) fn insert(&mut self, id: CorrelationId, topic: &str, reply: Reply) {
        let slot = Slot { id, topic: topic.to_string(), reply };
        let position = match self.free.pop() {
            Some(position) => {
                self.slots[position] = Some(slot);
                position
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, position);
    }

    /// Remove the call for `id`, returning its topic and reply sender.
    pub(crate) fn take(&mut self, id: &CorrelationId) -> Option<(String, Reply)> {
        let position = self.index.remove(id)?;
        let slot = self.slots.get_mut(position)?.take()?;
        self.free.push(position);
        Some((slot.topic, slot.reply))
    }

    /// Remove every call, e.g. when the connection drops.
    pub(crate) fn drain(&mut self) -> Vec<(CorrelationId, String, Reply)> {
        self.index.clear();
        self.free.clear();
        self.slots
            .drain(..)
            .flatten()
            .map(|slot| (slot.id, slot.topic, slot.reply))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
