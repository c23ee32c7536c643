// Wire protocol: envelopes, topic names and typed domain events.

pub mod envelope;
pub mod events;
pub mod topics;
