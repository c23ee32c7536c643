// taskdeck-sync library entry point: realtime state sync for the taskdeck dashboard.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod hydration;
pub mod rpc;
pub mod runtime;
pub mod store;

pub use config::ClientConfig;
pub use runtime::{SyncClient, SyncSession};
pub use store::{AppState, Store};
