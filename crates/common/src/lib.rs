// taskdeck-common: wire protocol and domain types shared by the taskdeck crates.

pub mod protocol;
pub mod types;
