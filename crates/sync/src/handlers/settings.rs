use taskdeck_common::protocol::events::SettingsEvent;

use super::DomainHandler;
use crate::store::{AppState, SliceKey};

pub struct SettingsHandler;

impl DomainHandler for SettingsHandler {
    type Event = SettingsEvent;
    const DOMAIN: &'static str = "user.settings";
    const SLICES: &'static [SliceKey] = &[SliceKey::Settings];

    fn apply(state: &mut AppState, event: SettingsEvent) -> bool {
        match event {
            SettingsEvent::Updated(settings) => state.set_settings(settings),
        }
    }
}
