//! Button inputs: click mode and action mode.
//!
//! A button operates in exactly one of two disjoint modes chosen at
//! construction. Click mode reports a pressed/released `value` plus a
//! `clickType` from the protocol's click taxonomy; action mode reports a
//! direct scene call as `actionId`/`actionMode`. Calling the wrong method for
//! the configured mode logs a warning but still executes, which keeps a
//! misconfigured driver observable instead of mute. Description fields are
//! frozen after construction.

use crate::components::ComponentError;
use crate::push::DevicePush;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Click types per the protocol. 255 is the idle marker.
pub mod click_type {
    pub const TIP_1X: u8 = 0;
    pub const TIP_2X: u8 = 1;
    pub const TIP_3X: u8 = 2;
    pub const TIP_4X: u8 = 3;
    pub const HOLD_START: u8 = 4;
    pub const HOLD_REPEAT: u8 = 5;
    pub const HOLD_END: u8 = 6;
    pub const CLICK_1X: u8 = 7;
    pub const CLICK_2X: u8 = 8;
    pub const CLICK_3X: u8 = 9;
    pub const SHORT_LONG: u8 = 10;
    pub const LOCAL_OFF: u8 = 11;
    pub const LOCAL_ON: u8 = 12;
    pub const SHORT_SHORT_LONG: u8 = 13;
    pub const LOCAL_STOP: u8 = 14;
    pub const IDLE: u8 = 255;
}

/// Action modes for direct scene calls from a button.
pub mod action_mode {
    pub const NORMAL: u8 = 0;
    pub const FORCE: u8 = 1;
    pub const UNDO: u8 = 2;
}

/// Button error codes reported by hardware.
pub mod button_error {
    pub const OK: u8 = 0;
    pub const OPEN_CIRCUIT: u8 = 1;
    pub const SHORT_CIRCUIT: u8 = 2;
    pub const BUS_CONNECTION: u8 = 4;
    pub const LOW_BATTERY: u8 = 5;
    pub const DEVICE_ERROR: u8 = 6;
}

/// Operating mode, fixed at construction and persisted so it survives
/// restarts. Switching requires a full reconfigure of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonMode {
    #[default]
    Click,
    Action,
}

pub struct ButtonInput {
    // Description (frozen after construction)
    index: u8,
    name: String,
    button_type: u8,
    element: u8,
    mode: ButtonMode,

    // State
    value: Option<bool>,
    click: u8,
    action_id: Option<u64>,
    action_mode: u8,
    error: u8,
    last_update: Instant,

    push: DevicePush,
}

impl ButtonInput {
    pub fn new(push: DevicePush, index: u8, name: impl Into<String>, mode: ButtonMode) -> Self {
        Self {
            index,
            name: name.into(),
            button_type: 1,
            element: 0,
            mode,
            value: None,
            click: click_type::IDLE,
            action_id: None,
            action_mode: action_mode::NORMAL,
            error: button_error::OK,
            last_update: Instant::now(),
            push,
        }
    }

    pub fn with_physical(mut self, button_type: u8, element: u8) -> Self {
        self.button_type = button_type;
        self.element = element;
        self
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn button_type(&self) -> u8 {
        self.button_type
    }

    pub fn element(&self) -> u8 {
        self.element
    }

    pub fn mode(&self) -> ButtonMode {
        self.mode
    }

    /// Report a click event. Valid types are 0..=14 and 255; anything else is
    /// rejected without touching state. Always pushes.
    pub fn set_click_type(&mut self, click: u8) -> Result<(), ComponentError> {
        if self.mode == ButtonMode::Action {
            warn!(
                button = self.index,
                "button is configured for action mode but set_click_type was called"
            );
        }

        if click > click_type::LOCAL_STOP && click != click_type::IDLE {
            return Err(ComponentError::InvalidClickType(click));
        }

        self.action_id = None;
        self.action_mode = action_mode::NORMAL;
        self.click = click;
        self.last_update = Instant::now();

        info!(button = self.index, click, "button click");
        self.push.push_button_click(self.index, self.value, click);
        Ok(())
    }

    /// Report a direct scene call. Always pushes.
    pub fn set_action(&mut self, action_id: u64, mode: u8) -> Result<(), ComponentError> {
        if self.mode == ButtonMode::Click {
            warn!(
                button = self.index,
                "button is configured for click mode but set_action was called"
            );
        }

        if mode > action_mode::UNDO {
            return Err(ComponentError::InvalidActionMode(mode));
        }

        self.click = click_type::IDLE;
        self.value = None;
        self.action_id = Some(action_id);
        self.action_mode = mode;
        self.last_update = Instant::now();

        info!(button = self.index, action_id, mode, "button action");
        self.push.push_button_action(self.index, action_id, mode);
        Ok(())
    }

    /// Update pressed/released state. No push from this alone.
    pub fn set_value(&mut self, value: Option<bool>) {
        self.value = value;
        self.last_update = Instant::now();
        debug!(button = self.index, ?value, "button value");
    }

    /// Record a hardware error code.
    pub fn set_error(&mut self, error: u8) {
        self.error = error;
        if error != button_error::OK {
            warn!(button = self.index, error, "button error");
        }
    }

    pub fn click_type(&self) -> u8 {
        self.click
    }

    pub fn value(&self) -> Option<bool> {
        self.value
    }

    pub fn action(&self) -> Option<(u64, u8)> {
        self.action_id.map(|id| (id, self.action_mode))
    }

    pub fn error(&self) -> u8 {
        self.error
    }

    pub fn age(&self) -> f64 {
        self.last_update.elapsed().as_secs_f64()
    }
}
