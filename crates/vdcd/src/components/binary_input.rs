//! Binary inputs: two-state sensors like motion detectors and contacts.
//!
//! Inputs are event-driven by contract: every real state transition is pushed
//! to the controller unconditionally. An optional invert flag is applied to
//! writes coming from hardware, for normally-closed wiring.

use crate::push::DevicePush;
use std::time::Instant;
use tracing::{debug, info};

/// Binary input types from the protocol taxonomy; drivers use the raw tag.
pub mod input_type {
    pub const GENERIC: u8 = 0;
    pub const PRESENCE: u8 = 1;
    pub const LIGHT: u8 = 2;
    pub const PRESENCE_IN_DARKNESS: u8 = 3;
    pub const TWILIGHT: u8 = 4;
    pub const MOTION: u8 = 5;
    pub const RAIN: u8 = 8;
    pub const SMOKE: u8 = 9;
    pub const WINDOW_CONTACT: u8 = 10;
    pub const DOOR_CONTACT: u8 = 11;
}

pub struct BinaryInput {
    index: u8,
    name: String,
    input_type: u8,
    usage: u8,
    sensor_function: u8,
    invert: bool,
    state: bool,
    last_transition: Instant,
    push: DevicePush,
}

impl BinaryInput {
    pub fn new(push: DevicePush, index: u8, name: impl Into<String>, input_type: u8) -> Self {
        Self {
            index,
            name: name.into(),
            input_type,
            usage: 0,
            sensor_function: input_type,
            invert: false,
            state: false,
            last_transition: Instant::now(),
            push,
        }
    }

    pub fn with_usage(mut self, usage: u8) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_sensor_function(mut self, sensor_function: u8) -> Self {
        self.sensor_function = sensor_function;
        self
    }

    pub fn with_invert(mut self, invert: bool) -> Self {
        self.invert = invert;
        self
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_type(&self) -> u8 {
        self.input_type
    }

    pub fn usage(&self) -> u8 {
        self.usage
    }

    pub fn sensor_function(&self) -> u8 {
        self.sensor_function
    }

    pub fn invert(&self) -> bool {
        self.invert
    }

    /// Hardware write. Applies the invert flag; a no-op when the effective
    /// state is unchanged, otherwise updates and pushes. Returns whether a
    /// transition happened.
    pub fn set_state(&mut self, raw: bool) -> bool {
        let state = raw ^ self.invert;
        if state == self.state {
            debug!(input = self.index, state, "binary input unchanged");
            return false;
        }

        self.state = state;
        self.last_transition = Instant::now();
        info!(input = self.index, state, "binary input transition");

        self.push.push_binary_input(self.index, state);
        true
    }

    pub fn state(&self) -> bool {
        self.state
    }

    /// Seconds since the last transition.
    pub fn age(&self) -> f64 {
        self.last_transition.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::PushSender;
    use tokio::sync::mpsc;
    use vdcproto::{DsUid, Envelope};

    fn input(invert: bool) -> (BinaryInput, mpsc::UnboundedReceiver<Envelope>) {
        let sender = PushSender::new();
        let (tx, rx) = mpsc::unbounded_channel();
        sender.connect(tx);
        let push = DevicePush::new(DsUid::device("acme", "motion", 0), sender);
        let input = BinaryInput::new(push, 0, "motion", input_type::MOTION).with_invert(invert);
        (input, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn transition_pushes_unconditionally() {
        let (mut input, mut rx) = input(false);
        assert!(input.set_state(true));
        assert!(input.state());
        assert_eq!(drain(&mut rx), 1);

        assert!(input.set_state(false));
        assert_eq!(drain(&mut rx), 1);
    }

    #[test]
    fn no_change_no_push() {
        let (mut input, mut rx) = input(false);
        input.set_state(true);
        drain(&mut rx);

        assert!(!input.set_state(true));
        assert_eq!(drain(&mut rx), 0);
    }

    #[test]
    fn invert_applies_to_hardware_writes() {
        let (mut input, _rx) = input(true);
        input.set_state(false);
        assert!(input.state());

        input.set_state(true);
        assert!(!input.state());
    }

    #[test]
    fn inverted_initial_write_still_detects_change() {
        // Initial state is false; inverted write of `true` is effectively
        // false, so nothing should happen.
        let (mut input, mut rx) = input(true);
        assert!(!input.set_state(true));
        assert_eq!(drain(&mut rx), 0);
    }
}
