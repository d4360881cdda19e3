//! A single controllable output channel.
//!
//! The channel is the meeting point of the two sync directions:
//!
//! - [`OutputChannel::set_value`] is the controller→hardware path. It snaps
//!   the value and fans it out to the subscribed hardware callbacks, but does
//!   NOT push back to the controller — the controller issued the write, it
//!   already knows.
//! - [`OutputChannel::update_value`] is the hardware→controller path, called
//!   after a confirmed or observed hardware change. It pushes on every actual
//!   change, completing the bidirectional sync loop.

use crate::push::DevicePush;
use crate::scenes::SceneEffect;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Channel types from the protocol's channel taxonomy. Only the ones the
/// daemon itself needs by name; drivers use the raw tag.
pub mod channel_type {
    pub const DEFAULT: u8 = 0;
    pub const BRIGHTNESS: u8 = 1;
    pub const HUE: u8 = 2;
    pub const SATURATION: u8 = 3;
    pub const COLOR_TEMP: u8 = 4;
    pub const SHADE_POSITION_OUTSIDE: u8 = 11;
    pub const HEATING_POWER: u8 = 21;
    pub const AUDIO_VOLUME: u8 = 41;
}

/// Hardware-side subscriber. Receives `(channel_type, snapped_value)`; errors
/// are logged at the invocation site and never propagate into the engine.
pub type HardwareCallback = Arc<dyn Fn(u8, f64) -> Result<(), String> + Send + Sync>;

/// An in-flight transition toward a target value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub target: f64,
    pub effect: SceneEffect,
    pub duration: Option<f64>,
}

pub struct OutputChannel {
    channel_type: u8,
    ds_index: u8,
    name: String,
    min: f64,
    max: f64,
    resolution: f64,
    value: f64,
    last_update: Instant,
    transition: Option<Transition>,
    subscribers: Vec<HardwareCallback>,
    groups: Vec<u8>,
    push: DevicePush,
}

impl OutputChannel {
    pub fn new(
        push: DevicePush,
        channel_type: u8,
        ds_index: u8,
        min: f64,
        max: f64,
        resolution: f64,
        initial: Option<f64>,
    ) -> Self {
        Self {
            channel_type,
            ds_index,
            name: format!("channel {channel_type}"),
            min,
            max,
            resolution,
            value: initial.unwrap_or(min),
            last_update: Instant::now(),
            transition: None,
            subscribers: Vec::new(),
            groups: Vec::new(),
            push,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn channel_type(&self) -> u8 {
        self.channel_type
    }

    pub fn ds_index(&self) -> u8 {
        self.ds_index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn groups(&self) -> &[u8] {
        &self.groups
    }

    pub fn set_groups(&mut self, groups: Vec<u8>) {
        self.groups = groups;
    }

    /// Clamp to `[min, max]` and snap to the resolution grid anchored at
    /// `min`, so every reachable value is `min + k * resolution`.
    fn normalize(&self, value: f64) -> f64 {
        let clamped = value.clamp(self.min, self.max);
        if self.resolution <= 0.0 {
            return clamped;
        }
        let snapped = self.min + ((clamped - self.min) / self.resolution).round() * self.resolution;
        snapped.clamp(self.min, self.max)
    }

    /// Controller→hardware write. Snaps, updates state, invokes hardware
    /// subscribers. Never pushes to the controller.
    pub fn set_value(&mut self, value: f64, effect: SceneEffect, transition_time: Option<f64>) {
        let snapped = self.normalize(value);
        if snapped != value {
            debug!(
                channel = self.channel_type,
                requested = value,
                snapped,
                "value normalized to channel grid"
            );
        }

        if snapped == self.value && self.transition.is_none() {
            return;
        }

        self.value = snapped;
        self.last_update = Instant::now();

        if effect != SceneEffect::None || transition_time.is_some() {
            self.transition = Some(Transition {
                target: snapped,
                effect,
                duration: transition_time,
            });
        }

        for callback in &self.subscribers {
            if let Err(e) = callback(self.channel_type, snapped) {
                warn!(
                    channel = self.channel_type,
                    error = %e,
                    "hardware callback failed"
                );
            }
        }
    }

    /// Hardware→controller update. Snaps; on an actual change updates state
    /// and pushes; on no change only refreshes the timestamp.
    pub fn update_value(&mut self, value: f64) {
        let snapped = self.normalize(value);

        if snapped != self.value {
            let old = self.value;
            self.value = snapped;

            if let Some(t) = self.transition {
                if snapped == t.target {
                    self.transition = None;
                }
            }

            debug!(
                channel = self.channel_type,
                old, new = snapped,
                "hardware confirmed value change"
            );
            self.push.push_channel_state(self.channel_type, snapped);
        }

        self.last_update = Instant::now();
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Seconds since the last value update.
    pub fn age(&self) -> f64 {
        self.last_update.elapsed().as_secs_f64()
    }

    pub fn transition(&self) -> Option<&Transition> {
        self.transition.as_ref()
    }

    pub fn subscribe(&mut self, callback: HardwareCallback) {
        self.subscribers.push(callback);
    }

    pub fn unsubscribe(&mut self, callback: &HardwareCallback) {
        self.subscribers.retain(|c| !Arc::ptr_eq(c, callback));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::PushSender;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use vdcproto::{DsUid, Envelope};

    fn channel_with_rx() -> (OutputChannel, mpsc::UnboundedReceiver<Envelope>) {
        let sender = PushSender::new();
        let (tx, rx) = mpsc::unbounded_channel();
        sender.connect(tx);
        let push = DevicePush::new(DsUid::device("acme", "lamp", 0), sender);
        let channel = OutputChannel::new(push, channel_type::BRIGHTNESS, 0, 0.0, 100.0, 0.1, None);
        (channel, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn set_value_clamps_and_snaps() {
        let (mut channel, _rx) = channel_with_rx();
        channel.set_value(150.0, SceneEffect::None, None);
        assert_eq!(channel.value(), 100.0);

        channel.set_value(-5.0, SceneEffect::None, None);
        assert_eq!(channel.value(), 0.0);

        channel.set_value(50.04, SceneEffect::None, None);
        assert!((channel.value() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn values_stay_on_resolution_grid() {
        let sender = PushSender::new();
        let push = DevicePush::new(DsUid::device("acme", "blind", 0), sender);
        let mut channel = OutputChannel::new(push, channel_type::SHADE_POSITION_OUTSIDE, 0, 10.0, 90.0, 0.5, None);

        for raw in [10.3, 33.33, 89.9, 200.0, -3.0] {
            channel.set_value(raw, SceneEffect::None, None);
            let v = channel.value();
            assert!((10.0..=90.0).contains(&v), "{v} outside range");
            let steps = (v - 10.0) / 0.5;
            assert!((steps - steps.round()).abs() < 1e-9, "{v} off grid");
        }
    }

    #[test]
    fn set_value_invokes_hardware_but_never_pushes() {
        let (mut channel, mut rx) = channel_with_rx();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        channel.subscribe(Arc::new(move |channel_type, value| {
            assert_eq!(channel_type, channel_type::BRIGHTNESS);
            assert_eq!(value, 50.0);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        channel.set_value(50.0, SceneEffect::None, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut rx), 0);
    }

    #[test]
    fn update_value_pushes_on_change_only() {
        let (mut channel, mut rx) = channel_with_rx();
        channel.set_value(50.0, SceneEffect::None, None);
        drain(&mut rx);

        channel.update_value(75.0);
        assert_eq!(channel.value(), 75.0);
        assert_eq!(drain(&mut rx), 1);

        // Unchanged value refreshes the timestamp but does not push.
        channel.update_value(75.0);
        assert_eq!(drain(&mut rx), 0);
        assert!(channel.age() < 1.0);
    }

    #[test]
    fn update_value_does_not_invoke_hardware() {
        let (mut channel, _rx) = channel_with_rx();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        channel.subscribe(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        channel.update_value(30.0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn redundant_set_value_is_silent() {
        let (mut channel, _rx) = channel_with_rx();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        channel.subscribe(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        channel.set_value(40.0, SceneEffect::None, None);
        channel.set_value(40.0, SceneEffect::None, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_callback() {
        let (mut channel, _rx) = channel_with_rx();
        let callback: HardwareCallback = Arc::new(|_, _| Ok(()));
        channel.subscribe(callback.clone());
        assert_eq!(channel.subscriber_count(), 1);
        channel.unsubscribe(&callback);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn failing_hardware_callback_does_not_propagate() {
        let (mut channel, _rx) = channel_with_rx();
        channel.subscribe(Arc::new(|_, _| Err("driver offline".into())));
        // Must not panic; error is logged and swallowed.
        channel.set_value(10.0, SceneEffect::None, None);
        assert_eq!(channel.value(), 10.0);
    }

    #[test]
    fn transition_clears_when_target_reached() {
        let (mut channel, _rx) = channel_with_rx();
        channel.set_value(80.0, SceneEffect::Smooth, Some(2.0));
        assert!(channel.transition().is_some());

        channel.update_value(79.0);
        assert!(channel.transition().is_some());
        channel.update_value(80.0);
        assert!(channel.transition().is_none());
    }
}
