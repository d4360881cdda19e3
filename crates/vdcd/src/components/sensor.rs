//! Sensors: continuous measurements with hysteresis and push throttling.
//!
//! An update travels a fixed gauntlet before it reaches the controller:
//!
//! 1. Bounds check — out-of-range readings set the error state and stop.
//! 2. Resolution snap.
//! 3. Hysteresis gate (value space): changes smaller than the hysteresis
//!    refresh the timestamp but notify nobody.
//! 4. Subscriber callbacks.
//! 5. Push throttling (time space): `minPushInterval` bounds all pushes,
//!    `changesOnlyInterval` additionally bounds same-value pushes.
//!
//! Hysteresis and throttling compose: hysteresis may short-circuit earlier so
//! throttling never sees the update.

use crate::push::DevicePush;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sensor types from the protocol taxonomy; drivers use the raw tag.
pub mod sensor_type {
    pub const TEMPERATURE: u8 = 1;
    pub const HUMIDITY: u8 = 2;
    pub const ILLUMINATION: u8 = 3;
    pub const POWER: u8 = 14;
    pub const ENERGY: u8 = 16;
    pub const AIR_PRESSURE: u8 = 21;
}

/// Change subscriber. Receives `(sensor_index, value)`; `None` means the
/// sensor entered an error state. Errors are logged and never propagate.
pub type SensorCallback = Arc<dyn Fn(u8, Option<f64>) -> Result<(), String> + Send + Sync>;

pub struct Sensor {
    index: u8,
    name: String,
    sensor_type: u8,
    usage: u8,
    unit: String,
    min: f64,
    max: f64,
    resolution: f64,

    value: Option<f64>,
    last_update: Option<Instant>,
    error: Option<String>,

    hysteresis: f64,
    min_push_interval: Duration,
    changes_only_interval: Duration,

    last_notified: Option<f64>,
    last_pushed: Option<f64>,
    last_push_time: Option<Instant>,

    subscribers: Vec<SensorCallback>,
    push: DevicePush,
}

impl Sensor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        push: DevicePush,
        index: u8,
        name: impl Into<String>,
        sensor_type: u8,
        unit: impl Into<String>,
        min: f64,
        max: f64,
        resolution: f64,
    ) -> Self {
        Self {
            index,
            name: name.into(),
            sensor_type,
            usage: 0,
            unit: unit.into(),
            min,
            max,
            resolution,
            value: None,
            last_update: None,
            error: None,
            hysteresis: 0.0,
            min_push_interval: Duration::from_secs(2),
            changes_only_interval: Duration::ZERO,
            last_notified: None,
            last_pushed: None,
            last_push_time: None,
            subscribers: Vec::new(),
            push,
        }
    }

    pub fn with_usage(mut self, usage: u8) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_hysteresis(mut self, hysteresis: f64) -> Self {
        self.hysteresis = hysteresis;
        self
    }

    pub fn with_push_intervals(mut self, min_push: Duration, changes_only: Duration) -> Self {
        self.min_push_interval = min_push;
        self.changes_only_interval = changes_only;
        self
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sensor_type(&self) -> u8 {
        self.sensor_type
    }

    pub fn usage(&self) -> u8 {
        self.usage
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn hysteresis(&self) -> f64 {
        self.hysteresis
    }

    pub fn min_push_interval(&self) -> Duration {
        self.min_push_interval
    }

    pub fn changes_only_interval(&self) -> Duration {
        self.changes_only_interval
    }

    pub fn set_min_push_interval(&mut self, interval: Duration) {
        self.min_push_interval = interval;
    }

    pub fn set_changes_only_interval(&mut self, interval: Duration) {
        self.changes_only_interval = interval;
    }

    pub fn set_hysteresis(&mut self, hysteresis: f64) {
        self.hysteresis = hysteresis;
    }

    /// New measurement from hardware.
    pub fn update_value(&mut self, value: f64) {
        if value < self.min {
            warn!(sensor = self.index, value, min = self.min, "reading below minimum");
            self.error = Some(format!("Below minimum ({})", self.min));
            return;
        }
        if value > self.max {
            warn!(sensor = self.index, value, max = self.max, "reading above maximum");
            self.error = Some(format!("Above maximum ({})", self.max));
            return;
        }
        self.error = None;

        let snapped = if self.resolution > 0.0 {
            (value / self.resolution).round() * self.resolution
        } else {
            value
        };

        self.value = Some(snapped);
        self.last_update = Some(Instant::now());

        if let Some(previous) = self.last_notified {
            if (snapped - previous).abs() < self.hysteresis {
                debug!(sensor = self.index, snapped, "change within hysteresis");
                return;
            }
        }
        self.last_notified = Some(snapped);

        for callback in &self.subscribers {
            if let Err(e) = callback(self.index, Some(snapped)) {
                warn!(sensor = self.index, error = %e, "sensor callback failed");
            }
        }

        self.push_with_throttling(snapped);
    }

    /// Push a value through the two throttling gates.
    fn push_with_throttling(&mut self, value: f64) {
        let now = Instant::now();
        let since_last_push = self.last_push_time.map(|t| now.duration_since(t));
        let value_changed = self
            .last_pushed
            .map_or(true, |p| (value - p).abs() >= self.resolution);

        if let Some(since) = since_last_push {
            if since < self.min_push_interval {
                debug!(sensor = self.index, "push throttled by minPushInterval");
                return;
            }
            if !value_changed
                && self.changes_only_interval > Duration::ZERO
                && since < self.changes_only_interval
            {
                debug!(sensor = self.index, "same-value push throttled");
                return;
            }
        }

        self.push.push_sensor_value(self.index, value);
        self.last_push_time = Some(now);
        self.last_pushed = Some(value);
    }

    /// Enter the error state. The value becomes invisible until the next good
    /// reading; the error is pushed to the controller.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(sensor = self.index, error = %message, "sensor error");
        self.error = Some(message.clone());

        for callback in &self.subscribers {
            if let Err(e) = callback(self.index, None) {
                warn!(sensor = self.index, error = %e, "sensor callback failed");
            }
        }
        self.push.push_sensor_error(self.index, &message);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Current value, or `None` while errored or before the first reading.
    pub fn value(&self) -> Option<f64> {
        if self.error.is_some() {
            return None;
        }
        self.value
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Seconds since the last accepted reading.
    pub fn age(&self) -> Option<f64> {
        self.last_update.map(|t| t.elapsed().as_secs_f64())
    }

    pub fn on_change(&mut self, callback: SensorCallback) {
        self.subscribers.push(callback);
    }

    pub fn remove_callback(&mut self, callback: &SensorCallback) {
        self.subscribers.retain(|c| !Arc::ptr_eq(c, callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::PushSender;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;
    use tokio::sync::mpsc;
    use vdcproto::{DsUid, Envelope};

    fn sensor(
        min_push_ms: u64,
        changes_only_ms: u64,
    ) -> (Sensor, mpsc::UnboundedReceiver<Envelope>) {
        let sender = PushSender::new();
        let (tx, rx) = mpsc::unbounded_channel();
        sender.connect(tx);
        let push = DevicePush::new(DsUid::device("acme", "temp", 0), sender);
        let sensor = Sensor::new(push, 0, "temperature", sensor_type::TEMPERATURE, "°C", -40.0, 80.0, 0.1)
            .with_push_intervals(
                Duration::from_millis(min_push_ms),
                Duration::from_millis(changes_only_ms),
            );
        (sensor, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn first_reading_pushes() {
        let (mut sensor, mut rx) = sensor(0, 0);
        sensor.update_value(21.5);
        assert_eq!(sensor.value(), Some(21.5));
        assert_eq!(drain(&mut rx), 1);
    }

    #[test]
    fn out_of_bounds_sets_error_without_push() {
        let (mut sensor, mut rx) = sensor(0, 0);
        sensor.update_value(100.0);
        assert_eq!(sensor.value(), None);
        assert_eq!(sensor.error(), Some("Above maximum (80)"));
        assert_eq!(drain(&mut rx), 0);

        sensor.update_value(-50.0);
        assert_eq!(sensor.error(), Some("Below minimum (-40)"));

        // A good reading clears the error.
        sensor.update_value(20.0);
        assert!(sensor.error().is_none());
        assert_eq!(sensor.value(), Some(20.0));
    }

    #[test]
    fn hysteresis_gates_notification() {
        let (mut sensor, mut rx) = sensor(0, 0);
        sensor.set_hysteresis(0.5);

        sensor.update_value(20.0);
        assert_eq!(drain(&mut rx), 1);

        // 0.3 below hysteresis: value stored, nothing notified or pushed.
        sensor.update_value(20.3);
        assert_eq!(sensor.value(), Some(20.3));
        assert_eq!(drain(&mut rx), 0);

        // Crossing hysteresis relative to the last notified value (20.0).
        sensor.update_value(20.6);
        assert_eq!(drain(&mut rx), 1);
    }

    #[test]
    fn min_push_interval_throttles() {
        let (mut sensor, mut rx) = sensor(100, 0);

        sensor.update_value(20.0);
        assert_eq!(drain(&mut rx), 1);

        // Within the interval: dropped.
        sensor.update_value(21.0);
        assert_eq!(drain(&mut rx), 0);

        sleep(Duration::from_millis(120));
        sensor.update_value(22.0);
        assert_eq!(drain(&mut rx), 1);
    }

    #[test]
    fn changes_only_interval_throttles_same_value() {
        let (mut sensor, mut rx) = sensor(0, 200);

        sensor.update_value(20.0);
        assert_eq!(drain(&mut rx), 1);

        // Same value inside changesOnlyInterval: dropped.
        sensor.update_value(20.0);
        assert_eq!(drain(&mut rx), 0);

        // Different value passes immediately (minPushInterval is zero).
        sensor.update_value(25.0);
        assert_eq!(drain(&mut rx), 1);

        // Same value again, but after the interval.
        sleep(Duration::from_millis(220));
        sensor.update_value(25.0);
        assert_eq!(drain(&mut rx), 1);
    }

    #[test]
    fn error_state_pushes_and_hides_value() {
        let (mut sensor, mut rx) = sensor(0, 0);
        sensor.update_value(20.0);
        drain(&mut rx);

        sensor.set_error("bus failure");
        assert_eq!(sensor.value(), None);
        assert_eq!(drain(&mut rx), 1);
    }

    #[test]
    fn subscribers_run_behind_hysteresis() {
        let (mut sensor, _rx) = sensor(0, 0);
        sensor.set_hysteresis(1.0);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        sensor.on_change(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        sensor.update_value(20.0);
        sensor.update_value(20.4);
        sensor.update_value(21.5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn resolution_snaps_readings() {
        let (mut sensor, _rx) = sensor(0, 0);
        sensor.update_value(20.04);
        assert!((sensor.value().unwrap() - 20.0).abs() < 1e-9);
    }
}
