//! Output container: the device-facing bundle of output channels.
//!
//! The container owns the channels and gates incoming writes by its mode:
//! `disabled` rejects, `binary` snaps to {0, max}, `gradual`/`default` accept
//! real values. It also carries the `pushChanges` switch that decides whether
//! controller-initiated writes are echoed back as pushes, and delegates
//! dimming to the hardware layer — the container tracks the fact of dimming
//! but never drives a value-stepping timer itself.

use crate::components::output_channel::OutputChannel;
use crate::push::DevicePush;
use crate::scenes::{ChannelValues, SceneEffect, SceneMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Output operating mode, gating incoming writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Disabled,
    Binary,
    Gradual,
    #[default]
    Default,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Disabled => "disabled",
            OutputMode::Binary => "binary",
            OutputMode::Gradual => "gradual",
            OutputMode::Default => "default",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(OutputMode::Disabled),
            "binary" => Some(OutputMode::Binary),
            "gradual" => Some(OutputMode::Gradual),
            "default" => Some(OutputMode::Default),
            _ => None,
        }
    }
}

/// Functional class of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFunction {
    Switch,
    #[default]
    Dimmer,
    Positional,
    DimmerWithColorTemp,
    FullColor,
    Bipolar,
    InternallyControlled,
}

/// Dimming direction requested by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimDirection {
    Up,
    Down,
}

/// Command handed to the hardware dim handler. The hardware decides the ramp
/// and feeds observed values back through `update_value`.
#[derive(Debug, Clone, PartialEq)]
pub enum DimCommand {
    Start {
        channel_type: u8,
        direction: DimDirection,
        rate: f64,
    },
    Stop {
        channel_type: u8,
    },
}

pub type DimHandler = Arc<dyn Fn(&DimCommand) -> Result<(), String> + Send + Sync>;

/// Default dim rate in percent per second when the controller does not say.
pub const DEFAULT_DIM_RATE: f64 = 10.0;

pub struct Output {
    output_id: u8,
    function: OutputFunction,
    mode: OutputMode,
    /// Echo controller-initiated writes back as pushes. True for every device
    /// meant to bidirectionally sync; may be false for control-only devices.
    push_changes: bool,
    group: u8,
    groups: Vec<u8>,
    on_threshold: f64,
    dim_time_up: f64,
    dim_time_down: f64,
    heating_system_capability: Option<u8>,
    heating_system_type: Option<u8>,
    channels: BTreeMap<u8, OutputChannel>,
    dimming: BTreeMap<u8, (DimDirection, f64)>,
    dim_handler: Option<DimHandler>,
    push: DevicePush,
}

impl Output {
    pub fn new(push: DevicePush, output_id: u8, function: OutputFunction) -> Self {
        Self {
            output_id,
            function,
            mode: OutputMode::Default,
            push_changes: true,
            group: 0,
            groups: Vec::new(),
            on_threshold: 50.0,
            dim_time_up: 7.0,
            dim_time_down: 7.0,
            heating_system_capability: None,
            heating_system_type: None,
            channels: BTreeMap::new(),
            dimming: BTreeMap::new(),
            dim_handler: None,
            push,
        }
    }

    pub fn output_id(&self) -> u8 {
        self.output_id
    }

    pub fn function(&self) -> OutputFunction {
        self.function
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: OutputMode) {
        let old = self.mode;
        self.mode = mode;
        info!(output = self.output_id, from = old.as_str(), to = mode.as_str(), "output mode changed");
    }

    pub fn push_changes(&self) -> bool {
        self.push_changes
    }

    pub fn set_push_changes(&mut self, push_changes: bool) {
        self.push_changes = push_changes;
    }

    pub fn group(&self) -> u8 {
        self.group
    }

    pub fn set_group(&mut self, group: u8) {
        self.group = group;
    }

    pub fn groups(&self) -> &[u8] {
        &self.groups
    }

    pub fn set_groups(&mut self, groups: Vec<u8>) {
        self.groups = groups;
    }

    pub fn on_threshold(&self) -> f64 {
        self.on_threshold
    }

    pub fn dim_times(&self) -> (f64, f64) {
        (self.dim_time_up, self.dim_time_down)
    }

    pub fn set_dim_times(&mut self, up: f64, down: f64) {
        self.dim_time_up = up;
        self.dim_time_down = down;
    }

    pub fn heating_system(&self) -> (Option<u8>, Option<u8>) {
        (self.heating_system_capability, self.heating_system_type)
    }

    pub fn set_heating_system(&mut self, capability: Option<u8>, kind: Option<u8>) {
        self.heating_system_capability = capability;
        self.heating_system_type = kind;
    }

    pub fn set_dim_handler(&mut self, handler: DimHandler) {
        self.dim_handler = Some(handler);
    }

    pub fn add_channel(&mut self, channel: OutputChannel) {
        let channel_type = channel.channel_type();
        if self.channels.insert(channel_type, channel).is_some() {
            warn!(output = self.output_id, channel_type, "replaced existing channel");
        }
    }

    pub fn channel(&self, channel_type: u8) -> Option<&OutputChannel> {
        self.channels.get(&channel_type)
    }

    pub fn channel_mut(&mut self, channel_type: u8) -> Option<&mut OutputChannel> {
        self.channels.get_mut(&channel_type)
    }

    pub fn channels(&self) -> impl Iterator<Item = &OutputChannel> {
        self.channels.values()
    }

    pub fn channel_value(&self, channel_type: u8) -> Option<f64> {
        self.channels.get(&channel_type).map(|c| c.value())
    }

    /// Snapshot of every channel's current value.
    pub fn all_channel_values(&self) -> ChannelValues {
        self.channels
            .iter()
            .map(|(t, c)| (*t, c.value()))
            .collect()
    }

    /// Controller-side write to one channel. Returns false when the output is
    /// disabled or the channel does not exist. When `push_changes` is on and
    /// `apply_now` is not suppressed, the change is echoed to the controller.
    pub fn set_channel_value(
        &mut self,
        channel_type: u8,
        value: f64,
        transition_time: Option<f64>,
        apply_now: bool,
    ) -> bool {
        self.set_channel_value_with_effect(channel_type, value, SceneEffect::None, transition_time, apply_now)
    }

    fn set_channel_value_with_effect(
        &mut self,
        channel_type: u8,
        value: f64,
        effect: SceneEffect,
        transition_time: Option<f64>,
        apply_now: bool,
    ) -> bool {
        if self.mode == OutputMode::Disabled {
            warn!(output = self.output_id, "output disabled, ignoring write");
            return false;
        }

        let Some(channel) = self.channels.get_mut(&channel_type) else {
            warn!(output = self.output_id, channel_type, "no such channel");
            return false;
        };

        let value = if self.mode == OutputMode::Binary {
            if value > 0.0 {
                channel.max()
            } else {
                0.0
            }
        } else {
            value
        };

        channel.set_value(value, effect, transition_time);
        let applied = channel.value();

        if self.push_changes && apply_now {
            self.push.push_channel_state(channel_type, applied);
        }
        true
    }

    /// Apply a scene's channel values. In `min` mode a channel is skipped
    /// when its current value already meets or exceeds the scene value.
    pub fn apply_scene_values(&mut self, values: &ChannelValues, effect: SceneEffect, mode: SceneMode) {
        if self.mode == OutputMode::Disabled {
            warn!(output = self.output_id, "output disabled, ignoring scene");
            return;
        }

        for (&channel_type, &target) in values {
            if mode == SceneMode::Min {
                if let Some(channel) = self.channels.get(&channel_type) {
                    if channel.value() >= target {
                        continue;
                    }
                }
            }
            self.set_channel_value_with_effect(channel_type, target, effect, None, true);
        }
        debug!(
            output = self.output_id,
            values = values.len(),
            "scene values applied"
        );
    }

    /// Begin continuous dimming. The hardware layer owns the ramp; observed
    /// values come back through the channels' `update_value`.
    pub fn start_dimming(&mut self, channel_type: u8, direction: DimDirection, rate: f64) {
        if !self.channels.contains_key(&channel_type) {
            warn!(output = self.output_id, channel_type, "cannot dim unknown channel");
            return;
        }

        self.dimming.insert(channel_type, (direction, rate));
        info!(output = self.output_id, channel_type, ?direction, rate, "start dimming");

        if let Some(handler) = &self.dim_handler {
            let command = DimCommand::Start {
                channel_type,
                direction,
                rate,
            };
            if let Err(e) = handler(&command) {
                warn!(output = self.output_id, error = %e, "dim handler failed");
            }
        }
    }

    /// Stop continuous dimming of a channel.
    pub fn stop_dimming(&mut self, channel_type: u8) {
        self.dimming.remove(&channel_type);
        info!(output = self.output_id, channel_type, "stop dimming");

        if let Some(handler) = &self.dim_handler {
            let command = DimCommand::Stop { channel_type };
            if let Err(e) = handler(&command) {
                warn!(output = self.output_id, error = %e, "dim handler failed");
            }
        }
    }

    pub fn is_dimming(&self, channel_type: u8) -> bool {
        self.dimming.contains_key(&channel_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::output_channel::channel_type;
    use crate::push::PushSender;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use vdcproto::{DsUid, Envelope};

    fn output_with_rx() -> (Output, mpsc::UnboundedReceiver<Envelope>) {
        let sender = PushSender::new();
        let (tx, rx) = mpsc::unbounded_channel();
        sender.connect(tx);
        let push = DevicePush::new(DsUid::device("acme", "lamp", 0), sender);
        let mut output = Output::new(push.clone(), 0, OutputFunction::Dimmer);
        output.add_channel(OutputChannel::new(
            push,
            channel_type::BRIGHTNESS,
            0,
            0.0,
            100.0,
            0.1,
            None,
        ));
        (output, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn disabled_output_rejects_writes() {
        let (mut output, _rx) = output_with_rx();
        output.set_mode(OutputMode::Disabled);
        assert!(!output.set_channel_value(channel_type::BRIGHTNESS, 50.0, None, true));
        assert_eq!(output.channel_value(channel_type::BRIGHTNESS), Some(0.0));
    }

    #[test]
    fn binary_mode_snaps_to_extremes() {
        let (mut output, _rx) = output_with_rx();
        output.set_mode(OutputMode::Binary);

        output.set_channel_value(channel_type::BRIGHTNESS, 0.3, None, true);
        assert_eq!(output.channel_value(channel_type::BRIGHTNESS), Some(100.0));

        output.set_channel_value(channel_type::BRIGHTNESS, 0.0, None, true);
        assert_eq!(output.channel_value(channel_type::BRIGHTNESS), Some(0.0));

        output.set_channel_value(channel_type::BRIGHTNESS, -2.0, None, true);
        assert_eq!(output.channel_value(channel_type::BRIGHTNESS), Some(0.0));
    }

    #[test]
    fn push_changes_gates_controller_echo() {
        let (mut output, mut rx) = output_with_rx();

        output.set_channel_value(channel_type::BRIGHTNESS, 40.0, None, true);
        assert_eq!(drain(&mut rx), 1);

        output.set_push_changes(false);
        output.set_channel_value(channel_type::BRIGHTNESS, 60.0, None, true);
        assert_eq!(drain(&mut rx), 0);
    }

    #[test]
    fn apply_now_false_suppresses_echo() {
        let (mut output, mut rx) = output_with_rx();
        output.set_channel_value(channel_type::BRIGHTNESS, 40.0, None, false);
        assert_eq!(drain(&mut rx), 0);
        assert_eq!(output.channel_value(channel_type::BRIGHTNESS), Some(40.0));
    }

    #[test]
    fn min_mode_only_raises() {
        let (mut output, _rx) = output_with_rx();
        output.set_channel_value(channel_type::BRIGHTNESS, 70.0, None, false);

        let mut scene = ChannelValues::new();
        scene.insert(channel_type::BRIGHTNESS, 50.0);

        output.apply_scene_values(&scene, SceneEffect::None, SceneMode::Min);
        assert_eq!(output.channel_value(channel_type::BRIGHTNESS), Some(70.0));

        output.set_channel_value(channel_type::BRIGHTNESS, 30.0, None, false);
        output.apply_scene_values(&scene, SceneEffect::None, SceneMode::Min);
        assert_eq!(output.channel_value(channel_type::BRIGHTNESS), Some(50.0));
    }

    #[test]
    fn dimming_delegates_to_hardware() {
        let (mut output, _rx) = output_with_rx();
        let commands: Arc<Mutex<Vec<DimCommand>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = commands.clone();
        output.set_dim_handler(Arc::new(move |command| {
            seen.lock().unwrap().push(command.clone());
            Ok(())
        }));

        output.start_dimming(channel_type::BRIGHTNESS, DimDirection::Up, 15.0);
        assert!(output.is_dimming(channel_type::BRIGHTNESS));

        output.stop_dimming(channel_type::BRIGHTNESS);
        assert!(!output.is_dimming(channel_type::BRIGHTNESS));

        let commands = commands.lock().unwrap();
        assert_eq!(commands.len(), 2);
        assert!(matches!(
            commands[0],
            DimCommand::Start {
                channel_type: channel_type::BRIGHTNESS,
                direction: DimDirection::Up,
                ..
            }
        ));
        assert!(matches!(commands[1], DimCommand::Stop { .. }));
    }

    #[test]
    fn all_channel_values_snapshot() {
        let (mut output, _rx) = output_with_rx();
        output.set_channel_value(channel_type::BRIGHTNESS, 42.0, None, false);
        let values = output.all_channel_values();
        assert_eq!(values.len(), 1);
        assert_eq!(values[&channel_type::BRIGHTNESS], 42.0);
    }
}
