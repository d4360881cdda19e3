//! A virtual device (vdSD): one addressable endpoint with components, a
//! scene table and its own undo history.
//!
//! The `announced` flag is the feature-immutability gate: once a device has
//! been introduced to the controller, its feature inventory (output,
//! buttons, binary inputs, sensors) is frozen and every attempted mutation
//! fails with an error naming the device and the operation.

use crate::components::binary_input::BinaryInput;
use crate::components::button_input::{ButtonInput, ButtonMode};
use crate::components::output::{DimDirection, Output, OutputFunction};
use crate::components::output_channel::OutputChannel;
use crate::components::sensor::Sensor;
use crate::push::{DevicePush, PushSender};
use crate::persistence::Store;
use crate::scenes::{LocalPriority, SceneConfig, SceneMode, UndoStack, MAX_SCENE};
use crate::templates::{
    definition_to_properties, BinaryInputDefinition, ButtonDefinition, ChannelDefinition,
    DeviceDefinition, OutputDefinition, SensorDefinition,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use vdcproto::{DimMode, DsUid, PropertyMap, PropertyValue};

/// Errors raised by device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {dsuid} is already announced; cannot {operation}")]
    Announced {
        dsuid: DsUid,
        operation: &'static str,
    },

    #[error("scene number {0} out of range 0-{MAX_SCENE}")]
    SceneOutOfRange(u8),

    #[error("device {0} has no output")]
    NoOutput(DsUid),

    #[error("unknown device {0}")]
    UnknownDevice(DsUid),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("action '{action}' failed: {message}")]
    ActionFailed { action: String, message: String },
}

/// Handler for a cataloged device action. Receives the call parameters and
/// returns an optional result subtree.
pub type ActionHandler =
    Arc<dyn Fn(&PropertyMap) -> Result<Option<PropertyValue>, String> + Send + Sync>;

/// One entry in the device's action catalog.
#[derive(Clone)]
pub struct DeviceAction {
    pub description: String,
    pub handler: ActionHandler,
}

/// Hardware hooks that live on the device rather than on a component.
#[derive(Clone, Default)]
pub struct DeviceHooks {
    /// Invoked for identify requests with the duration in seconds.
    pub identify: Option<Arc<dyn Fn(f64) -> Result<(), String> + Send + Sync>>,
    /// Invoked for control-value writes with `(name, value)`.
    pub control: Option<Arc<dyn Fn(&str, f64) -> Result<(), String> + Send + Sync>>,
}

pub struct Device {
    dsuid: DsUid,
    connector: DsUid,
    name: String,
    model: String,
    primary_group: u8,
    zone_id: Option<i64>,
    model_features: BTreeMap<String, bool>,

    output: Option<Output>,
    buttons: Vec<ButtonInput>,
    binary_inputs: Vec<BinaryInput>,
    sensors: Vec<Sensor>,

    scenes: BTreeMap<u8, SceneConfig>,
    undo_stack: UndoStack,
    local_priority: Option<LocalPriority>,

    control_values: BTreeMap<String, f64>,
    actions: BTreeMap<String, DeviceAction>,
    states: BTreeMap<String, PropertyValue>,
    hooks: DeviceHooks,

    announced: bool,

    push: DevicePush,
    store: Store,
}

impl Device {
    pub fn new(
        dsuid: DsUid,
        connector: DsUid,
        name: impl Into<String>,
        model: impl Into<String>,
        push_sender: PushSender,
        store: Store,
    ) -> Self {
        let push = DevicePush::new(dsuid, push_sender);
        Self {
            dsuid,
            connector,
            name: name.into(),
            model: model.into(),
            primary_group: 0,
            zone_id: None,
            model_features: BTreeMap::new(),
            output: None,
            buttons: Vec::new(),
            binary_inputs: Vec::new(),
            sensors: Vec::new(),
            scenes: BTreeMap::new(),
            undo_stack: UndoStack::default(),
            local_priority: None,
            control_values: BTreeMap::new(),
            actions: BTreeMap::new(),
            states: BTreeMap::new(),
            hooks: DeviceHooks::default(),
            announced: false,
            push,
            store,
        }
    }

    // --- identity and metadata ---

    pub fn dsuid(&self) -> DsUid {
        self.dsuid
    }

    pub fn connector_dsuid(&self) -> DsUid {
        self.connector
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.persist();
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn primary_group(&self) -> u8 {
        self.primary_group
    }

    pub fn set_primary_group(&mut self, group: u8) {
        self.primary_group = group;
    }

    pub fn zone_id(&self) -> Option<i64> {
        self.zone_id
    }

    pub fn set_zone_id(&mut self, zone: Option<i64>) {
        self.zone_id = zone;
        self.persist();
    }

    pub fn set_model_feature(&mut self, feature: impl Into<String>, enabled: bool) {
        self.model_features.insert(feature.into(), enabled);
    }

    pub fn set_hooks(&mut self, hooks: DeviceHooks) {
        self.hooks = hooks;
    }

    pub fn announced(&self) -> bool {
        self.announced
    }

    pub fn mark_announced(&mut self) {
        self.announced = true;
    }

    fn ensure_mutable(&self, operation: &'static str) -> Result<(), DeviceError> {
        if self.announced {
            return Err(DeviceError::Announced {
                dsuid: self.dsuid,
                operation,
            });
        }
        Ok(())
    }

    // --- feature construction (gated by the immutability rule) ---

    pub fn add_output(&mut self, function: OutputFunction) -> Result<&mut Output, DeviceError> {
        self.ensure_mutable("add output")?;
        Ok(self.output.insert(Output::new(self.push.clone(), 0, function)))
    }

    pub fn add_output_channel(
        &mut self,
        channel_type: u8,
        min: f64,
        max: f64,
        resolution: f64,
    ) -> Result<(), DeviceError> {
        self.ensure_mutable("add output channel")?;
        let output = self
            .output
            .as_mut()
            .ok_or(DeviceError::NoOutput(self.dsuid))?;
        let ds_index = output.channels().count() as u8;
        output.add_channel(OutputChannel::new(
            self.push.clone(),
            channel_type,
            ds_index,
            min,
            max,
            resolution,
            None,
        ));
        Ok(())
    }

    pub fn add_button_input(
        &mut self,
        name: impl Into<String>,
        mode: ButtonMode,
    ) -> Result<&mut ButtonInput, DeviceError> {
        self.ensure_mutable("add button input")?;
        let index = self.buttons.len() as u8;
        self.buttons
            .push(ButtonInput::new(self.push.clone(), index, name, mode));
        Ok(self.buttons.last_mut().unwrap())
    }

    pub fn add_binary_input(
        &mut self,
        name: impl Into<String>,
        input_type: u8,
    ) -> Result<&mut BinaryInput, DeviceError> {
        self.ensure_mutable("add binary input")?;
        let index = self.binary_inputs.len() as u8;
        self.binary_inputs
            .push(BinaryInput::new(self.push.clone(), index, name, input_type));
        Ok(self.binary_inputs.last_mut().unwrap())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_sensor(
        &mut self,
        name: impl Into<String>,
        sensor_type: u8,
        unit: impl Into<String>,
        min: f64,
        max: f64,
        resolution: f64,
    ) -> Result<&mut Sensor, DeviceError> {
        self.ensure_mutable("add sensor")?;
        let index = self.sensors.len() as u8;
        self.sensors.push(Sensor::new(
            self.push.clone(),
            index,
            name,
            sensor_type,
            unit,
            min,
            max,
            resolution,
        ));
        Ok(self.sensors.last_mut().unwrap())
    }

    // --- component access ---

    pub fn output(&self) -> Option<&Output> {
        self.output.as_ref()
    }

    pub fn output_mut(&mut self) -> Option<&mut Output> {
        self.output.as_mut()
    }

    pub fn buttons(&self) -> &[ButtonInput] {
        &self.buttons
    }

    pub fn button_mut(&mut self, index: u8) -> Option<&mut ButtonInput> {
        self.buttons.get_mut(index as usize)
    }

    pub fn binary_inputs(&self) -> &[BinaryInput] {
        &self.binary_inputs
    }

    pub fn binary_input_mut(&mut self, index: u8) -> Option<&mut BinaryInput> {
        self.binary_inputs.get_mut(index as usize)
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn sensor_mut(&mut self, index: u8) -> Option<&mut Sensor> {
        self.sensors.get_mut(index as usize)
    }

    // --- actions and states ---

    pub fn register_action(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: ActionHandler,
    ) {
        self.actions.insert(
            name.into(),
            DeviceAction {
                description: description.into(),
                handler,
            },
        );
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Invoke a cataloged action with the given parameters.
    pub fn call_action(
        &self,
        name: &str,
        params: &PropertyMap,
    ) -> Result<Option<PropertyValue>, DeviceError> {
        let action = self
            .actions
            .get(name)
            .ok_or_else(|| DeviceError::UnknownAction(name.to_string()))?;
        (action.handler)(params).map_err(|message| DeviceError::ActionFailed {
            action: name.to_string(),
            message,
        })
    }

    pub fn actions(&self) -> impl Iterator<Item = (&String, &DeviceAction)> {
        self.actions.iter()
    }

    pub fn set_state(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.states.insert(name.into(), value);
    }

    pub fn state(&self, name: &str) -> Option<&PropertyValue> {
        self.states.get(name)
    }

    pub fn states(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.states.iter()
    }

    // --- scene engine ---

    pub fn scene(&self, scene: u8) -> Option<&SceneConfig> {
        self.scenes.get(&scene)
    }

    pub fn scene_table(&self) -> &BTreeMap<u8, SceneConfig> {
        &self.scenes
    }

    pub fn set_scene(&mut self, scene: u8, config: SceneConfig) -> Result<(), DeviceError> {
        if scene > MAX_SCENE {
            return Err(DeviceError::SceneOutOfRange(scene));
        }
        self.scenes.insert(scene, config);
        self.persist_scenes();
        Ok(())
    }

    /// Recall a scene.
    ///
    /// The undo snapshot is taken before local-priority enforcement so that a
    /// blocked call can pop its own snapshot and keep the stack honest.
    pub fn call_scene(
        &mut self,
        scene: u8,
        force: bool,
        mode: SceneMode,
    ) -> Result<(), DeviceError> {
        if scene > MAX_SCENE {
            return Err(DeviceError::SceneOutOfRange(scene));
        }
        info!(dsuid = %self.dsuid, scene, force, ?mode, "call scene");

        let config = match self.scenes.get(&scene) {
            Some(config) => config.clone(),
            None if force => SceneConfig::default(),
            None => {
                debug!(dsuid = %self.dsuid, scene, "scene not configured");
                return Ok(());
            }
        };

        if config.dont_care && !force {
            debug!(dsuid = %self.dsuid, scene, "scene is dontCare");
            return Ok(());
        }

        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };

        self.undo_stack.push(output.all_channel_values());

        if let Some(lock) = self.local_priority {
            if !force && !config.ignore_local_priority && !lock.matches(scene) {
                info!(dsuid = %self.dsuid, scene, ?lock, "scene blocked by local priority");
                self.undo_stack.discard_last();
                return Ok(());
            }
        }

        output.apply_scene_values(&config.channels, config.effect, mode);
        Ok(())
    }

    /// Snapshot all current output channel values into scene `n`, preserving
    /// the prior effect and flags (or defaults for a new scene).
    pub fn save_scene(
        &mut self,
        scene: u8,
        ignore_local_priority: Option<bool>,
    ) -> Result<(), DeviceError> {
        if scene > MAX_SCENE {
            return Err(DeviceError::SceneOutOfRange(scene));
        }
        info!(dsuid = %self.dsuid, scene, "save scene");

        let values = self
            .output
            .as_ref()
            .map(|o| o.all_channel_values())
            .unwrap_or_default();

        let config = self.scenes.entry(scene).or_default();
        config.channels = values;
        if let Some(flag) = ignore_local_priority {
            config.ignore_local_priority = flag;
        }
        let snapshot = config.clone();
        self.persist_scenes();

        // Tell the controller the scene table changed.
        if let Some(tree) = scene_config_to_property(&snapshot) {
            let mut scene_map = PropertyMap::new();
            scene_map.insert(scene.to_string(), tree);
            let mut root = PropertyMap::new();
            root.insert("scenes".into(), scene_map.into());
            self.push.push_properties(Some(root.into()));
        }
        Ok(())
    }

    /// Restore the output to the state before the most recent scene call.
    pub fn undo_scene(&mut self) {
        let Some(snapshot) = self.undo_stack.pop() else {
            warn!(dsuid = %self.dsuid, "undo requested with empty undo stack");
            return;
        };
        info!(dsuid = %self.dsuid, "undo scene");

        if let Some(output) = self.output.as_mut() {
            for (channel_type, value) in snapshot {
                output.set_channel_value(channel_type, value, None, true);
            }
        }
    }

    pub fn call_min_scene(&mut self, scene: u8) -> Result<(), DeviceError> {
        self.call_scene(scene, false, SceneMode::Min)
    }

    /// Lock the device to one scene, or globally when `scene` is `None`.
    pub fn set_local_priority(&mut self, scene: Option<u8>) {
        self.local_priority = Some(match scene {
            Some(n) => LocalPriority::Scene(n),
            None => LocalPriority::Global,
        });
        info!(dsuid = %self.dsuid, lock = ?self.local_priority, "local priority set");

        let value = match self.local_priority {
            Some(LocalPriority::Scene(n)) => PropertyValue::Int(n as i64),
            _ => "*".into(),
        };
        self.store
            .update_device_property(&self.dsuid, "local_priority", value);
    }

    pub fn clear_local_priority(&mut self) {
        self.local_priority = None;
    }

    pub fn local_priority(&self) -> Option<LocalPriority> {
        self.local_priority
    }

    pub(crate) fn restore_local_priority(&mut self, lock: Option<LocalPriority>) {
        self.local_priority = lock;
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    // --- controller-driven output operations ---

    pub fn set_output_channel_value(
        &mut self,
        channel: u8,
        value: f64,
        apply_now: bool,
        transition_time: Option<f64>,
    ) -> Result<(), DeviceError> {
        let output = self
            .output
            .as_mut()
            .ok_or(DeviceError::NoOutput(self.dsuid))?;
        output.set_channel_value(channel, value, transition_time, apply_now);
        Ok(())
    }

    pub fn dim_channel(&mut self, channel: u8, mode: DimMode) -> Result<(), DeviceError> {
        let output = self
            .output
            .as_mut()
            .ok_or(DeviceError::NoOutput(self.dsuid))?;
        match mode {
            DimMode::Stop => output.stop_dimming(channel),
            DimMode::Up => output.start_dimming(channel, DimDirection::Up, crate::components::output::DEFAULT_DIM_RATE),
            DimMode::Down => {
                output.start_dimming(channel, DimDirection::Down, crate::components::output::DEFAULT_DIM_RATE)
            }
        }
        Ok(())
    }

    /// Identify the physical device: a cataloged `identify` action wins, then
    /// the hardware hook; otherwise the request is only logged.
    pub fn identify(&self, duration: Option<f64>) {
        let duration = duration.unwrap_or(3.0);
        info!(dsuid = %self.dsuid, duration, "identify");

        if self.has_action("identify") {
            let mut params = PropertyMap::new();
            params.insert("duration".into(), duration.into());
            if let Err(e) = self.call_action("identify", &params) {
                warn!(dsuid = %self.dsuid, error = %e, "identify action failed");
            }
            return;
        }

        if let Some(hook) = &self.hooks.identify {
            if let Err(e) = hook(duration) {
                warn!(dsuid = %self.dsuid, error = %e, "identify hook failed");
            }
            return;
        }

        debug!(dsuid = %self.dsuid, "no identify behavior configured");
    }

    /// Store a control value and forward it to the control hook.
    pub fn set_control_value(&mut self, name: &str, value: f64) {
        info!(dsuid = %self.dsuid, name, value, "set control value");
        self.control_values.insert(name.to_string(), value);

        if let Some(hook) = &self.hooks.control {
            if let Err(e) = hook(name, value) {
                warn!(dsuid = %self.dsuid, error = %e, "control hook failed");
            }
        }
    }

    pub fn control_value(&self, name: &str) -> Option<f64> {
        self.control_values.get(name).copied()
    }

    // --- definition export / import ---

    /// The device's configuration without its identity.
    pub fn export_definition(&self) -> DeviceDefinition {
        DeviceDefinition {
            name: self.name.clone(),
            model: self.model.clone(),
            primary_group: self.primary_group,
            zone_id: self.zone_id,
            model_features: self.model_features.clone(),
            output: self.output.as_ref().map(|output| OutputDefinition {
                function: output.function(),
                mode: output.mode(),
                push_changes: output.push_changes(),
                group: output.group(),
                groups: output.groups().to_vec(),
                channels: output
                    .channels()
                    .map(|c| ChannelDefinition {
                        channel_type: c.channel_type(),
                        ds_index: c.ds_index(),
                        name: Some(c.name().to_string()),
                        min: c.min(),
                        max: c.max(),
                        resolution: c.resolution(),
                        initial: Some(c.value()),
                    })
                    .collect(),
                heating_system_capability: output.heating_system().0,
                heating_system_type: output.heating_system().1,
            }),
            buttons: self
                .buttons
                .iter()
                .map(|b| ButtonDefinition {
                    name: b.name().to_string(),
                    mode: b.mode(),
                    button_type: b.button_type(),
                    element: b.element(),
                })
                .collect(),
            binary_inputs: self
                .binary_inputs
                .iter()
                .map(|i| BinaryInputDefinition {
                    name: i.name().to_string(),
                    input_type: i.input_type(),
                    usage: i.usage(),
                    sensor_function: Some(i.sensor_function()),
                    invert: i.invert(),
                })
                .collect(),
            sensors: self
                .sensors
                .iter()
                .map(|s| SensorDefinition {
                    name: s.name().to_string(),
                    sensor_type: s.sensor_type(),
                    usage: s.usage(),
                    unit: s.unit().to_string(),
                    min: s.range().0,
                    max: s.range().1,
                    resolution: s.resolution(),
                    hysteresis: s.hysteresis(),
                    min_push_interval: s.min_push_interval().as_secs_f64(),
                    changes_only_interval: s.changes_only_interval().as_secs_f64(),
                })
                .collect(),
            scenes: self.scenes.clone(),
        }
    }

    /// Re-apply a definition onto this (un-announced) device.
    pub fn apply_definition(&mut self, def: &DeviceDefinition) -> Result<(), DeviceError> {
        self.ensure_mutable("apply definition")?;

        self.name = def.name.clone();
        if !def.model.is_empty() {
            self.model = def.model.clone();
        }
        self.primary_group = def.primary_group;
        self.zone_id = def.zone_id;
        self.model_features = def.model_features.clone();
        self.scenes = def.scenes.clone();

        self.output = None;
        if let Some(output_def) = &def.output {
            let mut output = Output::new(self.push.clone(), 0, output_def.function);
            output.set_mode(output_def.mode);
            output.set_push_changes(output_def.push_changes);
            output.set_group(output_def.group);
            output.set_groups(output_def.groups.clone());
            output.set_heating_system(
                output_def.heating_system_capability,
                output_def.heating_system_type,
            );
            for channel in &output_def.channels {
                let mut built = OutputChannel::new(
                    self.push.clone(),
                    channel.channel_type,
                    channel.ds_index,
                    channel.min,
                    channel.max,
                    channel.resolution,
                    channel.initial,
                );
                if let Some(name) = &channel.name {
                    built = built.with_name(name.clone());
                }
                output.add_channel(built);
            }
            self.output = Some(output);
        }

        self.buttons.clear();
        for (index, button) in def.buttons.iter().enumerate() {
            self.buttons.push(
                ButtonInput::new(self.push.clone(), index as u8, button.name.clone(), button.mode)
                    .with_physical(button.button_type, button.element),
            );
        }

        self.binary_inputs.clear();
        for (index, input) in def.binary_inputs.iter().enumerate() {
            let mut built = BinaryInput::new(
                self.push.clone(),
                index as u8,
                input.name.clone(),
                input.input_type,
            )
            .with_usage(input.usage)
            .with_invert(input.invert);
            if let Some(function) = input.sensor_function {
                built = built.with_sensor_function(function);
            }
            self.binary_inputs.push(built);
        }

        self.sensors.clear();
        for (index, sensor) in def.sensors.iter().enumerate() {
            let built = Sensor::new(
                self.push.clone(),
                index as u8,
                sensor.name.clone(),
                sensor.sensor_type,
                sensor.unit.clone(),
                sensor.min,
                sensor.max,
                sensor.resolution,
            )
            .with_usage(sensor.usage)
            .with_hysteresis(sensor.hysteresis)
            .with_push_intervals(
                Duration::from_secs_f64(sensor.min_push_interval),
                Duration::from_secs_f64(sensor.changes_only_interval),
            );
            self.sensors.push(built);
        }

        Ok(())
    }

    // --- persistence ---

    /// Write the device's serialized form to the store.
    pub fn persist(&self) {
        match definition_to_properties(&self.export_definition()) {
            Ok(mut map) => {
                if let Some(lock) = self.local_priority {
                    let value = match lock {
                        LocalPriority::Scene(n) => PropertyValue::Int(n as i64),
                        LocalPriority::Global => "*".into(),
                    };
                    map.insert("local_priority".into(), value);
                }
                self.store.set_device(&self.dsuid, &self.connector, map);
            }
            Err(e) => warn!(dsuid = %self.dsuid, error = %e, "failed to serialize device"),
        }
    }

    fn persist_scenes(&self) {
        let tree = serde_json::to_value(&self.scenes)
            .and_then(serde_json::from_value::<PropertyValue>);
        match tree {
            Ok(tree) => self
                .store
                .update_device_property(&self.dsuid, "scenes", tree),
            Err(e) => warn!(dsuid = %self.dsuid, error = %e, "failed to serialize scenes"),
        }
    }
}

/// One scene config in property-tree form, for push notifications.
fn scene_config_to_property(config: &SceneConfig) -> Option<PropertyValue> {
    serde_json::to_value(config)
        .and_then(serde_json::from_value::<PropertyValue>)
        .ok()
}
