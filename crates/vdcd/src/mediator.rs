//! Property tree mediator: routes typed property reads and writes to the
//! addressed entity.
//!
//! The mediator locates the target (host, connector or device), asks it for
//! its full tree on reads (filtered by the query shape), and walks write
//! trees leaf by leaf. Entities declare what is writable; the mediator only
//! enforces. Writes to read-only fields are logged and skipped without
//! failing the request; type-ill-formed values fail the request with a
//! structured error describing the first failure — unless at least one leaf
//! applied, in which case the request still succeeds.

use crate::components::output::OutputMode;
use crate::entities::{Connector, Device, VdcHost};
use crate::scenes::SceneConfig;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use vdcproto::{filter_by_query, DsUid, PropertyValue};

#[derive(Debug, Error)]
pub enum MediatorError {
    #[error("unknown entity {0}")]
    UnknownUid(DsUid),
}

/// Result of one leaf write.
#[derive(Debug)]
enum WriteOutcome {
    Applied,
    ReadOnly,
    Invalid(String),
}

/// Aggregate result of a set-property request.
#[derive(Debug, Default)]
pub struct SetSummary {
    pub applied: usize,
    pub read_only: usize,
    pub failures: Vec<(String, String)>,
}

impl SetSummary {
    fn record(&mut self, path: &str, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Applied => self.applied += 1,
            WriteOutcome::ReadOnly => {
                debug!(path, "write to read-only property skipped");
                self.read_only += 1;
            }
            WriteOutcome::Invalid(reason) => {
                warn!(path, reason, "property write rejected");
                self.failures.push((path.to_string(), reason));
            }
        }
    }

    /// The request fails only when writes were attempted and every
    /// applicable one failed.
    pub fn is_failure(&self) -> bool {
        !self.failures.is_empty() && self.applied == 0 && self.read_only == 0
    }

    pub fn first_failure(&self) -> Option<String> {
        self.failures
            .first()
            .map(|(path, reason)| format!("{path}: {reason}"))
    }
}

/// Read properties of the addressed entity, filtered by the query shape.
/// An empty or absent query means "all properties".
pub fn get_properties(
    host: &VdcHost,
    dsuid: &DsUid,
    query: &PropertyValue,
) -> Result<PropertyValue, MediatorError> {
    let full = if *dsuid == host.dsuid() {
        host.properties()
    } else if let Some(connector) = host.connector(dsuid) {
        connector.properties()
    } else if let Some(device) = host.find_device(dsuid) {
        device_properties(device)
    } else {
        return Err(MediatorError::UnknownUid(*dsuid));
    };
    Ok(filter_by_query(&full, query))
}

/// Apply a write tree to the addressed entity.
pub fn set_properties(
    host: &mut VdcHost,
    dsuid: &DsUid,
    properties: &PropertyValue,
) -> Result<SetSummary, MediatorError> {
    let tree = match properties.as_map() {
        Some(map) => map,
        None => {
            let mut summary = SetSummary::default();
            summary.record(
                "<root>",
                WriteOutcome::Invalid(format!(
                    "expected map at root, got {}",
                    properties.type_name()
                )),
            );
            return Ok(summary);
        }
    };

    let dsuid = *dsuid;
    if dsuid == host.dsuid() {
        let mut summary = SetSummary::default();
        for (key, value) in tree {
            summary.record(key, write_host_leaf(host, key, value));
        }
        return Ok(summary);
    }

    if let Some(connector) = host.connector_mut(&dsuid) {
        let mut summary = SetSummary::default();
        for (key, value) in tree {
            summary.record(key, write_connector_leaf(connector, key, value));
        }
        return Ok(summary);
    }

    if let Some(device) = host.find_device_mut(&dsuid) {
        let mut summary = SetSummary::default();
        for (key, value) in tree {
            write_device_section(device, key, value, &mut summary);
        }
        return Ok(summary);
    }

    Err(MediatorError::UnknownUid(dsuid))
}

// --- host ---

fn write_host_leaf(host: &mut VdcHost, key: &str, value: &PropertyValue) -> WriteOutcome {
    match key {
        "name" => match value.as_str() {
            Some(name) => {
                host.set_name(name);
                WriteOutcome::Applied
            }
            None => WriteOutcome::Invalid(format!("name must be a string, got {}", value.type_name())),
        },
        _ => WriteOutcome::ReadOnly,
    }
}

// --- connector ---

fn write_connector_leaf(connector: &mut Connector, key: &str, value: &PropertyValue) -> WriteOutcome {
    match key {
        "name" => match value.as_str() {
            Some(name) => {
                connector.set_name(name);
                WriteOutcome::Applied
            }
            None => WriteOutcome::Invalid(format!("name must be a string, got {}", value.type_name())),
        },
        "zoneID" => match value.as_int() {
            Some(zone) => {
                connector.set_zone_id(Some(zone));
                WriteOutcome::Applied
            }
            None => WriteOutcome::Invalid(format!("zoneID must be an integer, got {}", value.type_name())),
        },
        _ => WriteOutcome::ReadOnly,
    }
}

// --- device ---

/// The device's full property tree.
pub fn device_properties(device: &Device) -> PropertyValue {
    use vdcproto::PropertyMap;

    let mut map = PropertyMap::new();
    map.insert("dSUID".into(), device.dsuid().to_hex().into());
    map.insert("name".into(), device.name().to_string().into());
    map.insert("model".into(), device.model().to_string().into());
    map.insert("primaryGroup".into(), (device.primary_group() as i64).into());
    map.insert("announced".into(), device.announced().into());
    if let Some(zone) = device.zone_id() {
        map.insert("zoneID".into(), zone.into());
    }

    if let Some(output) = device.output() {
        let mut description = PropertyMap::new();
        description.insert(
            "function".into(),
            format!("{:?}", output.function()).to_lowercase().into(),
        );

        let mut settings = PropertyMap::new();
        settings.insert("mode".into(), output.mode().as_str().into());
        settings.insert("pushChanges".into(), output.push_changes().into());
        settings.insert("group".into(), (output.group() as i64).into());
        settings.insert("onThreshold".into(), output.on_threshold().into());
        let (dim_up, dim_down) = output.dim_times();
        settings.insert("dimTimeUp".into(), dim_up.into());
        settings.insert("dimTimeDown".into(), dim_down.into());

        let mut channel_descriptions = PropertyMap::new();
        let mut channel_states = PropertyMap::new();
        for channel in output.channels() {
            let key = channel.channel_type().to_string();

            let mut channel_description = PropertyMap::new();
            channel_description.insert("name".into(), channel.name().to_string().into());
            channel_description.insert("dsIndex".into(), (channel.ds_index() as i64).into());
            channel_description.insert("min".into(), channel.min().into());
            channel_description.insert("max".into(), channel.max().into());
            channel_description.insert("resolution".into(), channel.resolution().into());
            channel_descriptions.insert(key.clone(), channel_description.into());

            let mut channel_state = PropertyMap::new();
            channel_state.insert("value".into(), channel.value().into());
            channel_state.insert("age".into(), channel.age().into());
            channel_states.insert(key, channel_state.into());
        }

        map.insert("outputDescription".into(), description.into());
        map.insert("outputSettings".into(), settings.into());
        map.insert("channelDescriptions".into(), channel_descriptions.into());
        map.insert("channelStates".into(), channel_states.into());
    }

    if !device.buttons().is_empty() {
        let mut descriptions = PropertyMap::new();
        let mut states = PropertyMap::new();
        for button in device.buttons() {
            let key = button.index().to_string();

            let mut description = PropertyMap::new();
            description.insert("name".into(), button.name().to_string().into());
            description.insert("buttonType".into(), (button.button_type() as i64).into());
            description.insert("element".into(), (button.element() as i64).into());
            descriptions.insert(key.clone(), description.into());

            let mut state = PropertyMap::new();
            match button.action() {
                Some((action_id, action_mode)) => {
                    state.insert("actionId".into(), (action_id as i64).into());
                    state.insert("actionMode".into(), (action_mode as i64).into());
                }
                None => {
                    if let Some(value) = button.value() {
                        state.insert("value".into(), value.into());
                    }
                    state.insert("clickType".into(), (button.click_type() as i64).into());
                }
            }
            state.insert("age".into(), button.age().into());
            states.insert(key, state.into());
        }
        map.insert("buttonInputDescriptions".into(), descriptions.into());
        map.insert("buttonInputStates".into(), states.into());
    }

    if !device.binary_inputs().is_empty() {
        let mut descriptions = PropertyMap::new();
        let mut states = PropertyMap::new();
        for input in device.binary_inputs() {
            let key = input.index().to_string();

            let mut description = PropertyMap::new();
            description.insert("name".into(), input.name().to_string().into());
            description.insert("inputType".into(), (input.input_type() as i64).into());
            description.insert("usage".into(), (input.usage() as i64).into());
            description.insert(
                "sensorFunction".into(),
                (input.sensor_function() as i64).into(),
            );
            descriptions.insert(key.clone(), description.into());

            let mut state = PropertyMap::new();
            state.insert("value".into(), input.state().into());
            state.insert("age".into(), input.age().into());
            states.insert(key, state.into());
        }
        map.insert("binaryInputDescriptions".into(), descriptions.into());
        map.insert("binaryInputStates".into(), states.into());
    }

    if !device.sensors().is_empty() {
        let mut descriptions = PropertyMap::new();
        let mut settings = PropertyMap::new();
        let mut states = PropertyMap::new();
        for sensor in device.sensors() {
            let key = sensor.index().to_string();

            let mut description = PropertyMap::new();
            description.insert("name".into(), sensor.name().to_string().into());
            description.insert("sensorType".into(), (sensor.sensor_type() as i64).into());
            description.insert("unit".into(), sensor.unit().to_string().into());
            description.insert("min".into(), sensor.range().0.into());
            description.insert("max".into(), sensor.range().1.into());
            description.insert("resolution".into(), sensor.resolution().into());
            descriptions.insert(key.clone(), description.into());

            let mut setting = PropertyMap::new();
            setting.insert(
                "minPushInterval".into(),
                sensor.min_push_interval().as_secs_f64().into(),
            );
            setting.insert(
                "changesOnlyInterval".into(),
                sensor.changes_only_interval().as_secs_f64().into(),
            );
            setting.insert("hysteresis".into(), sensor.hysteresis().into());
            settings.insert(key.clone(), setting.into());

            let mut state = PropertyMap::new();
            match sensor.value() {
                Some(value) => {
                    state.insert("value".into(), value.into());
                }
                None => {
                    if let Some(error) = sensor.error() {
                        state.insert("error".into(), error.into());
                    }
                }
            }
            if let Some(age) = sensor.age() {
                state.insert("age".into(), age.into());
            }
            states.insert(key, state.into());
        }
        map.insert("sensorDescriptions".into(), descriptions.into());
        map.insert("sensorSettings".into(), settings.into());
        map.insert("sensorStates".into(), states.into());
    }

    {
        let mut actions = PropertyMap::new();
        for (name, action) in device.actions() {
            let mut entry = PropertyMap::new();
            entry.insert("description".into(), action.description.clone().into());
            actions.insert(name.clone(), entry.into());
        }
        if !actions.is_empty() {
            map.insert("deviceActionDescriptions".into(), actions.into());
        }

        let mut states = PropertyMap::new();
        for (name, value) in device.states() {
            states.insert(name.clone(), value.clone());
        }
        if !states.is_empty() {
            map.insert("deviceStates".into(), states.into());
        }
    }

    if let Some(scenes) = serde_json::to_value(
        device
            .scene_table()
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<std::collections::BTreeMap<String, SceneConfig>>(),
    )
    .ok()
    .and_then(|v| serde_json::from_value::<PropertyValue>(v).ok())
    {
        map.insert("scenes".into(), scenes);
    }

    map.into()
}

/// Route one top-level section of a device write tree.
fn write_device_section(
    device: &mut Device,
    key: &str,
    value: &PropertyValue,
    summary: &mut SetSummary,
) {
    match key {
        "name" => {
            let outcome = match value.as_str() {
                Some(name) => {
                    device.set_name(name);
                    WriteOutcome::Applied
                }
                None => {
                    WriteOutcome::Invalid(format!("name must be a string, got {}", value.type_name()))
                }
            };
            summary.record(key, outcome);
        }
        "zoneID" => {
            let outcome = match value.as_int() {
                Some(zone) => {
                    device.set_zone_id(Some(zone));
                    WriteOutcome::Applied
                }
                None => WriteOutcome::Invalid(format!(
                    "zoneID must be an integer, got {}",
                    value.type_name()
                )),
            };
            summary.record(key, outcome);
        }
        "outputSettings" => match value.as_map() {
            Some(section) => {
                for (setting, leaf) in section {
                    let path = format!("outputSettings.{setting}");
                    summary.record(&path, write_output_setting(device, setting, leaf));
                }
            }
            None => summary.record(
                key,
                WriteOutcome::Invalid(format!("expected map, got {}", value.type_name())),
            ),
        },
        "scenes" => match value.as_map() {
            Some(section) => {
                for (number, leaf) in section {
                    let path = format!("scenes.{number}");
                    summary.record(&path, write_scene(device, number, leaf));
                }
            }
            None => summary.record(
                key,
                WriteOutcome::Invalid(format!("expected map, got {}", value.type_name())),
            ),
        },
        "sensorSettings" => match value.as_map() {
            Some(section) => {
                for (index, leaf) in section {
                    write_sensor_settings(device, index, leaf, summary);
                }
            }
            None => summary.record(
                key,
                WriteOutcome::Invalid(format!("expected map, got {}", value.type_name())),
            ),
        },
        _ => summary.record(key, WriteOutcome::ReadOnly),
    }
}

fn write_output_setting(device: &mut Device, setting: &str, value: &PropertyValue) -> WriteOutcome {
    let Some(output) = device.output_mut() else {
        return WriteOutcome::Invalid("device has no output".to_string());
    };
    match setting {
        "mode" => match value.as_str().and_then(OutputMode::parse) {
            Some(mode) => {
                output.set_mode(mode);
                WriteOutcome::Applied
            }
            None => WriteOutcome::Invalid(format!(
                "mode must be one of disabled/binary/gradual/default, got {value:?}"
            )),
        },
        "pushChanges" => match value.as_bool() {
            Some(flag) => {
                output.set_push_changes(flag);
                WriteOutcome::Applied
            }
            None => WriteOutcome::Invalid(format!(
                "pushChanges must be a bool, got {}",
                value.type_name()
            )),
        },
        "group" => match value.as_int() {
            Some(group) if (0..=255).contains(&group) => {
                output.set_group(group as u8);
                WriteOutcome::Applied
            }
            Some(group) => WriteOutcome::Invalid(format!("group {group} out of range 0-255")),
            None => WriteOutcome::Invalid(format!(
                "group must be an integer, got {}",
                value.type_name()
            )),
        },
        _ => WriteOutcome::ReadOnly,
    }
}

fn write_scene(device: &mut Device, number: &str, value: &PropertyValue) -> WriteOutcome {
    let Ok(scene) = number.parse::<u8>() else {
        return WriteOutcome::Invalid(format!("scene key '{number}' is not a number"));
    };
    let config: SceneConfig = match serde_json::to_value(value)
        .and_then(serde_json::from_value::<SceneConfig>)
    {
        Ok(config) => config,
        Err(e) => return WriteOutcome::Invalid(format!("malformed scene config: {e}")),
    };
    match device.set_scene(scene, config) {
        Ok(()) => WriteOutcome::Applied,
        Err(e) => WriteOutcome::Invalid(e.to_string()),
    }
}

fn write_sensor_settings(
    device: &mut Device,
    index: &str,
    value: &PropertyValue,
    summary: &mut SetSummary,
) {
    let path_base = format!("sensorSettings.{index}");
    let Ok(index) = index.parse::<u8>() else {
        summary.record(
            &path_base,
            WriteOutcome::Invalid(format!("sensor index '{index}' is not a number")),
        );
        return;
    };
    let Some(section) = value.as_map() else {
        summary.record(
            &path_base,
            WriteOutcome::Invalid(format!("expected map, got {}", value.type_name())),
        );
        return;
    };
    let Some(sensor) = device.sensor_mut(index) else {
        summary.record(
            &path_base,
            WriteOutcome::Invalid(format!("no sensor at index {index}")),
        );
        return;
    };

    for (setting, leaf) in section {
        let path = format!("{path_base}.{setting}");
        let outcome = match setting.as_str() {
            "minPushInterval" => match leaf.as_double() {
                Some(secs) if secs >= 0.0 => {
                    sensor.set_min_push_interval(Duration::from_secs_f64(secs));
                    WriteOutcome::Applied
                }
                Some(secs) => WriteOutcome::Invalid(format!("minPushInterval {secs} is negative")),
                None => WriteOutcome::Invalid(format!(
                    "minPushInterval must be a number, got {}",
                    leaf.type_name()
                )),
            },
            "changesOnlyInterval" => match leaf.as_double() {
                Some(secs) if secs >= 0.0 => {
                    sensor.set_changes_only_interval(Duration::from_secs_f64(secs));
                    WriteOutcome::Applied
                }
                Some(secs) => {
                    WriteOutcome::Invalid(format!("changesOnlyInterval {secs} is negative"))
                }
                None => WriteOutcome::Invalid(format!(
                    "changesOnlyInterval must be a number, got {}",
                    leaf.type_name()
                )),
            },
            "hysteresis" => match leaf.as_double() {
                Some(h) if h >= 0.0 => {
                    sensor.set_hysteresis(h);
                    WriteOutcome::Applied
                }
                Some(h) => WriteOutcome::Invalid(format!("hysteresis {h} is negative")),
                None => WriteOutcome::Invalid(format!(
                    "hysteresis must be a number, got {}",
                    leaf.type_name()
                )),
            },
            _ => WriteOutcome::ReadOnly,
        };
        summary.record(&path, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::output::OutputFunction;
    use crate::components::output_channel::channel_type;
    use crate::persistence::Store;
    use tempfile::TempDir;
    use vdcconf::VdcConfig;
    use vdcproto::PropertyMap;

    fn host_with_device() -> (VdcHost, DsUid, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("state.yaml")).unwrap();
        let mut host = VdcHost::new(&VdcConfig::default(), store);
        let connector = host.create_connector(0, "gw", "m");
        let device_uid = host
            .connector_mut(&connector)
            .unwrap()
            .create_device("lamp", 0, "lamp", "dim-1");
        {
            let device = host.find_device_mut(&device_uid).unwrap();
            device.add_output(OutputFunction::Dimmer).unwrap();
            device
                .add_output_channel(channel_type::BRIGHTNESS, 0.0, 100.0, 0.1)
                .unwrap();
            device
                .add_sensor("temp", 1, "°C", -40.0, 80.0, 0.1)
                .unwrap();
        }
        (host, device_uid, dir)
    }

    #[test]
    fn unknown_uid_errors() {
        let (host, _uid, _dir) = host_with_device();
        let stranger = DsUid::device("nobody", "nothing", 0);
        assert!(matches!(
            get_properties(&host, &stranger, &PropertyValue::empty_map()),
            Err(MediatorError::UnknownUid(_))
        ));
    }

    #[test]
    fn empty_query_returns_everything() {
        let (host, uid, _dir) = host_with_device();
        let tree = get_properties(&host, &uid, &PropertyValue::empty_map()).unwrap();
        assert_eq!(tree.get_path("name").unwrap().as_str(), Some("lamp"));
        assert!(tree.get_path("channelStates.1.value").is_some());
        assert!(tree.get_path("sensorDescriptions.0.unit").is_some());
    }

    #[test]
    fn partial_query_filters() {
        let (host, uid, _dir) = host_with_device();
        let mut query = PropertyValue::empty_map();
        query.set_path("outputSettings", PropertyValue::empty_map());

        let tree = get_properties(&host, &uid, &query).unwrap();
        assert!(tree.get_path("outputSettings.mode").is_some());
        assert!(tree.get_path("name").is_none());
    }

    #[test]
    fn host_and_connector_resolve_too() {
        let (host, _uid, _dir) = host_with_device();
        let host_tree = get_properties(&host, &host.dsuid(), &PropertyValue::empty_map()).unwrap();
        assert_eq!(
            host_tree.get_path("apiVersion").unwrap().as_str(),
            Some(crate::entities::API_VERSION)
        );

        let connector_uid = host.connectors().next().unwrap().dsuid();
        let connector_tree =
            get_properties(&host, &connector_uid, &PropertyValue::empty_map()).unwrap();
        assert!(connector_tree.get_path("capabilities.metering").is_some());
    }

    #[test]
    fn writable_leaves_apply() {
        let (mut host, uid, _dir) = host_with_device();
        let mut tree = PropertyValue::empty_map();
        tree.set_path("name", "desk lamp".into());
        tree.set_path("zoneID", 4i64.into());
        tree.set_path("outputSettings.mode", "binary".into());
        tree.set_path("sensorSettings.0.minPushInterval", 1.5.into());

        let summary = set_properties(&mut host, &uid, &tree).unwrap();
        assert_eq!(summary.applied, 4);
        assert!(summary.failures.is_empty());
        assert!(!summary.is_failure());

        let device = host.find_device(&uid).unwrap();
        assert_eq!(device.name(), "desk lamp");
        assert_eq!(device.zone_id(), Some(4));
        assert_eq!(device.output().unwrap().mode(), OutputMode::Binary);
        assert_eq!(
            device.sensors()[0].min_push_interval(),
            Duration::from_secs_f64(1.5)
        );
    }

    #[test]
    fn read_only_writes_skip_silently() {
        let (mut host, uid, _dir) = host_with_device();
        let mut tree = PropertyValue::empty_map();
        tree.set_path("dSUID", "0000".into());
        tree.set_path("model", "evil".into());
        tree.set_path("name", "ok".into());

        let summary = set_properties(&mut host, &uid, &tree).unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.read_only, 2);
        assert!(!summary.is_failure());
        assert_eq!(host.find_device(&uid).unwrap().model(), "dim-1");
    }

    #[test]
    fn all_leaves_failing_is_a_failure() {
        let (mut host, uid, _dir) = host_with_device();
        let mut tree = PropertyValue::empty_map();
        tree.set_path("zoneID", "not a number".into());

        let summary = set_properties(&mut host, &uid, &tree).unwrap();
        assert!(summary.is_failure());
        assert!(summary.first_failure().unwrap().contains("zoneID"));
    }

    #[test]
    fn mixed_failure_and_success_still_succeeds() {
        let (mut host, uid, _dir) = host_with_device();
        let mut tree = PropertyValue::empty_map();
        tree.set_path("zoneID", "bad".into());
        tree.set_path("name", "fine".into());

        let summary = set_properties(&mut host, &uid, &tree).unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failures.len(), 1);
        assert!(!summary.is_failure());
    }

    #[test]
    fn scene_write_through_properties() {
        let (mut host, uid, _dir) = host_with_device();
        let mut scene = PropertyMap::new();
        let mut channels = PropertyMap::new();
        channels.insert("1".into(), 42.0.into());
        scene.insert("channels".into(), channels.into());
        scene.insert("ignore_local_priority".into(), true.into());

        let mut tree = PropertyValue::empty_map();
        tree.set_path("scenes.9", scene.into());

        let summary = set_properties(&mut host, &uid, &tree).unwrap();
        assert_eq!(summary.applied, 1);

        let device = host.find_device(&uid).unwrap();
        let config = device.scene(9).unwrap();
        assert_eq!(config.channels[&1], 42.0);
        assert!(config.ignore_local_priority);
    }

    #[test]
    fn connector_zone_write() {
        let (mut host, _uid, _dir) = host_with_device();
        let connector_uid = host.connectors().next().unwrap().dsuid();
        let mut tree = PropertyValue::empty_map();
        tree.set_path("zoneID", 7i64.into());

        let summary = set_properties(&mut host, &connector_uid, &tree).unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(host.connector(&connector_uid).unwrap().zone_id(), Some(7));
    }
}
