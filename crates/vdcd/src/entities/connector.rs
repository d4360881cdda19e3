//! A connector: one logical collection of related devices, usually mapping
//! to a single upstream technology or gateway.
//!
//! The connector owns its devices exclusively, derives their identities, and
//! drives their announcement: announcing a connector emits its own
//! notification followed by one announce-device per child, after which each
//! child is frozen by the feature-immutability rule.

use crate::entities::device::{Device, DeviceError};
use crate::persistence::Store;
use crate::push::PushSender;
use crate::scenes::LocalPriority;
use crate::templates::{definition_from_properties, DeviceDefinition};
use std::collections::BTreeMap;
use tracing::{info, warn};
use vdcproto::{DsUid, Envelope, Message, PropertyMap, PropertyValue};

/// Controller-visible capability switches of a connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub metering: bool,
    pub identification: bool,
    pub dynamic_definitions: bool,
}

pub struct Connector {
    dsuid: DsUid,
    name: String,
    model: String,
    vendor: String,
    capabilities: Capabilities,
    zone_id: Option<i64>,
    devices: BTreeMap<DsUid, Device>,
    push: PushSender,
    store: Store,
}

impl Connector {
    pub fn new(
        dsuid: DsUid,
        name: impl Into<String>,
        model: impl Into<String>,
        vendor: impl Into<String>,
        push: PushSender,
        store: Store,
    ) -> Self {
        Self {
            dsuid,
            name: name.into(),
            model: model.into(),
            vendor: vendor.into(),
            capabilities: Capabilities::default(),
            zone_id: None,
            devices: BTreeMap::new(),
            push,
            store,
        }
    }

    pub fn dsuid(&self) -> DsUid {
        self.dsuid
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

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    pub fn zone_id(&self) -> Option<i64> {
        self.zone_id
    }

    pub fn set_zone_id(&mut self, zone: Option<i64>) {
        self.zone_id = zone;
        self.persist();
    }

    // --- device management ---

    /// Create a device under this connector. The device dSUID is derived
    /// deterministically from the vendor and hardware key.
    pub fn create_device(
        &mut self,
        hardware_key: &str,
        enumeration: u8,
        name: impl Into<String>,
        model: impl Into<String>,
    ) -> DsUid {
        let dsuid = DsUid::device(&self.vendor, hardware_key, enumeration);
        let device = Device::new(
            dsuid,
            self.dsuid,
            name,
            model,
            self.push.clone(),
            self.store.clone(),
        );
        info!(connector = %self.dsuid, device = %dsuid, "device created");
        self.devices.insert(dsuid, device);
        dsuid
    }

    /// Instantiate a device from an identity-free definition.
    pub fn instantiate_device(
        &mut self,
        hardware_key: &str,
        enumeration: u8,
        definition: &DeviceDefinition,
    ) -> Result<DsUid, DeviceError> {
        let dsuid = DsUid::device(&self.vendor, hardware_key, enumeration);
        let mut device = Device::new(
            dsuid,
            self.dsuid,
            definition.name.clone(),
            definition.model.clone(),
            self.push.clone(),
            self.store.clone(),
        );
        device.apply_definition(definition)?;
        device.persist();
        info!(connector = %self.dsuid, device = %dsuid, "device instantiated from definition");
        self.devices.insert(dsuid, device);
        Ok(dsuid)
    }

    /// Clone an existing device's configuration under a new enumeration.
    /// Fails when the source is already announced.
    pub fn clone_device(&mut self, source: &DsUid, enumeration: u8) -> Result<DsUid, DeviceError> {
        let (definition, source_announced) = match self.devices.get(source) {
            Some(device) => (device.export_definition(), device.announced()),
            None => return Err(DeviceError::UnknownDevice(*source)),
        };
        if source_announced {
            return Err(DeviceError::Announced {
                dsuid: *source,
                operation: "clone",
            });
        }

        let dsuid = source.with_enumeration(enumeration);
        let mut device = Device::new(
            dsuid,
            self.dsuid,
            definition.name.clone(),
            definition.model.clone(),
            self.push.clone(),
            self.store.clone(),
        );
        device.apply_definition(&definition)?;
        device.persist();
        self.devices.insert(dsuid, device);
        Ok(dsuid)
    }

    pub fn device(&self, dsuid: &DsUid) -> Option<&Device> {
        self.devices.get(dsuid)
    }

    pub fn device_mut(&mut self, dsuid: &DsUid) -> Option<&mut Device> {
        self.devices.get_mut(dsuid)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Remove a device, cascading into persistence.
    pub fn remove_device(&mut self, dsuid: &DsUid) -> bool {
        if self.devices.remove(dsuid).is_some() {
            self.store.remove_device(dsuid);
            info!(connector = %self.dsuid, device = %dsuid, "device removed");
            true
        } else {
            false
        }
    }

    // --- announcements ---

    /// Announce this connector, then each child device. Devices are marked
    /// announced afterwards, freezing their feature inventories.
    pub fn announce(&mut self) {
        self.push.send(Envelope::notification(Message::AnnounceConnector {
            dsuid: self.dsuid,
            properties: self.properties(),
        }));

        for device in self.devices.values_mut() {
            let properties = device_announce_properties(device);
            self.push.send(Envelope::notification(Message::AnnounceDevice {
                dsuid: device.dsuid(),
                properties,
            }));
            device.mark_announced();
        }
        info!(connector = %self.dsuid, devices = self.devices.len(), "announced");
    }

    // --- properties ---

    /// Full property tree of the connector itself.
    pub fn properties(&self) -> PropertyValue {
        let mut capabilities = PropertyMap::new();
        capabilities.insert("metering".into(), self.capabilities.metering.into());
        capabilities.insert(
            "identification".into(),
            self.capabilities.identification.into(),
        );
        capabilities.insert(
            "dynamicDefinitions".into(),
            self.capabilities.dynamic_definitions.into(),
        );

        let mut map = PropertyMap::new();
        map.insert("dSUID".into(), self.dsuid.to_hex().into());
        map.insert("name".into(), self.name.clone().into());
        map.insert("model".into(), self.model.clone().into());
        map.insert("capabilities".into(), capabilities.into());
        if let Some(zone) = self.zone_id {
            map.insert("zoneID".into(), zone.into());
        }
        map.into()
    }

    /// Load persisted devices belonging to this connector.
    pub fn load_devices(&mut self) {
        for (key, map) in self.store.devices_for_connector(&self.dsuid) {
            let Ok(dsuid) = key.parse::<DsUid>() else {
                warn!(key, "skipping device with unparseable stored key");
                continue;
            };
            match definition_from_properties(&map) {
                Ok(definition) => {
                    let mut device = Device::new(
                        dsuid,
                        self.dsuid,
                        definition.name.clone(),
                        definition.model.clone(),
                        self.push.clone(),
                        self.store.clone(),
                    );
                    if let Err(e) = device.apply_definition(&definition) {
                        warn!(device = %dsuid, error = %e, "failed to restore device");
                        continue;
                    }
                    device.restore_local_priority(parse_local_priority(map.get("local_priority")));
                    self.devices.insert(dsuid, device);
                }
                Err(e) => warn!(device = %dsuid, error = %e, "unparseable stored device"),
            }
        }
        info!(connector = %self.dsuid, devices = self.devices.len(), "devices loaded");
    }

    fn persist(&self) {
        let map = match self.properties() {
            PropertyValue::Map(map) => map,
            _ => PropertyMap::new(),
        };
        self.store.set_connector(&self.dsuid, map);
    }

    /// Persist the connector and all its devices.
    pub fn persist_all(&self) {
        self.persist();
        for device in self.devices.values() {
            device.persist();
        }
    }
}

/// The announce-device subtree: enough for the controller to render the
/// device before querying full properties.
fn device_announce_properties(device: &Device) -> PropertyValue {
    let mut map = PropertyMap::new();
    map.insert("dSUID".into(), device.dsuid().to_hex().into());
    map.insert("name".into(), device.name().to_string().into());
    map.insert("model".into(), device.model().to_string().into());
    map.insert(
        "primaryGroup".into(),
        (device.primary_group() as i64).into(),
    );
    if let Some(zone) = device.zone_id() {
        map.insert("zoneID".into(), zone.into());
    }
    map.into()
}

fn parse_local_priority(value: Option<&PropertyValue>) -> Option<LocalPriority> {
    match value? {
        PropertyValue::Int(n) => Some(LocalPriority::Scene(*n as u8)),
        PropertyValue::Text(s) if s == "*" => Some(LocalPriority::Global),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::output::OutputFunction;
    use crate::components::output_channel::channel_type;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn connector() -> (Connector, mpsc::UnboundedReceiver<Envelope>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("state.yaml")).unwrap();
        let push = PushSender::new();
        let (tx, rx) = mpsc::unbounded_channel();
        push.connect(tx);
        let connector = Connector::new(
            DsUid::connector("acme", "gw", 0),
            "gateway",
            "gw-1",
            "acme",
            push,
            store,
        );
        (connector, rx, dir)
    }

    #[test]
    fn announce_emits_connector_then_devices_and_freezes() {
        let (mut connector, mut rx, _dir) = connector();
        let dsuid = connector.create_device("lamp-1", 0, "lamp", "dim-1");
        connector
            .device_mut(&dsuid)
            .unwrap()
            .add_output(OutputFunction::Dimmer)
            .unwrap();

        connector.announce();

        match rx.try_recv().unwrap().message {
            Message::AnnounceConnector { dsuid, .. } => {
                assert_eq!(dsuid, connector.dsuid());
            }
            other => panic!("expected connector announce, got {other:?}"),
        }
        match rx.try_recv().unwrap().message {
            Message::AnnounceDevice { dsuid: announced, .. } => {
                assert_eq!(announced, dsuid);
            }
            other => panic!("expected device announce, got {other:?}"),
        }
        assert!(connector.device(&dsuid).unwrap().announced());
    }

    #[test]
    fn clone_device_copies_configuration_under_new_enumeration() {
        let (mut connector, _rx, _dir) = connector();
        let source = connector.create_device("lamp-1", 0, "lamp", "dim-1");
        {
            let device = connector.device_mut(&source).unwrap();
            device.add_output(OutputFunction::Dimmer).unwrap();
            device
                .add_output_channel(channel_type::BRIGHTNESS, 0.0, 100.0, 0.1)
                .unwrap();
        }

        let clone = connector.clone_device(&source, 1).unwrap();
        assert_ne!(clone, source);
        assert_eq!(clone.enumeration(), 1);
        assert_eq!(
            connector
                .device(&clone)
                .unwrap()
                .output()
                .unwrap()
                .channels()
                .count(),
            1
        );
    }

    #[test]
    fn clone_of_announced_device_fails() {
        let (mut connector, _rx, _dir) = connector();
        let source = connector.create_device("lamp-1", 0, "lamp", "dim-1");
        connector.announce();

        assert!(matches!(
            connector.clone_device(&source, 1),
            Err(DeviceError::Announced { .. })
        ));
    }

    #[test]
    fn devices_reload_from_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.yaml");
        let connector_uid = DsUid::connector("acme", "gw", 0);
        let device_uid;
        {
            let store = Store::open(&path).unwrap();
            let mut connector =
                Connector::new(connector_uid, "gateway", "gw-1", "acme", PushSender::new(), store);
            device_uid = connector.create_device("lamp-1", 0, "lamp", "dim-1");
            {
                let device = connector.device_mut(&device_uid).unwrap();
                device.add_output(OutputFunction::Dimmer).unwrap();
                device
                    .add_output_channel(channel_type::BRIGHTNESS, 0.0, 100.0, 0.1)
                    .unwrap();
                device.set_local_priority(Some(5));
            }
            connector.persist_all();
        }

        let store = Store::open(&path).unwrap();
        let mut reloaded =
            Connector::new(connector_uid, "gateway", "gw-1", "acme", PushSender::new(), store);
        reloaded.load_devices();

        assert_eq!(reloaded.device_count(), 1);
        let device = reloaded.device(&device_uid).unwrap();
        assert_eq!(device.name(), "lamp");
        assert_eq!(device.local_priority(), Some(LocalPriority::Scene(5)));
        assert_eq!(device.output().unwrap().channels().count(), 1);
    }

    #[test]
    fn remove_device_cascades_to_store() {
        let (mut connector, _rx, _dir) = connector();
        let dsuid = connector.create_device("lamp-1", 0, "lamp", "dim-1");
        connector.device_mut(&dsuid).unwrap().persist();
        assert!(connector.remove_device(&dsuid));
        assert!(connector.device(&dsuid).is_none());
        assert!(!connector.remove_device(&dsuid));
    }
}
