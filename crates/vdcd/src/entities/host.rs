//! The vDC host: process-wide root of the entity tree.
//!
//! The host owns its connectors exclusively, which in turn own their
//! devices; back-references are lookup-only. The host also owns the push
//! slot the active session plugs into, and the disconnect bookkeeping that
//! guarantees the disconnect hook fires exactly once per session.

use crate::entities::connector::Connector;
use crate::entities::device::Device;
use crate::persistence::Store;
use crate::push::PushSender;
use std::collections::BTreeMap;
use tracing::{info, warn};
use vdcconf::VdcConfig;
use vdcproto::{DsUid, Envelope, Message, PropertyMap, PropertyValue};

/// Protocol API version reported in the hello response.
pub const API_VERSION: &str = "3.0";

pub struct VdcHost {
    dsuid: DsUid,
    name: String,
    vendor: String,
    model: String,
    model_version: String,
    identity: String,
    port: u16,
    connectors: BTreeMap<DsUid, Connector>,
    push: PushSender,
    store: Store,
}

impl VdcHost {
    pub fn new(config: &VdcConfig, store: Store) -> Self {
        let dsuid = DsUid::host(&config.host.vendor, &config.host.identity);
        info!(dsuid = %dsuid, name = %config.host.name, "vDC host created");
        Self {
            dsuid,
            name: config.host.name.clone(),
            vendor: config.host.vendor.clone(),
            model: config.host.model.clone(),
            model_version: env!("CARGO_PKG_VERSION").to_string(),
            identity: config.host.identity.clone(),
            port: config.bind.port,
            connectors: BTreeMap::new(),
            push: PushSender::new(),
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

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn push_sender(&self) -> PushSender {
        self.push.clone()
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    // --- session integration ---

    /// Attach the active session's outbound channel to the push pipeline.
    pub fn session_connected(&self, tx: tokio::sync::mpsc::UnboundedSender<Envelope>) {
        self.push.connect(tx);
    }

    /// Disconnect hook; safe to call repeatedly, only the first call after a
    /// connect does anything.
    pub fn session_disconnected(&self) {
        if self.push.is_connected() {
            self.push.disconnect();
            info!("session disconnected, push pipeline detached");
        }
    }

    pub fn has_session(&self) -> bool {
        self.push.is_connected()
    }

    // --- connector management ---

    /// Create a connector. Its dSUID is derived from the host identity and
    /// the connector index.
    pub fn create_connector(
        &mut self,
        index: u8,
        name: impl Into<String>,
        model: impl Into<String>,
    ) -> DsUid {
        let dsuid = DsUid::connector(&self.vendor, &self.identity, index);
        let connector = Connector::new(
            dsuid,
            name,
            model,
            self.vendor.clone(),
            self.push.clone(),
            self.store.clone(),
        );
        self.connectors.insert(dsuid, connector);
        info!(connector = %dsuid, "connector created");
        dsuid
    }

    pub fn connector(&self, dsuid: &DsUid) -> Option<&Connector> {
        self.connectors.get(dsuid)
    }

    pub fn connector_mut(&mut self, dsuid: &DsUid) -> Option<&mut Connector> {
        self.connectors.get_mut(dsuid)
    }

    pub fn connectors(&self) -> impl Iterator<Item = &Connector> {
        self.connectors.values()
    }

    pub fn connectors_mut(&mut self) -> impl Iterator<Item = &mut Connector> {
        self.connectors.values_mut()
    }

    /// Remove a connector and all of its devices, cascading into the store.
    pub fn remove_connector(&mut self, dsuid: &DsUid) -> bool {
        if self.connectors.remove(dsuid).is_some() {
            self.store.remove_connector(dsuid);
            info!(connector = %dsuid, "connector removed");
            true
        } else {
            false
        }
    }

    // --- device lookup across connectors ---

    pub fn find_device(&self, dsuid: &DsUid) -> Option<&Device> {
        self.connectors.values().find_map(|c| c.device(dsuid))
    }

    pub fn find_device_mut(&mut self, dsuid: &DsUid) -> Option<&mut Device> {
        self.connectors
            .values_mut()
            .find_map(|c| c.device_mut(dsuid))
    }

    /// Remove a device on controller request. Returns whether it existed.
    pub fn remove_device(&mut self, dsuid: &DsUid) -> bool {
        for connector in self.connectors.values_mut() {
            if connector.remove_device(dsuid) {
                return true;
            }
        }
        false
    }

    /// Host-initiated removal: remove and tell the controller it vanished.
    pub fn vanish_device(&mut self, dsuid: &DsUid) -> bool {
        if self.remove_device(dsuid) {
            self.push
                .send(Envelope::notification(Message::Vanish { dsuid: *dsuid }));
            true
        } else {
            false
        }
    }

    // --- announcements ---

    /// Announce every connector (each announces its own devices).
    pub fn announce_all(&mut self) {
        for connector in self.connectors.values_mut() {
            connector.announce();
        }
    }

    // --- persistence ---

    /// Load persisted connectors and their devices.
    pub fn load_persisted(&mut self) {
        for (key, map) in self.store.all_connectors() {
            let Ok(dsuid) = key.parse::<DsUid>() else {
                warn!(key, "skipping connector with unparseable stored key");
                continue;
            };
            let name = map
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("connector")
                .to_string();
            let model = map
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let mut connector = Connector::new(
                dsuid,
                name,
                model,
                self.vendor.clone(),
                self.push.clone(),
                self.store.clone(),
            );
            if let Some(zone) = map.get("zoneID").and_then(|v| v.as_int()) {
                connector.set_zone_id(Some(zone));
            }
            connector.load_devices();
            self.connectors.insert(dsuid, connector);
        }
        info!(connectors = self.connectors.len(), "persisted entities loaded");
    }

    fn persist(&self) {
        let map = match self.properties() {
            PropertyValue::Map(map) => map,
            _ => PropertyMap::new(),
        };
        self.store.set_host(map);
    }

    /// Flush everything to disk; used on shutdown.
    pub fn persist_all(&self) {
        self.persist();
        for connector in self.connectors.values() {
            connector.persist_all();
        }
    }

    // --- properties ---

    /// Full property tree of the host entity.
    pub fn properties(&self) -> PropertyValue {
        let mut map = PropertyMap::new();
        map.insert("dSUID".into(), self.dsuid.to_hex().into());
        map.insert("name".into(), self.name.clone().into());
        map.insert("vendorName".into(), self.vendor.clone().into());
        map.insert("model".into(), self.model.clone().into());
        map.insert("modelVersion".into(), self.model_version.clone().into());
        map.insert("apiVersion".into(), API_VERSION.into());
        map.insert("port".into(), (self.port as i64).into());
        map.into()
    }
}
