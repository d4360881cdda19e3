//! DNS-SD announcement of the vDC API endpoint.
//!
//! Advertises `_ds-vdc._tcp` on mDNS with the listen port and the host
//! dSUID in a TXT record, so the controller can find us without static
//! configuration.

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::info;
use vdcproto::DsUid;

const SERVICE_TYPE: &str = "_ds-vdc._tcp.local.";

pub struct Announcer {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Announcer {
    /// Register the service. Addresses are auto-detected per interface.
    pub fn announce(host_name: &str, dsuid: &DsUid, port: u16) -> Result<Self> {
        let daemon = ServiceDaemon::new().context("failed to start mDNS daemon")?;

        let instance = sanitize_instance(host_name);
        let hostname = format!("{instance}.local.");
        let properties = [("dSUID", dsuid.to_hex())];

        let info = ServiceInfo::new(SERVICE_TYPE, &instance, &hostname, (), port, &properties[..])
            .context("invalid mDNS service info")?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();

        daemon
            .register(info)
            .context("failed to register mDNS service")?;
        info!(service = %fullname, port, "announcing on mDNS");

        Ok(Self { daemon, fullname })
    }

    /// Withdraw the announcement and stop the daemon.
    pub fn shutdown(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }
}

/// mDNS instance names cannot contain dots; keep it conservative.
fn sanitize_instance(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '.' || c == '\0' { '-' } else { c })
        .collect();
    if cleaned.is_empty() {
        "vdcd".to_string()
    } else {
        cleaned
    }
}
