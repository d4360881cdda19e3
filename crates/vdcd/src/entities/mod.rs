//! Entity tree: host → connectors → devices. Ownership flows strictly
//! downward; back-references are lookup-only.

pub mod connector;
pub mod device;
pub mod host;

pub use connector::{Capabilities, Connector};
pub use device::{ActionHandler, Device, DeviceAction, DeviceError, DeviceHooks};
pub use host::{VdcHost, API_VERSION};
