//! Physical devices: capability interfaces, handles and the registry.

mod capability;
mod handle;
mod manager;

#[cfg(test)]
pub(crate) mod fake;

pub use capability::{
    DeviceDiscovery, DeviceInfo, DeviceProtocol, InstalledApp, ProductVersion,
};
pub use handle::{Device, DeviceStatus};
pub use manager::DeviceManager;
