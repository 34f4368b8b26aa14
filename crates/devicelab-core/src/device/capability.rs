//! Capability interfaces implemented by the device-communication library.
//!
//! Both traits are synchronous; [`Device`](super::Device) runs every call on
//! the [`BlockingPool`](crate::offload::BlockingPool).

use crate::error::DeviceError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Static device information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(alias = "DeviceClass")]
    pub device_class: String,
    #[serde(alias = "DeviceName")]
    pub device_name: String,
    #[serde(alias = "BuildVersion")]
    pub build_version: String,
    #[serde(alias = "ProductVersion")]
    pub product_version: String,
    #[serde(alias = "ProductType")]
    pub product_type: String,
}

/// An application installed on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledApp {
    pub bundle_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Primitives of one connected device.
///
/// Implementations report failures with the matching [`DeviceError`]
/// variant (for example [`DeviceError::UserDeniedPairing`] from `pair`).
pub trait DeviceProtocol: Send + Sync + 'static {
    fn udid(&self) -> String;

    fn info(&self) -> Result<DeviceInfo, DeviceError>;

    fn paired(&self) -> Result<bool, DeviceError>;

    fn pair(&self) -> Result<(), DeviceError>;

    fn unpair(&self) -> Result<(), DeviceError>;

    fn developer_mode_status(&self) -> Result<bool, DeviceError>;

    fn enable_developer_mode(&self) -> Result<(), DeviceError>;

    fn is_image_mounted(&self) -> Result<bool, DeviceError>;

    /// Mount the developer disk image matching the device's version.
    fn mount_image(&self) -> Result<(), DeviceError>;

    fn unmount_image(&self) -> Result<(), DeviceError>;

    fn install_app(&self, package: &Path) -> Result<(), DeviceError>;

    fn uninstall_app(&self, bundle_id: &str) -> Result<(), DeviceError>;

    fn list_apps(&self) -> Result<Vec<InstalledApp>, DeviceError>;

    /// Launch an app and return its pid.
    fn launch_app(&self, bundle_id: &str) -> Result<u32, DeviceError>;

    fn terminate_app(&self, bundle_id: &str) -> Result<(), DeviceError>;

    /// Pid of the running app, or `None` if it is not running.
    fn pid_for_app(&self, bundle_id: &str) -> Result<Option<u32>, DeviceError>;
}

/// Enumerates the devices currently connected to this host.
pub trait DeviceDiscovery: Send + Sync + 'static {
    fn discover(&self) -> Result<Vec<Arc<dyn DeviceProtocol>>, DeviceError>;
}

/// Dotted numeric OS version such as `17.0` or `16.4.1`.
///
/// Missing components compare as zero, so `17` equals `17.0.0`.
#[derive(Debug, Clone, Eq)]
pub struct ProductVersion(Vec<u32>);

impl ProductVersion {
    pub fn new(components: impl Into<Vec<u32>>) -> Self {
        Self(components.into())
    }

    fn component(&self, index: usize) -> u32 {
        self.0.get(index).copied().unwrap_or(0)
    }
}

impl FromStr for ProductVersion {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = s
            .trim()
            .split('.')
            .map(str::parse)
            .collect::<Result<Vec<u32>, _>>()
            .map_err(|_| DeviceError::InvalidVersion(s.to_string()))?;
        Ok(Self(components))
    }
}

impl PartialEq for ProductVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for ProductVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for ProductVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}
