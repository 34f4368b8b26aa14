//! In-memory device used by unit tests.

use super::capability::{DeviceDiscovery, DeviceInfo, DeviceProtocol, InstalledApp};
use crate::error::DeviceError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) struct FakeDevice {
    udid: String,
    version: String,
    paired: AtomicBool,
    developer_mode: AtomicBool,
    mounted: AtomicBool,
    next_pid: AtomicU32,
    installed: Mutex<Vec<String>>,
    running: Mutex<HashMap<String, u32>>,
}

impl FakeDevice {
    pub(crate) fn new(udid: &str, version: &str) -> Self {
        Self {
            udid: udid.into(),
            version: version.into(),
            paired: AtomicBool::new(true),
            developer_mode: AtomicBool::new(true),
            mounted: AtomicBool::new(false),
            next_pid: AtomicU32::new(100),
            installed: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_paired(&self, paired: bool) {
        self.paired.store(paired, Ordering::SeqCst);
    }

    pub(crate) fn set_developer_mode(&self, enabled: bool) {
        self.developer_mode.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::SeqCst);
    }

    pub(crate) fn mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    pub(crate) fn installed(&self) -> Vec<String> {
        self.installed.lock().unwrap().clone()
    }
}

impl DeviceProtocol for FakeDevice {
    fn udid(&self) -> String {
        self.udid.clone()
    }

    fn info(&self) -> Result<DeviceInfo, DeviceError> {
        Ok(DeviceInfo {
            device_class: "iPhone".into(),
            device_name: format!("fake-{}", self.udid),
            build_version: "21A329".into(),
            product_version: self.version.clone(),
            product_type: "iPhone15,2".into(),
        })
    }

    fn paired(&self) -> Result<bool, DeviceError> {
        Ok(self.paired.load(Ordering::SeqCst))
    }

    fn pair(&self) -> Result<(), DeviceError> {
        self.set_paired(true);
        Ok(())
    }

    fn unpair(&self) -> Result<(), DeviceError> {
        self.set_paired(false);
        Ok(())
    }

    fn developer_mode_status(&self) -> Result<bool, DeviceError> {
        Ok(self.developer_mode.load(Ordering::SeqCst))
    }

    fn enable_developer_mode(&self) -> Result<(), DeviceError> {
        self.set_developer_mode(true);
        Ok(())
    }

    fn is_image_mounted(&self) -> Result<bool, DeviceError> {
        Ok(self.mounted())
    }

    fn mount_image(&self) -> Result<(), DeviceError> {
        self.set_mounted(true);
        Ok(())
    }

    fn unmount_image(&self) -> Result<(), DeviceError> {
        self.set_mounted(false);
        Ok(())
    }

    fn install_app(&self, package: &Path) -> Result<(), DeviceError> {
        self.installed
            .lock()
            .unwrap()
            .push(package.display().to_string());
        Ok(())
    }

    fn uninstall_app(&self, _bundle_id: &str) -> Result<(), DeviceError> {
        Ok(())
    }

    fn list_apps(&self) -> Result<Vec<InstalledApp>, DeviceError> {
        Ok(Vec::new())
    }

    fn launch_app(&self, bundle_id: &str) -> Result<u32, DeviceError> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.running.lock().unwrap().insert(bundle_id.into(), pid);
        Ok(pid)
    }

    fn terminate_app(&self, bundle_id: &str) -> Result<(), DeviceError> {
        self.running.lock().unwrap().remove(bundle_id);
        Ok(())
    }

    fn pid_for_app(&self, bundle_id: &str) -> Result<Option<u32>, DeviceError> {
        Ok(self.running.lock().unwrap().get(bundle_id).copied())
    }
}

/// Discovery returning a fixed, mutable set of devices.
#[derive(Default)]
pub(crate) struct FakeDiscovery {
    devices: Mutex<Vec<Arc<FakeDevice>>>,
    pub(crate) calls: AtomicU32,
}

impl FakeDiscovery {
    pub(crate) fn connect(&self, device: FakeDevice) {
        self.devices.lock().unwrap().push(Arc::new(device));
    }
}

impl DeviceDiscovery for FakeDiscovery {
    fn discover(&self) -> Result<Vec<Arc<dyn DeviceProtocol>>, DeviceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn DeviceProtocol>)
            .collect())
    }
}
