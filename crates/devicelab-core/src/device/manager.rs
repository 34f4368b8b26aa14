//! Registry of known devices.

use super::capability::DeviceDiscovery;
use super::handle::Device;
use crate::error::DeviceError;
use crate::offload::BlockingPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Caches one [`Device`] handle per udid for the manager's lifetime.
///
/// Discovery is delegated to a [`DeviceDiscovery`]. Handles are created the
/// first time a udid is seen and reused afterwards, so tunnel state recorded
/// on a handle is visible to every later caller. Devices that disconnect stay
/// in the cache.
pub struct DeviceManager {
    discovery: Arc<dyn DeviceDiscovery>,
    pool: BlockingPool,
    devices: RwLock<HashMap<String, Arc<Device>>>,
}

impl DeviceManager {
    pub fn new(discovery: Arc<dyn DeviceDiscovery>, pool: BlockingPool) -> Self {
        tracing::info!("Creating device manager");
        Self {
            discovery,
            pool,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Discover connected devices and return every known device, by udid.
    pub async fn list_devices(&self) -> Result<Vec<Arc<Device>>, DeviceError> {
        let discovery = Arc::clone(&self.discovery);
        let found = self.pool.try_run(move || discovery.discover()).await?;

        let mut devices = self.devices.write().await;
        for protocol in found {
            let udid = protocol.udid();
            if devices.contains_key(&udid) {
                continue;
            }
            tracing::info!(udid = %udid, "Device registered");
            devices.insert(udid, Arc::new(Device::new(protocol, self.pool.clone())));
        }

        let mut all: Vec<Arc<Device>> = devices.values().cloned().collect();
        all.sort_by(|a, b| a.udid().cmp(b.udid()));
        Ok(all)
    }

    /// The handle for `udid`, discovering devices if it is not cached yet.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] if no connected device has this udid.
    pub async fn get_device(&self, udid: &str) -> Result<Arc<Device>, DeviceError> {
        if let Some(device) = self.devices.read().await.get(udid) {
            return Ok(Arc::clone(device));
        }

        tracing::debug!(udid = %udid, "Device not cached, discovering");
        self.list_devices()
            .await?
            .into_iter()
            .find(|d| d.udid() == udid)
            .ok_or_else(|| DeviceError::NotFound(udid.to_string()))
    }

    /// Number of cached devices.
    pub async fn count(&self) -> usize {
        self.devices.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::{FakeDevice, FakeDiscovery};
    use std::sync::atomic::Ordering;

    fn manager() -> (Arc<FakeDiscovery>, DeviceManager) {
        let discovery = Arc::new(FakeDiscovery::default());
        let manager = DeviceManager::new(discovery.clone(), BlockingPool::new(2));
        (discovery, manager)
    }

    #[tokio::test]
    async fn test_list_devices_caches_handles() {
        let (discovery, manager) = manager();
        discovery.connect(FakeDevice::new("b", "17.0"));
        discovery.connect(FakeDevice::new("a", "16.0"));

        let first = manager.list_devices().await.unwrap();
        let udids: Vec<&str> = first.iter().map(|d| d.udid()).collect();
        assert_eq!(udids, vec!["a", "b"]);

        let second = manager.list_devices().await.unwrap();
        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(manager.count().await, 2);
    }

    #[tokio::test]
    async fn test_get_device_discovers_once() {
        let (discovery, manager) = manager();
        discovery.connect(FakeDevice::new("a", "17.0"));

        let first = manager.get_device("a").await.unwrap();
        let second = manager.get_device("a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_device() {
        let (_, manager) = manager();
        assert!(matches!(
            manager.get_device("nope").await,
            Err(DeviceError::NotFound(udid)) if udid == "nope"
        ));
    }
}
