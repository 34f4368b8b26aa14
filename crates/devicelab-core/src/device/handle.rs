//! A connected device and its readiness checks.

use super::capability::{DeviceInfo, DeviceProtocol, InstalledApp, ProductVersion};
use crate::error::{DeviceError, TunnelError};
use crate::offload::BlockingPool;
use crate::tunnel::{TunnelDescriptor, TunnelManager};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// From this version developer services are only reachable through a tunnel.
const TUNNEL_MIN_VERSION: [u32; 2] = [17, 0];

/// From this version developer mode must be enabled to mount the DDI.
const DEVELOPER_MODE_MIN_VERSION: [u32; 2] = [16, 0];

/// Snapshot of a device's readiness.
///
/// Fields that do not apply to the device's OS version are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub paired: bool,
    pub developer_mode_enabled: Option<bool>,
    pub ddi_mounted: bool,
    pub tunnel_connected: Option<bool>,
}

/// One physical device.
///
/// Mutating operations (mount, install, ...) are not serialized here; callers
/// must not run two of them against the same device at once.
pub struct Device {
    udid: String,
    protocol: Arc<dyn DeviceProtocol>,
    pool: BlockingPool,
    version: OnceCell<ProductVersion>,
    tunnel: RwLock<Option<TunnelDescriptor>>,
}

impl Device {
    pub fn new(protocol: Arc<dyn DeviceProtocol>, pool: BlockingPool) -> Self {
        Self {
            udid: protocol.udid(),
            protocol,
            pool,
            version: OnceCell::new(),
            tunnel: RwLock::new(None),
        }
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    async fn call<T, F>(&self, f: F) -> Result<T, DeviceError>
    where
        F: FnOnce(&dyn DeviceProtocol) -> Result<T, DeviceError> + Send + 'static,
        T: Send + 'static,
    {
        let protocol = Arc::clone(&self.protocol);
        self.pool.try_run(move || f(protocol.as_ref())).await
    }

    pub async fn info(&self) -> Result<DeviceInfo, DeviceError> {
        self.call(|p| p.info()).await
    }

    /// OS version, read once and cached.
    pub async fn product_version(&self) -> Result<&ProductVersion, DeviceError> {
        self.version
            .get_or_try_init(|| async {
                let info = self.info().await?;
                info.product_version.parse::<ProductVersion>()
            })
            .await
    }

    pub async fn requires_tunnel(&self) -> Result<bool, DeviceError> {
        Ok(*self.product_version().await? >= ProductVersion::new(TUNNEL_MIN_VERSION))
    }

    pub async fn requires_developer_mode(&self) -> Result<bool, DeviceError> {
        Ok(*self.product_version().await? >= ProductVersion::new(DEVELOPER_MODE_MIN_VERSION))
    }

    // ------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------

    pub async fn paired(&self) -> Result<bool, DeviceError> {
        self.call(|p| p.paired()).await
    }

    pub async fn check_paired(&self) -> Result<(), DeviceError> {
        if !self.paired().await? {
            return Err(DeviceError::NotPaired(self.udid.clone()));
        }
        Ok(())
    }

    pub async fn pair(&self) -> Result<(), DeviceError> {
        tracing::debug!(udid = %self.udid, "Pairing device");
        self.call(|p| p.pair()).await
    }

    pub async fn unpair(&self) -> Result<(), DeviceError> {
        self.check_paired().await?;
        tracing::debug!(udid = %self.udid, "Unpairing device");
        self.call(|p| p.unpair()).await
    }

    // ------------------------------------------------------------------
    // Developer mode
    // ------------------------------------------------------------------

    /// # Errors
    ///
    /// [`DeviceError::DeveloperModeNotSupported`] below version 16.0,
    /// [`DeviceError::NotPaired`] if the device is not paired.
    pub async fn developer_mode_enabled(&self) -> Result<bool, DeviceError> {
        if !self.requires_developer_mode().await? {
            let version = self.product_version().await?.to_string();
            tracing::warn!(udid = %self.udid, %version, "Developer mode not supported");
            return Err(DeviceError::DeveloperModeNotSupported(version));
        }
        self.check_paired().await?;
        self.call(|p| p.developer_mode_status()).await
    }

    pub async fn check_developer_mode_enabled(&self) -> Result<(), DeviceError> {
        if !self.developer_mode_enabled().await? {
            return Err(DeviceError::DeveloperModeNotEnabled);
        }
        Ok(())
    }

    pub async fn enable_developer_mode(&self) -> Result<(), DeviceError> {
        if self.developer_mode_enabled().await? {
            return Err(DeviceError::DeveloperModeAlreadyEnabled);
        }
        tracing::debug!(udid = %self.udid, "Enabling developer mode");
        self.call(|p| p.enable_developer_mode()).await
    }

    // ------------------------------------------------------------------
    // Developer disk image
    // ------------------------------------------------------------------

    /// Whether the DDI is mounted.
    ///
    /// Requires a paired device, and developer mode where the version has it.
    pub async fn ddi_mounted(&self) -> Result<bool, DeviceError> {
        match self.check_developer_mode_enabled().await {
            Ok(()) => {}
            Err(DeviceError::DeveloperModeNotSupported(_)) => self.check_paired().await?,
            Err(e) => return Err(e),
        }
        self.call(|p| p.is_image_mounted()).await
    }

    pub async fn check_ddi_mounted(&self) -> Result<(), DeviceError> {
        if !self.ddi_mounted().await? {
            return Err(DeviceError::DdiNotMounted);
        }
        Ok(())
    }

    /// Mount the DDI. Fails with [`DeviceError::DdiAlreadyMounted`] rather
    /// than doing nothing if it is already mounted.
    pub async fn mount_ddi(&self) -> Result<(), DeviceError> {
        if self.ddi_mounted().await? {
            return Err(DeviceError::DdiAlreadyMounted);
        }
        tracing::debug!(udid = %self.udid, "Mounting developer disk image");
        self.call(|p| p.mount_image()).await.map_err(|e| match e {
            DeviceError::DdiMounting(_) => e,
            other => DeviceError::DdiMounting(other.to_string()),
        })
    }

    pub async fn unmount_ddi(&self) -> Result<(), DeviceError> {
        self.check_ddi_mounted().await?;
        tracing::debug!(udid = %self.udid, "Unmounting developer disk image");
        self.call(|p| p.unmount_image()).await.map_err(|e| match e {
            DeviceError::DdiMounting(_) => e,
            other => DeviceError::DdiMounting(other.to_string()),
        })
    }

    // ------------------------------------------------------------------
    // Tunnel
    // ------------------------------------------------------------------

    /// Make sure a tunnel to this device exists, reusing a live one.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::TunnelNotSupported`] below version 17.0.
    /// - [`DeviceError::DdiNotMounted`] and the pairing and developer mode
    ///   errors of [`ddi_mounted`](Self::ddi_mounted).
    /// - [`DeviceError::TunnelCreationFailure`] if the tunnel server fails.
    pub async fn establish_trusted_channel(
        &self,
        tunnels: &TunnelManager,
    ) -> Result<TunnelDescriptor, DeviceError> {
        if !self.requires_tunnel().await? {
            let version = self.product_version().await?.to_string();
            tracing::error!(udid = %self.udid, %version, "Tunnel requested for unsupported version");
            return Err(DeviceError::TunnelNotSupported(version));
        }
        self.check_ddi_mounted().await?;

        let tunnel = self
            .find_or_create_tunnel(tunnels)
            .await
            .map_err(|source| DeviceError::TunnelCreationFailure {
                udid: self.udid.clone(),
                source,
            })?;

        tracing::info!(
            udid = %self.udid,
            address = %tunnel.address,
            port = tunnel.port,
            "Trusted channel established"
        );
        *self.tunnel.write().await = Some(tunnel.clone());
        Ok(tunnel)
    }

    async fn find_or_create_tunnel(
        &self,
        tunnels: &TunnelManager,
    ) -> Result<TunnelDescriptor, TunnelError> {
        if let Some(tunnel) = tunnels.get_tunnel(&self.udid).await? {
            tracing::debug!(udid = %self.udid, "Reusing existing tunnel");
            return Ok(tunnel);
        }
        match tunnels.create_tunnel(&self.udid).await {
            Ok(tunnel) => Ok(tunnel),
            // Created concurrently by someone else.
            Err(TunnelError::AlreadyExists { .. }) => tunnels
                .get_tunnel(&self.udid)
                .await?
                .ok_or_else(|| TunnelError::NotFound(format!("no tunnel for {}", self.udid))),
            Err(e) => Err(e),
        }
    }

    /// The tunnel established by this handle, if any.
    pub async fn tunnel(&self) -> Option<TunnelDescriptor> {
        self.tunnel.read().await.clone()
    }

    /// Forget the local tunnel state after the tunnel was closed.
    pub async fn clear_tunnel(&self) {
        self.tunnel.write().await.take();
    }

    // ------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------

    /// Check everything developer tools need, in dependency order.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotReadyForDvt`] wrapping the first failed check.
    pub async fn check_dvt_ready(&self) -> Result<(), DeviceError> {
        self.dvt_checks()
            .await
            .map_err(|e| DeviceError::NotReadyForDvt(Box::new(e)))
    }

    async fn dvt_checks(&self) -> Result<(), DeviceError> {
        self.check_paired().await?;
        if self.requires_developer_mode().await? {
            self.check_developer_mode_enabled().await?;
        }
        self.check_ddi_mounted().await?;
        if self.requires_tunnel().await? && self.tunnel().await.is_none() {
            return Err(DeviceError::TunnelNotConnected);
        }
        Ok(())
    }

    /// Readiness snapshot. Stops querying at the first unmet requirement.
    pub async fn status(&self) -> Result<DeviceStatus, DeviceError> {
        let requires_developer_mode = self.requires_developer_mode().await?;
        let requires_tunnel = self.requires_tunnel().await?;
        let mut status = DeviceStatus {
            paired: false,
            developer_mode_enabled: requires_developer_mode.then_some(false),
            ddi_mounted: false,
            tunnel_connected: requires_tunnel.then_some(false),
        };

        if !self.paired().await? {
            return Ok(status);
        }
        status.paired = true;

        if requires_developer_mode {
            if !self.developer_mode_enabled().await? {
                return Ok(status);
            }
            status.developer_mode_enabled = Some(true);
        }

        if !self.ddi_mounted().await? {
            return Ok(status);
        }
        status.ddi_mounted = true;

        if requires_tunnel {
            status.tunnel_connected = Some(self.tunnel().await.is_some());
        }
        Ok(status)
    }

    // ------------------------------------------------------------------
    // Apps
    // ------------------------------------------------------------------

    pub async fn install_app(&self, package: impl Into<PathBuf>) -> Result<(), DeviceError> {
        let package = package.into();
        tracing::info!(udid = %self.udid, package = %package.display(), "Installing app");
        self.call(move |p| p.install_app(&package)).await
    }

    pub async fn uninstall_app(&self, bundle_id: &str) -> Result<(), DeviceError> {
        tracing::info!(udid = %self.udid, bundle_id, "Uninstalling app");
        let bundle_id = bundle_id.to_string();
        self.call(move |p| p.uninstall_app(&bundle_id)).await
    }

    pub async fn list_apps(&self) -> Result<Vec<InstalledApp>, DeviceError> {
        self.call(|p| p.list_apps()).await
    }

    pub async fn launch_app(&self, bundle_id: &str) -> Result<u32, DeviceError> {
        let bundle = bundle_id.to_string();
        let pid = self.call(move |p| p.launch_app(&bundle)).await?;
        tracing::debug!(udid = %self.udid, bundle_id, pid, "App launched");
        Ok(pid)
    }

    pub async fn terminate_app(&self, bundle_id: &str) -> Result<(), DeviceError> {
        let bundle_id = bundle_id.to_string();
        self.call(move |p| p.terminate_app(&bundle_id)).await
    }

    pub async fn pid_for_app(&self, bundle_id: &str) -> Result<Option<u32>, DeviceError> {
        let bundle_id = bundle_id.to_string();
        self.call(move |p| p.pid_for_app(&bundle_id)).await
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("udid", &self.udid)
            .field("version", &self.version.get())
            .finish()
    }
}
