//! Tunnel manager: owns the sidecar process and the connection to it.
//!
//! Requests are serialized over a single connection. A connection that hits
//! a transport failure is dropped and re-established on the next request;
//! protocol errors and `ERROR` responses leave it in place.

use super::client::TunnelClient;
use super::protocol::TunnelDescriptor;
use crate::commands::TunnelServerCommand;
use crate::config::TunnelManagerConfig;
use crate::error::TunnelError;
use crate::process::Process;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;

pub struct TunnelManager {
    config: TunnelManagerConfig,
    server: Mutex<Option<Process>>,
    client: Mutex<Option<TunnelClient>>,
    /// Started or attached, and not yet stopped.
    active: AtomicBool,
}

impl TunnelManager {
    pub fn new(config: TunnelManagerConfig) -> Self {
        Self {
            config,
            server: Mutex::new(None),
            client: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TunnelManagerConfig {
        &self.config
    }

    /// Address of the sidecar socket.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.port))
    }

    /// Launch the sidecar and connect to it.
    ///
    /// # Errors
    ///
    /// [`TunnelError::AlreadyStarted`] if this manager already runs a
    /// sidecar. If the sidecar cannot be reached within the connect timeout
    /// it is killed and the connection error returned.
    pub async fn start(&self) -> Result<(), TunnelError> {
        let mut server = self.server.lock().await;
        if server.as_ref().is_some_and(Process::is_running) {
            return Err(TunnelError::AlreadyStarted);
        }

        let command = TunnelServerCommand::new(&self.config.program, self.config.port)?
            .log_level(&self.config.log_level)
            .provider(self.config.provider.clone());
        let mut process = Process::new(command);
        process.execute(None).await?;
        tracing::info!(
            pid = process.pid(),
            port = self.config.port,
            "Tunnel server started"
        );

        match self.open_client().await {
            Ok(client) => {
                *self.client.lock().await = Some(client);
                *server = Some(process);
                self.active.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Tunnel server unreachable, killing it");
                process.kill()?;
                let output = process.wait().await?;
                if !output.stderr.is_empty() {
                    tracing::debug!(stderr = %output.stderr.join("\n"), "Tunnel server stderr");
                }
                Err(e)
            }
        }
    }

    /// Use a sidecar that is already running on the configured port.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        let client = self.open_client().await?;
        *self.client.lock().await = Some(client);
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Terminate the sidecar, then close the socket.
    ///
    /// The sidecar gets `stop_timeout` to close its tunnels before it is
    /// killed. Does nothing if the manager was never started.
    pub async fn stop(&self) -> Result<(), TunnelError> {
        self.active.store(false, Ordering::SeqCst);

        if let Some(mut process) = self.server.lock().await.take() {
            process.terminate()?;
            if timeout(self.config.stop_timeout, process.wait()).await.is_err() {
                tracing::warn!(
                    pid = process.pid(),
                    timeout_ms = self.config.stop_timeout.as_millis() as u64,
                    "Tunnel server did not stop in time, killing"
                );
                process.kill()?;
                process.wait().await?;
            }
            tracing::info!(code = process.returncode().ok(), "Tunnel server stopped");
        }

        self.client.lock().await.take();
        Ok(())
    }

    /// Started or attached, and the sidecar (if owned) is still running.
    pub async fn is_running(&self) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        match self.server.lock().await.as_ref() {
            Some(process) => process.is_running(),
            None => true,
        }
    }

    /// Create a tunnel to `udid`.
    ///
    /// # Errors
    ///
    /// [`TunnelError::AlreadyExists`] if the device already has a live tunnel.
    pub async fn create_tunnel(&self, udid: &str) -> Result<TunnelDescriptor, TunnelError> {
        let mut guard = self.client().await?;
        let result = match guard.as_mut() {
            Some(client) => client.start_tunnel(udid).await,
            None => Err(TunnelError::NotStarted),
        };
        Self::release_on_transport_error(&mut guard, result)
    }

    pub async fn get_tunnel(&self, udid: &str) -> Result<Option<TunnelDescriptor>, TunnelError> {
        let mut guard = self.client().await?;
        let result = match guard.as_mut() {
            Some(client) => client.get_tunnel(udid).await,
            None => Err(TunnelError::NotStarted),
        };
        Self::release_on_transport_error(&mut guard, result)
    }

    pub async fn close_tunnel(&self, udid: &str) -> Result<(), TunnelError> {
        let mut guard = self.client().await?;
        let result = match guard.as_mut() {
            Some(client) => client.stop_tunnel(udid).await,
            None => Err(TunnelError::NotStarted),
        };
        Self::release_on_transport_error(&mut guard, result)
    }

    pub async fn list_tunnels(&self) -> Result<Vec<TunnelDescriptor>, TunnelError> {
        let mut guard = self.client().await?;
        let result = match guard.as_mut() {
            Some(client) => client.list_tunnels().await,
            None => Err(TunnelError::NotStarted),
        };
        Self::release_on_transport_error(&mut guard, result)
    }

    async fn open_client(&self) -> Result<TunnelClient, TunnelError> {
        Ok(TunnelClient::connect(self.addr(), self.config.connect_timeout)
            .await?
            .with_request_timeout(self.config.request_timeout))
    }

    /// The shared connection, re-established if the previous one was dropped.
    async fn client(&self) -> Result<MutexGuard<'_, Option<TunnelClient>>, TunnelError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(TunnelError::NotStarted);
        }
        let mut guard = self.client.lock().await;
        if guard.as_ref().is_some_and(|c| !c.is_usable()) {
            guard.take();
        }
        if guard.is_none() {
            tracing::info!(addr = %self.addr(), "Reconnecting to tunnel server");
            *guard = Some(self.open_client().await?);
        }
        Ok(guard)
    }

    fn release_on_transport_error<T>(
        guard: &mut MutexGuard<'_, Option<TunnelClient>>,
        result: Result<T, TunnelError>,
    ) -> Result<T, TunnelError> {
        if let Err(e) = &result {
            if is_transport_error(e) {
                tracing::debug!(error = %e, "Dropping tunnel server connection");
                guard.take();
            }
        }
        result
    }
}

fn is_transport_error(err: &TunnelError) -> bool {
    matches!(
        err,
        TunnelError::Connection(_) | TunnelError::Timeout(_) | TunnelError::Closed | TunnelError::Io(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TunnelManagerConfig {
        TunnelManagerConfig::builder()
            .provider(["true"])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_requests_before_start_fail() {
        let manager = TunnelManager::new(config());
        assert!(!manager.is_running().await);
        assert!(matches!(
            manager.create_tunnel("dev").await,
            Err(TunnelError::NotStarted)
        ));
        assert!(matches!(
            manager.list_tunnels().await,
            Err(TunnelError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let manager = TunnelManager::new(config());
        manager.stop().await.unwrap();
        assert!(!manager.is_running().await);
    }

    #[test]
    fn test_transport_errors() {
        assert!(is_transport_error(&TunnelError::Closed));
        assert!(is_transport_error(&TunnelError::Timeout(
            std::time::Duration::from_secs(1)
        )));
        assert!(!is_transport_error(&TunnelError::AlreadyExists {
            udid: "dev".into()
        }));
        assert!(!is_transport_error(&TunnelError::NotFound("x".into())));
    }
}
