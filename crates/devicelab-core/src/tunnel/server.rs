//! Tunnel server: owns the per-device tunnel registry.
//!
//! Each accepted connection is served by its own task, so requests for
//! different devices proceed concurrently. The "one tunnel per device" rule
//! is enforced by the registry: `start_tunnel` checks and reserves the udid
//! under a single lock acquisition, then brings the tunnel up outside the
//! lock. A concurrent `start_tunnel` for the same udid sees the reservation
//! and fails with `TUNNEL_ALREADY_EXISTS`.

use super::protocol::{
    actions, ClientRequest, ServerMessageCodec, ServerResponse, TunnelDescriptor, TunnelEndpoint,
};
use super::transport::FramedSocket;
use crate::error::TunnelError;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Brings device tunnels up and down.
///
/// The server guarantees `open` is never called twice for the same udid
/// without a `close` in between.
#[async_trait]
pub trait TunnelProvider: Send + Sync + 'static {
    async fn open(&self, udid: &str) -> Result<TunnelEndpoint, TunnelError>;

    async fn close(&self, udid: &str) -> Result<(), TunnelError>;
}

enum Slot {
    /// Reserved by an in-flight `start_tunnel`.
    Opening,
    Live(TunnelDescriptor),
}

/// Request dispatch and registry, independent of the transport.
pub struct TunnelService<P> {
    provider: P,
    registry: Mutex<HashMap<String, Slot>>,
}

impl<P: TunnelProvider> TunnelService<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one request. Never fails: errors become `ERROR` responses.
    pub async fn handle(&self, request: ClientRequest) -> ServerResponse {
        tracing::debug!(action = %request.action, "Handling request");

        let result = match request.action.as_str() {
            actions::HEARTBEAT => Ok(None),
            actions::START_TUNNEL => match request.udid() {
                Ok(udid) => self.start_tunnel(udid).await.and_then(|t| to_data(&t)),
                Err(e) => Err(e),
            },
            actions::STOP_TUNNEL => match request.udid() {
                Ok(udid) => self.stop_tunnel(udid).await.map(|_| None),
                Err(e) => Err(e),
            },
            actions::GET_TUNNEL => match request.udid() {
                Ok(udid) => self.get_tunnel(udid).await.and_then(|t| to_data(&t)),
                Err(e) => Err(e),
            },
            actions::LIST_TUNNELS => {
                let tunnels = self.list_tunnels().await;
                to_data(&json!({ "tunnels": tunnels }))
            }
            other => {
                tracing::warn!(action = %other, "Unknown action");
                Err(TunnelError::NotFound(format!("unknown action: {other}")))
            }
        };

        match result {
            Ok(data) => ServerResponse::ok(data),
            Err(e) => {
                tracing::debug!(action = %request.action, error = %e, "Request failed");
                ServerResponse::from_error(&e)
            }
        }
    }

    pub async fn start_tunnel(&self, udid: &str) -> Result<TunnelDescriptor, TunnelError> {
        {
            let mut registry = self.registry.lock().await;
            if registry.contains_key(udid) {
                tracing::info!(udid = %udid, "Tunnel already exists");
                return Err(TunnelError::AlreadyExists {
                    udid: udid.to_string(),
                });
            }
            registry.insert(udid.to_string(), Slot::Opening);
        }

        let start = std::time::Instant::now();
        match self.provider.open(udid).await {
            Ok(endpoint) => {
                let tunnel = TunnelDescriptor::new(udid, endpoint);
                self.registry
                    .lock()
                    .await
                    .insert(udid.to_string(), Slot::Live(tunnel.clone()));
                tracing::info!(
                    udid = %udid,
                    address = %tunnel.address,
                    port = tunnel.port,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Tunnel started"
                );
                Ok(tunnel)
            }
            Err(e) => {
                self.registry.lock().await.remove(udid);
                tracing::warn!(udid = %udid, error = %e, "Failed to start tunnel");
                Err(e)
            }
        }
    }

    /// Does nothing if no live tunnel exists for `udid`.
    pub async fn stop_tunnel(&self, udid: &str) -> Result<(), TunnelError> {
        let removed = {
            let mut registry = self.registry.lock().await;
            match registry.get(udid) {
                Some(Slot::Live(_)) => registry.remove(udid),
                _ => None,
            }
        };
        if removed.is_none() {
            tracing::debug!(udid = %udid, "No live tunnel to stop");
            return Ok(());
        }
        self.provider.close(udid).await?;
        tracing::info!(udid = %udid, "Tunnel stopped");
        Ok(())
    }

    pub async fn get_tunnel(&self, udid: &str) -> Result<TunnelDescriptor, TunnelError> {
        match self.registry.lock().await.get(udid) {
            Some(Slot::Live(tunnel)) => Ok(tunnel.clone()),
            _ => Err(TunnelError::NotFound(format!("no tunnel for {udid}"))),
        }
    }

    pub async fn list_tunnels(&self) -> Vec<TunnelDescriptor> {
        self.registry
            .lock()
            .await
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(tunnel) => Some(tunnel.clone()),
                Slot::Opening => None,
            })
            .collect()
    }

    /// Close every live tunnel. Errors are logged, not returned.
    pub async fn close_all(&self) {
        let udids: Vec<String> = {
            let mut registry = self.registry.lock().await;
            let live: Vec<String> = registry
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
                .map(|(udid, _)| udid.clone())
                .collect();
            for udid in &live {
                registry.remove(udid);
            }
            live
        };

        tracing::info!(count = udids.len(), "Closing all tunnels");
        for udid in udids {
            if let Err(e) = self.provider.close(&udid).await {
                tracing::error!(udid = %udid, error = %e, "Failed to close tunnel");
            }
        }
    }
}

fn to_data<T: serde::Serialize>(value: &T) -> Result<Option<Map<String, Value>>, TunnelError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(other) => Err(TunnelError::Internal(format!(
            "response data must be an object, got {other}"
        ))),
        Err(e) => Err(TunnelError::Internal(e.to_string())),
    }
}

/// Accepts connections on `127.0.0.1` and serves them with a [`TunnelService`].
pub struct TunnelServer<P> {
    listener: TcpListener,
    service: Arc<TunnelService<P>>,
}

impl<P: TunnelProvider> TunnelServer<P> {
    /// Bind to `127.0.0.1:port`. Port 0 picks a free port.
    pub async fn bind(port: u16, provider: P) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
        tracing::info!(addr = %listener.local_addr()?, "Tunnel server listening");
        Ok(Self {
            listener,
            service: Arc::new(TunnelService::new(provider)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn service(&self) -> Arc<TunnelService<P>> {
        Arc::clone(&self.service)
    }

    /// Serve until `shutdown` resolves, then close every live tunnel.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), TunnelError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::info!("Tunnel server received shutdown signal");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "Accepted connection");
                        let service = Arc::clone(&self.service);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, service).await {
                                tracing::warn!(%peer, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }

        self.service.close_all().await;
        Ok(())
    }
}

async fn handle_connection<P: TunnelProvider>(
    stream: TcpStream,
    service: Arc<TunnelService<P>>,
) -> Result<(), TunnelError> {
    stream.set_nodelay(true)?;
    let mut socket = FramedSocket::new(stream, ServerMessageCodec);

    loop {
        let response = match socket.receive().await {
            Ok(Some(request)) => service.handle(request).await,
            Ok(None) => {
                tracing::debug!("Client disconnected");
                return Ok(());
            }
            Err(TunnelError::InvalidMessage(e)) => {
                tracing::warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(e.payload().unwrap_or_default()),
                    "Rejecting invalid message"
                );
                ServerResponse::from_error(&TunnelError::MalformedRequest(e.to_string()))
            }
            Err(e) => return Err(e),
        };
        socket.send(&response).await?;
    }
}
