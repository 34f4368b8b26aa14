//! Client for the tunnel server.
//!
//! One request is in flight at a time; callers sharing a client must
//! serialize access (the [`TunnelManager`](super::TunnelManager) does so
//! with a mutex).

use super::protocol::{
    actions, error_codes, ClientMessageCodec, ClientRequest, ErrorResponse, ServerResponse,
    TunnelDescriptor,
};
use super::transport::FramedSocket;
use crate::error::TunnelError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Total timeout for connecting to the server (includes retry time).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between connection retry attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for a single request/response exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TunnelClient {
    socket: FramedSocket<ClientMessageCodec>,
    addr: SocketAddr,
    request_timeout: Duration,
    /// Set when an exchange was abandoned; a late response would be read as
    /// the answer to the next request.
    desynced: bool,
}

impl TunnelClient {
    /// Connect to the tunnel server and confirm it answers a heartbeat.
    ///
    /// Connection attempts are retried every 100ms until `connect_timeout`
    /// elapses, to allow time for a freshly spawned server to bind.
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self, TunnelError> {
        let start = Instant::now();
        tracing::debug!(%addr, "Connecting to tunnel server");

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match Self::try_connect(addr).await {
                Ok(client) => {
                    tracing::info!(
                        %addr,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        "Connected to tunnel server"
                    );
                    return Ok(client);
                }
                Err(e) => {
                    if start.elapsed() >= connect_timeout {
                        tracing::warn!(
                            %addr,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            attempts,
                            error = %e,
                            "Tunnel server connection timeout"
                        );
                        return Err(TunnelError::Connection(format!(
                            "could not reach tunnel server at {addr} within {connect_timeout:?}: {e}"
                        )));
                    }
                    tracing::trace!(error = %e, attempt = attempts, "Connection attempt failed, retrying...");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn try_connect(addr: SocketAddr) -> Result<Self, TunnelError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TunnelError::Connection(format!("socket connect failed: {e}")))?;
        stream.set_nodelay(true)?;

        let mut client = Self {
            socket: FramedSocket::new(stream, ClientMessageCodec),
            addr,
            request_timeout: REQUEST_TIMEOUT,
            desynced: false,
        };
        client.heartbeat().await?;
        Ok(client)
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// False once an exchange was abandoned; the connection must be replaced.
    pub fn is_usable(&self) -> bool {
        !self.desynced
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// `ERROR` responses are mapped to the matching [`TunnelError`] variant.
    /// Undecodable responses yield [`TunnelError::InvalidMessage`]; a missing
    /// response yields [`TunnelError::Timeout`] and poisons the connection.
    pub async fn call(
        &mut self,
        request: ClientRequest,
    ) -> Result<Option<Map<String, Value>>, TunnelError> {
        if self.desynced {
            return Err(TunnelError::Connection(
                "connection abandoned after a timed out request".into(),
            ));
        }
        let action = request.action.clone();
        tracing::debug!(action = %action, "Sending tunnel server request");
        self.socket.send(&request).await?;

        let response = match timeout(self.request_timeout, self.socket.receive()).await {
            Ok(Ok(Some(response))) => response,
            Ok(Ok(None)) => return Err(TunnelError::Closed),
            Ok(Err(e)) => {
                tracing::warn!(action = %action, error = %e, "Tunnel server read error");
                // An undecodable frame is still consumed whole.
                if !matches!(e, TunnelError::InvalidMessage(_)) {
                    self.desynced = true;
                }
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(
                    action = %action,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Tunnel server response timeout"
                );
                self.desynced = true;
                return Err(TunnelError::Timeout(self.request_timeout));
            }
        };

        match response {
            ServerResponse::Success(ok) => {
                tracing::debug!(action = %action, "Tunnel server request succeeded");
                Ok(ok.data)
            }
            ServerResponse::Error(err) => {
                tracing::debug!(
                    action = %action,
                    error_code = err.error_code,
                    message = ?err.message,
                    "Tunnel server returned an error"
                );
                Err(error_from_response(err, &request))
            }
        }
    }

    async fn call_for<R: DeserializeOwned>(&mut self, request: ClientRequest) -> Result<R, TunnelError> {
        let data = self.call(request).await?.unwrap_or_default();
        serde_json::from_value(Value::Object(data))
            .map_err(|e| TunnelError::Internal(format!("unexpected response data: {e}")))
    }

    pub async fn heartbeat(&mut self) -> Result<(), TunnelError> {
        self.call(ClientRequest::heartbeat()).await.map(|_| ())
    }

    /// Create a tunnel to `udid`.
    ///
    /// # Errors
    ///
    /// [`TunnelError::AlreadyExists`] if the server already holds a live
    /// tunnel for this device; the existing tunnel is left untouched.
    pub async fn start_tunnel(&mut self, udid: &str) -> Result<TunnelDescriptor, TunnelError> {
        self.call_for(ClientRequest::for_device(actions::START_TUNNEL, udid))
            .await
    }

    /// The live tunnel for `udid`, if any.
    pub async fn get_tunnel(&mut self, udid: &str) -> Result<Option<TunnelDescriptor>, TunnelError> {
        match self
            .call_for(ClientRequest::for_device(actions::GET_TUNNEL, udid))
            .await
        {
            Ok(tunnel) => Ok(Some(tunnel)),
            Err(TunnelError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Close the tunnel for `udid`. Closing a missing tunnel is not an error.
    pub async fn stop_tunnel(&mut self, udid: &str) -> Result<(), TunnelError> {
        self.call(ClientRequest::for_device(actions::STOP_TUNNEL, udid))
            .await
            .map(|_| ())
    }

    pub async fn list_tunnels(&mut self) -> Result<Vec<TunnelDescriptor>, TunnelError> {
        #[derive(serde::Deserialize)]
        struct TunnelList {
            tunnels: Vec<TunnelDescriptor>,
        }
        let list: TunnelList = self
            .call_for(ClientRequest::new(actions::LIST_TUNNELS, None))
            .await?;
        Ok(list.tunnels)
    }
}

fn error_from_response(err: ErrorResponse, request: &ClientRequest) -> TunnelError {
    let udid = request.udid().map(str::to_string).unwrap_or_default();
    let message = err.message.unwrap_or_default();
    match err.error_code {
        error_codes::MALFORMED_REQUEST => TunnelError::MalformedRequest(message),
        error_codes::NOT_FOUND => TunnelError::NotFound(message),
        error_codes::DEVICE_NOT_FOUND => TunnelError::DeviceNotFound { udid },
        error_codes::NO_DEVICE_CONNECTED => TunnelError::NoDeviceConnected,
        error_codes::TUNNEL_ALREADY_EXISTS => TunnelError::AlreadyExists { udid },
        error_codes::INTERNAL => TunnelError::Internal(message),
        code => TunnelError::Remote { code, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(code: u16) -> ErrorResponse {
        ErrorResponse {
            timestamp: 1,
            message: Some("details".into()),
            error_code: code,
        }
    }

    #[test]
    fn test_error_mapping() {
        let request = ClientRequest::for_device(actions::START_TUNNEL, "udid-1");
        assert!(matches!(
            error_from_response(error(102), &request),
            TunnelError::AlreadyExists { udid } if udid == "udid-1"
        ));
        assert!(matches!(
            error_from_response(error(100), &request),
            TunnelError::DeviceNotFound { .. }
        ));
        assert!(matches!(
            error_from_response(error(101), &request),
            TunnelError::NoDeviceConnected
        ));
        assert!(matches!(
            error_from_response(error(1), &request),
            TunnelError::MalformedRequest(m) if m == "details"
        ));
        assert!(matches!(
            error_from_response(error(2), &request),
            TunnelError::NotFound(_)
        ));
        assert!(matches!(
            error_from_response(error(0), &request),
            TunnelError::Internal(_)
        ));
        assert!(matches!(
            error_from_response(error(999), &request),
            TunnelError::Remote { code: 999, .. }
        ));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_server() {
        // Bind and drop to find a port nobody is listening on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TunnelClient::connect(addr, Duration::from_millis(250)).await;
        assert!(matches!(result, Err(TunnelError::Connection(_))));
    }
}
