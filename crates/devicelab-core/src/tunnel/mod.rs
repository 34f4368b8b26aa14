//! Device tunnels brokered by a sidecar process.
//!
//! ```text
//! TunnelManager ──owns──▶ devicelab-tunneld (Process)
//!      │                        │
//!      │ TunnelClient           │ TunnelServer
//!      └──── framed TCP ───────▶│   └─ TunnelService (registry)
//!            127.0.0.1:port     │        └─ TunnelProvider (one process per device)
//! ```

mod client;
mod manager;
mod protocol;
mod provider;
mod server;
mod transport;

pub use client::{TunnelClient, CONNECT_TIMEOUT, REQUEST_TIMEOUT};
pub use manager::TunnelManager;
pub use protocol::{
    actions, decode_message, error_codes, ClientMessageCodec, ClientRequest, ErrorResponse,
    ServerMessageCodec, ServerResponse, SocketMessage, SuccessResponse, TunnelDescriptor,
    TunnelEndpoint, TunnelProtocol, DEFAULT_PORT,
};
pub use provider::{
    CommandTunnelProvider, EXIT_DEVICE_NOT_FOUND, EXIT_NO_DEVICE_CONNECTED, UDID_PLACEHOLDER,
};
pub use server::{TunnelProvider, TunnelServer, TunnelService};
pub use transport::FramedSocket;
