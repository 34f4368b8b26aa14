//! Wire protocol between the tunnel manager and the tunnel server.
//!
//! Every frame carries one JSON object tagged with `message_type`
//! (`request` or `response`) and a millisecond `timestamp`. Responses are
//! further tagged with `status` (`OK` or `ERROR`).
//!
//! ```text
//! {"message_type":"request","timestamp":1718000000000,"action":"start_tunnel","data":{"udid":"..."}}
//! {"message_type":"response","status":"OK","timestamp":1718000000042,"data":{...}}
//! {"message_type":"response","status":"ERROR","timestamp":1718000000042,"error_code":102}
//! ```

use crate::codec::{Codec, JsonCodec};
use crate::error::{CodecError, TunnelError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};

/// Default local port of the tunnel server.
pub const DEFAULT_PORT: u16 = 49151;

/// Error codes carried by `ERROR` responses.
pub mod error_codes {
    pub const INTERNAL: u16 = 0;
    pub const MALFORMED_REQUEST: u16 = 1;
    pub const NOT_FOUND: u16 = 2;
    pub const DEVICE_NOT_FOUND: u16 = 100;
    pub const NO_DEVICE_CONNECTED: u16 = 101;
    pub const TUNNEL_ALREADY_EXISTS: u16 = 102;
}

/// Request actions understood by the tunnel server.
pub mod actions {
    pub const START_TUNNEL: &str = "start_tunnel";
    pub const STOP_TUNNEL: &str = "stop_tunnel";
    pub const GET_TUNNEL: &str = "get_tunnel";
    pub const LIST_TUNNELS: &str = "list_tunnels";
    pub const HEARTBEAT: &str = "heartbeat";
}

pub(crate) fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// A request sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub timestamp: u64,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl ClientRequest {
    pub fn new(action: impl Into<String>, data: Option<Map<String, Value>>) -> Self {
        Self {
            timestamp: now_millis(),
            action: action.into(),
            data,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(actions::HEARTBEAT, None)
    }

    /// Request targeting a single device.
    pub fn for_device(action: impl Into<String>, udid: &str) -> Self {
        let mut data = Map::new();
        data.insert("udid".into(), Value::String(udid.to_string()));
        Self::new(action, Some(data))
    }

    /// The non-empty `udid` string argument of this request.
    pub fn udid(&self) -> Result<&str, TunnelError> {
        match self.data.as_ref().and_then(|d| d.get("udid")) {
            Some(Value::String(udid)) if !udid.is_empty() => Ok(udid),
            Some(Value::String(_)) => Err(TunnelError::MalformedRequest("udid is empty".into())),
            Some(_) => Err(TunnelError::MalformedRequest("udid must be a string".into())),
            None => Err(TunnelError::MalformedRequest("udid is required".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub error_code: u16,
}

/// A response sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ServerResponse {
    #[serde(rename = "OK")]
    Success(SuccessResponse),
    #[serde(rename = "ERROR")]
    Error(ErrorResponse),
}

impl ServerResponse {
    pub fn ok(data: Option<Map<String, Value>>) -> Self {
        Self::Success(SuccessResponse {
            timestamp: now_millis(),
            message: None,
            data,
        })
    }

    pub fn error(error_code: u16, message: impl Into<String>) -> Self {
        Self::Error(ErrorResponse {
            timestamp: now_millis(),
            message: Some(message.into()),
            error_code,
        })
    }

    /// Error response describing `err`, with the code the client maps back.
    pub fn from_error(err: &TunnelError) -> Self {
        let code = match err {
            TunnelError::MalformedRequest(_) => error_codes::MALFORMED_REQUEST,
            TunnelError::NotFound(_) => error_codes::NOT_FOUND,
            TunnelError::DeviceNotFound { .. } => error_codes::DEVICE_NOT_FOUND,
            TunnelError::NoDeviceConnected => error_codes::NO_DEVICE_CONNECTED,
            TunnelError::AlreadyExists { .. } => error_codes::TUNNEL_ALREADY_EXISTS,
            _ => error_codes::INTERNAL,
        };
        Self::error(code, err.to_string())
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Success(r) => r.timestamp,
            Self::Error(r) => r.timestamp,
        }
    }
}

/// Any message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "lowercase")]
pub enum SocketMessage {
    Request(ClientRequest),
    Response(ServerResponse),
}

impl SocketMessage {
    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Request(r) => r.timestamp,
            Self::Response(r) => r.timestamp(),
        }
    }

    pub fn timestamp_as_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(i64::try_from(self.timestamp()).ok()?)
    }
}

#[derive(Serialize)]
#[serde(tag = "message_type", rename_all = "lowercase")]
enum OutboundMessage<'a> {
    Request(&'a ClientRequest),
    Response(&'a ServerResponse),
}

fn encode(message: OutboundMessage<'_>) -> Result<Bytes, CodecError> {
    serde_json::to_vec(&message)
        .map(Bytes::from)
        .map_err(CodecError::Encode)
}

/// Decode any socket message, rejecting payloads that are not a tagged JSON
/// object with a valid timestamp.
pub fn decode_message(payload: &[u8]) -> Result<SocketMessage, CodecError> {
    let value: Value = JsonCodec::<Value, Value>::new().decode(payload)?;
    let message: SocketMessage = serde_json::from_value(value)
        .map_err(|e| CodecError::invalid(payload, e.to_string()))?;
    if message.timestamp_as_datetime().is_none() {
        return Err(CodecError::invalid(payload, "invalid unix timestamp"));
    }
    Ok(message)
}

/// Client side: sends requests, accepts only responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMessageCodec;

impl Codec for ClientMessageCodec {
    type Input = ClientRequest;
    type Output = ServerResponse;

    fn encode(&self, message: &ClientRequest) -> Result<Bytes, CodecError> {
        encode(OutboundMessage::Request(message))
    }

    fn decode(&self, payload: &[u8]) -> Result<ServerResponse, CodecError> {
        match decode_message(payload)? {
            SocketMessage::Response(response) => Ok(response),
            SocketMessage::Request(_) => Err(CodecError::invalid(
                payload,
                "expected a response, got a request",
            )),
        }
    }
}

/// Server side: sends responses, accepts only requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerMessageCodec;

impl Codec for ServerMessageCodec {
    type Input = ServerResponse;
    type Output = ClientRequest;

    fn encode(&self, message: &ServerResponse) -> Result<Bytes, CodecError> {
        encode(OutboundMessage::Response(message))
    }

    fn decode(&self, payload: &[u8]) -> Result<ClientRequest, CodecError> {
        match decode_message(payload)? {
            SocketMessage::Request(request) => Ok(request),
            SocketMessage::Response(_) => Err(CodecError::invalid(
                payload,
                "expected a request, got a response",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    #[default]
    Tcp,
    Quic,
}

/// Where a freshly opened tunnel can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub protocol: TunnelProtocol,
}

/// An active tunnel to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    pub udid: String,
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub protocol: TunnelProtocol,
    pub created_at: DateTime<Utc>,
}

impl TunnelDescriptor {
    pub fn new(udid: impl Into<String>, endpoint: TunnelEndpoint) -> Self {
        Self {
            udid: udid.into(),
            address: endpoint.address,
            port: endpoint.port,
            protocol: endpoint.protocol,
            created_at: Utc::now(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_request_wire_format() {
        let request = ClientRequest {
            timestamp: 1_718_000_000_000,
            action: "start_tunnel".into(),
            data: json!({"udid": "abc"}).as_object().cloned(),
        };
        let bytes = ClientMessageCodec.encode(&request).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({
                "message_type": "request",
                "timestamp": 1_718_000_000_000u64,
                "action": "start_tunnel",
                "data": {"udid": "abc"}
            })
        );
    }

    #[test]
    fn test_error_response_wire_format() {
        let response = ServerResponse::Error(ErrorResponse {
            timestamp: 5,
            message: None,
            error_code: error_codes::TUNNEL_ALREADY_EXISTS,
        });
        let bytes = ServerMessageCodec.encode(&response).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"message_type": "response", "status": "ERROR", "timestamp": 5, "error_code": 102})
        );
    }

    #[test]
    fn test_client_decodes_success() {
        let payload = frame(json!({
            "message_type": "response",
            "status": "OK",
            "timestamp": 10,
            "data": {"address": "fd00::1", "port": 5000}
        }));
        match ClientMessageCodec.decode(&payload).unwrap() {
            ServerResponse::Success(r) => assert_eq!(r.data.unwrap()["port"], 5000),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_server_decodes_request_without_data() {
        let payload = frame(json!({"message_type": "request", "timestamp": 10, "action": "heartbeat"}));
        let request = ServerMessageCodec.decode(&payload).unwrap();
        assert_eq!(request.action, actions::HEARTBEAT);
        assert!(request.data.is_none());
    }

    #[test]
    fn test_wrong_direction_rejected() {
        let request = frame(json!({"message_type": "request", "timestamp": 1, "action": "x"}));
        let response = frame(json!({"message_type": "response", "status": "OK", "timestamp": 1}));
        assert!(ClientMessageCodec.decode(&request).is_err());
        assert!(ServerMessageCodec.decode(&response).is_err());
    }

    #[test]
    fn test_missing_timestamp_rejected() {
        let payload = frame(json!({"message_type": "request", "action": "heartbeat"}));
        let err = ServerMessageCodec.decode(&payload).unwrap_err();
        assert_eq!(err.payload(), Some(&payload[..]));
    }

    #[test]
    fn test_unknown_type_and_status_rejected() {
        let unknown_type = frame(json!({"message_type": "event", "timestamp": 1}));
        let unknown_status = frame(json!({"message_type": "response", "status": "MAYBE", "timestamp": 1}));
        assert!(decode_message(&unknown_type).is_err());
        assert!(decode_message(&unknown_status).is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        let err = decode_message(b"[1, 2, 3]").unwrap_err();
        assert!(err.to_string().contains("JSON object"));
        assert!(decode_message(b"not json").is_err());
        assert!(decode_message(&[0xc3, 0x28]).is_err());
    }

    #[test]
    fn test_request_udid_validation() {
        assert_eq!(
            ClientRequest::for_device("get_tunnel", "abc").udid().unwrap(),
            "abc"
        );
        let empty = ClientRequest::for_device("get_tunnel", "");
        assert!(matches!(empty.udid(), Err(TunnelError::MalformedRequest(_))));
        let numeric = ClientRequest::new("get_tunnel", json!({"udid": 5}).as_object().cloned());
        assert!(matches!(numeric.udid(), Err(TunnelError::MalformedRequest(_))));
        assert!(ClientRequest::heartbeat().udid().is_err());
    }

    #[test]
    fn test_error_codes_from_errors() {
        let response = ServerResponse::from_error(&TunnelError::AlreadyExists { udid: "a".into() });
        assert!(matches!(
            response,
            ServerResponse::Error(ErrorResponse { error_code: error_codes::TUNNEL_ALREADY_EXISTS, .. })
        ));
        let response = ServerResponse::from_error(&TunnelError::Provider("boom".into()));
        assert!(matches!(
            response,
            ServerResponse::Error(ErrorResponse { error_code: error_codes::INTERNAL, .. })
        ));
    }

    #[test]
    fn test_endpoint_protocol_defaults_to_tcp() {
        let endpoint: TunnelEndpoint =
            serde_json::from_value(json!({"address": "127.0.0.1", "port": 61000})).unwrap();
        assert_eq!(endpoint.protocol, TunnelProtocol::Tcp);
    }
}
