//! Transport messages.
//!
//! These are the request/response pairs a transport adapter (HTTP,
//! WebSocket, or anything else) exchanges on the engine's behalf. The
//! engine itself only sees the `Transport` trait; external services speak
//! these CBOR records.

use meshsync_codec::{decode_value, encode_value, CodecError, CodecResult, Value};

use crate::clock::VectorClock;
use crate::ids::DeviceId;
use crate::operation::Operation;

/// Any protocol message, for framed transports.
#[derive(Debug, Clone)]
pub enum SyncMessage {
    /// Session open + clock exchange, from the initiator.
    HelloRequest(HelloRequest),
    /// Session accept/reject + the peer's clock.
    HelloResponse(HelloResponse),
    /// "Send me what I lack" with the requester's clock.
    OpsRequest(OpsRequest),
    /// Operations the peer was missing.
    OpsResponse(OpsResponse),
    /// Operations pushed to the peer.
    PushOps(PushOps),
    /// Receipt for a push; all-or-nothing per call.
    PushAck(PushAck),
}

impl SyncMessage {
    /// Frame type code.
    #[must_use]
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::HelloRequest(_) => 1,
            SyncMessage::HelloResponse(_) => 2,
            SyncMessage::OpsRequest(_) => 3,
            SyncMessage::OpsResponse(_) => 4,
            SyncMessage::PushOps(_) => 5,
            SyncMessage::PushAck(_) => 6,
        }
    }
}

fn require<'a>(value: &'a Value, field: &str) -> CodecResult<&'a Value> {
    value
        .get(field)
        .ok_or_else(|| CodecError::shape(format!("message missing {field}")))
}

fn device_field(value: &Value, field: &str) -> CodecResult<DeviceId> {
    require(value, field)?
        .as_bytes()
        .and_then(DeviceId::from_slice)
        .ok_or_else(|| CodecError::shape(format!("{field} is not a device id")))
}

fn ops_field(value: &Value, field: &str) -> CodecResult<Vec<Operation>> {
    require(value, field)?
        .as_array()
        .ok_or_else(|| CodecError::shape(format!("{field} is not an array")))?
        .iter()
        .map(|item| {
            item.as_bytes()
                .ok_or_else(|| CodecError::shape("operation entry is not bytes"))
                .and_then(Operation::decode)
        })
        .collect()
}

fn ops_value(ops: &[Operation]) -> CodecResult<Value> {
    Ok(Value::Array(
        ops.iter()
            .map(|op| op.encode().map(Value::Bytes))
            .collect::<CodecResult<_>>()?,
    ))
}

/// Session open: identify ourselves and present our clock.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloRequest {
    /// Initiating device.
    pub device_id: DeviceId,
    /// Initiator's schema version.
    pub schema_version: i64,
    /// Initiator's current vector clock.
    pub vector_clock: VectorClock,
}

impl HelloRequest {
    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        encode_value(&Value::map(vec![
            (
                Value::text("device_id"),
                Value::Bytes(self.device_id.as_bytes().to_vec()),
            ),
            (
                Value::text("schema_version"),
                Value::Integer(self.schema_version),
            ),
            (Value::text("vc"), self.vector_clock.to_value()),
        ]))
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let value = decode_value(bytes)?;
        Ok(Self {
            device_id: device_field(&value, "device_id")?,
            schema_version: require(&value, "schema_version")?
                .as_integer()
                .ok_or_else(|| CodecError::shape("schema_version is not an integer"))?,
            vector_clock: VectorClock::from_value(require(&value, "vc")?)?,
        })
    }
}

/// Session accept/reject carrying the responder's clock.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloResponse {
    /// Responding device.
    pub device_id: DeviceId,
    /// Responder's current vector clock.
    pub vector_clock: VectorClock,
    /// Whether the session may proceed.
    pub accepted: bool,
    /// Reason when rejected.
    pub error: Option<String>,
}

impl HelloResponse {
    /// Builds an accepting response.
    #[must_use]
    pub fn accept(device_id: DeviceId, vector_clock: VectorClock) -> Self {
        Self {
            device_id,
            vector_clock,
            accepted: true,
            error: None,
        }
    }

    /// Builds a rejection.
    #[must_use]
    pub fn reject(device_id: DeviceId, reason: impl Into<String>) -> Self {
        Self {
            device_id,
            vector_clock: VectorClock::new(),
            accepted: false,
            error: Some(reason.into()),
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut pairs = vec![
            (
                Value::text("device_id"),
                Value::Bytes(self.device_id.as_bytes().to_vec()),
            ),
            (Value::text("vc"), self.vector_clock.to_value()),
            (Value::text("accepted"), Value::Bool(self.accepted)),
        ];
        if let Some(error) = &self.error {
            pairs.push((Value::text("error"), Value::text(error.clone())));
        }
        encode_value(&Value::map(pairs))
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let value = decode_value(bytes)?;
        Ok(Self {
            device_id: device_field(&value, "device_id")?,
            vector_clock: VectorClock::from_value(require(&value, "vc")?)?,
            accepted: require(&value, "accepted")?
                .as_bool()
                .ok_or_else(|| CodecError::shape("accepted is not a bool"))?,
            error: value.get("error").and_then(Value::as_text).map(String::from),
        })
    }
}

/// Request for operations the sender lacks.
#[derive(Debug, Clone, PartialEq)]
pub struct OpsRequest {
    /// The requester's clock; the peer returns ops beyond it.
    pub since: VectorClock,
    /// Batch size cap.
    pub limit: u32,
}

impl OpsRequest {
    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        encode_value(&Value::map(vec![
            (Value::text("since"), self.since.to_value()),
            (Value::text("limit"), Value::Integer(i64::from(self.limit))),
        ]))
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let value = decode_value(bytes)?;
        let limit = require(&value, "limit")?
            .as_integer()
            .filter(|n| (0..=i64::from(u32::MAX)).contains(n))
            .ok_or_else(|| CodecError::shape("limit out of range"))?;
        Ok(Self {
            since: VectorClock::from_value(require(&value, "since")?)?,
            limit: limit as u32,
        })
    }
}

/// Operations answering an [`OpsRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpsResponse {
    /// The missing operations, in deterministic order.
    pub operations: Vec<Operation>,
    /// True if the limit cut the batch short.
    pub has_more: bool,
}

impl OpsResponse {
    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        encode_value(&Value::map(vec![
            (Value::text("ops"), ops_value(&self.operations)?),
            (Value::text("has_more"), Value::Bool(self.has_more)),
        ]))
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let value = decode_value(bytes)?;
        Ok(Self {
            operations: ops_field(&value, "ops")?,
            has_more: require(&value, "has_more")?
                .as_bool()
                .ok_or_else(|| CodecError::shape("has_more is not a bool"))?,
        })
    }
}

/// Operations pushed at the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOps {
    /// The pushed operations, in deterministic order.
    pub operations: Vec<Operation>,
}

impl PushOps {
    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        encode_value(&Value::map(vec![(
            Value::text("ops"),
            ops_value(&self.operations)?,
        )]))
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let value = decode_value(bytes)?;
        Ok(Self {
            operations: ops_field(&value, "ops")?,
        })
    }
}

/// Receipt for a push.
#[derive(Debug, Clone, PartialEq)]
pub struct PushAck {
    /// How many operations the peer accepted (all or none per call).
    pub accepted: u64,
    /// Reason when the batch was refused.
    pub error: Option<String>,
}

impl PushAck {
    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut pairs = vec![(
            Value::text("accepted"),
            Value::Integer(self.accepted as i64),
        )];
        if let Some(error) = &self.error {
            pairs.push((Value::text("error"), Value::text(error.clone())));
        }
        encode_value(&Value::map(pairs))
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let value = decode_value(bytes)?;
        let accepted = require(&value, "accepted")?
            .as_integer()
            .filter(|n| *n >= 0)
            .ok_or_else(|| CodecError::shape("accepted is not a count"))?;
        Ok(Self {
            accepted: accepted as u64,
            error: value.get("error").and_then(Value::as_text).map(String::from),
        })
    }
}
