//! # Binary Frame Codec
//!
//! Frames exchanged with the streaming recognition service. Every frame starts with a
//! 4-byte header:
//!
//! ```text
//!  byte 0: version (4 bits)        | header size in 4-byte words (4 bits)
//!  byte 1: message type (4 bits)   | flags (4 bits)
//!  byte 2: serialization (4 bits)  | compression (4 bits)
//!  byte 3: reserved
//! ```
//!
//! followed by `header_size * 4 - 4` extension bytes (skipped on decode), then the
//! optional fields in this order, all big-endian:
//!
//! - sequence number (`i32`), present when flag bit `0x1` is set; negative means final
//! - error code (`u32`), present on `ServerErrorResponse` only
//! - payload size (`u32`), present on every frame except a `ServerAck` without payload
//! - payload, gzip-compressed on the wire when the compression nibble says so
//!
//! [`Frame::payload`] always holds the uncompressed bytes, so
//! `Frame::decode(&frame.encode()?)? == frame` for every well-formed frame.

use crate::error::{EngineError, EngineResult};
use crate::protocol::compression::{gunzip, gzip};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size of frames produced by this codec, in 4-byte words.
pub const DEFAULT_HEADER_SIZE: u8 = 0b0001;

/// Flag nibble values.
pub mod flags {
    /// Not the last packet, no sequence number.
    pub const NO_SEQUENCE: u8 = 0b0000;
    /// Positive sequence number follows the header.
    #[cfg(test)]
    pub const POSITIVE_SEQUENCE: u8 = 0b0001;
    /// Last packet, no sequence number.
    pub const LAST_NO_SEQUENCE: u8 = 0b0010;
    /// Last packet with a negative sequence number.
    #[cfg(test)]
    pub const NEGATIVE_SEQUENCE: u8 = 0b0011;

    pub(crate) const SEQUENCE_BIT: u8 = 0b0001;
    pub(crate) const LAST_BIT: u8 = 0b0010;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    FullClientRequest,
    AudioOnlyRequest,
    FullServerResponse,
    ServerAck,
    ServerErrorResponse,
}

impl MessageType {
    fn nibble(self) -> u8 {
        match self {
            MessageType::FullClientRequest => 0x1,
            MessageType::AudioOnlyRequest => 0x2,
            MessageType::FullServerResponse => 0x9,
            MessageType::ServerAck => 0xB,
            MessageType::ServerErrorResponse => 0xF,
        }
    }

    fn from_nibble(value: u8) -> EngineResult<Self> {
        match value {
            0x1 => Ok(MessageType::FullClientRequest),
            0x2 => Ok(MessageType::AudioOnlyRequest),
            0x9 => Ok(MessageType::FullServerResponse),
            0xB => Ok(MessageType::ServerAck),
            0xF => Ok(MessageType::ServerErrorResponse),
            other => Err(EngineError::MalformedFrame(format!("unknown message type 0x{:X}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    None,
    Json,
}

impl Serialization {
    fn nibble(self) -> u8 {
        match self {
            Serialization::None => 0x0,
            Serialization::Json => 0x1,
        }
    }

    fn from_nibble(value: u8) -> EngineResult<Self> {
        match value {
            0x0 => Ok(Serialization::None),
            0x1 => Ok(Serialization::Json),
            other => Err(EngineError::MalformedFrame(format!("unknown serialization 0x{:X}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    fn nibble(self) -> u8 {
        match self {
            Compression::None => 0x0,
            Compression::Gzip => 0x1,
        }
    }

    fn from_nibble(value: u8) -> EngineResult<Self> {
        match value {
            0x0 => Ok(Compression::None),
            0x1 => Ok(Compression::Gzip),
            other => Err(EngineError::MalformedFrame(format!("unknown compression 0x{:X}", other))),
        }
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,

    /// Low nibble of byte 1, see [`flags`].
    pub flags: u8,

    pub serialization: Serialization,

    pub compression: Compression,

    /// Present exactly when `flags` carries the sequence bit.
    pub sequence: Option<i32>,

    /// Present exactly on `ServerErrorResponse` frames.
    pub error_code: Option<u32>,

    /// Uncompressed payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// The opening request of a recognition session: JSON parameters, no sequence.
    pub fn full_client_request(params: &serde_json::Value, compression: Compression) -> EngineResult<Self> {
        let payload = serde_json::to_vec(params)
            .map_err(|e| EngineError::MalformedFrame(format!("request parameters are not serializable: {}", e)))?;

        Ok(Self {
            message_type: MessageType::FullClientRequest,
            flags: flags::NO_SEQUENCE,
            serialization: Serialization::Json,
            compression,
            sequence: None,
            error_code: None,
            payload,
        })
    }

    /// A raw audio chunk; only the final chunk of a session carries the last flag.
    pub fn audio_only(data: Vec<u8>, is_last: bool, compression: Compression) -> Self {
        Self {
            message_type: MessageType::AudioOnlyRequest,
            flags: if is_last { flags::LAST_NO_SEQUENCE } else { flags::NO_SEQUENCE },
            serialization: Serialization::None,
            compression,
            sequence: None,
            error_code: None,
            payload: data,
        }
    }

    pub fn has_sequence(&self) -> bool {
        self.flags & flags::SEQUENCE_BIT != 0
    }

    /// Whether the sender marked this as its final frame, either through the last
    /// flag or a negative sequence number.
    pub fn is_last(&self) -> bool {
        self.flags & flags::LAST_BIT != 0 || self.sequence.map_or(false, |seq| seq < 0)
    }

    /// Parse the payload as JSON. An empty payload parses as `null`.
    pub fn json(&self) -> EngineResult<serde_json::Value> {
        if self.payload.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| EngineError::MalformedFrame(format!("payload is not valid JSON: {}", e)))
    }

    pub fn encode(&self) -> EngineResult<Vec<u8>> {
        if self.flags > 0x0F {
            return Err(EngineError::MalformedFrame(format!("flags 0x{:X} do not fit in a nibble", self.flags)));
        }
        if self.has_sequence() != self.sequence.is_some() {
            return Err(EngineError::MalformedFrame(
                "sequence flag and sequence number disagree".to_string(),
            ));
        }
        let is_error = self.message_type == MessageType::ServerErrorResponse;
        if is_error != self.error_code.is_some() {
            return Err(EngineError::MalformedFrame(
                "error code is only carried by error responses".to_string(),
            ));
        }

        let body = match self.compression {
            Compression::Gzip => gzip(&self.payload)?,
            Compression::None => self.payload.clone(),
        };

        let mut out = Vec::with_capacity(16 + body.len());
        out.push(PROTOCOL_VERSION << 4 | DEFAULT_HEADER_SIZE);
        out.push(self.message_type.nibble() << 4 | self.flags);
        out.push(self.serialization.nibble() << 4 | self.compression.nibble());
        out.push(0x00);

        if let Some(sequence) = self.sequence {
            out.extend_from_slice(&sequence.to_be_bytes());
        }
        if let Some(code) = self.error_code {
            out.extend_from_slice(&code.to_be_bytes());
        }

        let bare_ack = self.message_type == MessageType::ServerAck && body.is_empty();
        if !bare_ack {
            let size = u32::try_from(body.len())
                .map_err(|_| EngineError::MalformedFrame(format!("payload of {} bytes is too large", body.len())))?;
            out.extend_from_slice(&size.to_be_bytes());
            out.extend_from_slice(&body);
        }

        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> EngineResult<Self> {
        if bytes.len() < 4 {
            return Err(EngineError::MalformedFrame(format!(
                "frame of {} bytes is shorter than the 4-byte header",
                bytes.len()
            )));
        }

        let version = bytes[0] >> 4;
        let header_size = bytes[0] & 0x0F;
        if version != PROTOCOL_VERSION {
            return Err(EngineError::UnsupportedVersion(version));
        }
        if header_size == 0 {
            return Err(EngineError::MalformedFrame("header size of zero words".to_string()));
        }
        let header_len = header_size as usize * 4;
        if bytes.len() < header_len {
            return Err(EngineError::MalformedFrame(format!(
                "header declares {} bytes but frame has {}",
                header_len,
                bytes.len()
            )));
        }

        let message_type = MessageType::from_nibble(bytes[1] >> 4)?;
        let flags = bytes[1] & 0x0F;
        let serialization = Serialization::from_nibble(bytes[2] >> 4)?;
        let compression = Compression::from_nibble(bytes[2] & 0x0F)?;

        let rest = &bytes[header_len..];
        let mut cursor = Cursor::new(rest);

        let sequence = if flags & flags::SEQUENCE_BIT != 0 {
            Some(cursor.read_i32::<BigEndian>().map_err(|_| truncated("sequence number"))?)
        } else {
            None
        };

        let error_code = if message_type == MessageType::ServerErrorResponse {
            Some(cursor.read_u32::<BigEndian>().map_err(|_| truncated("error code"))?)
        } else {
            None
        };

        let consumed = cursor.position() as usize;
        let body: &[u8] = if message_type == MessageType::ServerAck && consumed == rest.len() {
            &[]
        } else {
            let size = cursor.read_u32::<BigEndian>().map_err(|_| truncated("payload size"))? as usize;
            let start = cursor.position() as usize;
            let available = rest.len() - start;
            if size > available {
                return Err(EngineError::MalformedFrame(format!(
                    "declared payload size {} exceeds the {} bytes available",
                    size, available
                )));
            }
            &rest[start..start + size]
        };

        let payload = match compression {
            Compression::Gzip if !body.is_empty() => gunzip(body)?,
            _ => body.to_vec(),
        };

        Ok(Self {
            message_type,
            flags,
            serialization,
            compression,
            sequence,
            error_code,
            payload,
        })
    }
}

fn truncated(field: &str) -> EngineError {
    EngineError::MalformedFrame(format!("frame truncated before {}", field))
}
