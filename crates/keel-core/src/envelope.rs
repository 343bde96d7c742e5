//! Keel wire envelope — on-wire types for all RPC communication.
//!
//! Every message travels as a fixed 8-byte frame header followed by a
//! bincode-serialized record. The frame header is #[repr(C, packed)]
//! with zerocopy derives for deterministic layout; the records are
//! ordinary serde structs. Changing anything here is a breaking wire
//! change.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame header ──────────────────────────────────────────────────────────────

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Wire size of the frame header.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Fixed-size frame preceding every request and response record.
///
/// The receiver can size its body buffer and reject oversized messages
/// before reading a single byte of the record.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Length of the record that follows, in bytes. Little-endian.
    /// Zero is a keep-alive; the receiver waits for the next header.
    pub message_size: u32,

    /// Bit flags. Reserved, must be zero.
    pub flags: u8,

    /// Envelope format version. Currently 0x01.
    pub version: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 2],
}

assert_eq_size!(FrameHeader, [u8; FRAME_HEADER_SIZE]);

impl FrameHeader {
    pub fn new(message_size: u32) -> Self {
        Self {
            message_size,
            flags: 0,
            version: ENVELOPE_VERSION,
            reserved: [0; 2],
        }
    }

    /// Parse a header from exactly [`FRAME_HEADER_SIZE`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let header = FrameHeader::read_from(bytes).ok_or(FrameError::HeaderTooShort)?;
        if header.version != ENVELOPE_VERSION {
            return Err(FrameError::UnknownVersion(header.version));
        }
        Ok(header)
    }
}

// ── Priority ──────────────────────────────────────────────────────────────────

/// Client-side dispatch priority.
///
/// Determines which FIFO queue a request joins. Higher classes are
/// drained before lower ones; FIFO order holds within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Highest = 0x01,
    High = 0x02,
    Normal = 0x03,
    Low = 0x04,
    Lowest = 0x05,
}

impl Priority {
    /// All priorities in dispatch order, highest first.
    pub const ALL: [Priority; 5] = [
        Priority::Highest,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Lowest,
    ];

    /// Dense index for per-priority tables.
    pub fn index(self) -> usize {
        self as usize - 1
    }
}

impl TryFrom<u8> for Priority {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Priority::Highest),
            0x02 => Ok(Priority::High),
            0x03 => Ok(Priority::Normal),
            0x04 => Ok(Priority::Low),
            0x05 => Ok(Priority::Lowest),
            other => Err(FrameError::UnknownPriority(other)),
        }
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Server response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    Success = 0x00,
    AuthError = 0x01,
    FormatError = 0x02,
    RequestTooBig = 0x03,
    InternalServerError = 0x04,
    Forbidden = 0x05,
    NotFound = 0x06,
}

impl TryFrom<u8> for Status {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Status::Success),
            0x01 => Ok(Status::AuthError),
            0x02 => Ok(Status::FormatError),
            0x03 => Ok(Status::RequestTooBig),
            0x04 => Ok(Status::InternalServerError),
            0x05 => Ok(Status::Forbidden),
            0x06 => Ok(Status::NotFound),
            other => Err(FrameError::UnknownStatus(other)),
        }
    }
}

// ── Error report ──────────────────────────────────────────────────────────────

/// Category a reported error belongs to. Carried across the wire so
/// callers can branch without parsing message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transport,
    Framing,
    Authentication,
    Authorization,
    Crypto,
    Container,
    File,
    Proxy,
    Policy,
}

/// User-visible error shape: category, numeric code, message.
///
/// Higher layers wrap lower-layer errors into this record for the
/// response envelope, preserving the inner cause in `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub code: u32,
    pub message: String,
}

impl ErrorReport {
    pub fn new(category: ErrorCategory, code: u32, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            message: message.into(),
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// Serialized request record following a frame header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique per client lifetime. Regenerated on retry after a
    /// session refresh, never mutated while queued.
    pub id: u64,
    pub service: String,
    pub method: String,
    pub service_version: u32,
    /// Tenant/partition selector threaded down to the server's stores.
    pub topic: String,
    pub message_type: String,
    /// Session credential bytes, empty for sessionless calls.
    pub session_auth: Vec<u8>,
    /// Per-method credential bytes, empty when the method needs none.
    pub method_auth: Vec<u8>,
    /// Opaque business payload.
    pub payload: Vec<u8>,
}

/// Serialized response record following a frame header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Echoes the request id, or zero when the request could not be
    /// parsed far enough to know it.
    pub id: u64,
    pub status: Status,
    pub error: Option<ErrorReport>,
    pub payload: Vec<u8>,
}

impl ResponseEnvelope {
    pub fn success(id: u64, payload: Vec<u8>) -> Self {
        Self {
            id,
            status: Status::Success,
            error: None,
            payload,
        }
    }

    pub fn failure(id: u64, status: Status, error: ErrorReport) -> Self {
        Self {
            id,
            status,
            error: Some(error),
            payload: Vec::new(),
        }
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Serialize a record and prepend its frame header.
pub fn encode_frame<T: Serialize>(record: &T) -> Result<Vec<u8>, FrameError> {
    let body = bincode::serialize(record).map_err(|e| FrameError::Serialize(e.to_string()))?;
    if body.len() > u32::MAX as usize {
        return Err(FrameError::MessageTooBig(body.len() as u64));
    }
    let header = FrameHeader::new(body.len() as u32);
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a record from the body bytes following a frame header.
pub fn decode_record<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, FrameError> {
    bincode::deserialize(body).map_err(|e| FrameError::Malformed(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when framing or interpreting wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame header too short")]
    HeaderTooShort,

    #[error("unknown envelope version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown priority byte: 0x{0:02x}")]
    UnknownPriority(u8),

    #[error("unknown status byte: 0x{0:02x}")]
    UnknownStatus(u8),

    #[error("message size {0} exceeds the frame limit")]
    MessageTooBig(u64),

    #[error("malformed envelope record: {0}")]
    Malformed(String),

    #[error("envelope serialization failed: {0}")]
    Serialize(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
