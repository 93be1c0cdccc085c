//! Wire protocol between client and server.
//!
//! Every message is one frame:
//!
//! ```text
//! u32 LE control code | u64 LE body length | bincode body
//! ```
//!
//! Requests use the upload codes (`EncKeys`, `UpDownload*`, `CancelQuery`);
//! each request is answered by exactly one frame carrying a [`Reply`].

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{
    CiphertextBuffer, ComputationParam, DisclosedRecord, KeyId, QueryId, ResultStatus,
    SelectedPosition,
};
use crate::{Result, SsesError};

/// Query id answered when the server's queues are full.
pub const REJECTED_QUERY_ID: QueryId = -1;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: u64 = 1 << 30;

const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ControlCode {
    EncKeys = 0x401,
    QueryId = 0x402,
    ChunkResult = 0x403,
    Result = 0x404,
    CancelQuery = 0x405,
    UpDownloadQuery = 0x1001,
    UpDownloadChunkResult = 0x1002,
    UpDownloadResult = 0x1003,
}

impl ControlCode {
    const ALL: [ControlCode; 8] = [
        ControlCode::EncKeys,
        ControlCode::QueryId,
        ControlCode::ChunkResult,
        ControlCode::Result,
        ControlCode::CancelQuery,
        ControlCode::UpDownloadQuery,
        ControlCode::UpDownloadChunkResult,
        ControlCode::UpDownloadResult,
    ];

    #[must_use]
    pub fn value(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_value(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.value() == value)
    }

    /// Code of the frame answering a request with this code.
    #[must_use]
    pub fn reply_code(self) -> Self {
        match self {
            ControlCode::UpDownloadQuery => ControlCode::QueryId,
            ControlCode::UpDownloadChunkResult => ControlCode::ChunkResult,
            ControlCode::UpDownloadResult => ControlCode::Result,
            other => other,
        }
    }
}

impl std::fmt::Display for ControlCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}(0x{:x})", self.value())
    }
}

/// Public keys of a client, registered under its key-id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterKeys {
    pub key_id: KeyId,
    pub context: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitQuery {
    pub key_id: KeyId,
    pub param: ComputationParam,
    pub enc_mask: CiphertextBuffer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkResultRequest {
    pub query_id: QueryId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResults {
    pub status: ResultStatus,
    pub key_id: KeyId,
    pub ciphertexts: CiphertextBuffer,
}

/// Final disclosure request: the slots the client decrypted to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRequest {
    pub query_id: QueryId,
    pub key_id: KeyId,
    pub selections: Vec<SelectedPosition>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CancelRequest {
    pub query_id: QueryId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionKind {
    ProtocolViolation,
    CapacityExceeded,
    NotFound,
    InvalidRequest,
    Internal,
}

/// Why the server refused a request. The connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub message: String,
}

impl From<&SsesError> for Rejection {
    fn from(err: &SsesError) -> Self {
        let kind = match err {
            SsesError::ProtocolViolation(_) => RejectionKind::ProtocolViolation,
            SsesError::CapacityExceeded(_) => RejectionKind::CapacityExceeded,
            SsesError::NotFound(_) => RejectionKind::NotFound,
            SsesError::InvalidParameter(_) | SsesError::Crypto(_) => RejectionKind::InvalidRequest,
            _ => RejectionKind::Internal,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<Rejection> for SsesError {
    fn from(rejection: Rejection) -> Self {
        let message = format!("server rejected request: {}", rejection.message);
        match rejection.kind {
            RejectionKind::ProtocolViolation => SsesError::ProtocolViolation(message),
            RejectionKind::CapacityExceeded => SsesError::CapacityExceeded(message),
            RejectionKind::NotFound => SsesError::NotFound(message),
            RejectionKind::InvalidRequest => SsesError::InvalidParameter(message),
            RejectionKind::Internal => SsesError::WorkerFailure(message),
        }
    }
}

/// Body of every server reply.
pub type Reply<T> = std::result::Result<T, Rejection>;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: ControlCode,
    pub body: Vec<u8>,
}

impl Frame {
    /// # Errors
    /// Returns `SsesError::Codec` if the body is not a `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.body)?)
    }

    /// Decode, insisting on a particular control code.
    ///
    /// # Errors
    /// Returns `SsesError::ProtocolViolation` on any other code.
    pub fn expect<T: DeserializeOwned>(&self, code: ControlCode) -> Result<T> {
        if self.code != code {
            return Err(SsesError::ProtocolViolation(format!(
                "expected {code}, got {}",
                self.code
            )));
        }
        self.decode()
    }
}

/// Serialize `body` and write it as one frame.
///
/// # Errors
/// Returns an error if encoding fails, the body is too large, or the write fails.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, code: ControlCode, body: &T) -> Result<()> {
    let body = bincode::serialize(body)?;
    let len = u64::try_from(body.len()).unwrap_or(u64::MAX);
    if len > MAX_FRAME_LEN {
        return Err(SsesError::InvalidParameter(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }

    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&code.value().to_le_bytes());
    header[4..].copy_from_slice(&len.to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly.
///
/// # Errors
/// Returns `SsesError::ProtocolViolation` for an unknown code or oversized
/// body, and `SsesError::Io` if the stream ends mid-frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mut code_bytes = [0u8; 4];
    code_bytes.copy_from_slice(&header[..4]);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[4..]);
    let raw_code = u32::from_le_bytes(code_bytes);
    let len = u64::from_le_bytes(len_bytes);

    let code = ControlCode::from_value(raw_code).ok_or_else(|| {
        SsesError::ProtocolViolation(format!("unknown control code 0x{raw_code:x}"))
    })?;
    if len > MAX_FRAME_LEN {
        return Err(SsesError::ProtocolViolation(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }

    let mut body = vec![0u8; usize::try_from(len).unwrap_or(usize::MAX)];
    reader.read_exact(&mut body)?;
    Ok(Some(Frame { code, body }))
}
