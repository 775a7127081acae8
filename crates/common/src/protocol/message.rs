//! Message envelope and frame kinds

use std::os::fd::OwnedFd;

use serde::{Deserialize, Serialize};

use crate::constants::PROTOCOL_VERSION;
use crate::error::Result;
use crate::protocol::metadata::{BodyRef, ResponseMetadata};
use crate::protocol::request::FetchRequest;
use crate::wire::{DecodeError, Decoder, Encoder};

/// Discriminates frame payloads on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Hello,
    Fetch,
    Reply,
    Body,
    Error,
}

impl FrameKind {
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Hello => 1,
            Self::Fetch => 2,
            Self::Reply => 3,
            Self::Body => 4,
            Self::Error => 5,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Hello),
            2 => Some(Self::Fetch),
            3 => Some(Self::Reply),
            4 => Some(Self::Body),
            5 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Why a fetch could not be completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    Timeout,
    FetchFailed,
    BodyTooLarge,
    Internal,
}

impl ErrorCode {
    pub fn to_wire(self) -> u16 {
        match self {
            Self::InvalidRequest => 1,
            Self::Timeout => 2,
            Self::FetchFailed => 3,
            Self::BodyTooLarge => 4,
            Self::Internal => 5,
        }
    }

    pub fn from_wire(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::InvalidRequest),
            2 => Ok(Self::Timeout),
            3 => Ok(Self::FetchFailed),
            4 => Ok(Self::BodyTooLarge),
            5 => Ok(Self::Internal),
            _ => Err(DecodeError::BadDiscriminant {
                what: "error code",
                value: value as u32,
            }
            .into()),
        }
    }
}

/// Version handshake, the first frame sent in each direction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    /// Protocol version the peer speaks
    pub version: u16,

    /// Role of the peer ("fetcher" or "consumer")
    pub process: String,

    /// Peer process id, for diagnostics only
    pub pid: u32,
}

impl Hello {
    pub fn new(process: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            process: process.into(),
            pid: std::process::id(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Everything that can cross the relay socket
///
/// `Reply`, `Body` and `Error` are terminal: exactly one of them answers each
/// `Fetch`, and the answered stream finalizes on receipt.
#[derive(Debug)]
pub enum Message {
    /// Version handshake
    Hello(Hello),

    /// Ask the fetcher to perform a network load
    Fetch(FetchRequest),

    /// Resolved response: metadata with an optional shared memory body
    Reply {
        request_id: String,
        metadata: ResponseMetadata,
    },

    /// Raw body region with no accompanying metadata
    Body { request_id: String, body: BodyRef },

    /// Terminal failure report
    Error {
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
}

impl Message {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Hello(_) => FrameKind::Hello,
            Self::Fetch(_) => FrameKind::Fetch,
            Self::Reply { .. } => FrameKind::Reply,
            Self::Body { .. } => FrameKind::Body,
            Self::Error { .. } => FrameKind::Error,
        }
    }

    /// Request this message answers or carries, if any
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Hello(_) => None,
            Self::Fetch(req) => Some(&req.request_id),
            Self::Reply { request_id, .. } | Self::Body { request_id, .. } => Some(request_id),
            Self::Error { request_id, .. } => request_id.as_deref(),
        }
    }

    /// Serialize into a frame payload plus descriptor attachments
    pub fn encode(self) -> Result<(FrameKind, Vec<u8>, Vec<OwnedFd>)> {
        let kind = self.kind();
        match self {
            Self::Hello(hello) => {
                let payload = serde_json::to_vec(&hello)?;
                Ok((kind, payload, Vec::new()))
            }
            Self::Fetch(req) => {
                let mut enc = Encoder::new();
                req.encode(&mut enc)?;
                let (payload, fds) = enc.finish();
                Ok((kind, payload, fds))
            }
            Self::Reply {
                request_id,
                metadata,
            } => {
                let mut enc = Encoder::new();
                enc.put_str(&request_id)?;
                metadata.encode(&mut enc)?;
                let (payload, fds) = enc.finish();
                Ok((kind, payload, fds))
            }
            Self::Body { request_id, body } => {
                let mut enc = Encoder::new();
                enc.put_str(&request_id)?;
                body.encode(&mut enc);
                let (payload, fds) = enc.finish();
                Ok((kind, payload, fds))
            }
            Self::Error {
                request_id,
                code,
                message,
            } => {
                let mut enc = Encoder::new();
                enc.put_opt_str(request_id.as_deref())?;
                enc.put_u16(code.to_wire());
                enc.put_str(&message)?;
                let (payload, fds) = enc.finish();
                Ok((kind, payload, fds))
            }
        }
    }

    /// Deserialize a frame payload; fails without partial effects
    pub fn decode(kind: FrameKind, payload: &[u8], fds: Vec<OwnedFd>) -> Result<Self> {
        match kind {
            FrameKind::Hello => {
                if !fds.is_empty() {
                    return Err(DecodeError::UnclaimedAttachments(fds.len()).into());
                }
                Ok(Self::Hello(serde_json::from_slice(payload)?))
            }
            FrameKind::Fetch => {
                let mut dec = Decoder::new(payload, fds);
                let req = FetchRequest::decode(&mut dec)?;
                dec.finish()?;
                Ok(Self::Fetch(req))
            }
            FrameKind::Reply => {
                let mut dec = Decoder::new(payload, fds);
                let request_id = dec.get_str()?;
                let metadata = ResponseMetadata::decode(&mut dec)?;
                dec.finish()?;
                Ok(Self::Reply {
                    request_id,
                    metadata,
                })
            }
            FrameKind::Body => {
                let mut dec = Decoder::new(payload, fds);
                let request_id = dec.get_str()?;
                let body = BodyRef::decode(&mut dec)?;
                dec.finish()?;
                Ok(Self::Body { request_id, body })
            }
            FrameKind::Error => {
                let mut dec = Decoder::new(payload, fds);
                let request_id = dec.get_opt_str()?;
                let code = ErrorCode::from_wire(dec.get_u16()?)?;
                let message = dec.get_str()?;
                dec.finish()?;
                Ok(Self::Error {
                    request_id,
                    code,
                    message,
                })
            }
        }
    }
}
