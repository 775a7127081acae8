//! Common types and primitives for the shm-relay system
//!
//! This crate provides the shared memory regions, wire protocol and response
//! streams used by both the fetcher (the process with network access) and
//! consumers (sandboxed processes that receive resolved responses).

pub mod constants;
pub mod error;
pub mod protocol;
pub mod shm;
pub mod stream;
pub mod transport;
pub mod utils;
pub mod validation;
pub mod wire;

// Re-export commonly used types for convenience
pub use error::{RelayError, Result};
pub use protocol::{
    BodyRef, ErrorCode, FetchOperation, FetchRequest, FrameKind, Hello, Message, ResponseMetadata,
};
pub use shm::{MapError, RegionHandle, SharedRegion};
pub use stream::{HeaderValue, KnownHeader, RelayStream, StreamEvent};
pub use transport::{FrameReader, FrameWriter, frame_pair};
pub use utils::{current_timestamp_millis, generate_region_name, generate_request_id};
