//! Wire protocol between the fetcher and its consumers
//!
//! The hello exchange is JSON for easy inspection; every message after it
//! uses the binary field codec from [`crate::wire`], with response bodies
//! riding alongside as shared memory descriptors rather than payload bytes.

pub mod message;
pub mod metadata;
pub mod request;

pub use message::{ErrorCode, FrameKind, Hello, Message};
pub use metadata::{BodyRef, FetchOperation, ResponseMetadata};
pub use request::FetchRequest;
