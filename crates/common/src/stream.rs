//! Pull-based response streams backed by shared memory
//!
//! A [`RelayStream`] is the consumer-side face of one fetch. Response
//! metadata lands on it via [`RelayStream::apply_metadata`], the body arrives
//! as a shared memory handle via [`RelayStream::bind_body`], and
//! [`RelayStream::finalize`] marks the response complete. Callers drain the
//! body through [`std::io::Read`]; bytes are copied straight out of the
//! mapped region with no intermediate buffer.
//!
//! Metadata and body are independent: either can arrive without the other,
//! and a reply that resolves to headers alone reads as an immediately
//! exhausted stream.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::protocol::metadata::{FetchOperation, ResponseMetadata};
use crate::shm::{CopyError, RegionHandle, SharedRegion};

/// Response header fields a stream retains
///
/// The body length is tracked on the stream itself, never in this table, so
/// a reply carrying nothing but a content length leaves the table empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KnownHeader {
    ContentDisposition,
    ContentType,
    Location,
    LastModified,
    SetCookie,
    UserAgent,
    Server,
}

impl KnownHeader {
    pub fn name(self) -> &'static str {
        match self {
            Self::ContentDisposition => "content-disposition",
            Self::ContentType => "content-type",
            Self::Location => "location",
            Self::LastModified => "last-modified",
            Self::SetCookie => "set-cookie",
            Self::UserAgent => "user-agent",
            Self::Server => "server",
        }
    }
}

/// A retained header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Text(String),

    /// Epoch milliseconds; used for Last-Modified
    Millis(u64),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Millis(_) => None,
        }
    }

    pub fn as_millis(&self) -> Option<u64> {
        match self {
            Self::Text(_) => None,
            Self::Millis(ms) => Some(*ms),
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Millis(ms) => write!(f, "{ms}"),
        }
    }
}

/// Lifecycle notifications a stream emits when it finalizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    DataReady,
    Finished,
}

/// One in-flight response, readable as it stands
pub struct RelayStream {
    operation: FetchOperation,
    url: String,
    headers: BTreeMap<KnownHeader, HeaderValue>,
    region: Option<SharedRegion>,
    /// Bytes the bound region was declared to hold
    total: u64,
    /// Unread suffix of the bound region; the cursor is `total - remaining`
    remaining: u64,
    /// Declared length of a body announced by metadata but not yet bound
    pending_body: u64,
    content_length: u64,
    metadata_applied: bool,
    finalized: bool,
    events: UnboundedSender<StreamEvent>,
}

impl RelayStream {
    pub fn new(url: impl Into<String>, events: UnboundedSender<StreamEvent>) -> Self {
        Self {
            operation: FetchOperation::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            region: None,
            total: 0,
            remaining: 0,
            pending_body: 0,
            content_length: 0,
            metadata_applied: false,
            finalized: false,
            events,
        }
    }

    /// Fold one metadata message into the stream
    ///
    /// Present fields overwrite, absent fields leave prior state untouched.
    /// A body travelling with the metadata is bound immediately, using the
    /// declared content length when one is given and the body's own length
    /// otherwise.
    pub fn apply_metadata(&mut self, meta: ResponseMetadata) {
        if self.finalized {
            warn!(url = %self.url, "metadata arrived after finalize; ignoring");
            return;
        }
        let ResponseMetadata {
            operation,
            content_disposition,
            content_type,
            location,
            last_modified_ms,
            set_cookie,
            user_agent,
            server,
            content_length,
            body,
        } = meta;

        if let Some(op) = operation {
            self.operation = op;
        }
        self.set_text(KnownHeader::ContentDisposition, content_disposition);
        self.set_text(KnownHeader::ContentType, content_type);
        self.set_text(KnownHeader::Location, location);
        if let Some(ms) = last_modified_ms {
            self.headers.insert(KnownHeader::LastModified, HeaderValue::Millis(ms));
        }
        self.set_text(KnownHeader::SetCookie, set_cookie);
        self.set_text(KnownHeader::UserAgent, user_agent);
        self.set_text(KnownHeader::Server, server);

        self.content_length = content_length;
        self.metadata_applied = true;

        match body {
            Some(body) => {
                let declared = if content_length > 0 { content_length } else { body.len };
                self.bind_body(body.handle, declared);
            }
            // Body may still follow in its own message; until it does, the
            // declared length is all we can report as available. Once a
            // region is bound it stays authoritative until an actual rebind.
            None => {
                if self.region.is_none() {
                    self.pending_body = content_length;
                }
            }
        }
    }

    /// Bind a shared memory body, replacing any previous one
    ///
    /// On a successful bind the read cursor restarts at the beginning of the
    /// new region. A handle that cannot be mapped, or that is smaller than
    /// `declared_len`, leaves the stream with an empty body; delivery is
    /// never aborted over a bad region.
    pub fn bind_body(&mut self, handle: RegionHandle, declared_len: u64) {
        if self.finalized {
            warn!(url = %self.url, "body arrived after finalize; rejecting");
            return;
        }
        self.region = None;
        self.total = 0;
        self.remaining = 0;
        self.pending_body = 0;
        match SharedRegion::map(handle, declared_len) {
            Ok(region) => {
                self.total = declared_len;
                self.remaining = declared_len;
                self.region = Some(region);
                debug!(url = %self.url, len = declared_len, "bound response body region");
            }
            Err(err) => {
                warn!(url = %self.url, error = %err, "failed to map response body; treating as empty");
            }
        }
    }

    /// Mark the response complete
    ///
    /// Emits `DataReady` then `Finished` exactly once; later calls are
    /// absorbed. After this, late metadata or body messages are rejected.
    pub fn finalize(&mut self) {
        if self.finalized {
            debug!(url = %self.url, "duplicate finalize ignored");
            return;
        }
        self.finalized = true;
        self.pending_body = 0;
        // Listeners may already be gone; delivery is best-effort
        let _ = self.events.send(StreamEvent::DataReady);
        let _ = self.events.send(StreamEvent::Finished);
    }

    /// Unread bytes: the bound remainder plus any announced-but-unbound body
    ///
    /// The two terms never overlap; binding moves the count from one to the
    /// other.
    pub fn bytes_available(&self) -> u64 {
        self.remaining + self.pending_body
    }

    /// Unread suffix of the bound region
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Declared content length from the last applied metadata
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn operation(&self) -> FetchOperation {
        self.operation
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn header(&self, key: KnownHeader) -> Option<&HeaderValue> {
        self.headers.get(&key)
    }

    pub fn headers(&self) -> impl Iterator<Item = (KnownHeader, &HeaderValue)> {
        self.headers.iter().map(|(k, v)| (*k, v))
    }

    pub fn metadata_applied(&self) -> bool {
        self.metadata_applied
    }

    pub fn is_finished(&self) -> bool {
        self.finalized
    }

    /// Always claims line readiness; line-oriented callers ask this before
    /// draining and the stream has no line structure to consult.
    pub fn can_read_line(&self) -> bool {
        true
    }

    /// Accepted and ignored; the delivery is already complete when it exists.
    pub fn abort(&mut self) {}

    /// Accepted and ignored; dropping the stream releases the mapping.
    pub fn close(&mut self) {}

    /// Accepted and ignored; reads are served from the mapping directly and
    /// no buffer is ever allocated.
    pub fn set_read_buffer_size(&mut self, _size: u64) {}

    fn set_text(&mut self, key: KnownHeader, value: Option<String>) {
        if let Some(v) = value {
            self.headers.insert(key, HeaderValue::Text(v));
        }
    }
}

impl fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayStream")
            .field("url", &self.url)
            .field("operation", &self.operation)
            .field("total", &self.total)
            .field("remaining", &self.remaining)
            .field("pending_body", &self.pending_body)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl Read for RelayStream {
    /// Copy up to `buf.len()` bytes from the unread tail of the body
    ///
    /// `Ok(0)` means the stream is exhausted (or nothing is bound yet); an
    /// error means the copy itself failed and the unread count is unchanged.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = std::cmp::min(buf.len() as u64, self.remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        let Some(region) = self.region.as_ref() else {
            return Err(io::Error::other(CopyError::Unmapped));
        };
        let offset = (self.total - self.remaining) as usize;
        let src = region.read_slice(offset, want).map_err(io::Error::other)?;
        buf[..want].copy_from_slice(src);
        self.remaining -= want as u64;
        Ok(want)
    }
}
