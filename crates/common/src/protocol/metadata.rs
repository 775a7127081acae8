//! Response metadata relayed from the fetcher to a consumer

use crate::shm::RegionHandle;
use crate::wire::{DecodeError, Decoder, EncodeError, Encoder};

/// HTTP operation a fetch performs
///
/// On the wire the operation is a u32 where zero means "unspecified"; an
/// unspecified operation decodes as `None` and streams fall back to GET.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchOperation {
    #[default]
    Get,
    Head,
    Put,
    Post,
    Delete,
}

impl FetchOperation {
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Get => 1,
            Self::Head => 2,
            Self::Put => 3,
            Self::Post => 4,
            Self::Delete => 5,
        }
    }

    pub fn from_wire(value: u32) -> Result<Option<Self>, DecodeError> {
        match value {
            0 => Ok(None),
            1 => Ok(Some(Self::Get)),
            2 => Ok(Some(Self::Head)),
            3 => Ok(Some(Self::Put)),
            4 => Ok(Some(Self::Post)),
            5 => Ok(Some(Self::Delete)),
            _ => Err(DecodeError::BadDiscriminant {
                what: "fetch operation",
                value,
            }),
        }
    }

    pub fn method(self) -> http::Method {
        match self {
            Self::Get => http::Method::GET,
            Self::Head => http::Method::HEAD,
            Self::Put => http::Method::PUT,
            Self::Post => http::Method::POST,
            Self::Delete => http::Method::DELETE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

/// A shared memory body: descriptor plus the byte length that travels with it
#[derive(Debug)]
pub struct BodyRef {
    pub handle: RegionHandle,
    pub len: u64,
}

impl BodyRef {
    pub fn new(handle: RegionHandle, len: u64) -> Self {
        Self { handle, len }
    }

    pub fn encode(self, enc: &mut Encoder) {
        let index = enc.attach_fd(self.handle.into_fd());
        enc.put_u32(index);
        enc.put_u64(self.len);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let index = dec.get_u32()?;
        let len = dec.get_u64()?;
        let handle = RegionHandle::from_fd(dec.take_fd(index)?);
        Ok(Self { handle, len })
    }
}

/// Everything a fetch resolves to, minus the body bytes themselves
///
/// Each optional field is independent: absent fields leave whatever the
/// receiving stream already holds untouched. The wire field order below is
/// fixed; only `content_length` is unconditional.
#[derive(Debug, Default)]
pub struct ResponseMetadata {
    /// Operation the fetch was performed with, if the fetcher reported one
    pub operation: Option<FetchOperation>,

    /// Content-Disposition header value
    pub content_disposition: Option<String>,

    /// Content-Type header value
    pub content_type: Option<String>,

    /// Location header value (redirects are relayed, not followed)
    pub location: Option<String>,

    /// Last-Modified header as epoch milliseconds; zero on the wire means absent
    pub last_modified_ms: Option<u64>,

    /// All Set-Cookie header values joined with newlines
    pub set_cookie: Option<String>,

    /// User-Agent the fetcher sent upstream
    pub user_agent: Option<String>,

    /// Server header value
    pub server: Option<String>,

    /// Declared body length in bytes; always present, zero when unknown
    pub content_length: u64,

    /// Shared memory body, when the response carried one
    pub body: Option<BodyRef>,
}

impl ResponseMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn encode(self, enc: &mut Encoder) -> Result<(), EncodeError> {
        enc.put_u32(self.operation.map_or(0, FetchOperation::to_wire));
        enc.put_opt_str(self.content_disposition.as_deref())?;
        enc.put_opt_str(self.content_type.as_deref())?;
        enc.put_opt_str(self.location.as_deref())?;
        enc.put_u64(self.last_modified_ms.unwrap_or(0));
        enc.put_opt_str(self.set_cookie.as_deref())?;
        enc.put_opt_str(self.user_agent.as_deref())?;
        enc.put_opt_str(self.server.as_deref())?;
        enc.put_u64(self.content_length);
        match self.body {
            Some(body) => {
                enc.put_bool(true);
                body.encode(enc);
            }
            None => enc.put_bool(false),
        }
        Ok(())
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let operation = FetchOperation::from_wire(dec.get_u32()?)?;
        let content_disposition = dec.get_opt_str()?;
        let content_type = dec.get_opt_str()?;
        let location = dec.get_opt_str()?;
        let last_modified_ms = match dec.get_u64()? {
            0 => None,
            ms => Some(ms),
        };
        let set_cookie = dec.get_opt_str()?;
        let user_agent = dec.get_opt_str()?;
        let server = dec.get_opt_str()?;
        let content_length = dec.get_u64()?;
        let body = if dec.get_bool()? {
            Some(BodyRef::decode(dec)?)
        } else {
            None
        };
        Ok(Self {
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
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::SharedRegion;

    fn roundtrip(meta: ResponseMetadata) -> ResponseMetadata {
        let mut enc = Encoder::new();
        meta.encode(&mut enc).unwrap();
        let (buf, fds) = enc.finish();

        let mut dec = Decoder::new(&buf, fds);
        let decoded = ResponseMetadata::decode(&mut dec).unwrap();
        dec.finish().unwrap();
        decoded
    }

    #[test]
    fn test_empty_metadata_roundtrip() {
        let decoded = roundtrip(ResponseMetadata::new());

        assert_eq!(decoded.operation, None);
        assert_eq!(decoded.content_type, None);
        assert_eq!(decoded.last_modified_ms, None);
        assert_eq!(decoded.content_length, 0);
        assert!(!decoded.has_body());
    }

    #[test]
    fn test_full_metadata_roundtrip() {
        let region = SharedRegion::allocate_from(b"payload").unwrap();
        let handle = region.into_handle().unwrap();

        let meta = ResponseMetadata {
            operation: Some(FetchOperation::Post),
            content_disposition: Some("attachment; filename=a.bin".into()),
            content_type: Some("application/octet-stream".into()),
            location: Some("https://example.com/next".into()),
            last_modified_ms: Some(1_700_000_000_000),
            set_cookie: Some("a=1\nb=2".into()),
            user_agent: Some("relay/0.1".into()),
            server: Some("nginx".into()),
            content_length: 7,
            body: Some(BodyRef::new(handle, 7)),
        };
        let decoded = roundtrip(meta);

        assert_eq!(decoded.operation, Some(FetchOperation::Post));
        assert_eq!(decoded.content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(decoded.set_cookie.as_deref(), Some("a=1\nb=2"));
        assert_eq!(decoded.content_length, 7);

        let body = decoded.body.unwrap();
        assert_eq!(body.len, 7);
        let mapped = SharedRegion::map(body.handle, body.len).unwrap();
        assert_eq!(mapped.bytes(), b"payload");
    }

    #[test]
    fn test_zero_operation_decodes_as_unspecified() {
        let meta = roundtrip(ResponseMetadata::new());
        assert_eq!(meta.operation, None);
        assert_eq!(meta.operation.unwrap_or_default(), FetchOperation::Get);
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let mut enc = Encoder::new();
        enc.put_u32(99);
        let (buf, _) = enc.finish();

        let mut dec = Decoder::new(&buf, Vec::new());
        assert_eq!(
            ResponseMetadata::decode(&mut dec).unwrap_err(),
            DecodeError::BadDiscriminant {
                what: "fetch operation",
                value: 99
            }
        );
    }

    #[test]
    fn test_truncated_metadata_fails_whole_decode() {
        let mut enc = Encoder::new();
        ResponseMetadata {
            content_type: Some("text/html".into()),
            content_length: 11,
            ..Default::default()
        }
        .encode(&mut enc)
        .unwrap();
        let (buf, _) = enc.finish();

        // Cut the buffer short so a trailing field runs out of bytes
        let mut dec = Decoder::new(&buf[..buf.len() - 10], Vec::new());
        assert!(matches!(
            ResponseMetadata::decode(&mut dec),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_oversized_cookie_fails_encode() {
        use crate::constants::MAX_WIRE_STRING_BYTES;

        let mut enc = Encoder::new();
        let err = ResponseMetadata {
            set_cookie: Some("c".repeat(MAX_WIRE_STRING_BYTES + 1)),
            ..Default::default()
        }
        .encode(&mut enc)
        .unwrap_err();
        assert!(matches!(err, EncodeError::StringTooLong { .. }));
    }

    #[test]
    fn test_operation_method_mapping() {
        assert_eq!(FetchOperation::Get.method(), http::Method::GET);
        assert_eq!(FetchOperation::Head.method(), http::Method::HEAD);
        assert_eq!(FetchOperation::Delete.as_str(), "DELETE");
        assert_eq!(FetchOperation::from_wire(2).unwrap(), Some(FetchOperation::Head));
    }
}
