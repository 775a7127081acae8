//! Fetch requests sent from a consumer to the fetcher

use crate::protocol::metadata::FetchOperation;
use crate::utils::{current_timestamp_millis, generate_request_id};
use crate::wire::{DecodeError, Decoder, EncodeError, Encoder};

/// A network load a consumer asks the fetcher to perform on its behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Unique request identifier ("req_" prefix + UUID)
    pub request_id: String,

    /// HTTP operation to perform
    pub operation: FetchOperation,

    /// Absolute URL to fetch
    pub url: String,

    /// Request headers as name/value pairs, applied in order
    pub headers: Vec<(String, String)>,

    /// Request body; empty for bodyless operations
    pub body: Vec<u8>,

    /// Consumer-side timestamp in epoch milliseconds
    pub timestamp_ms: u64,
}

impl FetchRequest {
    pub fn new(operation: FetchOperation, url: impl Into<String>) -> Self {
        Self {
            request_id: generate_request_id(),
            operation,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
            timestamp_ms: current_timestamp_millis(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<(), EncodeError> {
        enc.put_str(&self.request_id)?;
        enc.put_u32(self.operation.to_wire());
        enc.put_str(&self.url)?;
        enc.put_u32(self.headers.len() as u32);
        for (name, value) in &self.headers {
            enc.put_str(name)?;
            enc.put_str(value)?;
        }
        enc.put_bytes(&self.body);
        enc.put_u64(self.timestamp_ms);
        Ok(())
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let request_id = dec.get_str()?;
        let operation = FetchOperation::from_wire(dec.get_u32()?)?.unwrap_or_default();
        let url = dec.get_str()?;
        let header_count = dec.get_u32()?;
        let mut headers = Vec::new();
        for _ in 0..header_count {
            let name = dec.get_str()?;
            let value = dec.get_str()?;
            headers.push((name, value));
        }
        let body = dec.get_bytes()?;
        let timestamp_ms = dec.get_u64()?;
        Ok(Self {
            request_id,
            operation,
            url,
            headers,
            body,
            timestamp_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_request_id;

    #[test]
    fn test_fetch_request_creation() {
        let req = FetchRequest::new(FetchOperation::Get, "https://example.com/index.html");

        assert!(validate_request_id(&req.request_id).is_ok());
        assert_eq!(req.operation, FetchOperation::Get);
        assert_eq!(req.url, "https://example.com/index.html");
        assert!(!req.has_body());
        assert!(req.timestamp_ms > 0);
    }

    #[test]
    fn test_request_with_headers_and_body() {
        let req = FetchRequest::new(FetchOperation::Post, "https://example.com/submit")
            .with_header("content-type", "application/json")
            .with_body(b"{\"a\":1}".to_vec());

        assert!(req.has_body());
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.headers[0].1, "application/json");
    }

    #[test]
    fn test_request_roundtrip() {
        let req = FetchRequest::new(FetchOperation::Put, "https://example.com/resource")
            .with_header("x-trace", "abc123")
            .with_header("accept", "*/*")
            .with_body(vec![1, 2, 3, 4]);

        let mut enc = Encoder::new();
        req.encode(&mut enc).unwrap();
        let (buf, fds) = enc.finish();
        assert!(fds.is_empty());

        let mut dec = Decoder::new(&buf, Vec::new());
        let decoded = FetchRequest::decode(&mut dec).unwrap();
        dec.finish().unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_truncated_request_rejected() {
        let req = FetchRequest::new(FetchOperation::Get, "https://example.com/");
        let mut enc = Encoder::new();
        req.encode(&mut enc).unwrap();
        let (buf, _) = enc.finish();

        let mut dec = Decoder::new(&buf[..buf.len() - 4], Vec::new());
        assert!(matches!(
            FetchRequest::decode(&mut dec),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
