//! Input validation for data crossing the relay socket
//!
//! Requests arrive from a less trusted process, and relayed header values
//! end up in logs and consumer-visible state. These checks keep malformed
//! identifiers, oversized fields and control characters out of both.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Regex for validating request IDs (req_ prefix + UUID format)
static REQUEST_ID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^req_[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$").unwrap()
});

/// Regex for the URL schemes the fetcher will load
static URL_SCHEME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://").unwrap());

/// Maximum length for fetch URLs
pub const MAX_URL_LENGTH: usize = 2048;

/// Maximum length for HTTP header values
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid request ID format: {0}")]
    InvalidRequestId(String),

    #[error("URL too long: {0} bytes (max: {1})")]
    UrlTooLong(usize, usize),

    #[error("URL scheme not allowed: {0}")]
    UrlSchemeNotAllowed(String),

    #[error("Header value too long: {0} bytes (max: {1})")]
    HeaderValueTooLong(usize, usize),

    #[error("Invalid header value contains control characters")]
    InvalidHeaderValue,
}

/// Validate request ID format
///
/// Request IDs must start with "req_" followed by a UUID.
///
/// # Examples
///
/// ```
/// use shm_relay_common::validation::validate_request_id;
///
/// assert!(validate_request_id("req_550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_request_id("invalid").is_err());
/// ```
pub fn validate_request_id(id: &str) -> Result<(), ValidationError> {
    if !REQUEST_ID_REGEX.is_match(id) {
        return Err(ValidationError::InvalidRequestId(
            id.chars().take(50).collect::<String>(), // Limit error message
        ));
    }
    Ok(())
}

/// Validate a URL a consumer asked the fetcher to load
///
/// Only absolute http/https URLs within the length limit are accepted.
pub fn validate_fetch_url(url: &str) -> Result<(), ValidationError> {
    if url.len() > MAX_URL_LENGTH {
        return Err(ValidationError::UrlTooLong(url.len(), MAX_URL_LENGTH));
    }
    if !URL_SCHEME_REGEX.is_match(url) {
        return Err(ValidationError::UrlSchemeNotAllowed(
            url.chars().take(50).collect::<String>(), // Limit error message
        ));
    }
    Ok(())
}

/// Sanitize an HTTP header value before relaying it
///
/// - Removes control characters (except tab, which is allowed in headers)
/// - Enforces length limits
pub fn sanitize_header_value(value: &str) -> Result<String, ValidationError> {
    if value.len() > MAX_HEADER_VALUE_LENGTH {
        return Err(ValidationError::HeaderValueTooLong(
            value.len(),
            MAX_HEADER_VALUE_LENGTH,
        ));
    }

    let sanitized: String = value
        .chars()
        .filter(|c| !c.is_control() || *c == '\t')
        .collect();

    Ok(sanitized)
}

/// Sanitize a header name
///
/// Header names must be ASCII and contain no control characters.
pub fn sanitize_header_name(name: &str) -> Result<String, ValidationError> {
    if !name.is_ascii() {
        return Err(ValidationError::InvalidHeaderValue);
    }

    let sanitized: String = name.chars().filter(|c| !c.is_control()).collect();

    if sanitized.is_empty() {
        return Err(ValidationError::InvalidHeaderValue);
    }

    Ok(sanitized.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_request_id_valid() {
        assert!(validate_request_id("req_550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_request_id("req_00000000-0000-0000-0000-000000000000").is_ok());
    }

    #[test]
    fn test_validate_request_id_invalid() {
        assert!(validate_request_id("550e8400-e29b-41d4-a716-446655440000").is_err()); // no prefix
        assert!(validate_request_id("req_not-a-uuid").is_err());
        assert!(validate_request_id("req_550E8400-E29B-41D4-A716-446655440000").is_err()); // uppercase
        assert!(validate_request_id("").is_err());
    }

    #[test]
    fn test_validate_fetch_url() {
        assert!(validate_fetch_url("https://example.com/index.html").is_ok());
        assert!(validate_fetch_url("http://127.0.0.1:8080/x?q=1").is_ok());

        assert!(validate_fetch_url("file:///etc/passwd").is_err());
        assert!(validate_fetch_url("ftp://example.com/").is_err());
        assert!(validate_fetch_url("example.com/no-scheme").is_err());

        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(matches!(
            validate_fetch_url(&long),
            Err(ValidationError::UrlTooLong(_, _))
        ));
    }

    #[test]
    fn test_sanitize_header_value() {
        assert_eq!(sanitize_header_value("normal value").unwrap(), "normal value");
        assert_eq!(
            sanitize_header_value("with\ttab").unwrap(),
            "with\ttab"
        );
        assert_eq!(
            sanitize_header_value("strip\r\nnewlines").unwrap(),
            "stripnewlines"
        );

        let long = "x".repeat(MAX_HEADER_VALUE_LENGTH + 1);
        assert!(sanitize_header_value(&long).is_err());
    }

    #[test]
    fn test_sanitize_header_name() {
        assert_eq!(sanitize_header_name("Content-Type").unwrap(), "content-type");
        assert!(sanitize_header_name("héader").is_err());
        assert!(sanitize_header_name("\r\n").is_err());
    }
}
