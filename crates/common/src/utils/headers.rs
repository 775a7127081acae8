//! Header conversions between HTTP responses and relay metadata

use http::HeaderMap;
use http::header::{AsHeaderName, HeaderName, HeaderValue, SET_COOKIE};
use tracing::debug;

use crate::validation::{sanitize_header_name, sanitize_header_value};

/// Request headers the fetcher never forwards upstream
const SKIP_REQUEST_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];

/// First value of a header as an owned string, if present and readable
pub fn header_string(headers: &HeaderMap, name: impl AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// All Set-Cookie values joined with newlines, preserving response order
pub fn join_set_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if cookies.is_empty() {
        None
    } else {
        Some(cookies.join("\n"))
    }
}

/// Build a header map from relayed name/value pairs
///
/// Hop-by-hop and connection-managed headers are dropped, as is any pair
/// that fails sanitization; a bad header skips that pair, never the request.
pub fn build_header_map(pairs: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        let Ok(name) = sanitize_header_name(name) else {
            debug!(header = %name.chars().take(32).collect::<String>(), "skipping invalid header name");
            continue;
        };
        if SKIP_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let Ok(value) = sanitize_header_value(value) else {
            debug!(header = %name, "skipping oversized header value");
            continue;
        };
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!(header = %name, "skipping unparseable header"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONTENT_TYPE, SERVER};

    #[test]
    fn test_header_string() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));

        assert_eq!(
            header_string(&headers, CONTENT_TYPE).as_deref(),
            Some("text/html")
        );
        assert_eq!(header_string(&headers, SERVER), None);
    }

    #[test]
    fn test_join_set_cookie_preserves_order() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1; Path=/"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2; HttpOnly"));

        assert_eq!(
            join_set_cookie(&headers).as_deref(),
            Some("a=1; Path=/\nb=2; HttpOnly")
        );
    }

    #[test]
    fn test_join_set_cookie_absent() {
        assert_eq!(join_set_cookie(&HeaderMap::new()), None);
    }

    #[test]
    fn test_build_header_map_skips_managed_headers() {
        let pairs = vec![
            ("Accept".to_string(), "text/html".to_string()),
            ("Host".to_string(), "evil.example".to_string()),
            ("Content-Length".to_string(), "999".to_string()),
            ("X-Custom".to_string(), "ok".to_string()),
        ];
        let map = build_header_map(&pairs);

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("accept").unwrap(), "text/html");
        assert_eq!(map.get("x-custom").unwrap(), "ok");
        assert!(map.get("host").is_none());
    }

    #[test]
    fn test_build_header_map_drops_bad_pairs() {
        let pairs = vec![
            ("Ok-Header".to_string(), "fine".to_string()),
            ("héader".to_string(), "x".to_string()),
            ("x-stripped".to_string(), "control\r\nchars".to_string()),
        ];
        let map = build_header_map(&pairs);

        assert_eq!(map.get("ok-header").unwrap(), "fine");
        // Control characters are stripped, the header itself survives
        assert_eq!(map.get("x-stripped").unwrap(), "controlchars");
        assert_eq!(map.len(), 2);
    }
}
