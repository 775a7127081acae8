/// Wire protocol version, carried in every frame header and in the hello
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the frame header: length (u32) + version (u16) + kind (u16)
pub const FRAME_HEADER_BYTES: usize = 8;

/// Maximum frame payload size (1 MB; bodies travel in shared memory, never in frames)
pub const MAX_FRAME_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Maximum file descriptors attached to a single frame
pub const MAX_FDS_PER_FRAME: usize = 1;

/// Maximum length of a single string field on the wire (64 KB)
pub const MAX_WIRE_STRING_BYTES: usize = 64 * 1024;

/// Maximum response body size the fetcher will relay (64 MB)
pub const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// Default Unix socket path for the fetcher daemon
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/shm-relay.sock";

/// Default timeout for a single upstream fetch (under typical gateway limits)
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 25;

/// Timeout for establishing the upstream TCP connection
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default timeout a consumer waits for a reply before giving up
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 30;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_values() {
        const _: () = assert!(MAX_WIRE_STRING_BYTES < MAX_FRAME_PAYLOAD_BYTES);
        const _: () = assert!(FRAME_HEADER_BYTES == 8);
        const _: () = assert!(MAX_FDS_PER_FRAME == 1);
        const _: () = assert!(CONNECT_TIMEOUT_SECS < DEFAULT_FETCH_TIMEOUT_SECS);
        const _: () = assert!(DEFAULT_FETCH_TIMEOUT_SECS < DEFAULT_REPLY_TIMEOUT_SECS);

        // Verify size limits
        assert_eq!(MAX_BODY_BYTES, 64 * 1024 * 1024);
    }
}
