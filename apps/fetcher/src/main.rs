use anyhow::Result;
use chrono::DateTime;
use clap::Parser;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{
    self, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED, LOCATION, SERVER,
    USER_AGENT,
};
use shm_relay_common::{
    BodyRef, ErrorCode, FetchRequest, FrameReader, FrameWriter, Hello, MapError, Message,
    RelayError, ResponseMetadata, SharedRegion,
    constants::{
        CONNECT_TIMEOUT_SECS, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_SOCKET_PATH, MAX_BODY_BYTES,
        PROTOCOL_VERSION,
    },
    frame_pair,
    utils::{build_header_map, header_string, join_set_cookie},
    validation::{sanitize_header_value, validate_fetch_url, validate_request_id},
};
use std::{path::PathBuf, sync::Arc, time::Duration, time::Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// CLI arguments for the fetcher daemon
#[derive(Parser, Debug)]
#[command(name = "srf")]
#[command(about = "Shared memory relay fetcher daemon", long_about = None)]
#[command(version)]
struct Args {
    /// Unix socket path to listen on
    #[arg(short, long, env = "SRF_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Upstream request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_FETCH_TIMEOUT_SECS)]
    request_timeout: u64,

    /// Largest response body relayed through shared memory, in bytes
    #[arg(long, default_value_t = MAX_BODY_BYTES)]
    max_body_bytes: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Configuration for the fetcher
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket the daemon listens on
    pub socket_path: PathBuf,

    /// Timeout for each upstream request
    pub fetch_timeout: Duration,

    /// Timeout for the version handshake on a fresh connection
    pub handshake_timeout: Duration,

    /// Largest body relayed through shared memory
    pub max_body_bytes: u64,
}

impl Config {
    fn from_args(args: Args) -> Self {
        Self {
            socket_path: args.socket,
            fetch_timeout: Duration::from_secs(args.request_timeout),
            handshake_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            max_body_bytes: args.max_body_bytes,
        }
    }
}

/// Accepts consumer connections and serves their fetch requests
struct FetchServer {
    config: Arc<Config>,
    client: Client,
}

impl FetchServer {
    fn new(config: Config) -> Result<Self> {
        // Redirects are relayed to the consumer, never followed here
        let client = Client::builder()
            .timeout(config.fetch_timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RelayError::HttpError(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    async fn run(&self) -> Result<()> {
        let path = &self.config.socket_path;

        match std::fs::remove_file(path) {
            Ok(()) => warn!("Removed stale socket at {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(path)?;
        info!("Listening on {}", path.display());

        loop {
            let (stream, _addr) = listener.accept().await?;
            debug!("Consumer connected");

            let client = self.client.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, client, config).await {
                    error!("Connection ended with error: {}", e);
                }
            });
        }
    }
}

/// Handshake with a fresh consumer, then split into read and write tasks
async fn handle_connection(stream: UnixStream, client: Client, config: Arc<Config>) -> Result<()> {
    let (mut reader, mut writer) = frame_pair(stream);

    // The consumer speaks first
    let first = tokio::time::timeout(config.handshake_timeout, reader.recv())
        .await
        .map_err(|_| RelayError::Timeout)??;

    match first {
        Some(Message::Hello(hello)) if hello.is_compatible() => {
            debug!("Handshake from {} (pid {})", hello.process, hello.pid);
        }
        Some(Message::Hello(hello)) => {
            return Err(RelayError::ConnectionError(format!(
                "peer speaks protocol version {}, expected {}",
                hello.version, PROTOCOL_VERSION
            ))
            .into());
        }
        Some(other) => {
            return Err(RelayError::InvalidMessage(format!(
                "expected hello, got {:?} frame",
                other.kind()
            ))
            .into());
        }
        None => {
            return Err(RelayError::ConnectionError("peer closed before handshake".into()).into());
        }
    }

    writer.send(Message::Hello(Hello::new("fetcher"))).await?;

    // Channel for outgoing messages
    let (outgoing_tx, outgoing_rx) = mpsc::channel::<Message>(100);

    let write_handle = tokio::spawn(spawn_write_task(writer, outgoing_rx));
    let read_handle = tokio::spawn(spawn_read_task(reader, outgoing_tx, client, config));

    // Wait for either task to complete
    tokio::select! {
        result = write_handle => {
            warn!("Write task ended: {:?}", result);
        }
        result = read_handle => {
            debug!("Read task ended: {:?}", result);
        }
    }

    Ok(())
}

/// Write task sends outgoing messages through the socket
async fn spawn_write_task(
    mut writer: FrameWriter,
    mut outgoing_rx: mpsc::Receiver<Message>,
) -> Result<()> {
    while let Some(message) = outgoing_rx.recv().await {
        if let Err(e) = writer.send(message).await {
            error!("Failed to send frame: {}", e);
            break;
        }
    }

    debug!("Write task exiting");
    Ok(())
}

/// Read task receives incoming messages and dispatches them
async fn spawn_read_task(
    mut reader: FrameReader,
    outgoing_tx: mpsc::Sender<Message>,
    client: Client,
    config: Arc<Config>,
) -> Result<()> {
    loop {
        match reader.recv().await {
            Ok(Some(Message::Fetch(request))) => {
                debug!(
                    "Received fetch: {} {}",
                    request.operation.as_str(),
                    request.url
                );

                // Spawn a new task to handle this request concurrently
                let outgoing_tx = outgoing_tx.clone();
                let client = client.clone();
                let config = config.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_fetch(request, &client, &config, outgoing_tx).await {
                        error!("Failed to handle fetch: {}", e);
                    }
                });
            }
            Ok(Some(Message::Hello(_))) => {
                warn!("Received unexpected hello after handshake");
            }
            Ok(Some(Message::Error { code, message, .. })) => {
                error!("Peer error: {:?} - {}", code, message);
            }
            Ok(Some(other)) => {
                warn!("Received unexpected {:?} frame", other.kind());
            }
            Ok(None) => {
                info!("Consumer disconnected");
                break;
            }
            Err(e) => {
                error!("Transport error: {}", e);
                break;
            }
        }
    }

    debug!("Read task exiting");
    Ok(())
}

/// Perform one upstream fetch and answer with a reply or error frame
async fn handle_fetch(
    request: FetchRequest,
    client: &Client,
    config: &Config,
    outgoing_tx: mpsc::Sender<Message>,
) -> Result<()> {
    let start_time = Instant::now();
    let request_id = request.request_id.clone();

    if let Err(e) = validate_request_id(&request.request_id) {
        return send_error(
            &outgoing_tx,
            Some(request_id),
            ErrorCode::InvalidRequest,
            e.to_string(),
        )
        .await;
    }

    if let Err(e) = validate_fetch_url(&request.url) {
        return send_error(
            &outgoing_tx,
            Some(request_id),
            ErrorCode::InvalidRequest,
            e.to_string(),
        )
        .await;
    }

    debug!("Fetching: {} {}", request.operation.as_str(), request.url);

    let operation = request.operation;
    let request_headers = build_header_map(&request.headers);
    let request_user_agent = header_string(&request_headers, USER_AGENT);

    let mut req_builder = client
        .request(operation.method(), &request.url)
        .headers(request_headers);

    // Add body if present
    if !request.body.is_empty() {
        req_builder = req_builder.body(request.body);
    }

    // Execute request
    let response = match req_builder.send().await {
        Ok(response) => response,
        Err(e) => {
            error!("Upstream request failed: {}", e);
            let code = if e.is_timeout() {
                ErrorCode::Timeout
            } else {
                ErrorCode::FetchFailed
            };
            return send_error(&outgoing_tx, Some(request_id), code, e.to_string()).await;
        }
    };

    let status = response.status();
    let headers = response.headers().clone();

    // Collect the body, bailing out as soon as the cap is crossed
    let mut body: Vec<u8> = Vec::new();
    let mut chunks = response.bytes_stream();

    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                error!("Upstream body error: {}", e);
                return send_error(
                    &outgoing_tx,
                    Some(request_id),
                    ErrorCode::FetchFailed,
                    e.to_string(),
                )
                .await;
            }
        };

        if (body.len() + chunk.len()) as u64 > config.max_body_bytes {
            let err = RelayError::BodyTooLarge {
                size: (body.len() + chunk.len()) as u64,
                limit: config.max_body_bytes,
            };
            warn!("{} for {}", err, request.url);
            return send_error(
                &outgoing_tx,
                Some(request_id),
                ErrorCode::BodyTooLarge,
                err.to_string(),
            )
            .await;
        }

        body.extend_from_slice(&chunk);
    }

    let elapsed = start_time.elapsed().as_millis() as u64;
    debug!(
        "Response: {} ({} bytes, {}ms)",
        status.as_u16(),
        body.len(),
        elapsed
    );

    let mut metadata = response_metadata(&headers);
    metadata.operation = Some(operation);
    if metadata.user_agent.is_none() {
        metadata.user_agent = request_user_agent;
    }

    if !body.is_empty() {
        if let Err(e) = stage_body(&mut metadata, &body) {
            error!("Failed to stage body in shared memory: {}", e);
            return send_error(
                &outgoing_tx,
                Some(request_id),
                ErrorCode::Internal,
                e.to_string(),
            )
            .await;
        }
    }

    outgoing_tx
        .send(Message::Reply {
            request_id,
            metadata,
        })
        .await
        .map_err(|e| RelayError::ConnectionError(e.to_string()))?;

    Ok(())
}

/// Send a terminal error frame for a request
async fn send_error(
    outgoing_tx: &mpsc::Sender<Message>,
    request_id: Option<String>,
    code: ErrorCode,
    message: String,
) -> Result<()> {
    outgoing_tx
        .send(Message::Error {
            request_id,
            code,
            message,
        })
        .await
        .map_err(|e| RelayError::ConnectionError(e.to_string()))?;

    Ok(())
}

/// Build reply metadata from upstream response headers
fn response_metadata(headers: &header::HeaderMap) -> ResponseMetadata {
    let mut meta = ResponseMetadata::new();

    meta.content_disposition = relayed(headers, CONTENT_DISPOSITION);
    meta.content_type = relayed(headers, CONTENT_TYPE);
    meta.location = relayed(headers, LOCATION);
    meta.last_modified_ms =
        header_string(headers, LAST_MODIFIED).and_then(|v| parse_last_modified_millis(&v));
    meta.set_cookie = join_set_cookie(headers);
    meta.user_agent = relayed(headers, USER_AGENT);
    meta.server = relayed(headers, SERVER);
    meta.content_length = header_string(headers, CONTENT_LENGTH)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    meta
}

/// First value for an upstream header, sanitized before it leaves the fetcher
fn relayed(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    header_string(headers, name).and_then(|v| sanitize_header_value(&v).ok())
}

/// Seal the collected body into a shared region and attach it to the reply.
/// The staged byte count becomes the declared length; an upstream
/// Content-Length that disagrees with the bytes actually received must not
/// reach the consumer's accounting.
fn stage_body(metadata: &mut ResponseMetadata, body: &[u8]) -> Result<(), MapError> {
    let handle = SharedRegion::allocate_from(body)?.into_handle()?;
    metadata.content_length = body.len() as u64;
    metadata.body = Some(BodyRef::new(handle, body.len() as u64));
    Ok(())
}

/// Parse an HTTP date header into epoch milliseconds
fn parse_last_modified_millis(value: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc2822(value).ok()?;
    u64::try_from(parsed.timestamp_millis()).ok()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Shared Memory Relay Fetcher v{}", env!("CARGO_PKG_VERSION"));
    info!("Socket: {}", args.socket.display());

    // Build configuration
    let config = Config::from_args(args);

    // Create and run the fetch server
    let server = FetchServer::new(config)?;

    // Run until interrupted
    tokio::select! {
        result = server.run() => {
            error!("Fetch server exited: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
        }
    }

    Ok(())
}
