use anyhow::Result;
use clap::Parser;
use shm_relay_common::{
    ErrorCode, FetchOperation, FetchRequest, Hello, Message, RelayError, RelayStream, StreamEvent,
    constants::{
        CONNECT_TIMEOUT_SECS, DEFAULT_REPLY_TIMEOUT_SECS, DEFAULT_SOCKET_PATH, PROTOCOL_VERSION,
    },
    frame_pair,
};
use std::{
    io::{Read, Write},
    path::PathBuf,
    time::Duration,
};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// CLI arguments for the consumer
#[derive(Parser, Debug)]
#[command(name = "consumer")]
#[command(about = "Fetch a URL through the relay and print the body", long_about = None)]
#[command(version)]
struct Args {
    /// URL to fetch through the relay
    url: String,

    /// Unix socket the fetcher listens on
    #[arg(short, long, env = "SHM_RELAY_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Seconds to wait for the reply
    #[arg(long, default_value_t = DEFAULT_REPLY_TIMEOUT_SECS)]
    timeout: u64,

    /// Send a HEAD request instead of GET
    #[arg(long)]
    head: bool,

    /// Write the body to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Configuration for the consumer
#[derive(Debug, Clone)]
pub struct Config {
    /// URL to fetch
    pub url: String,

    /// Unix socket the fetcher listens on
    pub socket_path: PathBuf,

    /// How long to wait for the terminal reply
    pub reply_timeout: Duration,

    /// Timeout for the version handshake
    pub handshake_timeout: Duration,

    /// Operation to request
    pub operation: FetchOperation,

    /// Body destination; stdout when absent
    pub output: Option<PathBuf>,
}

impl Config {
    fn from_args(args: Args) -> Self {
        Self {
            url: args.url,
            socket_path: args.socket,
            reply_timeout: Duration::from_secs(args.timeout),
            handshake_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            operation: if args.head {
                FetchOperation::Head
            } else {
                FetchOperation::Get
            },
            output: args.output,
        }
    }
}

/// Connect, fetch once and drain the resulting stream
async fn run(config: &Config) -> Result<()> {
    let socket = UnixStream::connect(&config.socket_path).await.map_err(|e| {
        RelayError::ConnectionError(format!(
            "cannot reach fetcher at {}: {}",
            config.socket_path.display(),
            e
        ))
    })?;

    let (mut reader, mut writer) = frame_pair(socket);

    // Handshake: we speak first, the fetcher answers
    writer.send(Message::Hello(Hello::new("consumer"))).await?;

    let answer = tokio::time::timeout(config.handshake_timeout, reader.recv())
        .await
        .map_err(|_| RelayError::Timeout)??;

    match answer {
        Some(Message::Hello(hello)) if hello.is_compatible() => {
            debug!("Connected to {} (pid {})", hello.process, hello.pid);
        }
        Some(Message::Hello(hello)) => {
            return Err(RelayError::ConnectionError(format!(
                "fetcher speaks protocol version {}, expected {}",
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
            return Err(
                RelayError::ConnectionError("fetcher closed before handshake".into()).into(),
            );
        }
    }

    let request = FetchRequest::new(config.operation, &config.url);
    let request_id = request.request_id.clone();

    info!("Fetching {} ({})", config.url, config.operation.as_str());
    writer.send(Message::Fetch(request)).await?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut stream = RelayStream::new(&config.url, events_tx);

    let deadline = tokio::time::sleep(config.reply_timeout);
    tokio::pin!(deadline);

    // Wait for the terminal frame answering our request
    loop {
        tokio::select! {
            frame = reader.recv() => {
                match frame? {
                    Some(Message::Reply { request_id: id, metadata }) if id == request_id => {
                        stream.apply_metadata(metadata);
                        stream.finalize();
                        break;
                    }
                    Some(Message::Body { request_id: id, body }) if id == request_id => {
                        stream.bind_body(body.handle, body.len);
                        stream.finalize();
                        break;
                    }
                    Some(Message::Error { request_id: id, code, message })
                        if id.as_deref() == Some(request_id.as_str()) || id.is_none() =>
                    {
                        return Err(match code {
                            ErrorCode::Timeout => RelayError::Timeout,
                            ErrorCode::Internal => RelayError::InternalError(message),
                            _ => RelayError::FetchFailed(format!("{:?}: {}", code, message)),
                        }
                        .into());
                    }
                    Some(other) => {
                        warn!(
                            "Ignoring unexpected {:?} frame for request {:?}",
                            other.kind(),
                            other.request_id()
                        );
                    }
                    None => {
                        return Err(RelayError::ConnectionError(
                            "fetcher closed the connection".into(),
                        )
                        .into());
                    }
                }
            }
            _ = &mut deadline => {
                return Err(RelayError::Timeout.into());
            }
        }
    }

    print_summary(&stream);

    // The stream reports readiness through its event channel
    while let Some(event) = events_rx.recv().await {
        match event {
            StreamEvent::DataReady => match &config.output {
                Some(path) => {
                    let mut file = std::fs::File::create(path)?;
                    drain_stream(&mut stream, &mut file)?;
                    info!("Body written to {}", path.display());
                }
                None => {
                    let mut stdout = std::io::stdout().lock();
                    drain_stream(&mut stream, &mut stdout)?;
                    stdout.flush()?;
                }
            },
            StreamEvent::Finished => break,
        }
    }

    Ok(())
}

/// Log the resolved headers and length
fn print_summary(stream: &RelayStream) {
    info!("Response for {}", stream.url());
    for (key, value) in stream.headers() {
        info!("  {}: {}", key.name(), value);
    }
    info!("Body: {} bytes", stream.bytes_available());
}

/// Copy everything the stream still holds into the writer
fn drain_stream(stream: &mut RelayStream, out: &mut impl Write) -> Result<()> {
    let mut buf = [0u8; 8192];

    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging; the body goes to stdout, so logs go to stderr
    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Build configuration
    let config = Config::from_args(args);

    // Run until finished or interrupted
    tokio::select! {
        result = run(&config) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    Ok(())
}
