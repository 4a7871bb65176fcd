// Entry points for running transfers.
//
// A `Session` is one transfer waiting to happen: a channel, a way to find the server, the remote
// filename and the knobs in `SessionConfig`. Running it resolves the host, builds the request
// options, and hands a fresh context to the download or upload state machine. `TftpClient` sits
// on top for the common case of a UDP socket, the system resolver and files on disk.

use crate::channel::{TransferChannel, UdpChannel};
use crate::context::{TransferContext, TransferStats};
use crate::download::DownloadState;
use crate::machine;
use crate::resolver::{DnsResolver, HostResolver};
use crate::tftp::{self, ErrorCode, Options, TransferMode};
use crate::upload::UploadState;
use std::error;
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

/// Everything that can end a transfer early.
#[derive(Debug)]
pub enum TransferError {
    /// The server sent an ERROR packet.
    Remote { code: ErrorCode, message: String },

    /// Nothing acceptable arrived after this many attempts.
    Timeout { attempts: u32 },
    Resolve(String),

    /// The channel failed to send or receive.
    Transport(io::Error),

    /// The caller's stream failed to read or write.
    Stream(io::Error),

    /// The server's OACK could not be accepted.
    Negotiation(String),
    InvalidConfig(String),
    Cancelled,
}

impl error::Error for TransferError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Transport(e) | Self::Stream(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Remote { code, message } => write!(f, "Server reported an error, {code}: {message}"),
            Self::Timeout { attempts } => {
                write!(f, "Did not receive corresponding packet response after {attempts} attempts")
            }
            Self::Resolve(msg) => write!(f, "Unable to resolve host {msg}"),
            Self::Transport(e) => write!(f, "Socket IO error: {e}"),
            Self::Stream(e) => write!(f, "Stream IO error: {e}"),
            Self::Negotiation(msg) => write!(f, "Option negotiation failed: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
            Self::Cancelled => write!(f, "Transfer was cancelled"),
        }
    }
}

/// Knobs for a single transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub mode: TransferMode,

    /// Block size to ask for with `blksize`. `None` keeps the 512 byte default and sends no option.
    pub block_size: Option<u16>,

    /// Ask for (download) or announce (upload) the file size with `tsize`.
    pub negotiate_size: bool,

    /// Tell the server our retransmission timeout with the `timeout` option.
    pub negotiate_timeout: bool,

    /// How long to wait for each reply before retrying.
    pub timeout: Duration,

    /// Sends of the same packet before giving up, the first one included.
    pub max_attempts: u32,

    /// Port requests are sent to.
    pub port: u16,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            mode: TransferMode::Octet,
            block_size: None,
            negotiate_size: false,
            negotiate_timeout: false,
            timeout: Duration::from_secs(3),
            max_attempts: 5,
            port: tftp::DEFAULT_PORT,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if let Some(size) = self.block_size {
            if !(tftp::MIN_BLOCK_SIZE..=tftp::MAX_BLOCK_SIZE).contains(&size) {
                return Err(TransferError::InvalidConfig(format!(
                    "block size {size} is outside {}..={}",
                    tftp::MIN_BLOCK_SIZE,
                    tftp::MAX_BLOCK_SIZE
                )));
            }
        }
        if self.timeout.is_zero() {
            return Err(TransferError::InvalidConfig("timeout must be positive".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(TransferError::InvalidConfig("at least one attempt is required".to_string()));
        }
        if self.port == 0 {
            return Err(TransferError::InvalidConfig("port 0 cannot be sent to".to_string()));
        }
        Ok(())
    }

    /// Options to put on a request. `transfer_size` is what `tsize` carries when size negotiation
    /// is on; the option is left out when it is `None`.
    fn request_options(&self, transfer_size: Option<u64>) -> Options {
        let mut options = Options::new();
        if let Some(size) = self.block_size {
            options.insert(tftp::OPT_BLKSIZE, size.to_string());
        }
        if self.negotiate_size {
            if let Some(size) = transfer_size {
                options.insert(tftp::OPT_TSIZE, size.to_string());
            }
        }
        if self.negotiate_timeout {
            let secs = self.timeout.as_secs().clamp(1, 255);
            options.insert(tftp::OPT_TIMEOUT, secs.to_string());
        }
        options
    }
}

/// One transfer of one remote file, in either direction.
pub struct Session<C, H> {
    channel: C,
    resolver: H,
    host: String,
    filename: String,
    config: SessionConfig,
}

impl<C: TransferChannel, H: HostResolver> Session<C, H> {
    pub fn new(
        channel: C,
        resolver: H,
        host: impl Into<String>,
        filename: impl Into<String>,
        config: SessionConfig,
    ) -> Session<C, H> {
        Session {
            channel,
            resolver,
            host: host.into(),
            filename: filename.into(),
            config,
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    async fn server_address(&self) -> Result<Ipv4Addr, TransferError> {
        self.config.validate()?;
        if !tftp::is_wire_string(&self.filename) {
            return Err(TransferError::InvalidConfig(format!(
                "filename {:?} contains a NUL byte",
                self.filename
            )));
        }
        let addr = self.resolver.resolve(&self.host).await?;
        log::debug!("Resolved {} to {}", self.host, addr);
        Ok(addr)
    }

    /// Fetches the remote file into `stream`, flushing it once the last block is written.
    pub async fn run_download<W>(&self, stream: &mut W) -> Result<TransferStats, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let addr = self.server_address().await?;
        log::info!("Downloading '{}' from {}:{}", self.filename, addr, self.config.port);

        let options = self.config.request_options(Some(0));
        let mut ctx = TransferContext::new(&self.channel, stream, addr, &self.filename, &self.config, options);
        machine::run(DownloadState::SendReadRequest { attempt: 1 }, &mut ctx).await?;
        ctx.stream.flush().await.map_err(TransferError::Stream)?;

        let stats = ctx.finish();
        log::info!("Received {} bytes in {} blocks", stats.bytes, stats.blocks);
        Ok(stats)
    }

    /// Sends everything `stream` yields until EOF as the remote file.
    pub async fn run_upload<R>(&self, stream: &mut R) -> Result<TransferStats, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        self.upload(stream, None).await
    }

    /// Like `run_upload`, for a stream known to hold `len` bytes. The length is announced with
    /// `tsize` when size negotiation is on.
    pub async fn run_upload_sized<R>(&self, stream: &mut R, len: u64) -> Result<TransferStats, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        self.upload(stream, Some(len)).await
    }

    async fn upload<R>(&self, stream: &mut R, len: Option<u64>) -> Result<TransferStats, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let addr = self.server_address().await?;
        log::info!("Uploading '{}' to {}:{}", self.filename, addr, self.config.port);

        let options = self.config.request_options(len);
        let mut ctx = TransferContext::new(&self.channel, stream, addr, &self.filename, &self.config, options);
        machine::run(UploadState::SendWriteRequest { attempt: 1 }, &mut ctx).await?;

        let stats = ctx.finish();
        log::info!("Sent {} bytes in {} blocks", stats.bytes, stats.blocks);
        Ok(stats)
    }

    /// Runs the download until it finishes or `cancel` completes, whichever happens first.
    pub async fn run_download_until<W, F>(&self, stream: &mut W, cancel: F) -> Result<TransferStats, TransferError>
    where
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run_download(stream) => result,
            _ = cancel => {
                log::info!("Download of '{}' cancelled", self.filename);
                Err(TransferError::Cancelled)
            }
        }
    }

    /// Runs the upload until it finishes or `cancel` completes, whichever happens first.
    pub async fn run_upload_until<R, F>(&self, stream: &mut R, cancel: F) -> Result<TransferStats, TransferError>
    where
        R: AsyncRead + Unpin,
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run_upload(stream) => result,
            _ = cancel => {
                log::info!("Upload of '{}' cancelled", self.filename);
                Err(TransferError::Cancelled)
            }
        }
    }
}

///////////////////////////////////////////////////////////////
/// A client for one server, running each transfer on its own UDP socket.
#[derive(Debug, Clone)]
pub struct TftpClient {
    host: String,
    config: SessionConfig,
}

impl TftpClient {
    pub fn new(host: impl Into<String>, config: SessionConfig) -> TftpClient {
        TftpClient { host: host.into(), config }
    }

    fn session(&self, filename: &str) -> Result<Session<UdpChannel, DnsResolver>, TransferError> {
        let channel = UdpChannel::bind_any().map_err(TransferError::Transport)?;
        Ok(Session::new(channel, DnsResolver, self.host.clone(), filename, self.config.clone()))
    }

    pub async fn download<W>(&self, remote: &str, stream: &mut W) -> Result<TransferStats, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        self.session(remote)?.run_download(stream).await
    }

    pub async fn upload<R>(&self, remote: &str, stream: &mut R) -> Result<TransferStats, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        self.session(remote)?.run_upload(stream).await
    }

    /// Downloads `remote` into a file at `path`. A failed download leaves no file behind.
    pub async fn download_file(&self, remote: &str, path: impl AsRef<Path>) -> Result<TransferStats, TransferError> {
        let path = path.as_ref();
        let mut file = tokio::fs::File::create(path).await.map_err(TransferError::Stream)?;

        let result = self.download(remote, &mut file).await;
        if result.is_err() {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(path).await {
                log::warn!("Unable to remove partial download {}: {e}", path.display());
            }
        }
        result
    }

    /// Uploads the file at `path` as `remote`.
    pub async fn upload_file(&self, path: impl AsRef<Path>, remote: &str) -> Result<TransferStats, TransferError> {
        let mut file = tokio::fs::File::open(path.as_ref()).await.map_err(TransferError::Stream)?;
        let len = file.metadata().await.map_err(TransferError::Stream)?.len();
        self.session(remote)?.run_upload_sized(&mut file, len).await
    }
}
