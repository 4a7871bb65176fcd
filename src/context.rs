use crate::channel::{Source, TransferChannel};
use crate::machine::{within, Deadline, Wait};
use crate::session::{SessionConfig, TransferError};
use crate::tftp::{self, ErrorCode, Options, Packet, TransferMode};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Summary of a finished transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Payload bytes written to (download) or acknowledged from (upload) the stream.
    pub bytes: u64,

    /// DATA blocks that advanced the transfer. Retransmissions are not counted.
    pub blocks: u64,

    /// Block size the transfer ended up using.
    pub block_size: usize,

    /// File size the server confirmed through `tsize`, if it did.
    pub transfer_size: Option<u64>,

    /// Retransmission timeout the server confirmed through `timeout`, if it did.
    pub server_timeout: Option<Duration>,
}

/// Everything one transfer needs, threaded through each state by unique reference.
///
/// The channel and the stream belong to the caller; the context only borrows them and never
/// closes either one.
pub(crate) struct TransferContext<'a, C, S> {
    pub(crate) channel: &'a C,
    pub(crate) stream: &'a mut S,
    pub(crate) filename: String,
    pub(crate) mode: TransferMode,

    /// Options placed on the request.
    pub(crate) options: Options,
    pub(crate) host: Ipv4Addr,

    /// Port the request goes to.
    pub(crate) port: u16,

    /// The server's source port for this transfer. Set once, by the first accepted reply.
    pub(crate) transfer_id: Option<u16>,
    pub(crate) block_size: usize,
    pub(crate) timeout: Duration,
    pub(crate) max_attempts: u32,

    /// Upload only: the block in flight, kept until it is acknowledged so retries resend it as is.
    pub(crate) pending_block: Option<Vec<u8>>,
    pub(crate) stats: TransferStats,
}

impl<'a, C: TransferChannel, S> TransferContext<'a, C, S> {
    pub(crate) fn new(
        channel: &'a C,
        stream: &'a mut S,
        host: Ipv4Addr,
        filename: &str,
        config: &SessionConfig,
        options: Options,
    ) -> TransferContext<'a, C, S> {
        TransferContext {
            channel,
            stream,
            filename: filename.to_string(),
            mode: config.mode,
            options,
            host,
            port: config.port,
            transfer_id: None,
            block_size: tftp::DEFAULT_BLOCK_SIZE,
            timeout: config.timeout,
            max_attempts: config.max_attempts,
            pending_block: None,
            stats: TransferStats::default(),
        }
    }

    /// Where requests go.
    pub(crate) fn request_endpoint(&self) -> SocketAddr {
        (self.host, self.port).into()
    }

    /// Where everything after the request goes.
    pub(crate) fn remote(&self) -> SocketAddr {
        (self.host, self.transfer_id.unwrap_or(self.port)).into()
    }

    /// Which sources replies are accepted from at this point of the transfer.
    pub(crate) fn reply_source(&self) -> Source {
        match self.transfer_id {
            Some(_) => Source::Endpoint(self.remote()),
            None => Source::Address(self.host),
        }
    }

    pub(crate) fn fix_transfer_id(&mut self, src: SocketAddr) {
        if self.transfer_id.is_none() {
            log::debug!("Server picked transfer ID {}", src.port());
            self.transfer_id = Some(src.port());
        }
    }

    pub(crate) async fn send(&self, packet: &Packet, dst: SocketAddr) -> Result<(), TransferError> {
        self.channel.send_packet(packet, dst).await.map_err(TransferError::Transport)
    }

    /// Waits up to the context's timeout for a reply that `accept` maps to a value.
    ///
    /// Malformed datagrams, datagrams from other sources and packets `accept` turns down are
    /// dropped and the wait continues. ERROR packets from the right source always end the wait.
    pub(crate) async fn wait_for<T, F>(&self, accept: F) -> Result<Wait<T>, TransferError>
    where
        F: Fn(Packet) -> Option<T>,
    {
        match within(self.timeout, self.next_reply(accept)).await {
            Deadline::Completed(received) => received,
            Deadline::Elapsed => Ok(Wait::Elapsed),
        }
    }

    async fn next_reply<T, F>(&self, accept: F) -> Result<Wait<T>, TransferError>
    where
        F: Fn(Packet) -> Option<T>,
    {
        let source = self.reply_source();
        loop {
            let datagram = self.channel.receive_from(source).await.map_err(TransferError::Transport)?;
            let packet = match Packet::parse_from_buf(&datagram.bytes) {
                Ok(packet) => packet,
                Err(e) => {
                    log::debug!("Ignoring datagram from {}: {}", datagram.src, e);
                    continue;
                }
            };

            if let Packet::Error { code, message } = packet {
                return Ok(Wait::Error { code, message });
            }

            let op_code = packet.op_code();
            match accept(packet) {
                Some(reply) => return Ok(Wait::Reply(reply, datagram.src)),
                None => log::debug!("Discarding unexpected {:?} packet from {}", op_code, datagram.src),
            }
        }
    }

    /// Takes on the options a server listed in its OACK.
    ///
    /// Only options the client asked for are adopted. A value the client cannot live with makes
    /// the whole transfer fail, after telling the server why.
    pub(crate) async fn adopt_options(&mut self, granted: &Options) -> Result<(), TransferError> {
        if let Err(reason) = self.apply_options(granted) {
            // Courtesy notice, not retransmitted; the transfer is over either way.
            if let Err(e) = self.send(&rejection_notice(&reason), self.remote()).await {
                log::warn!("Unable to tell the server about rejected options: {e}");
            }
            return Err(TransferError::Negotiation(reason));
        }
        Ok(())
    }

    fn apply_options(&mut self, granted: &Options) -> Result<(), String> {
        for (name, value) in granted.iter() {
            if !self.options.contains(name) {
                log::warn!("Server acknowledged option '{name}' that was never requested, ignoring it");
                continue;
            }

            match name.as_str() {
                tftp::OPT_BLKSIZE => {
                    let requested = self.options.get(tftp::OPT_BLKSIZE).and_then(|v| v.parse::<u16>().ok());
                    self.block_size = parse_block_size(value, requested)?;
                    log::info!("Server granted block size {}", self.block_size);
                }
                tftp::OPT_TSIZE => {
                    let size = value
                        .parse::<u64>()
                        .map_err(|_| format!("Invalid tsize value '{value}'"))?;
                    self.stats.transfer_size = Some(size);
                }
                tftp::OPT_TIMEOUT => {
                    let secs = value
                        .parse::<u8>()
                        .ok()
                        .filter(|secs| *secs >= 1)
                        .ok_or_else(|| format!("Invalid timeout value '{value}'"))?;
                    self.stats.server_timeout = Some(Duration::from_secs(secs.into()));
                }
                _ => log::warn!("Ignoring unsupported option '{name}'"),
            }
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> TransferStats {
        TransferStats { block_size: self.block_size, ..self.stats }
    }
}

/// ERROR packet telling the server why its options were refused.
fn rejection_notice(reason: &str) -> Packet {
    Packet::Error { code: ErrorCode::Undefined, message: reason.replace('\0', " ") }
}

fn parse_block_size(value: &str, requested: Option<u16>) -> Result<usize, String> {
    let size = value
        .parse::<u16>()
        .ok()
        .filter(|size| (tftp::MIN_BLOCK_SIZE..=tftp::MAX_BLOCK_SIZE).contains(size))
        .ok_or_else(|| format!("Invalid blksize value '{value}'"))?;

    match requested {
        Some(requested) if size > requested => {
            Err(format!("Server granted blksize {size}, larger than the requested {requested}"))
        }
        _ => Ok(size.into()),
    }
}
