// Write-request side of the protocol: the client asks to store a file, then sends DATA blocks one
// at a time, each acknowledged before the next goes out. A block shorter than the block size (an
// empty one if the input is an exact multiple) is the last.
//
// WRQ --> InitialReceive --ACK(0) or OACK--> SendData(n) <--> Receive(n) --ACK of short block--> done
//
// Sending a DATA packet is what acknowledges the server's ACK for the previous one, so a lost ACK
// is recovered by resending the block still held in the context.

use crate::channel::TransferChannel;
use crate::context::TransferContext;
use crate::machine::{retry_or_give_up, Flow, State, Wait};
use crate::session::TransferError;
use crate::tftp::Packet;
use tokio::io::{self, AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadState {
    SendWriteRequest { attempt: u32 },
    InitialReceive { attempt: u32 },

    /// Send `block`, reading it from the stream first unless a retry already holds it.
    SendData { block: u16, attempt: u32 },

    /// Wait for the server to acknowledge `last_block`.
    Receive { last_block: u16, attempt: u32 },
}

impl<'a, C, R> State<TransferContext<'a, C, R>> for UploadState
where
    C: TransferChannel,
    R: AsyncRead + Unpin,
{
    async fn handle(self, ctx: &mut TransferContext<'a, C, R>) -> Result<Flow<Self>, TransferError> {
        match self {
            UploadState::SendWriteRequest { attempt } => {
                let request = Packet::WriteReq {
                    filename: ctx.filename.clone(),
                    mode: ctx.mode,
                    options: ctx.options.clone(),
                };
                ctx.send(&request, ctx.request_endpoint()).await?;
                Ok(Flow::Continue(UploadState::InitialReceive { attempt }))
            }

            UploadState::InitialReceive { attempt } => {
                let wait = ctx
                    .wait_for(|packet| match packet {
                        Packet::Ack { block: 0 } => Some(None),
                        Packet::OptionAck { options } => Some(Some(options)),
                        _ => None,
                    })
                    .await?;

                match wait {
                    Wait::Reply(granted, src) => {
                        ctx.fix_transfer_id(src);
                        if let Some(options) = granted {
                            ctx.adopt_options(&options).await?;
                        }
                        Ok(Flow::Continue(UploadState::SendData { block: 1, attempt: 1 }))
                    }
                    Wait::Error { code, message } => Ok(Flow::ErrorReceived { code, message }),
                    Wait::Elapsed => Ok(retry_or_give_up(attempt, ctx.max_attempts, |attempt| {
                        UploadState::SendWriteRequest { attempt }
                    })),
                }
            }

            UploadState::SendData { block, attempt } => {
                let data = match ctx.pending_block.take() {
                    Some(data) => data,
                    None => read_block(ctx.stream, ctx.block_size).await.map_err(TransferError::Stream)?,
                };

                let packet = Packet::Data { block, data };
                ctx.send(&packet, ctx.remote()).await?;
                if let Packet::Data { data, .. } = packet {
                    ctx.pending_block = Some(data);
                }
                Ok(Flow::Continue(UploadState::Receive { last_block: block, attempt }))
            }

            UploadState::Receive { last_block, attempt } => {
                let wait = ctx
                    .wait_for(|packet| match packet {
                        Packet::Ack { block } if block == last_block => Some(()),
                        _ => None,
                    })
                    .await?;

                match wait {
                    Wait::Reply((), _) => {
                        let sent = ctx.pending_block.take().unwrap_or_default();
                        ctx.stats.bytes += sent.len() as u64;
                        ctx.stats.blocks += 1;

                        if sent.len() < ctx.block_size {
                            log::debug!("Final block {last_block} acknowledged");
                            Ok(Flow::End)
                        } else {
                            Ok(Flow::Continue(UploadState::SendData {
                                block: last_block.wrapping_add(1),
                                attempt: 1,
                            }))
                        }
                    }
                    Wait::Error { code, message } => Ok(Flow::ErrorReceived { code, message }),
                    Wait::Elapsed => Ok(retry_or_give_up(attempt, ctx.max_attempts, |attempt| {
                        UploadState::SendData { block: last_block, attempt }
                    })),
                }
            }
        }
    }
}

/// Reads up to `block_size` bytes, coming back short only at the end of the stream.
async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, block_size: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; block_size];
    let mut cursor = 0;

    // A single read may return fewer bytes than asked for without the stream being exhausted, so
    // keep reading into the unfilled part of the buffer until it is full or a read returns 0.
    loop {
        let s = reader.read(&mut buf[cursor..]).await?;
        cursor += s;
        if cursor == buf.len() || s == 0 {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_block_fills_across_short_reads() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&[1; 300])
            .read(&[2; 300])
            .build();

        let first = read_block(&mut reader, 512).await.unwrap();
        assert_eq!(first.len(), 512);
        assert_eq!(&first[..300], &[1; 300][..]);
        assert_eq!(&first[300..], &[2; 212][..]);

        let second = read_block(&mut reader, 512).await.unwrap();
        assert_eq!(second, vec![2; 88]);

        let last = read_block(&mut reader, 512).await.unwrap();
        assert!(last.is_empty());
    }

    #[tokio::test]
    async fn test_read_block_reports_stream_errors() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&[1; 10])
            .read_error(io::Error::new(io::ErrorKind::Other, "disk on fire"))
            .build();

        let err = read_block(&mut reader, 512).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }
}
