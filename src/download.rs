// Read-request side of the protocol: the client asks for a file, then acknowledges DATA blocks
// one at a time until a short block marks the end.
//
// RRQ --> InitialReceive --DATA(1)--> SendAck(n) <--> Receive(n) --short DATA--> Dally --timeout--> done
//              |
//              +--OACK--> SendAck(0) ...
//
// Whoever sends the final ACK should stick around for a while, in case that ACK is lost and the
// server retransmits the last block. Dally does that: a duplicate final block gets the ACK again,
// and silence means the server is satisfied.

use crate::channel::TransferChannel;
use crate::context::TransferContext;
use crate::machine::{retry_or_give_up, Flow, State, Wait};
use crate::session::TransferError;
use crate::tftp::{Options, Packet};
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DownloadState {
    /// Send the read request, with whatever options were asked for.
    SendReadRequest { attempt: u32 },

    /// Wait for the server's first answer from any of its ports.
    InitialReceive { attempt: u32 },

    /// Acknowledge `block` (0 acknowledges an OACK).
    SendAck { block: u16, attempt: u32 },

    /// Wait for the block after `last_block`.
    Receive { last_block: u16, attempt: u32 },

    /// The final block was written; acknowledge it and linger for duplicates.
    Dally { block: u16 },
}

/// What the server may open a download with.
enum FirstReply {
    Options(Options),
    Block(Vec<u8>),
}

impl<'a, C, W> State<TransferContext<'a, C, W>> for DownloadState
where
    C: TransferChannel,
    W: AsyncWrite + Unpin,
{
    async fn handle(self, ctx: &mut TransferContext<'a, C, W>) -> Result<Flow<Self>, TransferError> {
        match self {
            DownloadState::SendReadRequest { attempt } => {
                let request = Packet::ReadReq {
                    filename: ctx.filename.clone(),
                    mode: ctx.mode,
                    options: ctx.options.clone(),
                };
                ctx.send(&request, ctx.request_endpoint()).await?;
                Ok(Flow::Continue(DownloadState::InitialReceive { attempt }))
            }

            DownloadState::InitialReceive { attempt } => {
                let block_size = ctx.block_size;
                let wait = ctx
                    .wait_for(|packet| match packet {
                        Packet::OptionAck { options } => Some(FirstReply::Options(options)),
                        Packet::Data { block: 1, data } if data.len() <= block_size => Some(FirstReply::Block(data)),
                        _ => None,
                    })
                    .await?;

                match wait {
                    Wait::Reply(reply, src) => {
                        ctx.fix_transfer_id(src);
                        match reply {
                            // RFC 2347: an OACK to a read request is acknowledged with block 0.
                            FirstReply::Options(options) => {
                                ctx.adopt_options(&options).await?;
                                Ok(Flow::Continue(DownloadState::SendAck { block: 0, attempt: 1 }))
                            }
                            FirstReply::Block(data) => store_block(ctx, 1, data).await,
                        }
                    }
                    Wait::Error { code, message } => Ok(Flow::ErrorReceived { code, message }),
                    Wait::Elapsed => Ok(retry_or_give_up(attempt, ctx.max_attempts, |attempt| {
                        DownloadState::SendReadRequest { attempt }
                    })),
                }
            }

            DownloadState::SendAck { block, attempt } => {
                ctx.send(&Packet::Ack { block }, ctx.remote()).await?;
                Ok(Flow::Continue(DownloadState::Receive { last_block: block, attempt }))
            }

            DownloadState::Receive { last_block, attempt } => {
                let expected = last_block.wrapping_add(1);
                let block_size = ctx.block_size;
                let wait = ctx
                    .wait_for(|packet| match packet {
                        Packet::Data { block, data } if block == expected && data.len() <= block_size => Some(data),
                        _ => None,
                    })
                    .await?;

                match wait {
                    Wait::Reply(data, _) => store_block(ctx, expected, data).await,
                    Wait::Error { code, message } => Ok(Flow::ErrorReceived { code, message }),
                    // Re-sending the last ACK asks the server to retransmit the block after it.
                    Wait::Elapsed => Ok(retry_or_give_up(attempt, ctx.max_attempts, |attempt| {
                        DownloadState::SendAck { block: last_block, attempt }
                    })),
                }
            }

            DownloadState::Dally { block } => {
                ctx.send(&Packet::Ack { block }, ctx.remote()).await?;

                let wait = ctx
                    .wait_for(|packet| match packet {
                        Packet::Data { block: duplicate, .. } if duplicate == block => Some(()),
                        _ => None,
                    })
                    .await?;

                match wait {
                    Wait::Reply((), _) => {
                        log::debug!("Server repeated final block {block}, acknowledging it again");
                        Ok(Flow::Continue(DownloadState::Dally { block }))
                    }
                    Wait::Error { code, message } => {
                        log::warn!("Server sent {code}: '{message}' after the final block; transfer is complete");
                        Ok(Flow::End)
                    }
                    Wait::Elapsed => Ok(Flow::End),
                }
            }
        }
    }
}

/// Writes a freshly received block and picks what follows: another ACK/receive round for a full
/// block, the dally phase for a short one.
async fn store_block<C, W>(
    ctx: &mut TransferContext<'_, C, W>,
    block: u16,
    data: Vec<u8>,
) -> Result<Flow<DownloadState>, TransferError>
where
    W: AsyncWrite + Unpin,
{
    ctx.stream.write_all(&data).await.map_err(TransferError::Stream)?;
    ctx.stats.bytes += data.len() as u64;
    ctx.stats.blocks += 1;

    if data.len() == ctx.block_size {
        Ok(Flow::Continue(DownloadState::SendAck { block, attempt: 1 }))
    } else {
        log::debug!("Block {block} holds {} bytes, it is the last one", data.len());
        Ok(Flow::Continue(DownloadState::Dally { block }))
    }
}
