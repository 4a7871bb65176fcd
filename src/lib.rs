// A TFTP client (RFC 1350) with option negotiation for block size, transfer size and timeout
// (RFC 2347, 2348, 2349).
//
// The client talks to one server per transfer, in lock-step: every packet it sends is answered by
// exactly one packet before the next goes out. Lost packets are recovered by retransmitting after
// a timeout, and a transfer that sees no progress after a bounded number of attempts fails.

pub mod channel;
mod context;
mod download;
mod machine;
pub mod resolver;
pub mod session;
pub mod tftp;
mod upload;

pub use context::TransferStats;
pub use session::{Session, SessionConfig, TftpClient, TransferError};
