// Transition-based execution of a transfer.
//
// A transfer is a sequence of states. Each state looks at the context, does at most one send or
// one wait, and names the state that follows. The runner keeps handing the context to whatever
// state came back until the transfer ends or fails:
//
// 1. Send states encode one packet, hand it to the channel and move on to a waiting state.
// 2. Waiting states race a filtered receive against the context's timeout. If a reply wins, the
//    state acts on it (writes the block, adopts options, ...) after the race is over, so a losing
//    receive never touches the context. If the deadline wins, the state's own timeout rule picks
//    between retrying and giving up.
// 3. Terminal outcomes are not states: `Flow` carries them back to the runner, which turns an
//    error packet or an exhausted retry budget into the one error the caller sees.

use crate::session::TransferError;
use crate::tftp::ErrorCode;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

/// What the runner does after a state has been handled.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow<S> {
    /// Hand the context to this state next.
    Continue(S),

    /// The server sent an ERROR packet; the transfer fails with its code and message.
    ErrorReceived { code: ErrorCode, message: String },

    /// No valid reply arrived within the allowed number of attempts.
    TimedOut { attempts: u32 },

    /// The transfer completed.
    End,
}

/// One step of a transfer protocol.
pub(crate) trait State<Ctx>: Sized + fmt::Debug {
    async fn handle(self, ctx: &mut Ctx) -> Result<Flow<Self>, TransferError>;
}

/// Drives `initial` and its successors over `ctx` until the transfer ends.
pub(crate) async fn run<S, Ctx>(initial: S, ctx: &mut Ctx) -> Result<(), TransferError>
where
    S: State<Ctx>,
{
    let mut flow = Flow::Continue(initial);
    loop {
        flow = match flow {
            Flow::Continue(state) => {
                log::trace!("Entering {:?}", state);
                state.handle(ctx).await?
            }
            Flow::ErrorReceived { code, message } => {
                log::warn!("Server aborted the transfer: {code}: {message}");
                return Err(TransferError::Remote { code, message });
            }
            Flow::TimedOut { attempts } => {
                log::warn!("Giving up after {attempts} attempts without a reply");
                return Err(TransferError::Timeout { attempts });
            }
            Flow::End => return Ok(()),
        };
    }
}

/// Outcome of racing an action against a deadline.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Deadline<T> {
    Completed(T),
    Elapsed,
}

/// Runs `action` until it completes or `limit` passes, whichever is first. The loser is dropped.
pub(crate) async fn within<F: Future>(limit: Duration, action: F) -> Deadline<F::Output> {
    match tokio::time::timeout(limit, action).await {
        Ok(output) => Deadline::Completed(output),
        Err(_) => Deadline::Elapsed,
    }
}

/// Result of a waiting state's receive.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Wait<T> {
    /// A packet the state accepted, and where it came from.
    Reply(T, SocketAddr),

    /// The server sent an ERROR packet.
    Error { code: ErrorCode, message: String },

    /// Nothing acceptable arrived before the deadline.
    Elapsed,
}

/// Timeout rule shared by every request/reply pair: retry with the next attempt number until
/// `max_attempts` have been made, then give up.
pub(crate) fn retry_or_give_up<S>(attempt: u32, max_attempts: u32, retry: impl FnOnce(u32) -> S) -> Flow<S> {
    if attempt >= max_attempts {
        Flow::TimedOut { attempts: attempt }
    } else {
        log::info!("Timed out on attempt {attempt} of {max_attempts}, trying again");
        Flow::Continue(retry(attempt + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum Countdown {
        Tick(u32),
        Fail,
    }

    impl State<Vec<u32>> for Countdown {
        async fn handle(self, seen: &mut Vec<u32>) -> Result<Flow<Self>, TransferError> {
            match self {
                Countdown::Tick(0) => Ok(Flow::End),
                Countdown::Tick(n) => {
                    seen.push(n);
                    Ok(Flow::Continue(Countdown::Tick(n - 1)))
                }
                Countdown::Fail => Ok(Flow::ErrorReceived {
                    code: ErrorCode::AccessViolation,
                    message: "denied".to_string(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_runner_stops_at_end() {
        let mut seen = Vec::new();
        assert!(run(Countdown::Tick(3), &mut seen).await.is_ok());
        assert_eq!(seen, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_runner_surfaces_error_packet() {
        let mut seen = Vec::new();
        match run(Countdown::Fail, &mut seen).await {
            Err(TransferError::Remote { code, message }) => {
                assert_eq!(code, ErrorCode::AccessViolation);
                assert_eq!(message, "denied");
            }
            other => panic!("expected a remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_or_give_up() {
        assert_eq!(retry_or_give_up(1, 3, |attempt| attempt), Flow::Continue(2));
        assert_eq!(retry_or_give_up(2, 3, |attempt| attempt), Flow::Continue(3));
        assert_eq!(retry_or_give_up(3, 3, |attempt| attempt), Flow::TimedOut { attempts: 3 });
        assert_eq!(retry_or_give_up(1, 1, |attempt| attempt), Flow::TimedOut { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_deadline() {
        let fast = within(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(fast, Deadline::Completed(7));

        let slow = within(Duration::from_secs(1), std::future::pending::<()>()).await;
        assert_eq!(slow, Deadline::Elapsed);
    }
}
