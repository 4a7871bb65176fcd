// Datagram transport used by a transfer.
//
// A channel moves opaque byte buffers and knows nothing about TFTP beyond encoding a packet before
// handing it to the socket. Filtering by source is the one policy it owns: until the server's
// transfer ID is known the client accepts replies from any port on the server's address, and
// afterwards only from the exact (address, port) pair. Everything else is dropped on the floor,
// which keeps traffic from unrelated peers that share the local socket from reaching the state
// machine.

use crate::tftp::Packet;
use async_io::Async;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Largest datagram a channel will receive. Fits a DATA packet at the largest block size.
pub const MAX_DATAGRAM: usize = 65_536;

/// Which sources a receive accepts datagrams from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Any port on this address. Used for the first reply, before the transfer ID is known.
    Address(Ipv4Addr),

    /// Exactly this address and port.
    Endpoint(SocketAddr),
}

impl Source {
    pub fn matches(&self, src: &SocketAddr) -> bool {
        match self {
            Source::Address(addr) => src.ip() == IpAddr::V4(*addr),
            Source::Endpoint(endpoint) => src == endpoint,
        }
    }
}

/// A datagram as it came off the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub src: SocketAddr,
}

/// Send/receive primitives a transfer runs over.
///
/// Implementors provide `send_to` and `recv`; the filtered receives are built on top of them.
/// Receives must be cancel-safe: dropping an in-flight `recv` must not lose a datagram that was
/// not yet returned.
#[allow(async_fn_in_trait)]
pub trait TransferChannel {
    /// Sends one datagram. Failures are transport errors and are not retried here.
    async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<()>;

    /// Waits for the next datagram from anyone.
    async fn recv(&self) -> io::Result<Datagram>;

    async fn send_packet(&self, packet: &Packet, dst: SocketAddr) -> io::Result<()> {
        self.send_to(&packet.to_bytes(), dst).await
    }

    /// Waits for the next datagram whose source satisfies `accept`, silently discarding the rest.
    async fn receive_matching<P>(&self, accept: P) -> io::Result<Datagram>
    where
        P: Fn(&SocketAddr) -> bool,
    {
        loop {
            let datagram = self.recv().await?;
            if accept(&datagram.src) {
                return Ok(datagram);
            }
            log::debug!("Discarding {} byte datagram from foreign source {}", datagram.bytes.len(), datagram.src);
        }
    }

    async fn receive_from_address(&self, addr: Ipv4Addr) -> io::Result<Datagram> {
        let source = Source::Address(addr);
        self.receive_matching(|src| source.matches(src)).await
    }

    async fn receive_from_endpoint(&self, endpoint: SocketAddr) -> io::Result<Datagram> {
        let source = Source::Endpoint(endpoint);
        self.receive_matching(|src| source.matches(src)).await
    }

    async fn receive_from(&self, source: Source) -> io::Result<Datagram> {
        match source {
            Source::Address(addr) => self.receive_from_address(addr).await,
            Source::Endpoint(endpoint) => self.receive_from_endpoint(endpoint).await,
        }
    }
}

/// Lets a caller lend a channel to a transfer and keep using it afterwards.
impl<T: TransferChannel + ?Sized> TransferChannel for &T {
    async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<()> {
        (**self).send_to(buf, dst).await
    }

    async fn recv(&self) -> io::Result<Datagram> {
        (**self).recv().await
    }
}

///////////////////////////////////////////////////////////////
/// Channel backed by a UDP socket.
pub struct UdpChannel {
    sock: Async<UdpSocket>,
}

impl UdpChannel {
    pub fn bind(addr: SocketAddr) -> io::Result<UdpChannel> {
        Ok(UdpChannel {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    /// Binds to an OS-chosen port on all IPv4 interfaces.
    pub fn bind_any() -> io::Result<UdpChannel> {
        UdpChannel::bind((Ipv4Addr::UNSPECIFIED, 0).into())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }
}

impl TransferChannel for UdpChannel {
    async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<()> {
        let sent = self.sock.send_to(buf, dst).await?;
        if sent != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("Sent {sent} of {} bytes to {dst}", buf.len()),
            ));
        }
        Ok(())
    }

    async fn recv(&self) -> io::Result<Datagram> {
        let mut buf = vec![0; MAX_DATAGRAM];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;
        buf.truncate(total_written);
        Ok(Datagram { bytes: buf, src })
    }
}

/// An in-memory channel that plays back a fixed conversation and checks what the client sends.
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug)]
    pub(crate) enum Step {
        /// The client must send exactly this packet to exactly this endpoint.
        Send(Packet, SocketAddr),

        /// The next receive yields these bytes from this source.
        Reply(Vec<u8>, SocketAddr),

        /// The next receive never completes, so the caller's deadline fires.
        Silence,
    }

    #[derive(Debug, Default)]
    pub(crate) struct ScriptedChannel {
        steps: Mutex<VecDeque<Step>>,
        sent: Mutex<Vec<(Packet, SocketAddr)>>,
    }

    impl ScriptedChannel {
        pub(crate) fn new(steps: Vec<Step>) -> ScriptedChannel {
            ScriptedChannel {
                steps: Mutex::new(steps.into()),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn sent(&self) -> Vec<(Packet, SocketAddr)> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn remaining(&self) -> usize {
            self.steps.lock().unwrap().len()
        }
    }

    pub(crate) fn send(packet: Packet, dst: SocketAddr) -> Step {
        Step::Send(packet, dst)
    }

    pub(crate) fn reply(packet: Packet, src: SocketAddr) -> Step {
        Step::Reply(packet.to_bytes(), src)
    }

    impl TransferChannel for ScriptedChannel {
        async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<()> {
            let packet = Packet::parse_from_buf(buf).expect("client sent a malformed packet");
            self.sent.lock().unwrap().push((packet.clone(), dst));

            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Send(expected, to)) => {
                    assert_eq!(packet, expected);
                    assert_eq!(dst, to);
                }
                other => panic!("unexpected send of {:?} to {}, script had {:?}", packet, dst, other),
            }
            Ok(())
        }

        async fn recv(&self) -> io::Result<Datagram> {
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Reply(bytes, src)) => Ok(Datagram { bytes, src }),
                Some(Step::Silence) | None => std::future::pending().await,
                Some(Step::Send(packet, to)) => {
                    panic!("client is receiving, but script expects it to send {:?} to {}", packet, to)
                }
            }
        }
    }
}
