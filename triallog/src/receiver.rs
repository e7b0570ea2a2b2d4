//! The UDP ingest task.
//!
//! One task owns the socket: it reads datagrams, validates the envelope,
//! decodes the group payload, and hands decoded packets to a
//! [`PacketSink`]. Every malformed datagram is dropped, counted by reason,
//! and logged; nothing propagates out of the loop once the socket is bound.
//!
//! ## Metrics
//!
//! `bytes_received`: Total datagram bytes read
//! `packets_received`: Datagrams that decoded cleanly
//! `packets_dropped`: Datagrams discarded, with a `reason` label
//!

use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;

use metrics::counter;
use serde::Deserialize;
use tracing::{debug, info};

use triallog_wire::{frame, packet, GroupPacket, MAX_PACKET_BYTES};

use crate::config::RecvAddress;
use crate::signals::Watcher;

/// Consumer of decoded packets, supplied to the receiver at start.
pub trait PacketSink: Send + Sync + 'static {
    /// Accept one decoded packet.
    fn deliver(&self, packet: GroupPacket);
}

fn default_recv_buffer_bytes() -> byte_unit::Byte {
    // Room for ~50 maximum datagrams so bursts survive scheduling gaps.
    byte_unit::Byte::from_bytes(MAX_PACKET_BYTES as u128 * 50)
}

/// Receiver tuning knobs.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Tuning {
    /// Kernel receive buffer size requested for the socket.
    #[serde(default = "default_recv_buffer_bytes")]
    pub recv_buffer_bytes: byte_unit::Byte,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            recv_buffer_bytes: default_recv_buffer_bytes(),
        }
    }
}

/// Errors produced by [`Udp`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Could not bind the receive socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that failed to bind.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Socket option could not be applied.
    #[cfg(target_os = "linux")]
    #[error("socket option error: {0}")]
    Sockopt(#[from] nix::errno::Errno),
}

/// The UDP receiver task.
#[derive(Debug)]
pub struct Udp<S> {
    socket: StdUdpSocket,
    sink: Arc<S>,
    shutdown: Watcher,
}

impl<S> Udp<S>
where
    S: PacketSink,
{
    /// Bind the receive socket and prepare the ingest loop.
    ///
    /// # Errors
    ///
    /// Fails when the address cannot be bound or a required socket option
    /// cannot be applied; both are startup failures.
    pub fn new(
        recv: &RecvAddress,
        tuning: &Tuning,
        sink: Arc<S>,
        shutdown: Watcher,
    ) -> Result<Self, Error> {
        let socket = bind_socket(recv, tuning)?;
        socket.set_nonblocking(true)?;
        info!(addr = %recv, "UDP server listening");
        Ok(Self {
            socket,
            sink,
            shutdown,
        })
    }

    /// The bound address, useful when the port was chosen by the kernel.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the receiver until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error only when the socket cannot be registered with the
    /// runtime; everything after that is recovered in the loop.
    pub async fn spin(self) -> Result<(), Error> {
        let Self {
            socket,
            sink,
            mut shutdown,
        } = self;
        let socket = tokio::net::UdpSocket::from_std(socket)?;

        let bytes_received = counter!("bytes_received");
        let packets_received = counter!("packets_received");

        let mut buf = vec![0u8; MAX_PACKET_BYTES];
        loop {
            tokio::select! {
                () = shutdown.recv() => {
                    info!("shutdown signal received");
                    // Socket drops here; nothing else is owned.
                    return Ok(());
                }
                incoming = socket.recv_from(&mut buf) => {
                    let n = match incoming {
                        Ok((n, _peer)) => n,
                        Err(err) => {
                            debug!(%err, "transient recv error");
                            counter!("packets_dropped", "reason" => "recv").increment(1);
                            continue;
                        }
                    };
                    bytes_received.increment(n as u64);
                    match frame::unframe(&buf[..n]) {
                        Ok(payload) => match packet::decode(payload) {
                            Ok(pkt) => {
                                packets_received.increment(1);
                                sink.deliver(pkt);
                            }
                            Err(err) => {
                                debug!(%err, len = n, "dropping undecodable payload");
                                counter!("packets_dropped", "reason" => "parse").increment(1);
                            }
                        },
                        Err(err) => {
                            debug!(%err, len = n, "dropping bad envelope");
                            counter!("packets_dropped", "reason" => envelope_reason(&err))
                                .increment(1);
                        }
                    }
                }
            }
        }
    }
}

fn envelope_reason(err: &triallog_wire::Error) -> &'static str {
    match err {
        triallog_wire::Error::ChecksumMismatch { .. } => "checksum",
        _ => "framing",
    }
}

#[cfg(target_os = "linux")]
fn bind_socket(recv: &RecvAddress, tuning: &Tuning) -> Result<StdUdpSocket, Error> {
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrStorage};
    use tracing::warn;

    let addr = recv.socket_addr();
    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let fd = socket::socket(family, SockType::Datagram, SockFlag::empty(), None)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;

    let rcvbuf = usize::try_from(tuning.recv_buffer_bytes.get_bytes()).unwrap_or(usize::MAX);
    if let Err(err) = socket::setsockopt(&fd, sockopt::RcvBuf, &rcvbuf) {
        // The kernel may clamp or refuse large buffers; not fatal.
        warn!(%err, requested = rcvbuf, "could not size the receive buffer");
    }

    if let Some(interface) = &recv.interface {
        let device = std::ffi::OsString::from(interface.clone());
        socket::setsockopt(&fd, sockopt::BindToDevice, &device)?;
        info!(%interface, "socket bound to device; foreign-interface datagrams are filtered");
    }

    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr)).map_err(|errno| Error::Bind {
        addr,
        source: std::io::Error::from(errno),
    })?;

    Ok(StdUdpSocket::from(fd))
}

#[cfg(not(target_os = "linux"))]
fn bind_socket(recv: &RecvAddress, _tuning: &Tuning) -> Result<StdUdpSocket, Error> {
    let addr = recv.socket_addr();
    if recv.interface.is_some() {
        tracing::warn!("interface binding is unsupported on this platform; accepting all interfaces");
    }
    StdUdpSocket::bind(addr).map_err(|source| Error::Bind { addr, source })
}
