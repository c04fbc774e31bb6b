//! Netlink socket registered with the tokio reactor

use super::frame::{Frames, NLMSG_ERROR, NLMSG_NOOP, NLMSG_OVERRUN};
use super::{KernelEventSource, conntrack, link};
use crate::error::{Result, SyncError};
use crate::event::{DumpKind, KernelEvent, NetlinkGroup};
use async_trait::async_trait;
use netlink_sys::protocols::{NETLINK_NETFILTER, NETLINK_ROUTE};
use netlink_sys::{Socket, SocketAddr};
use std::collections::VecDeque;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, instrument, trace, warn};

/// Receive buffer size requested for the socket, in bytes.
const SOCKET_RECV_BUFFER_SIZE: libc::c_int = 4 * 1024 * 1024;

/// Netlink family of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetlinkProtocol {
    /// NETLINK_ROUTE: link notifications
    Route,
    /// NETLINK_NETFILTER: conntrack notifications
    Netfilter,
}

impl NetlinkProtocol {
    fn id(&self) -> isize {
        match self {
            NetlinkProtocol::Route => NETLINK_ROUTE,
            NetlinkProtocol::Netfilter => NETLINK_NETFILTER,
        }
    }
}

/// Kernel event source backed by a non-blocking netlink socket.
pub struct NetlinkEventSource {
    protocol: NetlinkProtocol,
    socket: AsyncFd<Socket>,
    pending: VecDeque<KernelEvent>,
    sequence: u32,
}

impl NetlinkEventSource {
    /// Open and bind a socket of `protocol`. Groups are joined later with
    /// [`KernelEventSource::register_group`].
    #[instrument]
    pub fn new(protocol: NetlinkProtocol) -> Result<Self> {
        let mut socket = Socket::new(protocol.id())
            .map_err(|e| SyncError::Netlink(format!("Failed to create socket: {}", e)))?;
        socket
            .bind_auto()
            .map_err(|e| SyncError::Netlink(format!("Failed to bind socket: {}", e)))?;
        socket
            .set_non_blocking(true)
            .map_err(|e| SyncError::Netlink(format!("Failed to set non-blocking: {}", e)))?;
        tune_socket(&socket);

        let socket = AsyncFd::new(socket)
            .map_err(|e| SyncError::Netlink(format!("Failed to create AsyncFd: {}", e)))?;

        debug!(?protocol, "Netlink socket ready");
        Ok(Self {
            protocol,
            socket,
            pending: VecDeque::new(),
            sequence: 0,
        })
    }

    fn decode_buffer(&mut self, buf: &[u8]) {
        for frame in Frames::new(buf) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed netlink buffer");
                    return;
                }
            };

            if let Some(sequence) = frame.done_sequence() {
                trace!(sequence, "Dump finished");
                self.pending.push_back(KernelEvent::DumpDone { sequence });
                continue;
            }
            match frame.header.message_type {
                NLMSG_NOOP | NLMSG_OVERRUN => continue,
                NLMSG_ERROR => {
                    if let Some(code) = frame.error_code().filter(|c| *c != 0) {
                        warn!(
                            errno = -code,
                            sequence = frame.header.sequence,
                            "Netlink request failed"
                        );
                    }
                    continue;
                }
                _ => {}
            }

            let decoded = match self.protocol {
                NetlinkProtocol::Route => link::decode(&frame),
                NetlinkProtocol::Netfilter => conntrack::decode(&frame),
            };
            match decoded {
                Ok(Some(event)) => self.pending.push_back(event),
                Ok(None) => trace!(
                    message_type = frame.header.message_type,
                    "Ignoring netlink message"
                ),
                Err(e) => warn!(error = %e, "Dropping malformed netlink message"),
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<()> {
        let kernel = SocketAddr::new(0, 0);
        self.socket
            .get_ref()
            .send_to(buf, &kernel, 0)
            .map_err(|e| SyncError::Netlink(format!("Failed to send request: {}", e)))?;
        Ok(())
    }
}

/// Size the receive buffer for dump bursts. Overruns must still surface as
/// ENOBUFS so the loop can re-dump; a failure here only costs headroom.
fn tune_socket(socket: &Socket) {
    if let Err(e) = socket.set_no_enobufs(false) {
        warn!(error = %e, "Could not clear NETLINK_NO_ENOBUFS");
    }
    match socket.set_rx_buf_sz(SOCKET_RECV_BUFFER_SIZE) {
        Ok(()) => debug!(
            requested = SOCKET_RECV_BUFFER_SIZE,
            effective = socket.get_rx_buf_sz().unwrap_or_default(),
            "Receive buffer sized"
        ),
        Err(e) => warn!(error = %e, "Keeping default receive buffer size"),
    }
}

#[async_trait]
impl KernelEventSource for NetlinkEventSource {
    #[instrument(skip(self))]
    fn register_group(&mut self, group: NetlinkGroup) -> Result<()> {
        self.socket
            .get_mut()
            .add_membership(group.id())
            .map_err(|e| SyncError::Netlink(format!("Failed to join group {:?}: {}", group, e)))?;
        info!(?group, "Subscribed to netlink group");
        Ok(())
    }

    #[instrument(skip(self))]
    fn dump_request(&mut self, kind: DumpKind) -> Result<u32> {
        self.sequence = self.sequence.wrapping_add(1).max(1);
        let request = match kind {
            DumpKind::Links => link::dump_request(self.sequence),
            DumpKind::Conntrack => conntrack::dump_request(self.sequence),
        };
        self.send(&request)?;
        debug!(sequence = self.sequence, "Requested kernel dump");
        Ok(self.sequence)
    }

    async fn next_event(&mut self) -> Result<KernelEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            let mut guard = self
                .socket
                .readable()
                .await
                .map_err(|e| SyncError::Netlink(format!("AsyncFd readable error: {}", e)))?;

            let received = match guard.try_io(|inner| inner.get_ref().recv_from_full()) {
                Ok(received) => received,
                Err(_would_block) => continue,
            };
            drop(guard);

            match received {
                Ok((buf, _addr)) => {
                    trace!(len = buf.len(), "Received netlink buffer");
                    self.decode_buffer(&buf);
                }
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    return Err(SyncError::Overrun);
                }
                Err(e) => {
                    return Err(SyncError::Netlink(format!("Receive error: {}", e)));
                }
            }
        }
    }
}
