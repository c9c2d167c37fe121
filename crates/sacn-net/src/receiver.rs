/// sACN receiver: one socket, one read loop, decoded packets handed to a
/// caller-supplied handler.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use sacn_protocol::packets::Packet;
use sacn_protocol::{is_valid_universe, universe_group, DISCOVERY_GROUP};

use crate::error::{NetError, Result};
use crate::transport::{bind_listener, DatagramSource, SocketOptions};

/// One Ethernet MTU. A full discovery page is 1144 bytes.
pub const RECV_BUFFER_SIZE: usize = 1500;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub struct Receiver<S: DatagramSource> {
    source: S,
    read_timeout: Duration,
}

impl Receiver<UdpSocket> {
    /// Listen for data packets on one universe's multicast group.
    pub fn universe(universe: u16, options: &SocketOptions) -> Result<Self> {
        if !is_valid_universe(universe) {
            return Err(NetError::InvalidUniverse(universe));
        }
        Self::group(universe_group(universe), options)
    }

    /// Listen on the universe-discovery group.
    pub fn discovery(options: &SocketOptions) -> Result<Self> {
        Self::group(DISCOVERY_GROUP, options)
    }

    fn group(group: Ipv4Addr, options: &SocketOptions) -> Result<Self> {
        let socket = bind_listener(group, options)?;
        debug!(%group, interface = %options.interface, "Joined sACN multicast group");
        Ok(Self::new(socket))
    }
}

impl<S: DatagramSource> Receiver<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Spawn the read loop. `handler` runs on the loop's task for every
    /// datagram that decodes; everything else is dropped.
    pub fn start<H>(self, handler: H) -> ReceiverHandle
    where
        H: FnMut(SocketAddr, Packet) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(read_loop(self.source, self.read_timeout, handler, cancel.clone()));
        ReceiverHandle { cancel, task: Some(task) }
    }
}

async fn read_loop<S, H>(source: S, read_timeout: Duration, mut handler: H, cancel: CancellationToken)
where
    S: DatagramSource,
    H: FnMut(SocketAddr, Packet) + Send + 'static,
{
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(read_timeout, source.recv_from(&mut buf)) => r,
        };

        match received {
            // Read timeout: go round again so a stop request is noticed
            Err(_) => continue,
            Ok(Ok((len, from))) => match Packet::deserialize(&buf[..len]) {
                Ok(packet) => handler(from, packet),
                Err(e) => trace!(%from, len, "Discarding datagram: {}", e),
            },
            Ok(Err(e)) => {
                if cancel.is_cancelled() {
                    break;
                }
                warn!("sACN receive error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }

    debug!("sACN receiver stopped");
}

/// Control handle for a running receiver. Dropping it stops the read loop.
pub struct ReceiverHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReceiverHandle {
    /// Signal the read loop to exit. Idempotent. The socket is released
    /// when the loop returns.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the read loop to exit. Does not stop it by itself.
    pub async fn join(mut self) {
        let Some(task) = self.task.take() else { return };
        if let Err(e) = task.await {
            warn!("sACN receiver task failed: {}", e);
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
