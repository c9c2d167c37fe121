/// Datagram transport used by the transmitter and receiver.
///
/// The core only needs "send these bytes to that address" and "give me the
/// next datagram and who sent it"; both are traits so tests and alternative
/// socket layers can stand in for the UDP binding below.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use sacn_protocol::SACN_PORT;

pub trait DatagramSink: Send + Sync + 'static {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> impl Future<Output = io::Result<usize>> + Send;
}

pub trait DatagramSource: Send + Sync + 'static {
    fn recv_from(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

impl DatagramSink for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }
}

impl DatagramSource for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

/// Interface and multicast settings shared by senders and listeners.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Local IPv4 address of the interface to send from / join on.
    /// `UNSPECIFIED` lets the OS pick; interfaces are not looked up by name.
    pub interface: Ipv4Addr,
    pub multicast_ttl: u32,
    /// Deliver our own multicast back to local listeners
    pub multicast_loop: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 1,
            multicast_loop: true,
        }
    }
}

/// Create the outbound socket: ephemeral port, multicast routed through the
/// configured interface.
pub fn create_sender_socket(options: &SocketOptions) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    socket.set_multicast_if_v4(&options.interface)?;
    socket.set_multicast_ttl_v4(options.multicast_ttl)?;
    socket.set_multicast_loop_v4(options.multicast_loop)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&addr.into())?;

    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Create a listener on the sACN port that has joined `group`.
///
/// Several listeners (one per universe plus discovery) share port 5568, so
/// address reuse is always on.
pub fn create_multicast_listener(group: Ipv4Addr, options: &SocketOptions) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    // On macOS/BSD, we also need SO_REUSEPORT for multiple listeners on same port
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    socket.set_reuse_port(true)?;

    // Binding to the group keeps other groups on the same port out of this
    // socket. Windows only accepts a local address here.
    #[cfg(unix)]
    let bind_ip = group;
    #[cfg(not(unix))]
    let bind_ip = Ipv4Addr::UNSPECIFIED;

    let addr = SocketAddrV4::new(bind_ip, SACN_PORT);
    socket.bind(&addr.into())?;

    socket.join_multicast_v4(&group, &options.interface)?;

    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Async sender socket. Must be called from inside a tokio runtime.
pub fn bind_sender(options: &SocketOptions) -> io::Result<UdpSocket> {
    UdpSocket::from_std(create_sender_socket(options)?)
}

/// Async listener socket joined to `group`. Must be called from inside a
/// tokio runtime.
pub fn bind_listener(group: Ipv4Addr, options: &SocketOptions) -> io::Result<UdpSocket> {
    UdpSocket::from_std(create_multicast_listener(group, options)?)
}
