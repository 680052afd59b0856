//! UDP sockets for the NatNet command and data channels.

use socket2::{Domain, Protocol, SockRef, Type};
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use crate::config::ClientConfig;

/// Which side of the protocol a socket serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Command,
    Data,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Command => write!(f, "command"),
            ChannelKind::Data => write!(f, "data"),
        }
    }
}

// this will be common for all our sockets
pub fn new_socket() -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    Ok(socket)
}

/// On Windows, unlike all Unix variants, it is improper to bind to the multicast address
///
/// see https://msdn.microsoft.com/en-us/library/windows/desktop/ms737550(v=vs.85).aspx
#[cfg(windows)]
fn bind_to_multicast(
    socket: &socket2::Socket,
    addr: &SocketAddrV4,
    nic_addr: &Ipv4Addr,
) -> io::Result<()> {
    socket.join_multicast_v4(addr.ip(), nic_addr)?;

    let socketaddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
    socket.bind(&socket2::SockAddr::from(socketaddr))?;
    log::trace!("Binding multicast socket to {}", socketaddr);

    Ok(())
}

/// On unixes we bind to the multicast address, which causes multicast packets to be filtered
#[cfg(unix)]
fn bind_to_multicast(
    socket: &socket2::Socket,
    addr: &SocketAddrV4,
    nic_addr: &Ipv4Addr,
) -> io::Result<()> {
    // Linux is special, if we don't disable IP_MULTICAST_ALL the kernel forgets on
    // which device the multicast packet arrived and sends it to all sockets.
    #[cfg(target_os = "linux")]
    {
        use std::{mem, os::unix::io::AsRawFd};

        unsafe {
            let optval: libc::c_int = 0;
            let ret = libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_IP,
                libc::IP_MULTICAST_ALL,
                &optval as *const _ as *const libc::c_void,
                mem::size_of_val(&optval) as libc::socklen_t,
            );
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    let socketaddr = SocketAddr::new(IpAddr::V4(*addr.ip()), addr.port());
    socket.bind(&socket2::SockAddr::from(socketaddr))?;

    socket.join_multicast_v4(addr.ip(), nic_addr)?;

    log::trace!(
        "Binding multicast socket to {} for multicast group {} nic {}",
        socketaddr,
        addr.ip(),
        nic_addr
    );

    Ok(())
}

fn bind_any(socket: &socket2::Socket, ip: Ipv4Addr) -> io::Result<()> {
    let socketaddr = SocketAddr::new(IpAddr::V4(ip), 0);
    socket.bind(&socket2::SockAddr::from(socketaddr))?;
    log::trace!("Binding socket to {}", socketaddr);
    Ok(())
}

/// A configured UDP socket for one NatNet channel.
///
/// Blocking with a read timeout so receive loops can poll their stop flag.
#[derive(Debug)]
pub struct ChannelSocket {
    socket: UdpSocket,
    kind: ChannelKind,
}

impl ChannelSocket {
    /// Socket for requests to the server and, in unicast mode, everything it sends back
    pub fn command(config: &ClientConfig) -> io::Result<Self> {
        let socket = new_socket()?;
        if config.use_multicast {
            bind_any(&socket, Ipv4Addr::UNSPECIFIED)?;
            socket.set_broadcast(true)?;
        } else {
            bind_any(&socket, config.local_address)?;
        }
        Self::finish(socket, ChannelKind::Command, config.read_timeout())
    }

    /// Socket receiving frame data
    pub fn data(config: &ClientConfig) -> io::Result<Self> {
        let socket = new_socket()?;
        if config.use_multicast {
            let group = SocketAddrV4::new(config.multicast_address, config.data_port);
            bind_to_multicast(&socket, &group, &config.local_address)?;
        } else {
            bind_any(&socket, Ipv4Addr::UNSPECIFIED)?;
            if config.multicast_address != Ipv4Addr::BROADCAST {
                // Frames come in on the command socket in unicast mode, so a
                // failed join only costs us the multicast copy.
                if let Err(e) =
                    socket.join_multicast_v4(&config.multicast_address, &config.local_address)
                {
                    log::warn!(
                        "Cannot join {} on {}: {}",
                        config.multicast_address,
                        config.local_address,
                        e
                    );
                }
            }
        }
        Self::finish(socket, ChannelKind::Data, config.read_timeout())
    }

    fn finish(socket: socket2::Socket, kind: ChannelKind, timeout: Duration) -> io::Result<Self> {
        socket.set_read_timeout(Some(timeout))?;
        let socket: UdpSocket = socket.into();
        log::debug!("Opened {} socket on {}", kind, socket.local_addr()?);
        Ok(ChannelSocket { socket, kind })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive one datagram.
    ///
    /// The sender is `None` when the read carries no address, which is how
    /// Linux reports the wakeup caused by [`shutdown`](Self::shutdown).
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        // SAFETY: an initialized byte is a valid MaybeUninit<u8> and the
        // socket only ever writes initialized bytes into the slice.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let (len, from) = SockRef::from(&self.socket).recv_from(uninit)?;
        Ok((len, from.as_socket()))
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    /// Wake up a thread blocked in `recv_from`.
    ///
    /// Unconnected UDP sockets report ENOTCONN here even though the shutdown
    /// takes effect, so errors are only traced.
    pub fn shutdown(&self) {
        if let Err(e) = SockRef::from(&self.socket).shutdown(Shutdown::Both) {
            log::trace!("Shutdown of {} socket: {}", self.kind, e);
        }
    }
}

/// True for errors a receive loop should treat as "nothing arrived yet".
///
/// Windows reports ICMP port unreachable on unconnected UDP sockets as a
/// connection reset, which only means the server is not up yet.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}
