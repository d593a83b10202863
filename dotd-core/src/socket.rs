//! Non-blocking datagram and stream endpoints.
//!
//! Everything is created `SOCK_NONBLOCK`; the raw descriptor is exposed for
//! reactor registration while ownership stays here. Datagram sockets can
//! recover the destination address and arrival interface of each packet so
//! replies on multi-homed hosts leave from the address the query came in on.

use std::io::{IoSlice, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    self, sockopt, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag,
    SockType, SockaddrStorage,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to create socket: {0}")]
    Create(#[source] Errno),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: Errno,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: Errno,
    },
    #[error("failed to enable packet info: {0}")]
    PacketInfo(#[source] Errno),
    #[error("datagram was truncated")]
    Truncated,
    #[error("socket I/O failed: {0}")]
    Io(#[from] Errno),
}

/// One received datagram plus its addressing metadata.
pub struct Datagram {
    pub payload: Vec<u8>,
    pub peer: SockaddrStorage,
    /// The local address the datagram was sent to, when packet info is on.
    pub local: Option<IpAddr>,
    /// The interface the datagram arrived on, when packet info is on.
    pub iface: Option<u32>,
}

/// A non-blocking socket of either family.
pub struct Socket {
    fd: OwnedFd,
    family: AddressFamily,
}

fn family_of(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

impl Socket {
    fn create(family: AddressFamily, kind: SockType) -> Result<Self, SocketError> {
        let fd = socket::socket(
            family,
            kind,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(SocketError::Create)?;
        Ok(Self { fd, family })
    }

    /// Start a non-blocking TCP connect. `EINPROGRESS` is success; the
    /// connection completes (or fails) under the reactor.
    pub fn connect_tcp(addr: &SocketAddr) -> Result<Self, SocketError> {
        let sock = Self::create(family_of(addr), SockType::Stream)?;
        match socket::connect(sock.fd.as_raw_fd(), &SockaddrStorage::from(*addr)) {
            Ok(()) | Err(Errno::EINPROGRESS) => Ok(sock),
            Err(err) => Err(SocketError::Connect {
                addr: *addr,
                source: err,
            }),
        }
    }

    /// Bind a UDP socket to a local address.
    pub fn bind_udp(addr: &SocketAddr) -> Result<Self, SocketError> {
        let sock = Self::create(family_of(addr), SockType::Datagram)?;
        socket::bind(sock.fd.as_raw_fd(), &SockaddrStorage::from(*addr)).map_err(|err| {
            SocketError::Bind {
                addr: *addr,
                source: err,
            }
        })?;
        Ok(sock)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The locally bound address, mainly for logging ephemeral binds.
    pub fn local_addr(&self) -> Result<SockaddrStorage, SocketError> {
        Ok(socket::getsockname(self.fd.as_raw_fd())?)
    }

    /// Ask the kernel for destination-address ancillary data on receives.
    pub fn enable_packet_info(&self) -> Result<(), SocketError> {
        match self.family {
            AddressFamily::Inet => socket::setsockopt(&self.fd, sockopt::Ipv4PacketInfo, &true),
            AddressFamily::Inet6 => {
                socket::setsockopt(&self.fd, sockopt::Ipv6RecvPacketInfo, &true)
            }
            _ => Err(Errno::EAFNOSUPPORT),
        }
        .map_err(SocketError::PacketInfo)
    }

    /// Receive one datagram of up to `limit` bytes.
    ///
    /// Returns `Ok(None)` when nothing is pending (spurious wakeup) and an
    /// error when the datagram exceeded `limit`.
    pub fn recv_query(&self, limit: usize) -> Result<Option<Datagram>, SocketError> {
        // Two bytes of slack so an oversized datagram is detected by
        // MSG_TRUNC rather than silently clipped at exactly `limit`.
        let mut buf = vec![0u8; limit + 2];
        let mut cmsg_buf = nix::cmsg_space!(libc::in6_pktinfo);

        let (count, flags, peer, local, iface) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = match socket::recvmsg::<SockaddrStorage>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            ) {
                Ok(msg) => msg,
                Err(Errno::EAGAIN | Errno::EINTR) => return Ok(None),
                Err(err) => return Err(err.into()),
            };

            let mut local = None;
            let mut iface = None;
            for cmsg in msg.cmsgs()? {
                match cmsg {
                    ControlMessageOwned::Ipv4PacketInfo(info) => {
                        // s_addr is already in network byte order.
                        local = Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                            info.ipi_addr.s_addr,
                        ))));
                        iface = Some(info.ipi_ifindex as u32);
                    }
                    ControlMessageOwned::Ipv6PacketInfo(info) => {
                        local = Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
                        iface = Some(info.ipi6_ifindex);
                    }
                    _ => {}
                }
            }
            (msg.bytes, msg.flags, msg.address, local, iface)
        };

        if flags.contains(MsgFlags::MSG_TRUNC) || count > limit {
            return Err(SocketError::Truncated);
        }
        let Some(peer) = peer else {
            return Ok(None);
        };

        buf.truncate(count);
        Ok(Some(Datagram {
            payload: buf,
            peer,
            local,
            iface,
        }))
    }

    /// Send a reply datagram, pinning the source address and interface to
    /// where the query arrived when that information is available.
    pub fn send_reply(
        &self,
        payload: &[u8],
        peer: &SockaddrStorage,
        local: Option<IpAddr>,
        iface: Option<u32>,
    ) -> Result<(), SocketError> {
        let mut v4_info: Option<libc::in_pktinfo> = None;
        let mut v6_info: Option<libc::in6_pktinfo> = None;
        match local {
            Some(IpAddr::V4(ip)) => {
                v4_info = Some(libc::in_pktinfo {
                    ipi_ifindex: iface.unwrap_or(0) as libc::c_int,
                    ipi_spec_dst: libc::in_addr {
                        s_addr: u32::from_ne_bytes(ip.octets()),
                    },
                    ipi_addr: libc::in_addr { s_addr: 0 },
                });
            }
            Some(IpAddr::V6(ip)) => {
                v6_info = Some(libc::in6_pktinfo {
                    ipi6_addr: libc::in6_addr {
                        s6_addr: ip.octets(),
                    },
                    ipi6_ifindex: iface.unwrap_or(0),
                });
            }
            None => {}
        }

        let mut cmsgs: Vec<ControlMessage> = Vec::with_capacity(1);
        if let Some(info) = v4_info.as_ref() {
            cmsgs.push(ControlMessage::Ipv4PacketInfo(info));
        }
        if let Some(info) = v6_info.as_ref() {
            cmsgs.push(ControlMessage::Ipv6PacketInfo(info));
        }

        let iov = [IoSlice::new(payload)];
        socket::sendmsg(
            self.fd.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            Some(peer),
        )?;
        Ok(())
    }

    /// Hand the descriptor over, e.g. to wrap it in a TLS stream.
    pub(crate) fn into_fd(self) -> OwnedFd {
        self.fd
    }
}
