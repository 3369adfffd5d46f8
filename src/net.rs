//! UDP transport for PTP event and general messages.
//!
//! Two multicast sockets: event traffic on port 319 with kernel receive
//! timestamping (SO_TIMESTAMPNS), general traffic on port 320. Both are
//! non-blocking and polled from the cooperative scheduler. Sends are
//! non-blocking as well and drop on a full buffer.

use anyhow::{anyhow, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::SystemTime;

#[cfg(unix)]
use nix::sys::socket::{recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags};
#[cfg(unix)]
use std::io::IoSliceMut;
#[cfg(unix)]
use std::os::fd::AsRawFd;

use crate::ptp::messages::{
    MessageType, PTP_EVENT_PORT, PTP_GENERAL_PORT, PTP_PDELAY_MULTICAST, PTP_PRIMARY_MULTICAST,
};
use crate::ptp::port::PtpTransport;
use crate::time::Timestamp;

/// Pick the interface the PTP sockets bind to: the named one, or the
/// first usable non-loopback IPv4 interface.
pub fn select_interface(name: Option<&str>) -> Result<(String, Ipv4Addr)> {
    let interfaces = if_addrs::get_if_addrs()?;

    let mut candidates: Vec<(String, Ipv4Addr)> = interfaces
        .iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some((iface.name.clone(), ip)),
            IpAddr::V6(_) => None,
        })
        .collect();

    if let Some(name) = name {
        candidates.retain(|(iface, _)| iface == name);
        if candidates.is_empty() {
            return Err(anyhow!("interface {} not found or has no IPv4 address", name));
        }
    }

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no usable network interface found"))
}

fn create_multicast_socket(port: u16, interface_ip: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;

    let primary: Ipv4Addr = PTP_PRIMARY_MULTICAST.parse()?;
    let pdelay: Ipv4Addr = PTP_PDELAY_MULTICAST.parse()?;
    socket.join_multicast_v4(&primary, &interface_ip)?;
    socket.join_multicast_v4(&pdelay, &interface_ip)?;

    socket.set_multicast_loop_v4(false)?;
    socket.set_multicast_if_v4(&interface_ip)?;
    socket.set_nonblocking(true)?;

    let udp_socket: UdpSocket = socket.into();

    #[cfg(unix)]
    {
        match setsockopt(&udp_socket, sockopt::ReceiveTimestampns, &true) {
            Ok(_) => log::info!("net: kernel timestamping (SO_TIMESTAMPNS) enabled on :{}", port),
            Err(e) => log::warn!("net: failed to enable kernel timestamping: {}", e),
        }
    }

    Ok(udp_socket)
}

/// Receive one datagram with its kernel timestamp. Returns Ok(None) when
/// the socket has nothing buffered.
#[cfg(unix)]
fn recv_with_timestamp(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> Result<Option<(usize, Option<Timestamp>)>> {
    let mut cmsgspace = nix::cmsg_space!(nix::sys::time::TimeSpec);
    let mut iov = [IoSliceMut::new(buf)];

    match recvmsg::<nix::sys::socket::SockaddrStorage>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsgspace),
        MsgFlags::empty(),
    ) {
        Ok(msg) => {
            let mut timestamp = None;
            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmTimestampns(ts) = cmsg {
                    timestamp = Some(Timestamp::new(ts.tv_sec(), ts.tv_nsec() as i32));
                }
            }
            Ok(Some((msg.bytes, timestamp)))
        }
        Err(nix::errno::Errno::EAGAIN) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn recv_with_timestamp(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> Result<Option<(usize, Option<Timestamp>)>> {
    match socket.recv_from(buf) {
        Ok((size, _)) => Ok(Some((size, None))),
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Dual-socket PTP transport.
pub struct UdpTransport {
    sock_event: UdpSocket,
    sock_general: UdpSocket,
    primary: Ipv4Addr,
    pdelay: Ipv4Addr,
    /// Sends dropped on a full socket buffer.
    pub dropped_sends: u64,
}

impl UdpTransport {
    pub fn new(interface_ip: Ipv4Addr) -> Result<Self> {
        Ok(UdpTransport {
            sock_event: create_multicast_socket(PTP_EVENT_PORT, interface_ip)?,
            sock_general: create_multicast_socket(PTP_GENERAL_PORT, interface_ip)?,
            primary: PTP_PRIMARY_MULTICAST.parse()?,
            pdelay: PTP_PDELAY_MULTICAST.parse()?,
            dropped_sends: 0,
        })
    }

    /// Peer-delay messages go to the link-local group, everything else
    /// to the primary group.
    fn destination(&self, buf: &[u8], port: u16) -> SocketAddrV4 {
        let group = match buf.first().map(|b| b & 0x0F) {
            Some(nibble)
                if MessageType::from_nibble(nibble)
                    .map(|t| {
                        matches!(
                            t,
                            MessageType::PdelayReq
                                | MessageType::PdelayResp
                                | MessageType::PdelayRespFollowUp
                        )
                    })
                    .unwrap_or(false) =>
            {
                self.pdelay
            }
            _ => self.primary,
        };
        SocketAddrV4::new(group, port)
    }

    fn send(&mut self, socket_is_event: bool, buf: &[u8]) -> Result<()> {
        let port = if socket_is_event {
            PTP_EVENT_PORT
        } else {
            PTP_GENERAL_PORT
        };
        let dest = self.destination(buf, port);
        let socket = if socket_is_event {
            &self.sock_event
        } else {
            &self.sock_general
        };
        match socket.send_to(buf, dest) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.dropped_sends += 1;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl PtpTransport for UdpTransport {
    fn recv(&mut self) -> Result<Option<(Vec<u8>, Timestamp)>> {
        let mut buf = [0u8; 2048];

        // event socket first: its datagrams carry receive timestamps
        if let Some((size, timestamp)) = recv_with_timestamp(&self.sock_event, &mut buf)? {
            let ts = timestamp
                .unwrap_or_else(|| Timestamp::from_system_time(SystemTime::now()));
            return Ok(Some((buf[..size].to_vec(), ts)));
        }

        if let Some((size, timestamp)) = recv_with_timestamp(&self.sock_general, &mut buf)? {
            let ts = timestamp
                .unwrap_or_else(|| Timestamp::from_system_time(SystemTime::now()));
            return Ok(Some((buf[..size].to_vec(), ts)));
        }

        Ok(None)
    }

    fn send_event(&mut self, buf: &[u8]) -> Result<Timestamp> {
        self.send(true, buf)?;
        // software transmit timestamp: read the clock right after the send
        Ok(Timestamp::from_system_time(SystemTime::now()))
    }

    fn send_general(&mut self, buf: &[u8]) -> Result<()> {
        self.send(false, buf)
    }

    fn reset(&mut self) -> Result<()> {
        // drain both sockets so stale pre-step traffic is not processed
        let mut buf = [0u8; 2048];
        loop {
            match self.sock_event.recv_from(&mut buf) {
                Ok(_) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        loop {
            match self.sock_general.recv_from(&mut buf) {
                Ok(_) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        Ok(())
    }
}
