//! UDP socket setup: binding, multicast group membership, and outgoing
//! interface selection.
//!
//! Master and slaves share one socket type and differ only in which address
//! they bind to and which address they treat as their peer. If the slave
//! group address is a multicast address the slaves join the group and the
//! master pins its outgoing interface; otherwise both sides just turn on
//! broadcast.

use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::os::unix::io::AsRawFd;

use crate::error::Error;

/// IPv4 multicast addresses are class D: first octet in `[224, 239]`. The
/// source computes this after `ntohl`-ing the resolved address and testing
/// its top byte; testing `Ipv4Addr::octets()[0]` is the same test, since
/// `ntohl` on a network-order address yields the integer whose top byte is
/// the address's first dotted-decimal octet.
pub fn is_multicast(addr: Ipv4Addr) -> bool {
    let first_octet = addr.octets()[0];
    (224..=239).contains(&first_octet)
}

pub fn resolve_ipv4(host: &str) -> Result<Ipv4Addr, Error> {
    (host, 0u16)
        .to_socket_addrs()
        .map_err(|source| Error::ResolveFailed {
            host: host.to_string(),
            source,
        })?
        .find_map(|addr| match addr {
            std::net::SocketAddr::V4(v4) => Some(*v4.ip()),
            std::net::SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::ResolveFailed {
            host: host.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no IPv4 address in resolution result",
            ),
        })
}

/// Parameters needed to stand up the multiplexer's one UDP socket.
pub struct SocketConfig {
    pub node_index: u32,
    pub master_host: String,
    pub master_port: u16,
    pub slave_group: String,
    pub slave_port: u16,
}

/// Binds and configures the socket for this node, returning it along with
/// the address this node should send to.
pub fn setup(config: &SocketConfig) -> Result<(UdpSocket, SocketAddrV4), Error> {
    let master_addr = resolve_ipv4(&config.master_host)?;
    let slave_group_addr = resolve_ipv4(&config.slave_group)?;

    let local_port = if config.node_index == 0 {
        config.master_port
    } else {
        config.slave_port
    };
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_port))
        .map_err(Error::SocketSetupFailed)?;

    let multicast = is_multicast(slave_group_addr);
    if !multicast {
        socket.set_broadcast(true).map_err(Error::SocketSetupFailed)?;
    }

    let peer_addr = if config.node_index == 0 {
        if multicast {
            set_multicast_if(&socket, master_addr).map_err(Error::SocketSetupFailed)?;
        }
        SocketAddrV4::new(slave_group_addr, config.slave_port)
    } else {
        if multicast {
            socket
                .join_multicast_v4(&slave_group_addr, &Ipv4Addr::UNSPECIFIED)
                .map_err(Error::SocketSetupFailed)?;
        }
        SocketAddrV4::new(master_addr, config.master_port)
    };

    Ok((socket, peer_addr))
}

/// Pins the outgoing interface used for multicast sends. Not exposed by
/// `std::net::UdpSocket`, so it goes through a raw `setsockopt` call.
fn set_multicast_if(socket: &UdpSocket, iface: Ipv4Addr) -> std::io::Result<()> {
    let addr: libc::in_addr = libc::in_addr {
        s_addr: u32::from(iface).to_be(),
    };
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            &addr as *const libc::in_addr as *const libc::c_void,
            std::mem::size_of::<libc::in_addr>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_d_addresses_are_multicast() {
        assert!(is_multicast(Ipv4Addr::new(224, 0, 0, 1)));
        assert!(is_multicast(Ipv4Addr::new(239, 255, 255, 255)));
        assert!(!is_multicast(Ipv4Addr::new(223, 255, 255, 255)));
        assert!(!is_multicast(Ipv4Addr::new(240, 0, 0, 0)));
        assert!(!is_multicast(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn resolve_loopback_succeeds() {
        let addr = resolve_ipv4("127.0.0.1").expect("loopback resolves");
        assert_eq!(addr, Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn resolve_bogus_host_fails() {
        let err = resolve_ipv4("this.host.does.not.exist.invalid");
        assert!(err.is_err());
    }
}
