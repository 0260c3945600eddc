// Copyright 2025-2026 CEMAXECUTER LLC

//! Multicast socket plumbing: deterministic address synthesis, DNS lookup
//! with bounded retries, and the send/listen socket constructors. The
//! option plumbing std does not expose (TOS, interface-by-name membership)
//! goes through libc directly.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;

/// Synthesize a deterministic IPv4 multicast address for a stream name.
///
/// FNV-1a over the name, folded into 239.0.0.0/8. The 239.0.0.x and
/// 239.128.0.x blocks alias the 224.0.0.x link-local MAC range, which
/// snooping switches may refuse to forward, so those are nudged out of.
pub fn make_maddr(name: &str) -> Ipv4Addr {
    let mut hash: u32 = 0x811c_9dc5;
    for b in name.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let mut host = hash & 0x00ff_ffff;
    if host >> 8 == 0 || host >> 8 == 0x8000 {
        host |= 0x0100;
    }
    Ipv4Addr::from(0xef00_0000 | host)
}

/// Resolve a multicast group name, trying at most `attempts` lookups.
/// `name` may carry an explicit `:port`; otherwise `default_port` applies.
/// Returns None when resolution fails so the caller can synthesize.
pub fn resolve_mcast(name: &str, default_port: u16, attempts: u32) -> Option<SocketAddr> {
    let (host, port) = match name.rsplit_once(':') {
        Some((h, p)) => match p.parse::<u16>() {
            Ok(port) => (h, port),
            Err(_) => (name, default_port),
        },
        None => (name, default_port),
    };
    for attempt in 0..attempts.max(1) {
        match (host, port).to_socket_addrs() {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.find(|a| a.is_ipv4()) {
                    return Some(addr);
                }
                return None;
            }
            Err(e) => {
                log::debug!("resolve {} (try {}): {}", host, attempt + 1, e);
            }
        }
    }
    None
}

fn if_index(name: &str) -> u32 {
    let Ok(cname) = std::ffi::CString::new(name) else {
        return 0;
    };
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        log::warn!("unknown interface {}", name);
    }
    idx
}

fn set_ip_tos(sock: &UdpSocket, tos: i32) -> io::Result<()> {
    let r = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_TOS,
            &tos as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_mcast_iface(sock: &UdpSocket, iface: &str) -> io::Result<()> {
    let mreqn = libc::ip_mreqn {
        imr_multiaddr: libc::in_addr { s_addr: 0 },
        imr_address: libc::in_addr { s_addr: 0 },
        imr_ifindex: if_index(iface) as i32,
    };
    let r = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            &mreqn as *const libc::ip_mreqn as *const libc::c_void,
            std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_reuseaddr(sock: &UdpSocket) -> io::Result<()> {
    let one: i32 = 1;
    let r = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create an unconnected send socket for multicast output with the given
/// TTL and TOS, optionally pinned to an interface.
pub fn output_mcast(iface: Option<&str>, ttl: u32, tos: i32) -> io::Result<UdpSocket> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    sock.set_multicast_ttl_v4(ttl)?;
    sock.set_multicast_loop_v4(true)?;
    set_ip_tos(&sock, tos)?;
    if let Some(iface) = iface {
        set_mcast_iface(&sock, iface)?;
    }
    Ok(sock)
}

/// Join a multicast group on an already-open socket. Harmless when the
/// group is not multicast or the join races an earlier membership.
pub fn join_group(sock: &UdpSocket, group: &SocketAddr, iface: Option<&str>) {
    let SocketAddr::V4(v4) = group else {
        return;
    };
    if !v4.ip().is_multicast() {
        return;
    }
    let mreqn = libc::ip_mreqn {
        imr_multiaddr: libc::in_addr {
            s_addr: u32::from_ne_bytes(v4.ip().octets()),
        },
        imr_address: libc::in_addr { s_addr: 0 },
        imr_ifindex: iface.map(if_index).unwrap_or(0) as i32,
    };
    let r = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_ADD_MEMBERSHIP,
            &mreqn as *const libc::ip_mreqn as *const libc::c_void,
            std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
        )
    };
    if r < 0 {
        let err = io::Error::last_os_error();
        // EADDRINUSE here means we already belong to the group
        if err.raw_os_error() != Some(libc::EADDRINUSE) {
            log::warn!("join {}: {}", group, err);
        }
    }
}

/// Open a listening socket bound to a multicast group and join it.
/// Reuse-addr first so several processes can share the group.
pub fn listen_mcast(group: &SocketAddr, iface: Option<&str>) -> io::Result<UdpSocket> {
    let SocketAddr::V4(v4) = group else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "IPv4 multicast group required",
        ));
    };
    // Built by hand so SO_REUSEADDR lands before bind.
    let sock = unsafe {
        use std::os::fd::FromRawFd;
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        UdpSocket::from_raw_fd(fd)
    };
    set_reuseaddr(&sock)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, v4.port());
    let sockaddr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: bind_addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(bind_addr.ip().octets()),
        },
        sin_zero: [0; 8],
    };
    let r = unsafe {
        libc::bind(
            sock.as_raw_fd(),
            &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    join_group(&sock, group, iface);
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maddr_deterministic_and_in_range() {
        let a = make_maddr("hf-pcm.local");
        let b = make_maddr("hf-pcm.local");
        assert_eq!(a, b);
        assert_eq!(a.octets()[0], 239);
        assert_ne!(make_maddr("hf-pcm.local"), make_maddr("vhf-pcm.local"));
    }

    #[test]
    fn test_maddr_avoids_link_local_alias_blocks() {
        // Brute-force a sample of names; none may land in 239.0.0.0/24
        // or 239.128.0.0/24.
        for i in 0..512 {
            let addr = make_maddr(&format!("group-{}.local", i));
            let o = addr.octets();
            assert!(!(o[1] == 0 && o[2] == 0), "{} hit 239.0.0.0/24", addr);
            assert!(!(o[1] == 128 && o[2] == 0), "{} hit 239.128.0.0/24", addr);
        }
    }

    #[test]
    fn test_resolve_literal_with_port() {
        let addr = resolve_mcast("224.2.127.254:9875", 5004, 2).unwrap();
        assert_eq!(addr.to_string(), "224.2.127.254:9875");
    }

    #[test]
    fn test_resolve_literal_default_port() {
        let addr = resolve_mcast("239.1.2.3", 5004, 2).unwrap();
        assert_eq!(addr.to_string(), "239.1.2.3:5004");
    }

    #[test]
    fn test_output_socket_honors_ttl() {
        let sock = output_mcast(None, 3, 48).unwrap();
        assert_eq!(sock.multicast_ttl_v4().unwrap(), 3);
        let sock0 = output_mcast(None, 0, 48).unwrap();
        assert_eq!(sock0.multicast_ttl_v4().unwrap(), 0);
    }
}
