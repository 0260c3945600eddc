// Copyright 2025-2026 CEMAXECUTER LLC

//! Service advertisement for output and control groups.
//!
//! Group names are DNS-style. When DNS use is enabled and the name already
//! resolves, that address wins and only a service record is published;
//! otherwise a deterministic address is synthesized from the name hash and
//! both the service record and an address record are advertised. Service
//! records go through the mDNS responder library; it only answers for the
//! host's own names, so address records for synthesized groups are
//! announced directly on the mDNS group.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Mutex;

use byteorder::{BigEndian, WriteBytesExt};

use crate::multicast::{make_maddr, output_mcast, resolve_mcast};

/// Where every mDNS record is announced.
const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;
/// Cache TTL for self-published address records, seconds.
const ADDR_RECORD_TTL: u32 = 120;

/// Service types the daemon publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    /// Standard PCM media stream.
    Rtp,
    /// Opus-encoded media stream.
    Opus,
    /// Status/command stream.
    Control,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rtp => "_rtp._udp",
            Self::Opus => "_opus._udp",
            Self::Control => "_ka9q-ctl._udp",
        }
    }
}

/// Append `.local` to a bare name; names that already carry a dot suffix
/// pass through untouched.
pub fn ensure_local_suffix(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{}.local", name)
    }
}

/// A resolved output group: the advertised name, the socket address the
/// process will actually send to, and whether the address was synthesized
/// (and therefore needs an address record published).
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub addr: SocketAddr,
    pub synthesized: bool,
}

impl Group {
    fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            _ => None,
        }
    }
}

/// Resolve or synthesize the group address for a name. At most two DNS
/// lookups; any failure falls back to the hash address.
pub fn resolve_group(name: &str, port: u16, use_dns: bool) -> Group {
    if use_dns {
        if let Some(addr) = resolve_mcast(name, port, 2) {
            return Group {
                name: name.to_string(),
                addr,
                synthesized: false,
            };
        }
    }
    let addr = make_maddr(name);
    Group {
        name: name.to_string(),
        addr: SocketAddr::from((addr, port)),
        synthesized: true,
    }
}

/// One unsolicited mDNS response carrying a single A record mapping
/// `name` to `addr`: id 0, authoritative answer, no questions, class IN
/// with the cache-flush bit.
fn build_a_record(name: &str, addr: Ipv4Addr) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(12 + name.len() + 16);
    buf.write_u16::<BigEndian>(0)?; // transaction id, always 0 in mDNS
    buf.write_u16::<BigEndian>(0x8400)?; // response, authoritative
    buf.write_u16::<BigEndian>(0)?; // questions
    buf.write_u16::<BigEndian>(1)?; // answers
    buf.write_u16::<BigEndian>(0)?; // authority
    buf.write_u16::<BigEndian>(0)?; // additional
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("dns label {} too long", label),
            ));
        }
        buf.write_u8(label.len() as u8)?;
        buf.extend_from_slice(label.as_bytes());
    }
    buf.write_u8(0)?;
    buf.write_u16::<BigEndian>(1)?; // TYPE A
    buf.write_u16::<BigEndian>(0x8001)?; // class IN, cache-flush
    buf.write_u32::<BigEndian>(ADDR_RECORD_TTL)?;
    buf.write_u16::<BigEndian>(4)?;
    buf.extend_from_slice(&addr.octets());
    Ok(buf)
}

/// Publishes service and address records. Keeps the responder's
/// registration guards alive for the process lifetime. Failure to start
/// the responder or the announce socket downgrades publishing to log
/// lines; stream addressing still works because the addresses are
/// deterministic.
pub struct Advertiser {
    responder: Mutex<Option<libmdns::Responder>>,
    services: Mutex<Vec<libmdns::Service>>,
    /// Socket for self-announced address records.
    addr_sock: Option<UdpSocket>,
}

impl Advertiser {
    /// `enabled = false` (the `static` config) skips the responder and
    /// leaves only the deterministic addressing.
    pub fn new(enabled: bool) -> Self {
        if !enabled {
            return Self {
                responder: Mutex::new(None),
                services: Mutex::new(Vec::new()),
                addr_sock: None,
            };
        }
        let responder = match libmdns::Responder::new() {
            Ok(r) => Some(r),
            Err(e) => {
                log::warn!("mDNS responder unavailable: {}", e);
                None
            }
        };
        // mDNS requires TTL 255
        let addr_sock = match output_mcast(None, 255, 0) {
            Ok(s) => Some(s),
            Err(e) => {
                log::warn!("can't announce address records: {}", e);
                None
            }
        };
        Self {
            responder: Mutex::new(responder),
            services: Mutex::new(Vec::new()),
            addr_sock,
        }
    }

    /// Publish the records for one group: the service record with its
    /// `TTL=<n>` TXT attribute, and an address record when the group
    /// address was synthesized rather than found in the DNS.
    pub fn advertise(&self, instance: &str, stype: ServiceType, port: u16, ttl: u32, group: &Group) {
        let ttl_txt = format!("TTL={}", ttl);
        match &*self.responder.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(responder) => {
                let svc = responder.register(
                    stype.as_str().to_string(),
                    instance.to_string(),
                    port,
                    &[ttl_txt.as_str()],
                );
                self.services
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(svc);
            }
            None => {
                log::info!(
                    "not advertising {} {} port {} ({})",
                    instance,
                    stype.as_str(),
                    port,
                    ttl_txt
                );
            }
        }
        if group.synthesized {
            if let Some(addr) = group.ipv4() {
                self.announce_address(&group.name, addr);
            }
        }
    }

    /// Announce the name-to-address mapping. Sent twice, the duplicate
    /// covering one lost datagram.
    fn announce_address(&self, name: &str, addr: Ipv4Addr) {
        let Some(sock) = &self.addr_sock else {
            log::info!("not announcing {} -> {}", name, addr);
            return;
        };
        let pkt = match build_a_record(name, addr) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("address record for {}: {}", name, e);
                return;
            }
        };
        let dest = SocketAddr::from((MDNS_GROUP, MDNS_PORT));
        for _ in 0..2 {
            if let Err(e) = sock.send_to(&pkt, dest) {
                log::warn!("announce {}: {}", name, e);
                break;
            }
        }
    }
}
