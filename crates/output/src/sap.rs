// Copyright 2025-2026 CEMAXECUTER LLC

//! Session Announcement Protocol packets (RFC 2974) wrapping a minimal SDP
//! description of a media stream. Off by default; announcements repeat
//! until the channel goes away.

use std::io;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, WriteBytesExt};

const SAP_PAYLOAD_TYPE: &[u8] = b"application/sdp\0";

/// Stream parameters described by the SDP body.
#[derive(Debug, Clone)]
pub struct SessionDesc {
    pub name: String,
    pub origin_host: String,
    pub session_id: u64,
    pub group: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
    pub payload_type: u8,
    pub samprate: u32,
    pub channels: u8,
}

/// The SDP body for a session, one line per RFC 8866 field.
pub fn sdp_body(desc: &SessionDesc) -> String {
    format!(
        "v=0\r\n\
         o=- {} 1 IN IP4 {}\r\n\
         s={}\r\n\
         c=IN IP4 {}/{}\r\n\
         t=0 0\r\n\
         m=audio {} RTP/AVP {}\r\n\
         a=rtpmap:{} L16/{}/{}\r\n",
        desc.session_id,
        desc.origin_host,
        desc.name,
        desc.group,
        desc.ttl,
        desc.port,
        desc.payload_type,
        desc.payload_type,
        desc.samprate,
        desc.channels,
    )
}

/// One SAP announcement: v1 header, IPv4 origin, no auth, SDP payload.
/// `msg_id_hash` must stay constant across re-announcements of the same
/// session so listeners coalesce them.
pub fn build_announcement(origin: Ipv4Addr, msg_id_hash: u16, sdp: &str) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + SAP_PAYLOAD_TYPE.len() + sdp.len());
    buf.write_u8(0x20)?; // V=1, announce, IPv4, no compression
    buf.write_u8(0)?; // auth length
    buf.write_u16::<BigEndian>(msg_id_hash)?;
    buf.extend_from_slice(&origin.octets());
    buf.extend_from_slice(SAP_PAYLOAD_TYPE);
    buf.extend_from_slice(sdp.as_bytes());
    Ok(buf)
}

/// Stable message-id hash for a stream, derived from its SSRC.
pub fn msg_id_for_ssrc(ssrc: u32) -> u16 {
    (ssrc ^ (ssrc >> 16)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> SessionDesc {
        SessionDesc {
            name: "hf 7200000".to_string(),
            origin_host: "192.168.1.2".to_string(),
            session_id: 99,
            group: Ipv4Addr::new(239, 1, 2, 3),
            port: 5004,
            ttl: 1,
            payload_type: 96,
            samprate: 12_000,
            channels: 1,
        }
    }

    #[test]
    fn test_announcement_header() {
        let sdp = sdp_body(&desc());
        let pkt = build_announcement(Ipv4Addr::new(192, 168, 1, 2), 0xBEEF, &sdp).unwrap();
        assert_eq!(pkt[0], 0x20);
        assert_eq!(pkt[1], 0);
        assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]), 0xBEEF);
        assert_eq!(&pkt[4..8], &[192, 168, 1, 2]);
        assert_eq!(&pkt[8..24], SAP_PAYLOAD_TYPE);
        assert!(pkt[24..].starts_with(b"v=0"));
    }

    #[test]
    fn test_sdp_mentions_group_and_port() {
        let sdp = sdp_body(&desc());
        assert!(sdp.contains("c=IN IP4 239.1.2.3/1"));
        assert!(sdp.contains("m=audio 5004 RTP/AVP 96"));
        assert!(sdp.contains("a=rtpmap:96 L16/12000/1"));
    }

    #[test]
    fn test_msg_id_stable() {
        assert_eq!(msg_id_for_ssrc(7_200_000), msg_id_for_ssrc(7_200_000));
    }
}
