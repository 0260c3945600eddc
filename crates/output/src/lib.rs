// Copyright 2025-2026 CEMAXECUTER LLC

//! Everything that leaves the process: multicast socket plumbing, service
//! advertisement, and the RTP/RTCP/SAP wire formats.

pub mod advertise;
pub mod multicast;
pub mod rtcp;
pub mod rtp;
pub mod sap;

/// Default destination port for RTP media streams.
pub const DEFAULT_RTP_PORT: u16 = 5004;
/// RTCP rides on the port adjacent to the media port.
pub const DEFAULT_RTCP_PORT: u16 = 5005;
/// Status/command streams share the group address at this port.
pub const DEFAULT_STAT_PORT: u16 = 5006;

/// Well-known SAP announcement destination (sap.mcast.net).
pub const SAP_DEST: &str = "224.2.127.254:9875";
