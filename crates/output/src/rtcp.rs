// Copyright 2025-2026 CEMAXECUTER LLC

//! RTCP sender-side packet generation: Sender Reports and SDES chunks,
//! combined into the compound packet each channel emits at 1 Hz.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, WriteBytesExt};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

const PT_SR: u8 = 200;
const PT_SDES: u8 = 202;

/// Current wall clock as a 64-bit NTP timestamp (units of 2^-32 s).
/// NTP uses UTC and ignores leap seconds, so the realtime clock maps
/// directly.
pub fn ntp_now() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    ((now.as_secs() + NTP_EPOCH_OFFSET) << 32) + ((now.subsec_nanos() as u64) << 32) / 1_000_000_000
}

/// Sender Report contents.
#[derive(Debug, Clone, Copy)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub byte_count: u32,
}

/// SDES item types used by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdesType {
    Cname = 1,
    Name = 2,
    Email = 3,
    Tool = 6,
}

#[derive(Debug, Clone)]
pub struct SdesItem {
    pub kind: SdesType,
    pub text: String,
}

impl SdesItem {
    pub fn new(kind: SdesType, text: impl Into<String>) -> Self {
        let mut text = text.into();
        // Item length is a single byte
        text.truncate(255);
        Self { kind, text }
    }
}

/// Serialize a Sender Report with no reception report blocks.
pub fn build_sr(sr: &SenderReport) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(28);
    buf.write_u8(0x80)?; // V=2, P=0, RC=0
    buf.write_u8(PT_SR)?;
    buf.write_u16::<BigEndian>(6)?; // length in words - 1
    buf.write_u32::<BigEndian>(sr.ssrc)?;
    buf.write_u64::<BigEndian>(sr.ntp_timestamp)?;
    buf.write_u32::<BigEndian>(sr.rtp_timestamp)?;
    buf.write_u32::<BigEndian>(sr.packet_count)?;
    buf.write_u32::<BigEndian>(sr.byte_count)?;
    Ok(buf)
}

/// Serialize a single-chunk SDES packet.
pub fn build_sdes(ssrc: u32, items: &[SdesItem]) -> io::Result<Vec<u8>> {
    let mut chunk = Vec::new();
    chunk.write_u32::<BigEndian>(ssrc)?;
    for item in items {
        chunk.write_u8(item.kind as u8)?;
        chunk.write_u8(item.text.len() as u8)?;
        chunk.extend_from_slice(item.text.as_bytes());
    }
    // Chunk terminator plus padding to a word boundary
    chunk.push(0);
    while chunk.len() % 4 != 0 {
        chunk.push(0);
    }

    let mut buf = Vec::with_capacity(4 + chunk.len());
    buf.write_u8(0x80 | 1)?; // V=2, one chunk
    buf.write_u8(PT_SDES)?;
    buf.write_u16::<BigEndian>((chunk.len() / 4) as u16)?;
    buf.extend_from_slice(&chunk);
    Ok(buf)
}

/// The compound packet a channel sends each second: SR then SDES.
pub fn build_compound(sr: &SenderReport, items: &[SdesItem]) -> io::Result<Vec<u8>> {
    let mut buf = build_sr(sr)?;
    buf.extend_from_slice(&build_sdes(sr.ssrc, items)?);
    Ok(buf)
}
