// Copyright 2025-2026 CEMAXECUTER LLC

//! RTP stream state and header generation.

use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use byteorder::{BigEndian, WriteBytesExt};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;

/// Payload encodings carried on the media streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Big-endian 16-bit PCM, the default wire format.
    #[default]
    S16be,
    /// Little-endian 16-bit PCM.
    S16le,
    /// 32-bit float PCM.
    F32,
    /// Opus; frames produced by an external encoder.
    Opus,
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s16be" | "pcm" => Ok(Self::S16be),
            "s16le" => Ok(Self::S16le),
            "f32" | "f32le" => Ok(Self::F32),
            "opus" => Ok(Self::Opus),
            other => Err(format!("unknown encoding {}", other)),
        }
    }
}

impl Encoding {
    fn discriminant(self) -> u32 {
        match self {
            Self::S16be => 0,
            Self::S16le => 1,
            Self::F32 => 2,
            Self::Opus => 3,
        }
    }
}

/// Derive the RTP payload type for a stream's format.
///
/// The IANA static L16/44100 codepoints are honored; Opus always rides on
/// 111; everything else gets a deterministic dynamic codepoint so separate
/// daemon instances agree on the mapping without any signaling.
pub fn pt_from_info(samprate: u32, channels: u8, encoding: Encoding) -> u8 {
    match (encoding, samprate, channels) {
        (Encoding::S16be, 44_100, 2) => 10,
        (Encoding::S16be, 44_100, 1) => 11,
        (Encoding::Opus, _, _) => 111,
        _ => {
            let h = samprate / 1_000 + channels as u32 * 7 + encoding.discriminant() * 13;
            // 96..=110: dynamic range below the Opus codepoint
            96 + (h % 15) as u8
        }
    }
}

/// Per-stream RTP counters, shared between the demodulator thread that
/// advances them and the RTCP sender that reports them.
#[derive(Debug, Default)]
pub struct RtpState {
    pub seq: AtomicU32,
    pub timestamp: AtomicU32,
    pub packets: AtomicU32,
    pub bytes: AtomicU64,
}

impl RtpState {
    /// Account for one outgoing packet of `samples` timestamp units and
    /// `payload_bytes` of payload; returns the (seq, timestamp) pair that
    /// belongs in the packet's header.
    pub fn advance(&self, samples: u32, payload_bytes: usize) -> (u16, u32) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) as u16;
        let ts = self.timestamp.fetch_add(samples, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload_bytes as u64, Ordering::Relaxed);
        (seq, ts)
    }
}

/// Serialize a fixed 12-byte RTP header (no CSRCs, no extensions).
pub fn build_header(
    pt: u8,
    marker: bool,
    seq: u16,
    timestamp: u32,
    ssrc: u32,
) -> io::Result<[u8; RTP_HEADER_LEN]> {
    let mut buf = Vec::with_capacity(RTP_HEADER_LEN);
    buf.write_u8(RTP_VERSION << 6)?;
    buf.write_u8(if marker { 0x80 } else { 0 } | (pt & 0x7f))?;
    buf.write_u16::<BigEndian>(seq)?;
    buf.write_u32::<BigEndian>(timestamp)?;
    buf.write_u32::<BigEndian>(ssrc)?;
    let mut out = [0u8; RTP_HEADER_LEN];
    out.copy_from_slice(&buf);
    Ok(out)
}

/// Pack interleaved f32 audio into the stream's wire encoding.
pub fn encode_audio(encoding: Encoding, audio: &[f32]) -> Vec<u8> {
    let clamp = |v: f32| (v.clamp(-1.0, 1.0) * 32767.0) as i16;
    match encoding {
        Encoding::S16be => audio.iter().flat_map(|&v| clamp(v).to_be_bytes()).collect(),
        Encoding::S16le => audio.iter().flat_map(|&v| clamp(v).to_le_bytes()).collect(),
        Encoding::F32 => audio.iter().flat_map(|&v| v.to_be_bytes()).collect(),
        // Opus frames come from the external encoder; raw PCM is never
        // sent on an opus stream.
        Encoding::Opus => Vec::new(),
    }
}
