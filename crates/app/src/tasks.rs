//! Long-running per-channel threads: the demodulator loop and the optional
//! RTCP and SAP senders.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rd_dsp::demod::{make_demod, Downconverter};
use rd_dsp::{compute_tuning, DspError};
use rd_output::rtcp::{build_compound, ntp_now, SdesItem, SdesType, SenderReport};
use rd_output::rtp::{build_header, encode_audio};
use rd_output::sap;

use crate::channel::Channel;
use crate::system::System;

/// Largest RTP payload sent in one datagram.
const MAX_PAYLOAD: usize = 1440;

pub fn start_demod(sys: &Arc<System>, chan: &Arc<Channel>) {
    let sys = Arc::clone(sys);
    let chan = Arc::clone(chan);
    let name = format!("demod {}", chan.ssrc);
    if let Err(e) = std::thread::Builder::new()
        .name(name)
        .spawn(move || demod_loop(sys, chan))
    {
        log::error!("demod thread: {}", e);
    }
}

fn demod_loop(sys: Arc<System>, chan: Arc<Channel>) {
    let fe = &sys.frontend;
    let mut downconverter = match Downconverter::new(&fe.filter.params, fe.samprate, chan.tpl.samprate)
    {
        Ok(dc) => dc,
        Err(e) => {
            log::error!("channel {}: {}", chan.ssrc, e);
            sys.registry.remove(chan.ssrc);
            return;
        }
    };
    let mut demod = make_demod(chan.tpl.mode);
    let mut tuned = f64::NAN;
    let mut tuning_ok = false;
    let gain = 10f32.powf(chan.tpl.gain / 20.0);
    let mut last_block = fe.filter.block_count();
    let mut audio: Vec<f32> = Vec::new();

    loop {
        if sys.stop.load(Ordering::Relaxed) {
            return;
        }
        let Some((seq, bins)) = fe.filter.wait_block(last_block, Duration::from_millis(100))
        else {
            continue;
        };
        let delta = seq - last_block;
        last_block = seq;

        if chan.tick_idle(delta) {
            log::info!("channel {} idled out", chan.ssrc);
            sys.registry.remove(chan.ssrc);
            return;
        }

        let freq = chan.frequency();
        if freq == 0.0 {
            continue; // parked
        }
        if freq != tuned {
            tuned = freq;
            let offset = freq - fe.frequency();
            match compute_tuning(fe.filter.params.n, fe.filter.params.m, fe.samprate, offset) {
                Ok(t) => {
                    downconverter.set_tuning(t.shift, t.remainder, chan.tpl.samprate);
                    tuning_ok = true;
                }
                Err(DspError::OutOfRange(f)) => {
                    log::warn!("channel {}: {} Hz outside passband", chan.ssrc, f);
                    chan.errors.fetch_add(1, Ordering::Relaxed);
                    tuning_ok = false;
                }
                Err(e) => {
                    log::warn!("channel {}: {}", chan.ssrc, e);
                    tuning_ok = false;
                }
            }
        }
        if !tuning_ok {
            continue;
        }

        let baseband = downconverter.process(&bins);
        audio.clear();
        demod.demodulate(&baseband, &mut audio);
        if gain != 1.0 {
            for a in &mut audio {
                *a *= gain;
            }
        }

        let payload = encode_audio(chan.tpl.encoding, &audio);
        if payload.is_empty() {
            continue;
        }
        let bytes_per_frame = payload.len() / baseband.len().max(1);
        let sock = sys.sock_for_ttl(chan.tpl.ttl);
        for piece in payload.chunks(MAX_PAYLOAD - MAX_PAYLOAD % bytes_per_frame.max(1)) {
            let samples = (piece.len() / bytes_per_frame.max(1)) as u32;
            let (seqno, ts) = chan.rtp.advance(samples, piece.len());
            let header = match build_header(chan.tpl.pt, false, seqno, ts, chan.ssrc) {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("channel {}: rtp header: {}", chan.ssrc, e);
                    chan.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let mut pkt = Vec::with_capacity(12 + piece.len());
            pkt.extend_from_slice(&header);
            pkt.extend_from_slice(piece);
            if sock.send_to(&pkt, chan.tpl.dest).is_err() {
                chan.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub fn start_rtcp(sys: &Arc<System>, chan: &Arc<Channel>) {
    let sys = Arc::clone(sys);
    let chan = Arc::clone(chan);
    let name = format!("rtcp {}", chan.ssrc);
    if let Err(e) = std::thread::Builder::new()
        .name(name)
        .spawn(move || rtcp_loop(sys, chan))
    {
        log::error!("rtcp thread: {}", e);
    }
}

/// One compound SR+SDES per second. Never exits on a transient send
/// failure; the error counter carries the news instead.
fn rtcp_loop(sys: Arc<System>, chan: Arc<Channel>) {
    let cname = format!("radio@{}", sys.hostname);
    let items = [
        SdesItem::new(SdesType::Cname, cname),
        SdesItem::new(SdesType::Name, sys.description.clone()),
        SdesItem::new(SdesType::Email, format!("radio@{}", sys.hostname)),
        SdesItem::new(SdesType::Tool, "radiod"),
    ];
    loop {
        if sys.stop.load(Ordering::Relaxed) {
            return;
        }
        if sys.registry.get(chan.ssrc).is_none() {
            return; // channel torn down
        }
        // An unassigned stream identity means nothing to report yet
        if chan.ssrc != 0 {
            let sr = SenderReport {
                ssrc: chan.ssrc,
                ntp_timestamp: ntp_now(),
                rtp_timestamp: sys.start_time.elapsed().as_secs() as u32,
                packet_count: chan.rtp.packets.load(Ordering::Relaxed),
                byte_count: chan.rtp.bytes.load(Ordering::Relaxed) as u32,
            };
            match build_compound(&sr, &items) {
                Ok(pkt) => {
                    if sys.output.send_to(&pkt, chan.rtcp_dest).is_err() {
                        chan.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(_) => {
                    chan.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

pub fn start_sap(sys: &Arc<System>, chan: &Arc<Channel>, dest: std::net::SocketAddr) {
    let sys = Arc::clone(sys);
    let chan = Arc::clone(chan);
    let name = format!("sap {}", chan.ssrc);
    if let Err(e) = std::thread::Builder::new()
        .name(name)
        .spawn(move || sap_loop(sys, chan, dest))
    {
        log::error!("sap thread: {}", e);
    }
}

/// Periodic session announcement for one channel.
fn sap_loop(sys: Arc<System>, chan: Arc<Channel>, dest: std::net::SocketAddr) {
    let group = match chan.tpl.dest {
        std::net::SocketAddr::V4(v4) => *v4.ip(),
        _ => return,
    };
    let desc = sap::SessionDesc {
        name: format!("{} {}", sys.description, chan.ssrc),
        origin_host: sys.hostname.clone(),
        session_id: chan.ssrc as u64,
        group,
        port: chan.tpl.dest.port(),
        ttl: chan.tpl.ttl,
        payload_type: chan.tpl.pt,
        samprate: chan.tpl.samprate,
        channels: chan.tpl.channels,
    };
    let sdp = sap::sdp_body(&desc);
    let pkt = match sap::build_announcement(sys.local_ip, sap::msg_id_for_ssrc(chan.ssrc), &sdp) {
        Ok(p) => p,
        Err(e) => {
            log::error!("sap {}: {}", chan.ssrc, e);
            return;
        }
    };

    loop {
        if sys.stop.load(Ordering::Relaxed) || sys.registry.get(chan.ssrc).is_none() {
            return;
        }
        if sys.sock_for_ttl(chan.tpl.ttl).send_to(&pkt, dest).is_err() {
            chan.errors.fetch_add(1, Ordering::Relaxed);
        }
        for _ in 0..5 {
            if sys.stop.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}
