//! The shared status/command endpoint.
//!
//! One listener receives command packets for every channel; the send side
//! rides the shared TTL>0 media socket. The full status payload is the
//! project's TLV format, produced and consumed elsewhere; this task only
//! decodes the addressing envelope (packet type plus target SSRC), keeps
//! idle clocks fresh, creates dynamic channels on demand and emits a
//! periodic summary.

use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::system::System;
use crate::tasks;

const PKT_STATUS: u8 = 0;
const PKT_CMD: u8 = 1;

/// Most SSRCs listed in one summary datagram.
const STATUS_MAX_SSRCS: usize = 256;

pub fn start(sys: &Arc<System>, ctl: UdpSocket) {
    let sys = Arc::clone(sys);
    if let Err(e) = std::thread::Builder::new()
        .name("radio status".to_string())
        .spawn(move || status_loop(sys, ctl))
    {
        log::error!("status thread: {}", e);
    }
}

fn status_loop(sys: Arc<System>, ctl: UdpSocket) {
    if let Err(e) = ctl.set_read_timeout(Some(Duration::from_secs(1))) {
        log::error!("status socket timeout: {}", e);
        return;
    }
    let mut buf = [0u8; 16384];
    let mut last_status = Instant::now();

    loop {
        if sys.stop.load(Ordering::Relaxed) {
            return;
        }
        match ctl.recv_from(&mut buf) {
            Ok((n, from)) => {
                if let Some(ssrc) = decode_command(&buf[..n]) {
                    log::debug!("command for {} from {}", ssrc, from);
                    handle_command(&sys, ssrc);
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::warn!("status recv: {}", e);
            }
        }
        if last_status.elapsed() >= sys.update_interval {
            broadcast_status(&sys);
            last_status = Instant::now();
        }
    }
}

/// Command envelope: type byte, then the target SSRC big-endian. Anything
/// shorter, of the wrong type, or addressed to the reserved SSRC is
/// dropped.
fn decode_command(pkt: &[u8]) -> Option<u32> {
    if pkt.len() < 5 || pkt[0] != PKT_CMD {
        return None;
    }
    let ssrc = u32::from_be_bytes([pkt[1], pkt[2], pkt[3], pkt[4]]);
    if ssrc == 0 {
        return None;
    }
    Some(ssrc)
}

fn handle_command(sys: &Arc<System>, ssrc: u32) {
    if let Some(chan) = sys.registry.get(ssrc) {
        chan.touch();
        return;
    }
    // Unknown SSRC: create a dynamic channel from the global template.
    // It starts parked at 0 Hz and idles out unless commands keep coming.
    let Some(chan) = sys.registry.create(ssrc, &sys.template, true) else {
        log::warn!("can't create dynamic channel {}", ssrc);
        return;
    };
    log::info!(
        "dynamic channel {} created, idles out after {} blocks at 0 Hz",
        ssrc,
        sys.channel_idle_timeout
    );
    chan.touch();
    tasks::start_demod(sys, &chan);
}

/// Unsolicited summary: status type byte, frontend block counter, channel
/// count, then the SSRC list (truncated if enormous).
fn broadcast_status(sys: &Arc<System>) {
    let Some(&dest) = sys.frontend.metadata_dest.get() else {
        return;
    };
    let fe_status = sys.frontend.status();
    let ssrcs = sys.registry.ssrcs();
    let mut pkt = Vec::with_capacity(13 + 4 * ssrcs.len().min(STATUS_MAX_SSRCS));
    pkt.push(PKT_STATUS);
    pkt.extend_from_slice(&fe_status.blocks.to_be_bytes());
    pkt.extend_from_slice(&(ssrcs.len() as u32).to_be_bytes());
    for ssrc in ssrcs.iter().take(STATUS_MAX_SSRCS) {
        pkt.extend_from_slice(&ssrc.to_be_bytes());
    }
    if ssrcs.len() > STATUS_MAX_SSRCS {
        log::debug!("status summary truncated to {} ssrcs", STATUS_MAX_SSRCS);
    }
    let _ = sys.output.send_to(&pkt, dest);
}
