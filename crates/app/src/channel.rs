//! Channels and the process-wide registry keyed by SSRC.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rd_output::rtp::RtpState;
use rd_output::{DEFAULT_RTCP_PORT, DEFAULT_STAT_PORT};

use crate::template::ChannelTemplate;

/// How many successive SSRCs are probed when the derived one collides.
pub const MAX_SSRC_COLLISIONS: u32 = 100;

/// One active demodulator. Identity is the 32-bit RTP SSRC; zero is
/// reserved and never enters the registry.
///
/// Construction value-copies a template; the only fields mutated after
/// the channel is shared are the atomics below.
pub struct Channel {
    pub ssrc: u32,
    /// Created by the status task rather than the config; subject to idle
    /// expiry when parked at 0 Hz.
    pub dynamic: bool,
    pub tpl: ChannelTemplate,
    /// RTCP destination: the output group at the RTCP port.
    pub rtcp_dest: SocketAddr,
    pub rtp: RtpState,
    pub errors: AtomicU64,
    /// Tuned frequency, f64 bits.
    freq: AtomicU64,
    /// Blocks since the last command addressed to this channel.
    pub idle_blocks: AtomicU64,
}

impl Channel {
    pub fn from_template(ssrc: u32, tpl: &ChannelTemplate, dynamic: bool) -> Self {
        let mut rtcp_dest = tpl.dest;
        rtcp_dest.set_port(DEFAULT_RTCP_PORT);
        let mut status_dest = tpl.dest;
        status_dest.set_port(DEFAULT_STAT_PORT);
        let mut tpl = tpl.clone();
        tpl.status_dest = status_dest;
        Self {
            ssrc,
            dynamic,
            tpl,
            rtcp_dest,
            rtp: RtpState::default(),
            errors: AtomicU64::new(0),
            freq: AtomicU64::new(0f64.to_bits()),
            idle_blocks: AtomicU64::new(0),
        }
    }

    pub fn frequency(&self) -> f64 {
        f64::from_bits(self.freq.load(Ordering::Relaxed))
    }

    pub fn set_frequency(&self, freq: f64) {
        self.freq.store(freq.to_bits(), Ordering::Relaxed);
    }

    /// A command arrived for this channel; restart the idle clock.
    pub fn touch(&self) {
        self.idle_blocks.store(0, Ordering::Relaxed);
    }

    /// Advance the idle clock and report whether the channel has overstayed
    /// its lifetime at 0 Hz.
    pub fn tick_idle(&self, blocks: u64) -> bool {
        let idle = self.idle_blocks.fetch_add(blocks, Ordering::Relaxed) + blocks;
        self.tpl.lifetime > 0 && self.frequency() == 0.0 && idle >= self.tpl.lifetime
    }
}

/// Registry of live channels. Mutated by the channel factory at startup
/// and by the status task afterwards. The lock is never held across a
/// socket operation.
#[derive(Default)]
pub struct ChannelRegistry {
    chans: Mutex<HashMap<u32, Arc<Channel>>>,
}

impl ChannelRegistry {
    /// Insert a channel; refuses SSRC 0 and collisions.
    pub fn insert(&self, chan: Arc<Channel>) -> bool {
        if chan.ssrc == 0 {
            return false;
        }
        let mut chans = self.chans.lock().unwrap_or_else(|e| e.into_inner());
        match chans.entry(chan.ssrc) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(chan);
                true
            }
        }
    }

    /// Create and insert a channel, probing successive SSRCs on collision.
    /// Returns None when `want` is 0 or the probe range is exhausted.
    pub fn create(
        &self,
        want: u32,
        tpl: &ChannelTemplate,
        dynamic: bool,
    ) -> Option<Arc<Channel>> {
        if want == 0 {
            return None;
        }
        for i in 0..MAX_SSRC_COLLISIONS {
            let ssrc = want.wrapping_add(i);
            let chan = Arc::new(Channel::from_template(ssrc, tpl, dynamic));
            if self.insert(Arc::clone(&chan)) {
                return Some(chan);
            }
        }
        log::warn!(
            "can't allocate an ssrc in {}..{}",
            want,
            want.wrapping_add(MAX_SSRC_COLLISIONS)
        );
        None
    }

    pub fn get(&self, ssrc: u32) -> Option<Arc<Channel>> {
        self.chans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ssrc)
            .cloned()
    }

    pub fn remove(&self, ssrc: u32) -> Option<Arc<Channel>> {
        self.chans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ssrc)
    }

    pub fn len(&self) -> usize {
        self.chans.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live SSRCs, sorted for stable status output.
    pub fn ssrcs(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self
            .chans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tpl() -> ChannelTemplate {
        ChannelTemplate {
            dest: "239.1.2.3:5004".parse().unwrap(),
            ..ChannelTemplate::default()
        }
    }

    #[test]
    fn test_ssrc_zero_reserved() {
        let reg = ChannelRegistry::default();
        assert!(reg.create(0, &tpl(), false).is_none());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_collision_probes_next_ssrc() {
        let reg = ChannelRegistry::default();
        let a = reg.create(7_200_000, &tpl(), false).unwrap();
        let b = reg.create(7_200_000, &tpl(), false).unwrap();
        assert_eq!(a.ssrc, 7_200_000);
        assert_eq!(b.ssrc, 7_200_001);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_exhausted_probe_range_gives_up() {
        let reg = ChannelRegistry::default();
        for i in 0..MAX_SSRC_COLLISIONS {
            assert!(reg.create(100 + i, &tpl(), false).is_some());
        }
        assert!(reg.create(100, &tpl(), false).is_none());
    }

    #[test]
    fn test_ssrcs_unique_and_nonzero() {
        let reg = ChannelRegistry::default();
        for want in [42u32, 42, 42, 7_200_000, 1] {
            reg.create(want, &tpl(), false);
        }
        let ssrcs = reg.ssrcs();
        let mut dedup = ssrcs.clone();
        dedup.dedup();
        assert_eq!(ssrcs, dedup);
        assert!(!ssrcs.contains(&0));
        assert_eq!(ssrcs.len(), 5);
    }

    #[test]
    fn test_side_channel_ports_derived() {
        let chan = Channel::from_template(42, &tpl(), false);
        assert_eq!(chan.rtcp_dest.port(), DEFAULT_RTCP_PORT);
        assert_eq!(chan.tpl.status_dest.port(), DEFAULT_STAT_PORT);
        assert_eq!(chan.rtcp_dest.ip(), chan.tpl.dest.ip());
    }

    #[test]
    fn test_idle_expiry_only_at_zero_hz() {
        let mut t = tpl();
        t.lifetime = 10;
        let chan = Channel::from_template(42, &t, true);
        assert!(!chan.tick_idle(9));
        assert!(chan.tick_idle(1)); // 10 blocks idle at 0 Hz

        let chan = Channel::from_template(43, &t, true);
        chan.set_frequency(7.2e6);
        assert!(!chan.tick_idle(1_000_000)); // tuned channels persist
    }

    #[test]
    fn test_touch_resets_idle_clock() {
        let mut t = tpl();
        t.lifetime = 10;
        let chan = Channel::from_template(42, &t, true);
        assert!(!chan.tick_idle(9));
        chan.touch();
        assert!(!chan.tick_idle(9));
        assert!(chan.tick_idle(1));
    }

    #[test]
    fn test_wrapping_probe_skips_zero() {
        let reg = ChannelRegistry::default();
        // Wraps through u32::MAX to 0 (reserved, skipped) then 1
        let a = reg.create(u32::MAX, &tpl(), false).unwrap();
        assert_eq!(a.ssrc, u32::MAX);
        let b = reg.create(u32::MAX, &tpl(), false).unwrap();
        assert_eq!(b.ssrc, 1);
    }
}
