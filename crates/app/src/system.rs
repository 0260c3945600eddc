//! Process-wide context: the frontend, the two send sockets, the channel
//! registry and the global template. Mutable only during startup, then
//! frozen behind an `Arc` and shared by every thread.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rd_config::ConfigTable;
use rd_output::advertise::Advertiser;
use rd_sdr::Frontend;

use crate::channel::ChannelRegistry;
use crate::template::ChannelTemplate;

pub struct System {
    /// Instance name (-N or the config path).
    pub name: String,
    /// Short hostname, domain stripped.
    pub hostname: String,
    /// Best-guess local IPv4, for SAP origin fields.
    pub local_ip: Ipv4Addr,
    pub description: String,
    pub blocktime_ms: f64,
    pub overlap: usize,
    /// Cadence of unsolicited status broadcasts.
    pub update_interval: Duration,
    pub rtcp_enable: bool,
    pub sap_enable: bool,
    pub use_dns: bool,
    pub iface: Option<String>,
    /// Default output group name for sections without their own.
    pub data_name: String,
    /// Idle lifetime, in blocks, for dynamically created channels.
    pub channel_idle_timeout: u64,
    /// Template dynamic channels inherit.
    pub template: ChannelTemplate,
    pub frontend: Arc<Frontend>,
    /// Send socket with the configured TTL (at least 1).
    pub output: UdpSocket,
    /// Loopback send socket, TTL 0.
    pub output0: UdpSocket,
    pub registry: ChannelRegistry,
    pub advertiser: Advertiser,
    pub presets: ConfigTable,
    pub stop: Arc<AtomicBool>,
    /// Whether the command listener came up.
    pub ctl_active: bool,
    pub start_time: Instant,
    pub nchans: AtomicUsize,
}

impl System {
    /// The shared send socket a stream of the given TTL uses. Exactly two
    /// exist; arbitrary per-channel TTLs are deliberately unsupported.
    pub fn sock_for_ttl(&self, ttl: u32) -> &UdpSocket {
        if ttl == 0 {
            &self.output0
        } else {
            &self.output
        }
    }
}
