//! Startup orchestration: load the layered config, bind the front end,
//! open the shared output sockets, start the status endpoint, and fan out
//! the channel factory.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rd_config::{ConfigTable, CHANNEL_KEYS, GLOBAL_KEYS};
use rd_output::advertise::{ensure_local_suffix, resolve_group, Advertiser, ServiceType};
use rd_output::multicast::{join_group, listen_mcast, output_mcast};
use rd_output::rtp::pt_from_info;
use rd_output::{DEFAULT_RTP_PORT, DEFAULT_STAT_PORT};
use rd_sdr::bind_frontend;

use crate::channel::ChannelRegistry;
use crate::section::process_section;
use crate::status;
use crate::system::System;
use crate::template::{load_preset, ChannelTemplate};
use crate::{exitcode, main_verbosity_add};

const DEFAULT_PRESET: &str = "am";
const DEFAULT_BLOCKTIME: f64 = 20.0;
const DEFAULT_OVERLAP: i64 = 5;
/// AF12, left-shifted into the TOS byte.
const DEFAULT_IP_TOS: i64 = 48;
/// Status summary cadence, in blocks.
const DEFAULT_UPDATE: i64 = 25;
/// Idle seconds before a 0 Hz dynamic channel is destroyed.
const DEFAULT_LIFETIME_SECS: f64 = 20.0;

const FFT_PLAN_LEVELS: &[&str] = &["estimate", "measure", "patient", "exhaustive", "wisdom-only"];

/// Data directory searched for the presets file.
const DATA_DIR: &str = "/usr/local/share/radiod";

/// Fatal startup failures, each mapped to its process exit code.
#[derive(Debug)]
pub enum Fatal {
    Usage(String),
    NoInput(String),
    NoHost(String),
    Unavailable(String),
}

impl Fatal {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => exitcode::USAGE,
            Self::NoInput(_) => exitcode::NOINPUT,
            Self::NoHost(_) => exitcode::NOHOST,
            Self::Unavailable(_) => exitcode::UNAVAILABLE,
        }
    }
}

impl std::fmt::Display for Fatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usage(m) | Self::NoInput(m) | Self::NoHost(m) | Self::Unavailable(m) => {
                write!(f, "{}", m)
            }
        }
    }
}

/// Load the config, bring the whole receiver up, and return the frozen
/// system context plus the number of static channels started. The config
/// tree dies at the end of this function, after every factory thread has
/// joined.
pub fn load_and_start(
    config_path: &Path,
    name: &str,
    fft_time_limit_cli: Option<f64>,
) -> Result<(Arc<System>, usize), Fatal> {
    let cfg = ConfigTable::load(config_path)
        .map_err(|e| Fatal::NoInput(format!("can't load config {}: {}", config_path.display(), e)))?;

    cfg.validate_section("global", GLOBAL_KEYS, CHANNEL_KEYS);

    main_verbosity_add(cfg.get_int("global", "verbose", 0) as i32);

    let blocktime_ms = cfg.get_float("global", "blocktime", DEFAULT_BLOCKTIME).abs();
    if blocktime_ms <= 0.0 {
        return Err(Fatal::Usage("blocktime must be positive".to_string()));
    }
    let overlap = cfg.get_int("global", "overlap", DEFAULT_OVERLAP).unsigned_abs() as usize;
    let channel_idle_timeout = (DEFAULT_LIFETIME_SECS * 1000.0 / blocktime_ms) as u64;

    let rtcp_enable = cfg.get_bool("global", "rtcp", false);
    let sap_enable = cfg.get_bool("global", "sap", false);
    let use_dns = cfg.get_bool("global", "dns", false);
    let static_advertise = cfg.get_bool("global", "static", false);
    let update_blocks = cfg.get_int("global", "update", DEFAULT_UPDATE).max(1);
    let ip_tos = cfg.get_int("global", "tos", DEFAULT_IP_TOS) as i32;
    let iface = cfg.get_string("global", "iface");

    if cfg.get_bool("global", "affinity", false) {
        log::info!("affinity pinning requested; left to the service manager");
    }

    // FFT planning knobs are accepted for config compatibility; the FFT
    // library plans adaptively and ignores them.
    let plan_level = cfg
        .get_string("global", "fft-plan-level")
        .unwrap_or_else(|| "patient".to_string());
    if !FFT_PLAN_LEVELS.contains(&plan_level.to_lowercase().as_str()) {
        log::warn!("unknown fft-plan-level {}", plan_level);
    }
    let fft_threads = cfg.get_int("global", "fft-threads", 1);
    let fft_time_limit =
        fft_time_limit_cli.unwrap_or_else(|| cfg.get_float("global", "fft-time-limit", 0.0));
    if fft_threads != 1 || fft_time_limit != 0.0 {
        log::info!(
            "fft plan: level={} threads={} time-limit={}",
            plan_level,
            fft_threads,
            fft_time_limit
        );
    }
    if let Some(w) = cfg.get_string("global", "wisdom-file") {
        log::info!("wisdom-file {} noted; planner keeps no wisdom", w);
    }

    // Presets: legacy "mode-file", preferred "presets-file"
    let presets_name = cfg
        .get_string("global", "presets-file")
        .or_else(|| cfg.get_string("global", "mode-file"))
        .unwrap_or_else(|| "presets.conf".to_string());
    let presets_path = dist_path(&presets_name, config_path);
    log::info!("loading presets file {}", presets_path.display());
    let presets = ConfigTable::load(&presets_path).map_err(|e| {
        Fatal::Unavailable(format!("can't load presets {}: {}", presets_path.display(), e))
    })?;
    presets.validate_all(CHANNEL_KEYS, &[]);

    let hostname = short_hostname();

    // The front end comes up early so a broken device fails fast
    let hardware = cfg
        .get_string("global", "hardware")
        .ok_or_else(|| Fatal::Usage("'hardware = [sectionname]' is required".to_string()))?;
    if !cfg.has_section(&hardware) {
        return Err(Fatal::Usage(format!(
            "no hardware section [{}] found, please create it",
            hardware
        )));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let frontend = bind_frontend(&cfg, &hardware, blocktime_ms, overlap, Arc::clone(&stop))
        .map_err(|e| Fatal::NoInput(format!("frontend: {}", e)))?;

    let description = cfg
        .get_string("global", "description")
        .or_else(|| {
            if frontend.description.is_empty() {
                None
            } else {
                Some(frontend.description.clone())
            }
        })
        .unwrap_or_else(|| name.to_string());

    // Default group names are derived from the instance name
    let data_name = ensure_local_suffix(
        &cfg.get_string("global", "data")
            .unwrap_or_else(|| format!("{}-pcm", name)),
    );
    let status_name = ensure_local_suffix(
        &cfg.get_string("global", "status")
            .unwrap_or_else(|| format!("{}-{}", hostname, name)),
    );
    if data_name == status_name {
        return Err(Fatal::Usage(format!(
            "duplicate status/data stream names: data={}, status={}",
            data_name, status_name
        )));
    }

    // Template for dynamically created channels
    let mut template = ChannelTemplate::default();
    template.lifetime = channel_idle_timeout;
    let preset = cfg
        .get_string("global", "preset")
        .or_else(|| cfg.get_string("global", "mode"))
        .unwrap_or_else(|| DEFAULT_PRESET.to_string());
    if load_preset(&mut template, &presets, &preset).is_err() {
        log::warn!("[global] preset {} not in {}", preset, presets_path.display());
    } else {
        template.preset = preset.clone();
    }
    let _ = load_preset(&mut template, &cfg, "global");

    let advertiser = Advertiser::new(!static_advertise);

    // Default data group for dynamic channels
    let data_group = resolve_group(&data_name, DEFAULT_RTP_PORT, use_dns);
    template.data_name = data_name.clone();
    template.dest = data_group.addr;
    template.status_dest = {
        let mut a = data_group.addr;
        a.set_port(DEFAULT_STAT_PORT);
        a
    };
    template.pt = pt_from_info(template.samprate, template.channels, template.encoding);
    advertiser.advertise(
        &description,
        ServiceType::Rtp,
        DEFAULT_RTP_PORT,
        template.ttl,
        &data_group,
    );

    // Status/command group, shared by every channel
    let status_group = resolve_group(&status_name, DEFAULT_STAT_PORT, use_dns);
    advertiser.advertise(
        &description,
        ServiceType::Control,
        DEFAULT_STAT_PORT,
        template.ttl.max(1),
        &status_group,
    );
    frontend
        .metadata_dest
        .set(status_group.addr)
        .expect("metadata destination set once");

    // The two process-wide send sockets: configured TTL (floor 1) and
    // TTL=0 loopback.
    let ttl = template.ttl.max(1);
    let output = output_mcast(iface.as_deref(), ttl, ip_tos)
        .map_err(|e| Fatal::NoHost(format!("can't create output socket for TTL={}: {}", ttl, e)))?;
    join_group(&output, &data_group.addr, iface.as_deref());
    let output0 = output_mcast(iface.as_deref(), 0, ip_tos)
        .map_err(|e| Fatal::NoHost(format!("can't create output socket for TTL=0: {}", e)))?;
    join_group(&output, &status_group.addr, iface.as_deref());

    // Command listener; losing it degrades service but doesn't kill it
    let ctl = match listen_mcast(&status_group.addr, iface.as_deref()) {
        Ok(sock) => Some(sock),
        Err(e) => {
            log::error!(
                "can't listen for commands on {}: {}; no control channel",
                status_name,
                e
            );
            None
        }
    };

    let update_interval =
        Duration::from_secs_f64(update_blocks as f64 * blocktime_ms / 1000.0);

    let sys = Arc::new(System {
        name: name.to_string(),
        hostname,
        local_ip: local_ip(&data_group.addr),
        description,
        blocktime_ms,
        overlap,
        update_interval,
        rtcp_enable,
        sap_enable,
        use_dns,
        iface,
        data_name,
        channel_idle_timeout,
        template,
        frontend,
        output,
        output0,
        registry: ChannelRegistry::default(),
        advertiser,
        presets,
        stop,
        ctl_active: ctl.is_some(),
        start_time: Instant::now(),
        nchans: AtomicUsize::new(0),
    });

    if let Some(ctl) = ctl {
        status::start(&sys, ctl);
    }

    // Channel factory fan-out: one transient thread per channel section,
    // all joined here, which is what lets the config tree die below.
    let hardware_lc = hardware.to_lowercase();
    let nchans = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for sname in cfg.sections() {
            if sname == "global" || sname == hardware_lc {
                continue;
            }
            if cfg.get_string(&sname, "device").is_some() {
                continue; // another front end, not a channel section
            }
            if cfg.get_bool(&sname, "disable", false) {
                continue;
            }
            let sys = &sys;
            let cfg = &cfg;
            handles.push(scope.spawn(move || process_section(sys, cfg, &sname)));
        }
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(0))
            .sum::<usize>()
    });

    drop(cfg); // read-only phase over; channels keep only their copies
    Ok((sys, nchans))
}

/// Resolve the presets file: absolute and working-directory paths stand,
/// then the config file's directory, then the distribution data dir.
fn dist_path(name: &str, config_path: &Path) -> PathBuf {
    let p = Path::new(name);
    if p.is_absolute() || p.is_file() {
        return p.to_path_buf();
    }
    if let Some(dir) = config_path.parent() {
        let beside = dir.join(name);
        if beside.is_file() {
            return beside;
        }
    }
    Path::new(DATA_DIR).join(name)
}

/// Hostname with any domain part removed.
fn short_hostname() -> String {
    let raw = std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string());
    raw.split('.').next().unwrap_or("localhost").to_string()
}

/// The local address the kernel would route multicast through; origin
/// field for SAP. Connect on a throwaway socket sends nothing.
fn local_ip(probe: &std::net::SocketAddr) -> Ipv4Addr {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| {
            s.connect(probe)?;
            s.local_addr()
        })
        .ok()
        .and_then(|a| match a {
            std::net::SocketAddr::V4(v4) => Some(*v4.ip()),
            _ => None,
        })
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::Ordering;

    fn write_conf(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn presets_body() -> &'static str {
        "[am]\ndemod = am\nsamprate = 12000\nchannels = 1\n\
         [usb]\ndemod = usb\nsamprate = 12000\n\
         [iq]\ndemod = iq\nsamprate = 16000\nchannels = 2\n"
    }

    #[test]
    fn test_missing_hardware_key_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), "presets.conf", presets_body());
        let conf = write_conf(
            dir.path(),
            "radiod@test.conf",
            "[global]\ndata = test-pcm\n[gen]\ndevice = sig_gen\nsamprate = 16000\n",
        );
        match load_and_start(&conf, "test", None) {
            Err(f @ Fatal::Usage(_)) => assert_eq!(f.exit_code(), exitcode::USAGE),
            other => panic!("expected usage error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_missing_hardware_section_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), "presets.conf", presets_body());
        let conf = write_conf(
            dir.path(),
            "radiod@test.conf",
            "[global]\nhardware = rx888\n",
        );
        assert!(matches!(
            load_and_start(&conf, "test", None),
            Err(Fatal::Usage(_))
        ));
    }

    #[test]
    fn test_missing_presets_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let conf = write_conf(
            dir.path(),
            "radiod@test.conf",
            "[global]\nhardware = gen\npresets-file = nosuch.conf\n[gen]\ndevice = sig_gen\nsamprate = 16000\n",
        );
        match load_and_start(&conf, "test", None) {
            Err(f @ Fatal::Unavailable(_)) => {
                assert_eq!(f.exit_code(), exitcode::UNAVAILABLE)
            }
            other => panic!("expected unavailable, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_missing_config_is_noinput() {
        match load_and_start(Path::new("/nonexistent/radiod.conf"), "test", None) {
            Err(f @ Fatal::NoInput(_)) => assert_eq!(f.exit_code(), exitcode::NOINPUT),
            other => panic!("expected noinput, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_duplicate_data_status_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), "presets.conf", presets_body());
        let conf = write_conf(
            dir.path(),
            "radiod@test.conf",
            "[global]\nhardware = gen\ndata = same.local\nstatus = same.local\n\
             [gen]\ndevice = sig_gen\nsamprate = 16000\n",
        );
        assert!(matches!(
            load_and_start(&conf, "test", None),
            Err(Fatal::Usage(_))
        ));
    }

    #[test]
    fn test_full_startup_single_static_channel() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), "presets.conf", presets_body());
        let conf = write_conf(
            dir.path(),
            "radiod@test.conf",
            "[global]\nhardware = gen\ndata = test-pcm.local\nstatic = yes\n\
             blocktime = 20\noverlap = 5\n\
             [gen]\ndevice = sig_gen\nsamprate = 16000\ntone = 1000\n\
             [hf]\npreset = usb\nfreq = 7200000\n",
        );
        let (sys, nchans) = load_and_start(&conf, "test", None).expect("startup");
        assert_eq!(nchans, 1);
        assert_eq!(sys.frontend.filter.params.l, 320);
        assert_eq!(sys.frontend.filter.params.m, 81);
        assert_eq!(sys.frontend.filter.params.n, 400);
        let chan = sys.registry.get(7_200_000).expect("channel 7200000");
        assert_eq!(chan.frequency(), 7_200_000.0);
        assert!(!chan.dynamic);
        sys.stop.store(true, Ordering::Relaxed);
    }

    #[test]
    fn test_ssrc_collision_and_override_scenarios() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), "presets.conf", presets_body());
        let conf = write_conf(
            dir.path(),
            "radiod@test.conf",
            "[global]\nhardware = gen\ndata = col-pcm.local\nstatic = yes\n\
             [gen]\ndevice = sig_gen\nsamprate = 16000\n\
             [forty]\npreset = am\nfreq = 7200000 7200000\n\
             [pinned]\npreset = am\ndata = pin-pcm.local\nfreq = 7.2M\nssrc = 42\n\
             [zero]\npreset = am\ndata = zero-pcm.local\nfreq = 0\n",
        );
        let (sys, nchans) = load_and_start(&conf, "test", None).expect("startup");
        // forty: collision resolved by increment; pinned: explicit ssrc;
        // zero: reserved ssrc skipped entirely
        assert_eq!(nchans, 3);
        let ssrcs = sys.registry.ssrcs();
        assert!(ssrcs.contains(&7_200_000));
        assert!(ssrcs.contains(&7_200_001));
        assert!(ssrcs.contains(&42));
        assert!(!ssrcs.contains(&0));
        sys.stop.store(true, Ordering::Relaxed);
    }

    #[test]
    fn test_directory_config_matches_concatenation() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), "presets.conf", presets_body());
        let confd = dir.path().join("radiod@split.conf.d");
        std::fs::create_dir(&confd).unwrap();
        write_conf(
            &confd,
            "00-global.conf",
            "[global]\nhardware = gen\ndata = split-pcm.local\nstatic = yes\n\
             [gen]\ndevice = sig_gen\nsamprate = 16000\n",
        );
        write_conf(
            &confd,
            "10-section.conf",
            "[hf]\npreset = am\nfreq = 7200000 14313000\n",
        );
        // presets.conf lives beside the .d directory's stem
        let stem = dir.path().join("radiod@split.conf");
        let (sys, nchans) = load_and_start(&stem, "split", None).expect("startup");
        assert_eq!(nchans, 2);
        sys.stop.store(true, Ordering::Relaxed);
    }

    #[test]
    fn test_disabled_and_frontend_sections_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), "presets.conf", presets_body());
        let conf = write_conf(
            dir.path(),
            "radiod@test.conf",
            "[global]\nhardware = gen\ndata = skip-pcm.local\nstatic = yes\n\
             [gen]\ndevice = sig_gen\nsamprate = 16000\n\
             [other-fe]\ndevice = rx888\n\
             [off]\npreset = am\ndisable = yes\nfreq = 7200000\n",
        );
        let (sys, nchans) = load_and_start(&conf, "test", None).expect("startup");
        assert_eq!(nchans, 0);
        assert!(sys.registry.is_empty());
        sys.stop.store(true, Ordering::Relaxed);
    }
}
