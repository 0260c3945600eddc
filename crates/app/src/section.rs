//! The channel factory: one transient thread per channel section, joined
//! before the config tree is released.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rd_config::{ConfigTable, CHANNEL_KEYS};
use rd_output::advertise::{ensure_local_suffix, resolve_group, ServiceType};
use rd_output::multicast::{join_group, resolve_mcast};
use rd_output::rtp::{pt_from_info, Encoding};
use rd_output::{DEFAULT_RTP_PORT, DEFAULT_STAT_PORT, SAP_DEST};
use rd_sdr::freq::{parse_frequency, ssrc_from_token};

use crate::system::System;
use crate::tasks;
use crate::template::build_template;

/// Process one channel section: build its template, advertise its group,
/// then create and start a channel per frequency token. Returns the number
/// of channels started.
pub fn process_section(sys: &Arc<System>, cfg: &ConfigTable, sname: &str) -> usize {
    cfg.validate_section(sname, CHANNEL_KEYS, &[]);

    // "preset" is the descriptive name; "mode" is the legacy spelling.
    let preset = cfg
        .get2_string(sname, "global", "preset")
        .or_else(|| cfg.get2_string(sname, "global", "mode"));
    if preset.is_none() {
        log::warn!(
            "[{}] preset/mode not specified, all parameters must be set explicitly",
            sname
        );
    }

    let mut tpl = build_template(cfg, &sys.presets, sname, &sys.template, preset.as_deref());

    // Output group: the section's own, or the daemon-wide default
    let data_name = ensure_local_suffix(
        &cfg.get_string(sname, "data")
            .unwrap_or_else(|| sys.data_name.clone()),
    );
    let use_dns = cfg.get_bool(sname, "dns", sys.use_dns);
    let group = resolve_group(&data_name, DEFAULT_RTP_PORT, use_dns);
    tpl.data_name = data_name;
    tpl.dest = group.addr;
    tpl.status_dest = {
        let mut a = group.addr;
        a.set_port(DEFAULT_STAT_PORT);
        a
    };
    tpl.pt = pt_from_info(tpl.samprate, tpl.channels, tpl.encoding);

    // Several hosts may carry the same section names; qualify the service
    // instance with ours.
    let instance = format!("{} {}", sys.hostname, sname);
    let stype = if tpl.encoding == Encoding::Opus {
        ServiceType::Opus
    } else {
        ServiceType::Rtp
    };
    sys.advertiser
        .advertise(&instance, stype, DEFAULT_RTP_PORT, tpl.ttl, &group);

    let iface = cfg.get_string(sname, "iface").or_else(|| sys.iface.clone());
    if tpl.ttl != 0 {
        // Snooping-switch workaround: stay joined to our own output group
        join_group(&sys.output, &tpl.dest, iface.as_deref());
    }

    let explicit_ssrc: Option<u32> = cfg.get_string(sname, "ssrc").and_then(|s| {
        s.parse()
            .map_err(|_| log::warn!("[{}] bad ssrc {}", sname, s))
            .ok()
    });

    let sap_dest = if sys.sap_enable {
        resolve_mcast(SAP_DEST, 0, 1)
    } else {
        None
    };
    if let Some(dest) = sap_dest {
        if tpl.ttl != 0 {
            join_group(&sys.output, &dest, iface.as_deref());
        }
    }

    // Frequency lists are split across freq, freq0..freq9 to dodge the
    // INI parser's line-length limit.
    let mut nchans = 0usize;
    for key in freq_keys() {
        let Some(list) = cfg.get_string(sname, &key) else {
            continue;
        };
        for tok in list.split_whitespace() {
            let Some(f) = parse_frequency(tok) else {
                log::warn!("[{}] can't parse frequency {}", sname, tok);
                continue;
            };
            let want = explicit_ssrc.unwrap_or_else(|| ssrc_from_token(tok));
            if want == 0 {
                continue; // reserved
            }
            let Some(chan) = sys.registry.create(want, &tpl, false) else {
                continue; // probe range exhausted, already logged
            };
            chan.set_frequency(f);
            tasks::start_demod(sys, &chan);
            nchans += 1;
            sys.nchans.fetch_add(1, Ordering::Relaxed);

            if let Some(dest) = sap_dest {
                tasks::start_sap(sys, &chan, dest);
            }
            if sys.rtcp_enable {
                tasks::start_rtcp(sys, &chan);
            }
        }
    }
    log::info!("[{}] {} channels started", sname, nchans);
    nchans
}

/// `freq`, then `freq0` through `freq9`.
fn freq_keys() -> impl Iterator<Item = String> {
    std::iter::once("freq".to_string()).chain((0..10).map(|i| format!("freq{}", i)))
}
