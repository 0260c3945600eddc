//! Per-section channel templates and the layering rules that build them.
//!
//! Priority, lowest to highest: compiled-in defaults, the `[global]`
//! section, the named preset recipe, the channel section itself. Each
//! layer overlays only the keys it defines.

use std::net::{Ipv4Addr, SocketAddr};

use rd_config::ConfigTable;
use rd_dsp::demod::DemodKind;
use rd_output::rtp::Encoding;

/// Everything a new channel copies by value at creation time. Holds no
/// heap follow-on state beyond owned strings: sockets, threads and DSP
/// buffers are created by the channel's own start path, never inherited
/// through a template copy.
#[derive(Debug, Clone)]
pub struct ChannelTemplate {
    /// Output group name (DNS-style, advertised).
    pub data_name: String,
    /// Output destination.
    pub dest: SocketAddr,
    /// Per-channel status destination (same group, status port).
    pub status_dest: SocketAddr,
    pub ttl: u32,
    pub samprate: u32,
    pub channels: u8,
    pub encoding: Encoding,
    /// RTP payload type; derived from the three fields above.
    pub pt: u8,
    pub preset: String,
    pub mode: DemodKind,
    /// Idle lifetime in blocks for channels parked at 0 Hz; 0 disables
    /// expiry.
    pub lifetime: u64,
    /// Passband edges relative to the tuned frequency, Hz.
    pub low: f32,
    pub high: f32,
    pub squelch_open: f32,
    pub squelch_close: f32,
    pub gain: f32,
    pub agc: bool,
}

impl Default for ChannelTemplate {
    fn default() -> Self {
        Self {
            data_name: String::new(),
            dest: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            status_dest: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            ttl: 1,
            samprate: 12_000,
            channels: 1,
            encoding: Encoding::S16be,
            pt: 0,
            preset: String::new(),
            mode: DemodKind::Am,
            lifetime: 0,
            low: -5_000.0,
            high: 5_000.0,
            squelch_open: 8.0,
            squelch_close: 7.0,
            gain: 0.0,
            agc: true,
        }
    }
}

/// Overlay the recognized keys of one config section onto a template.
/// Keys the section does not define are left alone, which is what makes
/// the layering order meaningful. Returns Err when the section does not
/// exist so callers can warn and keep going.
pub fn load_preset(
    template: &mut ChannelTemplate,
    table: &ConfigTable,
    section: &str,
) -> Result<(), ()> {
    if !table.has_section(section) {
        return Err(());
    }
    // Preset recipes name the detector with "demod"; channel sections may
    // say "mode", which doubles as a preset name elsewhere.
    if let Some(mode) = table
        .get_string(section, "demod")
        .or_else(|| table.get_string(section, "mode"))
    {
        match DemodKind::from_name(&mode) {
            Some(kind) => template.mode = kind,
            None => log::warn!("[{}] unknown mode {}", section, mode),
        }
    }
    if let Some(rate) = table.get_string(section, "samprate") {
        match rate.parse::<u32>() {
            Ok(r) if r > 0 => template.samprate = r,
            _ => log::warn!("[{}] bad samprate {}", section, rate),
        }
    }
    if let Some(ch) = table.get_string(section, "channels") {
        match ch.parse::<u8>() {
            Ok(c @ 1..=2) => template.channels = c,
            _ => log::warn!("[{}] bad channels {}", section, ch),
        }
    }
    if let Some(enc) = table.get_string(section, "encoding") {
        match enc.parse::<Encoding>() {
            Ok(e) => template.encoding = e,
            Err(e) => log::warn!("[{}] {}", section, e),
        }
    }
    if let Some(ttl) = table.get_string(section, "ttl") {
        match ttl.parse::<u32>() {
            Ok(t) => template.ttl = t,
            _ => log::warn!("[{}] bad ttl {}", section, ttl),
        }
    }
    template.low = table.get_float(section, "low", template.low as f64) as f32;
    template.high = table.get_float(section, "high", template.high as f64) as f32;
    template.squelch_open =
        table.get_float(section, "squelch-open", template.squelch_open as f64) as f32;
    template.squelch_close =
        table.get_float(section, "squelch-close", template.squelch_close as f64) as f32;
    template.gain = table.get_float(section, "gain", template.gain as f64) as f32;
    template.agc = table.get_bool(section, "agc", template.agc);
    Ok(())
}

/// Build a section's template from the four layers. `global_ttl` drives
/// the coercion rule: when both the section and the global config ask for
/// a non-zero TTL, the global value wins, because the process maintains
/// exactly two send sockets (TTL=0 and one TTL>0).
pub fn build_template(
    cfg: &ConfigTable,
    presets: &ConfigTable,
    section: &str,
    global: &ChannelTemplate,
    preset_name: Option<&str>,
) -> ChannelTemplate {
    let mut tpl = ChannelTemplate::default();
    let _ = load_preset(&mut tpl, cfg, "global");

    if let Some(preset) = preset_name {
        if load_preset(&mut tpl, presets, preset).is_err() {
            log::warn!(
                "[{}] preset {} not found; defaults and local settings used",
                section,
                preset
            );
        } else {
            tpl.preset = preset.to_string();
        }
    }

    let _ = load_preset(&mut tpl, cfg, section);

    if tpl.ttl != 0 && global.ttl != 0 {
        tpl.ttl = global.ttl;
    }
    tpl.lifetime = 0; // static channels never idle out
    tpl
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(cfg: &str, presets: &str) -> (ConfigTable, ConfigTable) {
        (
            ConfigTable::parse(cfg.to_string()).unwrap(),
            ConfigTable::parse(presets.to_string()).unwrap(),
        )
    }

    #[test]
    fn test_layer_priority_section_wins() {
        let (cfg, presets) = tables(
            "[global]\nsamprate = 24000\nttl = 0\n[hf]\nsamprate = 48000\n",
            "[usb]\nsamprate = 12000\nmode = usb\n",
        );
        let global = ChannelTemplate::default();
        let tpl = build_template(&cfg, &presets, "hf", &global, Some("usb"));
        // section > preset > global
        assert_eq!(tpl.samprate, 48_000);
        assert_eq!(tpl.mode, DemodKind::Linear);
    }

    #[test]
    fn test_layer_priority_preset_over_global() {
        let (cfg, presets) = tables(
            "[global]\nsamprate = 24000\nttl = 0\n[hf]\nfreq = 7M2\n",
            "[am]\nsamprate = 12000\n",
        );
        let global = ChannelTemplate::default();
        let tpl = build_template(&cfg, &presets, "hf", &global, Some("am"));
        assert_eq!(tpl.samprate, 12_000);
        assert_eq!(tpl.preset, "am");
    }

    #[test]
    fn test_untouched_keys_fall_to_defaults() {
        let (cfg, presets) = tables("[global]\nttl = 0\n[hf]\nfreq = 7M2\n", "[am]\n");
        let global = ChannelTemplate::default();
        let tpl = build_template(&cfg, &presets, "hf", &global, None);
        let d = ChannelTemplate::default();
        assert_eq!(tpl.samprate, d.samprate);
        assert_eq!(tpl.channels, d.channels);
        assert_eq!(tpl.encoding, d.encoding);
    }

    #[test]
    fn test_unknown_preset_layer_skipped() {
        let (cfg, presets) = tables(
            "[global]\nttl = 0\n[hf]\nsamprate = 48000\n",
            "[am]\nsamprate = 12000\n",
        );
        let global = ChannelTemplate::default();
        let tpl = build_template(&cfg, &presets, "hf", &global, Some("nosuch"));
        assert_eq!(tpl.samprate, 48_000);
        assert!(tpl.preset.is_empty());
    }

    #[test]
    fn test_ttl_coercion_to_global() {
        let (cfg, presets) = tables("[global]\nttl = 2\n[hf]\nttl = 4\n", "[am]\n");
        let mut global = ChannelTemplate::default();
        global.ttl = 2;
        let tpl = build_template(&cfg, &presets, "hf", &global, None);
        assert_eq!(tpl.ttl, 2);
    }

    #[test]
    fn test_ttl_zero_section_not_coerced() {
        let (cfg, presets) = tables("[global]\nttl = 2\n[hf]\nttl = 0\n", "[am]\n");
        let mut global = ChannelTemplate::default();
        global.ttl = 2;
        let tpl = build_template(&cfg, &presets, "hf", &global, None);
        assert_eq!(tpl.ttl, 0);
    }
}
