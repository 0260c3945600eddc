// Copyright 2025-2026 CEMAXECUTER LLC

//! RF front ends: the capability trait every driver satisfies, the process
//! Frontend record, and the binder that wires a driver to the shared input
//! filter.

pub mod dynlib;
pub mod freq;
pub mod iqfile;
pub mod sig_gen;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use crossbeam::channel::{bounded, Sender};
use thiserror::Error;

use rd_config::ConfigTable;
use rd_dsp::filter::{iq_to_complex, real_to_complex, FilterExecutor, FilterInput, FilterKind};
use rd_dsp::{DspError, FilterParams};

/// Directory searched for `<device>.so` driver modules.
pub const SODIR: &str = "/usr/local/lib/radiod";

/// Sample buffer: a block of interleaved int16 IQ samples (or bare real
/// samples when the frontend is real).
pub struct SampleBuf {
    pub data: Vec<i16>,
    /// Number of complex samples (data.len() / 2), or real samples for a
    /// real frontend.
    pub num_samples: usize,
}

/// Values a driver's `setup` must populate before the filter can be sized.
#[derive(Debug, Default, Clone)]
pub struct FrontendSetup {
    pub samprate: u32,
    pub isreal: bool,
    pub description: String,
    pub frequency: f64,
}

/// Capability set every front end satisfies. `setup`, `start` and `tune`
/// are required; `gain` and `atten` are optional and default to
/// not-supported. Statically linked and dynamically loaded drivers go
/// through the same trait; only bind time distinguishes them.
pub trait FrontendDriver: Send {
    /// Read the hardware section, open the device, fill in `FrontendSetup`.
    fn setup(&mut self, out: &mut FrontendSetup, cfg: &ConfigTable, section: &str)
        -> Result<(), String>;

    /// Begin streaming sample buffers into `tx` until `stop` is raised.
    /// Spawns the driver's own producer thread and returns.
    fn start(&mut self, tx: Sender<SampleBuf>, stop: Arc<AtomicBool>) -> Result<(), String>;

    /// Retune; returns the frequency actually set.
    fn tune(&mut self, freq: f64) -> Result<f64, String>;

    /// Whether `tune` does anything. Dynamic drivers without a tune symbol
    /// report false and the binder warns once.
    fn has_tune(&self) -> bool {
        true
    }

    fn gain(&mut self, _db: f32) -> Option<f32> {
        None
    }

    fn atten(&mut self, _db: f32) -> Option<f32> {
        None
    }
}

/// Frontend status fields, guarded by `Frontend::status`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrontendStatus {
    pub blocks: u64,
    pub samples: u64,
    pub overranges: u64,
}

/// The one-per-process front end record. Immutable after bind except the
/// status fields under their mutex and the tunable frequency.
pub struct Frontend {
    pub samprate: u32,
    pub isreal: bool,
    pub description: String,
    pub spurs: Vec<f64>,
    pub filter: Arc<FilterInput>,
    /// Status/command group; resolved by the advertiser after bind.
    pub metadata_dest: OnceLock<SocketAddr>,
    status: Mutex<FrontendStatus>,
    status_cond: Condvar,
    frequency: AtomicU64,
    driver: Mutex<Box<dyn FrontendDriver>>,
}

impl Frontend {
    pub fn frequency(&self) -> f64 {
        f64::from_bits(self.frequency.load(Ordering::Relaxed))
    }

    /// Retune the hardware. A tune-less driver was already warned about at
    /// bind time; later calls are quiet no-ops.
    pub fn tune(&self, freq: f64) -> Result<f64, String> {
        let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
        if !driver.has_tune() {
            return Ok(self.frequency());
        }
        let actual = driver.tune(freq)?;
        self.frequency.store(actual.to_bits(), Ordering::Relaxed);
        Ok(actual)
    }

    pub fn set_gain(&self, db: f32) -> Option<f32> {
        self.driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .gain(db)
    }

    pub fn set_atten(&self, db: f32) -> Option<f32> {
        self.driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .atten(db)
    }

    pub fn status(&self) -> FrontendStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for the capture thread to publish a status update.
    pub fn wait_status(&self, timeout: std::time::Duration) -> FrontendStatus {
        let guard = self.status.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .status_cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

#[derive(Error, Debug)]
pub enum BindError {
    #[error("no hardware section [{0}]")]
    NoSection(String),

    #[error("driver load failed for device {device}: {reason}")]
    Load { device: String, reason: String },

    #[error("device {device} setup failed: {reason}")]
    Setup { device: String, reason: String },

    #[error("device {device} start failed: {reason}")]
    Start { device: String, reason: String },

    #[error("device {device} reported no sample rate")]
    NoSampleRate { device: String },

    #[error(transparent)]
    Dsp(#[from] DspError),
}

/// Resolve a driver for `device`: the built-in table first, then a shared
/// library at `<sodir>/<device>.so` (overridable with `library =`).
fn resolve_driver(
    device: &str,
    cfg: &ConfigTable,
    section: &str,
) -> Result<Box<dyn FrontendDriver>, BindError> {
    match device.to_lowercase().as_str() {
        "sig_gen" => return Ok(Box::new(sig_gen::SigGen::new())),
        "iqfile" => return Ok(Box::new(iqfile::IqFile::new())),
        _ => {}
    }
    let default_path = PathBuf::from(SODIR).join(format!("{device}.so"));
    let path = cfg
        .get_string(section, "library")
        .map(PathBuf::from)
        .unwrap_or(default_path);
    log::info!("loading {} hardware driver from {}", device, path.display());
    let driver = dynlib::DynDriver::load(device, &path).map_err(|reason| BindError::Load {
        device: device.to_string(),
        reason,
    })?;
    if !driver.has_tune() {
        log::warn!("driver {} has no tune entry point", device);
    }
    Ok(Box::new(driver))
}

/// Bind the front end named by the hardware section and start it.
///
/// Order matters: `setup` reports the sample rate, the filter is sized from
/// it, and only then does `start` spawn the capture path, so the first
/// demodulator can never observe an unsized filter.
pub fn bind_frontend(
    cfg: &ConfigTable,
    section: &str,
    blocktime_ms: f64,
    overlap: usize,
    stop: Arc<AtomicBool>,
) -> Result<Arc<Frontend>, BindError> {
    if !cfg.has_section(section) {
        return Err(BindError::NoSection(section.to_string()));
    }
    let device = cfg
        .get_string(section, "device")
        .unwrap_or_else(|| section.to_string());

    let mut driver = resolve_driver(&device, cfg, section)?;

    let mut setup = FrontendSetup::default();
    driver
        .setup(&mut setup, cfg, section)
        .map_err(|reason| BindError::Setup {
            device: device.clone(),
            reason,
        })?;
    if setup.samprate == 0 {
        return Err(BindError::NoSampleRate { device });
    }

    let params = FilterParams::new(setup.samprate, blocktime_ms, overlap)?;
    log::info!(
        "frontend {}: {} Hz {}, L={} M={} N={}",
        device,
        setup.samprate,
        if setup.isreal { "real" } else { "complex" },
        params.l,
        params.m,
        params.n
    );

    let kind = if setup.isreal {
        FilterKind::Real
    } else {
        FilterKind::Complex
    };
    let filter = FilterInput::new(params, kind, setup.samprate);

    let spurs = parse_spurs(cfg, section);

    let frontend = Arc::new(Frontend {
        samprate: setup.samprate,
        isreal: setup.isreal,
        description: setup.description.clone(),
        spurs: spurs.clone(),
        filter: Arc::clone(&filter),
        metadata_dest: OnceLock::new(),
        status: Mutex::new(FrontendStatus::default()),
        status_cond: Condvar::new(),
        frequency: AtomicU64::new(setup.frequency.to_bits()),
        driver: Mutex::new(driver),
    });

    start_capture(&frontend, filter, spurs, stop)?;
    Ok(frontend)
}

/// Space-separated spur frequencies from the hardware section.
fn parse_spurs(cfg: &ConfigTable, section: &str) -> Vec<f64> {
    let Some(list) = cfg.get_string(section, "spurs") else {
        return Vec::new();
    };
    list.split_whitespace()
        .filter_map(|tok| match freq::parse_frequency(tok) {
            Some(f) => Some(f),
            None => {
                log::warn!("[{}] can't parse spur {}", section, tok);
                None
            }
        })
        .collect()
}

/// Start the driver pump and the capture/FFT thread that feeds the shared
/// filter and signals the frontend status pair once per block.
fn start_capture(
    frontend: &Arc<Frontend>,
    filter: Arc<FilterInput>,
    spurs: Vec<f64>,
    stop: Arc<AtomicBool>,
) -> Result<(), BindError> {
    let (tx, rx) = bounded::<SampleBuf>(64);
    {
        let mut driver = frontend.driver.lock().unwrap_or_else(|e| e.into_inner());
        driver
            .start(tx, Arc::clone(&stop))
            .map_err(|reason| BindError::Start {
                device: frontend.description.clone(),
                reason,
            })?;
    }

    let fe = Arc::clone(frontend);
    std::thread::Builder::new()
        .name("fft in".to_string())
        .spawn(move || {
            let mut exec = FilterExecutor::new(filter, &spurs);
            for buf in rx.iter() {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let samples = if fe.isreal {
                    real_to_complex(&buf.data)
                } else {
                    iq_to_complex(&buf.data)
                };
                let blocks = exec.ingest(&samples);
                let mut status = fe.status.lock().unwrap_or_else(|e| e.into_inner());
                status.samples += buf.num_samples as u64;
                if blocks > 0 {
                    status.blocks += blocks as u64;
                    fe.status_cond.notify_all();
                }
            }
            log::info!("capture thread exiting");
        })
        .map_err(|e| BindError::Start {
            device: frontend.description.clone(),
            reason: e.to_string(),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cfg(src: &str) -> ConfigTable {
        ConfigTable::parse(src.to_string()).unwrap()
    }

    #[test]
    fn test_bind_missing_section_fails() {
        let c = cfg("[global]\nhardware = rx888\n");
        let stop = Arc::new(AtomicBool::new(false));
        assert!(matches!(
            bind_frontend(&c, "rx888", 20.0, 5, stop),
            Err(BindError::NoSection(_))
        ));
    }

    #[test]
    fn test_bind_sig_gen_streams_blocks() {
        let c = cfg("[gen]\ndevice = sig_gen\nsamprate = 16000\ntone = 1000\n");
        let stop = Arc::new(AtomicBool::new(false));
        let fe = bind_frontend(&c, "gen", 20.0, 5, Arc::clone(&stop)).expect("bind");
        assert_eq!(fe.samprate, 16_000);
        assert_eq!(fe.filter.params.l, 320);

        // The generator must push at least one FFT block through promptly
        let got = fe.filter.wait_block(0, Duration::from_secs(5));
        let (seq, bins) = got.expect("no block from sig_gen");
        assert!(seq >= 1);
        assert_eq!(bins.len(), 400);

        // The capture thread signals the status pair as blocks land
        let status = fe.wait_status(Duration::from_secs(5));
        stop.store(true, Ordering::Relaxed);
        assert!(status.blocks >= 1);
        assert!(status.samples >= 320);
    }

    #[test]
    fn test_spur_list_parsed_from_section() {
        let c = cfg("[rx]\ndevice = sig_gen\nspurs = 1k 2000 junk\n");
        let spurs = parse_spurs(&c, "rx");
        assert_eq!(spurs, vec![1_000.0, 2_000.0]);
    }
}
