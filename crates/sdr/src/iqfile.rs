// Copyright 2025-2026 CEMAXECUTER LLC

//! IQ file playback front end, paced at the configured sample rate so the
//! downstream pipeline sees hardware-like timing.

use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use rd_config::ConfigTable;

use crate::{freq, FrontendDriver, FrontendSetup, SampleBuf};

/// On-disk sample format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Pairs of i8
    Ci8,
    /// Pairs of little-endian i16
    Ci16,
    /// Pairs of little-endian f32
    Cf32,
}

impl SampleFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ci8" => Some(Self::Ci8),
            "ci16" => Some(Self::Ci16),
            "cf32" => Some(Self::Cf32),
            _ => None,
        }
    }

    fn bytes_per_sample(self) -> usize {
        match self {
            Self::Ci8 => 2,
            Self::Ci16 => 4,
            Self::Cf32 => 8,
        }
    }
}

pub struct IqFile {
    path: String,
    format: SampleFormat,
    samprate: u32,
    frequency: f64,
    repeat: bool,
    block_size: usize,
}

impl IqFile {
    pub fn new() -> Self {
        Self {
            path: String::new(),
            format: SampleFormat::Ci16,
            samprate: 0,
            frequency: 0.0,
            repeat: false,
            block_size: 65536,
        }
    }

    /// Decode one block; returns None at end of input.
    fn read_block(
        reader: &mut BufReader<File>,
        format: SampleFormat,
        num_samples: usize,
    ) -> std::io::Result<Option<Vec<i16>>> {
        let mut buf = vec![0u8; num_samples * format.bytes_per_sample()];
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        let out = match format {
            SampleFormat::Ci8 => buf[..n]
                .iter()
                .map(|&b| ((b as i8) as i16) << 8)
                .collect(),
            SampleFormat::Ci16 => buf[..n - n % 2]
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
            SampleFormat::Cf32 => buf[..n - n % 4]
                .chunks_exact(4)
                .map(|c| {
                    let v = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                    (v * 32767.0).clamp(-32768.0, 32767.0) as i16
                })
                .collect(),
        };
        Ok(Some(out))
    }
}

impl Default for IqFile {
    fn default() -> Self {
        Self::new()
    }
}

impl FrontendDriver for IqFile {
    fn setup(
        &mut self,
        out: &mut FrontendSetup,
        cfg: &ConfigTable,
        section: &str,
    ) -> Result<(), String> {
        self.path = cfg
            .get_string(section, "file")
            .ok_or_else(|| format!("[{}] file = required for iqfile", section))?;
        if !std::path::Path::new(&self.path).is_file() {
            return Err(format!("{} is not a readable file", self.path));
        }
        if let Some(f) = cfg.get_string(section, "format") {
            self.format =
                SampleFormat::parse(&f).ok_or_else(|| format!("unknown sample format {}", f))?;
        }
        self.samprate = cfg.get_int(section, "samprate", 0) as u32;
        if self.samprate == 0 {
            return Err(format!("[{}] samprate = required for iqfile", section));
        }
        self.frequency = cfg
            .get_string(section, "frequency")
            .and_then(|tok| freq::parse_frequency(&tok))
            .unwrap_or(0.0);
        self.repeat = cfg.get_bool(section, "repeat", false);

        out.samprate = self.samprate;
        out.isreal = false;
        out.description = cfg
            .get_string(section, "description")
            .unwrap_or_else(|| self.path.clone());
        out.frequency = self.frequency;
        Ok(())
    }

    fn start(&mut self, tx: Sender<SampleBuf>, stop: Arc<AtomicBool>) -> Result<(), String> {
        let path = self.path.clone();
        let format = self.format;
        let samprate = self.samprate;
        let repeat = self.repeat;
        let block_size = self.block_size;

        let file = File::open(&path).map_err(|e| format!("failed to open {}: {}", path, e))?;

        std::thread::Builder::new()
            .name("iqfile".to_string())
            .spawn(move || {
                let mut reader = BufReader::with_capacity(1 << 20, file);
                let block_time = Duration::from_secs_f64(block_size as f64 / samprate as f64);
                let mut next = Instant::now();
                log::info!("reading IQ from {} ({:?}, {} Hz)", path, format, samprate);

                while !stop.load(Ordering::Relaxed) {
                    match Self::read_block(&mut reader, format, block_size) {
                        Ok(Some(data)) => {
                            let num_samples = data.len() / 2;
                            if tx.send(SampleBuf { data, num_samples }).is_err() {
                                break; // receiver dropped
                            }
                            next += block_time;
                            let now = Instant::now();
                            if next > now {
                                std::thread::sleep(next - now);
                            } else {
                                next = now;
                            }
                        }
                        Ok(None) => {
                            if !repeat {
                                log::info!("end of file: {}", path);
                                break;
                            }
                            match File::open(&path) {
                                Ok(f) => reader = BufReader::with_capacity(1 << 20, f),
                                Err(e) => {
                                    log::error!("reopen {}: {}", path, e);
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            log::error!("read error on {}: {}", path, e);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| format!("iqfile thread: {}", e))?;
        Ok(())
    }

    // Playback has no tunable oscillator; the recorded center stands.
    fn tune(&mut self, _freq: f64) -> Result<f64, String> {
        Ok(self.frequency)
    }

    fn has_tune(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_setup_requires_file_and_rate() {
        let cfg =
            ConfigTable::parse("[play]\ndevice = iqfile\nsamprate = 48000\n".to_string()).unwrap();
        let mut drv = IqFile::new();
        let mut out = FrontendSetup::default();
        assert!(drv.setup(&mut out, &cfg, "play").is_err());
    }

    #[test]
    fn test_playback_converts_ci16() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        // Two complex samples: (100, -100), (200, -200)
        for v in [100i16, -100, 200, -200] {
            f.write_all(&v.to_le_bytes()).unwrap();
        }
        let path = f.path().to_string_lossy().to_string();
        let cfg = ConfigTable::parse(format!(
            "[play]\ndevice = iqfile\nfile = {}\nsamprate = 48000\nformat = ci16\n",
            path
        ))
        .unwrap();

        let mut drv = IqFile::new();
        let mut out = FrontendSetup::default();
        drv.setup(&mut out, &cfg, "play").unwrap();
        assert_eq!(out.samprate, 48_000);
        assert!(!drv.has_tune());

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam::channel::bounded(4);
        drv.start(tx, Arc::clone(&stop)).unwrap();
        let buf = rx.recv_timeout(Duration::from_secs(2)).expect("no samples");
        stop.store(true, Ordering::Relaxed);
        assert_eq!(buf.num_samples, 2);
        assert_eq!(buf.data, vec![100, -100, 200, -200]);
    }
}
