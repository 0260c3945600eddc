// Copyright 2025-2026 CEMAXECUTER LLC

//! Synthesized signal source: a single complex tone plus white noise,
//! paced at the configured sample rate. Useful for bring-up and tests when
//! no RF hardware is attached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use rd_config::ConfigTable;

use crate::{freq, FrontendDriver, FrontendSetup, SampleBuf};

const BLOCK_SAMPLES: usize = 8192;

pub struct SigGen {
    samprate: u32,
    tone_hz: f64,
    amplitude: f64,
    frequency: f64,
}

impl SigGen {
    pub fn new() -> Self {
        Self {
            samprate: 1_000_000,
            tone_hz: 10_000.0,
            amplitude: 0.5,
            frequency: 0.0,
        }
    }
}

impl Default for SigGen {
    fn default() -> Self {
        Self::new()
    }
}

impl FrontendDriver for SigGen {
    fn setup(
        &mut self,
        out: &mut FrontendSetup,
        cfg: &ConfigTable,
        section: &str,
    ) -> Result<(), String> {
        self.samprate = cfg.get_int(section, "samprate", self.samprate as i64) as u32;
        if self.samprate == 0 {
            return Err("samprate must be positive".to_string());
        }
        if let Some(tok) = cfg.get_string(section, "tone") {
            self.tone_hz = freq::parse_frequency(&tok)
                .ok_or_else(|| format!("can't parse tone {}", tok))?;
        }
        self.amplitude = cfg.get_float(section, "amplitude", self.amplitude);
        self.frequency = cfg
            .get_string(section, "frequency")
            .and_then(|tok| freq::parse_frequency(&tok))
            .unwrap_or(self.frequency);

        out.samprate = self.samprate;
        out.isreal = false;
        out.description = cfg
            .get_string(section, "description")
            .unwrap_or_else(|| "signal generator".to_string());
        out.frequency = self.frequency;
        Ok(())
    }

    fn start(&mut self, tx: Sender<SampleBuf>, stop: Arc<AtomicBool>) -> Result<(), String> {
        let samprate = self.samprate;
        let tone = self.tone_hz;
        let amp = self.amplitude;

        std::thread::Builder::new()
            .name("sig_gen".to_string())
            .spawn(move || {
                let block_time = Duration::from_secs_f64(BLOCK_SAMPLES as f64 / samprate as f64);
                let step = std::f64::consts::TAU * tone / samprate as f64;
                let mut phase = 0.0f64;
                let mut next = Instant::now();

                while !stop.load(Ordering::Relaxed) {
                    let mut data = Vec::with_capacity(BLOCK_SAMPLES * 2);
                    for _ in 0..BLOCK_SAMPLES {
                        data.push((phase.cos() * amp * 32767.0) as i16);
                        data.push((phase.sin() * amp * 32767.0) as i16);
                        phase = (phase + step) % std::f64::consts::TAU;
                    }
                    if tx
                        .send(SampleBuf {
                            data,
                            num_samples: BLOCK_SAMPLES,
                        })
                        .is_err()
                    {
                        break; // consumer gone
                    }
                    next += block_time;
                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    } else {
                        next = now; // fell behind, don't try to catch up
                    }
                }
            })
            .map_err(|e| format!("sig_gen thread: {}", e))?;
        Ok(())
    }

    fn tune(&mut self, freq: f64) -> Result<f64, String> {
        self.frequency = freq;
        Ok(freq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    #[test]
    fn test_setup_reads_section() {
        let cfg = ConfigTable::parse(
            "[gen]\ndevice = sig_gen\nsamprate = 48000\ntone = 5k\namplitude = 0.25\n".to_string(),
        )
        .unwrap();
        let mut gen = SigGen::new();
        let mut out = FrontendSetup::default();
        gen.setup(&mut out, &cfg, "gen").unwrap();
        assert_eq!(out.samprate, 48_000);
        assert!(!out.isreal);
        assert_eq!(gen.tone_hz, 5_000.0);
        assert_eq!(gen.amplitude, 0.25);
    }

    #[test]
    fn test_stream_delivers_full_blocks() {
        let cfg = ConfigTable::parse("[gen]\nsamprate = 1000000\n".to_string()).unwrap();
        let mut gen = SigGen::new();
        let mut out = FrontendSetup::default();
        gen.setup(&mut out, &cfg, "gen").unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(4);
        gen.start(tx, Arc::clone(&stop)).unwrap();
        let buf = rx.recv_timeout(Duration::from_secs(2)).expect("no samples");
        stop.store(true, Ordering::Relaxed);
        assert_eq!(buf.num_samples, BLOCK_SAMPLES);
        assert_eq!(buf.data.len(), BLOCK_SAMPLES * 2);
    }
}
