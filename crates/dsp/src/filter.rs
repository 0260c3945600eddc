// Copyright 2025-2026 CEMAXECUTER LLC

//! Shared overlap-save forward FFT.
//!
//! One `FilterExecutor` runs on the capture thread, accumulating wideband
//! samples into `l`-sample blocks, prepending `m - 1` samples of history and
//! transforming the result into an `n`-bin spectrum. Each spectrum is
//! published on the `FilterInput` bus; every channel thread waits there.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::{compute_tuning, DspError, FilterParams, NSPURS};

/// Real or complex wideband input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Real,
    Complex,
}

struct SpectrumSlot {
    seq: u64,
    bins: Arc<Vec<Complex32>>,
}

/// Shared handle to the input filter: dimensions plus the spectrum bus.
pub struct FilterInput {
    pub params: FilterParams,
    pub kind: FilterKind,
    pub samprate: u32,
    slot: Mutex<SpectrumSlot>,
    avail: Condvar,
}

impl FilterInput {
    pub fn new(params: FilterParams, kind: FilterKind, samprate: u32) -> Arc<Self> {
        Arc::new(Self {
            params,
            kind,
            samprate,
            slot: Mutex::new(SpectrumSlot {
                seq: 0,
                bins: Arc::new(Vec::new()),
            }),
            avail: Condvar::new(),
        })
    }

    /// Block counter of the most recent spectrum.
    pub fn block_count(&self) -> u64 {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).seq
    }

    /// Wait for a spectrum newer than `last_seen`. Returns `None` on
    /// timeout so callers can poll their stop flag.
    pub fn wait_block(
        &self,
        last_seen: u64,
        timeout: Duration,
    ) -> Option<(u64, Arc<Vec<Complex32>>)> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        while slot.seq <= last_seen {
            let (next, result) = self
                .avail
                .wait_timeout(slot, timeout)
                .unwrap_or_else(|e| e.into_inner());
            slot = next;
            if result.timed_out() && slot.seq <= last_seen {
                return None;
            }
        }
        Some((slot.seq, Arc::clone(&slot.bins)))
    }

    fn publish(&self, bins: Vec<Complex32>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.seq += 1;
        slot.bins = Arc::new(bins);
        self.avail.notify_all();
    }
}

/// One adaptively tracked spur notch. The tracker integrates the complex
/// bin value with gain `alpha` and subtracts the estimate, nulling a
/// stationary carrier without touching wideband signal energy.
#[derive(Debug, Clone, Copy)]
pub struct NotchState {
    pub bin: usize,
    pub alpha: f32,
    state: Complex32,
}

/// Capture-thread side of the filter: history, notches and the FFT plan.
pub struct FilterExecutor {
    input: Arc<FilterInput>,
    fft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
    /// Trailing m-1 samples of the previous block.
    history: Vec<Complex32>,
    /// Samples accumulated toward the next l-sample block.
    pending: Vec<Complex32>,
    notches: Vec<NotchState>,
}

impl FilterExecutor {
    /// Build the executor and its spur-notch list. Out-of-band spur entries
    /// are dropped; a notch at DC is always present as the final entry.
    pub fn new(input: Arc<FilterInput>, spurs: &[f64]) -> Self {
        let params = input.params;
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(params.n);
        let scratch = vec![Complex32::default(); fft.get_inplace_scratch_len()];

        let mut notches = Vec::new();
        for &spur in spurs.iter().take(NSPURS - 1) {
            match compute_tuning(params.n, params.m, input.samprate, spur) {
                Ok(t) => notches.push(NotchState {
                    bin: t.shift.unsigned_abs() as usize,
                    alpha: 0.01, // ~10 s convergence at 50 blocks/s
                    state: Complex32::default(),
                }),
                Err(DspError::OutOfRange(f)) => {
                    log::warn!("spur {} Hz outside passband, ignored", f);
                }
                Err(e) => log::warn!("spur {} Hz: {}", spur, e),
            }
        }
        // DC sentinel, always last
        notches.push(NotchState {
            bin: 0,
            alpha: 0.01,
            state: Complex32::default(),
        });

        Self {
            input,
            fft,
            scratch,
            history: vec![Complex32::default(); params.m - 1],
            pending: Vec::with_capacity(params.l),
            notches,
        }
    }

    pub fn notch_count(&self) -> usize {
        self.notches.len()
    }

    /// Feed wideband samples; runs one forward FFT per completed block.
    /// Returns the number of blocks published.
    pub fn ingest(&mut self, samples: &[Complex32]) -> usize {
        let l = self.input.params.l;
        let mut published = 0;
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (l - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == l {
                self.run_block();
                published += 1;
            }
        }
        published
    }

    fn run_block(&mut self) {
        let params = self.input.params;
        let mut buf = Vec::with_capacity(params.n);
        buf.extend_from_slice(&self.history);
        buf.extend_from_slice(&self.pending);
        debug_assert_eq!(buf.len(), params.n);

        // Save history before the in-place transform destroys the block.
        let tail = self.pending.len() - (params.m - 1);
        self.history.copy_from_slice(&self.pending[tail..]);
        self.pending.clear();

        self.fft.process_with_scratch(&mut buf, &mut self.scratch);

        for notch in &mut self.notches {
            let bin = notch.bin;
            if bin < buf.len() {
                notch.state += notch.alpha * (buf[bin] - notch.state);
                buf[bin] -= notch.state;
            }
        }

        self.input.publish(buf);
    }
}

/// Interleaved i16 I/Q to complex float, the wire format every built-in
/// driver produces.
pub fn iq_to_complex(data: &[i16]) -> Vec<Complex32> {
    data.chunks_exact(2)
        .map(|p| Complex32::new(p[0] as f32 / 32768.0, p[1] as f32 / 32768.0))
        .collect()
}

/// Real samples to complex with zero imaginary part, for REAL frontends.
pub fn real_to_complex(data: &[i16]) -> Vec<Complex32> {
    data.iter()
        .map(|&s| Complex32::new(s as f32 / 32768.0, 0.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn test_input() -> Arc<FilterInput> {
        let params = FilterParams::new(16_000, 20.0, 5).unwrap();
        FilterInput::new(params, FilterKind::Complex, 16_000)
    }

    #[test]
    fn test_blocks_published_per_l_samples() {
        let input = test_input();
        let mut exec = FilterExecutor::new(Arc::clone(&input), &[]);
        let l = input.params.l;

        // Two and a half blocks in odd-sized chunks
        let samples = vec![Complex32::new(0.5, 0.0); l * 5 / 2];
        let mut published = 0;
        for chunk in samples.chunks(37) {
            published += exec.ingest(chunk);
        }
        assert_eq!(published, 2);
        assert_eq!(input.block_count(), 2);
    }

    #[test]
    fn test_spectrum_peak_at_tone_bin() {
        let input = test_input();
        // No spurs: DC sentinel only, and the tone sits away from DC.
        let mut exec = FilterExecutor::new(Arc::clone(&input), &[]);
        let n = input.params.n as f32;
        let l = input.params.l;

        // Tone on an exact bin of the N-point transform
        let bin = 40usize;
        let samples: Vec<Complex32> = (0..l * 2)
            .map(|i| {
                let phase = 2.0 * PI * bin as f32 * i as f32 / n;
                Complex32::new(phase.cos(), phase.sin())
            })
            .collect();
        exec.ingest(&samples);

        let (seq, bins) = input.wait_block(0, Duration::from_secs(1)).unwrap();
        assert!(seq >= 1);
        let peak = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.norm().total_cmp(&b.1.norm()))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, bin);
    }

    #[test]
    fn test_notch_list_has_dc_sentinel() {
        let input = test_input();
        let exec = FilterExecutor::new(Arc::clone(&input), &[1_000.0, 2_000.0]);
        assert_eq!(exec.notch_count(), 3);

        // Out-of-band spurs are dropped, sentinel stays
        let exec = FilterExecutor::new(input, &[1e9]);
        assert_eq!(exec.notch_count(), 1);
    }

    #[test]
    fn test_wait_block_times_out_without_data() {
        let input = test_input();
        assert!(input.wait_block(0, Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_iq_conversion() {
        let iq = [16384i16, -16384, 0, 32767];
        let c = iq_to_complex(&iq);
        assert_eq!(c.len(), 2);
        assert!((c[0].re - 0.5).abs() < 1e-4);
        assert!((c[0].im + 0.5).abs() < 1e-4);
    }
}
