// Copyright 2025-2026 CEMAXECUTER LLC

//! Per-channel downconversion and the baseline detectors.
//!
//! A `Downconverter` takes the shared wideband spectrum, extracts the bin
//! slice around the channel's tuning shift, and inverse-transforms it into
//! a narrowband baseband block. The detectors turn baseband into audio.

use std::f32::consts::TAU;
use std::sync::Arc;

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::{DspError, FilterParams};

/// Demodulation recipe kinds understood by the baseline detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemodKind {
    /// Complex passthrough; I/Q as a stereo pair. Also used for SSB/CW.
    Linear,
    /// Envelope detector.
    Am,
    /// Phase-difference discriminator.
    Fm,
}

impl DemodKind {
    /// Map a preset mode name onto a detector. SSB variants are linear
    /// modes; broadcast and narrow FM share the discriminator.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "iq" | "linear" | "pcm" | "usb" | "lsb" | "cwu" | "cwl" | "dsb" => Some(Self::Linear),
            "am" | "sam" => Some(Self::Am),
            "fm" | "nfm" | "wfm" | "pm" => Some(Self::Fm),
            _ => None,
        }
    }

    /// Audio channels the detector produces.
    pub fn channels(self) -> u8 {
        match self {
            Self::Linear => 2,
            Self::Am | Self::Fm => 1,
        }
    }
}

/// Frequency-domain bin-slice extractor plus inverse FFT.
pub struct Downconverter {
    /// Wideband FFT length.
    n: usize,
    /// Slice length (narrowband IFFT size).
    k: usize,
    /// Narrowband samples kept per block after overlap discard.
    l_out: usize,
    shift: i64,
    /// Residual tuning offset removed by a phase ramp.
    rem_step: f32,
    phase: f32,
    ifft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
}

impl Downconverter {
    pub fn new(
        wideband: &FilterParams,
        samprate_in: u32,
        samprate_out: u32,
    ) -> Result<Self, DspError> {
        if samprate_out == 0 || samprate_out > samprate_in {
            return Err(DspError::BadRate {
                input: samprate_in,
                out: samprate_out,
            });
        }
        let ratio = samprate_out as f64 / samprate_in as f64;
        let k = (wideband.n as f64 * ratio).round() as usize;
        let l_out = (wideband.l as f64 * ratio).round() as usize;
        if k < 2 || l_out == 0 || l_out > k {
            return Err(DspError::BadRate {
                input: samprate_in,
                out: samprate_out,
            });
        }
        let mut planner = FftPlanner::new();
        let ifft = planner.plan_fft_inverse(k);
        let scratch = vec![Complex32::default(); ifft.get_inplace_scratch_len()];
        Ok(Self {
            n: wideband.n,
            k,
            l_out,
            shift: 0,
            rem_step: 0.0,
            phase: 0.0,
            ifft,
            scratch,
        })
    }

    /// Retune: bin shift plus residual offset in Hz at the output rate.
    pub fn set_tuning(&mut self, shift: i64, remainder_hz: f64, samprate_out: u32) {
        self.shift = shift;
        self.rem_step = -(TAU as f64 * remainder_hz / samprate_out as f64) as f32;
        self.phase = 0.0;
    }

    pub fn output_block_len(&self) -> usize {
        self.l_out
    }

    /// One block: slice, inverse FFT, overlap discard, residual rotation.
    pub fn process(&mut self, bins: &[Complex32]) -> Vec<Complex32> {
        debug_assert_eq!(bins.len(), self.n);
        let k = self.k as i64;
        let n = self.n as i64;
        let mut slice = Vec::with_capacity(self.k);
        for j in 0..k {
            // Index j of the slice holds baseband frequency j (wrapping to
            // negative past k/2), taken from the wideband bin at shift + f.
            let f = if j <= k / 2 { j } else { j - k };
            let src = (self.shift + f).rem_euclid(n) as usize;
            slice.push(bins[src]);
        }
        self.ifft.process_with_scratch(&mut slice, &mut self.scratch);

        let scale = 1.0 / self.n as f32;
        let start = self.k - self.l_out;
        slice[start..]
            .iter()
            .map(|&s| {
                let rotated = s * scale * Complex32::from_polar(1.0, self.phase);
                self.phase = (self.phase + self.rem_step) % TAU;
                rotated
            })
            .collect()
    }
}

/// A detector turns baseband blocks into interleaved audio samples.
pub trait Demodulator: Send {
    fn demodulate(&mut self, baseband: &[Complex32], audio: &mut Vec<f32>);
}

/// I/Q passthrough; left = I, right = Q.
pub struct LinearDemod;

impl Demodulator for LinearDemod {
    fn demodulate(&mut self, baseband: &[Complex32], audio: &mut Vec<f32>) {
        for s in baseband {
            audio.push(s.re);
            audio.push(s.im);
        }
    }
}

/// Envelope detector with a slow DC tracker to remove the carrier level.
pub struct AmDemod {
    dc: f32,
}

impl AmDemod {
    pub fn new() -> Self {
        Self { dc: 0.0 }
    }
}

impl Default for AmDemod {
    fn default() -> Self {
        Self::new()
    }
}

impl Demodulator for AmDemod {
    fn demodulate(&mut self, baseband: &[Complex32], audio: &mut Vec<f32>) {
        for s in baseband {
            let mag = s.norm();
            self.dc += 0.001 * (mag - self.dc);
            audio.push(mag - self.dc);
        }
    }
}

/// Phase-difference discriminator.
pub struct FmDemod {
    prev: Complex32,
}

impl FmDemod {
    pub fn new() -> Self {
        Self {
            prev: Complex32::new(1.0, 0.0),
        }
    }
}

impl Default for FmDemod {
    fn default() -> Self {
        Self::new()
    }
}

impl Demodulator for FmDemod {
    fn demodulate(&mut self, baseband: &[Complex32], audio: &mut Vec<f32>) {
        for &s in baseband {
            let d = s * self.prev.conj();
            audio.push(d.im.atan2(d.re) / std::f32::consts::PI);
            self.prev = s;
        }
    }
}

pub fn make_demod(kind: DemodKind) -> Box<dyn Demodulator> {
    match kind {
        DemodKind::Linear => Box::new(LinearDemod),
        DemodKind::Am => Box::new(AmDemod::new()),
        DemodKind::Fm => Box::new(FmDemod::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> FilterParams {
        FilterParams::new(16_000, 20.0, 5).unwrap()
    }

    #[test]
    fn test_downconverter_dimensions() {
        let p = params();
        // 16 kHz in, 4 kHz out: quarter-length slice
        let dc = Downconverter::new(&p, 16_000, 4_000).unwrap();
        assert_eq!(dc.k, 100);
        assert_eq!(dc.output_block_len(), 80);
    }

    #[test]
    fn test_downconverter_rejects_upsampling() {
        let p = params();
        assert!(Downconverter::new(&p, 16_000, 48_000).is_err());
        assert!(Downconverter::new(&p, 16_000, 0).is_err());
    }

    #[test]
    fn test_carrier_at_shift_becomes_dc() {
        let p = params();
        let mut dc = Downconverter::new(&p, 16_000, 4_000).unwrap();
        dc.set_tuning(40, 0.0, 4_000);

        // Wideband spectrum: single carrier in bin 40
        let mut bins = vec![Complex32::default(); p.n];
        bins[40] = Complex32::new(p.n as f32, 0.0);
        let out = dc.process(&bins);

        assert_eq!(out.len(), 80);
        for s in &out {
            assert!((s.re - 1.0).abs() < 1e-3, "expected DC 1.0, got {}", s.re);
            assert!(s.im.abs() < 1e-3);
        }
    }

    #[test]
    fn test_mode_name_mapping() {
        assert_eq!(DemodKind::from_name("USB"), Some(DemodKind::Linear));
        assert_eq!(DemodKind::from_name("am"), Some(DemodKind::Am));
        assert_eq!(DemodKind::from_name("wfm"), Some(DemodKind::Fm));
        assert_eq!(DemodKind::from_name("chorus"), None);
        assert_eq!(DemodKind::Linear.channels(), 2);
        assert_eq!(DemodKind::Fm.channels(), 1);
    }

    #[test]
    fn test_fm_constant_tone_gives_constant_audio() {
        let mut fm = FmDemod::new();
        // Constant 1/8-cycle-per-sample rotation
        let block: Vec<Complex32> = (0..64)
            .map(|i| Complex32::from_polar(1.0, TAU * i as f32 / 8.0))
            .collect();
        let mut audio = Vec::new();
        fm.demodulate(&block, &mut audio);
        for &a in &audio[1..] {
            assert!((a - 0.25).abs() < 1e-4, "got {}", a);
        }
    }

    #[test]
    fn test_linear_is_stereo_iq() {
        let mut lin = LinearDemod;
        let block = [Complex32::new(0.25, -0.5)];
        let mut audio = Vec::new();
        lin.demodulate(&block, &mut audio);
        assert_eq!(audio, vec![0.25, -0.5]);
    }
}
