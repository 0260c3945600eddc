// Copyright 2025-2026 CEMAXECUTER LLC

//! DSP core shared by every channel: the wideband overlap-save input filter
//! and the frequency-domain downconverters that feed the demodulators.

pub mod demod;
pub mod filter;

use thiserror::Error;

/// Maximum number of spur-notch entries on the input filter, including the
/// DC sentinel that is always present.
pub const NSPURS: usize = 100;

#[derive(Error, Debug, PartialEq)]
pub enum DspError {
    #[error("bad timing parameters: samprate={samprate} blocktime={blocktime_ms} ms overlap={overlap}")]
    BadTiming {
        samprate: u32,
        blocktime_ms: f64,
        overlap: usize,
    },

    #[error("output rate {out} not usable against input rate {input}")]
    BadRate { input: u32, out: u32 },

    #[error("frequency {0} Hz outside the passband")]
    OutOfRange(f64),
}

/// Block/FFT dimensions derived from the timing parameters.
///
/// `l` input samples per block, `m` filter impulse response length,
/// `n = l + m - 1` FFT length. `n` is not forced to an FFT-friendly size;
/// an awkward choice just costs CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterParams {
    pub l: usize,
    pub m: usize,
    pub n: usize,
}

impl FilterParams {
    pub fn new(samprate: u32, blocktime_ms: f64, overlap: usize) -> Result<Self, DspError> {
        if samprate == 0 || !(blocktime_ms > 0.0) || overlap < 2 {
            return Err(DspError::BadTiming {
                samprate,
                blocktime_ms,
                overlap,
            });
        }
        let exact = samprate as f64 * blocktime_ms / 1000.0;
        let l = exact.round() as usize;
        if l == 0 {
            return Err(DspError::BadTiming {
                samprate,
                blocktime_ms,
                overlap,
            });
        }
        if (exact - l as f64).abs() > 1e-9 {
            log::warn!(
                "non-integral samples in {} ms block at {} Hz: remainder {}",
                blocktime_ms,
                samprate,
                exact - l as f64
            );
        }
        let m = l / (overlap - 1) + 1;
        let n = l + m - 1;
        Ok(Self { l, m, n })
    }
}

/// Result of mapping an RF offset onto the input filter's bin grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    /// Bin shift, rounded to a multiple of the overlap factor so the
    /// overlap-save slices stay phase-continuous block to block.
    pub shift: i64,
    /// Residual offset from the shifted bin center, Hz; removed by the
    /// channel's fine-tuning oscillator.
    pub remainder: f64,
}

/// Map a frequency offset to a bin shift on an `n`-point filter with
/// impulse length `m` at `samprate`. Fails when the offset falls outside
/// the Nyquist range.
pub fn compute_tuning(n: usize, m: usize, samprate: u32, freq: f64) -> Result<Tuning, DspError> {
    let hz_per_bin = samprate as f64 / n as f64;
    let v = (n / m.saturating_sub(1).max(1)).max(1) as i64; // overlap factor
    let shift = v * ((freq / hz_per_bin) / v as f64).round() as i64;
    if shift.unsigned_abs() > (n / 2) as u64 {
        return Err(DspError::OutOfRange(freq));
    }
    Ok(Tuning {
        shift,
        remainder: freq - shift as f64 * hz_per_bin,
    })
}
