// Copyright 2025-2026 CEMAXECUTER LLC

//! Dynamically loaded front-end drivers.
//!
//! A driver module is a shared library exporting C-ABI entry points named
//! after its device: `<device>_setup` and `<device>_startup` are required,
//! `<device>_tune` is optional (no tuning without it), `<device>_gain` and
//! `<device>_atten` are optional and probed silently. Config access and
//! sample delivery cross the ABI through callbacks so the module needs no
//! knowledge of the host's data structures.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;
use libloading::Library;

use rd_config::ConfigTable;

use crate::{FrontendDriver, FrontendSetup, SampleBuf};

/// Filled in by the module's setup entry point.
#[repr(C)]
pub struct RawFrontendInfo {
    pub samprate: u32,
    pub isreal: u8,
    pub frequency: f64,
    pub description: [c_char; 128],
}

/// Config lookup: copies the value of `key` in the hardware section into
/// `out` (NUL terminated). Returns 0 on success, -1 when absent or too big.
pub type LookupFn =
    unsafe extern "C" fn(ctx: *mut c_void, key: *const c_char, out: *mut c_char, cap: usize)
        -> c_int;

/// Sample delivery: `data` holds `count` interleaved i16 values. A negative
/// return tells the module to stop streaming.
pub type WriteFn = unsafe extern "C" fn(ctx: *mut c_void, data: *const i16, count: usize) -> c_int;

type SetupFn =
    unsafe extern "C" fn(info: *mut RawFrontendInfo, lookup: LookupFn, ctx: *mut c_void) -> c_int;
type StartupFn = unsafe extern "C" fn(write: WriteFn, ctx: *mut c_void) -> c_int;
type TuneFn = unsafe extern "C" fn(freq: f64) -> f64;
type GainFn = unsafe extern "C" fn(db: f32) -> f32;
type AttenFn = unsafe extern "C" fn(db: f32) -> f32;

struct LookupCtx<'a> {
    cfg: &'a ConfigTable,
    section: &'a str,
}

unsafe extern "C" fn lookup_cb(
    ctx: *mut c_void,
    key: *const c_char,
    out: *mut c_char,
    cap: usize,
) -> c_int {
    if ctx.is_null() || key.is_null() || out.is_null() || cap == 0 {
        return -1;
    }
    let ctx = &*(ctx as *const LookupCtx);
    let key = match CStr::from_ptr(key).to_str() {
        Ok(k) => k,
        Err(_) => return -1,
    };
    match ctx.cfg.get_string(ctx.section, key) {
        Some(value) if value.len() < cap => {
            std::ptr::copy_nonoverlapping(value.as_ptr() as *const c_char, out, value.len());
            *out.add(value.len()) = 0;
            0
        }
        _ => -1,
    }
}

struct PumpCtx {
    tx: Sender<SampleBuf>,
    stop: Arc<AtomicBool>,
}

unsafe extern "C" fn write_cb(ctx: *mut c_void, data: *const i16, count: usize) -> c_int {
    if ctx.is_null() || data.is_null() {
        return -1;
    }
    let ctx = &*(ctx as *const PumpCtx);
    if ctx.stop.load(Ordering::Relaxed) {
        return -1;
    }
    let data = std::slice::from_raw_parts(data, count).to_vec();
    let num_samples = count / 2;
    if ctx.tx.send(SampleBuf { data, num_samples }).is_err() {
        return -1;
    }
    0
}

#[derive(Debug)]
pub struct DynDriver {
    device: String,
    setup: SetupFn,
    startup: StartupFn,
    tune: Option<TuneFn>,
    gain: Option<GainFn>,
    atten: Option<AttenFn>,
    // The module stays mapped for the life of the frontend; the raw fn
    // pointers above are only valid while it is.
    _lib: Library,
}

impl DynDriver {
    pub fn load(device: &str, path: &Path) -> Result<Self, String> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| format!("dlopen {}: {}", path.display(), e))?;

        // Fn pointers are Copy; copying them out of the Symbol is fine as
        // long as the Library stays mapped, which the struct guarantees.
        unsafe fn sym<T: Copy>(lib: &Library, name: &str) -> Result<T, String> {
            let cname = CString::new(name).map_err(|e| e.to_string())?;
            lib.get::<T>(cname.as_bytes_with_nul())
                .map(|s| *s)
                .map_err(|e| format!("symbol {} not found: {}", name, e))
        }

        unsafe {
            Ok(Self {
                device: device.to_string(),
                setup: sym::<SetupFn>(&lib, &format!("{device}_setup"))?,
                startup: sym::<StartupFn>(&lib, &format!("{device}_startup"))?,
                tune: sym::<TuneFn>(&lib, &format!("{device}_tune")).ok(),
                gain: sym::<GainFn>(&lib, &format!("{device}_gain")).ok(),
                atten: sym::<AttenFn>(&lib, &format!("{device}_atten")).ok(),
                _lib: lib,
            })
        }
    }
}

impl FrontendDriver for DynDriver {
    fn setup(
        &mut self,
        out: &mut FrontendSetup,
        cfg: &ConfigTable,
        section: &str,
    ) -> Result<(), String> {
        let mut info = RawFrontendInfo {
            samprate: 0,
            isreal: 0,
            frequency: 0.0,
            description: [0; 128],
        };
        let ctx = LookupCtx { cfg, section };
        let r = unsafe {
            (self.setup)(
                &mut info,
                lookup_cb,
                &ctx as *const LookupCtx as *mut c_void,
            )
        };
        if r != 0 {
            return Err(format!("{}_setup returned {}", self.device, r));
        }
        out.samprate = info.samprate;
        out.isreal = info.isreal != 0;
        out.frequency = info.frequency;
        out.description = unsafe { CStr::from_ptr(info.description.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Ok(())
    }

    fn start(&mut self, tx: Sender<SampleBuf>, stop: Arc<AtomicBool>) -> Result<(), String> {
        // The pump context outlives this call: the module's capture thread
        // keeps writing until the stop flag tells it to quit, and the
        // frontend is never rebound, so the context is leaked on purpose.
        let ctx = Box::into_raw(Box::new(PumpCtx { tx, stop }));
        let r = unsafe { (self.startup)(write_cb, ctx as *mut c_void) };
        if r != 0 {
            unsafe { drop(Box::from_raw(ctx)) };
            return Err(format!("{}_startup returned {}", self.device, r));
        }
        Ok(())
    }

    fn tune(&mut self, freq: f64) -> Result<f64, String> {
        match self.tune {
            Some(f) => Ok(unsafe { f(freq) }),
            None => Err(format!("device {} has no tune entry point", self.device)),
        }
    }

    fn has_tune(&self) -> bool {
        self.tune.is_some()
    }

    fn gain(&mut self, db: f32) -> Option<f32> {
        self.gain.map(|f| unsafe { f(db) })
    }

    fn atten(&mut self, db: f32) -> Option<f32> {
        self.atten.map(|f| unsafe { f(db) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_library_fails() {
        let err = DynDriver::load("ghost", Path::new("/nonexistent/ghost.so")).unwrap_err();
        assert!(err.contains("dlopen"), "unexpected error: {}", err);
    }

    #[test]
    fn test_lookup_callback_copies_value() {
        let cfg = ConfigTable::parse("[hw]\ndevice = rx888\nsamprate = 64800000\n".to_string())
            .unwrap();
        let ctx = LookupCtx {
            cfg: &cfg,
            section: "hw",
        };
        let key = CString::new("samprate").unwrap();
        let mut out = [0 as c_char; 32];
        let r = unsafe {
            lookup_cb(
                &ctx as *const LookupCtx as *mut c_void,
                key.as_ptr(),
                out.as_mut_ptr(),
                out.len(),
            )
        };
        assert_eq!(r, 0);
        let value = unsafe { CStr::from_ptr(out.as_ptr()) }.to_str().unwrap();
        assert_eq!(value, "64800000");

        // Absent key and undersized buffer both report failure
        let missing = CString::new("absent").unwrap();
        let r = unsafe {
            lookup_cb(
                &ctx as *const LookupCtx as *mut c_void,
                missing.as_ptr(),
                out.as_mut_ptr(),
                out.len(),
            )
        };
        assert_eq!(r, -1);
        let r = unsafe {
            lookup_cb(
                &ctx as *const LookupCtx as *mut c_void,
                key.as_ptr(),
                out.as_mut_ptr(),
                4,
            )
        };
        assert_eq!(r, -1);
    }
}
