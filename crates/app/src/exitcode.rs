//! Process exit codes, following the sysexits convention the service
//! manager understands.

pub const OK: i32 = 0;
/// Bad configuration or command line.
pub const USAGE: i32 = 64;
/// Config source or front end could not be opened.
pub const NOINPUT: i32 = 66;
/// Output socket creation failed.
pub const NOHOST: i32 = 68;
/// Presets file missing; nothing can demodulate without it.
pub const UNAVAILABLE: i32 = 69;
/// Terminated by a signal other than SIGTERM.
pub const SOFTWARE: i32 = 70;
