// Copyright 2025-2026 CEMAXECUTER LLC

//! Layered INI configuration for the receiver daemon.
//!
//! A config source is either a single INI file or a directory of `*.conf`
//! fragments merged in byte-lexicographic filename order. Section and key
//! names are case-insensitive; section enumeration preserves source order.

use std::fs;
use std::path::{Path, PathBuf};

use configparser::ini::Ini;
use thiserror::Error;

/// Maximum number of `*.conf` fragments merged from a config directory.
pub const MAX_FRAGMENTS: usize = 100;

/// Keys accepted in the `[global]` section.
pub const GLOBAL_KEYS: &[&str] = &[
    "affinity",
    "blocktime",
    "data",
    "description",
    "dns",
    "fft-plan-level",
    "fft-threads",
    "fft-time-limit",
    "hardware",
    "iface",
    "mode-file",
    "mode",
    "overlap",
    "preset",
    "presets-file",
    "prio",
    "rtcp",
    "sap",
    "static",
    "status",
    "tos",
    "ttl",
    "update",
    "verbose",
    "wisdom-file",
];

/// Keys accepted in channel sections and preset recipes.
pub const CHANNEL_KEYS: &[&str] = &[
    "agc",
    "channels",
    "data",
    "demod",
    "device",
    "disable",
    "dns",
    "encoding",
    "freq",
    "freq0",
    "freq1",
    "freq2",
    "freq3",
    "freq4",
    "freq5",
    "freq6",
    "freq7",
    "freq8",
    "freq9",
    "gain",
    "high",
    "iface",
    "low",
    "mode",
    "preset",
    "samprate",
    "spurs",
    "squelch-close",
    "squelch-open",
    "ssrc",
    "ttl",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config source {0} does not exist")]
    NotFound(PathBuf),

    #[error("config source {0} is neither a regular file nor a directory")]
    InvalidSource(PathBuf),

    #[error("config directory {0} contains no .conf fragments")]
    EmptyDirectory(PathBuf),

    #[error("INI parse failed: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A merged, read-only key/value tree.
///
/// Wraps the INI parser; all lookups go through the case-folding layer the
/// parser provides, so `get("HF", "FREQ")` and `get("hf", "freq")` agree.
pub struct ConfigTable {
    ini: Ini,
}

impl ConfigTable {
    /// Load a config file, a config directory, or `<path>.d`.
    ///
    /// A regular file is parsed directly. A directory (or, when `path` does
    /// not exist, `<path>.d`) has its `*.conf` fragments sorted by filename
    /// bytes and concatenated into one logical source before parsing, so
    /// sections split across fragments merge deterministically.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let meta = fs::metadata(path);
        let source = match meta {
            Ok(m) if m.is_file() => {
                log::info!("loading config file {}", path.display());
                fs::read_to_string(path)?
            }
            Ok(m) if m.is_dir() => {
                log::info!("loading config directory {}", path.display());
                Self::merge_fragments(path)?
            }
            Ok(_) => return Err(ConfigError::InvalidSource(path.to_path_buf())),
            Err(_) => {
                let mut dname = path.as_os_str().to_owned();
                dname.push(".d");
                let dpath = PathBuf::from(dname);
                match fs::metadata(&dpath) {
                    Ok(m) if m.is_dir() => {
                        log::info!("loading config directory {}", dpath.display());
                        Self::merge_fragments(&dpath)?
                    }
                    _ => return Err(ConfigError::NotFound(path.to_path_buf())),
                }
            }
        };
        Self::parse(source)
    }

    /// Parse an in-memory INI source.
    pub fn parse(source: String) -> Result<Self, ConfigError> {
        let mut ini = Ini::new();
        ini.read(source).map_err(ConfigError::Parse)?;
        Ok(Self { ini })
    }

    /// Concatenate the sorted `*.conf` fragments of a directory.
    fn merge_fragments(dir: &Path) -> Result<String, ConfigError> {
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if !name.ends_with(".conf") {
                continue;
            }
            if !entry.file_type()?.is_file() {
                continue;
            }
            if names.len() >= MAX_FRAGMENTS {
                log::warn!(
                    "{}: more than {} fragments, ignoring the rest",
                    dir.display(),
                    MAX_FRAGMENTS
                );
                break;
            }
            names.push(name);
        }
        if names.is_empty() {
            return Err(ConfigError::EmptyDirectory(dir.to_path_buf()));
        }
        // Byte order, not locale order: stable across runs and hosts.
        names.sort_unstable();

        let mut merged = String::new();
        for name in &names {
            merged.push_str("# ");
            merged.push_str(name);
            merged.push('\n');
            merged.push_str(&fs::read_to_string(dir.join(name))?);
            merged.push('\n');
        }
        Ok(merged)
    }

    /// Section names in merged-source order.
    pub fn sections(&self) -> Vec<String> {
        self.ini.sections()
    }

    pub fn has_section(&self, section: &str) -> bool {
        let want = section.to_lowercase();
        self.ini.sections().iter().any(|s| *s == want)
    }

    pub fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.ini.get(section, key)
    }

    /// Look up `key` in `section`, falling back to `fallback_section`.
    pub fn get2_string(&self, section: &str, fallback_section: &str, key: &str) -> Option<String> {
        self.get_string(section, key)
            .or_else(|| self.get_string(fallback_section, key))
    }

    pub fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        match self.ini.getint(section, key) {
            Ok(Some(v)) => v,
            Ok(None) => default,
            Err(e) => {
                log::warn!("[{}] {}: {} (using {})", section, key, e, default);
                default
            }
        }
    }

    pub fn get_float(&self, section: &str, key: &str, default: f64) -> f64 {
        match self.ini.getfloat(section, key) {
            Ok(Some(v)) => v,
            Ok(None) => default,
            Err(e) => {
                log::warn!("[{}] {}: {} (using {})", section, key, e, default);
                default
            }
        }
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.ini.getboolcoerce(section, key) {
            Ok(Some(v)) => v,
            Ok(None) => default,
            Err(e) => {
                log::warn!("[{}] {}: {} (using {})", section, key, e, default);
                default
            }
        }
    }

    /// Keys of one section, in source order.
    pub fn keys(&self, section: &str) -> Vec<String> {
        let want = section.to_lowercase();
        match self.ini.get_map_ref().get(&want) {
            Some(map) => map.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Warn about keys not present in either allow-list. Returns the number
    /// of unknown keys; unknown keys never fail the load.
    pub fn validate_section(&self, section: &str, primary: &[&str], secondary: &[&str]) -> usize {
        let mut unknown = 0;
        for key in self.keys(section) {
            if !primary.contains(&key.as_str()) && !secondary.contains(&key.as_str()) {
                log::warn!("[{}] unknown key \"{}\"", section, key);
                unknown += 1;
            }
        }
        unknown
    }

    /// Validate every section against the same allow-lists.
    pub fn validate_all(&self, primary: &[&str], secondary: &[&str]) -> usize {
        self.sections()
            .iter()
            .map(|s| self.validate_section(s, primary, secondary))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table(src: &str) -> ConfigTable {
        ConfigTable::parse(src.to_string()).expect("parse")
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let t = table("[Global]\nHardware = RX888\n[HF]\nfreq = 7200000\n");
        assert_eq!(t.get_string("global", "hardware").as_deref(), Some("RX888"));
        assert_eq!(t.get_string("GLOBAL", "HARDWARE").as_deref(), Some("RX888"));
        assert_eq!(t.get_string("hf", "freq").as_deref(), Some("7200000"));
    }

    #[test]
    fn test_global_fallback() {
        let t = table("[global]\nttl = 2\nsamprate = 12000\n[hf]\nsamprate = 24000\n");
        assert_eq!(t.get2_string("hf", "global", "samprate").as_deref(), Some("24000"));
        assert_eq!(t.get2_string("hf", "global", "ttl").as_deref(), Some("2"));
        assert_eq!(t.get2_string("hf", "global", "absent"), None);
    }

    #[test]
    fn test_typed_getters_with_defaults() {
        let t = table("[global]\noverlap = 5\nblocktime = 20\nrtcp = yes\nbad = maybe\n");
        assert_eq!(t.get_int("global", "overlap", 2), 5);
        assert_eq!(t.get_int("global", "missing", 7), 7);
        assert!((t.get_float("global", "blocktime", 0.0) - 20.0).abs() < 1e-9);
        assert!(t.get_bool("global", "rtcp", false));
        assert!(!t.get_bool("global", "sap", false));
    }

    #[test]
    fn test_section_order_preserved() {
        let t = table("[global]\na=1\n[zulu]\na=1\n[alpha]\na=1\n");
        assert_eq!(t.sections(), vec!["global", "zulu", "alpha"]);
    }

    #[test]
    fn test_validation_counts_unknown_keys() {
        let t = table("[global]\nhardware = rx888\nbogus = 1\n[hf]\nfreq = 7M\nwat = 2\n");
        assert_eq!(t.validate_section("global", GLOBAL_KEYS, CHANNEL_KEYS), 1);
        assert_eq!(t.validate_section("hf", CHANNEL_KEYS, &[]), 1);
    }

    #[test]
    fn test_directory_merge_is_filename_ordered() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Written in reverse order; the loader must still merge 00 before 10.
        let mut f = fs::File::create(dir.path().join("10-hf.conf")).unwrap();
        writeln!(f, "[hf]\nfreq = 7200000").unwrap();
        let mut f = fs::File::create(dir.path().join("00-global.conf")).unwrap();
        writeln!(f, "[global]\nhardware = rx888").unwrap();
        // Non-.conf entries are ignored.
        fs::File::create(dir.path().join("README")).unwrap();

        let t = ConfigTable::load(dir.path()).expect("load");
        assert_eq!(t.sections(), vec!["global", "hf"]);
        assert_eq!(t.get_string("hf", "freq").as_deref(), Some("7200000"));
    }

    #[test]
    fn test_dot_d_suffix_resolution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dpath = dir.path().join("radiod@test.conf.d");
        fs::create_dir(&dpath).unwrap();
        let mut f = fs::File::create(dpath.join("00-global.conf")).unwrap();
        writeln!(f, "[global]\nhardware = sig_gen").unwrap();

        let t = ConfigTable::load(&dir.path().join("radiod@test.conf")).expect("load .d");
        assert_eq!(t.get_string("global", "hardware").as_deref(), Some("sig_gen"));
    }

    #[test]
    fn test_empty_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        match ConfigTable::load(dir.path()) {
            Err(ConfigError::EmptyDirectory(_)) => {}
            other => panic!("expected EmptyDirectory, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_missing_source_fails() {
        assert!(matches!(
            ConfigTable::load(Path::new("/nonexistent/radiod.conf")),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_section_split_across_fragments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut f = fs::File::create(dir.path().join("00-a.conf")).unwrap();
        writeln!(f, "[hf]\nfreq = 7200000").unwrap();
        let mut f = fs::File::create(dir.path().join("10-b.conf")).unwrap();
        writeln!(f, "[hf]\nssrc = 42").unwrap();

        let t = ConfigTable::load(dir.path()).expect("load");
        assert_eq!(t.get_string("hf", "freq").as_deref(), Some("7200000"));
        assert_eq!(t.get_string("hf", "ssrc").as_deref(), Some("42"));
    }
}
