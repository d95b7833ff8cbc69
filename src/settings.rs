//! Compile-time tunables and process-wide runtime knobs.
//!
//! The constants here are part of the crate's behavior contract with the
//! rest of the client (buffer sizes, shaper parameters, pool limits).
//! The runtime knobs are the few settings the transfer layer consults on
//! every operation: speed caps, the TLS flag and the ignore patterns.
//! Persistent settings storage lives outside this crate; whoever owns it
//! pushes values in through the setters below.

use crate::error::{NetError, Result};
use glob::Pattern;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{OnceLock, RwLock};

/// Chunk size for streaming file reads (checksum, copy, matcher floor).
pub const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// Sliding window, in seconds, over which transfer speeds are averaged.
pub const SPEED_WINDOW_SECS: usize = 8;

/// Maximum bytes read while parsing an HTTP response head.
pub const HTTP_RESP_BUFFER: usize = 4000;

/// Above this download cap the receive buffer is left at the OS default.
pub const MAX_SPEED_RECV_BUFFER: i64 = 1024 * 1024;

/// Receive buffer used when the download shaper runs in auto mode.
pub const RECV_BUFFER_SHAPED: usize = 256 * 1024;

/// Send buffer restored when upload shaping is turned off for a socket.
pub const DEFAULT_SEND_BUFFER: usize = 512 * 1024;

/// Starting estimate for the closed-loop upload shaper, bytes/sec.
pub const UPLOAD_SHAPER_INITIAL: u64 = 100 * 1024;

/// Floor for the closed-loop upload shaper, bytes/sec.
pub const UPLOAD_SHAPER_MIN: u64 = 10 * 1024;

/// Growth factor (percent) applied when a full second went through cleanly.
pub const UPLOAD_SHAPER_INC_PER: u64 = 105;

/// Shrink factor (percent) applied when the socket stops being writable.
pub const UPLOAD_SHAPER_DEC_PER: u64 = 90;

/// Send-buffer size as a percentage of the current dynamic upload speed.
pub const UPLOAD_SHAPER_BUF_PER: u64 = 400;

/// Base sleep of the auto download shaper, scaled by the observed speed.
pub const AUTO_SHAPER_SLEEP_MS: u64 = 100;

/// Back-off after a write failed with a full disk.
pub const SLEEP_ON_DISK_FULL_MS: u64 = 10_000;

pub const APIPOOL_MAXIDLE: usize = 16;
pub const APIPOOL_MAXACTIVE: usize = 30;
pub const APIPOOL_MAXIDLE_SECS: u64 = 600;

/// Probe-distance bound in the block hash; see `delta::hash`.
pub const MAX_ADLER_COLLISIONS: u32 = 64;

/// Suffix appended to a destination while it is being written.
pub const PARTIAL_SUFFIX: &str = ".part";

/// OS litter that `rmdir_with_trashes` is allowed to delete.
pub const DEFAULT_IGNORE_PATTERNS: &str =
    ".DS_Store;.DS_Store?;._*;.Spotlight-V100;.Trashes;Thumbs.db;desktop.ini;$RECYCLE.BIN";

// Speed caps: -1 unset, 0 auto-shaped, >0 hard cap in bytes/sec.
static MAX_DOWNLOAD_SPEED: AtomicI64 = AtomicI64::new(-1);
static MAX_UPLOAD_SPEED: AtomicI64 = AtomicI64::new(-1);
static USE_SSL: AtomicBool = AtomicBool::new(false);
static IGNORE_PATTERNS: RwLock<Option<Vec<Pattern>>> = RwLock::new(None);

pub fn max_download_speed() -> i64 {
    MAX_DOWNLOAD_SPEED.load(Ordering::Relaxed)
}

pub fn set_max_download_speed(bytes_per_sec: i64) {
    MAX_DOWNLOAD_SPEED.store(bytes_per_sec, Ordering::Relaxed);
}

pub fn max_upload_speed() -> i64 {
    MAX_UPLOAD_SPEED.load(Ordering::Relaxed)
}

pub fn set_max_upload_speed(bytes_per_sec: i64) {
    MAX_UPLOAD_SPEED.store(bytes_per_sec, Ordering::Relaxed);
}

pub fn use_ssl() -> bool {
    USE_SSL.load(Ordering::Relaxed)
}

pub fn set_use_ssl(ssl: bool) {
    USE_SSL.store(ssl, Ordering::Relaxed);
}

fn compile_patterns(spec: &str) -> Vec<Pattern> {
    spec.split(';')
        .filter(|p| !p.is_empty())
        .filter_map(|p| match Pattern::new(p) {
            Ok(pat) => Some(pat),
            Err(e) => {
                tracing::warn!("ignoring bad ignore pattern {:?}: {}", p, e);
                None
            }
        })
        .collect()
}

fn default_patterns() -> &'static [Pattern] {
    static DEFAULTS: OnceLock<Vec<Pattern>> = OnceLock::new();
    DEFAULTS.get_or_init(|| compile_patterns(DEFAULT_IGNORE_PATTERNS))
}

/// Replace the ignore-pattern list (semicolon-separated globs).
pub fn set_ignore_patterns(spec: &str) {
    let compiled = compile_patterns(spec);
    *IGNORE_PATTERNS
        .write()
        .unwrap_or_else(|e| e.into_inner()) = Some(compiled);
}

/// Whether a directory entry name matches the configured ignore list.
pub fn is_name_ignored(name: &str) -> bool {
    let guard = IGNORE_PATTERNS.read().unwrap_or_else(|e| e.into_inner());
    match guard.as_deref() {
        Some(patterns) => patterns.iter().any(|p| p.matches(name)),
        None => default_patterns().iter().any(|p| p.matches(name)),
    }
}

/// Optional config file understood by the CLI and embedding clients.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub max_download_speed: Option<i64>,
    pub max_upload_speed: Option<i64>,
    pub use_ssl: Option<bool>,
    pub ignore_patterns: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            NetError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&text)
            .map_err(|e| NetError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Push every present field into the process-wide knobs.
    pub fn apply(&self) {
        if let Some(v) = self.max_download_speed {
            set_max_download_speed(v);
        }
        if let Some(v) = self.max_upload_speed {
            set_max_upload_speed(v);
        }
        if let Some(v) = self.use_ssl {
            set_use_ssl(v);
        }
        if let Some(ref v) = self.ignore_patterns {
            set_ignore_patterns(v);
        }
    }
}
