//! Process-wide status published by the transfer layer.
//!
//! Everything here is a plain atomic with set/get entry points: the
//! sync state machine and the UI poll these, nothing blocks on them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static DOWNLOAD_SPEED: AtomicU64 = AtomicU64::new(0);
static UPLOAD_SPEED: AtomicU64 = AtomicU64::new(0);
static DISK_FULL: AtomicBool = AtomicBool::new(false);
static AUTH_BAD: AtomicBool = AtomicBool::new(false);
static TIMER_EXCEPTIONS: AtomicU64 = AtomicU64::new(0);

/// Current averaged download speed in bytes/sec.
pub fn download_speed() -> u64 {
    DOWNLOAD_SPEED.load(Ordering::Relaxed)
}

pub(crate) fn set_download_speed(bytes_per_sec: u64) {
    DOWNLOAD_SPEED.store(bytes_per_sec, Ordering::Relaxed);
}

/// Current averaged upload speed in bytes/sec.
pub fn upload_speed() -> u64 {
    UPLOAD_SPEED.load(Ordering::Relaxed)
}

pub(crate) fn set_upload_speed(bytes_per_sec: u64) {
    UPLOAD_SPEED.store(bytes_per_sec, Ordering::Relaxed);
}

/// Flip the process-wide "local disk is full" flag. Idempotent; only
/// transitions are logged.
pub fn set_local_disk_full(full: bool) {
    if DISK_FULL.swap(full, Ordering::Relaxed) != full {
        if full {
            tracing::warn!("local disk is full, pausing writes");
        } else {
            tracing::info!("local disk has free space again");
        }
    }
}

pub fn local_disk_full() -> bool {
    DISK_FULL.load(Ordering::Relaxed)
}

/// Mark the stored credentials as rejected by the server.
pub fn set_auth_bad(bad: bool) {
    if AUTH_BAD.swap(bad, Ordering::Relaxed) != bad && bad {
        tracing::warn!("server rejected the stored credentials");
    }
}

pub fn auth_bad() -> bool {
    AUTH_BAD.load(Ordering::Relaxed)
}

/// Signal a probable network outage so higher layers can collapse their
/// polling intervals. Watchers compare the counter between polls.
pub fn notify_timer_exception() {
    TIMER_EXCEPTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn timer_exceptions() -> u64 {
    TIMER_EXCEPTIONS.load(Ordering::Relaxed)
}
