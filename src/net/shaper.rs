//! Byte accounting and bandwidth shaping for both transfer directions.
//!
//! Each direction keeps a ring of per-second byte counts over the last
//! `SPEED_WINDOW_SECS` seconds; the averaged speed is published through
//! `status`. Enforcement has three modes per direction, selected by the
//! configured cap: pass-through (cap unset), a hard bytes-per-second
//! cap, and an auto mode. Auto download watches the kernel receive
//! buffer until it stops growing before draining it; auto upload runs a
//! closed loop on a dynamic speed estimate, growing it while full
//! seconds go through and shrinking it whenever the socket stops being
//! writable.

use crate::net::stream::NetStream;
use crate::settings::{
    AUTO_SHAPER_SLEEP_MS, SPEED_WINDOW_SECS, UPLOAD_SHAPER_BUF_PER, UPLOAD_SHAPER_DEC_PER,
    UPLOAD_SHAPER_INC_PER, UPLOAD_SHAPER_INITIAL, UPLOAD_SHAPER_MIN,
};
use crate::{settings, status};
use std::cmp;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy)]
struct TimeBytes {
    tm: u64,
    bytes: u64,
}

/// Per-second byte accounting over a sliding window.
pub(crate) struct Meter {
    current_sec: u64,
    this_sec: u64,
    off: usize,
    ring: [TimeBytes; SPEED_WINDOW_SECS],
}

impl Meter {
    pub(crate) const fn new() -> Meter {
        Meter {
            current_sec: 0,
            this_sec: 0,
            off: 0,
            ring: [TimeBytes { tm: 0, bytes: 0 }; SPEED_WINDOW_SECS],
        }
    }

    /// Add `bytes` at wall-second `now`. Returns the refreshed window
    /// average when the accounting crosses into a new second.
    pub(crate) fn account(&mut self, now: u64, bytes: u64) -> Option<u64> {
        if self.current_sec == now {
            self.this_sec += bytes;
            return None;
        }
        self.ring[self.off] = TimeBytes {
            tm: self.current_sec,
            bytes: self.this_sec,
        };
        self.off = (self.off + 1) % SPEED_WINDOW_SECS;
        self.current_sec = now;
        self.this_sec = bytes;
        let cutoff = now.saturating_sub(SPEED_WINDOW_SECS as u64);
        let sum: u64 = self
            .ring
            .iter()
            .filter(|slot| slot.tm >= cutoff)
            .map(|slot| slot.bytes)
            .sum();
        Some(sum / SPEED_WINDOW_SECS as u64)
    }

    /// Bytes accounted so far within the wall-second `now`.
    pub(crate) fn bytes_this_sec(&self, now: u64) -> u64 {
        if self.current_sec == now {
            self.this_sec
        } else {
            0
        }
    }
}

static DOWNLOAD: Mutex<Meter> = Mutex::new(Meter::new());
static UPLOAD: Mutex<Meter> = Mutex::new(Meter::new());
static DYN_UPLOAD_SPEED: AtomicU64 = AtomicU64::new(UPLOAD_SHAPER_INITIAL);

fn lock(meter: &Mutex<Meter>) -> MutexGuard<'_, Meter> {
    meter.lock().unwrap_or_else(|e| e.into_inner())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Sleep until the next wall-clock second begins.
pub fn wait_next_sec() {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    thread::sleep(Duration::from_nanos(1_000_000_000 - nanos.min(999_999_999)));
}

pub fn account_downloaded(bytes: u64) {
    if let Some(avg) = lock(&DOWNLOAD).account(unix_now(), bytes) {
        status::set_download_speed(avg);
    }
}

pub fn account_uploaded(bytes: u64) {
    if let Some(avg) = lock(&UPLOAD).account(unix_now(), bytes) {
        status::set_upload_speed(avg);
    }
}

fn download_bytes_this_sec() -> u64 {
    lock(&DOWNLOAD).bytes_this_sec(unix_now())
}

fn upload_bytes_this_sec() -> u64 {
    lock(&UPLOAD).bytes_this_sec(unix_now())
}

fn read_full_stream(sock: &mut dyn NetStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match sock.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if total > 0 {
                    break;
                }
                return Err(e);
            }
        }
    }
    Ok(total)
}

fn set_shaped_send_buffer(sock: &mut dyn NetStream, dyn_speed: u64) {
    let bytes = (dyn_speed * UPLOAD_SHAPER_BUF_PER / 100) as usize;
    if let Err(e) = sock.set_send_buffer(bytes) {
        tracing::debug!("cannot size send buffer to {}: {}", bytes, e);
    }
}

/// Fill `buf` from `sock`, applying the configured download cap, and
/// account every byte. Stops early at EOF; an error after some bytes
/// were read reports the bytes instead.
pub fn read_shaped(sock: &mut dyn NetStream, buf: &mut [u8]) -> io::Result<usize> {
    read_shaped_with(sock, buf, settings::max_download_speed())
}

pub(crate) fn read_shaped_with(
    sock: &mut dyn NetStream,
    buf: &mut [u8],
    cap: i64,
) -> io::Result<usize> {
    if cap == 0 {
        // Auto mode: let the kernel buffer fill until it stops growing,
        // pacing the probes by the currently observed speed, then drain
        // in one pass.
        let mut last_pending = sock.pending_bytes()?;
        loop {
            let speed_kib = cmp::max(100, status::download_speed() / 1024);
            thread::sleep(Duration::from_millis(AUTO_SHAPER_SLEEP_MS * 100 / speed_kib));
            let pending = sock.pending_bytes()?;
            if pending == last_pending {
                break;
            }
            last_pending = pending;
        }
    } else if cap > 0 {
        let cap = cap as u64;
        let mut total = 0;
        while total < buf.len() {
            let mut this_sec = download_bytes_this_sec();
            while this_sec >= cap {
                wait_next_sec();
                this_sec = download_bytes_this_sec();
            }
            let allow = cmp::min(buf.len() - total, (cap - this_sec) as usize);
            match sock.read(&mut buf[total..total + allow]) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    account_downloaded(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        return Ok(total);
    }
    let total = read_full_stream(sock, buf)?;
    account_downloaded(total as u64);
    Ok(total)
}

/// Write all of `buf` to `sock`, applying the configured upload cap,
/// and account every byte.
pub fn write_shaped(sock: &mut dyn NetStream, buf: &[u8]) -> io::Result<usize> {
    write_shaped_with(sock, buf, settings::max_upload_speed())
}

pub(crate) fn write_shaped_with(
    sock: &mut dyn NetStream,
    buf: &[u8],
    cap: i64,
) -> io::Result<usize> {
    if cap == 0 {
        let mut total = 0;
        while total < buf.len() {
            let mut dyn_speed = DYN_UPLOAD_SPEED.load(Ordering::Relaxed);
            let mut this_sec = upload_bytes_this_sec();
            while this_sec >= dyn_speed {
                // A whole second went through at the current estimate;
                // believe the link can take more.
                dyn_speed = dyn_speed * UPLOAD_SHAPER_INC_PER / 100;
                DYN_UPLOAD_SPEED.store(dyn_speed, Ordering::Relaxed);
                set_shaped_send_buffer(sock, dyn_speed);
                wait_next_sec();
                this_sec = upload_bytes_this_sec();
            }
            tracing::trace!(dyn_upload_speed = dyn_speed);
            let allow = cmp::min(buf.len() - total, (dyn_speed - this_sec) as usize);
            if !sock.writable()? {
                let shrunk = cmp::max(UPLOAD_SHAPER_MIN, dyn_speed * UPLOAD_SHAPER_DEC_PER / 100);
                DYN_UPLOAD_SPEED.store(shrunk, Ordering::Relaxed);
                set_shaped_send_buffer(sock, shrunk);
                thread::sleep(Duration::from_millis(1000));
            }
            match sock.write(&buf[total..total + allow]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    total += n;
                    account_uploaded(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        return Ok(total);
    }
    if cap > 0 {
        let cap = cap as u64;
        let mut total = 0;
        while total < buf.len() {
            let mut this_sec = upload_bytes_this_sec();
            while this_sec >= cap {
                wait_next_sec();
                this_sec = upload_bytes_this_sec();
            }
            let allow = cmp::min(buf.len() - total, (cap - this_sec) as usize);
            match sock.write(&buf[total..total + allow]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    total += n;
                    account_uploaded(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        return Ok(total);
    }
    let mut total = 0;
    while total < buf.len() {
        match sock.write(&buf[total..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    account_uploaded(total as u64);
    Ok(total)
}
