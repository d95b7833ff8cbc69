//! Delta-transfer core of a cloud file-sync client.
//!
//! When a remote file is about to replace a local one, this crate
//! decides which byte ranges can be reused verbatim from local
//! candidate files and which must be downloaded: it fetches the remote
//! file's block checksums, scans candidates with a rolling Adler-32
//! window verified by SHA-1, and emits an ordered `COPY`/`TRANSFER`
//! range plan for the downloader.
//!
//! Around that core sit the pieces a transfer layer needs anyway: a
//! bandwidth shaper accounting bytes per second on both directions, a
//! pooled cache of authenticated API connections, a one-shot HTTP/1.0
//! client for mirror hosts, an SQLite-backed whole-file checksum cache
//! and a handful of checked local-file helpers.
//!
//! Everything is blocking; long operations occupy their calling thread
//! and concurrency comes from the embedding client's worker threads.

pub mod cache;
pub mod delta;
pub mod error;
#[cfg(unix)]
pub mod ipc;
pub mod localfile;
pub mod net;
pub mod settings;
pub mod status;

pub use delta::{plan_download, ChecksumSource, Range};
pub use error::{FailClass, NetError, Result};
