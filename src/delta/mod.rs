//! Delta-download planning.
//!
//! Given a remote file about to replace a local one, the planner
//! decides which byte ranges can be copied out of local candidate
//! files and which must be downloaded. It fetches the remote file's
//! block checksums, scans every candidate with the rolling matcher and
//! folds the per-block verdicts into a minimal ordered range list that
//! the downloader executes.

pub mod rolling;
pub mod table;

mod hash;
mod matcher;

use crate::error::{NetError, Result};
use hash::BlockHash;
use std::path::PathBuf;
use table::ChecksumTable;

/// Per-block verdict while candidates are being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockAction {
    /// Download this block from the server.
    Transfer,
    /// Reuse bytes from candidate `file_idx` at offset `off`.
    Copy { file_idx: u32, off: u64 },
}

/// One contiguous piece of the reconstruction plan.
///
/// Concatenating the ranges in order reproduces the remote file
/// byte-exactly: `Transfer` ranges are fetched from the server (their
/// `off` is the offset in the remote file), `Copy` ranges are read from
/// a local candidate (`off` is the offset inside `src`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Range {
    Transfer { off: u64, len: u64 },
    Copy { src: PathBuf, off: u64, len: u64 },
}

impl Range {
    pub fn len(&self) -> u64 {
        match self {
            Range::Transfer { len, .. } | Range::Copy { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where checksum tables come from; the network implementation lives in
/// `net::fetch`, tests and the CLI substitute local sources.
pub trait ChecksumSource {
    fn fetch(&mut self, fileid: u64) -> Result<ChecksumTable>;
}

fn full_transfer(filesize: u64) -> Vec<Range> {
    vec![Range::Transfer {
        off: 0,
        len: filesize,
    }]
}

/// Plan the download of `fileid` (`filesize` bytes), reusing blocks
/// found in `candidates`.
///
/// Candidates are scanned in the order given and the first one to
/// supply a block wins, so the plan is deterministic per input. A
/// permanent failure to obtain checksums degrades to a full-transfer
/// plan; a temporary one is returned to the caller for retry, as is a
/// size disagreement with the server (stale local metadata).
pub fn plan_download(
    source: &mut dyn ChecksumSource,
    fileid: u64,
    filesize: u64,
    candidates: &[PathBuf],
) -> Result<Vec<Range>> {
    if candidates.is_empty() {
        return Ok(full_transfer(filesize));
    }
    let mut table = match source.fetch(fileid) {
        Ok(table) => table,
        Err(e) if !e.is_temporary() => {
            tracing::warn!("no checksums for file {}: {}; downloading whole file", fileid, e);
            return Ok(full_transfer(filesize));
        }
        Err(e) => return Err(e),
    };
    if table.filesize != filesize {
        return Err(NetError::SizeMismatch {
            expected: filesize,
            server: table.filesize,
        });
    }
    if table.block_count() == 0 {
        return Ok(Vec::new());
    }

    let mut hash = BlockHash::build(&mut table);
    let mut actions = vec![BlockAction::Transfer; table.block_count()];
    for (i, candidate) in candidates.iter().enumerate() {
        matcher::scan_candidate(candidate, &table, &mut hash, &mut actions, i as u32);
    }

    let bs = table.blocksize as u64;
    let mut ranges: Vec<Range> = Vec::new();
    // Source index of the last emitted range, meaningful only while that
    // range is a Copy.
    let mut last_src = 0u32;
    for (i, action) in actions.iter().enumerate() {
        let block_len = table.block_len(i);
        match *action {
            BlockAction::Transfer => match ranges.last_mut() {
                Some(Range::Transfer { len, .. }) => *len += block_len,
                _ => ranges.push(Range::Transfer {
                    off: i as u64 * bs,
                    len: block_len,
                }),
            },
            BlockAction::Copy { file_idx, off } => {
                let extends = matches!(
                    ranges.last(),
                    Some(Range::Copy { off: prev_off, len, .. })
                        if last_src == file_idx && prev_off + len == off
                );
                if extends {
                    if let Some(Range::Copy { len, .. }) = ranges.last_mut() {
                        *len += block_len;
                    }
                } else {
                    ranges.push(Range::Copy {
                        src: candidates[file_idx as usize].clone(),
                        off,
                        len: block_len,
                    });
                    last_src = file_idx;
                }
            }
        }
    }
    Ok(ranges)
}
