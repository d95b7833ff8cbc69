//! Rolling-window scan of one candidate file against a checksum table.
//!
//! The candidate is streamed through a double-buffered ring of two
//! half-buffers. The Adler window slides one byte at a time; whenever
//! the weak checksum hits the block hash, the window's SHA-1 decides
//! whether it is a real match. A match marks every block in the SHA-1
//! chain as reusable from this candidate and evicts the chain head from
//! the hash, so the first candidate to supply a block wins.

use super::hash::BlockHash;
use super::table::ChecksumTable;
use super::BlockAction;
use crate::delta::rolling::{adler32, adler32_roll};
use crate::localfile::read_full;
use crate::settings::COPY_BUFFER_SIZE;
use sha1::{Digest, Sha1};
use std::cmp;
use std::fs::File;
use std::path::Path;

/// SHA-1 of the current window; the window may wrap around the ring.
fn window_sha1(buff: &[u8], out: usize, inb: usize) -> [u8; 20] {
    if out < inb {
        Sha1::digest(&buff[out..inb]).into()
    } else {
        let mut ctx = Sha1::new();
        ctx.update(&buff[out..]);
        ctx.update(&buff[..inb]);
        ctx.finalize().into()
    }
}

/// Mark every block in the SHA-1 chain headed by `idx` (1-based) as a
/// copy from `file_idx` at `file_off`, then evict the head from the
/// hash. Blocks already claimed by an earlier candidate are left alone.
fn match_found(
    table: &ChecksumTable,
    hash: &mut BlockHash,
    actions: &mut [BlockAction],
    idx: u32,
    file_idx: u32,
    file_off: u64,
) {
    let head = idx as usize - 1;
    if !matches!(actions[head], BlockAction::Transfer) {
        return;
    }
    let mut cur = head;
    loop {
        actions[cur] = BlockAction::Copy {
            file_idx,
            off: file_off,
        };
        match table.next[cur] {
            0 => break,
            n => cur = n as usize - 1,
        }
    }
    hash.remove(table, table.blocks[head].adler, &table.blocks[head].sha1);
}

/// Scan `path` for windows matching still-unclaimed blocks of `table`.
///
/// Local read errors are deliberately silent: an unreadable candidate
/// contributes no matches and the plan falls back to transfers.
pub(crate) fn scan_candidate(
    path: &Path,
    table: &ChecksumTable,
    hash: &mut BlockHash,
    actions: &mut [BlockAction],
    file_idx: u32,
) {
    let bs = table.blocksize as usize;
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!("skipping unreadable candidate {}: {}", path.display(), e);
            return;
        }
    };
    let buffersize = cmp::max(bs * 2, COPY_BUFFER_SIZE);
    let half = buffersize / 2;
    let mut buff = vec![0u8; buffersize];

    let rd = match read_full(&mut file, &mut buff[..half]) {
        Ok(n) => n,
        Err(_) => return,
    };
    if rd < bs {
        // Shorter than one block: nothing can ever match.
        return;
    }
    // End of valid data, in ring coordinates; the tail of the last
    // partial block is zero-padded so windows crossing EOF stay
    // comparable with the server-side checksums.
    let mut bufferlen = if rd < half {
        let padded = rd.div_ceil(bs) * bs;
        buff[rd..padded].fill(0);
        padded
    } else {
        buffersize
    };

    let mut adler = adler32(&buff[..bs]);
    let mut out = 0usize; // window start in the ring
    let mut inb = bs; // one past the window end in the ring
    let mut window_off: u64 = 0; // absolute file offset of the window start

    loop {
        if hash.has_adler(table, adler) {
            let sha1 = window_sha1(&buff, out, inb);
            let idx = hash.find(table, adler, &sha1);
            if idx != 0 {
                match_found(table, hash, actions, idx, file_idx, window_off);
            }
        }
        if inb % bs == 0 {
            if out >= bufferlen {
                out = 0;
            }
            if inb == bufferlen {
                if bufferlen != buffersize {
                    break; // EOF already padded into this cycle
                }
                inb = 0;
                let rd = match read_full(&mut file, &mut buff[..half]) {
                    Ok(n) => n,
                    Err(_) => break,
                };
                if rd == 0 {
                    break;
                }
                if rd < half {
                    bufferlen = rd.div_ceil(bs) * bs;
                    buff[rd..bufferlen].fill(0);
                }
            } else if inb == half {
                let rd = match read_full(&mut file, &mut buff[half..]) {
                    Ok(n) => n,
                    Err(_) => break,
                };
                if rd == 0 {
                    break;
                }
                if rd < half {
                    bufferlen = half + rd.div_ceil(bs) * bs;
                    buff[half + rd..bufferlen].fill(0);
                }
            }
        }
        adler = adler32_roll(adler, buff[out], buff[inb], table.blocksize);
        out += 1;
        inb += 1;
        window_off += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn patterned(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect()
    }

    fn write_tmp(data: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    fn scan(
        data: &[u8],
        candidate: &[u8],
        blocksize: u32,
    ) -> (ChecksumTable, Vec<BlockAction>) {
        let target = write_tmp(data);
        let mut table = ChecksumTable::compute(target.path(), blocksize).unwrap();
        let mut hash = BlockHash::build(&mut table);
        let mut actions = vec![BlockAction::Transfer; table.block_count()];
        let cand = write_tmp(candidate);
        scan_candidate(cand.path(), &table, &mut hash, &mut actions, 0);
        (table, actions)
    }

    #[test]
    fn identical_candidate_matches_every_block() {
        let data = patterned(10 * 4096, 3);
        let (table, actions) = scan(&data, &data, 4096);
        for i in 0..table.block_count() {
            match actions[i] {
                BlockAction::Copy { file_idx: 0, off } => {
                    assert_eq!(off, i as u64 * 4096);
                }
                other => panic!("block {} not matched: {:?}", i, other),
            }
        }
    }

    #[test]
    fn shifted_candidate_matches_at_unaligned_offsets() {
        let data = patterned(6 * 4096, 11);
        let mut candidate = patterned(1000, 77);
        candidate.extend_from_slice(&data);
        let (table, actions) = scan(&data, &candidate, 4096);
        for i in 0..table.block_count() {
            match actions[i] {
                BlockAction::Copy { off, .. } => assert_eq!(off, 1000 + i as u64 * 4096),
                other => panic!("block {} not matched: {:?}", i, other),
            }
        }
    }

    #[test]
    fn padded_tail_block_matches() {
        let data = patterned(3 * 4096 + 17, 5);
        let (table, actions) = scan(&data, &data, 4096);
        assert_eq!(table.block_count(), 4);
        assert!(matches!(actions[3], BlockAction::Copy { off, .. } if off == 3 * 4096));
    }

    #[test]
    fn candidate_shorter_than_a_block_is_ignored() {
        let data = patterned(2 * 4096, 9);
        let (_, actions) = scan(&data, &data[..100], 4096);
        assert!(actions.iter().all(|a| matches!(a, BlockAction::Transfer)));
    }

    #[test]
    fn matches_survive_buffer_refills_and_wraparound() {
        // Candidate longer than the whole ring, shifted so windows land
        // in both halves and straddle the wrap point.
        let blocks = (2 * COPY_BUFFER_SIZE) / 4096 + 8;
        let data = patterned(blocks * 4096, 21);
        let mut candidate = patterned(2048, 55);
        candidate.extend_from_slice(&data);
        let (table, actions) = scan(&data, &candidate, 4096);
        for i in 0..table.block_count() {
            match actions[i] {
                BlockAction::Copy { off, .. } => assert_eq!(
                    off,
                    2048 + i as u64 * 4096,
                    "wrong source offset for block {}",
                    i
                ),
                other => panic!("block {} not matched: {:?}", i, other),
            }
        }
    }

    #[test]
    fn first_candidate_wins_and_evicts_the_hash_entry() {
        let data = patterned(4 * 4096, 31);
        let target = write_tmp(&data);
        let mut table = ChecksumTable::compute(target.path(), 4096).unwrap();
        let mut hash = BlockHash::build(&mut table);
        let mut actions = vec![BlockAction::Transfer; table.block_count()];

        let first = write_tmp(&data);
        let second = write_tmp(&data);
        scan_candidate(first.path(), &table, &mut hash, &mut actions, 0);
        scan_candidate(second.path(), &table, &mut hash, &mut actions, 1);

        for action in &actions {
            assert!(matches!(action, BlockAction::Copy { file_idx: 0, .. }));
        }
        // The winning matches also emptied the hash.
        for block in &table.blocks {
            assert_eq!(hash.find(&table, block.adler, &block.sha1), 0);
        }
    }

    #[test]
    fn repeated_blocks_are_claimed_through_the_chain() {
        let block = patterned(4096, 41);
        let mut data = Vec::new();
        for _ in 0..3 {
            data.extend_from_slice(&block);
        }
        let (table, actions) = scan(&data, &block, 4096);
        assert_eq!(table.block_count(), 3);
        // One window in the candidate satisfies all three identical blocks.
        for action in &actions {
            assert!(matches!(action, BlockAction::Copy { off: 0, .. }));
        }
    }
}
