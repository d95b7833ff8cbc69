//! Open-addressed index of block checksums, keyed on Adler-32.
//!
//! Adler-32 collisions are cheap to fabricate, so a hostile candidate
//! file could stuff one bucket and turn every window check into a long
//! probe walk. The table caps the probe distance instead: a block whose
//! insertion would land more than `MAX_ADLER_COLLISIONS` slots from its
//! ideal position is left out of the index entirely (it stays in the
//! checksum table and simply can never be matched).

use super::table::ChecksumTable;
use crate::settings::MAX_ADLER_COLLISIONS;

/// Slot values are 1-based block indices; 0 marks an empty slot.
#[derive(Debug)]
pub(crate) struct BlockHash {
    slots: Vec<u32>,
}

fn is_prime(num: u64) -> bool {
    // Candidates below are 1 or 5 mod 6, so 2 and 3 never divide them.
    let mut i = 5;
    while i * i <= num {
        if num % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

/// Smallest usable table size for `blockcnt` entries: a prime reached
/// from `((blockcnt+1)/2)*6 + 1` by alternating +4/+2 steps, which keeps
/// every candidate at 1 or 5 mod 6.
fn table_size(blockcnt: usize) -> usize {
    let mut cnt = ((blockcnt as u64 + 1) / 2) * 6 + 1;
    loop {
        if is_prime(cnt) {
            break;
        }
        cnt += 4;
        if is_prime(cnt) {
            break;
        }
        cnt += 2;
    }
    cnt as usize
}

impl BlockHash {
    /// Index every block of `table`, chaining SHA-1 duplicates through
    /// `table.next` so only the chain head occupies a slot.
    pub(crate) fn build(table: &mut ChecksumTable) -> BlockHash {
        let m = table_size(table.block_count());
        let mut slots = vec![0u32; m];
        for i in 0..table.block_count() {
            let mut o = table.blocks[i].adler as usize % m;
            if slots[o] != 0 {
                let mut col = 0;
                loop {
                    let occupant = slots[o] as usize - 1;
                    if table.blocks[occupant].sha1 == table.blocks[i].sha1 {
                        // Same strong checksum: the new block becomes the
                        // chain head, the old head moves behind it.
                        table.next[i] = slots[o];
                        break;
                    }
                    o = (o + 1) % m;
                    col += 1;
                    if col > MAX_ADLER_COLLISIONS {
                        break;
                    }
                    if slots[o] == 0 {
                        break;
                    }
                }
                if col > MAX_ADLER_COLLISIONS {
                    continue;
                }
            }
            slots[o] = i as u32 + 1;
        }
        BlockHash { slots }
    }

    /// Whether any indexed block carries this Adler value.
    pub(crate) fn has_adler(&self, table: &ChecksumTable, adler: u32) -> bool {
        let m = self.slots.len();
        let mut o = adler as usize % m;
        loop {
            match self.slots[o] {
                0 => return false,
                idx if table.blocks[idx as usize - 1].adler == adler => return true,
                _ => o = (o + 1) % m,
            }
        }
    }

    /// 1-based index of the first block matching both checksums, or 0.
    pub(crate) fn find(&self, table: &ChecksumTable, adler: u32, sha1: &[u8; 20]) -> u32 {
        let m = self.slots.len();
        let mut o = adler as usize % m;
        loop {
            match self.slots[o] {
                0 => return 0,
                idx => {
                    let block = &table.blocks[idx as usize - 1];
                    if block.adler == adler && block.sha1 == *sha1 {
                        return idx;
                    }
                    o = (o + 1) % m;
                }
            }
        }
    }

    /// Drop the chain head matching both checksums, then walk the
    /// cluster behind it, moving any trailing entry back to its now-free
    /// ideal slot; the walk stops at the next empty slot.
    pub(crate) fn remove(&mut self, table: &ChecksumTable, adler: u32, sha1: &[u8; 20]) {
        let m = self.slots.len();
        let mut o = adler as usize % m;
        loop {
            match self.slots[o] {
                0 => {
                    tracing::debug!(adler, "hash entry to remove is already gone");
                    return;
                }
                idx => {
                    let block = &table.blocks[idx as usize - 1];
                    if block.adler == adler && block.sha1 == *sha1 {
                        break;
                    }
                    o = (o + 1) % m;
                }
            }
        }
        self.slots[o] = 0;
        loop {
            o = (o + 1) % m;
            let idx = self.slots[o];
            if idx == 0 {
                return;
            }
            let ideal = table.blocks[idx as usize - 1].adler as usize % m;
            if ideal != o && self.slots[ideal] == 0 {
                self.slots[ideal] = idx;
                self.slots[o] = 0;
            }
        }
    }
}
