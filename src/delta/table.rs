//! Per-file block checksums and their on-wire blob form.
//!
//! A checksum blob is served by mirror hosts as a 24-byte header
//! followed by one 24-byte entry per block, all little-endian:
//!
//! ```text
//! header:  filesize u64 | blocksize u32 | reserved [u8; 12]
//! entry:   sha1 [u8; 20] | adler u32
//! ```
//!
//! The block count is derived from the header, never transmitted. The
//! final block of a file is zero-padded to `blocksize` before hashing,
//! on the server and in [`ChecksumTable::compute`] alike, so a rolling
//! window that runs past EOF still produces comparable values.

use crate::error::{NetError, Result};
use crate::localfile::read_full;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

pub const SHA1_DIGEST_LEN: usize = 20;
pub const WIRE_HEADER_LEN: usize = 24;
pub const WIRE_BLOCK_LEN: usize = SHA1_DIGEST_LEN + 4;

/// Smallest block size the server may choose.
pub const MIN_BLOCK_SIZE: u32 = 4096;

/// Weak and strong checksum of one block of the remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChecksum {
    pub sha1: [u8; SHA1_DIGEST_LEN],
    pub adler: u32,
}

/// All block checksums of one remote file, in file order.
///
/// `next` chains blocks that share a SHA-1: `next[i]` is the 1-based
/// index of the following chain member, 0 ends the chain. It is filled
/// in while the block hash is built and stays zero until then.
#[derive(Debug, Clone)]
pub struct ChecksumTable {
    pub filesize: u64,
    pub blocksize: u32,
    pub blocks: Vec<BlockChecksum>,
    pub(crate) next: Vec<u32>,
}

fn check_blocksize(blocksize: u32) -> Result<()> {
    if blocksize < MIN_BLOCK_SIZE || !blocksize.is_power_of_two() {
        return Err(NetError::Protocol(format!(
            "bad block size {} in checksum header",
            blocksize
        )));
    }
    Ok(())
}

fn block_count(filesize: u64, blocksize: u32) -> usize {
    filesize.div_ceil(blocksize as u64) as usize
}

impl ChecksumTable {
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Length the block at `idx` contributes to the file: `blocksize`
    /// for every block but possibly the last.
    pub fn block_len(&self, idx: usize) -> u64 {
        let bs = self.blocksize as u64;
        if idx + 1 == self.block_count() {
            match self.filesize % bs {
                0 => bs,
                tail => tail,
            }
        } else {
            bs
        }
    }

    /// Split a wire header into `(filesize, blocksize)`.
    pub fn parse_header(hdr: &[u8; WIRE_HEADER_LEN]) -> Result<(u64, u32)> {
        let filesize = u64::from_le_bytes(hdr[0..8].try_into().unwrap_or_default());
        let blocksize = u32::from_le_bytes(hdr[8..12].try_into().unwrap_or_default());
        check_blocksize(blocksize)?;
        Ok((filesize, blocksize))
    }

    /// Build a table from an already-parsed header and the entry bytes.
    pub fn from_wire(filesize: u64, blocksize: u32, body: &[u8]) -> Result<ChecksumTable> {
        check_blocksize(blocksize)?;
        let cnt = block_count(filesize, blocksize);
        let wanted = cnt * WIRE_BLOCK_LEN;
        if body.len() != wanted {
            return Err(NetError::ShortRead {
                wanted,
                got: body.len(),
            });
        }
        let mut blocks = Vec::with_capacity(cnt);
        for entry in body.chunks_exact(WIRE_BLOCK_LEN) {
            let mut sha1 = [0u8; SHA1_DIGEST_LEN];
            sha1.copy_from_slice(&entry[..SHA1_DIGEST_LEN]);
            let adler =
                u32::from_le_bytes(entry[SHA1_DIGEST_LEN..].try_into().unwrap_or_default());
            blocks.push(BlockChecksum { sha1, adler });
        }
        Ok(ChecksumTable {
            filesize,
            blocksize,
            blocks,
            next: vec![0; cnt],
        })
    }

    /// Parse a whole blob from a reader (a file or a drained HTTP body).
    pub fn parse(r: &mut impl Read) -> Result<ChecksumTable> {
        let mut hdr = [0u8; WIRE_HEADER_LEN];
        let got = read_full(r, &mut hdr)?;
        if got != WIRE_HEADER_LEN {
            return Err(NetError::ShortRead {
                wanted: WIRE_HEADER_LEN,
                got,
            });
        }
        let (filesize, blocksize) = Self::parse_header(&hdr)?;
        let wanted = block_count(filesize, blocksize) * WIRE_BLOCK_LEN;
        let mut body = vec![0u8; wanted];
        let got = read_full(r, &mut body)?;
        if got != wanted {
            return Err(NetError::ShortRead { wanted, got });
        }
        Self::from_wire(filesize, blocksize, &body)
    }

    /// Compute the table for a local file, the way the server computes
    /// it for the remote copy.
    pub fn compute(path: &Path, blocksize: u32) -> Result<ChecksumTable> {
        check_blocksize(blocksize)?;
        let local = |_| NetError::LocalFile { path: path.into() };
        let mut file = File::open(path).map_err(local)?;
        let filesize = file.metadata().map_err(local)?.len();
        let cnt = block_count(filesize, blocksize);
        let mut blocks = Vec::with_capacity(cnt);
        let mut buf = vec![0u8; blocksize as usize];
        for _ in 0..cnt {
            buf.fill(0);
            let got = read_full(&mut file, &mut buf).map_err(local)?;
            if got == 0 {
                // File shrank under us; treat like any unreadable local file.
                return Err(NetError::LocalFile { path: path.into() });
            }
            blocks.push(BlockChecksum {
                sha1: Sha1::digest(&buf).into(),
                adler: crate::delta::rolling::adler32(&buf),
            });
        }
        Ok(ChecksumTable {
            filesize,
            blocksize,
            blocks,
            next: vec![0; cnt],
        })
    }

    /// Serialize in the on-wire blob form.
    pub fn write_blob(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&self.filesize.to_le_bytes())?;
        w.write_all(&self.blocksize.to_le_bytes())?;
        w.write_all(&[0u8; 12])?;
        for block in &self.blocks {
            w.write_all(&block.sha1)?;
            w.write_all(&block.adler.to_le_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn table_for(data: &[u8], blocksize: u32) -> ChecksumTable {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), data).unwrap();
        ChecksumTable::compute(tmp.path(), blocksize).unwrap()
    }

    #[test]
    fn compute_pads_final_block() {
        let data = vec![7u8; 4096 + 100];
        let table = table_for(&data, 4096);
        assert_eq!(table.block_count(), 2);
        let mut padded = vec![7u8; 100];
        padded.resize(4096, 0);
        assert_eq!(table.blocks[1].sha1, <[u8; 20]>::from(Sha1::digest(&padded)));
        assert_eq!(
            table.blocks[1].adler,
            crate::delta::rolling::adler32(&padded)
        );
    }

    #[test]
    fn block_len_of_last_block() {
        let table = table_for(&vec![1u8; 3 * 4096 + 17], 4096);
        assert_eq!(table.block_len(0), 4096);
        assert_eq!(table.block_len(2), 4096);
        assert_eq!(table.block_len(3), 17);

        let exact = table_for(&vec![1u8; 2 * 4096], 4096);
        assert_eq!(exact.block_len(1), 4096);
    }

    #[test]
    fn blob_parses_back() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        let table = table_for(&data, 4096);
        let mut blob = Vec::new();
        table.write_blob(&mut blob).unwrap();
        assert_eq!(
            blob.len(),
            WIRE_HEADER_LEN + table.block_count() * WIRE_BLOCK_LEN
        );
        let parsed = ChecksumTable::parse(&mut Cursor::new(&blob)).unwrap();
        assert_eq!(parsed.filesize, table.filesize);
        assert_eq!(parsed.blocksize, table.blocksize);
        assert_eq!(parsed.blocks, table.blocks);
    }

    #[test]
    fn rejects_bad_blocksize() {
        let mut hdr = [0u8; WIRE_HEADER_LEN];
        hdr[0..8].copy_from_slice(&100u64.to_le_bytes());
        hdr[8..12].copy_from_slice(&1000u32.to_le_bytes()); // not a power of two
        assert!(ChecksumTable::parse_header(&hdr).is_err());
        hdr[8..12].copy_from_slice(&2048u32.to_le_bytes()); // below the floor
        assert!(ChecksumTable::parse_header(&hdr).is_err());
    }

    #[test]
    fn truncated_blob_is_a_short_read() {
        let table = table_for(&vec![9u8; 4096 * 2], 4096);
        let mut blob = Vec::new();
        table.write_blob(&mut blob).unwrap();
        blob.truncate(blob.len() - 5);
        match ChecksumTable::parse(&mut Cursor::new(&blob)) {
            Err(NetError::ShortRead { .. }) => {}
            other => panic!("expected short read, got {:?}", other.map(|t| t.filesize)),
        }
    }
}
