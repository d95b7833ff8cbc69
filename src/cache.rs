//! Local cache of whole-file checksums, keyed by `(hash, size)`.
//!
//! The cache shares an SQLite database with the metadata layer: that
//! layer owns the `file` table (id, content hash, size per remote
//! file), this module owns `hashchecksum` and joins the two so a file
//! whose content the server already described never costs another
//! `checksumfile` round trip.

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

pub struct ChecksumCache {
    conn: Mutex<Connection>,
}

impl ChecksumCache {
    /// Open (or create) the cache inside the database at `path`.
    pub fn open(path: &Path) -> Result<ChecksumCache> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Purely in-memory cache; used by tests and one-shot tools.
    pub fn open_in_memory() -> Result<ChecksumCache> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection — the embedding client usually hands
    /// in the shared metadata database here.
    pub fn from_connection(conn: Connection) -> Result<ChecksumCache> {
        // `file` mirrors the metadata layer's table; creating it only
        // matters for standalone databases, an existing one is left as
        // it is.
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hashchecksum (
                hash INTEGER NOT NULL,
                size INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                PRIMARY KEY (hash, size)
            );
            CREATE TABLE IF NOT EXISTS file (
                id INTEGER PRIMARY KEY,
                hash INTEGER,
                size INTEGER
            );",
        )?;
        Ok(ChecksumCache {
            conn: Mutex::new(conn),
        })
    }

    /// Cached `(checksum, size)` for a file id, when the file's current
    /// `(hash, size)` pair has a stored checksum.
    pub fn file_checksum(&self, fileid: u64) -> Result<Option<(String, u64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                "SELECT h.checksum, f.size FROM hashchecksum h, file f
                 WHERE f.id = ?1 AND f.hash = h.hash AND f.size = h.size",
                params![fileid as i64],
                |row| {
                    let checksum: String = row.get(0)?;
                    let size: i64 = row.get(1)?;
                    Ok((checksum, size as u64))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Remember the server-reported checksum for a `(hash, size)` pair.
    pub fn store(&self, hash: u64, size: u64, checksum: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "REPLACE INTO hashchecksum (hash, size, checksum) VALUES (?1, ?2, ?3)",
            params![hash as i64, size as i64, checksum],
        )?;
        Ok(())
    }

    /// Record a file row. In a shared database the metadata layer keeps
    /// this table up to date; standalone users (and tests) call this.
    pub fn note_file(&self, fileid: u64, hash: u64, size: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "REPLACE INTO file (id, hash, size) VALUES (?1, ?2, ?3)",
            params![fileid as i64, hash as i64, size as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_without_file_row_or_checksum() {
        let cache = ChecksumCache::open_in_memory().unwrap();
        assert!(cache.file_checksum(1).unwrap().is_none());
        cache.note_file(1, 555, 1000).unwrap();
        // File row alone is not enough, the checksum must be stored too.
        assert!(cache.file_checksum(1).unwrap().is_none());
    }

    #[test]
    fn hit_joins_file_and_checksum() {
        let cache = ChecksumCache::open_in_memory().unwrap();
        cache.note_file(1, 555, 1000).unwrap();
        cache.store(555, 1000, "cafebabe").unwrap();
        assert_eq!(
            cache.file_checksum(1).unwrap(),
            Some(("cafebabe".to_string(), 1000))
        );
    }

    #[test]
    fn stale_size_does_not_hit() {
        let cache = ChecksumCache::open_in_memory().unwrap();
        cache.note_file(1, 555, 2000).unwrap();
        // Stored checksum describes the 1000-byte version of the content.
        cache.store(555, 1000, "cafebabe").unwrap();
        assert!(cache.file_checksum(1).unwrap().is_none());
    }

    #[test]
    fn replace_overwrites_the_pair() {
        let cache = ChecksumCache::open_in_memory().unwrap();
        cache.note_file(1, 555, 1000).unwrap();
        cache.store(555, 1000, "old").unwrap();
        cache.store(555, 1000, "new").unwrap();
        assert_eq!(
            cache.file_checksum(1).unwrap(),
            Some(("new".to_string(), 1000))
        );
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("cache.db");
        {
            let cache = ChecksumCache::open(&db).unwrap();
            cache.note_file(9, 77, 42).unwrap();
            cache.store(77, 42, "feed").unwrap();
        }
        let cache = ChecksumCache::open(&db).unwrap();
        assert_eq!(
            cache.file_checksum(9).unwrap(),
            Some(("feed".to_string(), 42))
        );
    }
}
