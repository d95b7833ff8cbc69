//! Fetching per-file checksums from the service.
//!
//! Two flavors: the whole-file hex digest (`remote_file_checksum`,
//! backed by the local `hashchecksum` cache) and the block-checksum
//! blob the delta planner feeds on, which the API hands out as a link
//! to a set of mirror hosts.

use crate::cache::ChecksumCache;
use crate::delta::table::{ChecksumTable, WIRE_BLOCK_LEN, WIRE_HEADER_LEN};
use crate::delta::ChecksumSource;
use crate::error::{NetError, Result};
use crate::net::api::{api_send, handle_api_result, ApiPool};
use crate::net::http::HttpStream;
use serde_json::{json, Value};

fn result_code(call: &'static str, res: &Value) -> Result<u64> {
    res.get("result")
        .and_then(Value::as_u64)
        .ok_or_else(|| NetError::Protocol(format!("{}: no result field", call)))
}

/// Pulls checksum blobs through the API and a mirror host.
pub struct ApiChecksumSource<'a> {
    pool: &'a ApiPool,
    auth: String,
}

impl<'a> ApiChecksumSource<'a> {
    pub fn new(pool: &'a ApiPool, auth: impl Into<String>) -> ApiChecksumSource<'a> {
        ApiChecksumSource {
            pool,
            auth: auth.into(),
        }
    }
}

impl ChecksumSource for ApiChecksumSource<'_> {
    fn fetch(&mut self, fileid: u64) -> Result<ChecksumTable> {
        let res = api_send(
            self.pool,
            "getchecksumlink",
            json!({ "auth": self.auth, "fileid": fileid }),
        )?;
        let code = result_code("getchecksumlink", &res)?;
        if code != 0 {
            tracing::error!("getchecksumlink returned error {}", code);
            return Err(handle_api_result("getchecksumlink", code));
        }
        let hosts = res
            .get("hosts")
            .and_then(Value::as_array)
            .ok_or_else(|| NetError::Protocol("getchecksumlink: no hosts".into()))?;
        let path = res
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| NetError::Protocol("getchecksumlink: no path".into()))?;

        let mut http = None;
        for host in hosts.iter().filter_map(Value::as_str) {
            match HttpStream::connect(host, path, None) {
                Ok(stream) => {
                    http = Some(stream);
                    break;
                }
                Err(e) => {
                    tracing::debug!("mirror {} unreachable: {}", host, e);
                }
            }
        }
        let mut http = http.ok_or(NetError::NoConnection)?;

        let mut hdr = [0u8; WIRE_HEADER_LEN];
        let got = http.read_full(&mut hdr)?;
        if got != WIRE_HEADER_LEN {
            return Err(NetError::ShortRead {
                wanted: WIRE_HEADER_LEN,
                got,
            });
        }
        let (filesize, blocksize) = ChecksumTable::parse_header(&hdr)?;
        let wanted =
            filesize.div_ceil(blocksize as u64) as usize * WIRE_BLOCK_LEN;
        let mut body = vec![0u8; wanted];
        let got = http.read_full(&mut body)?;
        if got != wanted {
            return Err(NetError::ShortRead { wanted, got });
        }
        ChecksumTable::from_wire(filesize, blocksize, &body)
    }
}

/// Hex digest and size of a remote file, served from the local cache
/// when the metadata layer already knows this `(hash, size)` pair, via
/// the `checksumfile` call otherwise. Fresh answers are written back to
/// the cache.
pub fn remote_file_checksum(
    pool: &ApiPool,
    cache: &ChecksumCache,
    auth: &str,
    fileid: u64,
) -> Result<(String, u64)> {
    if let Some(hit) = cache.file_checksum(fileid)? {
        return Ok(hit);
    }
    let res = api_send(pool, "checksumfile", json!({ "auth": auth, "fileid": fileid }))?;
    let code = result_code("checksumfile", &res)?;
    if code != 0 {
        tracing::error!("checksumfile returned error {}", code);
        return Err(handle_api_result("checksumfile", code));
    }
    let meta = res
        .get("metadata")
        .ok_or_else(|| NetError::Protocol("checksumfile: no metadata".into()))?;
    let size = meta
        .get("size")
        .and_then(Value::as_u64)
        .ok_or_else(|| NetError::Protocol("checksumfile: no size".into()))?;
    let hash = meta
        .get("hash")
        .and_then(Value::as_u64)
        .ok_or_else(|| NetError::Protocol("checksumfile: no hash".into()))?;
    let checksum = res
        .get("sha1")
        .and_then(Value::as_str)
        .ok_or_else(|| NetError::Protocol("checksumfile: no checksum".into()))?;
    cache.store(hash, size, checksum)?;
    Ok((checksum.to_string(), size))
}
