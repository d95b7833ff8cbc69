//! Client side of the local overlay status socket.
//!
//! Shell extensions ask the running client for the sync state of a
//! path through a unix stream socket. Messages are framed as
//! `type: u32 | length: u64 | value`, little-endian, where `length`
//! counts the whole message including the 12-byte header. The reply
//! carries no payload beyond its type; the socket is closed after one
//! exchange and the reply is read until EOF.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Request type: query the state of the path in the payload.
pub const MSG_QUERY_STATE: u32 = 4;

/// Reply types. The legacy protocol has no code of its own for
/// `NoSync`; the variant is reserved and never produced by a reply.
pub const REPLY_IN_SYNC: u32 = 11;
pub const REPLY_IN_PROGRESS: u32 = 12;

const HEADER_LEN: usize = 12;
const REPLY_BUFSIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    InSync,
    InProgress,
    /// Reserved; no reply code maps here.
    NoSync,
    Invalid,
}

fn encode_query(path: &Path) -> Vec<u8> {
    let value = path.to_string_lossy();
    let value = value.as_bytes();
    let total = HEADER_LEN + value.len() + 1;
    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(&MSG_QUERY_STATE.to_le_bytes());
    msg.extend_from_slice(&(total as u64).to_le_bytes());
    msg.extend_from_slice(value);
    msg.push(0);
    msg
}

fn decode_reply(reply: &[u8]) -> io::Result<FileState> {
    if reply.len() < HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "overlay reply shorter than a header",
        ));
    }
    let rtype = u32::from_le_bytes(reply[0..4].try_into().unwrap_or_default());
    Ok(match rtype {
        REPLY_IN_SYNC => FileState::InSync,
        REPLY_IN_PROGRESS => FileState::InProgress,
        _ => FileState::Invalid,
    })
}

/// Ask the overlay endpoint at `socket_path` for the state of `path`.
pub fn query_state(socket_path: &Path, path: &Path) -> io::Result<FileState> {
    let mut sock = UnixStream::connect(socket_path)?;
    sock.write_all(&encode_query(path))?;
    let mut reply = Vec::with_capacity(REPLY_BUFSIZE);
    sock.take(REPLY_BUFSIZE as u64)
        .read_to_end(&mut reply)?;
    decode_reply(&reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    fn spawn_endpoint(reply_type: u32) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let sock_path = dir.path().join("overlay.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();
        thread::spawn(move || {
            if let Ok((mut peer, _)) = listener.accept() {
                let mut req = Vec::new();
                let mut chunk = [0u8; 256];
                // Read the framed request up to its advertised length.
                loop {
                    match peer.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            req.extend_from_slice(&chunk[..n]);
                            if req.len() >= HEADER_LEN {
                                let want = u64::from_le_bytes(
                                    req[4..12].try_into().unwrap(),
                                ) as usize;
                                if req.len() >= want {
                                    break;
                                }
                            }
                        }
                    }
                }
                assert_eq!(
                    u32::from_le_bytes(req[0..4].try_into().unwrap()),
                    MSG_QUERY_STATE
                );
                assert_eq!(req.last(), Some(&0));
                let mut reply = Vec::new();
                reply.extend_from_slice(&reply_type.to_le_bytes());
                reply.extend_from_slice(&(HEADER_LEN as u64).to_le_bytes());
                let _ = peer.write_all(&reply);
            }
        });
        (dir, sock_path)
    }

    #[test]
    fn in_sync_reply() {
        let (_dir, sock) = spawn_endpoint(REPLY_IN_SYNC);
        let state = query_state(&sock, Path::new("/stuff/report.pdf")).unwrap();
        assert_eq!(state, FileState::InSync);
    }

    #[test]
    fn in_progress_reply() {
        let (_dir, sock) = spawn_endpoint(REPLY_IN_PROGRESS);
        let state = query_state(&sock, Path::new("/stuff/report.pdf")).unwrap();
        assert_eq!(state, FileState::InProgress);
    }

    #[test]
    fn unknown_reply_is_invalid() {
        let (_dir, sock) = spawn_endpoint(99);
        let state = query_state(&sock, Path::new("/stuff/report.pdf")).unwrap();
        assert_eq!(state, FileState::Invalid);
    }

    #[test]
    fn missing_endpoint_is_an_io_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(query_state(&dir.path().join("gone.sock"), Path::new("/x")).is_err());
    }
}
