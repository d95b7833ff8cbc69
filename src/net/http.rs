//! One-shot HTTP/1.0 GET, used to pull checksum blobs off mirror hosts.
//!
//! One request per socket, `Connection: close`, no keep-alive and no
//! chunked encoding: the body simply runs until EOF. Parsing the
//! response head usually over-reads into the body; the surplus is kept
//! in a head buffer that later reads drain first.

use crate::error::{NetError, Result};
use crate::net::shaper;
use crate::net::stream::{self, NetStream};
use crate::settings::{self, HTTP_RESP_BUFFER};
use std::cmp;
use std::io::{self, Write};

#[derive(Debug)]
pub struct HttpStream {
    sock: Box<dyn NetStream>,
    head: Option<Vec<u8>>,
    head_off: usize,
}

fn build_request(host: &str, path: &str, range: Option<(u64, Option<u64>)>) -> String {
    match range {
        Some((from, Some(to))) => format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nRange: bytes={}-{}\r\nConnection: close\r\n\r\n",
            path, host, from, to
        ),
        Some((from, None)) => format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nRange: bytes={}-\r\nConnection: close\r\n\r\n",
            path, host, from
        ),
        None => format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        ),
    }
}

/// Status code from a response head: the first digit-token after the
/// protocol tag. Any 2xx is accepted as success.
fn parse_status(head: &[u8]) -> Option<u32> {
    let mut i = 0;
    while i < head.len() && !head[i].is_ascii_whitespace() {
        i += 1;
    }
    while i < head.len() && head[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= head.len() || !head[i].is_ascii_digit() {
        return None;
    }
    let mut status = 0u32;
    while i < head.len() && head[i].is_ascii_digit() {
        status = status * 10 + (head[i] - b'0') as u32;
        i += 1;
    }
    Some(status)
}

fn find_body(head: &[u8]) -> Option<usize> {
    head.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| head.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
}

impl HttpStream {
    /// Connect to `host` (port 80/443 by the TLS setting) and issue the
    /// GET; on return the response head is consumed and reads yield the
    /// body.
    pub fn connect(
        host: &str,
        path: &str,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<HttpStream> {
        let ssl = settings::use_ssl();
        let port = if ssl { 443 } else { 80 };
        let sock = stream::connect_download(host, port, ssl)?;
        Self::request(sock, host, path, range)
    }

    /// Drive the request/response head exchange on an existing stream.
    pub fn request(
        mut sock: Box<dyn NetStream>,
        host: &str,
        path: &str,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<HttpStream> {
        let req = build_request(host, path, range);
        sock.write_all(req.as_bytes())?;
        let mut buf = vec![0u8; HTTP_RESP_BUFFER - 1];
        let got = shaper::read_shaped(&mut *sock, &mut buf)?;
        buf.truncate(got);

        let status = parse_status(&buf)
            .ok_or_else(|| NetError::Protocol("missing HTTP status".into()))?;
        if status / 10 != 20 {
            return Err(NetError::Protocol(format!("HTTP status {}", status)));
        }
        let body_off =
            find_body(&buf).ok_or_else(|| NetError::Protocol("unterminated HTTP head".into()))?;

        let head = if body_off == buf.len() {
            None
        } else {
            buf.drain(..body_off);
            Some(buf)
        };
        Ok(HttpStream {
            sock,
            head,
            head_off: 0,
        })
    }

    /// Fill `out` with body bytes; drains the carried-over head buffer
    /// first, then reads (shaped) from the socket. Short counts only at
    /// EOF.
    pub fn read_full(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut copied = 0;
        if let Some(head) = &self.head {
            let n = cmp::min(head.len() - self.head_off, out.len());
            out[..n].copy_from_slice(&head[self.head_off..self.head_off + n]);
            self.head_off += n;
            copied = n;
            if self.head_off >= head.len() {
                self.head = None;
            }
            if copied == out.len() {
                return Ok(copied);
            }
        }
        match shaper::read_shaped(&mut *self.sock, &mut out[copied..]) {
            Ok(n) => Ok(copied + n),
            Err(_) if copied > 0 => Ok(copied),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    struct CannedStream {
        response: io::Cursor<Vec<u8>>,
        sent: Vec<u8>,
    }

    fn canned(response: &[u8]) -> Box<dyn NetStream> {
        Box::new(CannedStream {
            response: io::Cursor::new(response.to_vec()),
            sent: Vec::new(),
        })
    }

    impl Read for CannedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.response.read(buf)
        }
    }

    impl Write for CannedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl NetStream for CannedStream {
        fn is_ssl(&self) -> bool {
            false
        }

        fn pending_bytes(&self) -> io::Result<usize> {
            Ok(0)
        }

        fn writable(&self) -> io::Result<bool> {
            Ok(true)
        }

        fn set_recv_buffer(&self, _bytes: usize) -> io::Result<()> {
            Ok(())
        }

        fn set_send_buffer(&self, _bytes: usize) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reads_body_after_headers() {
        let mut http = HttpStream::request(
            canned(b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello"),
            "mirror", "/blob", None,
        )
        .unwrap();
        let mut body = [0u8; 5];
        assert_eq!(http.read_full(&mut body).unwrap(), 5);
        assert_eq!(&body, b"hello");
        // Past EOF the read comes back short.
        assert_eq!(http.read_full(&mut body).unwrap(), 0);
    }

    #[test]
    fn accepts_any_2xx_and_bare_lf_separator() {
        let mut http = HttpStream::request(
            canned(b"HTTP/1.0 206 Partial Content\n\npiece"),
            "mirror", "/blob", None,
        )
        .unwrap();
        let mut body = [0u8; 5];
        assert_eq!(http.read_full(&mut body).unwrap(), 5);
        assert_eq!(&body, b"piece");
    }

    #[test]
    fn rejects_non_2xx() {
        let err = HttpStream::request(
            canned(b"HTTP/1.0 404 Not Found\r\n\r\ngone"),
            "mirror", "/blob", None,
        )
        .unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
        assert!(err.is_temporary());
    }

    #[test]
    fn rejects_garbage() {
        let err =
            HttpStream::request(canned(b"not http at all"), "mirror", "/blob", None).unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
    }

    #[test]
    fn range_header_is_emitted() {
        for (range, needle) in [
            (Some((100u64, Some(199u64))), &b"Range: bytes=100-199\r\n"[..]),
            (Some((100u64, None)), &b"Range: bytes=100-\r\n"[..]),
        ] {
            let req = build_request("mirror", "/blob", range);
            assert!(req.as_bytes().windows(needle.len()).any(|w| w == needle));
            assert!(req.starts_with("GET /blob HTTP/1.0\r\nHost: mirror\r\n"));
            assert!(req.ends_with("Connection: close\r\n\r\n"));
        }
        let plain = build_request("mirror", "/blob", None);
        assert!(!plain.contains("Range:"));
    }

    #[test]
    fn body_drains_from_the_head_carry_over() {
        // The head parse over-read the whole body; successive short
        // reads must drain the carry-over in order.
        let mut http = HttpStream::request(
            canned(b"HTTP/1.0 200 OK\r\n\r\nabcdefghij"),
            "mirror", "/blob", None,
        )
        .unwrap();
        let mut first = [0u8; 3];
        assert_eq!(http.read_full(&mut first).unwrap(), 3);
        assert_eq!(&first, b"abc");
        let mut rest = [0u8; 7];
        assert_eq!(http.read_full(&mut rest).unwrap(), 7);
        assert_eq!(&rest, b"defghij");
    }
}
