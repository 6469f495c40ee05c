//! Host extraction for routing plain HTTP connections.
//!
//! The server peeks at the buffered request without consuming anything: all
//! sniffed bytes stay in the reader and are forwarded to the client as the
//! task's first payload. Only enough of the header block to find `Host:` is
//! ever examined, capped at [`MAX_HTTP_HEADER_SIZE`].

use std::io;

use portico_connection::FrameReader;
use portico_proto::MAX_HTTP_HEADER_SIZE;

/// Peek the value of the `Host:` header. `Ok(None)` means the header block
/// ended (or the cap was hit) without one.
pub async fn peek_host(reader: &mut FrameReader) -> io::Result<Option<String>> {
    loop {
        match scan_host(reader.buffer()) {
            Scan::Found(host) => return Ok(Some(host)),
            Scan::Absent => return Ok(None),
            Scan::NeedMore => {
                if reader.buffer().len() >= MAX_HTTP_HEADER_SIZE {
                    return Ok(None);
                }
                reader.fill().await?;
            }
        }
    }
}

enum Scan {
    Found(String),
    Absent,
    NeedMore,
}

fn scan_host(buf: &[u8]) -> Scan {
    let mut rest = buf;
    loop {
        let Some(nl) = rest.iter().position(|b| *b == b'\n') else {
            return Scan::NeedMore;
        };
        let line = trim_cr(&rest[..nl]);
        if line.is_empty() {
            // End of the header block.
            return Scan::Absent;
        }
        if let Some(value) = header_value(line, b"host") {
            let value = String::from_utf8_lossy(value).trim().to_owned();
            return Scan::Found(value);
        }
        rest = &rest[nl + 1..];
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() <= name.len() || line[name.len()] != b':' {
        return None;
    }
    if !line[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    Some(&line[name.len() + 1..])
}

/// The routing label: the first dot-delimited label of the host, with any
/// port stripped. `myid.relay.example.com:8080` routes by `myid`.
pub fn prefix_from_host(host: &str) -> Option<&str> {
    let host = host.split(':').next()?;
    let prefix = host.split('.').next()?;
    if prefix.is_empty() {
        return None;
    }
    Some(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_host_value() {
        let buf = b"GET / HTTP/1.1\r\nAccept: */*\r\nHost: myid.example.com\r\n\r\n";
        match scan_host(buf) {
            Scan::Found(host) => assert_eq!(host, "myid.example.com"),
            _ => panic!("expected host"),
        }
    }

    #[test]
    fn host_header_is_case_insensitive() {
        let buf = b"GET / HTTP/1.1\r\nhOsT: x.y\r\n\r\n";
        match scan_host(buf) {
            Scan::Found(host) => assert_eq!(host, "x.y"),
            _ => panic!("expected host"),
        }
    }

    #[test]
    fn absent_host_is_detected_at_header_end() {
        let buf = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\nbody";
        assert!(matches!(scan_host(buf), Scan::Absent));
    }

    #[test]
    fn partial_headers_ask_for_more() {
        assert!(matches!(scan_host(b"GET / HTTP/1.1\r\nHo"), Scan::NeedMore));
    }

    #[test]
    fn x_host_like_headers_do_not_match() {
        let buf = b"GET / HTTP/1.1\r\nX-Host: spoof\r\n\r\n";
        assert!(matches!(scan_host(buf), Scan::Absent));
    }

    #[test]
    fn prefix_extraction() {
        assert_eq!(prefix_from_host("myid.example.com"), Some("myid"));
        assert_eq!(prefix_from_host("myid.example.com:8080"), Some("myid"));
        assert_eq!(prefix_from_host("bare"), Some("bare"));
        assert_eq!(prefix_from_host(".odd"), None);
        assert_eq!(prefix_from_host(""), None);
    }
}
