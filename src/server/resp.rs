//! Request framing and reply primitives
//!
//! The wire protocol is a collaborator of the core, kept deliberately
//! thin: multibulk and inline request parsing on the way in, and a small
//! set of reply writers on the way out. Two reply dialects exist; the
//! per-client `resp` flag selects how null values are rendered.

use super::Client;
use crate::error::ReplyError;

/// Inline requests larger than this are a protocol error.
const MAX_INLINE_SIZE: usize = 64 * 1024;

/// Hard cap for a single bulk argument.
const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Hard cap for the argument count of one request.
const MAX_MULTIBULK: usize = 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// Need more bytes; nothing consumed.
    Incomplete,
    /// One complete request; consumed bytes removed from the buffer.
    Argv(Vec<Vec<u8>>),
    /// Framing violation; the connection must close.
    Error(String),
}

/// Extract one request from the head of `buf`.
pub fn parse_request(buf: &mut Vec<u8>) -> ParseResult {
    if buf.is_empty() {
        return ParseResult::Incomplete;
    }
    if buf[0] == b'*' {
        parse_multibulk(buf)
    } else {
        parse_inline(buf)
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| p + from)
}

fn parse_inline(buf: &mut Vec<u8>) -> ParseResult {
    let Some(eol) = find_crlf(buf, 0) else {
        if buf.len() > MAX_INLINE_SIZE {
            return ParseResult::Error("too big inline request".into());
        }
        return ParseResult::Incomplete;
    };
    let line = buf[..eol].to_vec();
    buf.drain(..eol + 2);
    let argv: Vec<Vec<u8>> = line
        .split(|&b| b == b' ')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_vec())
        .collect();
    if argv.is_empty() {
        // Empty line: try again with whatever follows.
        return parse_request(buf);
    }
    ParseResult::Argv(argv)
}

fn parse_multibulk(buf: &mut Vec<u8>) -> ParseResult {
    let mut pos = 0usize;
    let Some(eol) = find_crlf(buf, pos) else {
        return ParseResult::Incomplete;
    };
    let count = match parse_decimal(&buf[pos + 1..eol]) {
        Some(n) => n,
        None => return ParseResult::Error("invalid multibulk length".into()),
    };
    if count > MAX_MULTIBULK as i64 {
        return ParseResult::Error("invalid multibulk length".into());
    }
    pos = eol + 2;
    if count <= 0 {
        buf.drain(..pos);
        return parse_request(buf);
    }
    let mut argv = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let Some(eol) = find_crlf(buf, pos) else {
            return ParseResult::Incomplete;
        };
        if buf.get(pos) != Some(&b'$') {
            return ParseResult::Error(format!(
                "expected '$', got '{}'",
                buf.get(pos).map(|&b| b as char).unwrap_or('?')
            ));
        }
        let len = match parse_decimal(&buf[pos + 1..eol]) {
            Some(n) if (0..=MAX_BULK_SIZE as i64).contains(&n) => n as usize,
            _ => return ParseResult::Error("invalid bulk length".into()),
        };
        let start = eol + 2;
        if buf.len() < start + len + 2 {
            return ParseResult::Incomplete;
        }
        if &buf[start + len..start + len + 2] != b"\r\n" {
            return ParseResult::Error("bulk not terminated by CRLF".into());
        }
        argv.push(buf[start..start + len].to_vec());
        pos = start + len + 2;
    }
    buf.drain(..pos);
    ParseResult::Argv(argv)
}

fn parse_decimal(bytes: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(bytes).ok()?;
    s.parse().ok()
}

// ---- reply writers ----

pub fn reply_simple(c: &mut Client, s: &str) {
    c.out.push(b'+');
    c.out.extend_from_slice(s.as_bytes());
    c.out.extend_from_slice(b"\r\n");
}

pub fn reply_error(c: &mut Client, e: &ReplyError) {
    reply_error_text(c, &e.to_string());
}

pub fn reply_error_text(c: &mut Client, msg: &str) {
    c.out.push(b'-');
    c.out.extend_from_slice(msg.as_bytes());
    c.out.extend_from_slice(b"\r\n");
}

pub fn reply_int(c: &mut Client, v: i64) {
    c.out.push(b':');
    c.out.extend_from_slice(v.to_string().as_bytes());
    c.out.extend_from_slice(b"\r\n");
}

pub fn reply_bulk(c: &mut Client, data: &[u8]) {
    c.out.push(b'$');
    c.out.extend_from_slice(data.len().to_string().as_bytes());
    c.out.extend_from_slice(b"\r\n");
    c.out.extend_from_slice(data);
    c.out.extend_from_slice(b"\r\n");
}

/// Missing value: `$-1` on the 2-array dialect, `_` on the typed one.
pub fn reply_null(c: &mut Client) {
    if c.resp >= 3 {
        c.out.extend_from_slice(b"_\r\n");
    } else {
        c.out.extend_from_slice(b"$-1\r\n");
    }
}

/// Aborted transaction / missing aggregate.
pub fn reply_null_array(c: &mut Client) {
    if c.resp >= 3 {
        c.out.extend_from_slice(b"_\r\n");
    } else {
        c.out.extend_from_slice(b"*-1\r\n");
    }
}

pub fn reply_array_len(c: &mut Client, n: usize) {
    c.out.push(b'*');
    c.out.extend_from_slice(n.to_string().as_bytes());
    c.out.extend_from_slice(b"\r\n");
}

/// Reserve an array header whose length is not yet known. Returns a
/// token for [`set_deferred_array_len`].
pub fn reply_deferred_array(c: &mut Client) -> usize {
    c.out.len()
}

pub fn set_deferred_array_len(c: &mut Client, token: usize, n: usize) {
    let mut header = Vec::with_capacity(12);
    header.push(b'*');
    header.extend_from_slice(n.to_string().as_bytes());
    header.extend_from_slice(b"\r\n");
    c.out.splice(token..token, header);
}

/// Encode one command as a protocol fragment (replication backlog form).
pub fn encode_command(argv: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'*');
    out.extend_from_slice(argv.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for a in argv {
        out.push(b'$');
        out.extend_from_slice(a.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(a);
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Client;

    fn argv(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_parse_multibulk() {
        let mut buf = b"*3\r\n$3\r\nset\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".to_vec();
        assert_eq!(
            parse_request(&mut buf),
            ParseResult::Argv(argv(&["set", "foo", "bar"]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_multibulk_incomplete() {
        let full = b"*2\r\n$4\r\nincr\r\n$1\r\nk\r\n";
        for cut in 1..full.len() {
            let mut buf = full[..cut].to_vec();
            assert_eq!(parse_request(&mut buf), ParseResult::Incomplete, "cut={cut}");
            assert_eq!(buf.len(), cut, "nothing consumed on incomplete");
        }
    }

    #[test]
    fn test_parse_pipeline() {
        let mut buf = b"*1\r\n$4\r\nping\r\n*1\r\n$4\r\nping\r\n".to_vec();
        assert_eq!(parse_request(&mut buf), ParseResult::Argv(argv(&["ping"])));
        assert_eq!(parse_request(&mut buf), ParseResult::Argv(argv(&["ping"])));
        assert_eq!(parse_request(&mut buf), ParseResult::Incomplete);
    }

    #[test]
    fn test_parse_inline() {
        let mut buf = b"set  foo   bar\r\nget foo\r\n".to_vec();
        assert_eq!(
            parse_request(&mut buf),
            ParseResult::Argv(argv(&["set", "foo", "bar"]))
        );
        assert_eq!(parse_request(&mut buf), ParseResult::Argv(argv(&["get", "foo"])));
    }

    #[test]
    fn test_parse_binary_safe_bulk() {
        let mut buf = b"*2\r\n$4\r\necho\r\n$5\r\na\r\nb\x00\r\n".to_vec();
        match parse_request(&mut buf) {
            ParseResult::Argv(a) => {
                assert_eq!(a[1], b"a\r\nb\x00".to_vec());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        let mut buf = b"*zz\r\n".to_vec();
        assert!(matches!(parse_request(&mut buf), ParseResult::Error(_)));
        let mut buf = b"*1\r\n:5\r\n".to_vec();
        assert!(matches!(parse_request(&mut buf), ParseResult::Error(_)));
        let mut buf = b"*1\r\n$3\r\nabcXY".to_vec();
        assert!(matches!(parse_request(&mut buf), ParseResult::Error(_)));
    }

    #[test]
    fn test_empty_multibulk_skipped() {
        let mut buf = b"*0\r\n*1\r\n$4\r\nping\r\n".to_vec();
        assert_eq!(parse_request(&mut buf), ParseResult::Argv(argv(&["ping"])));
    }

    #[test]
    fn test_reply_writers() {
        let mut c = Client::mock(1);
        reply_simple(&mut c, "OK");
        reply_int(&mut c, 42);
        reply_bulk(&mut c, b"bar");
        reply_null(&mut c);
        assert_eq!(c.out, b"+OK\r\n:42\r\n$3\r\nbar\r\n$-1\r\n".to_vec());

        let mut c3 = Client::mock(2);
        c3.resp = 3;
        reply_null(&mut c3);
        reply_null_array(&mut c3);
        assert_eq!(c3.out, b"_\r\n_\r\n".to_vec());
    }

    #[test]
    fn test_deferred_array() {
        let mut c = Client::mock(1);
        let token = reply_deferred_array(&mut c);
        reply_bulk(&mut c, b"a");
        reply_bulk(&mut c, b"b");
        set_deferred_array_len(&mut c, token, 2);
        assert_eq!(c.out, b"*2\r\n$1\r\na\r\n$1\r\nb\r\n".to_vec());
    }

    #[test]
    fn test_encode_command() {
        let enc = encode_command(&argv(&["del", "k"]));
        assert_eq!(enc, b"*2\r\n$3\r\ndel\r\n$1\r\nk\r\n".to_vec());
    }
}
