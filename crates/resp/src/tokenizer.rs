//! Incremental RESP request tokenizer
//!
//! A streaming state machine over the connection's read buffer. The caller
//! feeds whatever bytes arrived from the socket; `tokenize` consumes complete
//! lines and bulk payloads and accumulates finished command token vectors,
//! returning early whenever the buffer runs dry. No partial token ever
//! escapes the tokenizer's own state fields.

use crate::ProtocolError;
use bytes::{Buf, Bytes, BytesMut};

/// Maximum accepted inline request line (excluding CRLF)
pub const PROTO_INLINE_MAX_SIZE: usize = 16 * 1024;
/// Maximum accepted bulk string payload
pub const PROTO_BULK_MAX_SIZE: usize = 128 * 1024 * 1024;
/// Maximum accepted multi-bulk element count
pub const PROTO_MAX_MULTI_BULKS: u64 = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ArrayLen,
    BulkLen,
    BulkData,
}

/// Per-connection request tokenizer
pub struct Request {
    state: State,
    multi_bulk_len: u64,
    bulk_len: usize,
    tokens: Vec<Bytes>,
    commands: Vec<Vec<Bytes>>,
    cluster_mode: bool,
    inbound_bytes: u64,
}

impl Request {
    /// The multi-bulk cap is lifted in cluster mode to match what slot
    /// migration tooling sends.
    pub fn new(cluster_mode: bool) -> Self {
        Self {
            state: State::ArrayLen,
            multi_bulk_len: 0,
            bulk_len: 0,
            tokens: Vec::new(),
            commands: Vec::new(),
            cluster_mode,
            inbound_bytes: 0,
        }
    }

    /// Consume as much of `input` as possible, accumulating complete
    /// commands. Returns when more bytes are needed. Any error has already
    /// drained the offending line, so the connection can be closed cleanly
    /// after replying.
    pub fn tokenize(&mut self, input: &mut BytesMut) -> Result<(), ProtocolError> {
        loop {
            match self.state {
                State::ArrayLen => {
                    let Some(line) = read_line(input) else {
                        return Ok(());
                    };
                    self.inbound_bytes += line.len() as u64;
                    if line.is_empty() {
                        // stray CRLF between commands, accepted like Redis
                        continue;
                    }
                    if line[0] == b'*' {
                        let count = parse_u64(&line[1..])?;
                        if !self.cluster_mode && count > PROTO_MAX_MULTI_BULKS {
                            return Err(ProtocolError::TooManyBulkStrings);
                        }
                        if count == 0 {
                            continue;
                        }
                        self.multi_bulk_len = count;
                        self.state = State::BulkLen;
                    } else {
                        if line.len() > PROTO_INLINE_MAX_SIZE {
                            return Err(ProtocolError::InlineTooBig);
                        }
                        let tokens = split_inline(&line);
                        if !tokens.is_empty() {
                            self.commands.push(tokens);
                        }
                    }
                }
                State::BulkLen => {
                    let Some(line) = read_line(input) else {
                        return Ok(());
                    };
                    self.inbound_bytes += line.len() as u64;
                    if line.is_empty() || line[0] != b'$' {
                        return Err(ProtocolError::ExpectBulkLength);
                    }
                    let len = parse_u64(&line[1..])?;
                    if len > PROTO_BULK_MAX_SIZE as u64 {
                        return Err(ProtocolError::BulkTooBig);
                    }
                    self.bulk_len = len as usize;
                    self.state = State::BulkData;
                }
                State::BulkData => {
                    if input.len() < self.bulk_len + 2 {
                        return Ok(());
                    }
                    let token = input.split_to(self.bulk_len).freeze();
                    input.advance(2);
                    self.inbound_bytes += self.bulk_len as u64 + 2;
                    self.tokens.push(token);
                    self.multi_bulk_len -= 1;
                    if self.multi_bulk_len == 0 {
                        self.commands.push(std::mem::take(&mut self.tokens));
                        self.state = State::ArrayLen;
                    } else {
                        self.state = State::BulkLen;
                    }
                }
            }
        }
    }

    /// Drain the accumulated complete commands
    pub fn take_commands(&mut self) -> Vec<Vec<Bytes>> {
        std::mem::take(&mut self.commands)
    }

    /// Bytes consumed since the last call, for inbound-traffic stats
    pub fn take_inbound_bytes(&mut self) -> u64 {
        std::mem::take(&mut self.inbound_bytes)
    }
}

/// Read one strictly CRLF-terminated line, excluding the terminator.
/// A lone LF does not terminate a line.
fn read_line(input: &mut BytesMut) -> Option<Bytes> {
    let pos = input.windows(2).position(|w| w == b"\r\n")?;
    let line = input.split_to(pos).freeze();
    input.advance(2);
    Some(line)
}

fn parse_u64(bytes: &[u8]) -> Result<u64, ProtocolError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(ProtocolError::ExpectInteger)
}

/// Split an inline command on spaces and tabs, dropping empty tokens
fn split_inline(line: &Bytes) -> Vec<Bytes> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, &b) in line.iter().enumerate() {
        if b == b' ' || b == b'\t' {
            if let Some(s) = start.take() {
                tokens.push(line.slice(s..i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push(line.slice(s..));
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(req: &mut Request, data: &[u8]) -> Result<(), ProtocolError> {
        let mut buf = BytesMut::from(data);
        req.tokenize(&mut buf)
    }

    fn tokenize_whole(data: &[u8]) -> Vec<Vec<Bytes>> {
        let mut req = Request::new(false);
        feed(&mut req, data).unwrap();
        req.take_commands()
    }

    #[test]
    fn test_multi_bulk_command() {
        let cmds = tokenize_whole(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
        assert_eq!(cmds, vec![vec![Bytes::from("GET"), Bytes::from("foo")]]);
    }

    #[test]
    fn test_inline_command() {
        let cmds = tokenize_whole(b"SET  foo\tbar\r\n");
        assert_eq!(
            cmds,
            vec![vec![
                Bytes::from("SET"),
                Bytes::from("foo"),
                Bytes::from("bar")
            ]]
        );
    }

    #[test]
    fn test_pipelined_commands() {
        let cmds = tokenize_whole(b"*1\r\n$4\r\nPING\r\nECHO hi\r\n*1\r\n$4\r\nPING\r\n");
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[1], vec![Bytes::from("ECHO"), Bytes::from("hi")]);
    }

    #[test]
    fn test_empty_bulk_token() {
        let cmds = tokenize_whole(b"*2\r\n$3\r\nGET\r\n$0\r\n\r\n");
        assert_eq!(cmds, vec![vec![Bytes::from("GET"), Bytes::new()]]);
    }

    #[test]
    fn test_arbitrary_chunk_splits_yield_same_commands() {
        let stream = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n*1\r\n$4\r\nPING\r\nGET foo\r\n";
        let whole = tokenize_whole(stream);
        for split in 1..stream.len() {
            let mut req = Request::new(false);
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&stream[..split]);
            req.tokenize(&mut buf).unwrap();
            buf.extend_from_slice(&stream[split..]);
            req.tokenize(&mut buf).unwrap();
            assert_eq!(req.take_commands(), whole, "split at {}", split);
        }
        // byte-by-byte
        let mut req = Request::new(false);
        let mut buf = BytesMut::new();
        for &b in stream.iter() {
            buf.extend_from_slice(&[b]);
            req.tokenize(&mut buf).unwrap();
        }
        assert_eq!(req.take_commands(), whole);
    }

    #[test]
    fn test_partial_input_retains_state() {
        let mut req = Request::new(false);
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfo"[..]);
        req.tokenize(&mut buf).unwrap();
        assert!(req.take_commands().is_empty());
        buf.extend_from_slice(b"o\r\n");
        req.tokenize(&mut buf).unwrap();
        assert_eq!(req.take_commands().len(), 1);
    }

    #[test]
    fn test_lone_lf_does_not_terminate() {
        let mut req = Request::new(false);
        let mut buf = BytesMut::from(&b"PING\n"[..]);
        req.tokenize(&mut buf).unwrap();
        assert!(req.take_commands().is_empty());
        buf.extend_from_slice(b"\r\n");
        req.tokenize(&mut buf).unwrap();
        // the LF became part of the token
        assert_eq!(req.take_commands(), vec![vec![Bytes::from("PING\n")]]);
    }

    #[test]
    fn test_multi_bulk_count_at_cap() {
        let mut data = format!("*{}\r\n", PROTO_MAX_MULTI_BULKS).into_bytes();
        for _ in 0..PROTO_MAX_MULTI_BULKS {
            data.extend_from_slice(b"$1\r\na\r\n");
        }
        let cmds = tokenize_whole(&data);
        assert_eq!(cmds[0].len(), PROTO_MAX_MULTI_BULKS as usize);
    }

    #[test]
    fn test_multi_bulk_count_over_cap() {
        let mut req = Request::new(false);
        let data = format!("*{}\r\n", PROTO_MAX_MULTI_BULKS + 1).into_bytes();
        assert_eq!(
            feed(&mut req, &data),
            Err(ProtocolError::TooManyBulkStrings)
        );
    }

    #[test]
    fn test_multi_bulk_cap_lifted_in_cluster_mode() {
        let mut req = Request::new(true);
        let data = format!("*{}\r\n", PROTO_MAX_MULTI_BULKS + 1).into_bytes();
        assert_eq!(feed(&mut req, &data), Ok(()));
    }

    #[test]
    fn test_bulk_len_at_cap_is_accepted() {
        let mut req = Request::new(false);
        let header = format!("*1\r\n${}\r\n", PROTO_BULK_MAX_SIZE).into_bytes();
        // header parses fine; the tokenizer now waits for the payload
        assert_eq!(feed(&mut req, &header), Ok(()));
    }

    #[test]
    fn test_bulk_len_over_cap() {
        let mut req = Request::new(false);
        let header = format!("*1\r\n${}\r\n", PROTO_BULK_MAX_SIZE + 1).into_bytes();
        assert_eq!(feed(&mut req, &header), Err(ProtocolError::BulkTooBig));
    }

    #[test]
    fn test_inline_over_cap() {
        let mut req = Request::new(false);
        let mut data = vec![b'a'; PROTO_INLINE_MAX_SIZE + 1];
        data.extend_from_slice(b"\r\n");
        assert_eq!(feed(&mut req, &data), Err(ProtocolError::InlineTooBig));
    }

    #[test]
    fn test_inline_at_cap_is_accepted() {
        let mut req = Request::new(false);
        let mut data = vec![b'a'; PROTO_INLINE_MAX_SIZE];
        data.extend_from_slice(b"\r\n");
        assert_eq!(feed(&mut req, &data), Ok(()));
        assert_eq!(req.take_commands().len(), 1);
    }

    #[test]
    fn test_bad_multi_bulk_count() {
        let mut req = Request::new(false);
        assert_eq!(feed(&mut req, b"*abc\r\n"), Err(ProtocolError::ExpectInteger));
    }

    #[test]
    fn test_missing_dollar_prefix() {
        let mut req = Request::new(false);
        assert_eq!(
            feed(&mut req, b"*1\r\nPING\r\n"),
            Err(ProtocolError::ExpectBulkLength)
        );
    }

    #[test]
    fn test_inbound_byte_accounting() {
        let mut req = Request::new(false);
        feed(&mut req, b"*1\r\n$4\r\nPING\r\n").unwrap();
        // "*1" + "$4" + "PING\r\n"
        assert_eq!(req.take_inbound_bytes(), 2 + 2 + 6);
        assert_eq!(req.take_inbound_bytes(), 0);
    }
}
