//! Newline-delimited framing for lobby and peer connections.
//!
//! Wire format: `[UTF-8 line]\n`. Outbound messages are single-line JSON;
//! inbound lines may be split or coalesced arbitrarily by TCP, so readers
//! go through a `LineDecoder` rather than assuming one read = one message.

use crate::error::{LobbyError, LobbyResult};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default upper bound on a single line.
pub const DEFAULT_MAX_LINE: usize = 4096;

/// Encode a serializable value as one JSON line.
pub fn encode_line<T: serde::Serialize>(value: &T) -> LobbyResult<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one JSON line (without the trailing newline) into a typed value.
pub fn decode_line<T: serde::de::DeserializeOwned>(line: &str) -> LobbyResult<T> {
    Ok(serde_json::from_str(line)?)
}

/// Streaming line decoder: accumulates bytes and yields complete lines.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line: usize,
    /// Dropping the rest of an overlong line until its `\n` arrives.
    discarding: bool,
}

impl LineDecoder {
    pub fn new(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    /// Feed bytes and return every complete line, without `\r\n`/`\n`.
    ///
    /// Each entry is one line in stream order. A line that is not UTF-8 or
    /// is longer than the limit becomes an `Err` entry in its place; the
    /// lines around it are still returned. An overlong line is dropped up to
    /// and including its terminating newline, so its tail never surfaces as
    /// a line of its own. Empty lines are skipped.
    pub fn feed(&mut self, data: &[u8]) -> Vec<LobbyResult<String>> {
        self.buffer.extend_from_slice(data);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            if raw.len() > self.max_line {
                lines.push(Err(line_too_long(raw.len(), self.max_line)));
                continue;
            }
            match String::from_utf8(raw) {
                Ok(line) if line.trim().is_empty() => {}
                Ok(line) => lines.push(Ok(line)),
                Err(e) => lines.push(Err(LobbyError::InvalidMessage(format!(
                    "line is not UTF-8: {e}"
                )))),
            }
        }

        if self.discarding {
            self.buffer.clear();
        } else if self.buffer.len() > self.max_line {
            lines.push(Err(line_too_long(self.buffer.len(), self.max_line)));
            self.buffer.clear();
            self.discarding = true;
        }

        lines
    }

    /// Number of bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

fn line_too_long(len: usize, max: usize) -> LobbyError {
    LobbyError::InvalidMessage(format!("line too long: {len} bytes (max {max})"))
}

/// Reads lines from an async byte stream.
pub struct FramedReader<R> {
    inner: R,
    decoder: LineDecoder,
    ready: std::collections::VecDeque<LobbyResult<String>>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R, max_line: usize) -> Self {
        Self {
            inner,
            decoder: LineDecoder::new(max_line),
            ready: std::collections::VecDeque::new(),
            buf: vec![0u8; 1024],
        }
    }

    /// Next complete line.
    ///
    /// `Ok(None)` on a clean EOF; `ConnectionLost` when the peer went away
    /// mid-line or the socket errored.
    ///
    /// A malformed line comes back as `InvalidMessage` and the reader stays
    /// usable; the lines after it follow on later calls.
    ///
    /// Cancel-safe: a line is only removed from the internal queue when it
    /// is returned, so this can sit in a `select!` arm.
    pub async fn next_line(&mut self) -> LobbyResult<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return line.map(Some);
            }
            let n = match self.inner.read(&mut self.buf).await {
                Ok(n) => n,
                Err(e) if is_disconnect(&e) => return Err(LobbyError::ConnectionLost),
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return if self.decoder.pending() == 0 || self.decoder.discarding {
                    Ok(None)
                } else {
                    Err(LobbyError::ConnectionLost)
                };
            }
            self.ready.extend(self.decoder.feed(&self.buf[..n]));
        }
    }

    /// Next line decoded as JSON.
    pub async fn next<T: serde::de::DeserializeOwned>(&mut self) -> LobbyResult<Option<T>> {
        match self.next_line().await? {
            Some(line) => decode_line(&line).map(Some),
            None => Ok(None),
        }
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    fn ok_lines(out: Vec<LobbyResult<String>>) -> Vec<String> {
        out.into_iter().map(|l| l.unwrap()).collect()
    }

    #[test]
    fn coalesced_lines() {
        let mut decoder = LineDecoder::default();
        let lines = ok_lines(decoder.feed(b"LOGIN a b\r\nLIST_USERS_PLAYING\n\nGAME"));
        assert_eq!(lines, vec!["LOGIN a b", "LIST_USERS_PLAYING"]);
        assert_eq!(decoder.pending(), 4);
        let lines = ok_lines(decoder.feed(b"_OVER a\n"));
        assert_eq!(lines, vec!["GAME_OVER a"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn incremental_feed() {
        let frame = encode_line(&TestMsg {
            name: "test".into(),
            value: 99,
        })
        .unwrap();
        let mut decoder = LineDecoder::default();
        for byte in &frame[..frame.len() - 1] {
            assert!(decoder.feed(std::slice::from_ref(byte)).is_empty());
        }
        let lines = ok_lines(decoder.feed(&frame[frame.len() - 1..]));
        let msg: TestMsg = decode_line(&lines[0]).unwrap();
        assert_eq!(msg.value, 99);
    }

    #[test]
    fn overlong_line_is_dropped_through_its_newline() {
        let mut decoder = LineDecoder::new(16);
        let out = decoder.feed(&[b'x'; 24]);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(LobbyError::InvalidMessage(ref m)) if m.contains("too long")));
        assert_eq!(decoder.pending(), 0);

        // The tail of the long line is not a command.
        let out = decoder.feed(b"yy DECLINE\nACCEPT\n");
        assert_eq!(ok_lines(out), vec!["ACCEPT"]);
    }

    #[test]
    fn overlong_complete_line_keeps_neighbours() {
        let mut decoder = LineDecoder::new(8);
        let out = decoder.feed(b"LOGOUT\n0123456789\nACCEPT\n");
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_deref().unwrap(), "LOGOUT");
        assert!(out[1].is_err());
        assert_eq!(out[2].as_deref().unwrap(), "ACCEPT");
    }

    #[test]
    fn bad_utf8_keeps_surrounding_lines() {
        let mut decoder = LineDecoder::default();
        let out = decoder.feed(b"LOGIN alice pw\n\xff\xfe\nLIST_USERS_PLAYING\n");
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_deref().unwrap(), "LOGIN alice pw");
        assert!(matches!(out[1], Err(LobbyError::InvalidMessage(ref m)) if m.contains("UTF-8")));
        assert_eq!(out[2].as_deref().unwrap(), "LIST_USERS_PLAYING");
        assert_eq!(decoder.pending(), 0);
    }

    #[tokio::test]
    async fn framed_reader_continues_after_bad_line() {
        let data: &[u8] = b"one\n\xff\ntwo\n";
        let mut reader = FramedReader::new(data, DEFAULT_MAX_LINE);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("one"));
        assert!(matches!(
            reader.next_line().await,
            Err(LobbyError::InvalidMessage(_))
        ));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("two"));
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn framed_reader_eof_handling() {
        let data: &[u8] = b"one\ntwo\n";
        let mut reader = FramedReader::new(data, DEFAULT_MAX_LINE);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("two"));
        assert!(reader.next_line().await.unwrap().is_none());

        let truncated: &[u8] = b"partial";
        let mut reader = FramedReader::new(truncated, DEFAULT_MAX_LINE);
        assert!(matches!(
            reader.next_line().await,
            Err(LobbyError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn framed_reader_decodes_json() {
        let mut bytes = encode_line(&TestMsg {
            name: "a".into(),
            value: 1,
        })
        .unwrap();
        bytes.extend(encode_line(&TestMsg {
            name: "b".into(),
            value: 2,
        })
        .unwrap());
        let mut reader = FramedReader::new(&bytes[..], DEFAULT_MAX_LINE);
        let first: TestMsg = reader.next().await.unwrap().unwrap();
        let second: TestMsg = reader.next().await.unwrap().unwrap();
        assert_eq!((first.name.as_str(), second.value), ("a", 2));
    }
}
