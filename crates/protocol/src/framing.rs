//! Splitting a TCP byte stream into `\n`-terminated lines.
//!
//! TCP gives no message boundaries: one read may carry half a message or
//! several. [`LineFramer`] buffers bytes until a newline arrives and keeps
//! any unterminated tail for the next read.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Upper bound for a single unterminated line before the buffer is dropped.
pub const DEFAULT_MAX_LINE: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("line exceeds {0} bytes without a delimiter")]
    Overflow(usize),
}

#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    max_line: usize,
    /// Bytes already scanned for a newline; saves rescanning on every read.
    searched: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

impl LineFramer {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_line,
            searched: 0,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete line, without its delimiter. Blank lines are
    /// skipped. `None` means more bytes are needed.
    pub fn next_line(&mut self) -> Option<Result<String, FrameError>> {
        loop {
            let Some(pos) = self.buf[self.searched..].iter().position(|&b| b == b'\n') else {
                self.searched = self.buf.len();
                if self.buf.len() > self.max_line {
                    self.buf.clear();
                    self.searched = 0;
                    return Some(Err(FrameError::Overflow(self.max_line)));
                }
                return None;
            };

            let end = self.searched + pos;
            let line = self.buf.split_to(end);
            self.buf.advance(1);
            self.searched = 0;

            let mut line = &line[..];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Some(
                std::str::from_utf8(line)
                    .map(str::to_owned)
                    .map_err(|_| FrameError::InvalidUtf8),
            );
        }
    }

    /// Bytes held back waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(framer: &mut LineFramer) -> Vec<String> {
        std::iter::from_fn(|| framer.next_line())
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn message_split_across_reads() {
        let mut f = LineFramer::default();
        f.extend(br#"{"CMD":"ACK","#);
        assert!(f.next_line().is_none());
        f.extend(b"\"IDX\":1}\n");
        assert_eq!(drain(&mut f), vec![r#"{"CMD":"ACK","IDX":1}"#]);
        assert_eq!(f.pending(), 0);
    }

    #[test]
    fn two_messages_in_one_read() {
        let mut f = LineFramer::default();
        f.extend(b"one\ntwo\n");
        assert_eq!(drain(&mut f), vec!["one", "two"]);
    }

    #[test]
    fn remainder_kept_for_next_read() {
        let mut f = LineFramer::default();
        f.extend(b"first\nsec");
        assert_eq!(drain(&mut f), vec!["first"]);
        assert_eq!(f.pending(), 3);
        f.extend(b"ond\n");
        assert_eq!(drain(&mut f), vec!["second"]);
    }

    #[test]
    fn crlf_and_blank_lines() {
        let mut f = LineFramer::default();
        f.extend(b"a\r\n\r\n\nb\n");
        assert_eq!(drain(&mut f), vec!["a", "b"]);
    }

    #[test]
    fn invalid_utf8_reported_and_skipped() {
        let mut f = LineFramer::default();
        f.extend(b"\xff\xfe\nok\n");
        assert_eq!(f.next_line(), Some(Err(FrameError::InvalidUtf8)));
        assert_eq!(f.next_line(), Some(Ok("ok".to_string())));
        assert_eq!(f.next_line(), None);
    }

    #[test]
    fn unterminated_line_overflows() {
        let mut f = LineFramer::new(8);
        f.extend(b"0123456789");
        assert_eq!(f.next_line(), Some(Err(FrameError::Overflow(8))));
        assert_eq!(f.pending(), 0);

        // The framer keeps working afterwards.
        f.extend(b"ok\n");
        assert_eq!(drain(&mut f), vec!["ok"]);
    }
}
