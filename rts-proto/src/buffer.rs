//! Receive buffer that yields complete lines and raw byte runs.

/// Errors raised while cutting lines out of the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum LineError {
    /// No newline within the configured maximum line length.
    #[error("line exceeds {max} bytes without a newline")]
    TooLong {
        /// Configured maximum.
        max: usize,
    },
    /// The line is not valid ASCII/UTF-8 text.
    #[error("line is not valid text")]
    NotText,
}

/// Accumulates socket reads until complete lines are available.
///
/// Partial lines stay buffered between reads; consumed bytes are dropped
/// lazily so repeated small reads do not shift the whole buffer.
#[derive(Debug)]
pub struct RecvBuffer {
    /// Buffered bytes; everything before `start` was consumed.
    buf: Vec<u8>,
    /// Offset of the first unconsumed byte.
    start: usize,
    /// Longest accepted line, newline excluded.
    max_line: usize,
}

impl RecvBuffer {
    /// Creates an empty buffer accepting lines up to `max_line` bytes.
    pub const fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            max_line,
        }
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        if self.start > 0 && self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start > 4096 && self.start * 2 > self.buf.len() {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    /// `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cuts the next complete line, without its `\n` or `\r\n`.
    ///
    /// Returns `Ok(None)` when only a partial line is buffered.
    pub fn next_line(&mut self) -> Result<Option<String>, LineError> {
        let pending = &self.buf[self.start..];
        let Some(pos) = pending.iter().position(|&b| b == b'\n') else {
            if pending.len() > self.max_line {
                return Err(LineError::TooLong { max: self.max_line });
            }
            return Ok(None);
        };
        if pos > self.max_line {
            return Err(LineError::TooLong { max: self.max_line });
        }
        let mut line = &pending[..pos];
        if let [rest @ .., b'\r'] = line {
            line = rest;
        }
        let text = std::str::from_utf8(line)
            .map(str::to_owned)
            .map_err(|_| LineError::NotText);
        self.start += pos + 1;
        text.map(Some)
    }

    /// Moves up to `max` raw bytes into `out`, returning how many moved.
    pub fn take_raw(&mut self, max: usize, out: &mut Vec<u8>) -> usize {
        let n = max.min(self.len());
        out.extend_from_slice(&self.buf[self.start..self.start + n]);
        self.start += n;
        n
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn yields_lines_across_reads() {
        let mut b = RecvBuffer::new(64);
        b.extend(b"S 1 ok\nV fo");
        assert_eq!(b.next_line().unwrap().as_deref(), Some("S 1 ok"));
        assert_eq!(b.next_line().unwrap(), None);
        b.extend(b"o 3\r\n");
        assert_eq!(b.next_line().unwrap().as_deref(), Some("V foo 3"));
        assert!(b.is_empty());
    }

    #[test]
    fn raw_bytes_interleave_with_lines() {
        let mut b = RecvBuffer::new(64);
        b.extend(b"C 1 0 4\n\x00\x01\n\x03+000 done\n");
        assert_eq!(b.next_line().unwrap().as_deref(), Some("C 1 0 4"));
        let mut raw = Vec::new();
        assert_eq!(b.take_raw(4, &mut raw), 4);
        assert_eq!(raw, b"\x00\x01\n\x03");
        assert_eq!(b.next_line().unwrap().as_deref(), Some("+000 done"));
    }

    #[test]
    fn rejects_overlong_line() {
        let mut b = RecvBuffer::new(8);
        b.extend(b"0123456789");
        assert_eq!(b.next_line(), Err(LineError::TooLong { max: 8 }));
    }

    #[test]
    fn rejects_invalid_text_but_skips_it() {
        let mut b = RecvBuffer::new(8);
        b.extend(b"\xff\xfe\nok\n");
        assert_eq!(b.next_line(), Err(LineError::NotText));
        assert_eq!(b.next_line().unwrap().as_deref(), Some("ok"));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// Line boundaries do not depend on how reads split the stream.
            #[test]
            fn lines_survive_any_split(
                lines in prop::collection::vec("[ -~]{0,20}", 0..8),
                cuts in prop::collection::vec(1usize..16, 1..8),
            ) {
                let stream: String = lines.iter().map(|l| format!("{l}\n")).collect();
                let mut b = RecvBuffer::new(64);
                let mut out = Vec::new();
                let mut rest = stream.as_bytes();
                for n in cuts.iter().cycle() {
                    if rest.is_empty() {
                        break;
                    }
                    let (head, tail) = rest.split_at((*n).min(rest.len()));
                    b.extend(head);
                    rest = tail;
                    while let Some(line) = b.next_line().unwrap() {
                        out.push(line);
                    }
                }
                prop_assert_eq!(out, lines);
                prop_assert!(b.is_empty());
            }
        }
    }
}
