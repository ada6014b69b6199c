//! Blocking test peer on the far end of a socket pair.

#![allow(dead_code, clippy::unwrap_used)]

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use rts::Socket;

/// Longest wait for an expected line.
const LINE_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait used to decide that nothing was sent.
const QUIET_TIMEOUT: Duration = Duration::from_millis(50);

/// The test's side of a connection.
pub struct Peer {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Peer {
    pub fn new(stream: UnixStream) -> Self {
        stream.set_read_timeout(Some(LINE_TIMEOUT)).unwrap();
        let writer = stream.try_clone().unwrap();
        Self {
            reader: BufReader::new(stream),
            writer,
        }
    }

    /// Writes one line.
    pub fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).unwrap();
        self.writer.write_all(b"\n").unwrap();
    }

    /// Writes raw bytes.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
    }

    /// Next line, newline stripped.
    pub fn line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        assert!(!line.is_empty(), "peer closed the connection");
        line.trim_end().to_owned()
    }

    /// Lines up to and including the first one starting with `prefix`.
    pub fn until(&mut self, prefix: &str) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line();
            let done = line.starts_with(prefix);
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    /// Exactly `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0; n];
        self.reader.read_exact(&mut buf).unwrap();
        buf
    }

    /// `true` when nothing arrives within a short wait.
    pub fn quiet(&mut self) -> bool {
        if !self.reader.buffer().is_empty() {
            return false;
        }
        self.reader
            .get_ref()
            .set_read_timeout(Some(QUIET_TIMEOUT))
            .unwrap();
        let mut line = String::new();
        let quiet = match self.reader.read_line(&mut line) {
            Err(e) => matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
            Ok(_) => false,
        };
        self.reader
            .get_ref()
            .set_read_timeout(Some(LINE_TIMEOUT))
            .unwrap();
        quiet
    }
}

/// A socket for the engine and the peer on its other end.
pub fn pair() -> (Box<dyn Socket>, Peer) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    (Box::new(ours), Peer::new(theirs))
}

/// Shared memory key unique to this test process.
pub fn shm_key(n: i32) -> i32 {
    i32::try_from(std::process::id() % 100_000).unwrap() * 100 + n
}
