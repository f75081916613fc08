//! Line framing over a byte stream

use std::io::{self, ErrorKind, Read};
use std::time::Instant;

/// Append `eol` unless `text` already ends with it
pub fn frame_line(text: &str, eol: &str) -> String {
    if text.ends_with(eol) {
        text.to_string()
    } else {
        format!("{text}{eol}")
    }
}

/// Accumulates bytes and yields complete lines
#[derive(Debug, Clone)]
pub struct LineReader {
    delimiter: u8,
    buffer: Vec<u8>,
}

impl LineReader {
    /// Reader splitting on `delimiter`
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            buffer: Vec::with_capacity(256),
        }
    }

    /// Append received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held after the last complete line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Pop the next complete line, decoded lossily and trimmed
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == self.delimiter)?;
        let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }

    /// One read from `source`. Timeouts yield `Ok(0)`; end of stream is an error.
    pub fn fill_from<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; 256];
        match source.read(&mut chunk) {
            Ok(0) => Err(io::Error::new(ErrorKind::UnexpectedEof, "port closed")),
            Ok(n) => {
                self.push(&chunk[..n]);
                Ok(n)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Next line arriving before `deadline`
    ///
    /// Bytes that land after the deadline stay buffered for the next call.
    pub fn read_line<R: Read + ?Sized>(
        &mut self,
        source: &mut R,
        deadline: Instant,
    ) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.next_line() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.fill_from(source)?;
            if Instant::now() > deadline {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    #[test]
    fn test_frame_line_never_doubles() {
        assert_eq!(frame_line("cmd", "\n"), "cmd\n");
        assert_eq!(frame_line("cmd\n", "\n"), "cmd\n");
        assert_eq!(frame_line("cmd\r\n", "\r\n"), "cmd\r\n");
        assert_eq!(frame_line("cmd\r", "\r\n"), "cmd\r\r\n");
    }

    #[test]
    fn test_lines_split_and_trimmed() {
        let mut reader = LineReader::new(b'\n');
        reader.push(b"PONG RFBOX v3\r\nhal");
        assert_eq!(reader.next_line().as_deref(), Some("PONG RFBOX v3"));
        assert_eq!(reader.next_line(), None);
        reader.push(b"f\n");
        assert_eq!(reader.next_line().as_deref(), Some("half"));
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn test_malformed_bytes_replaced() {
        let mut reader = LineReader::new(b'\n');
        reader.push(&[b'o', b'k', 0xFF, b'\n']);
        assert_eq!(reader.next_line().as_deref(), Some("ok\u{FFFD}"));
    }

    #[test]
    fn test_end_of_stream_is_error() {
        let mut reader = LineReader::new(b'\n');
        let mut source = Cursor::new(b"one\n".to_vec());
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(
            reader.read_line(&mut source, deadline).unwrap().as_deref(),
            Some("one")
        );
        let err = reader.read_line(&mut source, deadline).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_expired_deadline_reads_nothing() {
        let mut reader = LineReader::new(b'\n');
        let mut source = Cursor::new(b"late\n".to_vec());
        let deadline = Instant::now();
        assert_eq!(reader.read_line(&mut source, deadline).unwrap(), None);
        assert_eq!(reader.pending(), 0);
    }
}
