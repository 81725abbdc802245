//! Buffered IPC primitives for worker communication.
//!
//! Line-based I/O over pipes with EINTR handling and deadline-bounded reads.

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::{self, BufWriter, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on a single protocol line.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// A file descriptor wrapper that implements Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Read into `buf`, retrying on interrupt.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    /// Wait until the fd is readable (or hung up) for at most `timeout`.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        // PollTimeout is capped at u16 milliseconds per call; loop for longer waits.
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = remaining.as_millis().min(u16::MAX as u128) as u16;
            let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) => {
                    if remaining.as_millis() <= u16::MAX as u128 {
                        return Ok(false);
                    }
                }
                Ok(_) => return Ok(true),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Outcome of a deadline-bounded line read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadLine {
    /// A complete line, without its terminator.
    Line(String),
    /// The writer closed the pipe. Any unterminated partial line is dropped.
    Eof,
    /// The deadline passed before a full line arrived.
    TimedOut,
}

/// Buffered line reader for IPC.
///
/// Keeps its own buffer so a partially received line survives a timeout and
/// complete lines can be drained without blocking.
#[derive(Debug)]
pub struct LineReader {
    fd: PipeFd,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            fd,
            buffer: Vec::with_capacity(4096),
            chunk: vec![0; DEFAULT_BUFFER_SIZE],
        }
    }

    /// Read one line, waiting until `deadline` (forever when `None`).
    pub fn read_line(&mut self, deadline: Option<Instant>) -> io::Result<ReadLine> {
        loop {
            if let Some(line) = self.take_buffered_line()? {
                return Ok(ReadLine::Line(line));
            }
            if self.buffer.len() > MAX_LINE_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {} bytes", MAX_LINE_BYTES),
                ));
            }
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if !self.fd.wait_readable(remaining)? {
                    return Ok(ReadLine::TimedOut);
                }
            }
            let n = self.fd.read(&mut self.chunk)?;
            if n == 0 {
                self.buffer.clear();
                return Ok(ReadLine::Eof);
            }
            self.buffer.extend_from_slice(&self.chunk[..n]);
        }
    }

    /// Read every complete line that is available right now without blocking.
    ///
    /// Returns the drained lines and whether the writer has closed the pipe.
    pub fn drain_ready(&mut self) -> io::Result<(Vec<String>, bool)> {
        let mut lines = Vec::new();
        loop {
            match self.read_line(Some(Instant::now()))? {
                ReadLine::Line(line) => lines.push(line),
                ReadLine::TimedOut => return Ok((lines, false)),
                ReadLine::Eof => return Ok((lines, true)),
            }
        }
    }

    fn take_buffered_line(&mut self) -> io::Result<Option<String>> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Buffered line writer for IPC.
#[derive(Debug)]
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, fd),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_pipe() -> (PipeFd, PipeFd) {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("Failed to create pipe");
        (PipeFd::new(read_fd), PipeFd::new(write_fd))
    }

    fn in_ms(ms: u64) -> Option<Instant> {
        Some(Instant::now() + Duration::from_millis(ms))
    }

    #[test]
    fn test_line_reader_writer_roundtrip() {
        let (read_fd, write_fd) = create_pipe();
        let mut reader = LineReader::new(read_fd);
        let mut writer = LineWriter::new(write_fd);

        writer.write_line("hello").unwrap();
        writer.write_line("world\n").unwrap();
        writer.write_line("").unwrap();
        drop(writer);

        assert_eq!(
            reader.read_line(None).unwrap(),
            ReadLine::Line("hello".into())
        );
        assert_eq!(
            reader.read_line(None).unwrap(),
            ReadLine::Line("world".into())
        );
        assert_eq!(reader.read_line(None).unwrap(), ReadLine::Line("".into()));
        assert_eq!(reader.read_line(None).unwrap(), ReadLine::Eof);
    }

    #[test]
    fn test_crlf_handling() {
        let (read_fd, write_fd) = create_pipe();
        let mut reader = LineReader::new(read_fd);
        let mut writer = LineWriter::new(write_fd);

        writer.write_line("line1\r\n").unwrap();
        drop(writer);

        assert_eq!(
            reader.read_line(in_ms(500)).unwrap(),
            ReadLine::Line("line1".into())
        );
    }

    #[test]
    fn test_read_times_out_without_data() {
        let (read_fd, _write_fd) = create_pipe();
        let mut reader = LineReader::new(read_fd);

        let start = Instant::now();
        assert_eq!(reader.read_line(in_ms(50)).unwrap(), ReadLine::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_partial_line_survives_timeout() {
        let (read_fd, write_fd) = create_pipe();
        let mut reader = LineReader::new(read_fd);
        let mut raw = write_fd;

        raw.write_all(b"{\"id\":").unwrap();
        assert_eq!(reader.read_line(in_ms(20)).unwrap(), ReadLine::TimedOut);

        raw.write_all(b"1}\n").unwrap();
        assert_eq!(
            reader.read_line(in_ms(500)).unwrap(),
            ReadLine::Line("{\"id\":1}".into())
        );
    }

    #[test]
    fn test_drain_ready_collects_pending_lines() {
        let (read_fd, write_fd) = create_pipe();
        let mut reader = LineReader::new(read_fd);
        let mut writer = LineWriter::new(write_fd);

        writer.write_line("stale-1").unwrap();
        writer.write_line("stale-2").unwrap();

        let (lines, closed) = reader.drain_ready().unwrap();
        assert_eq!(lines, vec!["stale-1".to_string(), "stale-2".to_string()]);
        assert!(!closed);

        drop(writer);
        let (lines, closed) = reader.drain_ready().unwrap();
        assert!(lines.is_empty());
        assert!(closed);
    }

    #[test]
    fn test_invalid_utf8_is_an_error() {
        let (read_fd, write_fd) = create_pipe();
        let mut reader = LineReader::new(read_fd);
        let mut raw = write_fd;

        raw.write_all(&[0xff, 0xfe, b'\n']).unwrap();
        let err = reader.read_line(in_ms(500)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
