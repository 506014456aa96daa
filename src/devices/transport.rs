use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::info;

/// Line-oriented link to an instrument. Dropping the transport closes it.
pub trait Transport {
    /// Write one command followed by the line terminator.
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Block until a full line arrives or the timeout elapses.
    ///
    /// Returns `io::ErrorKind::TimedOut` if no terminator was seen in time.
    fn read_line(&mut self) -> io::Result<String>;

    /// Discard anything the instrument sent that has not been read yet.
    fn clear_input(&mut self) -> io::Result<()>;

    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

pub const LINE_TERMINATOR: &str = "\r\n";

/// Pause after a read that returned nothing
const IDLE_POLL: Duration = Duration::from_millis(10);

/// A byte source whose individual reads can be bounded.
pub trait TimedRead: Read {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl TimedRead for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout).map_err(io::Error::from)
    }
}

/// Splits a byte stream into LF-terminated lines.
///
/// Bytes after a terminator stay buffered for the next call.
pub struct LineReader<R> {
    inner: R,
    timeout: Duration,
    pending: Vec<u8>,
}

impl<R: TimedRead> LineReader<R> {
    pub fn new(inner: R, timeout: Duration) -> Self {
        LineReader {
            inner,
            timeout,
            pending: Vec::new(),
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.inner.set_read_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }

    pub fn read_line(&mut self) -> io::Result<String> {
        let line = self.read_until_deadline();
        // Per-read timeouts were shrunk towards the deadline
        self.inner.set_read_timeout(self.timeout)?;
        line
    }

    fn read_until_deadline(&mut self) -> io::Result<String> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0_u8; 1024];

        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no line terminator within {:?}", self.timeout),
                ));
            }
            self.inner.set_read_timeout(remaining)?;

            match self.inner.read(&mut buf) {
                Ok(0) => std::thread::sleep(IDLE_POLL.min(remaining)),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct SerialTransport {
    reader: LineReader<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> serialport::Result<Self> {
        info!("Opening serial port {} at {} baud", port_name, baud_rate);
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .open()?;
        Ok(SerialTransport {
            reader: LineReader::new(port, timeout),
        })
    }
}

impl Transport for SerialTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let framed = format!("{}{}", line, LINE_TERMINATOR);
        let port = self.reader.get_mut();
        port.write_all(framed.as_bytes())?;
        port.flush()
    }

    fn read_line(&mut self) -> io::Result<String> {
        self.reader.read_line()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.reader.clear_pending();
        self.reader
            .get_mut()
            .clear(ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn timeout(&self) -> Duration {
        self.reader.timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.reader.set_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out one scripted chunk per read, then times out.
    #[derive(Default)]
    struct ScriptedPort {
        chunks: VecDeque<Vec<u8>>,
        read_timeouts: Vec<Duration>,
    }

    impl ScriptedPort {
        fn new(chunks: &[&str]) -> Self {
            ScriptedPort {
                chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
                read_timeouts: Vec::new(),
            }
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl TimedRead for ScriptedPort {
        fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            self.read_timeouts.push(timeout);
            Ok(())
        }
    }

    fn reader(chunks: &[&str]) -> LineReader<ScriptedPort> {
        LineReader::new(ScriptedPort::new(chunks), Duration::from_millis(50))
    }

    #[test]
    fn line_split_across_reads() {
        let mut r = reader(&["1.23E-9,1.2", "4E-9\n"]);
        assert_eq!(r.read_line().unwrap(), "1.23E-9,1.24E-9");
    }

    #[test]
    fn second_line_in_same_read_is_kept() {
        let mut r = reader(&["1\nKEITHLEY INSTRUMENTS INC.\n"]);
        assert_eq!(r.read_line().unwrap(), "1");
        assert_eq!(r.read_line().unwrap(), "KEITHLEY INSTRUMENTS INC.");
        assert!(r.get_mut().chunks.is_empty());
    }

    #[test]
    fn partial_line_times_out() {
        let mut r = reader(&["1.0E-9,2.0"]);
        let err = r.read_line().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn crlf_is_trimmed() {
        let mut r = reader(&["MODEL 6485\r\n"]);
        assert_eq!(r.read_line().unwrap(), "MODEL 6485");
    }

    #[test]
    fn read_timeout_is_restored_after_a_line() {
        let mut r = reader(&["1\n"]);
        r.read_line().unwrap();
        let timeouts = &r.get_mut().read_timeouts;
        assert_eq!(timeouts.last(), Some(&Duration::from_millis(50)));
        assert!(timeouts[..timeouts.len() - 1]
            .iter()
            .all(|t| *t <= Duration::from_millis(50)));
    }

    #[test]
    fn empty_reads_wait_for_the_deadline() {
        struct Silent;
        impl Read for Silent {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }
        impl TimedRead for Silent {
            fn set_read_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
                Ok(())
            }
        }

        let mut r = LineReader::new(Silent, Duration::from_millis(30));
        let started = Instant::now();
        let err = r.read_line().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
