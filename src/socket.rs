use crate::defs::{MAX_LINE_LENGTH, SOCKET_CONNECT_TIMEOUT, SOCKET_POLL_TIMEOUT};

use encoding_rs::Encoding;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

/// Line-framed text connection to one of the terminal's socket servers.
///
/// `receive` must tell "nothing buffered yet" (`Ok(None)`) apart from a broken
/// stream (`Err`). The transport polls every connector from a single thread and
/// never blocks on it for longer than a short poll interval.
pub trait LineConnector: Send {
    /// Establishes the connection. Lines are encoded and decoded with `charset`.
    fn open(&mut self, charset: &'static Encoding) -> io::Result<()>;

    /// Writes one line followed by `\n` and flushes it.
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`], before writing anything, if
    /// the line cannot be represented in the charset.
    fn send(&mut self, line: &str) -> io::Result<()>;

    /// Returns the next complete line without its terminator, or `None` if
    /// no complete line is available right now.
    fn receive(&mut self) -> io::Result<Option<String>>;

    /// Drops the connection. Calling it on a closed connector is a no-op.
    fn close(&mut self);

    /// Whether `open` succeeded and `close` was not called since.
    fn is_open(&self) -> bool;
}

/// [`LineConnector`] over a TCP stream.
#[derive(Debug)]
pub struct SocketConnector {
    host: String,
    port: u16,
    charset: &'static Encoding,
    stream: Option<TcpStream>,
    /// Bytes read from the stream that do not form a complete line yet.
    pending: Vec<u8>,
    max_line_length: usize,
}

impl SocketConnector {
    /// Creates a closed connector for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            charset: encoding_rs::UTF_8,
            stream: None,
            pending: Vec::new(),
            max_line_length: MAX_LINE_LENGTH,
        }
    }

    /// Caps the length of an inbound line, terminator excluded.
    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    /// Address this connector dials, as `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, SOCKET_CONNECT_TIMEOUT) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve to any address", self.addr()),
            )
        }))
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let (text, _) = self.charset.decode_without_bom_handling(&line);
        Some(text.into_owned())
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket connector is not open")
}

impl LineConnector for SocketConnector {
    fn open(&mut self, charset: &'static Encoding) -> io::Result<()> {
        self.close();
        log::debug!("Connecting to {}", self.addr());
        let stream = self.connect()?;
        stream.set_nodelay(true)?;
        // Reads give up quickly so the caller can tell "no data" from "broken".
        stream.set_read_timeout(Some(SOCKET_POLL_TIMEOUT))?;
        stream.set_write_timeout(Some(SOCKET_CONNECT_TIMEOUT))?;
        self.charset = charset;
        self.stream = Some(stream);
        log::debug!("Connected to {} ({})", self.addr(), charset.name());
        Ok(())
    }

    fn send(&mut self, line: &str) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        let (bytes, _, had_errors) = self.charset.encode(line);
        if had_errors {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("line is not representable in {}", self.charset.name()),
            ));
        }
        stream.write_all(&bytes)?;
        stream.write_all(b"\n")?;
        stream.flush()
    }

    fn receive(&mut self) -> io::Result<Option<String>> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if self.pending.len() > self.max_line_length {
                let length = self.pending.len();
                self.pending.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "{} sent {} bytes without a line break (limit {})",
                        self.addr(),
                        length,
                        self.max_line_length
                    ),
                ));
            }
            let stream = self.stream.as_mut().ok_or_else(not_connected)?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "terminal closed the connection",
                    ));
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            log::debug!("Closed connection to {}", self.addr());
        }
        self.pending.clear();
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for SocketConnector {
    fn drop(&mut self) {
        self.close();
    }
}
