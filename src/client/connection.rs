//! Node connection
//!
//! A blocking TCP (or TLS) stream with deadline-aware reads and writes and a
//! reusable command buffer. Every I/O error closes the connection; a closed
//! connection is never handed out again.

use std::io::{self, Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use flate2::read::ZlibDecoder;

use crate::command::buffer::{
    parse_proto_header, CommandBuffer, AS_MSG_TYPE_COMPRESSED, MAX_BUFFER_SIZE, PROTO_HEADER_SIZE,
};
use crate::config::TlsConfig;
use crate::utils::{ConnectionError, Error, ErrorKind, ProtocolError, Result};

/// Underlying byte stream
enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "native-tls-backend")]
    NativeTls(Box<native_tls::TlsStream<TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Tcp(s) => s,
            #[cfg(feature = "native-tls-backend")]
            Stream::NativeTls(s) => s.get_ref(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(feature = "native-tls-backend")]
            Stream::NativeTls(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(feature = "native-tls-backend")]
            Stream::NativeTls(s) => s.write(buf),
        }
    }
}

fn write_some(stream: &mut Stream, bytes: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
    stream.tcp().set_write_timeout(timeout)?;
    stream.write(bytes)
}

/// A connection to one node
pub struct Connection {
    stream: Option<Stream>,
    addr: SocketAddr,
    deadline: Option<Instant>,
    socket_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    /// Request and response bytes
    pub(crate) buffer: CommandBuffer,
}

impl Connection {
    /// Open a plain TCP connection.
    pub fn connect(addr: SocketAddr, connect_timeout: Duration, idle_timeout: Duration) -> Result<Self> {
        let stream = open_tcp(addr, connect_timeout)?;
        Ok(Self::from_stream(Stream::Tcp(stream), addr, idle_timeout))
    }

    /// Open a TLS connection, verifying the server as `tls_name`.
    #[cfg(feature = "native-tls-backend")]
    pub fn connect_tls(
        addr: SocketAddr,
        tls_name: &str,
        tls_config: &TlsConfig,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let connector = tls_config.connector()?;
        let tcp = open_tcp(addr, connect_timeout)?;
        let sni = tls_config.sni.as_deref().unwrap_or(tls_name);
        let stream = connector
            .connect(sni, tcp)
            .map_err(|e| ConnectionError::TlsFailed(format!("TLS handshake failed: {}", e)))?;
        Ok(Self::from_stream(
            Stream::NativeTls(Box::new(stream)),
            addr,
            idle_timeout,
        ))
    }

    /// Open a connection, using TLS when configured.
    pub fn open(
        addr: SocketAddr,
        tls_name: Option<&str>,
        tls_config: Option<&TlsConfig>,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self> {
        match tls_config {
            #[cfg(feature = "native-tls-backend")]
            Some(tls) => {
                let name = tls_name.map(str::to_string).unwrap_or_else(|| addr.ip().to_string());
                Self::connect_tls(addr, &name, tls, connect_timeout, idle_timeout)
            }
            #[cfg(not(feature = "native-tls-backend"))]
            Some(_) => {
                let _ = tls_name;
                Err(ConnectionError::TlsFailed("TLS support not compiled in".to_string()).into())
            }
            None => Self::connect(addr, connect_timeout, idle_timeout),
        }
    }

    fn from_stream(stream: Stream, addr: SocketAddr, idle_timeout: Duration) -> Self {
        let idle_timeout = (!idle_timeout.is_zero()).then_some(idle_timeout);
        Self {
            stream: Some(stream),
            addr,
            deadline: None,
            socket_timeout: None,
            idle_timeout,
            idle_deadline: idle_timeout.map(|t| Instant::now() + t),
            buffer: CommandBuffer::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound the next reads and writes by an absolute deadline and a
    /// per-operation socket timeout; the smaller one applies.
    pub fn set_timeout(&mut self, deadline: Option<Instant>, socket_timeout: Duration) {
        self.deadline = deadline;
        self.socket_timeout = (!socket_timeout.is_zero()).then_some(socket_timeout);
    }

    /// Effective timeout for the next socket call, or an error if the deadline passed.
    fn next_timeout(&self) -> Result<Option<Duration>> {
        let remaining = match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ErrorKind::Timeout.into());
                }
                Some(deadline - now)
            }
            None => None,
        };
        Ok(match (remaining, self.socket_timeout) {
            (Some(r), Some(s)) => Some(r.min(s)),
            (r, s) => r.or(s),
        })
    }

    /// Write all bytes; partial writes continue until done or timed out.
    pub fn write(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let timeout = self.checked_timeout()?;
            let stream = self.stream.as_mut().ok_or(ConnectionError::Closed)?;
            match write_some(stream, bytes, timeout) {
                Ok(0) => return Err(self.fail(io::ErrorKind::WriteZero.into(), timeout)),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e, timeout)),
            }
        }
        Ok(())
    }

    /// Send the finished request held in the connection buffer.
    pub fn send_buffer(&mut self) -> Result<()> {
        let mut sent = 0;
        while sent < self.buffer.send_bytes().len() {
            let timeout = self.checked_timeout()?;
            let stream = self.stream.as_mut().ok_or(ConnectionError::Closed)?;
            match write_some(stream, &self.buffer.send_bytes()[sent..], timeout) {
                Ok(0) => return Err(self.fail(io::ErrorKind::WriteZero.into(), timeout)),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e, timeout)),
            }
        }
        Ok(())
    }

    /// Fill `buf` completely; partial reads loop until done or timed out.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let timeout = self.checked_timeout()?;
            let stream = self.stream.as_mut().ok_or(ConnectionError::Closed)?;
            let res = stream
                .tcp()
                .set_read_timeout(timeout)
                .and_then(|_| stream.read(&mut buf[filled..]));
            match res {
                Ok(0) => {
                    self.close();
                    return Err(ConnectionError::Closed.into());
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e, timeout)),
            }
        }
        Ok(())
    }

    fn checked_timeout(&mut self) -> Result<Option<Duration>> {
        match self.next_timeout() {
            Ok(t) => Ok(t),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Close and classify an I/O failure.
    fn fail(&mut self, e: io::Error, timeout: Option<Duration>) -> Error {
        self.close();
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                let ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
                ConnectionError::Timeout(ms).into()
            }
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ConnectionError::Closed.into(),
            _ => ConnectionError::Io(e).into(),
        }
    }

    /// Read one proto message into the connection buffer.
    ///
    /// Returns the proto type and body length; the body starts at offset 0 of
    /// the buffer. Compressed messages are inflated first and the returned
    /// type is that of the inner message.
    pub fn read_message(&mut self) -> Result<(u8, usize)> {
        let mut proto = [0u8; PROTO_HEADER_SIZE];
        self.read_exact(&mut proto)?;
        let (msg_type, size) = match parse_proto_header(&proto) {
            Ok(v) => v,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };
        if msg_type == AS_MSG_TYPE_COMPRESSED {
            return self.read_compressed(size);
        }
        let mut body = std::mem::take(&mut self.buffer);
        let res = body
            .receive_slice(size)
            .and_then(|slice| self.read_exact(slice));
        self.buffer = body;
        res.map(|_| (msg_type, size))
    }

    fn read_compressed(&mut self, size: usize) -> Result<(u8, usize)> {
        if size < 8 {
            self.close();
            return Err(ProtocolError::InvalidSize(size as u64).into());
        }
        let mut raw = vec![0u8; size];
        self.read_exact(&mut raw)?;
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&raw[..8]);
        let original = u64::from_be_bytes(len_bytes) as usize;
        if original > MAX_BUFFER_SIZE || original < PROTO_HEADER_SIZE {
            self.close();
            return Err(ProtocolError::InvalidSize(original as u64).into());
        }

        let mut inflated = Vec::with_capacity(original);
        let res = ZlibDecoder::new(Cursor::new(&raw[8..]))
            .take(original as u64)
            .read_to_end(&mut inflated);
        if let Err(e) = res {
            self.close();
            return Err(ProtocolError::Decompress(e.to_string()).into());
        }
        if inflated.len() != original {
            self.close();
            return Err(ProtocolError::Decompress(format!(
                "inflated {} bytes, expected {}",
                inflated.len(),
                original
            ))
            .into());
        }
        let (inner_type, inner_size) = match parse_proto_header(&inflated) {
            Ok(v) => v,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };
        if inner_size + PROTO_HEADER_SIZE != original {
            self.close();
            return Err(ProtocolError::InvalidSize(inner_size as u64).into());
        }
        let slice = self.buffer.receive_slice(inner_size)?;
        slice.copy_from_slice(&inflated[PROTO_HEADER_SIZE..]);
        Ok((inner_type, inner_size))
    }

    /// Body of the last message read.
    pub fn body(&self, len: usize) -> &[u8] {
        &self.buffer.data()[..len]
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Whether the connection sat unused past the idle timeout.
    pub fn is_idle(&self) -> bool {
        match self.idle_deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Restart the idle clock; called when the connection goes back to its pool.
    pub fn refresh(&mut self) {
        self.idle_deadline = self.idle_timeout.map(|t| Instant::now() + t);
        self.deadline = None;
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.tcp().shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_tcp(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = if connect_timeout.is_zero() {
        TcpStream::connect(addr)
    } else {
        TcpStream::connect_timeout(&addr, connect_timeout)
    }
    .map_err(|e| ConnectionError::ConnectFailed {
        host: addr.ip().to_string(),
        port: addr.port(),
        source: e,
    })?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}
