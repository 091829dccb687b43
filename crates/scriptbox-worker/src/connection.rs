//! Control connection to the harness.
//!
//! Wraps a byte stream with the NUL-delimited framing: inbound bytes are
//! accumulated until complete records are available, outbound responses are
//! encoded and written whole.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use scriptbox_protocol::{encode_frame, FrameDecoder, ProtocolError, Response};
use tracing::{debug, trace};

use crate::error::{Result, WorkerError};

const READ_CHUNK: usize = 64 * 1024;

/// Frames decoded from one read, in arrival order.
pub type Frames = Vec<std::result::Result<Vec<u8>, ProtocolError>>;

/// Byte stream the connection runs over.
pub trait Transport: Read + Write {
    /// Close both directions.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Peer description for logs.
    fn peer(&self) -> String;
}

impl Transport for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

/// A framed connection.
pub struct Connection<T: Transport> {
    transport: T,
    decoder: FrameDecoder,
    buffer: Vec<u8>,
    open: bool,
}

impl Connection<TcpStream> {
    /// Dial the harness.
    pub fn connect(addr: SocketAddr, max_frame_bytes: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(|e| {
            WorkerError::StartupFatal(format!("failed to connect to harness at {}: {}", addr, e))
        })?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, max_frame_bytes))
    }
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, max_frame_bytes: usize) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::with_max_frame_bytes(max_frame_bytes),
            buffer: vec![0; READ_CHUNK],
            open: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn peer(&self) -> String {
        self.transport.peer()
    }

    /// Encode and write one response.
    pub fn send(&mut self, response: &Response) -> Result<()> {
        if !self.open {
            return Err(io::Error::new(ErrorKind::NotConnected, "connection closed").into());
        }
        let bytes = encode_frame(response)?;
        self.transport.write_all(&bytes)?;
        self.transport.flush()?;
        trace!(bytes = bytes.len(), status = ?response.status, "sent response");
        Ok(())
    }

    /// Read once from the transport and return the records completed by it.
    ///
    /// The returned batch may be empty when the read ended mid-record.
    /// `None` means the peer closed the stream or the connection was closed
    /// locally.
    pub fn receive(&mut self) -> Result<Option<Frames>> {
        if !self.open {
            return Ok(None);
        }
        loop {
            match self.transport.read(&mut self.buffer) {
                Ok(0) => {
                    if self.decoder.pending() > 0 {
                        debug!(pending = self.decoder.pending(), "peer closed mid-record");
                    }
                    return Ok(None);
                }
                Ok(n) => return Ok(Some(self.decoder.feed(&self.buffer[..n]))),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close the connection. Later sends fail and later receives see end of
    /// stream.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.transport.shutdown() {
            debug!(error = %e, "shutdown failed");
        }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}
