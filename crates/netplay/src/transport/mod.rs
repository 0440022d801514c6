//! Connection-oriented byte transport driven by polling.
//!
//! Nothing here knows about envelopes. A [`Transport`] moves opaque bytes
//! between connection handles and never blocks the caller: an empty read is
//! reported as [`TransportError::WouldBlock`].

pub mod memory;
pub mod tcp;

use std::fmt;

/// Opaque per-connection handle issued by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Outbound connection could not be established.
    #[error("could not connect to {address}: {reason}")]
    ConnectionFailed {
        /// Address that was dialled.
        address: String,
        /// Underlying cause.
        reason: String,
    },

    /// The connection is gone; the peer must be treated as dropped.
    #[error("connection {0} lost")]
    ConnectionLost(ConnectionHandle),

    /// No data available right now.
    #[error("operation would block")]
    WouldBlock,

    /// The handle was never issued or is already closed.
    #[error("unknown connection {0}")]
    UnknownHandle(ConnectionHandle),

    /// Listening socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-blocking stream transport.
pub trait Transport {
    /// Start accepting connections on `port`.
    fn listen(&mut self, port: u16) -> Result<(), TransportError>;

    /// Start opening a connection to `address`. Returns before the handshake
    /// finishes; see [`Transport::is_connected`].
    fn connect(&mut self, address: &str) -> Result<ConnectionHandle, TransportError>;

    /// Whether an outbound connection has finished its handshake. A connect
    /// that failed reports [`TransportError::ConnectionFailed`].
    fn is_connected(&mut self, _handle: ConnectionHandle) -> Result<bool, TransportError> {
        Ok(true)
    }

    /// Take the next pending incoming connection, if any.
    fn accept(&mut self) -> Result<Option<ConnectionHandle>, TransportError>;

    /// Queue bytes for delivery. Success does not mean the peer received them.
    /// A peer that stopped reading is reported as [`TransportError::ConnectionLost`].
    fn send(&mut self, handle: ConnectionHandle, bytes: &[u8]) -> Result<(), TransportError>;

    /// Next available bytes, or [`TransportError::WouldBlock`].
    fn receive(&mut self, handle: ConnectionHandle) -> Result<Vec<u8>, TransportError>;

    /// Push any bytes still held back by the transport.
    fn flush(&mut self, _handle: ConnectionHandle) -> Result<(), TransportError> {
        Ok(())
    }

    /// Bytes accepted by `send` that have not left for the peer yet.
    fn backlog(&self, _handle: ConnectionHandle) -> usize {
        0
    }

    /// Close a connection. Unknown handles are ignored.
    fn close(&mut self, handle: ConnectionHandle);

    /// Textual address of the remote end.
    fn peer_address(&self, handle: ConnectionHandle) -> Option<String>;

    /// Lazily drain pending incoming connections.
    fn incoming(&mut self) -> Incoming<'_, Self>
    where
        Self: Sized,
    {
        Incoming { transport: self }
    }
}

/// Iterator over pending incoming connections; ends when none are pending.
pub struct Incoming<'a, T: Transport> {
    transport: &'a mut T,
}

impl<T: Transport> Iterator for Incoming<'_, T> {
    type Item = ConnectionHandle;

    fn next(&mut self) -> Option<ConnectionHandle> {
        match self.transport.accept() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Accept failed: {e}");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Port mapping
// ---------------------------------------------------------------------------

/// Port-mapping failures. Always best-effort: callers log and continue.
#[derive(Debug, thiserror::Error)]
pub enum PortMappingError {
    /// No mapping device answered.
    #[error("no port mapping device available")]
    Unavailable,

    /// The device refused the request.
    #[error("port mapping refused: {0}")]
    Refused(String),
}

/// Optional capability to open a port on the local gateway.
pub trait PortMapper {
    /// Redirect `port` on the gateway to this machine.
    fn add_redirect(&mut self, port: u16) -> Result<(), PortMappingError>;

    /// Remove a redirect added earlier.
    fn remove_redirect(&mut self, port: u16) -> Result<(), PortMappingError>;
}

/// Port mapper that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPortMapping;

impl PortMapper for NoPortMapping {
    fn add_redirect(&mut self, _port: u16) -> Result<(), PortMappingError> {
        Ok(())
    }

    fn remove_redirect(&mut self, _port: u16) -> Result<(), PortMappingError> {
        Ok(())
    }
}
