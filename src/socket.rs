use crate::error::SocketError;
use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddrV4;
use std::rc::Rc;

/// Stable identity of a socket within its host stack.
///
/// Pair lookup in the splice proxy is by id, never by pointer equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Shared handle to a host-stack socket. The whole workbench runs on a
/// single cooperative executor, so plain `Rc<RefCell<..>>` suffices.
pub type SocketHandle = Rc<RefCell<dyn StreamSocket>>;

/// Decides whether a pending inbound connection from the given peer is
/// admitted.
pub type AcceptFilter = Box<dyn FnMut(SocketAddrV4) -> bool>;

/// Invoked with the newly created socket once an admitted connection is
/// established.
pub type EstablishedFn = Box<dyn FnMut(SocketHandle, SocketAddrV4)>;

/// Invoked when a socket has bytes available to read.
pub type RecvFn = Box<dyn FnMut(SocketId)>;

/// Invoked when send-buffer space frees up; carries the bytes now free.
pub type SendFn = Box<dyn FnMut(SocketId, usize)>;

/// Invoked when the peer has closed and all queued inbound bytes have been
/// consumed.
pub type ClosedFn = Box<dyn FnMut(SocketId)>;

/// The polymorphic socket surface the host stack provides.
///
/// Everything is IPv4 and byte-stream oriented; `connect` reports success
/// or failure synchronously. Callbacks are installed by the application
/// (the proxy, the bulk sender) and invoked by the host stack between
/// events; they never preempt each other.
pub trait StreamSocket {
    fn id(&self) -> SocketId;

    fn bind(&mut self, addr: SocketAddrV4) -> Result<(), SocketError>;

    fn listen(&mut self) -> Result<(), SocketError>;

    fn connect(&mut self, addr: SocketAddrV4) -> Result<(), SocketError>;

    fn close(&mut self);

    /// Bytes queued for reading.
    fn rx_available(&self) -> usize;

    /// Free space in the send buffer.
    fn tx_available(&self) -> usize;

    /// Receive window this socket currently advertises to its peer.
    fn advertised_window(&self) -> usize;

    /// Read up to `max_bytes` queued bytes.
    fn recv(&mut self, max_bytes: usize) -> Vec<u8>;

    /// Queue bytes for sending; returns how many were accepted.
    fn send(&mut self, data: &[u8]) -> Result<usize, SocketError>;

    /// Emit a bare ACK segment carrying the current ACK and window fields.
    fn send_empty_ack(&mut self);

    fn peer(&self) -> Option<SocketAddrV4>;

    fn set_accept_callback(&mut self, filter: AcceptFilter, established: EstablishedFn);

    fn set_recv_callback(&mut self, cb: RecvFn);

    fn set_send_callback(&mut self, cb: SendFn);

    fn set_close_callback(&mut self, cb: ClosedFn);
}

/// Socket factory of the host stack, used by the proxy to open its
/// outbound legs.
pub trait StackHost {
    fn create_socket(&mut self) -> SocketHandle;
}

/// Shared handle to the host stack itself.
pub type HostHandle = Rc<RefCell<dyn StackHost>>;
