use crate::error::SocketError;
use crate::socket::{SocketHandle, StreamSocket};
use std::cell::RefCell;
use std::net::SocketAddrV4;
use std::rc::Rc;
use tracing::debug;

/// Default chunk handed to the socket per write.
pub const DEFAULT_SEND_SIZE: usize = 512;

/// Byte written at stream offset `offset`; lets a receiver verify ordering
/// without buffering the whole transfer.
pub fn fill_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// An application that pushes a fixed amount of traffic into a stream
/// socket as fast as the send buffer accepts it.
///
/// Writing stops when the buffer fills and resumes from the send-ready
/// callback; once `max_bytes` have been accepted the socket is closed.
/// `max_bytes == 0` means unlimited.
pub struct BulkSender {
    socket: SocketHandle,
    send_size: usize,
    max_bytes: u64,
    total_bytes: u64,
    connected: bool,
}

impl BulkSender {
    pub fn new(socket: SocketHandle, max_bytes: u64) -> Self {
        Self {
            socket,
            send_size: DEFAULT_SEND_SIZE,
            max_bytes,
            total_bytes: 0,
            connected: false,
        }
    }

    pub fn with_send_size(socket: SocketHandle, max_bytes: u64, send_size: usize) -> Self {
        Self {
            send_size,
            ..Self::new(socket, max_bytes)
        }
    }

    /// Total bytes accepted by the socket so far.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bind, connect and start pumping data.
    pub fn start(
        app: &Rc<RefCell<Self>>,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Result<(), SocketError> {
        let socket = app.borrow().socket.clone();
        socket.borrow_mut().bind(local)?;

        let weak = Rc::downgrade(app);
        socket
            .borrow_mut()
            .set_send_callback(Box::new(move |_, _available| {
                if let Some(app) = weak.upgrade() {
                    Self::send_data(&app);
                }
            }));

        socket.borrow_mut().connect(remote)?;
        app.borrow_mut().connected = true;
        debug!(%local, %remote, "bulk sender connected");
        Self::send_data(app);
        Ok(())
    }

    fn send_data(app: &Rc<RefCell<Self>>) {
        loop {
            let (socket, offset, to_send) = {
                let this = app.borrow();
                if !this.connected {
                    return;
                }
                let mut to_send = this.send_size as u64;
                if this.max_bytes > 0 {
                    to_send = to_send.min(this.max_bytes - this.total_bytes);
                }
                if to_send == 0 {
                    break;
                }
                (this.socket.clone(), this.total_bytes, to_send as usize)
            };

            let chunk: Vec<u8> = (0..to_send as u64)
                .map(|i| fill_byte(offset + i))
                .collect();

            let accepted = match socket.borrow_mut().send(&chunk) {
                Ok(n) => n,
                Err(_) => 0,
            };
            app.borrow_mut().total_bytes += accepted as u64;

            if accepted < to_send {
                // Buffer full; the send-ready callback resumes us.
                return;
            }
        }

        let this = app.borrow();
        if this.max_bytes > 0 && this.total_bytes >= this.max_bytes {
            debug!(total = this.total_bytes, "bulk sender done, closing");
            this.socket.borrow_mut().close();
        }
    }
}
