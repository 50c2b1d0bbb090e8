use thiserror::Error;

/// Errors surfaced by the host-stack socket contract and the splice proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("address already in use")]
    AddressInUse,
    #[error("no listener at the destination")]
    ConnectionRefused,
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket is closed")]
    Closed,
    #[error("operation invalid in the current socket state")]
    InvalidState,
}
