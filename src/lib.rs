//! # TCP Workbench
//!
//! The core of a transport-layer research workbench: two pluggable TCP
//! congestion-control algorithms and a transparent TCP splice proxy.
//!
//! ## Architecture
//!
//! - **Congestion control**: CUBIC and a Vegas variant ("NewVegas")
//!   implement one [`CongestionControl`] contract driven by a host sender
//!   on four events (open, new ACK, duplicate ACK, RTO). Controllers own
//!   `cwnd`/`ssthresh` and command the sender only through [`SenderHost`].
//! - **Sample ledger**: a per-connection log of outstanding sent segments
//!   feeding the NewVegas rate estimator.
//! - **Splice proxy**: terminates an inbound TCP flow and relays its byte
//!   stream to a paired outbound flow in both directions, preserving
//!   flow-control back-pressure and escaping full-window stalls.
//!
//! Everything runs on a single cooperative executor; events carry an
//! explicit `now` and nothing blocks.

pub mod congestion;
pub mod error;
pub mod ledger;
pub mod sendapp;
pub mod sender;
pub mod socket;
pub mod splice;
pub mod trace;

pub use congestion::{Algorithm, AlgorithmType, CongestionControl, Cubic, CubicConfig, NewVegas};
pub use error::SocketError;
pub use ledger::{SampleEntry, SampleLedger};
pub use sendapp::BulkSender;
pub use sender::{SenderHost, SeqNumber, TcpState};
pub use socket::{HostHandle, SocketHandle, SocketId, StackHost, StreamSocket};
pub use splice::SpliceProxy;
pub use trace::Traced;
