use std::fmt;
use std::time::Duration;

/// Sequence number of a byte within a connection's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SeqNumber(pub u32);

impl SeqNumber {
    pub fn wrapping_add(self, val: u32) -> Self {
        SeqNumber(self.0.wrapping_add(val))
    }
}

impl From<u32> for SeqNumber {
    fn from(val: u32) -> Self {
        SeqNumber(val)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// TCP connection states, ordered as the base sender orders them so that
/// `state <= Established` selects the pre-closing half of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

/// The surface a host TCP sender exposes to its congestion controller.
///
/// A controller reshapes its window from the four events and commands the
/// base sender only through this trait; it never reaches into sender
/// internals. All byte quantities refer to the connection the controller
/// is attached to.
pub trait SenderHost {
    /// Bytes sent but not yet cumulatively acknowledged.
    fn bytes_in_flight(&self) -> u32;

    /// Most recent RTT measurement.
    fn last_rtt(&self) -> Duration;

    /// Current retransmission timeout.
    fn rto(&self) -> Duration;

    fn state(&self) -> TcpState;

    /// Head of the transmit buffer, i.e. the highest cumulative ACK.
    fn head_sequence(&self) -> SeqNumber;

    /// Highest sequence number transmitted so far.
    fn high_tx_mark(&self) -> SeqNumber;

    /// Base new-ACK processing: advance the send buffer and rearm timers.
    fn advance_ack(&mut self, seq: SeqNumber);

    /// Rewind the next transmission point to the head of the tx buffer.
    fn restart_from_head(&mut self);

    /// Retransmit the segment at the head of the tx buffer.
    fn retransmit_head(&mut self);

    /// Double the retransmission timeout (exponential backoff).
    fn double_rto(&mut self);

    /// Try to send more pending data under the current window.
    fn send_pending(&mut self);
}
