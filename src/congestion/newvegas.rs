use super::{CongestionControl, DEFAULT_MSS, INITIAL_SSTHRESH};
use crate::ledger::SampleLedger;
use crate::sender::{SenderHost, SeqNumber, TcpState};
use crate::trace::{TraceFn, Traced};
use std::time::Instant;
use tracing::debug;

const DEFAULT_INITIAL_CWND: u32 = 2;
const DEFAULT_RETX_THRESH: u32 = 3;

/// Queue-occupancy thresholds, in packets (router buffers).
const ALPHA: f64 = 2.0;
const BETA: f64 = 4.0;
const GAMMA: f64 = 1.0;

/// Base RTT starts at ~10 seconds so any real sample replaces it.
const BASE_RTT_SENTINEL: i64 = 9_999_999_999;

/// A Vegas variant: rate-based congestion avoidance driven by the spread
/// between expected throughput (at the base RTT) and actual throughput
/// (at the last measured RTT), with an ACK-clocked retransmit re-check
/// instead of a duplicate-ACK threshold.
///
/// Every send is logged in a [`SampleLedger`]; an entry whose accumulated
/// byte count is at most one segment marks a lone segment in its RTT, whose
/// measurement is taken as the new base RTT unconditionally.
pub struct NewVegas {
    cwnd: Traced<u32>,
    ssthresh: u32,
    /// Initial window in MSS units; immutable once the connection opens.
    initial_cwnd: u32,
    mss: u32,
    in_fast_rec: bool,
    opened: bool,
    retx_thresh: u32,

    /// Minimum observed RTT, in nanoseconds.
    base_rtt: Traced<i64>,
    /// (expected - actual) rate spread, in packets.
    diff: f64,
    slow_start: bool,
    /// Alternating doubler: slow start doubles the window on every other
    /// ACK.
    slow_start_bool: bool,
    /// After a duplicate-ACK event, re-check the RTO against per-packet
    /// elapsed time for this many further ACKs.
    check_retransmit: u8,
    info: SampleLedger,
}

impl Default for NewVegas {
    fn default() -> Self {
        Self::new()
    }
}

impl NewVegas {
    pub fn new() -> Self {
        Self {
            cwnd: Traced::new(0),
            ssthresh: INITIAL_SSTHRESH,
            initial_cwnd: DEFAULT_INITIAL_CWND,
            mss: DEFAULT_MSS,
            in_fast_rec: false,
            opened: false,
            retx_thresh: DEFAULT_RETX_THRESH,
            base_rtt: Traced::new(BASE_RTT_SENTINEL),
            diff: 0.0,
            slow_start: true,
            slow_start_bool: true,
            check_retransmit: 0,
            info: SampleLedger::new(),
        }
    }

    pub fn set_seg_size(&mut self, mss: u32) {
        assert!(
            !self.opened,
            "NewVegas::set_seg_size: cannot change the segment size after the connection started"
        );
        self.mss = mss;
    }

    pub fn set_initial_cwnd(&mut self, segments: u32) {
        assert!(
            !self.opened,
            "NewVegas::set_initial_cwnd: cannot change the initial window after the connection started"
        );
        self.initial_cwnd = segments;
    }

    pub fn set_ssthresh(&mut self, threshold: u32) {
        self.ssthresh = threshold;
    }

    pub fn seg_size(&self) -> u32 {
        self.mss
    }

    /// Minimum observed RTT in nanoseconds.
    pub fn base_rtt(&self) -> i64 {
        self.base_rtt.get()
    }

    pub fn diff(&self) -> f64 {
        self.diff
    }

    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    pub fn ledger(&self) -> &SampleLedger {
        &self.info
    }

    /// Attach a `(old, new)` observer to the base RTT (nanoseconds).
    pub fn subscribe_base_rtt(&mut self, cb: TraceFn<i64>) {
        self.base_rtt.subscribe(cb);
    }

    /// Measure the RTT of the acknowledged segment and recompute the rate
    /// spread. A segment with at most one MSS sent in its RTT resets the
    /// base RTT outright; otherwise only a lower measurement updates it.
    fn estimate_diff(&mut self, seq: SeqNumber, now: Instant) {
        let Some(entry) = self.info.first(seq) else {
            // No sample for this ACK (e.g. the handshake); keep the last
            // spread.
            return;
        };

        let last_rtt = now.saturating_duration_since(entry.sent_time).as_nanos() as i64;
        let bytes = entry.bytes;

        if bytes <= self.mss {
            self.base_rtt.set(last_rtt);
            debug!(base_rtt = last_rtt, "reset base rtt");
        } else if last_rtt < self.base_rtt.get() {
            self.base_rtt.set(last_rtt);
            debug!(base_rtt = last_rtt, "updated base rtt");
        }

        let cwnd = f64::from(self.cwnd.get());
        let base = self.base_rtt.get() as f64;
        let last = last_rtt as f64;

        let mut diff = cwnd / base - cwnd / last;
        diff *= base;
        diff /= f64::from(self.mss);
        self.diff = diff;

        debug!(
            base_rtt = self.base_rtt.get(),
            last_rtt,
            cwnd = self.cwnd.get(),
            bytes,
            diff = self.diff,
            "estimated rate spread"
        );
    }

    fn slow_start_step(&mut self) {
        if self.slow_start_bool {
            self.cwnd.set(self.cwnd.get().saturating_mul(2));
        }
        self.slow_start_bool = !self.slow_start_bool;
        debug!(cwnd = self.cwnd.get(), "in slow start");
    }

    fn congestion_avoidance(&mut self) {
        if self.diff < ALPHA {
            self.cwnd.set(self.cwnd.get().saturating_add(self.mss));
            debug!(cwnd = self.cwnd.get(), "spread below alpha, window up");
        } else if BETA < self.diff && self.cwnd.get() > 2 * self.mss {
            self.cwnd.set(self.cwnd.get() - self.mss);
            debug!(cwnd = self.cwnd.get(), "spread above beta, window down");
        }
    }
}

impl CongestionControl for NewVegas {
    fn on_open(&mut self) {
        self.cwnd.set(self.initial_cwnd * self.mss);
        self.opened = true;
    }

    fn on_new_ack(&mut self, seq: SeqNumber, host: &mut dyn SenderHost, now: Instant) {
        self.estimate_diff(seq, now);

        // More than one router buffer occupied: the pipe is found, leave
        // slow start for good.
        if self.diff > GAMMA {
            self.slow_start = false;
        }

        if self.slow_start {
            self.slow_start_step();
        } else {
            self.congestion_avoidance();
        }

        host.advance_ack(seq);

        // First new ACK after fast recovery deflates to 3/4.
        if self.in_fast_rec {
            let reduced = (u64::from(self.cwnd.get()) * 3 / 4) as u32;
            self.cwnd.set(reduced);
            self.in_fast_rec = false;
            debug!(cwnd = reduced, "left fast recovery");
        }

        if self.check_retransmit > 0 {
            match self.info.last(seq) {
                Some(entry) => {
                    let elapsed = now.saturating_duration_since(entry.sent_time);
                    if host.rto() < elapsed {
                        debug!(?elapsed, "ack older than rto, retransmitting");
                        host.restart_from_head();
                        host.retransmit_head();
                        self.check_retransmit = 2;
                    } else {
                        self.check_retransmit -= 1;
                    }
                }
                None => self.check_retransmit -= 1,
            }
        }

        self.info.discard_up_to(seq);
    }

    fn on_dup_ack(&mut self, seq: SeqNumber, _count: u32, host: &mut dyn SenderHost, now: Instant) {
        if !self.in_fast_rec {
            let Some(entry) = self.info.first(seq) else {
                return;
            };
            let elapsed = now.saturating_duration_since(entry.sent_time);
            if host.rto() < elapsed {
                self.ssthresh = (2 * self.mss).max(host.bytes_in_flight() / 2);
                self.cwnd.set(self.ssthresh + 3 * self.mss);
                self.in_fast_rec = true;
                self.check_retransmit = 2;
                debug!(
                    cwnd = self.cwnd.get(),
                    ssthresh = self.ssthresh,
                    "dupack past rto, entering fast recovery"
                );
                host.retransmit_head();
            }
        } else {
            self.cwnd.set(self.cwnd.get().saturating_add(self.mss));
            host.send_pending();
        }
    }

    fn on_rto(&mut self, host: &mut dyn SenderHost, _now: Instant) {
        self.in_fast_rec = false;

        let state = host.state();
        if state == TcpState::Closed || state == TcpState::TimeWait {
            return;
        }
        if state <= TcpState::Established && host.head_sequence() >= host.high_tx_mark() {
            return;
        }

        // "TCP Vegas Revisited": collapse to two segments, not one.
        self.cwnd.set(2 * self.mss);
        self.slow_start = true;

        self.ssthresh = (2 * self.mss).max(host.bytes_in_flight() / 2);

        host.restart_from_head();
        debug!(
            cwnd = self.cwnd.get(),
            ssthresh = self.ssthresh,
            "rto, back to slow start"
        );
        host.double_rto();
        host.retransmit_head();
    }

    fn on_segment_sent(&mut self, seq_end: SeqNumber, bytes: u32, now: Instant) {
        self.info.discard(seq_end);
        self.info.add(seq_end, now);
        self.info.add_bytes(bytes);
    }

    fn cwnd(&self) -> u32 {
        self.cwnd.get()
    }

    fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    fn in_fast_recovery(&self) -> bool {
        self.in_fast_rec
    }

    fn retx_thresh(&self) -> u32 {
        self.retx_thresh
    }

    fn subscribe_cwnd(&mut self, cb: TraceFn<u32>) {
        self.cwnd.subscribe(cb);
    }
}
