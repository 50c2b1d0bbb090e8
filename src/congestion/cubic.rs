use super::{CongestionControl, DEFAULT_MSS, INITIAL_SSTHRESH};
use crate::sender::{SenderHost, SeqNumber, TcpState};
use crate::trace::{TraceFn, Traced};
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_INITIAL_CWND: u32 = 1;

/// Tunables of the CUBIC controller. `beta` is the multiplicative decrease
/// factor in (0, 1]; `c` is the cubic scaling constant, strictly positive.
#[derive(Debug, Clone)]
pub struct CubicConfig {
    pub retx_thresh: u32,
    pub limited_transmit: bool,
    pub tcp_friendliness: bool,
    pub fast_convergence: bool,
    pub beta: f64,
    pub c: f64,
}

impl Default for CubicConfig {
    fn default() -> Self {
        Self {
            retx_thresh: 3,
            limited_transmit: false,
            tcp_friendliness: true,
            fast_convergence: true,
            beta: 0.2,
            c: 0.4,
        }
    }
}

/// CUBIC congestion control.
///
/// Window growth in congestion avoidance follows the cubic curve
/// `W(t) = C (t - K)^3 + origin_point` anchored at the window reached
/// before the last loss, with an optional TCP-friendly region tracking the
/// window a Reno flow would have earned from the same ACK stream.
pub struct Cubic {
    cwnd: Traced<u32>,
    ssthresh: u32,
    /// Initial window in MSS units; immutable once the connection opens.
    initial_cwnd: u32,
    mss: u32,
    in_fast_rec: bool,
    opened: bool,
    cfg: CubicConfig,

    /// Window at the last loss event, in MSS units.
    w_last_max: f64,
    /// Wall time of the last loss event.
    w_last_time: Option<Instant>,
    /// Start of the current cubic epoch; `None` until the first CA ACK
    /// after a loss.
    epoch_start: Option<Instant>,
    /// Plateau window of the current epoch (MSS units).
    origin_point: f64,
    /// Minimum RTT observed on this connection; zero means unset.
    d_min: Duration,
    /// Shadow window of the TCP-friendly region (MSS units).
    w_tcp: f64,
    /// Time from epoch start to the plateau, in seconds.
    k: f64,
    ack_cnt: u32,
    cwnd_cnt: u32,
}

impl Default for Cubic {
    fn default() -> Self {
        Self::new()
    }
}

impl Cubic {
    pub fn new() -> Self {
        Self::with_config(CubicConfig::default())
    }

    pub fn with_config(cfg: CubicConfig) -> Self {
        assert!(
            cfg.beta > 0.0 && cfg.beta <= 1.0,
            "Cubic beta must lie in (0, 1], got {}",
            cfg.beta
        );
        assert!(cfg.c > 0.0, "Cubic C must be positive, got {}", cfg.c);
        let mut cubic = Self {
            cwnd: Traced::new(0),
            ssthresh: INITIAL_SSTHRESH,
            initial_cwnd: DEFAULT_INITIAL_CWND,
            mss: DEFAULT_MSS,
            in_fast_rec: false,
            opened: false,
            cfg,
            w_last_max: 0.0,
            w_last_time: None,
            epoch_start: None,
            origin_point: 0.0,
            d_min: Duration::ZERO,
            w_tcp: 0.0,
            k: 0.0,
            ack_cnt: 0,
            cwnd_cnt: 0,
        };
        cubic.cubic_reset();
        cubic
    }

    pub fn set_seg_size(&mut self, mss: u32) {
        assert!(
            !self.opened,
            "Cubic::set_seg_size: cannot change the segment size after the connection started"
        );
        self.mss = mss;
    }

    pub fn set_initial_cwnd(&mut self, segments: u32) {
        assert!(
            !self.opened,
            "Cubic::set_initial_cwnd: cannot change the initial window after the connection started"
        );
        self.initial_cwnd = segments;
    }

    pub fn set_ssthresh(&mut self, threshold: u32) {
        self.ssthresh = threshold;
    }

    pub fn seg_size(&self) -> u32 {
        self.mss
    }

    pub fn initial_cwnd(&self) -> u32 {
        self.initial_cwnd
    }

    pub fn min_rtt(&self) -> Duration {
        self.d_min
    }

    fn cubic_reset(&mut self) {
        self.w_last_max = 0.0;
        self.epoch_start = None;
        self.origin_point = 0.0;
        self.d_min = Duration::ZERO;
        self.w_tcp = 0.0;
        self.k = 0.0;
        self.ack_cnt = 0;
        self.w_last_time = None;
    }

    /// One congestion-avoidance step of the cubic law. Returns the number
    /// of ACKs that must accumulate in `cwnd_cnt` before the window grows
    /// by one segment.
    fn cubic_update(&mut self, now: Instant) -> f64 {
        let w = f64::from(self.cwnd.get() / self.mss);

        self.ack_cnt += 1;

        if self.epoch_start.is_none() {
            self.epoch_start = Some(now);
            debug!(w, w_last_max = self.w_last_max, "starting new cubic epoch");
            if w < self.w_last_max {
                self.k = ((self.w_last_max - w) / self.cfg.c).powf(1.0 / 3.0);
                self.origin_point = self.w_last_max;
            } else {
                self.k = 0.0;
                self.origin_point = w;
            }
            self.ack_cnt = 1;
            self.w_tcp = w;
        }
        let epoch_start = self.epoch_start.unwrap_or(now);

        let t = (now.saturating_duration_since(epoch_start) + self.d_min).as_secs_f64();
        let target = self.origin_point + self.cfg.c * (t - self.k).powi(3);

        let cnt = if target > w {
            w / (target - w)
        } else {
            // Far above the curve; effectively freeze growth.
            100.0 * w
        };

        if self.cfg.tcp_friendliness {
            self.cubic_tcp_friendliness(cnt)
        } else {
            cnt
        }
    }

    /// Clamp the growth interval so the window never falls behind what a
    /// Reno flow would have reached (increase rate `3b/(2-b)` per ACK).
    fn cubic_tcp_friendliness(&mut self, mut cnt: f64) -> f64 {
        let w = f64::from(self.cwnd.get() / self.mss);
        self.w_tcp += 3.0 * self.cfg.beta / (2.0 - self.cfg.beta) * f64::from(self.ack_cnt) / w;

        self.ack_cnt = 0;

        if self.w_tcp > w {
            let max_cnt = w / (self.w_tcp - w);
            if cnt > max_cnt {
                cnt = max_cnt;
            }
        }

        cnt
    }
}

impl CongestionControl for Cubic {
    fn on_open(&mut self) {
        self.cwnd.set(self.initial_cwnd * self.mss);
        self.opened = true;
    }

    fn on_new_ack(&mut self, seq: SeqNumber, host: &mut dyn SenderHost, now: Instant) {
        debug!(
            %seq,
            cwnd = self.cwnd.get(),
            ssthresh = self.ssthresh,
            "cubic new ack"
        );

        // First new ACK after fast recovery: deflate to (1 - beta) of the
        // window and refresh the loss bookkeeping.
        if self.in_fast_rec {
            self.epoch_start = None;
            let w = f64::from(self.cwnd.get() / self.mss);
            let due = self
                .w_last_time
                .is_none_or(|t| now > t + Duration::from_secs_f64(0.1 * self.k));
            if due {
                if w < self.w_last_max && self.cfg.fast_convergence {
                    self.w_last_max = w * (2.0 - self.cfg.beta) / 2.0;
                } else {
                    self.w_last_max = w;
                }
            }
            self.w_last_time = Some(now);
            let reduced = (f64::from(self.cwnd.get()) * (1.0 - self.cfg.beta)) as u32;
            self.cwnd.set(reduced);
            self.ssthresh = reduced;
            self.in_fast_rec = false;
            debug!(cwnd = reduced, "left fast recovery");
        }

        let rtt = host.last_rtt();
        if self.d_min.is_zero() {
            self.d_min = rtt;
        } else {
            self.d_min = self.d_min.min(rtt);
        }

        if self.cwnd.get() <= self.ssthresh {
            self.cwnd.set(self.cwnd.get() + self.mss);
        } else {
            let cnt = self.cubic_update(now);
            if cnt < f64::from(self.cwnd_cnt) {
                self.cwnd.set(self.cwnd.get() + self.mss);
                self.cwnd_cnt = 0;
            } else {
                self.cwnd_cnt += 1;
            }
        }

        host.advance_ack(seq);
    }

    fn on_dup_ack(&mut self, _seq: SeqNumber, count: u32, host: &mut dyn SenderHost, _now: Instant) {
        if count == self.cfg.retx_thresh && !self.in_fast_rec {
            self.ssthresh = (2 * self.mss).max(host.bytes_in_flight() / 2);
            self.cwnd.set(self.ssthresh + 3 * self.mss);
            self.in_fast_rec = true;
            debug!(
                cwnd = self.cwnd.get(),
                ssthresh = self.ssthresh,
                "triple dupack, entering fast recovery"
            );
            host.retransmit_head();
        } else if self.in_fast_rec {
            self.cwnd.set(self.cwnd.get() + self.mss);
            host.send_pending();
        }
    }

    fn on_rto(&mut self, host: &mut dyn SenderHost, _now: Instant) {
        self.in_fast_rec = false;

        let state = host.state();
        // A timeout can outlive its connection; ignore it in terminal
        // states or when everything sent has been acknowledged.
        if state == TcpState::Closed || state == TcpState::TimeWait {
            return;
        }
        if state <= TcpState::Established && host.head_sequence() >= host.high_tx_mark() {
            return;
        }

        self.cubic_reset();

        self.ssthresh = (2 * self.mss).max(host.bytes_in_flight() / 2);
        self.cwnd.set(self.mss);
        host.restart_from_head();
        debug!(
            cwnd = self.cwnd.get(),
            ssthresh = self.ssthresh,
            "rto, back to slow start"
        );
        host.double_rto();
        host.retransmit_head();
    }

    fn on_segment_sent(&mut self, _seq_end: SeqNumber, _bytes: u32, _now: Instant) {}

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
        self.cfg.retx_thresh
    }

    fn subscribe_cwnd(&mut self, cb: TraceFn<u32>) {
        self.cwnd.subscribe(cb);
    }
}
