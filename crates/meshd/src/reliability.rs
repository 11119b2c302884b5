//! Per-end channel reliability state
//!
//! Each local channel end owns one [`Reliability`]: the sending half keeps
//! copies of unacknowledged reliable messages, the receiving half buffers
//! messages the client has not taken yet (or that arrived ahead of a gap).

use crate::timers::TimerId;
use mesh_core::seq::{is_pid_bigger, pid_distance};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Lookahead of the receive window and bound of the send window
pub const WINDOW: u32 = 64;

/// Outcome of accepting a received message id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Stored for delivery
    Buffered,
    /// Already delivered or already held
    Duplicate,
    /// Too far ahead of the next expected id
    OutOfWindow,
}

/// Copy of a reliable message kept until acknowledged
#[derive(Debug, Clone)]
pub struct SentCopy {
    pub mid: u32,
    pub payload: Vec<u8>,
    /// When the copy last left towards a neighbor
    pub timestamp: Option<Instant>,
}

#[derive(Debug)]
pub struct Reliability {
    /// Id of the next message we send
    pub mid_send: u32,
    /// Id of the next message we expect
    pub mid_recv: u32,
    /// Unacknowledged copies, oldest first
    pub sent: VecDeque<SentCopy>,
    /// Received messages not yet handed to the client, id order for reliable channels
    pub recv: VecDeque<(u32, Vec<u8>)>,
    /// Smoothed round trip estimate; zero until measured
    pub expected_delay: Duration,
    pub retry_timer: Option<TimerId>,
    pub retry_time: Duration,
    /// The client was told it may send one more message
    pub client_allowed: bool,
    /// The client wants the next delivery
    pub client_ready: bool,
}

impl Reliability {
    pub fn new() -> Self {
        Self {
            mid_send: 0,
            mid_recv: 0,
            sent: VecDeque::new(),
            recv: VecDeque::new(),
            expected_delay: Duration::ZERO,
            retry_timer: None,
            retry_time: Duration::ZERO,
            client_allowed: false,
            client_ready: true,
        }
    }

    /// Too many unacknowledged messages to accept another one
    pub fn window_full(&self) -> bool {
        self.sent
            .front()
            .map_or(false, |oldest| pid_distance(oldest.mid, self.mid_send) >= WINDOW)
    }

    /// Take the next message id and keep a copy of `payload` if reliable
    pub fn next_mid(&mut self, payload: &[u8], reliable: bool) -> u32 {
        let mid = self.mid_send;
        self.mid_send = self.mid_send.wrapping_add(1);
        if reliable {
            self.sent.push_back(SentCopy {
                mid,
                payload: payload.to_vec(),
                timestamp: None,
            });
        }
        mid
    }

    /// Store a received message for delivery
    pub fn accept(&mut self, mid: u32, payload: Vec<u8>, reliable: bool) -> Accepted {
        if !reliable {
            if !is_pid_bigger(self.mid_recv, mid) {
                self.mid_recv = mid.wrapping_add(1);
            }
            self.recv.push_back((mid, payload));
            if self.recv.len() > WINDOW as usize {
                self.recv.pop_front();
            }
            return Accepted::Buffered;
        }

        if is_pid_bigger(self.mid_recv, mid) {
            return Accepted::Duplicate;
        }
        let distance = pid_distance(self.mid_recv, mid);
        if distance >= WINDOW {
            return Accepted::OutOfWindow;
        }
        let pos = self
            .recv
            .partition_point(|(held, _)| pid_distance(self.mid_recv, *held) < distance);
        if self.recv.get(pos).map_or(false, |(held, _)| *held == mid) {
            return Accepted::Duplicate;
        }
        self.recv.insert(pos, (mid, payload));
        Accepted::Buffered
    }

    /// Next message the client may see: the expected id when reliable, the oldest otherwise
    pub fn next_deliverable(&mut self, reliable: bool) -> Option<(u32, Vec<u8>)> {
        if reliable {
            if self.recv.front().map_or(true, |(mid, _)| *mid != self.mid_recv) {
                return None;
            }
            self.mid_recv = self.mid_recv.wrapping_add(1);
        }
        self.recv.pop_front()
    }

    /// Cumulative ack and bitmap of further held ids (bit k = `ack + 1 + k`)
    pub fn ack_state(&self) -> (u32, u64) {
        let mut ack = self.mid_recv.wrapping_sub(1);
        let mut held = self.recv.iter().map(|(mid, _)| *mid).peekable();
        while held.peek() == Some(&ack.wrapping_add(1)) {
            ack = ack.wrapping_add(1);
            held.next();
        }
        let futures = held
            .map(|mid| pid_distance(ack.wrapping_add(1), mid))
            .filter(|k| *k < 64)
            .fold(0u64, |bits, k| bits | (1u64 << k));
        (ack, futures)
    }

    /// Drop every copy covered by an ack; returns the round trip of the newest timed copy
    pub fn retire(&mut self, ack: u32, futures: u64, now: Instant) -> Option<Duration> {
        let mut measured = None;
        self.sent.retain(|copy| {
            let covered = !is_pid_bigger(copy.mid, ack) || {
                let k = pid_distance(ack.wrapping_add(1), copy.mid);
                k < 64 && futures & (1u64 << k) != 0
            };
            if covered {
                if let Some(sent_at) = copy.timestamp {
                    measured = Some(now.saturating_duration_since(sent_at));
                }
            }
            !covered
        });
        measured
    }

    /// Fold a round trip measurement into the estimate
    pub fn update_delay(&mut self, measured: Duration) {
        self.expected_delay = if self.expected_delay.is_zero() {
            measured
        } else {
            (self.expected_delay * 7 + measured) / 8
        };
    }

    /// First retransmission delay after fresh progress
    pub fn retry_base(&self, retransmit_time: Duration, margin: u32) -> Duration {
        if self.expected_delay.is_zero() {
            retransmit_time
        } else {
            self.expected_delay * margin
        }
    }
}

impl Default for Reliability {
    fn default() -> Self {
        Self::new()
    }
}
