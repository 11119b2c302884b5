//! Per-link credit window of a connection
//!
//! A connection keeps one [`FlowControl`] per neighbor link: `fwd` towards
//! the next hop and `bck` towards the previous hop. The sending half tracks
//! what we may send to that neighbor; the receiving half tracks what we
//! allowed that neighbor to send us.

use crate::timers::TimerId;
use mesh_core::seq::is_pid_bigger;
use std::time::Duration;

/// Initial delay before probing for a lost credit advertisement
pub const INITIAL_POLL_TIME: Duration = Duration::from_secs(1);

/// ACK hysteresis: skip the advertisement while the neighbor has more credit left than this
pub const ACK_SLACK: u32 = 3;

/// Outcome of checking a received packet id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidCheck {
    /// Next in sequence and within credit
    Accept,
    /// Already seen (or older)
    Duplicate,
    /// Beyond the credit we advertised
    OutOfWindow,
}

#[derive(Debug, Clone)]
pub struct FlowControl {
    /// Id assigned to the next queued payload
    pub next_pid: u32,
    /// Id of the last payload handed to the neighbor
    pub last_pid_sent: u32,
    /// Id of the last payload accepted from the neighbor
    pub last_pid_recv: u32,
    /// Credit we advertised to the neighbor
    pub last_ack_sent: u32,
    /// Credit the neighbor advertised to us
    pub last_ack_recv: u32,
    /// Queued, not yet transmitted messages towards the neighbor
    pub queue_n: u32,
    pub queue_max: u32,
    pub poll_time: Duration,
    pub poll_timer: Option<TimerId>,
}

impl FlowControl {
    /// Fresh window: the first acceptable id in both halves is 0
    pub fn new(queue_max: u32) -> Self {
        Self {
            next_pid: 0,
            last_pid_sent: u32::MAX,
            last_pid_recv: u32::MAX,
            last_ack_sent: 0,
            last_ack_recv: 0,
            queue_n: 0,
            queue_max,
            poll_time: INITIAL_POLL_TIME,
            poll_timer: None,
        }
    }

    /// Is `pid` within the credit the neighbor granted?
    pub fn can_send(&self, pid: u32) -> bool {
        !is_pid_bigger(pid, self.last_ack_recv)
    }

    /// Classify a payload id received from the neighbor
    pub fn check_received(&self, pid: u32) -> PidCheck {
        if is_pid_bigger(pid, self.last_ack_sent) {
            PidCheck::OutOfWindow
        } else if !is_pid_bigger(pid, self.last_pid_recv) {
            PidCheck::Duplicate
        } else {
            PidCheck::Accept
        }
    }

    /// Free queue slots
    pub fn buffer_free(&self) -> u32 {
        self.queue_max.saturating_sub(self.queue_n)
    }

    /// Is the queue at capacity?
    pub fn is_full(&self) -> bool {
        self.queue_n >= self.queue_max
    }

    /// Take the next payload id
    pub fn assign_pid(&mut self) -> u32 {
        let pid = self.next_pid;
        self.next_pid = self.next_pid.wrapping_add(1);
        pid
    }

    /// Record a credit advertisement; true if it extended the window
    pub fn record_ack(&mut self, ack: u32) -> bool {
        if !is_pid_bigger(ack, self.last_ack_recv) {
            return false;
        }
        self.last_ack_recv = ack;
        self.poll_time = INITIAL_POLL_TIME;
        true
    }

    /// Credit to advertise given `buffer` free slots downstream.
    ///
    /// Returns `None` when no advertisement is needed: the neighbor still has
    /// more than [`ACK_SLACK`] ids of credit, or the credit would not grow.
    /// `force` (answering a poll) skips both checks.
    pub fn next_ack(&self, buffer: u32, force: bool) -> Option<u32> {
        if !force && self.last_ack_sent.wrapping_sub(self.last_pid_recv) > ACK_SLACK {
            return None;
        }
        let ack = mesh_core::seq::max_pid(self.last_pid_recv.wrapping_add(buffer), self.last_ack_sent);
        if ack == self.last_ack_sent && !force {
            return None;
        }
        Some(ack)
    }
}
