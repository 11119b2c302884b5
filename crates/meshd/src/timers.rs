//! Cancelable timer queue for the single-threaded engine
//!
//! Every scheduled event gets a [`TimerId`]. Owners keep the id and cancel it
//! before they are freed, so a fired event never refers to freed state.

use mesh_core::{ChannelNumber, ConnectionId, Direction, PeerId};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Handle of a scheduled event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What to do when a timer fires
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// Keepalive (origin of `direction`) or timeout (everyone else)
    ConnectionMaintenance {
        cid: ConnectionId,
        direction: Direction,
    },
    /// Probe for a lost credit on traffic we send in `direction`
    Poll {
        cid: ConnectionId,
        direction: Direction,
    },
    /// Retransmit the oldest unacked data travelling `direction`
    ChannelRetransmit {
        peer: PeerId,
        gid: ChannelNumber,
        direction: Direction,
    },
    /// Resend CHANNEL_CREATE (`Fwd`) or the CHANNEL_ACK answering it (`Bck`)
    ChannelControlRetry {
        peer: PeerId,
        gid: ChannelNumber,
        direction: Direction,
    },
    /// Resend our KX until the remote end has proven it holds the keys
    TunnelKxRetry { peer: PeerId },
}

/// Deadline-ordered event queue
#[derive(Debug, Default)]
pub struct Timers {
    next_id: u64,
    queue: BTreeMap<(Instant, u64), TimerEvent>,
    deadlines: HashMap<u64, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` at `at`
    pub fn schedule(&mut self, at: Instant, event: TimerEvent) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.insert((at, id), event);
        self.deadlines.insert(id, at);
        TimerId(id)
    }

    /// Cancel a scheduled event; returns false if it already fired
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id.0) {
            Some(at) => self.queue.remove(&(at, id.0)).is_some(),
            None => false,
        }
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the earliest event due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, TimerEvent)> {
        let (&(at, id), _) = self.queue.iter().next()?;
        if at > now {
            return None;
        }
        self.deadlines.remove(&id);
        self.queue.remove(&(at, id)).map(|event| (TimerId(id), event))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Standard exponential backoff: double, clamped to `[1 ms, 15 min]`
pub fn std_backoff(current: Duration) -> Duration {
    (current * 2).clamp(Duration::from_millis(1), Duration::from_secs(15 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(b: u8) -> TimerEvent {
        TimerEvent::Poll {
            cid: ConnectionId([b; 32]),
            direction: Direction::Fwd,
        }
    }

    #[test]
    fn test_events_pop_in_deadline_order() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(now + Duration::from_secs(2), event(2));
        timers.schedule(now + Duration::from_secs(1), event(1));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(timers.pop_due(now).is_none());

        let later = now + Duration::from_secs(3);
        assert_eq!(timers.pop_due(later).unwrap().1, event(1));
        assert_eq!(timers.pop_due(later).unwrap().1, event(2));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut timers = Timers::new();
        let id = timers.schedule(now, event(1));
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(timers.pop_due(now).is_none());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_std_backoff_clamps() {
        assert_eq!(std_backoff(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(std_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(std_backoff(Duration::from_secs(600)), Duration::from_secs(900));
    }
}
