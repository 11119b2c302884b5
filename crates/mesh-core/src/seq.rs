//! Wraparound-aware 32-bit sequence arithmetic
//!
//! Packet ids (connection level) and message ids (channel level) are `u32`
//! counters that wrap. Two ids are ordered by the shorter distance between
//! them on the circle.

/// Half of the id space; distances at or above it count as "behind".
pub const HALF_RANGE: u32 = 0x8000_0000;

/// Is `bigger` ahead of `smaller`, taking wraparound into account?
pub fn is_pid_bigger(bigger: u32, smaller: u32) -> bool {
    bigger != smaller && bigger.wrapping_sub(smaller) < HALF_RANGE
}

/// The later of two ids
pub fn max_pid(a: u32, b: u32) -> u32 {
    if is_pid_bigger(a, b) {
        a
    } else {
        b
    }
}

/// The earlier of two ids
pub fn min_pid(a: u32, b: u32) -> u32 {
    if is_pid_bigger(a, b) {
        b
    } else {
        a
    }
}

/// Number of steps from `from` forward to `to`
pub fn pid_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}
