//! Read/write timeout policy.

use std::time::Duration;

/// Hardware timeouts applied to reads and writes, in milliseconds.
///
/// A read of `n` bytes gives up after
/// `read_total_constant + n * read_total_multiplier`; a zero multiplier makes
/// the deadline constant. When every field is zero, reads and writes wait
/// indefinitely. [`TimeoutPolicy::non_blocking`] is the special case where
/// reads return immediately with whatever is already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TimeoutPolicy {
    /// Longest gap allowed between two received bytes once a read has started.
    pub read_interval: u32,
    /// Per-byte part of the read deadline.
    pub read_total_multiplier: u32,
    /// Constant part of the read deadline.
    pub read_total_constant: u32,
    /// Per-byte part of the write deadline.
    pub write_total_multiplier: u32,
    /// Constant part of the write deadline.
    pub write_total_constant: u32,
}

impl TimeoutPolicy {
    /// Reads never wait: they return what is queued, possibly nothing.
    pub const fn non_blocking() -> Self {
        Self {
            read_interval: u32::MAX,
            read_total_multiplier: 0,
            read_total_constant: 0,
            write_total_multiplier: 0,
            write_total_constant: 0,
        }
    }

    /// Constant read and write deadlines, no interval timeout.
    pub const fn constant(read_ms: u32, write_ms: u32) -> Self {
        Self {
            read_interval: 0,
            read_total_multiplier: 0,
            read_total_constant: read_ms,
            write_total_multiplier: 0,
            write_total_constant: write_ms,
        }
    }

    /// Whether reads return immediately.
    pub fn is_non_blocking_read(&self) -> bool {
        self.read_interval == u32::MAX
            && self.read_total_multiplier == 0
            && self.read_total_constant == 0
    }

    /// Deadline for a read of `len` bytes; `None` waits forever.
    pub fn read_deadline(&self, len: usize) -> Option<Duration> {
        if self.is_non_blocking_read() {
            return Some(Duration::ZERO);
        }
        total_deadline(self.read_total_constant, self.read_total_multiplier, len)
    }

    /// Gap allowed between bytes of a read already in progress; `None` when unused.
    pub fn read_gap(&self) -> Option<Duration> {
        match self.read_interval {
            0 | u32::MAX => None,
            ms => Some(Duration::from_millis(u64::from(ms))),
        }
    }

    /// Deadline for a write of `len` bytes; `None` waits forever.
    pub fn write_deadline(&self, len: usize) -> Option<Duration> {
        total_deadline(self.write_total_constant, self.write_total_multiplier, len)
    }
}

fn total_deadline(constant: u32, multiplier: u32, len: usize) -> Option<Duration> {
    if constant == 0 && multiplier == 0 {
        return None;
    }
    let per_byte = u64::from(multiplier).saturating_mul(len as u64);
    Some(Duration::from_millis(
        u64::from(constant).saturating_add(per_byte),
    ))
}
