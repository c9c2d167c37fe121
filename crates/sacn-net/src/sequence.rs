use std::collections::hash_map::{Entry, HashMap};
use std::time::{Duration, Instant};

use sacn_protocol::Cid;

/// Outcome of checking one data packet's sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    InOrder,
    /// Accepted, but this many packets were skipped
    Gap(u8),
    /// Duplicate or reordered; the packet should be ignored
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct Stream {
    last: u8,
    seen: Instant,
}

/// Per-(source, universe) sequence tracking for incoming data packets.
///
/// A packet whose sequence is 0 to 19 behind the last accepted one is
/// stale. Anything else is accepted, which lets a restarted source resync
/// immediately.
///
/// A source picks a fresh CID every time it starts, so long-lived trackers
/// must call `sweep` periodically to drop streams that went quiet.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    streams: HashMap<(Cid, u16), Stream>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, cid: Cid, universe: u16, sequence: u8) -> SequenceStatus {
        self.observe_at(cid, universe, sequence, Instant::now())
    }

    pub fn observe_at(&mut self, cid: Cid, universe: u16, sequence: u8, now: Instant) -> SequenceStatus {
        let stream = match self.streams.entry((cid, universe)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(Stream { last: sequence, seen: now });
                return SequenceStatus::InOrder;
            }
        };

        // Any packet, stale or not, shows the stream is alive
        stream.seen = now;

        let diff = sequence.wrapping_sub(stream.last) as i8;
        if (-19..=0).contains(&diff) {
            return SequenceStatus::Stale;
        }

        stream.last = sequence;
        match diff.wrapping_sub(1) as u8 {
            0 => SequenceStatus::InOrder,
            missed => SequenceStatus::Gap(missed),
        }
    }

    /// Drop all streams from `cid`, e.g. once its source has expired.
    pub fn forget(&mut self, cid: &Cid) {
        self.streams.retain(|(c, _), _| c != cid);
    }

    pub fn sweep(&mut self, max_idle: Duration) -> usize {
        self.sweep_at(Instant::now(), max_idle)
    }

    /// Drop every stream with no packet for at least `max_idle` as of `now`.
    /// Returns how many were removed.
    pub fn sweep_at(&mut self, now: Instant, max_idle: Duration) -> usize {
        let before = self.streams.len();
        self.streams
            .retain(|_, stream| now.saturating_duration_since(stream.seen) < max_idle);
        before - self.streams.len()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Cid = Cid::from_bytes([0xAA; 16]);
    const B: Cid = Cid::from_bytes([0xBB; 16]);

    #[test]
    fn test_first_packet_is_in_order() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(A, 1, 200), SequenceStatus::InOrder);
    }

    #[test]
    fn test_consecutive_through_wrap() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(A, 1, 254);
        assert_eq!(tracker.observe(A, 1, 255), SequenceStatus::InOrder);
        assert_eq!(tracker.observe(A, 1, 0), SequenceStatus::InOrder);
        assert_eq!(tracker.observe(A, 1, 1), SequenceStatus::InOrder);
    }

    #[test]
    fn test_gap_counts_missed_packets() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(A, 1, 10);
        assert_eq!(tracker.observe(A, 1, 14), SequenceStatus::Gap(3));
        assert_eq!(tracker.observe(A, 1, 15), SequenceStatus::InOrder);
        // Gap across the wrap
        tracker.observe(A, 1, 250);
        assert_eq!(tracker.observe(A, 1, 2), SequenceStatus::Gap(7));
    }

    #[test]
    fn test_duplicate_and_reordered_are_stale() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(A, 1, 50);
        assert_eq!(tracker.observe(A, 1, 50), SequenceStatus::Stale);
        assert_eq!(tracker.observe(A, 1, 31), SequenceStatus::Stale);
        // Stale packets don't move the reference point
        assert_eq!(tracker.observe(A, 1, 51), SequenceStatus::InOrder);
    }

    #[test]
    fn test_far_behind_is_accepted_as_resync() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(A, 1, 50);
        // 20 behind is outside the stale window
        assert_eq!(tracker.observe(A, 1, 30), SequenceStatus::Gap(235));
        assert_eq!(tracker.observe(A, 1, 31), SequenceStatus::InOrder);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(A, 1, 10);
        tracker.observe(A, 2, 100);
        tracker.observe(B, 1, 200);

        assert_eq!(tracker.observe(A, 1, 11), SequenceStatus::InOrder);
        assert_eq!(tracker.observe(A, 2, 101), SequenceStatus::InOrder);
        assert_eq!(tracker.observe(B, 1, 201), SequenceStatus::InOrder);
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn test_forget_drops_every_universe_of_a_source() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(A, 1, 10);
        tracker.observe(A, 2, 10);
        tracker.observe(B, 1, 10);

        tracker.forget(&A);
        assert_eq!(tracker.len(), 1);
        // Fresh stream again, so a would-be duplicate is accepted
        assert_eq!(tracker.observe(A, 1, 10), SequenceStatus::InOrder);
    }

    #[test]
    fn test_sweep_drops_silent_streams() {
        let mut tracker = SequenceTracker::new();
        let t = Instant::now();
        let idle = Duration::from_secs(60);

        // A source restarting over and over leaves one stream per CID behind
        for n in 0..100u8 {
            tracker.observe_at(Cid::from_bytes([n; 16]), 1, 0, t);
        }
        tracker.observe_at(A, 2, 0, t + Duration::from_secs(30));
        assert_eq!(tracker.len(), 101);

        assert_eq!(tracker.sweep_at(t + Duration::from_secs(59), idle), 0);
        assert_eq!(tracker.sweep_at(t + Duration::from_secs(60), idle), 100);
        assert_eq!(tracker.len(), 1);

        assert_eq!(tracker.sweep_at(t + Duration::from_secs(90), idle), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_stale_packets_keep_a_stream_alive() {
        let mut tracker = SequenceTracker::new();
        let t = Instant::now();
        let idle = Duration::from_secs(60);

        tracker.observe_at(A, 1, 50, t);
        assert_eq!(
            tracker.observe_at(A, 1, 50, t + Duration::from_secs(40)),
            SequenceStatus::Stale
        );

        assert_eq!(tracker.sweep_at(t + Duration::from_secs(70), idle), 0);
        // Reference point survived the sweep
        assert_eq!(tracker.observe_at(A, 1, 51, t + Duration::from_secs(70)), SequenceStatus::InOrder);
    }
}
