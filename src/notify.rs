//! Position-based notification protocol.
//!
//! Applications register (byte offset, event) pairs on a buffer and expect the
//! event to fire when playback crosses that offset. Polls are sparse (driven
//! by stops and an external periodic driver), so firing is interval-based:
//! every offset the voice advanced through since the previous poll fires
//! exactly once, including across a loop wraparound, and never twice.

use std::sync::Arc;

use crate::backend::TransportState;

/// Reserved offset meaning "fires when the buffer stops".
pub const NOTIFY_AT_STOP: u32 = u32::MAX;

/// Rust-side stand-in for the legacy event handle.
///
/// Signaled with no device lock held, so an implementation may call back into
/// the API (poll, query status, even stop a buffer).
pub trait NotifyEvent: Send + Sync {
    fn signal(&self);
}

#[derive(Clone)]
pub struct NotifyPosition {
    pub offset: u32,
    pub event: Arc<dyn NotifyEvent>,
}

impl std::fmt::Debug for NotifyPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyPosition")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

/// Outcome of one crossing check.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Crossing {
    /// Indices into the registration list that fire on this poll.
    pub fired: Vec<usize>,
    /// New bookkeeping offset (always the observed offset, with natural
    /// finish reported as end-of-buffer).
    pub last_offset: u32,
    /// The buffer is no longer playing; deregister it from the scheduler.
    pub done: bool,
}

/// Interval-crossing check over one poll.
///
/// `offsets` are the registered byte offsets (with [`NOTIFY_AT_STOP`] for the
/// stop sentinel), `last_offset` the offset observed by the previous poll,
/// `offset` and `state` the fresh read-back from the voice.
pub(crate) fn poll_crossing(
    offsets: &[u32],
    last_offset: u32,
    offset: u32,
    state: TransportState,
    buffer_len: u32,
) -> Crossing {
    let mut fired = Vec::new();
    match state {
        // Ran to the natural end: the read-back offset may already have
        // wrapped or parked, so treat it as end-of-buffer and flush the tail.
        TransportState::Stopped => {
            for (idx, &pos) in offsets.iter().enumerate() {
                if pos == NOTIFY_AT_STOP || (pos >= last_offset && pos < buffer_len) {
                    fired.push(idx);
                }
            }
            Crossing {
                fired,
                last_offset: buffer_len,
                done: true,
            }
        }
        TransportState::Playing => {
            if offset > last_offset {
                for (idx, &pos) in offsets.iter().enumerate() {
                    if pos != NOTIFY_AT_STOP && pos >= last_offset && pos < offset {
                        fired.push(idx);
                    }
                }
            } else if offset < last_offset {
                // Looped past the end since the last poll; the advanced
                // interval is [last, len) ∪ [0, offset).
                for (idx, &pos) in offsets.iter().enumerate() {
                    if pos != NOTIFY_AT_STOP && (pos >= last_offset || pos < offset) {
                        fired.push(idx);
                    }
                }
            }
            Crossing {
                fired,
                last_offset: offset,
                done: false,
            }
        }
        // Explicitly stopped or paused: only the stop sentinel fires.
        TransportState::Paused | TransportState::Initial => {
            for (idx, &pos) in offsets.iter().enumerate() {
                if pos == NOTIFY_AT_STOP {
                    fired.push(idx);
                }
            }
            Crossing {
                fired,
                last_offset: offset,
                done: true,
            }
        }
    }
}

/// Event handles for the fired registrations. Collected under the device
/// lock; the caller signals them after releasing it.
pub(crate) fn fired_events(
    notifies: &[NotifyPosition],
    fired: &[usize],
) -> Vec<Arc<dyn NotifyEvent>> {
    fired
        .iter()
        .map(|&idx| Arc::clone(&notifies[idx].event))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crossing(offsets: &[u32], last: u32, cur: u32, state: TransportState) -> Crossing {
        poll_crossing(offsets, last, cur, state, 1_000)
    }

    #[test]
    fn forward_interval_fires_half_open_range() {
        let offsets = [0, 500, 900, NOTIFY_AT_STOP];

        let c = crossing(&offsets, 0, 300, TransportState::Playing);
        assert_eq!(c, Crossing { fired: vec![0], last_offset: 300, done: false });

        let c = crossing(&offsets, 300, 700, TransportState::Playing);
        assert_eq!(c, Crossing { fired: vec![1], last_offset: 700, done: false });

        let c = crossing(&offsets, 700, 0, TransportState::Stopped);
        assert_eq!(c, Crossing { fired: vec![2, 3], last_offset: 1_000, done: true });
    }

    #[test]
    fn no_motion_fires_nothing() {
        let c = crossing(&[0, 500], 300, 300, TransportState::Playing);
        assert!(c.fired.is_empty());
        assert!(!c.done);
    }

    #[test]
    fn wraparound_covers_both_tails_without_the_sentinel() {
        let offsets = [50, 950, NOTIFY_AT_STOP];
        let c = crossing(&offsets, 900, 100, TransportState::Playing);
        assert_eq!(c.fired, vec![0, 1]);
        assert_eq!(c.last_offset, 100);
        assert!(!c.done);
    }

    #[test]
    fn natural_finish_flushes_tail_and_sentinel() {
        let offsets = [100, 600, NOTIFY_AT_STOP];
        let c = crossing(&offsets, 500, 0, TransportState::Stopped);
        assert_eq!(c.fired, vec![1, 2]);
        assert_eq!(c.last_offset, 1_000);
        assert!(c.done);
    }

    #[test]
    fn explicit_pause_fires_only_the_sentinel() {
        let offsets = [100, NOTIFY_AT_STOP];
        let c = crossing(&offsets, 200, 250, TransportState::Paused);
        assert_eq!(c.fired, vec![1]);
        assert_eq!(c.last_offset, 250);
        assert!(c.done);
    }

    #[test]
    fn missed_polls_never_double_fire() {
        let offsets = [250, 500, 750];
        let mut last = 0;
        let mut total = 0;
        for cur in [300, 300, 800, 100] {
            let c = crossing(&offsets, last, cur, TransportState::Playing);
            total += c.fired.len();
            last = c.last_offset;
        }
        // 250 on the first poll, 500+750 on the third, wraparound fires
        // nothing new on the fourth (interval [800, 1000) ∪ [0, 100)).
        assert_eq!(total, 3);
    }
}
