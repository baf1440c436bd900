use crate::machine::{TimerRequest, TimerTicket};
use std::time::{Duration, Instant};

/// Pending deadline-ordered timer tickets for one session runner.
///
/// Owned by the sampling loop; dropping or clearing it cancels every
/// pending timer.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: Vec<(Instant, TimerTicket)>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, request: TimerRequest, now: Instant) {
        self.schedule_at(request.ticket, now + request.delay);
    }

    pub fn schedule_at(&mut self, ticket: TimerTicket, due: Instant) {
        // Keep sorted by deadline; equal deadlines stay in insertion order.
        let pos = self.entries.partition_point(|(at, _)| *at <= due);
        self.entries.insert(pos, (due, ticket));
    }

    /// Remove and return every ticket due at or before `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerTicket> {
        let split = self.entries.partition_point(|(at, _)| *at <= now);
        self.entries.drain(..split).map(|(_, t)| t).collect()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.entries.first().map(|(at, _)| *at)
    }

    /// Time until the next deadline, saturating at zero.
    pub fn until_next(&self, now: Instant) -> Option<Duration> {
        self.next_due().map(|at| at.saturating_duration_since(now))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(cancelled = self.entries.len(), "pending timers cancelled");
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeKey;
    use crate::machine::{SessionHandle, TimerKind};
    use uuid::Uuid;

    fn ticket(kind: TimerKind) -> TimerTicket {
        TimerTicket {
            session: SessionHandle {
                id: Uuid::nil(),
                epoch: 0,
            },
            kind,
        }
    }

    #[test]
    fn test_due_in_deadline_order() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(
            TimerRequest {
                ticket: ticket(TimerKind::Settle(ChallengeKey::Blink)),
                delay: Duration::from_millis(1000),
            },
            now,
        );
        q.schedule(
            TimerRequest {
                ticket: ticket(TimerKind::BlinkReset),
                delay: Duration::from_millis(300),
            },
            now,
        );

        assert!(q.take_due(now + Duration::from_millis(100)).is_empty());
        assert_eq!(q.until_next(now), Some(Duration::from_millis(300)));

        let due = q.take_due(now + Duration::from_millis(2000));
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].kind, TimerKind::BlinkReset);
        assert_eq!(due[1].kind, TimerKind::Settle(ChallengeKey::Blink));
        assert!(q.is_empty());
    }

    #[test]
    fn test_take_due_leaves_future_entries() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule_at(ticket(TimerKind::BlinkReset), now);
        q.schedule_at(
            ticket(TimerKind::Settle(ChallengeKey::Front)),
            now + Duration::from_secs(5),
        );
        assert_eq!(q.take_due(now).len(), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_clear_cancels_everything() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule_at(ticket(TimerKind::BlinkReset), now);
        q.clear();
        assert!(q.is_empty());
        assert!(q.next_due().is_none());
    }
}
