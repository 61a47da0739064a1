// Countdown for the lot currently open for bidding.
//
// A single logical timer. Re-arming replaces the pending deadline, so the
// eventual expiry is neither dropped nor duplicated; cancelling guarantees
// the replaced countdown never reports expiry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Notifications produced by [`DeadlineTimer::next_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Periodic countdown update for display purposes.
    Tick { token: u64, remaining: Duration },
    /// The deadline passed. Emitted at most once per arm.
    Expired { token: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    token: u64,
    deadline: Instant,
    next_tick: Instant,
}

/// Deadline timer keyed by the engine's `timer_token`.
#[derive(Debug)]
pub struct DeadlineTimer {
    armed: Option<Armed>,
    tick_every: Option<Duration>,
}

impl DeadlineTimer {
    /// `tick_every = None` disables tick notifications; only expiry is reported.
    pub fn new(tick_every: Option<Duration>) -> Self {
        DeadlineTimer {
            armed: None,
            tick_every: tick_every.filter(|d| !d.is_zero()),
        }
    }

    /// Arm (or re-arm) for `deadline`. Any previous countdown is discarded.
    pub fn arm(&mut self, token: u64, deadline: Instant) {
        let now = Instant::now();
        let next_tick = match self.tick_every {
            Some(every) => now + every,
            None => deadline,
        };
        self.armed = Some(Armed {
            token,
            deadline,
            next_tick,
        });
    }

    /// Arm for a wall-clock deadline, as stored in the auction state.
    /// A deadline already in the past expires on the next poll.
    pub fn arm_at(&mut self, token: u64, deadline: DateTime<Utc>, now: DateTime<Utc>) {
        self.arm(token, instant_for(deadline, now));
    }

    /// Disarm. Returns the token that was armed, if any.
    pub fn cancel(&mut self) -> Option<u64> {
        self.armed.take().map(|a| a.token)
    }

    pub fn token(&self) -> Option<u64> {
        self.armed.map(|a| a.token)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.armed
            .map(|a| a.deadline.saturating_duration_since(Instant::now()))
    }

    /// Wait for the next tick or the expiry. Never resolves while disarmed.
    ///
    /// Cancel-safe: state only changes after the sleep completes, so the
    /// future can be dropped by `tokio::select!` at any await point.
    pub async fn next_event(&mut self) -> TimerEvent {
        let Some(armed) = self.armed else {
            return std::future::pending().await;
        };

        tokio::time::sleep_until(armed.next_tick.min(armed.deadline)).await;

        let now = Instant::now();
        if now >= armed.deadline {
            self.armed = None;
            return TimerEvent::Expired {
                token: armed.token,
            };
        }

        if let (Some(every), Some(current)) = (self.tick_every, self.armed.as_mut()) {
            let mut next = current.next_tick + every;
            // Skip ticks we slept through rather than bursting them.
            while next <= now {
                next += every;
            }
            current.next_tick = next;
        }
        TimerEvent::Tick {
            token: armed.token,
            remaining: armed.deadline - now,
        }
    }
}

/// Map a wall-clock deadline onto the tokio clock, clamping past deadlines
/// to "now".
pub fn instant_for(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Instant {
    let left = (deadline - now).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + left
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    const NEVER: Duration = Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn expires_once_at_deadline() {
        let start = Instant::now();
        let mut timer = DeadlineTimer::new(None);
        timer.arm(1, start + Duration::from_secs(15));

        assert_eq!(timer.next_event().await, TimerEvent::Expired { token: 1 });
        assert_eq!(start.elapsed(), Duration::from_secs(15));
        assert!(!timer.is_armed());

        assert!(timeout(NEVER, timer.next_event()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_extends_deadline() {
        let start = Instant::now();
        let mut timer = DeadlineTimer::new(None);
        timer.arm(1, start + Duration::from_secs(15));

        advance(Duration::from_secs(10)).await;
        timer.arm(2, Instant::now() + Duration::from_secs(15));

        assert_eq!(timer.next_event().await, TimerEvent::Expired { token: 2 });
        assert_eq!(start.elapsed(), Duration::from_secs(25));
        assert!(timeout(NEVER, timer.next_event()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let mut timer = DeadlineTimer::new(None);
        timer.arm(7, Instant::now() + Duration::from_secs(1));
        assert_eq!(timer.cancel(), Some(7));
        assert!(timeout(NEVER, timer.next_event()).await.is_err());
        assert_eq!(timer.cancel(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_then_expires() {
        let mut timer = DeadlineTimer::new(Some(Duration::from_millis(100)));
        timer.arm(3, Instant::now() + Duration::from_secs(1));

        let mut ticks = Vec::new();
        loop {
            match timer.next_event().await {
                TimerEvent::Tick { token, remaining } => {
                    assert_eq!(token, 3);
                    ticks.push(remaining);
                }
                TimerEvent::Expired { token } => {
                    assert_eq!(token, 3);
                    break;
                }
            }
        }
        assert_eq!(ticks.len(), 9);
        assert_eq!(ticks[0], Duration::from_millis(900));
        assert_eq!(ticks[8], Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn past_wall_clock_deadline_expires_immediately() {
        let now = Utc::now();
        let start = Instant::now();
        let mut timer = DeadlineTimer::new(Some(Duration::from_millis(100)));
        timer.arm_at(9, now - chrono::Duration::seconds(30), now);

        assert_eq!(timer.next_event().await, TimerEvent::Expired { token: 9 });
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let mut timer = DeadlineTimer::new(None);
        assert_eq!(timer.remaining(), None);
        timer.arm(1, Instant::now() + Duration::from_secs(15));
        advance(Duration::from_secs(4)).await;
        assert_eq!(timer.remaining(), Some(Duration::from_secs(11)));
        assert_eq!(timer.token(), Some(1));
    }
}
