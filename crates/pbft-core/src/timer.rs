//! Replica timers.
//!
//! The state machine never reads a clock. It emits [`TimerCommand`]s in its
//! output and the runtime applies them to [`Timers`], then polls for expired
//! timers and feeds them back as timeout events. A stopped timer therefore
//! never produces a timeout.

use std::time::{Duration, Instant};

use crate::config::TimerConfig;

/// The four independent replica timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Refresh inbound session keys.
    KeyRefresh,

    /// Broadcast a Status message.
    Status,

    /// Progress stalled on a pending request; move to the next view.
    ViewChange,

    /// Re-forward pending requests and retry read-only requests.
    Idle,
}

impl TimeoutKind {
    pub const ALL: [TimeoutKind; 4] = [
        TimeoutKind::KeyRefresh,
        TimeoutKind::Status,
        TimeoutKind::ViewChange,
        TimeoutKind::Idle,
    ];
}

/// An instruction from the state machine to the runtime's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Arm the timer unless it is already armed.
    Start(TimeoutKind),
    Stop(TimeoutKind),
    /// Disarm, then arm for a full interval.
    Restart(TimeoutKind),
    /// Change the interval used the next time the timer is armed.
    SetInterval(TimeoutKind, Duration),
}

/// A one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Arms the timer unless it is already armed.
    pub fn start(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.interval);
        }
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn restart(&mut self, now: Instant) {
        self.stop();
        self.start(now);
    }

    /// Returns true exactly once when the deadline has passed, and disarms.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// The replica's timers, keyed by [`TimeoutKind`].
#[derive(Debug, Clone)]
pub struct Timers {
    key_refresh: Timer,
    status: Timer,
    view_change: Timer,
    idle: Timer,
}

impl Timers {
    pub fn new(config: &TimerConfig) -> Self {
        Self {
            key_refresh: Timer::new(config.key_refresh),
            status: Timer::new(config.status),
            view_change: Timer::new(config.view_change),
            idle: Timer::new(config.idle),
        }
    }

    pub fn get(&self, kind: TimeoutKind) -> &Timer {
        match kind {
            TimeoutKind::KeyRefresh => &self.key_refresh,
            TimeoutKind::Status => &self.status,
            TimeoutKind::ViewChange => &self.view_change,
            TimeoutKind::Idle => &self.idle,
        }
    }

    fn get_mut(&mut self, kind: TimeoutKind) -> &mut Timer {
        match kind {
            TimeoutKind::KeyRefresh => &mut self.key_refresh,
            TimeoutKind::Status => &mut self.status,
            TimeoutKind::ViewChange => &mut self.view_change,
            TimeoutKind::Idle => &mut self.idle,
        }
    }

    pub fn apply(&mut self, command: TimerCommand, now: Instant) {
        match command {
            TimerCommand::Start(kind) => self.get_mut(kind).start(now),
            TimerCommand::Stop(kind) => self.get_mut(kind).stop(),
            TimerCommand::Restart(kind) => self.get_mut(kind).restart(now),
            TimerCommand::SetInterval(kind, interval) => self.get_mut(kind).set_interval(interval),
        }
    }

    /// Collects every timer that fired by `now`.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<TimeoutKind> {
        TimeoutKind::ALL
            .into_iter()
            .filter(|kind| self.get_mut(*kind).poll(now))
            .collect()
    }

    /// Earliest armed deadline, for sizing the runtime's poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        TimeoutKind::ALL
            .iter()
            .filter_map(|kind| self.get(*kind).deadline())
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    #[test]
    fn start_does_not_rearm() {
        let now = Instant::now();
        let mut timer = Timer::new(INTERVAL);
        timer.start(now);
        timer.start(now + Duration::from_millis(50));
        assert_eq!(timer.deadline(), Some(now + INTERVAL));
    }

    #[test]
    fn restart_rearms_from_now() {
        let now = Instant::now();
        let mut timer = Timer::new(INTERVAL);
        timer.start(now);
        timer.restart(now + Duration::from_millis(50));
        assert_eq!(timer.deadline(), Some(now + Duration::from_millis(150)));
    }

    #[test]
    fn poll_fires_once() {
        let now = Instant::now();
        let mut timer = Timer::new(INTERVAL);
        timer.start(now);

        assert!(!timer.poll(now + Duration::from_millis(99)));
        assert!(timer.poll(now + INTERVAL));
        assert!(!timer.poll(now + INTERVAL * 2));
        assert!(!timer.is_armed());
    }

    #[test]
    fn stopped_timer_never_fires() {
        let now = Instant::now();
        let mut timer = Timer::new(INTERVAL);
        timer.start(now);
        timer.stop();
        assert!(!timer.poll(now + INTERVAL * 10));
    }

    #[test]
    fn new_interval_applies_on_next_arm() {
        let now = Instant::now();
        let mut timers = Timers::new(&TimerConfig::default());
        timers.apply(TimerCommand::SetInterval(TimeoutKind::ViewChange, INTERVAL), now);
        timers.apply(TimerCommand::Start(TimeoutKind::ViewChange), now);
        timers.apply(TimerCommand::Start(TimeoutKind::Idle), now);

        assert_eq!(timers.next_deadline(), Some(now + INTERVAL));
        assert_eq!(
            timers.poll_expired(now + INTERVAL),
            vec![TimeoutKind::ViewChange]
        );
        assert!(timers.get(TimeoutKind::Idle).is_armed());
    }
}
