//! Per-connection idle detection.
//!
//! Tracks time since the last read, the last write, and the last activity
//! of either kind. Each kind has its own threshold; a zero threshold
//! disables it. When a threshold passes without activity the monitor
//! reports one [`IdleEvent`] and re-arms for another full interval, so a
//! silent connection sees one event per interval rather than a flood.
//!
//! The monitor only reports. Whether an idle connection is pinged, closed
//! or left alone is decided by the connection handler.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Idle thresholds. `Duration::ZERO` disables a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleConfig {
    pub reader: Duration,
    pub writer: Duration,
    pub all: Duration,
}

impl IdleConfig {
    pub const DISABLED: IdleConfig = IdleConfig {
        reader: Duration::ZERO,
        writer: Duration::ZERO,
        all: Duration::ZERO,
    };

    pub fn is_disabled(&self) -> bool {
        self.reader.is_zero() && self.writer.is_zero() && self.all.is_zero()
    }
}

impl Default for IdleConfig {
    /// No reads or writes for 10 seconds.
    fn default() -> Self {
        Self {
            all: Duration::from_secs(10),
            ..Self::DISABLED
        }
    }
}

/// Which kind of inactivity expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleState {
    ReaderIdle,
    WriterIdle,
    AllIdle,
}

impl fmt::Display for IdleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdleState::ReaderIdle => "reader_idle",
            IdleState::WriterIdle => "writer_idle",
            IdleState::AllIdle => "all_idle",
        };
        f.write_str(name)
    }
}

/// Notification that a connection has been quiet for a full interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleEvent {
    pub state: IdleState,
    /// `true` for the first event since the last activity.
    pub first: bool,
}

#[derive(Debug)]
struct Timer {
    state: IdleState,
    timeout: Duration,
    deadline: Option<Instant>,
    first: bool,
}

impl Timer {
    fn new(state: IdleState, timeout: Duration, now: Instant) -> Self {
        Self {
            state,
            timeout,
            deadline: (!timeout.is_zero()).then(|| now + timeout),
            first: true,
        }
    }

    fn touch(&mut self, now: Instant) {
        if self.deadline.is_some() {
            self.deadline = Some(now + self.timeout);
            self.first = true;
        }
    }

    fn poll(&mut self, now: Instant) -> Option<IdleEvent> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        let event = IdleEvent {
            state: self.state,
            first: self.first,
        };
        self.first = false;
        self.deadline = Some(now + self.timeout);
        Some(event)
    }
}

/// Idle tracking for a single connection.
#[derive(Debug)]
pub struct LivenessMonitor {
    reader: Timer,
    writer: Timer,
    all: Timer,
    stopped: bool,
}

impl LivenessMonitor {
    /// Start tracking; `now` counts as activity of every kind.
    pub fn new(config: IdleConfig, now: Instant) -> Self {
        Self {
            reader: Timer::new(IdleState::ReaderIdle, config.reader, now),
            writer: Timer::new(IdleState::WriterIdle, config.writer, now),
            all: Timer::new(IdleState::AllIdle, config.all, now),
            stopped: false,
        }
    }

    /// A monitor that never fires.
    pub fn disabled() -> Self {
        Self::new(IdleConfig::DISABLED, Instant::now())
    }

    pub fn record_read(&mut self, now: Instant) {
        self.reader.touch(now);
        self.all.touch(now);
    }

    pub fn record_write(&mut self, now: Instant) {
        self.writer.touch(now);
        self.all.touch(now);
    }

    /// Earliest instant at which an idle event can fire.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.stopped {
            return None;
        }
        [&self.reader, &self.writer, &self.all]
            .into_iter()
            .filter_map(|t| t.deadline)
            .min()
    }

    /// Collect the events due at `now` and re-arm their timers.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<IdleEvent> {
        if self.stopped {
            return Vec::new();
        }
        [&mut self.reader, &mut self.writer, &mut self.all]
            .into_iter()
            .filter_map(|t| t.poll(now))
            .collect()
    }

    /// Stop tracking. No events are reported afterwards.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn all_only(timeout: u64) -> IdleConfig {
        IdleConfig {
            all: secs(timeout),
            ..IdleConfig::DISABLED
        }
    }

    #[test]
    fn test_default_config() {
        let config = IdleConfig::default();
        assert_eq!(config.all, secs(10));
        assert!(config.reader.is_zero());
        assert!(config.writer.is_zero());
        assert!(!config.is_disabled());
        assert!(IdleConfig::DISABLED.is_disabled());
    }

    #[test]
    fn test_no_event_before_threshold() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(all_only(10), start);

        assert_eq!(monitor.next_deadline(), Some(start + secs(10)));
        assert!(monitor.poll_expired(start + secs(9)).is_empty());
    }

    #[test]
    fn test_one_event_per_interval() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(all_only(10), start);

        let events = monitor.poll_expired(start + secs(10));
        assert_eq!(
            events,
            vec![IdleEvent {
                state: IdleState::AllIdle,
                first: true
            }]
        );

        // Polling again inside the same interval yields nothing.
        assert!(monitor.poll_expired(start + secs(15)).is_empty());
        assert_eq!(monitor.next_deadline(), Some(start + secs(20)));

        let events = monitor.poll_expired(start + secs(20));
        assert_eq!(
            events,
            vec![IdleEvent {
                state: IdleState::AllIdle,
                first: false
            }]
        );
    }

    #[test]
    fn test_activity_resets_clock() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(all_only(10), start);
        monitor.poll_expired(start + secs(10));

        monitor.record_write(start + secs(12));
        assert_eq!(monitor.next_deadline(), Some(start + secs(22)));
        assert!(monitor.poll_expired(start + secs(21)).is_empty());

        let events = monitor.poll_expired(start + secs(22));
        assert_eq!(events.len(), 1);
        assert!(events[0].first);
    }

    #[test]
    fn test_independent_thresholds() {
        let start = Instant::now();
        let config = IdleConfig {
            reader: secs(5),
            writer: secs(8),
            all: Duration::ZERO,
        };
        let mut monitor = LivenessMonitor::new(config, start);

        // Reads keep the reader clock fresh but not the writer clock.
        monitor.record_read(start + secs(4));
        let events = monitor.poll_expired(start + secs(8));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, IdleState::WriterIdle);

        let events = monitor.poll_expired(start + secs(9));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, IdleState::ReaderIdle);
    }

    #[test]
    fn test_disabled_never_fires() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(IdleConfig::DISABLED, start);
        assert_eq!(monitor.next_deadline(), None);
        assert!(monitor.poll_expired(start + secs(3600)).is_empty());
        assert!(LivenessMonitor::disabled().next_deadline().is_none());
    }

    #[test]
    fn test_stop_silences_monitor() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(all_only(1), start);
        monitor.stop();
        assert!(monitor.is_stopped());
        assert_eq!(monitor.next_deadline(), None);
        assert!(monitor.poll_expired(start + secs(60)).is_empty());
    }

    #[test]
    fn test_idle_state_display() {
        assert_eq!(IdleState::AllIdle.to_string(), "all_idle");
        assert_eq!(IdleState::ReaderIdle.to_string(), "reader_idle");
    }
}
