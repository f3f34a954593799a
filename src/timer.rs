//! Retransmission timing for handshake flights.

use std::cmp;

use transport::DatagramBio;

/// Cap on the doubling backoff, in seconds.
pub const MAX_TIMEOUT_DURATION: u32 = 60;
/// Timer expiries tolerated before the connection is declared dead.
pub const TIMEOUT_ALERT_COUNT: u32 = 12;
/// Reads-per-timer counter wraps back to 1 past this.
pub const TIMEOUT_READ_COUNT: u32 = 2;
/// Remaining time under this is reported as zero, so small divergences from
/// the socket's own timeout cannot leave the host polling a timer that
/// never quite fires.
const TIMER_SLACK: u64 = 15_000;

/// Retransmission timer driven entirely by the caller's clock.
///
/// All times are absolute microseconds on whatever monotonic clock the host
/// uses; the timer never reads a clock itself. Arming it reports the
/// deadline to the transport so the host's poll loop knows when to come
/// back.
#[derive(Debug, Copy, Clone)]
pub struct RetransmitTimer {
    next_fire: Option<u64>,
    /// Current backoff duration in whole seconds.
    duration: u32,
}

impl RetransmitTimer {
    pub fn new() -> Self {
        RetransmitTimer {
            next_fire: None,
            duration: 1,
        }
    }

    /// Arm the timer `duration` from `now`.
    ///
    /// A stopped timer starts over at one second; an armed one keeps its
    /// current backoff, so re-arming at the same instant is idempotent.
    /// Reliable datagram transports retransmit on their own, so for them
    /// this is a no-op that leaves the timer stopped.
    pub fn start<T: DatagramBio>(&mut self, transport: &mut T, now: u64) {
        if transport.is_reliable_datagram() {
            self.next_fire = None;
            return;
        }
        if self.next_fire.is_none() {
            self.duration = 1;
        }
        self.next_fire = Some(now + u64::from(self.duration) * 1_000_000);
        transport.set_next_timeout(self.next_fire);
    }

    pub fn stop<T: DatagramBio>(&mut self, transport: &mut T) {
        self.reset();
        transport.set_next_timeout(None);
    }

    /// Clear without notifying the transport (connection reset path).
    pub(crate) fn reset(&mut self) {
        self.next_fire = None;
        self.duration = 1;
    }

    /// Remaining time in microseconds, `None` when stopped. An expired
    /// timer, or one within the slack window, reports zero.
    pub fn get_timeout(&self, now: u64) -> Option<u64> {
        let next_fire = self.next_fire?;
        if next_fire <= now {
            return Some(0);
        }
        let left = next_fire - now;
        if left < TIMER_SLACK {
            Some(0)
        } else {
            Some(left)
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.get_timeout(now) == Some(0)
    }

    /// Double the backoff, capped, and re-arm from `now`.
    pub fn double<T: DatagramBio>(&mut self, transport: &mut T, now: u64) {
        self.duration = cmp::min(self.duration.saturating_mul(2), MAX_TIMEOUT_DURATION);
        self.start(transport, now);
    }

    pub fn duration(&self) -> u32 {
        self.duration
    }
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        RetransmitTimer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::TestTransport;

    #[test]
    fn start_is_idempotent() {
        let mut transport = TestTransport::new();
        let mut timer = RetransmitTimer::new();
        timer.start(&mut transport, 7_000_000);
        let first = timer.get_timeout(7_000_000);
        timer.start(&mut transport, 7_000_000);
        assert_eq!(timer.get_timeout(7_000_000), first);
        assert_eq!(first, Some(1_000_000));
        assert_eq!(transport.deadline, Some(8_000_000));
    }

    #[test]
    fn doubling_caps_at_sixty_seconds() {
        let mut transport = TestTransport::new();
        let mut timer = RetransmitTimer::new();
        let mut now = 0;
        timer.start(&mut transport, now);
        assert_eq!(timer.duration(), 1);

        let mut seen = Vec::new();
        for _ in 0..7 {
            now += u64::from(timer.duration()) * 1_000_000;
            timer.double(&mut transport, now);
            seen.push(timer.duration());
        }
        assert_eq!(seen, [2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(transport.deadline, Some(now + 60_000_000));
    }

    #[test]
    fn stopped_timer_never_expires() {
        let timer = RetransmitTimer::new();
        assert_eq!(timer.get_timeout(u64::max_value()), None);
        assert!(!timer.is_expired(u64::max_value()));
    }

    #[test]
    fn slack_window_reports_zero() {
        let mut transport = TestTransport::new();
        let mut timer = RetransmitTimer::new();
        timer.start(&mut transport, 0);
        // 15 ms out: still a real remaining time
        assert_eq!(timer.get_timeout(985_000), Some(15_000));
        assert!(!timer.is_expired(985_000));
        // one microsecond closer and it collapses to zero
        assert_eq!(timer.get_timeout(985_001), Some(0));
        assert!(timer.is_expired(985_001));
    }

    #[test]
    fn stop_clears_timer_and_transport_deadline() {
        let mut transport = TestTransport::new();
        let mut timer = RetransmitTimer::new();
        timer.start(&mut transport, 0);
        timer.double(&mut transport, 1_000_000);
        timer.stop(&mut transport);
        assert_eq!(timer.get_timeout(0), None);
        assert_eq!(timer.duration(), 1);
        assert_eq!(transport.deadline, None);
    }

    #[test]
    fn reliable_transport_suppresses_timer() {
        let mut transport = TestTransport::new();
        transport.reliable = true;
        let mut timer = RetransmitTimer::new();
        timer.start(&mut transport, 0);
        assert_eq!(timer.get_timeout(0), None);
        assert!(!timer.is_expired(u64::max_value()));
        assert_eq!(transport.deadline, None);
    }
}
