//! Bounded wait for the instrument's service request.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::acquisition::{pause, CancelToken};
use crate::channel::CommandChannel;
use crate::errors::{ChannelError, DriverError, Result};
use crate::instrument::{Electrometer, StatusByte};

/// Shortest allowed spacing between status reads.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Longest allowed spacing between status reads.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Polls the status byte until bit 6 is set or the deadline passes.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessMonitor {
    timeout: Duration,
    poll_interval: Duration,
}

impl ReadinessMonitor {
    /// `poll_interval` is clamped to [`MIN_POLL_INTERVAL`, `MAX_POLL_INTERVAL`].
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval: poll_interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait for a service request and return the status byte that carried it.
    ///
    /// Transport hiccups and garbled replies are retried until the deadline;
    /// a dropped link or an unsupported operation ends the wait at once. The
    /// status byte is only observed, never cleared.
    pub fn wait<C: CommandChannel>(&self, session: &mut Electrometer<C>) -> Result<StatusByte> {
        self.wait_cancellable(session, &CancelToken::new())
    }

    /// Like [`wait`](Self::wait), but gives up with [`DriverError::Cancelled`]
    /// once `cancel` fires, checked between status reads.
    pub fn wait_cancellable<C: CommandChannel>(
        &self,
        session: &mut Electrometer<C>,
        cancel: &CancelToken,
    ) -> Result<StatusByte> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut polls = 0usize;
        let mut failures = 0usize;

        loop {
            if cancel.is_cancelled() {
                debug!("service request wait cancelled after {} polls", polls);
                return Err(DriverError::Cancelled);
            }
            polls += 1;
            match session.read_status_byte() {
                Ok(stb) if stb.service_requested() => {
                    debug!(
                        "service request after {:?} ({} polls, status={:#04x})",
                        started.elapsed(),
                        polls,
                        stb.bits()
                    );
                    return Ok(stb);
                }
                Ok(_) => {}
                Err(e) if is_transient(&e) => {
                    failures += 1;
                    if failures == 1 || failures % 10 == 0 {
                        warn!("status read failed ({} so far), retrying: {}", failures, e);
                    }
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    "no service request within {:?} ({} polls, {} failed)",
                    self.timeout, polls, failures
                );
                return Err(DriverError::Timeout(self.timeout));
            }
            if !pause(cancel, self.poll_interval.min(deadline - now)) {
                debug!("service request wait cancelled after {} polls", polls);
                return Err(DriverError::Cancelled);
            }
        }
    }
}

impl Default for ReadinessMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), DEFAULT_POLL_INTERVAL)
    }
}

fn is_transient(error: &DriverError) -> bool {
    match error {
        DriverError::MalformedResponse { .. } => true,
        DriverError::Channel(ChannelError::Io(_))
        | DriverError::Channel(ChannelError::Serial(_))
        | DriverError::Channel(ChannelError::Timeout(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{InstrumentConfig, TriggerConfig};
    use crate::sim::SimulatedElectrometer;

    fn armed(sim: SimulatedElectrometer, count: u32) -> Electrometer<SimulatedElectrometer> {
        let mut m = Electrometer::new(sim);
        m.reset().unwrap();
        m.configure(&InstrumentConfig::default()).unwrap();
        m.arm(&TriggerConfig::finite(count)).unwrap();
        m
    }

    #[test]
    fn returns_on_first_poll_when_bit_is_set() {
        let mut m = armed(SimulatedElectrometer::bus().with_readings_per_poll(5), 5);
        let started = Instant::now();
        let stb = ReadinessMonitor::new(Duration::from_secs(1), Duration::from_millis(100))
            .wait(&mut m)
            .unwrap();
        assert!(stb.service_requested());
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(m.channel().status_reads(), 1);
    }

    #[test]
    fn never_set_bit_times_out_within_bound() {
        let mut m = armed(SimulatedElectrometer::bus().without_service_request(), 5);
        let started = Instant::now();
        let result = ReadinessMonitor::new(Duration::from_secs(1), Duration::from_millis(100))
            .wait(&mut m);
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(DriverError::Timeout(t)) if t == Duration::from_secs(1)));
        assert!(elapsed >= Duration::from_secs(1), "returned early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1200), "overran: {elapsed:?}");
        assert!(m.channel().status_reads() >= 10);
    }

    #[test]
    fn transient_read_failures_are_retried() {
        let mut m = armed(
            SimulatedElectrometer::polling()
                .failing_status_reads(3)
                .with_readings_per_poll(10),
            10,
        );
        let stb = ReadinessMonitor::new(Duration::from_secs(1), Duration::from_millis(10))
            .wait(&mut m)
            .unwrap();
        assert!(stb.service_requested());
        assert_eq!(m.channel().status_reads(), 4);
    }

    #[test]
    fn cancel_ends_the_wait_between_polls() {
        let mut m = armed(SimulatedElectrometer::bus().without_service_request(), 5);
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            remote.cancel();
        });

        let started = Instant::now();
        let result = ReadinessMonitor::new(Duration::from_secs(5), Duration::from_millis(200))
            .wait_cancellable(&mut m, &cancel);
        stopper.join().unwrap();

        assert!(matches!(result, Err(DriverError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(m.channel().status_reads(), 1);
    }

    #[test]
    fn poll_interval_is_bounded() {
        let fast = ReadinessMonitor::new(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(fast.poll_interval(), MIN_POLL_INTERVAL);
        let slow = ReadinessMonitor::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(slow.poll_interval(), MAX_POLL_INTERVAL);
    }

    #[test]
    fn status_is_not_cleared_by_waiting() {
        let mut m = armed(SimulatedElectrometer::bus().with_readings_per_poll(3), 3);
        ReadinessMonitor::new(Duration::from_secs(1), Duration::from_millis(10))
            .wait(&mut m)
            .unwrap();
        assert_eq!(m.channel().count("*CLS"), 0);
        assert!(m.read_status_byte().unwrap().service_requested());
    }
}
