//! Acquisition runs: finite blocks and continuous streaming.
//!
//! Both modes reset, configure and arm the instrument, then either wait for
//! the buffer-full service request and drain once, or drain periodically
//! until cancelled. Whatever happens in between, every run ends with exactly
//! one `:ABOR` before it returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::channel::CommandChannel;
use crate::drain::{BufferDrain, DrainCursor, RecordLayout, Sample};
use crate::errors::{ContinuousError, DriverError, Result};
use crate::instrument::{
    ArmSource, Electrometer, InstrumentConfig, TriggerConfig, TriggerCount, BUFFER_FULL_EVENT,
    MAX_BUFFER_POINTS,
};
use crate::readiness::{ReadinessMonitor, DEFAULT_POLL_INTERVAL};

/// Granularity of cancellable sleeps.
const CANCEL_SLICE: Duration = Duration::from_millis(10);

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative stop flag, cheap to clone across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Receives each batch of newly drained samples, in index order.
pub trait SampleSink {
    fn consume(&mut self, samples: &[Sample]);
}

impl SampleSink for Vec<Sample> {
    fn consume(&mut self, samples: &[Sample]) {
        self.extend_from_slice(samples);
    }
}

impl<S: SampleSink + ?Sized> SampleSink for &mut S {
    fn consume(&mut self, samples: &[Sample]) {
        (**self).consume(samples);
    }
}

/// Fan out to two sinks.
impl<A: SampleSink, B: SampleSink> SampleSink for (A, B) {
    fn consume(&mut self, samples: &[Sample]) {
        self.0.consume(samples);
        self.1.consume(samples);
    }
}

/// Writes each sample to the log at `info` level.
#[derive(Debug, Clone, Copy)]
pub struct LogSink {
    unit: &'static str,
}

impl LogSink {
    pub fn new(unit: &'static str) -> Self {
        Self { unit }
    }
}

impl SampleSink for LogSink {
    fn consume(&mut self, samples: &[Sample]) {
        for s in samples {
            info!(
                "#{:<5} t={:>9.3}s  {:+.6E} {}  status={}",
                s.index, s.timestamp, s.value, self.unit, s.status
            );
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// Acquire exactly this many readings, then stop.
    Finite(usize),
    /// Stream until cancelled or the run duration elapses.
    Continuous,
}

/// Everything a run needs besides the channel.
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub instrument: InstrumentConfig,
    pub arm_source: ArmSource,
    pub arm_count: u32,
    /// Buffer size for continuous runs; finite runs size the buffer to the count.
    pub buffer_points: u32,
    pub clear_buffer: bool,
    pub layout: RecordLayout,
    pub srq_timeout: Duration,
    pub srq_poll_interval: Duration,
    pub drain_interval: Duration,
    /// Pause between `INIT` and the first continuous drain.
    pub settle_delay: Duration,
    /// Consecutive decode failures tolerated in continuous mode.
    pub max_decode_failures: u32,
    pub run_duration: Option<Duration>,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            instrument: InstrumentConfig::default(),
            arm_source: ArmSource::Immediate,
            arm_count: 1,
            buffer_points: MAX_BUFFER_POINTS,
            clear_buffer: false,
            layout: RecordLayout::default(),
            srq_timeout: Duration::from_secs(30),
            srq_poll_interval: DEFAULT_POLL_INTERVAL,
            drain_interval: Duration::from_millis(500),
            settle_delay: Duration::from_millis(500),
            max_decode_failures: 3,
            run_duration: None,
        }
    }
}

impl AcquisitionSettings {
    pub fn trigger_config(&self, count: TriggerCount) -> TriggerConfig {
        let buffer_points = match count {
            TriggerCount::Finite(n) => n,
            TriggerCount::Infinite => self.buffer_points,
        };
        TriggerConfig {
            arm_source: self.arm_source,
            arm_count: self.arm_count,
            trigger_count: count,
            buffer_points,
            clear_buffer: self.clear_buffer,
        }
    }

    /// The readiness deadline must outlast a single channel exchange.
    pub fn validate(&self, io_timeout: Duration) -> Result<()> {
        self.instrument.validate()?;
        if self.srq_timeout <= io_timeout {
            return Err(DriverError::InvalidSettings(format!(
                "SRQ timeout {:?} must exceed the channel timeout {:?}",
                self.srq_timeout, io_timeout
            )));
        }
        if self.run_duration == Some(Duration::ZERO) {
            return Err(DriverError::InvalidSettings(
                "run duration must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs acquisitions on one instrument session.
pub struct Acquisition<C: CommandChannel> {
    session: Electrometer<C>,
    settings: AcquisitionSettings,
}

impl<C: CommandChannel> Acquisition<C> {
    pub fn new(channel: C, settings: AcquisitionSettings) -> Self {
        Self::with_session(Electrometer::new(channel), settings)
    }

    pub fn with_session(session: Electrometer<C>, settings: AcquisitionSettings) -> Self {
        Self { session, settings }
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    pub fn session(&self) -> &Electrometer<C> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Electrometer<C> {
        &mut self.session
    }

    pub fn into_session(self) -> Electrometer<C> {
        self.session
    }

    /// Run in `mode`, handing samples to `sink`. Returns how many were delivered.
    pub fn run<S: SampleSink + ?Sized>(
        &mut self,
        mode: AcquisitionMode,
        cancel: &CancelToken,
        sink: &mut S,
    ) -> std::result::Result<usize, ContinuousError> {
        match mode {
            AcquisitionMode::Finite(count) => {
                let samples = self
                    .run_finite_cancellable(count, cancel)
                    .map_err(|source| ContinuousError {
                        delivered: 0,
                        source,
                    })?;
                sink.consume(&samples);
                Ok(samples.len())
            }
            AcquisitionMode::Continuous => self.run_continuous(cancel, sink),
        }
    }

    /// Acquire exactly `count` readings.
    ///
    /// Either every reading of the block is returned or none is.
    pub fn run_finite(&mut self, count: usize) -> Result<Vec<Sample>> {
        self.run_finite_cancellable(count, &CancelToken::new())
    }

    /// [`run_finite`](Self::run_finite) that stops waiting for the block with
    /// [`DriverError::Cancelled`] once `cancel` fires.
    pub fn run_finite_cancellable(
        &mut self,
        count: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<Sample>> {
        let points = u32::try_from(count).map_err(|_| {
            DriverError::InvalidSettings(format!("sample count {count} is too large"))
        })?;
        let trigger = self.settings.trigger_config(TriggerCount::Finite(points));
        self.settings.validate(self.session.channel().io_timeout())?;
        trigger.validate()?;

        info!("finite acquisition of {} readings", count);
        let mut run = ScopedRun::new(&mut self.session, &self.settings);
        let outcome = run.finite_block(&trigger, count, cancel);
        run.finish(outcome)
    }

    /// Stream readings into `sink` until `cancel` fires or the run duration elapses.
    ///
    /// On error the count of samples already handed to the sink is reported
    /// with it.
    pub fn run_continuous<S: SampleSink + ?Sized>(
        &mut self,
        cancel: &CancelToken,
        sink: &mut S,
    ) -> std::result::Result<usize, ContinuousError> {
        let mut delivered = 0usize;
        let trigger = self.settings.trigger_config(TriggerCount::Infinite);
        let checked = self
            .settings
            .validate(self.session.channel().io_timeout())
            .and_then(|_| trigger.validate());
        if let Err(source) = checked {
            return Err(ContinuousError { delivered, source });
        }

        info!(
            "continuous acquisition: buffer={}, drain every {:?}",
            trigger.buffer_points, self.settings.drain_interval
        );
        let mut run = ScopedRun::new(&mut self.session, &self.settings);
        let outcome = run.stream(&trigger, cancel, sink, &mut delivered);
        match run.finish(outcome) {
            Ok(()) => {
                info!("continuous acquisition stopped: {} readings", delivered);
                Ok(delivered)
            }
            Err(source) => Err(ContinuousError { delivered, source }),
        }
    }
}

/// One run on a borrowed session. Ends with `:ABOR` through [`finish`](Self::finish),
/// or on drop if the run unwinds before getting there.
struct ScopedRun<'a, C: CommandChannel> {
    session: &'a mut Electrometer<C>,
    settings: &'a AcquisitionSettings,
    finished: bool,
}

impl<'a, C: CommandChannel> ScopedRun<'a, C> {
    fn new(session: &'a mut Electrometer<C>, settings: &'a AcquisitionSettings) -> Self {
        Self {
            session,
            settings,
            finished: false,
        }
    }

    fn finite_block(
        &mut self,
        trigger: &TriggerConfig,
        count: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<Sample>> {
        self.start(trigger)?;

        let monitor =
            ReadinessMonitor::new(self.settings.srq_timeout, self.settings.srq_poll_interval);
        match monitor.wait_cancellable(self.session, cancel) {
            Ok(_) => {}
            Err(DriverError::Timeout(after)) => {
                warn!("no service request within {:?}", after);
                return Err(DriverError::AcquisitionTimedOut(after));
            }
            Err(DriverError::Cancelled) => {
                info!("cancelled while waiting for the block");
                return Err(DriverError::Cancelled);
            }
            Err(e) => return Err(e),
        }

        let events = self.session.measurement_status()?;
        if events & BUFFER_FULL_EVENT == 0 {
            warn!(
                "service request without buffer-full event (STAT:MEAS={})",
                events
            );
        } else {
            debug!("measurement events: {}", events);
        }

        let mut drain = BufferDrain::new(self.settings.layout.clone()).with_limit(count);
        let mut cursor = DrainCursor::new();
        let samples = drain.drain_once(self.session, &mut cursor)?;
        if samples.len() != count {
            return Err(DriverError::IncompleteRun {
                expected: count,
                received: samples.len(),
            });
        }
        info!("finite acquisition complete: {} readings", samples.len());
        Ok(samples)
    }

    fn stream<S: SampleSink + ?Sized>(
        &mut self,
        trigger: &TriggerConfig,
        cancel: &CancelToken,
        sink: &mut S,
        delivered: &mut usize,
    ) -> Result<()> {
        self.start(trigger)?;
        let started = Instant::now();

        let mut drain = BufferDrain::new(self.settings.layout.clone())
            .with_capacity(trigger.buffer_points as usize);
        let mut cursor = DrainCursor::new();
        let mut failures = 0u32;

        if !pause(cancel, self.settings.settle_delay) {
            info!("cancelled before the first drain");
            return Ok(());
        }

        loop {
            if cancel.is_cancelled() {
                info!("cancellation requested");
                return Ok(());
            }
            if let Some(limit) = self.settings.run_duration {
                if started.elapsed() >= limit {
                    info!("run duration of {:?} reached", limit);
                    return Ok(());
                }
            }

            match drain.drain_once(self.session, &mut cursor) {
                Ok(samples) => {
                    failures = 0;
                    if !samples.is_empty() {
                        *delivered += samples.len();
                        sink.consume(&samples);
                    }
                }
                Err(e) if e.is_recoverable() => {
                    failures += 1;
                    if failures > self.settings.max_decode_failures {
                        return Err(e);
                    }
                    warn!(
                        "drain failed ({}/{}), retrying from #{}: {}",
                        failures,
                        self.settings.max_decode_failures,
                        cursor.last_delivered() + 1,
                        e
                    );
                }
                Err(e) => return Err(e),
            }

            if !pause(cancel, self.settings.drain_interval) {
                info!("cancellation requested");
                return Ok(());
            }
        }
    }

    /// Reset, configure and arm; release a bus-sourced arm layer.
    fn start(&mut self, trigger: &TriggerConfig) -> Result<()> {
        self.session.reset()?;
        self.session.configure(&self.settings.instrument)?;
        self.session.arm(trigger)?;
        if trigger.arm_source == ArmSource::Bus {
            self.session.trigger()?;
        }
        Ok(())
    }

    /// Abort exactly once. A failure of the run takes precedence over a
    /// failure of the abort itself.
    fn finish<T>(mut self, outcome: Result<T>) -> Result<T> {
        self.finished = true;
        let aborted = self.session.abort();
        match (outcome, aborted) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(abort_err)) => Err(abort_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(abort_err)) => {
                warn!("abort after failed run also failed: {}", abort_err);
                Err(e)
            }
        }
    }
}

impl<C: CommandChannel> Drop for ScopedRun<'_, C> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("acquisition unwound before finishing, aborting");
        if let Err(e) = self.session.abort() {
            warn!("abort on unwind failed: {}", e);
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` if cancelled.
pub(crate) fn pause(cancel: &CancelToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(CANCEL_SLICE.min(deadline - now));
    }
}
