//! Acquisition profiles stored as TOML.
//!
//! ```toml
//! [instrument]
//! function = "current"
//! range = 2e-6
//! nplc = 1.0
//!
//! [trigger]
//! arm_source = "immediate"
//! buffer_points = 2500
//!
//! [timing]
//! srq_timeout_ms = 30000
//! drain_interval_ms = 500
//!
//! [format]
//! elements = ["reading", "timestamp", "status"]
//!
//! [run]
//! samples = 100
//! ```
//!
//! Every key is optional; missing ones take the defaults below.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::acquisition::{AcquisitionMode, AcquisitionSettings};
use crate::drain::{RecordElement, RecordLayout};
use crate::errors::DriverError;
use crate::instrument::{ArmSource, InstrumentConfig, MAX_BUFFER_POINTS};
use crate::readiness::{MAX_POLL_INTERVAL, MIN_POLL_INTERVAL};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSection {
    pub arm_source: ArmSource,
    pub arm_count: u32,
    pub buffer_points: u32,
    pub clear_buffer: bool,
}

impl Default for TriggerSection {
    fn default() -> Self {
        Self {
            arm_source: ArmSource::Immediate,
            arm_count: 1,
            buffer_points: MAX_BUFFER_POINTS,
            clear_buffer: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub srq_timeout_ms: u64,
    pub srq_poll_interval_ms: u64,
    pub drain_interval_ms: u64,
    pub settle_delay_ms: u64,
    pub max_decode_failures: u32,
    /// Stop a continuous run after this many seconds.
    pub run_duration_s: Option<f64>,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            srq_timeout_ms: 30_000,
            srq_poll_interval_ms: 200,
            drain_interval_ms: 500,
            settle_delay_ms: 500,
            max_decode_failures: 3,
            run_duration_s: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatSection {
    pub elements: Vec<RecordElement>,
}

impl Default for FormatSection {
    fn default() -> Self {
        Self {
            elements: RecordLayout::default().elements().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub samples: Option<usize>,
    pub continuous: bool,
}

/// A complete acquisition profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionProfile {
    pub instrument: InstrumentConfig,
    pub trigger: TriggerSection,
    pub timing: TimingSection,
    pub format: FormatSection,
    pub run: RunSection,
}

impl AcquisitionProfile {
    /// Read, parse and validate a profile file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read profile {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid profile {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let profile: Self = toml::from_str(content).context("failed to parse profile")?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.instrument.validate()?;
        if self.trigger.buffer_points == 0 || self.trigger.buffer_points > MAX_BUFFER_POINTS {
            return Err(DriverError::InvalidSettings(format!(
                "buffer_points {} outside [1, {MAX_BUFFER_POINTS}]",
                self.trigger.buffer_points
            )));
        }
        if self.trigger.arm_count == 0 {
            return Err(DriverError::InvalidSettings(
                "arm_count must be at least 1".into(),
            ));
        }
        let poll = Duration::from_millis(self.timing.srq_poll_interval_ms);
        if poll < MIN_POLL_INTERVAL || poll > MAX_POLL_INTERVAL {
            return Err(DriverError::InvalidSettings(format!(
                "srq_poll_interval_ms {} outside [{}, {}]",
                self.timing.srq_poll_interval_ms,
                MIN_POLL_INTERVAL.as_millis(),
                MAX_POLL_INTERVAL.as_millis()
            )));
        }
        self.run_duration()?;
        if self.run.samples == Some(0) {
            return Err(DriverError::InvalidSettings("samples must be positive".into()));
        }
        RecordLayout::new(self.format.elements.clone())?;
        Ok(())
    }

    pub fn into_settings(self) -> crate::Result<AcquisitionSettings> {
        let run_duration = self.run_duration()?;
        let layout = RecordLayout::new(self.format.elements)?;
        Ok(AcquisitionSettings {
            instrument: self.instrument,
            arm_source: self.trigger.arm_source,
            arm_count: self.trigger.arm_count,
            buffer_points: self.trigger.buffer_points,
            clear_buffer: self.trigger.clear_buffer,
            layout,
            srq_timeout: Duration::from_millis(self.timing.srq_timeout_ms),
            srq_poll_interval: Duration::from_millis(self.timing.srq_poll_interval_ms),
            drain_interval: Duration::from_millis(self.timing.drain_interval_ms),
            settle_delay: Duration::from_millis(self.timing.settle_delay_ms),
            max_decode_failures: self.timing.max_decode_failures,
            run_duration,
        })
    }

    fn run_duration(&self) -> crate::Result<Option<Duration>> {
        let Some(secs) = self.timing.run_duration_s else {
            return Ok(None);
        };
        if !(secs.is_finite() && secs > 0.0) {
            return Err(DriverError::InvalidSettings(format!(
                "run_duration_s must be positive, got {secs}"
            )));
        }
        Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| DriverError::InvalidSettings(format!("run_duration_s {secs}: {e}")))
    }

    /// Mode requested by the `[run]` section, if any.
    pub fn mode(&self) -> Option<AcquisitionMode> {
        if self.run.continuous {
            Some(AcquisitionMode::Continuous)
        } else {
            self.run.samples.map(AcquisitionMode::Finite)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MeasurementFunction;
    use std::io::Write;

    #[test]
    fn empty_profile_uses_defaults() {
        let profile = AcquisitionProfile::from_toml_str("").unwrap();
        assert_eq!(profile, AcquisitionProfile::default());
        assert_eq!(profile.mode(), None);

        let settings = profile.into_settings().unwrap();
        assert_eq!(settings.buffer_points, 2500);
        assert_eq!(settings.srq_timeout, Duration::from_secs(30));
        assert_eq!(settings.layout.width(), 3);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let profile = AcquisitionProfile::from_toml_str(
            r#"
            [instrument]
            function = "charge"
            range = 2e-8
            nplc = 1.0

            [trigger]
            arm_source = "bus"

            [timing]
            drain_interval_ms = 250
            run_duration_s = 1.5

            [format]
            elements = ["reading", "other", "timestamp"]

            [run]
            continuous = true
            "#,
        )
        .unwrap();

        assert_eq!(profile.instrument.function, MeasurementFunction::Charge);
        assert!(!profile.instrument.display_enabled);
        assert_eq!(profile.trigger.arm_source, ArmSource::Bus);
        assert_eq!(profile.trigger.arm_count, 1);
        assert_eq!(profile.mode(), Some(AcquisitionMode::Continuous));

        let settings = profile.into_settings().unwrap();
        assert_eq!(settings.drain_interval, Duration::from_millis(250));
        assert_eq!(settings.settle_delay, Duration::from_millis(500));
        assert_eq!(settings.run_duration, Some(Duration::from_millis(1500)));
        assert_eq!(settings.layout.width(), 3);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for bad in [
            "[instrument]\nnplc = 0.001",
            "[instrument]\nrange = 0.0",
            "[trigger]\nbuffer_points = 0",
            "[trigger]\nbuffer_points = 5000",
            "[timing]\nsrq_poll_interval_ms = 5000",
            "[format]\nelements = [\"timestamp\"]",
            "[run]\nsamples = 0",
            "[timing]\nrun_duration_s = 1e30",
            "[timing]\nrun_duration_s = -2.0",
        ] {
            assert!(
                AcquisitionProfile::from_toml_str(bad).is_err(),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn oversized_run_duration_is_an_error_not_a_panic() {
        let mut profile = AcquisitionProfile::default();
        profile.timing.run_duration_s = Some(1e30);
        assert!(matches!(
            profile.into_settings(),
            Err(DriverError::InvalidSettings(_))
        ));

        let mut profile = AcquisitionProfile::default();
        profile.timing.run_duration_s = Some(2.5);
        assert_eq!(
            profile.into_settings().unwrap().run_duration,
            Some(Duration::from_millis(2500))
        );
    }

    #[test]
    fn unknown_function_is_a_parse_error() {
        assert!(AcquisitionProfile::from_toml_str("[instrument]\nfunction = \"resistance\"").is_err());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[run]\nsamples = 10\n\n[instrument]\nfunction = \"voltage\"").unwrap();

        let profile = AcquisitionProfile::load(file.path()).unwrap();
        assert_eq!(profile.mode(), Some(AcquisitionMode::Finite(10)));
        assert_eq!(profile.instrument.function, MeasurementFunction::Voltage);
    }

    #[test]
    fn load_reports_path_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let err = AcquisitionProfile::load(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("absent.toml"));
    }
}
