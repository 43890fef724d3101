//! Electrometer session: reset, configuration and trigger arming.
//!
//! # Command ordering
//!
//! The instrument scopes range and integration-time commands to the active
//! measurement function, so the function is always selected first. The
//! status system is set up right after `*RST`, and the service-request
//! enable mask is written before anything is armed; otherwise the
//! buffer-full event never reaches bit 6 of the status byte.
//!
//! # State machine
//!
//! ```text
//! Idle --configure--> Configured --arm--> Armed --abort/reset--> Idle
//! ```
//!
//! While armed, only status reads, buffer queries and `abort` are accepted.

use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::channel::CommandChannel;
use crate::errors::{ChannelError, DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Shortest integration time the instrument accepts, in power-line cycles.
pub const MIN_NPLC: f64 = 0.01;
/// Longest integration time, in power-line cycles.
pub const MAX_NPLC: f64 = 10.0;
/// Capacity of the reading buffer.
pub const MAX_BUFFER_POINTS: u32 = 2500;

/// `STAT:MEAS` bit raised when the reading buffer is full.
pub const BUFFER_FULL_EVENT: u32 = 1 << 9;

const RESET_SEQUENCE: [&str; 4] = ["*RST", "STAT:PRES;*CLS", "STAT:MEAS:ENAB 512", "*SRE 1"];

// ============================================================================
// Data Types
// ============================================================================

/// Measurement function selected with `SENS:FUNC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementFunction {
    #[default]
    Current,
    Voltage,
    Charge,
}

impl MeasurementFunction {
    /// SCPI mnemonic used as command prefix.
    pub fn mnemonic(self) -> &'static str {
        match self {
            MeasurementFunction::Current => "CURR",
            MeasurementFunction::Voltage => "VOLT",
            MeasurementFunction::Charge => "CHAR",
        }
    }

    /// Unit of readings taken with this function.
    pub fn unit(self) -> &'static str {
        match self {
            MeasurementFunction::Current => "A",
            MeasurementFunction::Voltage => "V",
            MeasurementFunction::Charge => "C",
        }
    }
}

impl fmt::Display for MeasurementFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl FromStr for MeasurementFunction {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "current" | "curr" => Ok(MeasurementFunction::Current),
            "voltage" | "volt" => Ok(MeasurementFunction::Voltage),
            "charge" | "char" => Ok(MeasurementFunction::Charge),
            other => Err(DriverError::ConfigurationRejected(format!(
                "unsupported measurement function {other:?} (expected current, voltage or charge)"
            ))),
        }
    }
}

/// Measurement settings applied once per session, before arming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub function: MeasurementFunction,
    /// Fixed full-scale range; auto-ranging is always disabled.
    pub range: f64,
    /// Integration time in power-line cycles.
    pub nplc: f64,
    pub zero_check: bool,
    pub zero_correction: bool,
    pub auto_zero: bool,
    pub averaging: bool,
    pub median_filter: bool,
    pub display_digits: f64,
    pub display_enabled: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            function: MeasurementFunction::Current,
            range: 200e-6,
            nplc: MIN_NPLC,
            zero_check: false,
            zero_correction: false,
            auto_zero: false,
            averaging: false,
            median_filter: false,
            display_digits: 4.5,
            display_enabled: false,
        }
    }
}

impl InstrumentConfig {
    /// Default range for each function: 200 µA, 200 V, 200 nC.
    pub fn for_function(function: MeasurementFunction) -> Self {
        let range = match function {
            MeasurementFunction::Current => 200e-6,
            MeasurementFunction::Voltage => 200.0,
            MeasurementFunction::Charge => 200e-9,
        };
        Self {
            function,
            range,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.range.is_finite() || self.range <= 0.0 {
            return Err(DriverError::ConfigurationRejected(format!(
                "range must be a positive number, got {}",
                self.range
            )));
        }
        if !(MIN_NPLC..=MAX_NPLC).contains(&self.nplc) {
            return Err(DriverError::ConfigurationRejected(format!(
                "NPLC {} outside [{MIN_NPLC}, {MAX_NPLC}]",
                self.nplc
            )));
        }
        if !(3.5..=6.5).contains(&self.display_digits) {
            return Err(DriverError::ConfigurationRejected(format!(
                "display digits {} outside [3.5, 6.5]",
                self.display_digits
            )));
        }
        Ok(())
    }

    /// Commands in the order the instrument requires them.
    pub fn commands(&self) -> Vec<String> {
        let f = self.function.mnemonic();
        vec![
            format!("SENS:FUNC \"{f}\""),
            format!("CONF:{f}"),
            format!("SYST:ZCH {}", on_off(self.zero_check)),
            format!("SYST:ZCOR {}", on_off(self.zero_correction)),
            format!("SYST:AZER {}", on_off(self.auto_zero)),
            format!("{f}:RANG:AUTO OFF"),
            format!("{f}:RANG {:E}", self.range),
            format!("{f}:NPLC {}", self.nplc),
            format!("MED {}", on_off(self.median_filter)),
            format!("AVER {}", on_off(self.averaging)),
            format!("DISP:DIG {}", self.display_digits),
            format!("DISP:ENAB {}", on_off(self.display_enabled)),
        ]
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

/// Where the arm layer takes its event from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArmSource {
    /// Wait for a Group Execute Trigger on the bus.
    Bus,
    #[default]
    Immediate,
}

impl ArmSource {
    pub fn mnemonic(self) -> &'static str {
        match self {
            ArmSource::Bus => "BUS",
            ArmSource::Immediate => "IMM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCount {
    Finite(u32),
    Infinite,
}

impl fmt::Display for TriggerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerCount::Finite(n) => write!(f, "{n}"),
            TriggerCount::Infinite => f.write_str("INF"),
        }
    }
}

/// Trigger model and buffer setup; fixed once `INIT` is issued.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    pub arm_source: ArmSource,
    pub arm_count: u32,
    pub trigger_count: TriggerCount,
    pub buffer_points: u32,
    /// Emit `TRAC:CLE` before configuring the buffer feed.
    pub clear_buffer: bool,
}

impl TriggerConfig {
    /// Finite block of `count` readings into a buffer of the same size.
    pub fn finite(count: u32) -> Self {
        Self {
            arm_source: ArmSource::Immediate,
            arm_count: 1,
            trigger_count: TriggerCount::Finite(count),
            buffer_points: count,
            clear_buffer: false,
        }
    }

    /// Endless triggering into a buffer of `buffer_points`.
    pub fn continuous(buffer_points: u32) -> Self {
        Self {
            arm_source: ArmSource::Immediate,
            arm_count: 1,
            trigger_count: TriggerCount::Infinite,
            buffer_points,
            clear_buffer: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.arm_count == 0 {
            return Err(DriverError::ConfigurationRejected(
                "arm count must be at least 1".into(),
            ));
        }
        if self.buffer_points == 0 || self.buffer_points > MAX_BUFFER_POINTS {
            return Err(DriverError::ConfigurationRejected(format!(
                "buffer size {} outside [1, {MAX_BUFFER_POINTS}]",
                self.buffer_points
            )));
        }
        if let TriggerCount::Finite(n) = self.trigger_count {
            if n == 0 || n > self.buffer_points {
                return Err(DriverError::ConfigurationRejected(format!(
                    "trigger count {n} must be within [1, {}]",
                    self.buffer_points
                )));
            }
        }
        Ok(())
    }

    /// Arming commands, ending with `INIT`.
    pub fn commands(&self) -> Vec<String> {
        let mut cmds = vec![
            format!(":ARM:SOUR {}", self.arm_source.mnemonic()),
            format!(":ARM:COUN {}", self.arm_count),
            format!(":TRIG:COUN {}", self.trigger_count),
        ];
        if self.clear_buffer {
            cmds.push("TRAC:CLE".to_string());
        }
        cmds.extend([
            "TRAC:FEED SENS".to_string(),
            "TRAC:FEED:CONT NEXT".to_string(),
            format!("TRAC:POIN {}", self.buffer_points),
            "INIT".to_string(),
        ]);
        cmds
    }
}

/// IEEE-488.2 status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusByte(pub u8);

impl StatusByte {
    /// Bit 0: summary of the enabled measurement events.
    pub const MEASUREMENT_SUMMARY: u8 = 0x01;
    /// Bit 6: request for service.
    pub const SERVICE_REQUEST: u8 = 0x40;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn service_requested(self) -> bool {
        self.0 & Self::SERVICE_REQUEST != 0
    }

    pub fn measurement_summary(self) -> bool {
        self.0 & Self::MEASUREMENT_SUMMARY != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Armed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Configured => "configured",
            SessionState::Armed => "armed",
        }
    }
}

// ============================================================================
// Electrometer Session
// ============================================================================

/// Exclusive session on one electrometer.
///
/// # Example
/// ```ignore
/// let channel = GpibChannel::open(&ChannelSettings::new("/dev/ttyUSB0"))?;
/// let mut meter = Electrometer::new(channel);
/// meter.reset()?;
/// meter.configure(&InstrumentConfig::for_function(MeasurementFunction::Charge))?;
/// meter.arm(&TriggerConfig::finite(100))?;
/// ```
pub struct Electrometer<C: CommandChannel> {
    channel: C,
    state: SessionState,
    function: Option<MeasurementFunction>,
    trigger: Option<TriggerConfig>,
}

impl<C: CommandChannel> Electrometer<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            state: SessionState::Idle,
            function: None,
            trigger: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Function selected by the last successful `configure`.
    pub fn function(&self) -> Option<MeasurementFunction> {
        self.function
    }

    /// Trigger model applied by the last `arm`, while armed.
    pub fn trigger_config(&self) -> Option<&TriggerConfig> {
        self.trigger.as_ref()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Device reset followed by status-system setup. Valid in any state.
    pub fn reset(&mut self) -> Result<()> {
        info!("resetting instrument over {}", self.channel.kind());
        for cmd in RESET_SEQUENCE {
            self.channel.send(cmd)?;
        }
        self.state = SessionState::Idle;
        self.function = None;
        self.trigger = None;
        Ok(())
    }

    /// Apply measurement settings. Only valid while idle.
    pub fn configure(&mut self, config: &InstrumentConfig) -> Result<()> {
        self.require(SessionState::Idle, "configure")?;
        config.validate()?;

        for cmd in config.commands() {
            self.channel.send(&cmd)?;
        }
        if let Some(error) = self.channel.check_error()? {
            warn!("instrument rejected configuration: {}", error);
            return Err(DriverError::ConfigurationRejected(error));
        }

        debug!(
            "configured: function={}, range={:E}, nplc={}",
            config.function, config.range, config.nplc
        );
        self.function = Some(config.function);
        self.state = SessionState::Configured;
        Ok(())
    }

    /// Program the trigger model and buffer, then `INIT`. Only valid once configured.
    pub fn arm(&mut self, trigger: &TriggerConfig) -> Result<()> {
        self.require(SessionState::Configured, "arm")?;
        trigger.validate()?;

        for cmd in trigger.commands() {
            self.channel.send(&cmd)?;
        }

        info!(
            "armed: source={}, triggers={}, buffer={}",
            trigger.arm_source.mnemonic(),
            trigger.trigger_count,
            trigger.buffer_points
        );
        self.trigger = Some(trigger.clone());
        self.state = SessionState::Armed;
        Ok(())
    }

    /// Assert a bus trigger to release a `BUS`-sourced arm layer.
    pub fn trigger(&mut self) -> Result<()> {
        self.require(SessionState::Armed, "trigger")?;
        match self.channel.assert_hardware_trigger() {
            Ok(()) => Ok(()),
            Err(ChannelError::Unsupported(what)) => Err(DriverError::Unsupported(what)),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop any acquisition in progress and return to idle.
    pub fn abort(&mut self) -> Result<()> {
        self.channel.send(":ABOR")?;
        if self.state != SessionState::Idle {
            debug!("aborted from {} state", self.state.as_str());
        }
        self.state = SessionState::Idle;
        self.trigger = None;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    pub fn read_status_byte(&mut self) -> Result<StatusByte> {
        self.channel.read_status_byte().map(StatusByte)
    }

    /// Clear the status registers (`*CLS`), consuming a latched service request.
    pub fn clear_status(&mut self) -> Result<()> {
        self.channel.send("*CLS")?;
        Ok(())
    }

    /// Measurement event register (`STAT:MEAS?`); reading it clears it.
    pub fn measurement_status(&mut self) -> Result<u32> {
        const QUERY: &str = "STAT:MEAS?";
        let response = self.channel.query(QUERY)?;
        parse_register(&response).ok_or_else(|| DriverError::malformed(QUERY, &response))
    }

    // ------------------------------------------------------------------------
    // Buffer
    // ------------------------------------------------------------------------

    /// Raw `TRAC:POIN?` reply.
    pub fn buffer_points_raw(&mut self) -> Result<String> {
        Ok(self.channel.query("TRAC:POIN?")?)
    }

    /// Raw `TRAC:DATA? <start>,<end>` reply; indices are 1-based and inclusive.
    pub fn buffer_range_raw(&mut self, start: usize, end: usize) -> Result<String> {
        Ok(self.channel.query(&format!("TRAC:DATA? {start},{end}"))?)
    }

    /// Raw `TRAC:DATA?` reply covering the whole buffer.
    pub fn buffer_all_raw(&mut self) -> Result<String> {
        Ok(self.channel.query("TRAC:DATA?")?)
    }

    fn require(&self, expected: SessionState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DriverError::InvalidState {
                operation,
                state: self.state.as_str(),
            })
        }
    }
}

/// Parse an event register reply (`512`, `+512`, `+5.120000E+02`).
fn parse_register(response: &str) -> Option<u32> {
    let trimmed = response.trim();
    if let Ok(value) = trimmed.parse::<u32>() {
        return Some(value);
    }
    let value = trimmed.parse::<f64>().ok()?;
    if value.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&value) {
        Some(value as u32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedElectrometer;

    fn meter() -> Electrometer<SimulatedElectrometer> {
        Electrometer::new(SimulatedElectrometer::polling())
    }

    fn position(cmds: &[String], needle: &str) -> usize {
        cmds.iter()
            .position(|c| c == needle)
            .unwrap_or_else(|| panic!("{needle} not sent: {cmds:?}"))
    }

    #[test]
    fn reset_sequence_is_fixed() {
        let mut m = meter();
        m.reset().unwrap();
        assert_eq!(
            m.channel().commands(),
            ["*RST", "STAT:PRES;*CLS", "STAT:MEAS:ENAB 512", "*SRE 1"]
        );
    }

    #[test]
    fn configure_selects_function_before_scoped_settings() {
        for function in [
            MeasurementFunction::Current,
            MeasurementFunction::Voltage,
            MeasurementFunction::Charge,
        ] {
            let mut m = meter();
            m.reset().unwrap();
            m.configure(&InstrumentConfig::for_function(function)).unwrap();

            let cmds = m.channel().commands();
            let f = function.mnemonic();
            let select = position(&cmds, &format!("SENS:FUNC \"{f}\""));
            let conf = position(&cmds, &format!("CONF:{f}"));
            let zch = position(&cmds, "SYST:ZCH OFF");
            let azer = position(&cmds, "SYST:AZER OFF");
            let auto = position(&cmds, &format!("{f}:RANG:AUTO OFF"));
            let nplc = position(&cmds, &format!("{f}:NPLC 0.01"));
            let med = position(&cmds, "MED OFF");
            let disp = position(&cmds, "DISP:ENAB OFF");

            assert!(select < conf && conf < zch && zch < azer);
            assert!(azer < auto && auto < nplc && nplc < med && med < disp);
            assert_eq!(m.state(), SessionState::Configured);
            assert_eq!(m.function(), Some(function));
        }
    }

    #[test]
    fn range_and_nplc_formatting() {
        let cfg = InstrumentConfig {
            nplc: 1.0,
            ..InstrumentConfig::for_function(MeasurementFunction::Current)
        };
        let cmds = cfg.commands();
        assert!(cmds.contains(&"CURR:RANG 2E-4".to_string()));
        assert!(cmds.contains(&"CURR:NPLC 1".to_string()));
        assert!(cmds.contains(&"DISP:DIG 4.5".to_string()));

        let volt = InstrumentConfig::for_function(MeasurementFunction::Voltage).commands();
        assert!(volt.contains(&"VOLT:RANG 2E2".to_string()));
    }

    #[test]
    fn nplc_below_minimum_is_rejected_before_sending() {
        let mut m = meter();
        m.reset().unwrap();
        let cfg = InstrumentConfig {
            nplc: 0.001,
            ..InstrumentConfig::default()
        };
        assert!(matches!(
            m.configure(&cfg),
            Err(DriverError::ConfigurationRejected(_))
        ));
        assert_eq!(m.channel().commands().len(), 4);
        assert_eq!(m.state(), SessionState::Idle);
    }

    #[test]
    fn unknown_function_name_is_rejected() {
        assert_eq!(
            "Charge".parse::<MeasurementFunction>().unwrap(),
            MeasurementFunction::Charge
        );
        assert!(matches!(
            "resistance".parse::<MeasurementFunction>(),
            Err(DriverError::ConfigurationRejected(_))
        ));
    }

    #[test]
    fn instrument_error_queue_rejects_configuration() {
        let mut m = Electrometer::new(SimulatedElectrometer::polling().with_error_checking());
        m.reset().unwrap();
        m.channel_mut().push_error("-221,\"Settings conflict\"");

        match m.configure(&InstrumentConfig::default()) {
            Err(DriverError::ConfigurationRejected(msg)) => assert!(msg.contains("-221")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.state(), SessionState::Idle);
    }

    #[test]
    fn arm_emits_trigger_model_then_init() {
        let mut m = meter();
        m.reset().unwrap();
        m.configure(&InstrumentConfig::default()).unwrap();
        m.channel_mut().clear_commands();

        let trig = TriggerConfig {
            arm_source: ArmSource::Bus,
            clear_buffer: true,
            ..TriggerConfig::finite(100)
        };
        m.arm(&trig).unwrap();

        assert_eq!(
            m.channel().commands(),
            [
                ":ARM:SOUR BUS",
                ":ARM:COUN 1",
                ":TRIG:COUN 100",
                "TRAC:CLE",
                "TRAC:FEED SENS",
                "TRAC:FEED:CONT NEXT",
                "TRAC:POIN 100",
                "INIT",
            ]
        );
        assert_eq!(m.state(), SessionState::Armed);
        assert_eq!(m.trigger_config(), Some(&trig));
    }

    #[test]
    fn continuous_trigger_count_is_infinite() {
        let cmds = TriggerConfig::continuous(2500).commands();
        assert!(cmds.contains(&":TRIG:COUN INF".to_string()));
        assert!(cmds.contains(&"TRAC:POIN 2500".to_string()));
    }

    #[test]
    fn trigger_validation() {
        assert!(TriggerConfig::finite(0).validate().is_err());
        assert!(TriggerConfig::finite(2501).validate().is_err());
        assert!(TriggerConfig::continuous(2500).validate().is_ok());
        let oversubscribed = TriggerConfig {
            buffer_points: 10,
            ..TriggerConfig::finite(20)
        };
        assert!(oversubscribed.validate().is_err());
    }

    #[test]
    fn state_machine_rejects_out_of_order_calls() {
        let mut m = meter();
        assert!(matches!(
            m.arm(&TriggerConfig::finite(10)),
            Err(DriverError::InvalidState { operation: "arm", state: "idle" })
        ));

        m.reset().unwrap();
        m.configure(&InstrumentConfig::default()).unwrap();
        assert!(matches!(
            m.configure(&InstrumentConfig::default()),
            Err(DriverError::InvalidState { operation: "configure", .. })
        ));

        m.arm(&TriggerConfig::finite(10)).unwrap();
        assert!(matches!(
            m.configure(&InstrumentConfig::default()),
            Err(DriverError::InvalidState { state: "armed", .. })
        ));
        assert!(m.read_status_byte().is_ok());

        m.abort().unwrap();
        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(m.trigger_config(), None);
    }

    #[test]
    fn bus_trigger_on_polling_link_is_unsupported() {
        let mut m = meter();
        m.reset().unwrap();
        m.configure(&InstrumentConfig::default()).unwrap();
        m.arm(&TriggerConfig::finite(10)).unwrap();
        assert!(matches!(m.trigger(), Err(DriverError::Unsupported(_))));

        let mut bus = Electrometer::new(SimulatedElectrometer::bus());
        bus.reset().unwrap();
        bus.configure(&InstrumentConfig::default()).unwrap();
        bus.arm(&TriggerConfig::finite(10)).unwrap();
        assert!(bus.trigger().is_ok());
    }

    #[test]
    fn abort_is_safe_from_any_state() {
        let mut m = meter();
        m.abort().unwrap();
        m.abort().unwrap();
        assert_eq!(m.channel().count(":ABOR"), 2);
    }

    #[test]
    fn status_byte_bits() {
        let stb = StatusByte(0x41);
        assert!(stb.service_requested());
        assert!(stb.measurement_summary());
        assert!(!StatusByte(0x01).service_requested());
    }

    #[test]
    fn register_parsing() {
        assert_eq!(parse_register("512"), Some(512));
        assert_eq!(parse_register("+5.120000E+02"), Some(BUFFER_FULL_EVENT));
        assert_eq!(parse_register("-1"), None);
        assert_eq!(parse_register("full"), None);
    }
}
