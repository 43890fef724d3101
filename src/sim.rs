//! In-memory electrometer for dry runs and tests.
//!
//! Models just enough of the instrument to exercise the acquisition
//! protocol: the reset/status-system setup, function-scoped commands, the
//! trigger model, a reading buffer that fills while the host polls, and the
//! buffer-full service request. Every command is recorded in order.

use std::collections::VecDeque;
use std::time::Duration;

use log::trace;

use crate::acquisition::CancelToken;
use crate::channel::CommandChannel;
use crate::errors::{ChannelError, Result};
use crate::instrument::{StatusByte, BUFFER_FULL_EVENT};

const SIM_TIMEOUT: Duration = Duration::from_millis(50);
const RESET_BUFFER_POINTS: usize = 100;
const NO_ERROR: &str = "0,\"No error\"";
const UNDEFINED_HEADER: &str = "-113,\"Undefined header\"";
const SETTINGS_CONFLICT: &str = "-221,\"Settings conflict\"";

/// Reply used by [`SimulatedElectrometer::with_malformed_replies`].
pub const MALFORMED_DATA_REPLY: &str = "1.2e-6,0.1,0,BADTOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Bus,
    Polling,
}

/// Simulated instrument implementing [`CommandChannel`].
pub struct SimulatedElectrometer {
    link: Link,
    check_errors: bool,
    commands: Vec<String>,
    errors: VecDeque<String>,

    function_selected: bool,
    srq_enabled: bool,
    buffer_full_enabled: bool,
    arm_on_bus: bool,
    trigger_count: Option<usize>,
    capacity: usize,
    running: bool,
    awaiting_trigger: bool,
    stored: usize,
    measurement_events: u32,

    readings_per_poll: usize,
    sample_period: f64,
    srq_suppressed: bool,
    status_failures: usize,
    malformed_replies: usize,
    data_reply: Option<String>,
    cancel_on_fill_query: Option<(CancelToken, usize)>,

    fill_queries: usize,
    data_queries: usize,
    status_reads: usize,
}

impl SimulatedElectrometer {
    fn with_link(link: Link) -> Self {
        Self {
            link,
            check_errors: false,
            commands: Vec::new(),
            errors: VecDeque::new(),
            function_selected: false,
            srq_enabled: false,
            buffer_full_enabled: false,
            arm_on_bus: false,
            trigger_count: Some(1),
            capacity: RESET_BUFFER_POINTS,
            running: false,
            awaiting_trigger: false,
            stored: 0,
            measurement_events: 0,
            readings_per_poll: 1,
            sample_period: 0.5,
            srq_suppressed: false,
            status_failures: 0,
            malformed_replies: 0,
            data_reply: None,
            cancel_on_fill_query: None,
            fill_queries: 0,
            data_queries: 0,
            status_reads: 0,
        }
    }

    /// Instrument behind a bus controller: serial poll and hardware trigger.
    pub fn bus() -> Self {
        Self::with_link(Link::Bus)
    }

    /// Instrument on a serial line: status byte only through `*STB?`.
    pub fn polling() -> Self {
        Self::with_link(Link::Polling)
    }

    // ------------------------------------------------------------------------
    // Knobs
    // ------------------------------------------------------------------------

    /// Answer `SYST:ERR?` after configuration.
    pub fn with_error_checking(mut self) -> Self {
        self.check_errors = true;
        self
    }

    /// Readings stored per status read or fill-level query while running.
    pub fn with_readings_per_poll(mut self, n: usize) -> Self {
        self.readings_per_poll = n;
        self
    }

    /// Spacing of generated timestamps, in seconds.
    pub fn with_sample_period(mut self, seconds: f64) -> Self {
        self.sample_period = seconds;
        self
    }

    /// Never raise the service request bit.
    pub fn without_service_request(mut self) -> Self {
        self.srq_suppressed = true;
        self
    }

    /// Fail the next `n` status byte reads with a transport timeout.
    pub fn failing_status_reads(mut self, n: usize) -> Self {
        self.status_failures = n;
        self
    }

    /// Answer the next `n` ranged data queries with [`MALFORMED_DATA_REPLY`].
    pub fn with_malformed_replies(mut self, n: usize) -> Self {
        self.malformed_replies = n;
        self
    }

    /// Answer every data query with a fixed reply.
    pub fn with_data_reply(mut self, reply: impl Into<String>) -> Self {
        self.data_reply = Some(reply.into());
        self
    }

    /// Cancel `token` while answering the `nth` fill-level query.
    pub fn cancel_on_fill_query(mut self, token: CancelToken, nth: usize) -> Self {
        self.cancel_on_fill_query = Some((token, nth));
        self
    }

    pub fn push_error(&mut self, entry: impl Into<String>) {
        self.errors.push_back(entry.into());
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn commands(&self) -> Vec<String> {
        self.commands.clone()
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// How many times `command` was sent or queried.
    pub fn count(&self, command: &str) -> usize {
        self.commands.iter().filter(|c| *c == command).count()
    }

    pub fn fill_queries(&self) -> usize {
        self.fill_queries
    }

    pub fn data_queries(&self) -> usize {
        self.data_queries
    }

    pub fn status_reads(&self) -> usize {
        self.status_reads
    }

    pub fn stored_readings(&self) -> usize {
        self.stored
    }

    pub fn is_running(&self) -> bool {
        self.running || self.awaiting_trigger
    }

    // ------------------------------------------------------------------------
    // Instrument model
    // ------------------------------------------------------------------------

    fn power_on_state(&mut self) {
        self.function_selected = false;
        self.srq_enabled = false;
        self.buffer_full_enabled = false;
        self.arm_on_bus = false;
        self.trigger_count = Some(1);
        self.capacity = RESET_BUFFER_POINTS;
        self.running = false;
        self.awaiting_trigger = false;
        self.stored = 0;
        self.measurement_events = 0;
    }

    fn tick(&mut self) {
        if !self.running {
            return;
        }
        let limit = self
            .trigger_count
            .map_or(self.capacity, |n| n.min(self.capacity));
        self.stored = (self.stored + self.readings_per_poll).min(limit);
        if self.stored >= self.capacity {
            self.measurement_events |= BUFFER_FULL_EVENT;
        }
        if self.stored >= limit {
            self.running = false;
        }
    }

    fn status_byte(&self) -> StatusByte {
        let mut bits = 0u8;
        if self.buffer_full_enabled && self.measurement_events & BUFFER_FULL_EVENT != 0 {
            bits |= StatusByte::MEASUREMENT_SUMMARY;
        }
        if self.srq_enabled && bits & StatusByte::MEASUREMENT_SUMMARY != 0 && !self.srq_suppressed
        {
            bits |= StatusByte::SERVICE_REQUEST;
        }
        StatusByte(bits)
    }

    fn poll_status(&mut self) -> std::result::Result<u8, ChannelError> {
        self.status_reads += 1;
        if self.status_failures > 0 {
            self.status_failures -= 1;
            return Err(ChannelError::Timeout(SIM_TIMEOUT));
        }
        self.tick();
        Ok(self.status_byte().bits())
    }

    fn render(&self, start: usize, end: usize) -> String {
        let end = end.min(self.stored);
        (start.max(1)..=end)
            .map(|i| {
                let value = i as f64 / 1e6;
                let timestamp = (i - 1) as f64 * self.sample_period;
                format!("{value:E},{timestamp},0")
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    fn apply(&mut self, command: &str) {
        let (header, argument) = match command.split_once(' ') {
            Some((h, a)) => (h, a.trim()),
            None => (command, ""),
        };

        match header {
            "*RST" => self.power_on_state(),
            "STAT:PRES;*CLS" => {
                self.buffer_full_enabled = false;
                self.measurement_events = 0;
            }
            "*CLS" => self.measurement_events = 0,
            "STAT:MEAS:ENAB" => {
                self.buffer_full_enabled =
                    argument.parse::<u32>().map_or(false, |m| m & BUFFER_FULL_EVENT != 0)
            }
            "*SRE" => self.srq_enabled = argument.parse::<u8>().map_or(false, |m| m & 1 != 0),
            "SENS:FUNC" => self.function_selected = true,
            h if h.starts_with("CONF:") => self.function_selected = true,
            "SYST:ZCH" | "SYST:ZCOR" | "SYST:AZER" | "MED" | "AVER" | "DISP:DIG" | "DISP:ENAB" => {}
            h if h.ends_with(":RANG:AUTO") || h.ends_with(":RANG") || h.ends_with(":NPLC") => {
                if !self.function_selected {
                    self.errors.push_back(SETTINGS_CONFLICT.to_string());
                }
            }
            ":ARM:SOUR" => self.arm_on_bus = argument == "BUS",
            ":ARM:COUN" => {}
            ":TRIG:COUN" => self.trigger_count = argument.parse::<usize>().ok(),
            "TRAC:CLE" => self.stored = 0,
            "TRAC:FEED" | "TRAC:FEED:CONT" => {}
            "TRAC:POIN" => {
                if let Ok(n) = argument.parse::<usize>() {
                    self.capacity = n;
                }
            }
            "INIT" => {
                self.stored = 0;
                if self.arm_on_bus {
                    self.awaiting_trigger = true;
                } else {
                    self.running = true;
                }
            }
            ":ABOR" => {
                self.running = false;
                self.awaiting_trigger = false;
            }
            _ => self.errors.push_back(UNDEFINED_HEADER.to_string()),
        }
    }
}

impl CommandChannel for SimulatedElectrometer {
    fn kind(&self) -> &'static str {
        match self.link {
            Link::Bus => "sim-bus",
            Link::Polling => "sim-serial",
        }
    }

    fn io_timeout(&self) -> Duration {
        SIM_TIMEOUT
    }

    fn send(&mut self, command: &str) -> std::result::Result<(), ChannelError> {
        trace!("sim send: {}", command);
        self.commands.push(command.to_string());
        self.apply(command);
        Ok(())
    }

    fn query(&mut self, command: &str) -> std::result::Result<String, ChannelError> {
        trace!("sim query: {}", command);
        self.commands.push(command.to_string());

        match command.split_once(' ') {
            None => match command {
                "*STB?" => self.poll_status().map(|b| b.to_string()),
                "TRAC:POIN?" => {
                    self.fill_queries += 1;
                    if let Some((token, nth)) = &self.cancel_on_fill_query {
                        if self.fill_queries >= *nth {
                            token.cancel();
                        }
                    }
                    self.tick();
                    Ok(self.stored.to_string())
                }
                "TRAC:DATA?" => {
                    self.data_queries += 1;
                    Ok(self
                        .data_reply
                        .clone()
                        .unwrap_or_else(|| self.render(1, self.stored)))
                }
                "STAT:MEAS?" => {
                    let events = self.measurement_events;
                    self.measurement_events = 0;
                    Ok(events.to_string())
                }
                "SYST:ERR?" => Ok(self.errors.pop_front().unwrap_or_else(|| NO_ERROR.into())),
                _ => {
                    self.errors.push_back(UNDEFINED_HEADER.to_string());
                    Err(ChannelError::Timeout(SIM_TIMEOUT))
                }
            },
            Some(("TRAC:DATA?", range)) => {
                self.data_queries += 1;
                if self.malformed_replies > 0 {
                    self.malformed_replies -= 1;
                    return Ok(MALFORMED_DATA_REPLY.to_string());
                }
                if let Some(reply) = &self.data_reply {
                    return Ok(reply.clone());
                }
                let bounds = range
                    .split_once(',')
                    .and_then(|(a, b)| Some((a.trim().parse().ok()?, b.trim().parse().ok()?)));
                match bounds {
                    Some((start, end)) => Ok(self.render(start, end)),
                    None => {
                        self.errors.push_back(UNDEFINED_HEADER.to_string());
                        Err(ChannelError::Timeout(SIM_TIMEOUT))
                    }
                }
            }
            Some(_) => {
                self.errors.push_back(UNDEFINED_HEADER.to_string());
                Err(ChannelError::Timeout(SIM_TIMEOUT))
            }
        }
    }

    fn read_status_byte(&mut self) -> Result<u8> {
        match self.link {
            Link::Bus => Ok(self.poll_status()?),
            Link::Polling => crate::channel::query_status_byte(self),
        }
    }

    fn assert_hardware_trigger(&mut self) -> std::result::Result<(), ChannelError> {
        if self.link == Link::Polling {
            return Err(ChannelError::Unsupported("hardware trigger"));
        }
        if self.awaiting_trigger {
            self.awaiting_trigger = false;
            self.running = true;
        }
        Ok(())
    }

    fn check_error(&mut self) -> std::result::Result<Option<String>, ChannelError> {
        if self.check_errors {
            Ok(self.errors.pop_front())
        } else {
            Ok(None)
        }
    }
}
