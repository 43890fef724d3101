//! Command channel abstraction shared by every transport.
//!
//! SCPI exchanges are strictly request/response: a query must be answered
//! before the next one is issued, so a channel is owned by exactly one
//! session and every method takes `&mut self`.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use serialport::Parity;

use crate::errors::{ChannelError, DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default baud rate of the instrument's RS-232 port (and of USB GPIB controllers).
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default per-exchange timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default pause after each write so the instrument can parse the command.
pub const DEFAULT_COMMAND_DELAY: Duration = Duration::from_millis(50);

/// Default primary address of the electrometer on the bus.
pub const DEFAULT_GPIB_ADDRESS: u8 = 14;

/// Read granularity on the underlying port; the exchange timeout is enforced on top.
pub(crate) const READ_SLICE: Duration = Duration::from_millis(100);

const STATUS_BYTE_QUERY: &str = "*STB?";
const ERROR_QUERY: &str = "SYST:ERR?";

/// Marker query used to find the end of late replies; the instrument answers `1`.
pub(crate) const SYNC_QUERY: &str = "*OPC?";
pub(crate) const SYNC_REPLY: &str = "1";

/// Late lines dropped while resynchronising before giving up on the link.
const MAX_STALE_LINES: usize = 32;

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Trait for Read + Write + Send, allowing different byte-stream backends.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Capability set every instrument link exposes to the session.
pub trait CommandChannel: Send {
    /// Short transport name for logs.
    fn kind(&self) -> &'static str;

    /// Upper bound on a single send/query exchange.
    fn io_timeout(&self) -> Duration;

    /// Write a command that produces no response.
    fn send(&mut self, command: &str) -> std::result::Result<(), ChannelError>;

    /// Write a query and read its single-line response.
    fn query(&mut self, command: &str) -> std::result::Result<String, ChannelError>;

    /// Read the IEEE-488.2 status byte.
    ///
    /// The default asks the instrument with `*STB?`; bus transports override
    /// this with an out-of-band serial poll.
    fn read_status_byte(&mut self) -> Result<u8> {
        query_status_byte(self)
    }

    /// Assert a Group Execute Trigger on the bus.
    fn assert_hardware_trigger(&mut self) -> std::result::Result<(), ChannelError> {
        Err(ChannelError::Unsupported("hardware trigger"))
    }

    /// Pop the oldest entry of the instrument's error queue, if this
    /// transport checks it. `None` means no error is pending.
    fn check_error(&mut self) -> std::result::Result<Option<String>, ChannelError> {
        Ok(None)
    }
}

impl<C: CommandChannel + ?Sized> CommandChannel for Box<C> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    fn io_timeout(&self) -> Duration {
        (**self).io_timeout()
    }

    fn send(&mut self, command: &str) -> std::result::Result<(), ChannelError> {
        (**self).send(command)
    }

    fn query(&mut self, command: &str) -> std::result::Result<String, ChannelError> {
        (**self).query(command)
    }

    fn read_status_byte(&mut self) -> Result<u8> {
        (**self).read_status_byte()
    }

    fn assert_hardware_trigger(&mut self) -> std::result::Result<(), ChannelError> {
        (**self).assert_hardware_trigger()
    }

    fn check_error(&mut self) -> std::result::Result<Option<String>, ChannelError> {
        (**self).check_error()
    }
}

/// Status byte via an explicit `*STB?` query.
pub fn query_status_byte<C: CommandChannel + ?Sized>(channel: &mut C) -> Result<u8> {
    let response = channel.query(STATUS_BYTE_QUERY)?;
    parse_status_byte(&response).ok_or_else(|| DriverError::malformed(STATUS_BYTE_QUERY, &response))
}

/// Parse a status byte reply, accepting plain integers and SCPI float forms.
pub fn parse_status_byte(response: &str) -> Option<u8> {
    let trimmed = response.trim();
    if let Ok(value) = trimmed.parse::<u8>() {
        return Some(value);
    }
    let value = trimmed.parse::<f64>().ok()?;
    if value.fract() == 0.0 && (0.0..=255.0).contains(&value) {
        Some(value as u8)
    } else {
        None
    }
}

/// Pop one entry of the SCPI error queue (`SYST:ERR?`).
pub(crate) fn query_error_queue<C: CommandChannel + ?Sized>(
    channel: &mut C,
) -> std::result::Result<Option<String>, ChannelError> {
    let response = channel.query(ERROR_QUERY)?;
    Ok(parse_error_entry(&response))
}

/// `0,"No error"` means the queue is empty; anything else is reported verbatim.
pub(crate) fn parse_error_entry(response: &str) -> Option<String> {
    let trimmed = response.trim();
    let code = trimmed.split(',').next().unwrap_or_default().trim();
    match code.parse::<i32>() {
        Ok(0) => None,
        _ => Some(trimmed.to_string()),
    }
}

// ============================================================================
// Channel Settings
// ============================================================================

/// Connection parameters shared by the serial and GPIB controller channels.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub path: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub timeout: Duration,
    pub command_delay: Duration,
    /// Primary address on the bus (GPIB controller only).
    pub gpib_address: u8,
    /// Query `SYST:ERR?` after configuration so rejected commands surface.
    pub check_errors: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::Even,
            timeout: DEFAULT_TIMEOUT,
            command_delay: DEFAULT_COMMAND_DELAY,
            gpib_address: DEFAULT_GPIB_ADDRESS,
            check_errors: false,
        }
    }
}

impl ChannelSettings {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    pub fn gpib_address(mut self, address: u8) -> Self {
        self.gpib_address = address;
        self
    }

    pub fn check_errors(mut self, enabled: bool) -> Self {
        self.check_errors = enabled;
        self
    }
}

// ============================================================================
// Line-oriented IO
// ============================================================================

/// Writes terminated lines and reads `\n`-terminated replies with an idle timeout.
///
/// Bytes received past the first line stay buffered for the next read.
/// After a read times out the link is stale: the reply may still arrive and
/// would be taken as the answer to the next query, so the owning channel
/// must resynchronise before its next exchange.
pub(crate) struct LineIo {
    transport: Box<dyn Transport>,
    terminator: &'static str,
    timeout: Duration,
    command_delay: Duration,
    pending: Vec<u8>,
    stale: bool,
}

impl LineIo {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        terminator: &'static str,
        timeout: Duration,
        command_delay: Duration,
    ) -> Self {
        Self {
            transport,
            terminator,
            timeout,
            command_delay,
            pending: Vec::with_capacity(256),
            stale: false,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn write_line(&mut self, line: &str) -> std::result::Result<(), ChannelError> {
        self.write_raw(line.as_bytes())
    }

    pub(crate) fn write_raw(&mut self, payload: &[u8]) -> std::result::Result<(), ChannelError> {
        trace!("-> {:?}", String::from_utf8_lossy(payload));
        self.transport.write_all(payload)?;
        self.transport.write_all(self.terminator.as_bytes())?;
        self.transport.flush()?;
        if !self.command_delay.is_zero() {
            std::thread::sleep(self.command_delay);
        }
        Ok(())
    }

    /// Read one line, without its terminator.
    ///
    /// The deadline is pushed back whenever bytes arrive, so long buffer
    /// dumps over slow links only fail when the instrument goes quiet.
    pub(crate) fn read_line(&mut self) -> std::result::Result<String, ChannelError> {
        let mut deadline = Instant::now() + self.timeout;
        let mut scanned = 0usize;

        loop {
            if let Some(pos) = self.pending[scanned..].iter().position(|&b| b == b'\n') {
                let end = scanned + pos;
                let line: Vec<u8> = self.pending.drain(..=end).collect();
                let text = String::from_utf8_lossy(&line).trim().to_string();
                trace!("<- {:?}", text);
                return Ok(text);
            }
            scanned = self.pending.len();

            let mut chunk = [0u8; 256];
            match self.transport.read(&mut chunk) {
                Ok(0) => {
                    return Err(ChannelError::Disconnected(
                        "transport closed while waiting for a reply".into(),
                    ))
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    deadline = Instant::now() + self.timeout;
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                self.stale = true;
                return Err(ChannelError::Timeout(self.timeout));
            }
        }
    }

    /// A reply was given up on and may still be in flight.
    pub(crate) fn is_stale(&self) -> bool {
        self.stale
    }

    /// Drop lines until `marker` is read, after a marker query was written.
    ///
    /// Replies arrive in request order, so everything before the marker's
    /// answer belongs to earlier, abandoned queries. Clears the stale flag.
    pub(crate) fn skip_to(&mut self, marker: &str) -> std::result::Result<(), ChannelError> {
        for dropped in 0..MAX_STALE_LINES {
            let line = self.read_line()?;
            if line == marker {
                if dropped > 0 {
                    warn!("dropped {} late replies", dropped);
                }
                self.stale = false;
                return Ok(());
            }
            debug!("dropping late reply {:?}", line);
        }
        Err(ChannelError::Disconnected(format!(
            "no sync reply within {MAX_STALE_LINES} lines"
        )))
    }

    /// Discard anything already waiting on the link.
    pub(crate) fn flush_input(&mut self) -> std::result::Result<(), ChannelError> {
        self.pending.clear();
        let mut buf = [0u8; 256];
        let start = Instant::now();
        let max_flush = Duration::from_millis(200);
        let mut discarded = 0usize;
        loop {
            match self.transport.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
            if start.elapsed() > max_flush {
                break;
            }
        }
        if discarded > 0 {
            debug!("discarded {} stale bytes", discarded);
        }
        Ok(())
    }
}
