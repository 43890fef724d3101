//! GPIB bus access through a USB-serial bus controller.
//!
//! The controller speaks a line protocol on its virtual serial port: lines
//! starting with `++` configure or drive the controller itself, anything
//! else is forwarded to the addressed instrument. This gives the session
//! the two things the RS-232 link lacks: an out-of-band serial poll for the
//! status byte, and a Group Execute Trigger.

use std::time::Duration;

use log::{debug, info};

use crate::channel::{
    parse_status_byte, query_error_queue, ChannelSettings, CommandChannel, LineIo, Transport,
    READ_SLICE, SYNC_QUERY, SYNC_REPLY,
};
use crate::errors::{ChannelError, DriverError, Result};

const CONTROLLER_TERMINATOR: &str = "\n";
const ESC: u8 = 0x1B;

/// Longest read timeout the controller accepts.
const MAX_CONTROLLER_READ_TIMEOUT_MS: u128 = 3000;

const SERIAL_POLL: &str = "++spoll";
const TRIGGER: &str = "++trg";
const READ_UNTIL_EOI: &str = "++read eoi";

/// Bus channel: serial-polled status byte and hardware trigger.
pub struct GpibChannel {
    io: LineIo,
    address: u8,
    check_errors: bool,
}

impl GpibChannel {
    /// Open the controller's serial port and put it in controller mode.
    pub fn open(settings: &ChannelSettings) -> std::result::Result<Self, ChannelError> {
        let port = serialport::new(&settings.path, settings.baud_rate)
            .timeout(READ_SLICE)
            .open()?;
        port.clear(serialport::ClearBuffer::All)?;
        info!(
            "GPIB controller opened: path={}, address={}",
            settings.path, settings.gpib_address
        );
        Self::from_transport(Box::new(port), settings)
    }

    /// Wrap an already-open controller stream and configure it.
    pub fn from_transport(
        transport: Box<dyn Transport>,
        settings: &ChannelSettings,
    ) -> std::result::Result<Self, ChannelError> {
        if settings.gpib_address > 30 {
            return Err(ChannelError::Unsupported("GPIB primary address above 30"));
        }
        let io = LineIo::new(
            transport,
            CONTROLLER_TERMINATOR,
            settings.timeout,
            settings.command_delay,
        );
        let mut channel = Self {
            io,
            address: settings.gpib_address,
            check_errors: settings.check_errors,
        };
        channel.io.flush_input()?;
        channel.setup_controller()?;
        Ok(channel)
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn setup_controller(&mut self) -> std::result::Result<(), ChannelError> {
        let read_timeout_ms = self
            .io
            .timeout()
            .as_millis()
            .clamp(1, MAX_CONTROLLER_READ_TIMEOUT_MS);
        // Controller-in-charge, explicit reads only, EOI on last byte, LF appended.
        for line in [
            "++mode 1".to_string(),
            format!("++addr {}", self.address),
            "++auto 0".to_string(),
            "++eoi 1".to_string(),
            "++eos 2".to_string(),
            format!("++read_tmo_ms {read_timeout_ms}"),
        ] {
            self.controller(&line)?;
        }
        Ok(())
    }

    fn controller(&mut self, line: &str) -> std::result::Result<(), ChannelError> {
        debug!("controller: {}", line);
        self.io.write_line(line)
    }

    /// Consume whatever answers a timed-out query or serial poll left behind.
    fn resync(&mut self) -> std::result::Result<(), ChannelError> {
        if !self.io.is_stale() {
            return Ok(());
        }
        debug!("resynchronising after a timed-out reply");
        self.io.flush_input()?;
        self.io.write_raw(&escape_payload(SYNC_QUERY))?;
        self.controller(READ_UNTIL_EOI)?;
        self.io.skip_to(SYNC_REPLY)
    }
}

/// Escape bytes the controller would otherwise interpret itself.
fn escape_payload(command: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(command.len() + 4);
    for &b in command.as_bytes() {
        if matches!(b, b'+' | b'\r' | b'\n' | ESC) {
            out.push(ESC);
        }
        out.push(b);
    }
    out
}

impl CommandChannel for GpibChannel {
    fn kind(&self) -> &'static str {
        "gpib"
    }

    fn io_timeout(&self) -> Duration {
        self.io.timeout()
    }

    fn send(&mut self, command: &str) -> std::result::Result<(), ChannelError> {
        self.resync()?;
        debug!("send: {}", command);
        self.io.write_raw(&escape_payload(command))
    }

    fn query(&mut self, command: &str) -> std::result::Result<String, ChannelError> {
        self.send(command)?;
        self.controller(READ_UNTIL_EOI)?;
        self.io.read_line()
    }

    fn read_status_byte(&mut self) -> Result<u8> {
        self.resync()?;
        self.controller(SERIAL_POLL)?;
        let response = self.io.read_line()?;
        parse_status_byte(&response).ok_or_else(|| DriverError::malformed(SERIAL_POLL, &response))
    }

    fn assert_hardware_trigger(&mut self) -> std::result::Result<(), ChannelError> {
        self.resync()?;
        self.controller(TRIGGER)
    }

    fn check_error(&mut self) -> std::result::Result<Option<String>, ChannelError> {
        if self.check_errors {
            query_error_queue(self)
        } else {
            Ok(None)
        }
    }
}
