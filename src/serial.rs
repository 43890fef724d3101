//! Direct RS-232 link to the instrument.
//!
//! The serial port carries no service-request line, so readiness is only
//! observable by asking for the status byte with `*STB?`.

use std::time::Duration;

use log::{debug, info};
use serialport::{ClearBuffer, DataBits, StopBits};

use crate::channel::{
    query_error_queue, ChannelSettings, CommandChannel, LineIo, Transport, READ_SLICE,
    SYNC_QUERY, SYNC_REPLY,
};
use crate::errors::ChannelError;

/// The instrument's RS-232 interface expects carriage-return terminated commands.
const SERIAL_TERMINATOR: &str = "\r";

/// Polling-only channel over a serial port.
pub struct SerialChannel {
    io: LineIo,
    check_errors: bool,
}

impl SerialChannel {
    /// Open the serial port described by `settings` (8 data bits, 1 stop bit).
    pub fn open(settings: &ChannelSettings) -> Result<Self, ChannelError> {
        let port = serialport::new(&settings.path, settings.baud_rate)
            .parity(settings.parity)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .timeout(READ_SLICE)
            .open()?;
        port.clear(ClearBuffer::All)?;
        info!(
            "serial link opened: path={}, baud={}, parity={:?}",
            settings.path, settings.baud_rate, settings.parity
        );
        Self::from_transport(Box::new(port), settings)
    }

    /// Wrap an already-open byte stream.
    pub fn from_transport(
        transport: Box<dyn Transport>,
        settings: &ChannelSettings,
    ) -> Result<Self, ChannelError> {
        let mut io = LineIo::new(
            transport,
            SERIAL_TERMINATOR,
            settings.timeout,
            settings.command_delay,
        );
        io.flush_input()?;
        Ok(Self {
            io,
            check_errors: settings.check_errors,
        })
    }

    /// Consume whatever answers a timed-out query left behind.
    fn resync(&mut self) -> Result<(), ChannelError> {
        if !self.io.is_stale() {
            return Ok(());
        }
        debug!("resynchronising after a timed-out reply");
        self.io.flush_input()?;
        self.io.write_line(SYNC_QUERY)?;
        self.io.skip_to(SYNC_REPLY)
    }
}

impl CommandChannel for SerialChannel {
    fn kind(&self) -> &'static str {
        "serial"
    }

    fn io_timeout(&self) -> Duration {
        self.io.timeout()
    }

    fn send(&mut self, command: &str) -> Result<(), ChannelError> {
        self.resync()?;
        debug!("send: {}", command);
        self.io.write_line(command)
    }

    fn query(&mut self, command: &str) -> Result<String, ChannelError> {
        self.resync()?;
        debug!("query: {}", command);
        self.io.write_line(command)?;
        self.io.read_line()
    }

    fn check_error(&mut self) -> Result<Option<String>, ChannelError> {
        if self.check_errors {
            query_error_queue(self)
        } else {
            Ok(None)
        }
    }
}
