//! Acquisition driver for SCPI electrometers.
//!
//! Drives a Keithley-style electrometer through reset, configuration, trigger
//! arming, a service-request wait and incremental retrieval of its reading
//! buffer, over either a GPIB bus controller or a plain RS-232 line.
//!
//! # Transports
//!
//! Both links implement [`CommandChannel`]. The GPIB channel reads the status
//! byte with a serial poll and can assert a bus trigger; the serial channel
//! has to ask for the status byte with `*STB?` and cannot trigger.
//!
//! # Acquisition
//!
//! [`Acquisition`] runs either a finite block (wait for the buffer-full
//! service request, then drain once) or a continuous stream (drain the newly
//! stored range periodically until cancelled). Every run ends with `:ABOR`.
//!
//! ```no_run
//! use electrometer_rs::{Acquisition, AcquisitionSettings, ChannelSettings, SerialChannel};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = SerialChannel::open(&ChannelSettings::new("/dev/ttyUSB0"))?;
//! let mut acquisition = Acquisition::new(channel, AcquisitionSettings::default());
//! for sample in acquisition.run_finite(100)? {
//!     println!("{} {:E}", sample.timestamp, sample.value);
//! }
//! # Ok(())
//! # }
//! ```

mod acquisition;
mod channel;
mod config;
mod drain;
mod errors;
mod gpib;
mod instrument;
pub mod logging;
mod readiness;
mod serial;
pub mod sim;

pub use acquisition::{
    Acquisition, AcquisitionMode, AcquisitionSettings, CancelToken, LogSink, SampleSink,
};
pub use channel::{
    parse_status_byte, query_status_byte, ChannelSettings, CommandChannel, Transport,
    DEFAULT_BAUD_RATE, DEFAULT_COMMAND_DELAY, DEFAULT_GPIB_ADDRESS, DEFAULT_TIMEOUT,
};
pub use config::{AcquisitionProfile, FormatSection, RunSection, TimingSection, TriggerSection};
pub use drain::{
    parse_fields, parse_fill_level, BufferDrain, DrainCursor, RecordElement, RecordLayout, Sample,
};
pub use errors::*;
pub use gpib::GpibChannel;
pub use instrument::{
    ArmSource, Electrometer, InstrumentConfig, MeasurementFunction, SessionState, StatusByte,
    TriggerConfig, TriggerCount, BUFFER_FULL_EVENT, MAX_BUFFER_POINTS, MAX_NPLC, MIN_NPLC,
};
pub use readiness::{ReadinessMonitor, DEFAULT_POLL_INTERVAL, MAX_POLL_INTERVAL, MIN_POLL_INTERVAL};
pub use serial::SerialChannel;
pub use sim::SimulatedElectrometer;
