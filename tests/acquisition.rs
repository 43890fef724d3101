use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use electrometer_rs::{
    Acquisition, AcquisitionMode, AcquisitionProfile, AcquisitionSettings, BufferDrain,
    CancelToken, ChannelError, ChannelSettings, CommandChannel, DrainCursor, DriverError, Electrometer,
    InstrumentConfig, MeasurementFunction, RecordLayout, Sample, SampleSink, SerialChannel,
    SessionState, SimulatedElectrometer, TriggerConfig,
};

fn quick() -> AcquisitionSettings {
    AcquisitionSettings {
        srq_timeout: Duration::from_secs(2),
        srq_poll_interval: Duration::from_millis(10),
        drain_interval: Duration::from_millis(2),
        settle_delay: Duration::ZERO,
        ..AcquisitionSettings::default()
    }
}

#[test]
fn configure_orders_function_before_range_and_nplc() {
    let mut session = Electrometer::new(SimulatedElectrometer::polling().with_error_checking());
    session.reset().unwrap();
    let config = InstrumentConfig {
        nplc: 1.0,
        ..InstrumentConfig::for_function(MeasurementFunction::Voltage)
    };
    session.configure(&config).unwrap();

    let commands = session.channel().commands();
    let position = |cmd: &str| {
        commands
            .iter()
            .position(|c| c == cmd)
            .unwrap_or_else(|| panic!("{cmd} not sent: {commands:?}"))
    };
    assert_eq!(
        &commands[..4],
        ["*RST", "STAT:PRES;*CLS", "STAT:MEAS:ENAB 512", "*SRE 1"]
    );
    assert!(position("SENS:FUNC \"VOLT\"") < position("VOLT:RANG:AUTO OFF"));
    assert!(position("CONF:VOLT") < position("VOLT:RANG:AUTO OFF"));
    assert!(position("VOLT:RANG:AUTO OFF") < position("VOLT:RANG 2E2"));
    assert!(position("VOLT:RANG 2E2") < position("VOLT:NPLC 1"));
    assert!(position("VOLT:NPLC 1") < position("DISP:ENAB OFF"));
    assert_eq!(session.state(), SessionState::Configured);
}

#[test]
fn arm_requires_configuration() {
    let mut session = Electrometer::new(SimulatedElectrometer::bus());
    session.reset().unwrap();
    assert!(matches!(
        session.arm(&TriggerConfig::finite(10)),
        Err(DriverError::InvalidState { .. })
    ));
    assert!(session.channel().commands().iter().all(|c| c != "INIT"));
}

#[test]
fn finite_run_over_both_link_kinds() {
    for sim in [
        SimulatedElectrometer::bus().with_readings_per_poll(7),
        SimulatedElectrometer::polling().with_readings_per_poll(7),
    ] {
        let mut acq = Acquisition::new(sim, quick());
        let samples = acq.run_finite(20).unwrap();

        assert_eq!(samples.len(), 20);
        assert!(samples.iter().zip(1..).all(|(s, i)| s.index == i));
        assert_eq!(samples[19].value, 20e-6);
        assert_eq!(acq.session().channel().count(":ABOR"), 1);
        assert_eq!(acq.session().state(), SessionState::Idle);
    }
}

#[test]
fn finite_run_through_boxed_channel() {
    let channel: Box<dyn CommandChannel> = Box::new(SimulatedElectrometer::bus());
    let mut acq = Acquisition::new(channel, quick());
    let samples = acq.run_finite(3).unwrap();
    assert_eq!(samples.len(), 3);
    assert_eq!(acq.session().channel().kind(), "sim-bus");
}

/// Counts batches delivered to it.
#[derive(Default)]
struct BatchCounter {
    batches: usize,
    samples: Vec<Sample>,
}

impl SampleSink for BatchCounter {
    fn consume(&mut self, samples: &[Sample]) {
        assert!(!samples.is_empty(), "empty batch delivered");
        self.batches += 1;
        self.samples.extend_from_slice(samples);
    }
}

#[test]
fn continuous_run_delivers_each_reading_once() {
    let cancel = CancelToken::new();
    let sim = SimulatedElectrometer::bus()
        .with_readings_per_poll(3)
        .cancel_on_fill_query(cancel.clone(), 10);
    let mut acq = Acquisition::new(sim, quick());
    let mut sink = BatchCounter::default();

    let delivered = acq
        .run(AcquisitionMode::Continuous, &cancel, &mut sink)
        .unwrap();

    assert_eq!(delivered, 30);
    assert_eq!(sink.batches, 10);
    let indices: Vec<usize> = sink.samples.iter().map(|s| s.index).collect();
    assert_eq!(indices, (1..=30).collect::<Vec<_>>());
    assert_eq!(acq.session().channel().count(":ABOR"), 1);
}

#[test]
fn continuous_run_cancelled_from_another_thread() {
    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        remote.cancel();
    });

    let mut acq = Acquisition::new(SimulatedElectrometer::polling(), quick());
    let mut collected: Vec<Sample> = Vec::new();
    let delivered = acq.run_continuous(&cancel, &mut collected).unwrap();
    stopper.join().unwrap();

    assert_eq!(delivered, collected.len());
    let sim = acq.session().channel();
    assert_eq!(sim.count(":ABOR"), 1);
    assert_eq!(sim.commands().last().map(String::as_str), Some(":ABOR"));
}

/// Passes everything through to the simulator but garbles data replies after the first few.
struct GarbleAfter {
    inner: SimulatedElectrometer,
    good_replies: usize,
}

impl CommandChannel for GarbleAfter {
    fn kind(&self) -> &'static str {
        "garbled"
    }

    fn io_timeout(&self) -> Duration {
        self.inner.io_timeout()
    }

    fn send(&mut self, command: &str) -> Result<(), ChannelError> {
        self.inner.send(command)
    }

    fn query(&mut self, command: &str) -> Result<String, ChannelError> {
        let reply = self.inner.query(command)?;
        if command.starts_with("TRAC:DATA?") {
            if self.good_replies == 0 {
                return Ok(format!("{reply},NAN-ish"));
            }
            self.good_replies -= 1;
        }
        Ok(reply)
    }

    fn read_status_byte(&mut self) -> electrometer_rs::Result<u8> {
        self.inner.read_status_byte()
    }
}

#[test]
fn continuous_error_reports_delivered_count() {
    let channel = GarbleAfter {
        inner: SimulatedElectrometer::polling().with_readings_per_poll(2),
        good_replies: 3,
    };
    let mut acq = Acquisition::new(
        channel,
        AcquisitionSettings {
            max_decode_failures: 1,
            ..quick()
        },
    );
    let mut collected: Vec<Sample> = Vec::new();

    let err = acq
        .run_continuous(&CancelToken::new(), &mut collected)
        .unwrap_err();

    assert_eq!(err.delivered, 6);
    assert_eq!(collected.len(), 6);
    assert!(matches!(err.source, DriverError::BufferDecode(_)));
    assert_eq!(acq.session().channel().inner.count(":ABOR"), 1);
}

#[test]
fn profile_drives_a_simulated_run() {
    let profile = AcquisitionProfile::from_toml_str(
        r#"
        [instrument]
        function = "charge"
        range = 2e-7

        [timing]
        srq_timeout_ms = 2000
        srq_poll_interval_ms = 10
        settle_delay_ms = 0

        [run]
        samples = 12
        "#,
    )
    .unwrap();
    let mode = profile.mode().unwrap();
    let settings = profile.into_settings().unwrap();

    let mut acq = Acquisition::new(SimulatedElectrometer::bus().with_readings_per_poll(4), settings);
    let mut collected: Vec<Sample> = Vec::new();
    let n = acq.run(mode, &CancelToken::new(), &mut collected).unwrap();

    assert_eq!(n, 12);
    assert_eq!(acq.session().channel().count("CONF:CHAR"), 1);
    assert_eq!(acq.session().channel().count("CHAR:RANG 2E-7"), 1);
}

/// Byte stream that answers queries from a script, for driving a real `SerialChannel`.
#[derive(Clone, Default)]
struct LoopbackInstrument {
    written: Arc<Mutex<Vec<u8>>>,
    replies: Arc<Mutex<Vec<u8>>>,
}

impl LoopbackInstrument {
    fn reply(&self, line: &str) {
        self.replies.lock().unwrap().extend_from_slice(line.as_bytes());
    }
}

impl Read for LoopbackInstrument {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(replies.len());
        buf[..n].copy_from_slice(&replies[..n]);
        replies.drain(..n);
        Ok(n)
    }
}

impl Write for LoopbackInstrument {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn serial_drain_cycle_on_the_wire() {
    let wire = LoopbackInstrument::default();
    let settings = ChannelSettings::new("loopback")
        .timeout(Duration::from_millis(50))
        .command_delay(Duration::ZERO);
    let channel = SerialChannel::from_transport(Box::new(wire.clone()), &settings).unwrap();
    let mut session = Electrometer::new(channel);
    let mut drain = BufferDrain::new(RecordLayout::default());
    let mut cursor = DrainCursor::new();

    wire.reply("+2.000000E+00\r\n");
    wire.reply("-1.5E-12,0.000,0,+2.5E-12,0.020,0\r\n");
    let samples = drain.drain_once(&mut session, &mut cursor).unwrap();

    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].value, -1.5e-12);
    assert_eq!(samples[1].timestamp, 0.02);
    assert_eq!(cursor.last_delivered(), 2);
    let written = String::from_utf8(wire.written.lock().unwrap().clone()).unwrap();
    assert_eq!(written, "TRAC:POIN?\rTRAC:DATA? 1,2\r");
}

#[test]
fn status_byte_query_on_serial_link() {
    let wire = LoopbackInstrument::default();
    let settings = ChannelSettings::new("loopback")
        .timeout(Duration::from_millis(50))
        .command_delay(Duration::ZERO);
    let channel = SerialChannel::from_transport(Box::new(wire.clone()), &settings).unwrap();
    let mut session = Electrometer::new(channel);

    wire.reply("65\r\n");
    assert!(session.read_status_byte().unwrap().service_requested());

    wire.reply("ready\r\n");
    assert!(matches!(
        session.read_status_byte(),
        Err(DriverError::MalformedResponse { .. })
    ));
}

/// Serial instrument that answers a fixed set of queries, except that its
/// first `*STB?` answer only goes out once the host writes its next line.
#[derive(Clone, Default)]
struct SlowFirstStatus {
    state: Arc<Mutex<SlowState>>,
}

#[derive(Default)]
struct SlowState {
    written: Vec<u8>,
    line: Vec<u8>,
    outgoing: Vec<u8>,
    held: Option<&'static str>,
    status_answered: bool,
}

impl SlowState {
    fn answer(command: &str) -> Option<&'static str> {
        match command {
            "*STB?" => Some("65\r\n"),
            "*OPC?" => Some("1\r\n"),
            "STAT:MEAS?" => Some("512\r\n"),
            "TRAC:POIN?" => Some("3\r\n"),
            "TRAC:DATA? 1,3" => Some("1E-6,0,0,2E-6,0.5,0,3E-6,1,0\r\n"),
            _ => None,
        }
    }

    fn command_done(&mut self) {
        let command = String::from_utf8_lossy(&self.line).to_string();
        self.line.clear();
        if let Some(late) = self.held.take() {
            self.outgoing.extend_from_slice(late.as_bytes());
        }
        let Some(reply) = Self::answer(&command) else {
            return;
        };
        if command == "*STB?" && !self.status_answered {
            self.status_answered = true;
            self.held = Some(reply);
        } else {
            self.outgoing.extend_from_slice(reply.as_bytes());
        }
    }
}

impl Read for SlowFirstStatus {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.outgoing.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.outgoing.len());
        buf[..n].copy_from_slice(&state.outgoing[..n]);
        state.outgoing.drain(..n);
        Ok(n)
    }
}

impl Write for SlowFirstStatus {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.written.extend_from_slice(buf);
        for &b in buf {
            if b == b'\r' {
                state.command_done();
            } else {
                state.line.push(b);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn late_status_reply_does_not_shift_later_answers() {
    let wire = SlowFirstStatus::default();
    let settings = ChannelSettings::new("loopback")
        .timeout(Duration::from_millis(50))
        .command_delay(Duration::ZERO);
    let channel = SerialChannel::from_transport(Box::new(wire.clone()), &settings).unwrap();
    let mut acq = Acquisition::new(
        channel,
        AcquisitionSettings {
            srq_timeout: Duration::from_secs(1),
            ..quick()
        },
    );

    let samples = acq.run_finite(3).unwrap();

    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    assert_eq!(values, [1e-6, 2e-6, 3e-6]);
    let written = String::from_utf8(wire.state.lock().unwrap().written.clone()).unwrap();
    assert_eq!(written.matches("*OPC?\r").count(), 1);
    assert!(written.contains("TRAC:DATA? 1,3\r"));
    assert!(written.ends_with(":ABOR\r"));
}
