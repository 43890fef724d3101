//! Incremental retrieval of readings from the instrument buffer.
//!
//! Each cycle asks how many readings are stored (`TRAC:POIN?`) and fetches
//! only the range past the cursor (`TRAC:DATA? <from>,<to>`). The cursor
//! only moves after a reply has been fully decoded, so a garbled transfer
//! is simply requested again on the next cycle.
//!
//! The buffer is assumed to grow monotonically and never to be overwritten
//! before it is drained. A fill level that goes backwards is reported but
//! cannot be recovered from here.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::channel::CommandChannel;
use crate::errors::{DriverError, Result};
use crate::instrument::Electrometer;

/// One field of a buffer record, in transfer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordElement {
    Reading,
    Timestamp,
    Status,
    /// Present in the transfer but not kept.
    Other,
}

/// Shape of one buffered record; its width is validated against every reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    elements: Vec<RecordElement>,
}

impl Default for RecordLayout {
    /// Reading, timestamp and status, the buffer's default element set.
    fn default() -> Self {
        Self {
            elements: vec![
                RecordElement::Reading,
                RecordElement::Timestamp,
                RecordElement::Status,
            ],
        }
    }
}

impl RecordLayout {
    /// Exactly one reading element is required; timestamp and status at most once.
    pub fn new(elements: Vec<RecordElement>) -> Result<Self> {
        let count = |e: RecordElement| elements.iter().filter(|&&x| x == e).count();
        if count(RecordElement::Reading) != 1 {
            return Err(DriverError::InvalidSettings(
                "record layout needs exactly one reading element".into(),
            ));
        }
        if count(RecordElement::Timestamp) > 1 || count(RecordElement::Status) > 1 {
            return Err(DriverError::InvalidSettings(
                "record layout repeats timestamp or status".into(),
            ));
        }
        Ok(Self { elements })
    }

    pub fn width(&self) -> usize {
        self.elements.len()
    }

    pub fn elements(&self) -> &[RecordElement] {
        &self.elements
    }

    /// Decode `fields` (a whole number of records) into samples numbered from `first_index`.
    pub fn decode(&self, fields: &[f64], first_index: usize) -> Result<Vec<Sample>> {
        let width = self.width();
        if fields.len() % width != 0 {
            return Err(DriverError::BufferDecode(format!(
                "{} fields is not a whole number of {width}-field records",
                fields.len()
            )));
        }

        let mut samples = Vec::with_capacity(fields.len() / width);
        for (offset, record) in fields.chunks_exact(width).enumerate() {
            let index = first_index + offset;
            let mut sample = Sample {
                index,
                value: 0.0,
                timestamp: 0.0,
                status: 0,
            };
            for (element, &field) in self.elements.iter().zip(record) {
                match element {
                    RecordElement::Reading => sample.value = field,
                    RecordElement::Timestamp => sample.timestamp = field,
                    RecordElement::Status => {
                        sample.status = status_word(field).ok_or_else(|| {
                            DriverError::BufferDecode(format!(
                                "status {field} of record {index} is not a status word"
                            ))
                        })?
                    }
                    RecordElement::Other => {}
                }
            }
            samples.push(sample);
        }
        Ok(samples)
    }
}

fn status_word(field: f64) -> Option<u32> {
    if field.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&field) {
        Some(field as u32)
    } else {
        None
    }
}

/// A decoded buffer reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// 1-based buffer position.
    pub index: usize,
    pub value: f64,
    /// Seconds, relative to the instrument's timestamp origin.
    pub timestamp: f64,
    pub status: u32,
}

/// High-water mark of delivered buffer indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainCursor {
    last_delivered: usize,
}

impl DrainCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_delivered(&self) -> usize {
        self.last_delivered
    }
}

/// Fetches newly stored readings past a [`DrainCursor`].
#[derive(Debug, Clone)]
pub struct BufferDrain {
    layout: RecordLayout,
    capacity: Option<usize>,
    limit: Option<usize>,
    full_reported: bool,
}

impl BufferDrain {
    pub fn new(layout: RecordLayout) -> Self {
        Self {
            layout,
            capacity: None,
            limit: None,
            full_reported: false,
        }
    }

    /// Buffer size; reaching it is reported once, since the buffer stops storing.
    /// A fill level above it is rejected.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self.limit = Some(capacity);
        self
    }

    /// Reject fill levels above `points` without reporting a full buffer.
    pub fn with_limit(mut self, points: usize) -> Self {
        self.limit = Some(points);
        self
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    /// Run one drain cycle.
    ///
    /// Returns the readings stored since the last successful cycle, which may
    /// be none. On error the cursor is left where it was.
    pub fn drain_once<C: CommandChannel>(
        &mut self,
        session: &mut Electrometer<C>,
        cursor: &mut DrainCursor,
    ) -> Result<Vec<Sample>> {
        let response = session.buffer_points_raw()?;
        let fill = parse_fill_level(&response)
            .ok_or_else(|| DriverError::malformed("TRAC:POIN?", &response))?;
        if self.limit.is_some_and(|limit| fill > limit) {
            return Err(DriverError::malformed("TRAC:POIN?", &response));
        }

        let last = cursor.last_delivered;
        if fill < last {
            warn!(
                "buffer fill level went backwards ({} < {}); buffer cleared or wrapped",
                fill, last
            );
            return Ok(Vec::new());
        }
        if fill == last {
            return Ok(Vec::new());
        }

        let first = last + 1;
        let reply = session.buffer_range_raw(first, fill)?;
        let fields = parse_fields(&reply)?;
        let expected = self.layout.width() * (fill - last);
        if fields.len() != expected {
            return Err(DriverError::BufferDecode(format!(
                "expected {expected} fields for readings {first}..={fill}, got {}",
                fields.len()
            )));
        }
        let samples = self.layout.decode(&fields, first)?;

        cursor.last_delivered = fill;
        debug!("drained readings {}..={}", first, fill);

        if let Some(capacity) = self.capacity {
            if fill >= capacity && !self.full_reported {
                self.full_reported = true;
                warn!(
                    "reading buffer full at {} points; later readings are not stored",
                    capacity
                );
            }
        }
        Ok(samples)
    }

    /// Fetch and decode the whole buffer with a single `TRAC:DATA?`.
    ///
    /// Does not touch any cursor; useful after a run has stopped.
    pub fn fetch_all<C: CommandChannel>(
        &self,
        session: &mut Electrometer<C>,
    ) -> Result<Vec<Sample>> {
        let reply = session.buffer_all_raw()?;
        let fields = parse_fields(&reply)?;
        self.layout.decode(&fields, 1)
    }
}

/// Parse a fill level reply (`2500`, `+2500`, `+2.500000E+03`).
pub fn parse_fill_level(response: &str) -> Option<usize> {
    let trimmed = response.trim();
    if let Ok(n) = trimmed.parse::<usize>() {
        return Some(n);
    }
    let value = trimmed.parse::<f64>().ok()?;
    if value.fract() == 0.0 && value >= 0.0 && value <= usize::MAX as f64 {
        Some(value as usize)
    } else {
        None
    }
}

/// Split a comma-separated numeric reply. An empty reply has no fields.
pub fn parse_fields(reply: &str) -> Result<Vec<f64>> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .enumerate()
        .map(|(i, token)| {
            let token = token.trim();
            token.parse::<f64>().map_err(|_| {
                DriverError::BufferDecode(format!("field {} ({token:?}) is not numeric", i + 1))
            })
        })
        .collect()
}
