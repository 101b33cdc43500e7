//! Access to the board's I/O channels.
//!
//! The scheduler only talks to the board through [`ChannelSource`]; the
//! concrete register/bus access lives in the submodules.

pub mod simulated;
pub mod sysfs;

use crate::models::channel::{ChannelReading, OutputKind};
use core::fmt;
use std::error::Error;
use std::path::PathBuf;

#[derive(Debug)]
pub enum SourceError {
    /// Reading or writing a channel file failed.
    Io { path: PathBuf, source: std::io::Error },
    /// A channel file held something that is not a valid reading.
    Parse { path: PathBuf, value: String },
    /// An output index outside the board's range was addressed.
    UnknownChannel { kind: OutputKind, index: usize },
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Io { path, source } => write!(f, "i/o error on {}: {}", path.display(), source),
            SourceError::Parse { path, value } => {
                write!(f, "unexpected content in {}: {:?}", path.display(), value)
            }
            SourceError::UnknownChannel { kind, index } => write!(f, "no {} output with index {}", kind, index),
        }
    }
}

impl Error for SourceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SourceError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Read/write contract of the acquisition board.
///
/// Reads return one reading per configured channel of the category, in a
/// stable order. Output indexes are 1-based, matching the board's labels.
pub trait ChannelSource {
    fn read_digital_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError>;
    fn read_analog_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError>;
    fn read_relay_outputs(&mut self) -> Result<Vec<ChannelReading>, SourceError>;
    fn read_open_collector_outputs(&mut self) -> Result<Vec<ChannelReading>, SourceError>;
    fn read_one_wire_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError>;

    fn set_output(&mut self, kind: OutputKind, index: usize, on: bool) -> Result<(), SourceError>;
    fn set_led(&mut self, on: bool) -> Result<(), SourceError>;

    /// Acknowledge all pending digital input transitions.
    fn reset_digital_input_events(&mut self);

    /// Put the board in a safe state before the process exits.
    fn cleanup(&mut self);
}

impl<T: ChannelSource + ?Sized> ChannelSource for Box<T> {
    fn read_digital_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        (**self).read_digital_inputs()
    }

    fn read_analog_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        (**self).read_analog_inputs()
    }

    fn read_relay_outputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        (**self).read_relay_outputs()
    }

    fn read_open_collector_outputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        (**self).read_open_collector_outputs()
    }

    fn read_one_wire_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        (**self).read_one_wire_inputs()
    }

    fn set_output(&mut self, kind: OutputKind, index: usize, on: bool) -> Result<(), SourceError> {
        (**self).set_output(kind, index, on)
    }

    fn set_led(&mut self, on: bool) -> Result<(), SourceError> {
        (**self).set_led(on)
    }

    fn reset_digital_input_events(&mut self) {
        (**self).reset_digital_input_events()
    }

    fn cleanup(&mut self) {
        (**self).cleanup()
    }
}

/// Iono Pi channel counts, shared by every source implementation.
pub mod layout {
    pub const DIGITAL_INPUTS: usize = 6;
    pub const ANALOG_INPUTS: usize = 2;
    pub const RELAY_OUTPUTS: usize = 4;
    pub const OPEN_COLLECTOR_OUTPUTS: usize = 3;
}

/// Latches digital input transitions until they are acknowledged.
///
/// Each observed status change sets the input's flag; the flag stays set
/// across reads until [`EventLatch::reset`] is called.
#[derive(Debug, Clone, Default)]
pub struct EventLatch {
    last: Vec<Option<bool>>,
    pending: Vec<bool>,
}

impl EventLatch {
    pub fn new(inputs: usize) -> Self {
        EventLatch {
            last: vec![None; inputs],
            pending: vec![false; inputs],
        }
    }

    /// Record the current status of input `index` and return its pending flag.
    pub fn observe(&mut self, index: usize, status: Option<bool>) -> bool {
        if index >= self.last.len() {
            self.last.resize(index + 1, None);
            self.pending.resize(index + 1, false);
        }
        if let (Some(prev), Some(now)) = (self.last[index], status)
            && prev != now
        {
            self.pending[index] = true;
        }
        if status.is_some() {
            self.last[index] = status;
        }
        self.pending[index]
    }

    pub fn reset(&mut self) {
        self.pending.iter_mut().for_each(|p| *p = false);
    }
}
