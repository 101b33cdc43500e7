//! Channel readings as produced by a [`ChannelSource`](crate::source::ChannelSource).
//!
//! A reading is ephemeral: it lives for one polling tick and is never mutated
//! by the scheduler, only formatted and inspected.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One channel's state at the time of a poll.
///
/// Which optional fields are populated depends on the category:
/// - digital inputs: `status` and `status_event`
/// - analog and one-wire inputs: `value`
/// - relay and open-collector outputs: `status`
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReading {
    pub id: ChannelId,
    pub name: String,
    pub value: Option<f64>,
    pub status: Option<bool>,
    /// Set while a transition on this input is pending acknowledgement.
    pub status_event: Option<bool>,
}

impl ChannelReading {
    pub fn digital(id: u32, name: impl Into<String>, status: Option<bool>, status_event: bool) -> Self {
        ChannelReading {
            id: ChannelId(id),
            name: name.into(),
            value: None,
            status,
            status_event: Some(status_event),
        }
    }

    pub fn measured(id: u32, name: impl Into<String>, value: Option<f64>) -> Self {
        ChannelReading {
            id: ChannelId(id),
            name: name.into(),
            value,
            status: None,
            status_event: None,
        }
    }

    pub fn output(id: u32, name: impl Into<String>, status: Option<bool>) -> Self {
        ChannelReading {
            id: ChannelId(id),
            name: name.into(),
            value: None,
            status,
            status_event: None,
        }
    }

    pub fn has_pending_event(&self) -> bool {
        self.status_event == Some(true)
    }
}

/// All channel readings from one polling tick, one ordered list per category.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSnapshot {
    pub digital_inputs: Vec<ChannelReading>,
    pub analog_inputs: Vec<ChannelReading>,
    pub relay_outputs: Vec<ChannelReading>,
    pub open_collector_outputs: Vec<ChannelReading>,
    pub one_wire_inputs: Vec<ChannelReading>,
}

impl ChannelSnapshot {
    /// Value of the selected one-wire channel, if present and measured.
    pub fn one_wire_value(&self, selector: &ChannelSelector) -> Option<f64> {
        self.one_wire_inputs
            .iter()
            .find(|r| selector.matches(r))
            .and_then(|r| r.value)
    }
}

/// Identifies one channel within a category.
///
/// Ids of bus-discovered channels follow discovery order and can shift when a
/// device is added or removed; a name (e.g. a 1-Wire address) does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSelector {
    Id(ChannelId),
    Name(String),
}

impl ChannelSelector {
    pub fn matches(&self, reading: &ChannelReading) -> bool {
        match self {
            ChannelSelector::Id(id) => reading.id == *id,
            ChannelSelector::Name(name) => reading.name == *name,
        }
    }
}

impl fmt::Display for ChannelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelSelector::Id(id) => write!(f, "#{}", id),
            ChannelSelector::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Writable output categories on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Relay,
    OpenCollector,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Relay => write!(f, "relay"),
            OutputKind::OpenCollector => write!(f, "open collector"),
        }
    }
}
