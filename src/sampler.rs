use crate::models::channel::ChannelSnapshot;
use crate::source::{ChannelSource, SourceError};
use log::debug;

/// Read every channel category, in board order: digital inputs, analog
/// inputs, relay outputs, open-collector outputs, one-wire inputs.
pub fn sample<S: ChannelSource + ?Sized>(source: &mut S) -> Result<ChannelSnapshot, SourceError> {
    let snapshot = ChannelSnapshot {
        digital_inputs: source.read_digital_inputs()?,
        analog_inputs: source.read_analog_inputs()?,
        relay_outputs: source.read_relay_outputs()?,
        open_collector_outputs: source.read_open_collector_outputs()?,
        one_wire_inputs: source.read_one_wire_inputs()?,
    };
    debug!(
        "Sampled {} digital, {} analog, {} relay, {} open collector, {} 1wire channel(s)",
        snapshot.digital_inputs.len(),
        snapshot.analog_inputs.len(),
        snapshot.relay_outputs.len(),
        snapshot.open_collector_outputs.len(),
        snapshot.one_wire_inputs.len()
    );
    Ok(snapshot)
}
