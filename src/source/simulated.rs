//! Simulated Iono Pi board for running without hardware.
//!
//! Readings follow a bounded random walk driven by a seeded `SmallRng`, so a
//! given seed always produces the same sequence.

use super::layout::{ANALOG_INPUTS, DIGITAL_INPUTS, OPEN_COLLECTOR_OUTPUTS, RELAY_OUTPUTS};
use super::{ChannelSource, EventLatch, SourceError};
use crate::models::channel::{ChannelReading, OutputKind};
use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_SEED: u64 = 0x1090_0DA5_5EED_0001;

const TEMP_START_C: f64 = 21.0;
const TEMP_MIN_C: f64 = -10.0;
const TEMP_MAX_C: f64 = 45.0;
const ANALOG_MAX_V: f64 = 10.0;
const TOGGLE_PROBABILITY: f64 = 0.05;

pub struct SimulatedBoard {
    rng: SmallRng,
    digital: [bool; DIGITAL_INPUTS],
    analog: [f64; ANALOG_INPUTS],
    relays: [bool; RELAY_OUTPUTS],
    open_collectors: [bool; OPEN_COLLECTOR_OUTPUTS],
    led: bool,
    temperature: f64,
    latch: EventLatch,
}

impl SimulatedBoard {
    pub fn new(seed: u64) -> Self {
        let mut latch = EventLatch::new(DIGITAL_INPUTS);
        for i in 0..DIGITAL_INPUTS {
            latch.observe(i, Some(false));
        }
        SimulatedBoard {
            rng: SmallRng::seed_from_u64(seed),
            digital: [false; DIGITAL_INPUTS],
            analog: [ANALOG_MAX_V / 2.0; ANALOG_INPUTS],
            relays: [false; RELAY_OUTPUTS],
            open_collectors: [false; OPEN_COLLECTOR_OUTPUTS],
            led: false,
            temperature: TEMP_START_C,
            latch,
        }
    }

    #[cfg(test)]
    pub fn led(&self) -> bool {
        self.led
    }
}

impl ChannelSource for SimulatedBoard {
    fn read_digital_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        let mut out = Vec::with_capacity(DIGITAL_INPUTS);
        for i in 0..DIGITAL_INPUTS {
            if self.rng.random_bool(TOGGLE_PROBABILITY) {
                self.digital[i] = !self.digital[i];
            }
            let status = Some(self.digital[i]);
            let pending = self.latch.observe(i, status);
            out.push(ChannelReading::digital(i as u32 + 1, format!("DI{}", i + 1), status, pending));
        }
        Ok(out)
    }

    fn read_analog_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        let mut out = Vec::with_capacity(ANALOG_INPUTS);
        for i in 0..ANALOG_INPUTS {
            let step = self.rng.random_range(-0.25..=0.25);
            self.analog[i] = (self.analog[i] + step).clamp(0.0, ANALOG_MAX_V);
            out.push(ChannelReading::measured(i as u32 + 1, format!("AI{}", i + 1), Some(self.analog[i])));
        }
        Ok(out)
    }

    fn read_relay_outputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        Ok(self
            .relays
            .iter()
            .enumerate()
            .map(|(i, on)| ChannelReading::output(i as u32 + 1, format!("O{}", i + 1), Some(*on)))
            .collect())
    }

    fn read_open_collector_outputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        Ok(self
            .open_collectors
            .iter()
            .enumerate()
            .map(|(i, on)| ChannelReading::output(i as u32 + 1, format!("OC{}", i + 1), Some(*on)))
            .collect())
    }

    fn read_one_wire_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        let drift = self.rng.random_range(-0.3..=0.3);
        self.temperature = (self.temperature + drift).clamp(TEMP_MIN_C, TEMP_MAX_C);
        Ok(vec![ChannelReading::measured(1, "1W1", Some(self.temperature))])
    }

    fn set_output(&mut self, kind: OutputKind, index: usize, on: bool) -> Result<(), SourceError> {
        let slot = match kind {
            OutputKind::Relay => index.checked_sub(1).and_then(|i| self.relays.get_mut(i)),
            OutputKind::OpenCollector => index.checked_sub(1).and_then(|i| self.open_collectors.get_mut(i)),
        };
        let slot = slot.ok_or(SourceError::UnknownChannel { kind, index })?;
        *slot = on;
        debug!("Simulated {} {} set to {}", kind, index, on);
        Ok(())
    }

    fn set_led(&mut self, on: bool) -> Result<(), SourceError> {
        self.led = on;
        Ok(())
    }

    fn reset_digital_input_events(&mut self) {
        self.latch.reset();
    }

    fn cleanup(&mut self) {
        self.relays = [false; RELAY_OUTPUTS];
        self.open_collectors = [false; OPEN_COLLECTOR_OUTPUTS];
        self.led = false;
    }
}
