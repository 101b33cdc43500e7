//! Windowed statistics for one designated one-wire channel.
//!
//! The window is filled once per polling tick and drained on every
//! aggregation tick, whether or not a record could be produced.

use crate::models::channel::{ChannelSelector, ChannelSnapshot};
use chrono::{DateTime, Local, Timelike};
use core::fmt;
use log::debug;
use std::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateError {
    /// The window held no samples.
    InsufficientData,
    /// The window held a single sample; the sample standard deviation is undefined.
    InsufficientVariance,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateError::InsufficientData => write!(f, "no samples in aggregation window"),
            AggregateError::InsufficientVariance => {
                write!(f, "a single sample in aggregation window, standard deviation undefined")
            }
        }
    }
}

impl Error for AggregateError {}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRecord {
    /// Emission time truncated to the whole minute.
    pub timestamp: DateTime<Local>,
    pub channel_db_id: i64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    /// Number of decimals the statistics were rounded to.
    pub decimals: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AggregationWindow {
    samples: Vec<f64>,
}

impl AggregationWindow {
    pub fn push(&mut self, value: f64) {
        self.samples.push(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Hand out the collected samples, leaving the window empty.
    fn drain(&mut self) -> Vec<f64> {
        std::mem::take(&mut self.samples)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

/// Mean, extremes and Bessel-corrected standard deviation of `samples`.
pub fn summarize(samples: &[f64]) -> Result<Summary, AggregateError> {
    match samples.len() {
        0 => return Err(AggregateError::InsufficientData),
        1 => return Err(AggregateError::InsufficientVariance),
        _ => {}
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let squares = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>();
    Ok(Summary {
        mean,
        min,
        max,
        stddev: (squares / (n - 1.0)).sqrt(),
    })
}

/// Round half away from zero; a result of zero is always positive zero.
pub fn round_to(value: f64, decimals: usize) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    let rounded = (value * scale).round() / scale;
    if rounded == 0.0 { 0.0 } else { rounded }
}

fn truncate_to_minute(ts: DateTime<Local>) -> DateTime<Local> {
    ts.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(ts)
}

pub struct Aggregator {
    channel: ChannelSelector,
    db_id: i64,
    decimals: usize,
    window: AggregationWindow,
}

impl Aggregator {
    pub fn new(channel: ChannelSelector, db_id: i64, decimals: usize) -> Self {
        Aggregator {
            channel,
            db_id,
            decimals,
            window: AggregationWindow::default(),
        }
    }

    pub fn channel(&self) -> &ChannelSelector {
        &self.channel
    }

    pub fn window(&self) -> &AggregationWindow {
        &self.window
    }

    /// Append `value` to the window; absent values are ignored.
    pub fn ingest(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.window.push(v);
            debug!("Appending {} to channel {} window (n={})", v, self.channel, self.window.len());
        }
    }

    /// Ingest the designated channel's value from a polling snapshot.
    pub fn ingest_snapshot(&mut self, snapshot: &ChannelSnapshot) {
        self.ingest(snapshot.one_wire_value(&self.channel));
    }

    /// Summarize the window into a record stamped with `now`.
    ///
    /// The window is empty afterwards regardless of the outcome.
    pub fn emit(&mut self, now: DateTime<Local>) -> Result<AggregateRecord, AggregateError> {
        let samples = self.window.drain();
        let summary = summarize(&samples)?;
        Ok(AggregateRecord {
            timestamp: truncate_to_minute(now),
            channel_db_id: self.db_id,
            mean: round_to(summary.mean, self.decimals),
            min: round_to(summary.min, self.decimals),
            max: round_to(summary.max, self.decimals),
            stddev: round_to(summary.stddev, self.decimals),
            decimals: self.decimals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::ChannelId;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn empty_window_is_insufficient_data() {
        let mut agg = Aggregator::new(ChannelSelector::Id(ChannelId(1)), 1, 2);
        assert_eq!(agg.emit(at(10, 0, 0)), Err(AggregateError::InsufficientData));
    }

    #[test]
    fn single_sample_is_insufficient_variance_and_clears() {
        let mut agg = Aggregator::new(ChannelSelector::Id(ChannelId(1)), 1, 2);
        agg.ingest(Some(19.5));
        assert_eq!(agg.emit(at(10, 0, 0)), Err(AggregateError::InsufficientVariance));
        assert!(agg.window().is_empty());
    }

    #[test]
    fn absent_values_are_not_ingested() {
        let mut agg = Aggregator::new(ChannelSelector::Id(ChannelId(1)), 1, 2);
        agg.ingest(None);
        agg.ingest(Some(1.0));
        agg.ingest(None);
        assert_eq!(agg.window().len(), 1);
    }

    #[test]
    fn two_samples_summary() {
        let mut agg = Aggregator::new(ChannelSelector::Id(ChannelId(1)), 7, 2);
        agg.ingest(Some(20.0));
        agg.ingest(Some(22.0));
        let rec = agg.emit(at(12, 34, 56)).unwrap();
        assert_eq!(rec.channel_db_id, 7);
        assert_eq!(rec.mean, 21.0);
        assert_eq!(rec.min, 20.0);
        assert_eq!(rec.max, 22.0);
        assert_eq!(rec.stddev, 1.41);
        assert_eq!(rec.timestamp, at(12, 34, 0));
        assert!(agg.window().is_empty());
    }

    #[test]
    fn window_does_not_leak_into_next_period() {
        let mut agg = Aggregator::new(ChannelSelector::Id(ChannelId(1)), 1, 3);
        for v in [1.0, 2.0, 3.0] {
            agg.ingest(Some(v));
        }
        agg.emit(at(0, 1, 0)).unwrap();
        agg.ingest(Some(10.0));
        agg.ingest(Some(12.0));
        let rec = agg.emit(at(0, 2, 0)).unwrap();
        assert_eq!(rec.min, 10.0);
        assert_eq!(rec.mean, 11.0);
    }

    #[test]
    fn snapshot_ingest_picks_designated_channel() {
        use crate::models::channel::ChannelReading;
        let snap = ChannelSnapshot {
            one_wire_inputs: vec![
                ChannelReading::measured(1, "a", Some(5.0)),
                ChannelReading::measured(2, "b", Some(9.0)),
            ],
            ..Default::default()
        };
        let mut agg = Aggregator::new(ChannelSelector::Id(ChannelId(2)), 1, 2);
        agg.ingest_snapshot(&snap);
        agg.ingest_snapshot(&snap);
        assert_eq!(agg.emit(at(1, 0, 0)).unwrap().mean, 9.0);
    }

    #[test]
    fn negative_values_rounding_to_zero_print_without_sign() {
        assert_eq!(format!("{:.2}", round_to(-0.001, 2)), "0.00");
        assert_eq!(format!("{:.2}", round_to(-0.004, 2)), "0.00");
        assert_eq!(format!("{:.2}", round_to(-0.006, 2)), "-0.01");

        let mut agg = Aggregator::new(ChannelSelector::Id(ChannelId(1)), 1, 2);
        agg.ingest(Some(-0.001));
        agg.ingest(Some(-0.002));
        let rec = agg.emit(at(9, 0, 0)).unwrap();
        let row = crate::persister::format_aggregate_row(&rec);
        assert!(!row.contains("-0.00"), "{row}");
        assert!(row.ends_with("\t0.00\t0.00\t0.00\t0.00\n"), "{row}");
    }

    proptest! {
        #[test]
        fn stddev_matches_bessel_formula(samples in prop::collection::vec(-100.0f64..100.0, 2..50)) {
            let mut agg = Aggregator::new(ChannelSelector::Id(ChannelId(1)), 1, 2);
            for s in &samples {
                agg.ingest(Some(*s));
            }
            let rec = agg.emit(at(8, 0, 0)).unwrap();

            let n = samples.len() as f64;
            let mean = samples.iter().sum::<f64>() / n;
            let var = samples.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);
            prop_assert!((rec.stddev - var.sqrt()).abs() <= 0.005 + 1e-9);
            prop_assert!(rec.min <= rec.mean && rec.mean <= rec.max);
            prop_assert!(agg.window().is_empty());
        }
    }
}
