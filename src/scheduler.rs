//! Polling/aggregation loop.
//!
//! Two cadences share one fine-grained loop: the polling cadence samples the
//! board and persists raw readings, the aggregation cadence summarizes the
//! designated channel. Both are aligned to whole multiples of their period
//! in seconds since the Unix epoch, and advance by accumulating deadlines
//! rather than testing the clock for exact multiples.

use crate::aggregator::{AggregateError, Aggregator};
use crate::clock::Clock;
use crate::events;
use crate::models::channel::OutputKind;
use crate::persister::Persister;
use crate::sampler;
use crate::source::ChannelSource;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub polling_period_secs: u64,
    pub aggregation_period_secs: u64,
    pub fine_tick: Duration,
    pub settle_delay: Duration,
    pub pulse: PulsePlan,
}

/// Outputs switched on for the settle delay of every poll.
#[derive(Debug, Clone, Default)]
pub struct PulsePlan {
    pub led: bool,
    pub relay: Option<usize>,
    pub open_collector: Option<usize>,
}

/// Deadline tracker for one periodic action.
#[derive(Debug, Clone)]
pub struct Cadence {
    period: u64,
    next: u64,
}

impl Cadence {
    /// First deadline is the first multiple of `period` at or after `now`.
    pub fn aligned(period: u64, now: Duration) -> Self {
        let period = period.max(1);
        let secs = now.as_secs();
        let on_boundary = now.subsec_nanos() == 0 && secs % period == 0;
        let k = if on_boundary { secs / period } else { secs / period + 1 };
        Cadence { period, next: k * period }
    }

    /// Next deadline, in seconds since the Unix epoch.
    pub fn next_deadline(&self) -> u64 {
        self.next
    }

    /// If a deadline has been reached at `now`, return the latest one passed
    /// and move to the first deadline strictly after `now`.
    ///
    /// A deadline observed late still fires once. Deadlines that passed
    /// entirely while the loop was busy are skipped rather than replayed.
    pub fn poll(&mut self, now: Duration) -> Option<u64> {
        if now < Duration::from_secs(self.next) {
            return None;
        }
        let skipped = (now.as_secs() - self.next) / self.period;
        if skipped > 0 {
            warn!(
                "Loop fell behind: skipping {} deadline(s) of the {}s cadence",
                skipped, self.period
            );
        }
        let fired = self.next + skipped * self.period;
        self.next = fired + self.period;
        Some(fired)
    }
}

/// What happened during one fine tick: the deadline each action fired for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub poll_deadline: Option<u64>,
    pub aggregate_deadline: Option<u64>,
}

impl TickReport {
    pub fn polled(&self) -> bool {
        self.poll_deadline.is_some()
    }

    pub fn aggregated(&self) -> bool {
        self.aggregate_deadline.is_some()
    }
}

pub struct Scheduler<S, C> {
    config: SchedulerConfig,
    source: S,
    clock: C,
    aggregator: Aggregator,
    persister: Persister,
    polling: Cadence,
    aggregation: Cadence,
}

impl<S: ChannelSource, C: Clock> Scheduler<S, C> {
    pub fn new(config: SchedulerConfig, source: S, clock: C, aggregator: Aggregator, persister: Persister) -> Self {
        let now = clock.since_epoch();
        let polling = Cadence::aligned(config.polling_period_secs, now);
        let aggregation = Cadence::aligned(config.aggregation_period_secs, now);
        info!(
            "Scheduler armed: first poll at epoch {}s, first aggregate at epoch {}s",
            polling.next_deadline(),
            aggregation.next_deadline()
        );
        Scheduler {
            config,
            source,
            clock,
            aggregator,
            persister,
            polling,
            aggregation,
        }
    }

    /// Run fine ticks until `cancel` is set. A tick in progress always completes.
    pub fn run(&mut self, cancel: &AtomicBool) {
        info!("Polling loop started (fine tick {}ms)", self.config.fine_tick.as_millis());
        while !cancel.load(Ordering::SeqCst) {
            self.step();
            self.clock.sleep(self.config.fine_tick);
        }
        info!("Polling loop stopped");
    }

    /// Evaluate both cadences once against the same tick time.
    ///
    /// Polling runs first, so a shared boundary aggregates the values that
    /// were just polled. The settle delay inside the poll does not move the
    /// tick time.
    pub fn step(&mut self) -> TickReport {
        let now = self.clock.since_epoch();
        let poll_deadline = self.polling.poll(now);
        if poll_deadline.is_some() {
            self.poll_tick();
        }
        let aggregate_deadline = self.aggregation.poll(now);
        if aggregate_deadline.is_some() {
            self.aggregate_tick();
        }
        TickReport {
            poll_deadline,
            aggregate_deadline,
        }
    }

    pub fn into_source(self) -> S {
        self.source
    }

    fn poll_tick(&mut self) {
        info!("--- New polling ---");
        let now = self.clock.local_now();
        let snapshot = match sampler::sample(&mut self.source) {
            Ok(s) => s,
            Err(e) => {
                error!("Reading channels failed: {}", e);
                return;
            }
        };

        self.set_pulse(true);

        if !self.persister.append_raw(&snapshot, now) {
            warn!("Raw poll at {} not persisted", now.format("%H:%M:%S"));
        }

        self.aggregator.ingest_snapshot(&snapshot);

        let pending = events::collect(&snapshot, self.clock.local_now());
        if !pending.is_empty() && !self.persister.append_events(&pending) {
            warn!("{} event(s) not persisted", pending.len());
        }

        self.clock.sleep(self.config.settle_delay);
        self.set_pulse(false);
        self.source.reset_digital_input_events();
    }

    fn aggregate_tick(&mut self) {
        info!("*** New aggregate ***");
        debug!("Aggregating {} sample(s)", self.aggregator.window().len());
        match self.aggregator.emit(self.clock.local_now()) {
            Ok(record) => {
                debug!("Aggregate {:?}", record);
                if !self.persister.append_aggregate(&record) {
                    warn!("Aggregate for {} not persisted", record.timestamp.format("%H:%M"));
                }
            }
            Err(AggregateError::InsufficientData) => {
                warn!("No data found for channel {}, window is empty", self.aggregator.channel());
            }
            Err(e) => error!("Aggregate for channel {} skipped: {}", self.aggregator.channel(), e),
        }
        info!("Reset aggregation window");
    }

    fn set_pulse(&mut self, on: bool) {
        let pulse = &self.config.pulse;
        if pulse.led
            && let Err(e) = self.source.set_led(on)
        {
            error!("Switching LED failed: {}", e);
        }
        let outputs = [
            (OutputKind::Relay, pulse.relay),
            (OutputKind::OpenCollector, pulse.open_collector),
        ];
        for (kind, index) in outputs {
            if let Some(index) = index
                && let Err(e) = self.source.set_output(kind, index, on)
            {
                error!("Switching {} {} failed: {}", kind, index, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::models::channel::{ChannelId, ChannelReading, ChannelSelector};
    use crate::source::SourceError;
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    // 2023-11-14 22:14:00 UTC, a whole minute
    const T0: u64 = 1_700_000_040;

    #[derive(Default)]
    struct ScriptedSource {
        temperatures: VecDeque<f64>,
        flagged: VecDeque<bool>,
        fail_reads: bool,
        writes: Vec<String>,
        resets: usize,
        /// Raised while the one-wire inputs are read, i.e. mid-poll.
        cancel_on_read: Option<Arc<AtomicBool>>,
    }

    impl ChannelSource for ScriptedSource {
        fn read_digital_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
            if self.fail_reads {
                return Err(SourceError::Parse {
                    path: "digital_in/di1".into(),
                    value: "?".into(),
                });
            }
            let flagged = self.flagged.pop_front().unwrap_or(false);
            Ok(vec![ChannelReading::digital(1, "DI1", Some(flagged), flagged)])
        }

        fn read_analog_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
            Ok(vec![ChannelReading::measured(1, "AI1", Some(1.0))])
        }

        fn read_relay_outputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
            Ok(vec![ChannelReading::output(1, "O1", Some(false))])
        }

        fn read_open_collector_outputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
            Ok(vec![ChannelReading::output(1, "OC1", Some(false))])
        }

        fn read_one_wire_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
            if let Some(cancel) = &self.cancel_on_read {
                cancel.store(true, Ordering::SeqCst);
            }
            Ok(vec![ChannelReading::measured(1, "1W1", self.temperatures.pop_front())])
        }

        fn set_output(&mut self, kind: OutputKind, index: usize, on: bool) -> Result<(), SourceError> {
            self.writes.push(format!("{kind} {index} {on}"));
            Ok(())
        }

        fn set_led(&mut self, on: bool) -> Result<(), SourceError> {
            self.writes.push(format!("led {on}"));
            Ok(())
        }

        fn reset_digital_input_events(&mut self) {
            self.resets += 1;
        }

        fn cleanup(&mut self) {}
    }

    fn config(poll: u64, agg: u64, settle_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            polling_period_secs: poll,
            aggregation_period_secs: agg,
            fine_tick: Duration::from_millis(100),
            settle_delay: Duration::from_millis(settle_ms),
            pulse: PulsePlan {
                led: true,
                relay: Some(1),
                open_collector: Some(1),
            },
        }
    }

    fn scheduler(
        dir: &TempDir,
        cfg: SchedulerConfig,
        source: ScriptedSource,
        start: Duration,
    ) -> Scheduler<ScriptedSource, ManualClock> {
        let persister = Persister::new(dir.path().join("data"), dir.path().join("ftp"), "iono");
        persister.prepare().unwrap();
        Scheduler::new(
            cfg,
            source,
            ManualClock::at(start),
            Aggregator::new(ChannelSelector::Id(ChannelId(1)), 1, 2),
            persister,
        )
    }

    fn run_until(s: &mut Scheduler<ScriptedSource, ManualClock>, end: Duration) -> Vec<TickReport> {
        let mut reports = Vec::new();
        while s.clock.since_epoch() < end {
            reports.push(s.step());
            s.clock.sleep(s.config.fine_tick);
        }
        reports
    }

    fn files_in(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut files = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect::<Vec<_>>();
        files.sort();
        files
    }

    #[test]
    fn cadence_aligns_to_next_multiple() {
        assert_eq!(Cadence::aligned(10, Duration::from_secs(100)).next_deadline(), 100);
        assert_eq!(Cadence::aligned(10, Duration::from_millis(100_001)).next_deadline(), 110);
        assert_eq!(Cadence::aligned(60, Duration::from_secs(61)).next_deadline(), 120);
    }

    #[test]
    fn cadence_fires_late_deadline_once_and_skips_missed() {
        let mut c = Cadence::aligned(10, Duration::from_secs(100));
        assert_eq!(c.poll(Duration::from_secs(100)), Some(100));
        assert_eq!(c.poll(Duration::from_millis(109_900)), None);
        // observed 3s late: fires, next deadline stays on the grid
        assert_eq!(c.poll(Duration::from_secs(113)), Some(110));
        assert_eq!(c.next_deadline(), 120);
        // stalled across 120, 130 and 140: one firing for 140, then 150
        assert_eq!(c.poll(Duration::from_secs(145)), Some(140));
        assert_eq!(c.poll(Duration::from_secs(146)), None);
        assert_eq!(c.next_deadline(), 150);
    }

    #[test]
    fn boundary_alignment_over_two_minutes() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource {
            temperatures: (0..100).map(|i| 20.0 + i as f64 / 10.0).collect(),
            ..Default::default()
        };
        let mut s = scheduler(&dir, config(10, 60, 1500), source, Duration::from_secs(T0));
        let reports = run_until(&mut s, Duration::from_secs(T0 + 120));

        assert_eq!(reports.iter().filter(|r| r.polled()).count(), 12);
        assert_eq!(reports.iter().filter(|r| r.aggregated()).count(), 2);
        let aggregating = reports.iter().filter(|r| r.aggregated()).collect::<Vec<_>>();
        assert!(aggregating.iter().all(|r| r.poll_deadline == r.aggregate_deadline));
        assert_eq!(
            aggregating.iter().map(|r| r.aggregate_deadline).collect::<Vec<_>>(),
            vec![Some(T0), Some(T0 + 60)]
        );
    }

    #[test]
    fn aggregate_row_end_to_end() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource {
            temperatures: VecDeque::from(vec![20.0, 22.0]),
            ..Default::default()
        };
        // odd start: poll at T0+1, then poll and aggregate together at T0+2.
        // The 1.5s settle delay overruns the 1s polling period.
        let start = Duration::from_secs(T0 + 1);
        let mut s = scheduler(&dir, config(1, 2, 1500), source, start);
        let reports = run_until(&mut s, start + Duration::from_secs(4));

        let aggregating = reports.iter().filter(|r| r.aggregated()).collect::<Vec<_>>();
        assert!(!aggregating.is_empty());
        assert_eq!(aggregating[0].aggregate_deadline, Some(T0 + 2));
        assert!(aggregating.iter().all(|r| r.poll_deadline == r.aggregate_deadline));

        let files = files_in(&dir.path().join("ftp"));
        assert_eq!(files.len(), 1);
        let contents = fs::read_to_string(&files[0]).unwrap();
        assert_eq!(contents.lines().count(), 1);
        let fields = contents.trim_end().split('\t').collect::<Vec<_>>();
        assert_eq!(&fields[1..], &["1", "21.00", "20.00", "22.00", "1.41"]);
        assert!(fields[0].ends_with(":00"));
    }

    #[test]
    fn pulse_is_reverted_after_settle_and_events_reset() {
        let dir = TempDir::new().unwrap();
        let mut s = scheduler(&dir, config(10, 60, 1500), ScriptedSource::default(), Duration::from_secs(T0 + 5));
        run_until(&mut s, Duration::from_secs(T0 + 11));
        let source = s.into_source();
        assert_eq!(
            source.writes,
            vec![
                "led true",
                "relay 1 true",
                "open collector 1 true",
                "led false",
                "relay 1 false",
                "open collector 1 false",
            ]
        );
        assert_eq!(source.resets, 1);
    }

    #[test]
    fn flagged_input_writes_one_event_per_tick() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource {
            flagged: VecDeque::from(vec![true, true, false, false]),
            ..Default::default()
        };
        let mut s = scheduler(&dir, config(1, 60, 0), source, Duration::from_secs(T0 + 1));
        run_until(&mut s, Duration::from_millis((T0 + 4) * 1000 + 500));

        let event_files = files_in(&dir.path().join("data"))
            .into_iter()
            .filter(|p| p.to_string_lossy().contains("_events_"))
            .collect::<Vec<_>>();
        assert_eq!(event_files.len(), 1);
        let rows = fs::read_to_string(&event_files[0]).unwrap();
        assert_eq!(rows.lines().count(), 2);
        assert!(rows.lines().all(|l| l.ends_with("\t1\t1\tDI1")));
    }

    #[test]
    fn source_failure_skips_tick_but_loop_continues() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource {
            fail_reads: true,
            ..Default::default()
        };
        let mut s = scheduler(&dir, config(1, 2, 0), source, Duration::from_secs(T0));
        let reports = run_until(&mut s, Duration::from_secs(T0 + 4));
        assert_eq!(reports.iter().filter(|r| r.polled()).count(), 4);
        assert_eq!(reports.iter().filter(|r| r.aggregated()).count(), 2);
        assert!(files_in(&dir.path().join("data")).is_empty());
        assert!(files_in(&dir.path().join("ftp")).is_empty());
        assert!(s.into_source().writes.is_empty());
    }

    #[test]
    fn persistence_failure_does_not_stop_aggregation() {
        let dir = TempDir::new().unwrap();
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, "not a directory").unwrap();
        let persister = Persister::new(&blocked, dir.path().join("ftp"), "iono");
        fs::create_dir_all(dir.path().join("ftp")).unwrap();
        let source = ScriptedSource {
            temperatures: VecDeque::from(vec![20.0, 22.0]),
            ..Default::default()
        };
        let start = Duration::from_secs(T0 + 1);
        let mut s = Scheduler::new(
            config(1, 2, 0),
            source,
            ManualClock::at(start),
            Aggregator::new(ChannelSelector::Id(ChannelId(1)), 1, 2),
            persister,
        );
        run_until(&mut s, start + Duration::from_millis(1500));
        assert_eq!(files_in(&dir.path().join("ftp")).len(), 1);
    }

    #[test]
    fn cancelled_loop_returns() {
        let dir = TempDir::new().unwrap();
        let mut s = scheduler(&dir, config(10, 60, 0), ScriptedSource::default(), Duration::from_secs(T0));
        let cancel = AtomicBool::new(true);
        s.run(&cancel);
        assert_eq!(s.clock.since_epoch(), Duration::from_secs(T0));
    }

    #[test]
    fn cancel_during_poll_lets_the_tick_finish() {
        let dir = TempDir::new().unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource {
            temperatures: VecDeque::from(vec![20.0]),
            cancel_on_read: Some(Arc::clone(&cancel)),
            ..Default::default()
        };
        let mut s = scheduler(&dir, config(10, 60, 1500), source, Duration::from_secs(T0));
        s.run(&cancel);

        // one step (including the settle delay) and one fine-tick sleep
        assert_eq!(s.clock.since_epoch(), Duration::from_millis(T0 * 1000 + 1600));
        assert_eq!(files_in(&dir.path().join("data")).len(), 1);
        let source = s.into_source();
        assert_eq!(source.writes.last().map(String::as_str), Some("open collector 1 false"));
        assert_eq!(source.resets, 1);
    }
}
