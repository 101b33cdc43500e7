//! Append-only, day-partitioned tab-separated logs.
//!
//! Three streams share the `{header}_{YYYY-MM-DD}.dat` naming:
//! - raw polls in the data directory
//! - events in the data directory, with an `_events` suffix on the header
//! - aggregates in the export directory
//!
//! Every append opens the file, writes one complete block with a single
//! `write_all`, and closes it again.

use crate::aggregator::{round_to, AggregateRecord};
use crate::events::EventRecord;
use crate::models::channel::{ChannelReading, ChannelSnapshot};
use chrono::{DateTime, Local};
use core::fmt;
use log::{debug, error, info};
use std::error::Error;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const EVENT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const RAW_VALUE_DECIMALS: usize = 2;

#[derive(Debug)]
pub enum PersistError {
    Io { path: PathBuf, source: std::io::Error },
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Io { path, source } => write!(f, "writing {} failed: {}", path.display(), source),
        }
    }
}

impl Error for PersistError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PersistError::Io { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Persister {
    data_path: PathBuf,
    export_path: PathBuf,
    file_header: String,
}

impl Persister {
    pub fn new(data_path: impl Into<PathBuf>, export_path: impl Into<PathBuf>, file_header: impl Into<String>) -> Self {
        Persister {
            data_path: data_path.into(),
            export_path: export_path.into(),
            file_header: file_header.into(),
        }
    }

    /// Create both output directories if missing.
    pub fn prepare(&self) -> Result<(), String> {
        for dir in [&self.data_path, &self.export_path] {
            if !dir.is_dir() {
                fs::create_dir_all(dir).map_err(|e| format!("cannot create directory {}: {}", dir.display(), e))?;
                info!("Created directory {}", dir.display());
            }
        }
        Ok(())
    }

    pub fn raw_file(&self, day: &DateTime<Local>) -> PathBuf {
        day_file(&self.data_path, &self.file_header, day)
    }

    pub fn event_file(&self, day: &DateTime<Local>) -> PathBuf {
        day_file(&self.data_path, &format!("{}_events", self.file_header), day)
    }

    pub fn aggregate_file(&self, day: &DateTime<Local>) -> PathBuf {
        day_file(&self.export_path, &self.file_header, day)
    }

    /// Append one raw-poll block for `snapshot`. Returns `false` on failure.
    pub fn append_raw(&self, snapshot: &ChannelSnapshot, now: DateTime<Local>) -> bool {
        let path = self.raw_file(&now);
        report(append_block(&path, &format_raw_block(snapshot, &now)))
    }

    pub fn append_aggregate(&self, record: &AggregateRecord) -> bool {
        let path = self.aggregate_file(&record.timestamp);
        report(append_block(&path, &format_aggregate_row(record)))
    }

    /// Append all `events` as one block into the event file of the first event's day.
    pub fn append_events(&self, events: &[EventRecord]) -> bool {
        let Some(first) = events.first() else {
            return true;
        };
        let block = events.iter().map(format_event_row).collect::<String>();
        report(append_block(&self.event_file(&first.timestamp), &block))
    }
}

fn day_file(dir: &Path, header: &str, day: &DateTime<Local>) -> PathBuf {
    dir.join(format!("{}_{}.dat", header, day.format("%Y-%m-%d")))
}

fn append_block(path: &Path, block: &str) -> Result<(), PersistError> {
    info!("Saving data to file {}...", path.display());
    debug!("File row\n{}", block);
    let io_err = |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new().create(true).append(true).open(path).map_err(io_err)?;
    file.write_all(block.as_bytes()).map_err(io_err)
}

fn report(result: Result<(), PersistError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("{}", e);
            false
        }
    }
}

fn flag(v: Option<bool>) -> &'static str {
    match v {
        Some(true) => "1",
        Some(false) => "0",
        None => "None",
    }
}

fn number(v: Option<f64>, decimals: usize) -> String {
    match v {
        Some(x) => format!("{:.*}", decimals, round_to(x, decimals)),
        None => "None".to_string(),
    }
}

fn push_section(
    block: &mut String,
    ts: &str,
    title: &str,
    rows: &[ChannelReading],
    cells: impl Fn(&ChannelReading) -> String,
) {
    block.push_str("# ");
    block.push_str(title);
    block.push('\n');
    for r in rows {
        block.push_str(&format!("{}\t{}\t{}\t{}\n", ts, r.id, cells(r), r.name));
    }
}

/// Render one polling snapshot as a block of rows, grouped by category.
pub fn format_raw_block(snapshot: &ChannelSnapshot, now: &DateTime<Local>) -> String {
    let ts = now.format(TIMESTAMP_FORMAT).to_string();
    let mut block = String::new();
    push_section(&mut block, &ts, "digital inputs", &snapshot.digital_inputs, |r| {
        format!("{}\t{}", flag(r.status), flag(r.status_event))
    });
    push_section(&mut block, &ts, "analog inputs", &snapshot.analog_inputs, |r| {
        number(r.value, RAW_VALUE_DECIMALS)
    });
    push_section(&mut block, &ts, "relay outputs", &snapshot.relay_outputs, |r| {
        flag(r.status).to_string()
    });
    push_section(&mut block, &ts, "open collector outputs", &snapshot.open_collector_outputs, |r| {
        flag(r.status).to_string()
    });
    push_section(&mut block, &ts, "1wire inputs", &snapshot.one_wire_inputs, |r| {
        number(r.value, RAW_VALUE_DECIMALS)
    });
    block
}

pub fn format_aggregate_row(record: &AggregateRecord) -> String {
    let d = record.decimals;
    format!(
        "{}\t{}\t{:.*}\t{:.*}\t{:.*}\t{:.*}\n",
        record.timestamp.format(TIMESTAMP_FORMAT),
        record.channel_db_id,
        d,
        record.mean,
        d,
        record.min,
        d,
        record.max,
        d,
        record.stddev
    )
}

pub fn format_event_row(event: &EventRecord) -> String {
    format!(
        "{}\t{}\t{}\t{}\n",
        event.timestamp.format(EVENT_TIMESTAMP_FORMAT),
        event.channel_id,
        flag(Some(event.event_status)),
        event.channel_name
    )
}
