//! Iono Pi board access through the kernel module's sysfs tree.
//!
//! Layout under the module root (default `/sys/class/ionopi`):
//! - `digital_in/di1`..`di6`: `0`/`1`
//! - `analog_in/ai1_mv`, `ai2_mv`: millivolts, reported here in volts
//! - `relay/o1`..`o4`, `open_coll/oc1`..`oc3`: `0`/`1`, writable
//! - `led/status`: `0`/`1`, writable
//!
//! Temperature sensors are read from the 1-Wire bus (`28-*/w1_slave`).

use super::layout::{ANALOG_INPUTS, DIGITAL_INPUTS, OPEN_COLLECTOR_OUTPUTS, RELAY_OUTPUTS};
use super::{ChannelSource, EventLatch, SourceError};
use crate::models::channel::{ChannelReading, OutputKind};
use log::{debug, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/ionopi";
pub const DEFAULT_W1_ROOT: &str = "/sys/bus/w1/devices";

const DS18B20_FAMILY: &str = "28-";

pub struct SysfsBoard {
    root: PathBuf,
    w1_root: PathBuf,
    latch: EventLatch,
}

impl SysfsBoard {
    /// Open the board, failing early when the kernel module is not loaded.
    pub fn open(root: impl Into<PathBuf>, w1_root: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SourceError::Io {
                source: std::io::Error::new(ErrorKind::NotFound, "ionopi kernel module not loaded"),
                path: root,
            });
        }
        Ok(SysfsBoard {
            root,
            w1_root: w1_root.into(),
            latch: EventLatch::new(DIGITAL_INPUTS),
        })
    }

    fn read_flag(&self, rel: &str) -> Result<bool, SourceError> {
        let path = self.root.join(rel);
        let raw = read_trimmed(&path)?;
        let flag = match raw.as_str() {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        };
        flag.ok_or(SourceError::Parse { path, value: raw })
    }

    fn write_flag(&self, rel: &str, on: bool) -> Result<(), SourceError> {
        let path = self.root.join(rel);
        fs::write(&path, if on { "1" } else { "0" }).map_err(|source| SourceError::Io { path, source })
    }

    fn read_outputs(
        &self,
        dir: &str,
        prefix: &str,
        count: usize,
        label: &str,
    ) -> Result<Vec<ChannelReading>, SourceError> {
        (1..=count)
            .map(|n| -> Result<ChannelReading, SourceError> {
                let status = self.read_flag(&format!("{dir}/{prefix}{n}"))?;
                Ok(ChannelReading::output(n as u32, format!("{label}{n}"), Some(status)))
            })
            .collect()
    }

    fn one_wire_devices(&self) -> Result<Vec<PathBuf>, SourceError> {
        let entries = match fs::read_dir(&self.w1_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No 1-Wire bus at {}", self.w1_root.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(SourceError::Io {
                    path: self.w1_root.clone(),
                    source,
                });
            }
        };
        let mut devices = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(DS18B20_FAMILY))
            })
            .collect::<Vec<_>>();
        devices.sort();
        Ok(devices)
    }
}

fn read_trimmed(path: &Path) -> Result<String, SourceError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Parse a DS18B20 `w1_slave` dump into degrees Celsius.
///
/// Returns `None` when the CRC line does not end in `YES` or no `t=` field is present.
pub fn parse_w1_slave(contents: &str) -> Option<f64> {
    let mut lines = contents.lines();
    let crc_ok = lines.next().is_some_and(|l| l.trim_end().ends_with("YES"));
    if !crc_ok {
        return None;
    }
    let (_, milli) = lines.next()?.rsplit_once("t=")?;
    milli.trim().parse::<i64>().ok().map(|m| m as f64 / 1000.0)
}

impl ChannelSource for SysfsBoard {
    fn read_digital_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        let mut out = Vec::with_capacity(DIGITAL_INPUTS);
        for n in 1..=DIGITAL_INPUTS {
            let status = self.read_flag(&format!("digital_in/di{n}"))?;
            let pending = self.latch.observe(n - 1, Some(status));
            out.push(ChannelReading::digital(n as u32, format!("DI{n}"), Some(status), pending));
        }
        Ok(out)
    }

    fn read_analog_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        (1..=ANALOG_INPUTS)
            .map(|n| -> Result<ChannelReading, SourceError> {
                let path = self.root.join(format!("analog_in/ai{n}_mv"));
                let raw = read_trimmed(&path)?;
                let mv = raw
                    .parse::<i64>()
                    .map_err(|_| SourceError::Parse { path, value: raw })?;
                Ok(ChannelReading::measured(n as u32, format!("AI{n}"), Some(mv as f64 / 1000.0)))
            })
            .collect()
    }

    fn read_relay_outputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        self.read_outputs("relay", "o", RELAY_OUTPUTS, "O")
    }

    fn read_open_collector_outputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        self.read_outputs("open_coll", "oc", OPEN_COLLECTOR_OUTPUTS, "OC")
    }

    fn read_one_wire_inputs(&mut self) -> Result<Vec<ChannelReading>, SourceError> {
        let devices = self.one_wire_devices()?;
        let mut out = Vec::with_capacity(devices.len());
        for (i, dev) in devices.iter().enumerate() {
            let name = dev
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let value = match fs::read_to_string(dev.join("w1_slave")) {
                Ok(contents) => {
                    let v = parse_w1_slave(&contents);
                    if v.is_none() {
                        warn!("1-Wire sensor {} returned an invalid reading", name);
                    }
                    v
                }
                Err(e) => {
                    warn!("1-Wire sensor {} unreadable: {}", name, e);
                    None
                }
            };
            out.push(ChannelReading::measured(i as u32 + 1, name, value));
        }
        Ok(out)
    }

    fn set_output(&mut self, kind: OutputKind, index: usize, on: bool) -> Result<(), SourceError> {
        let rel = match kind {
            OutputKind::Relay if (1..=RELAY_OUTPUTS).contains(&index) => format!("relay/o{index}"),
            OutputKind::OpenCollector if (1..=OPEN_COLLECTOR_OUTPUTS).contains(&index) => {
                format!("open_coll/oc{index}")
            }
            _ => return Err(SourceError::UnknownChannel { kind, index }),
        };
        self.write_flag(&rel, on)
    }

    fn set_led(&mut self, on: bool) -> Result<(), SourceError> {
        self.write_flag("led/status", on)
    }

    fn reset_digital_input_events(&mut self) {
        self.latch.reset();
    }

    fn cleanup(&mut self) {
        let outputs = (1..=RELAY_OUTPUTS)
            .map(|n| (OutputKind::Relay, n))
            .chain((1..=OPEN_COLLECTOR_OUTPUTS).map(|n| (OutputKind::OpenCollector, n)));
        for (kind, n) in outputs {
            if let Err(e) = self.set_output(kind, n, false) {
                warn!("Cleanup: {}", e);
            }
        }
        if let Err(e) = self.set_led(false) {
            warn!("Cleanup: {}", e);
        }
    }
}
