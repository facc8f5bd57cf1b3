//! Structured telemetry rows emitted by subsystems.
//!
//! Every subsystem reports `(subsystem, tick, time, named values)` rows to a
//! [`TelemetrySink`]. Emission is fire-and-forget: a sink that cannot write
//! reports the failure on the diagnostic channel and the run continues.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use arrayvec::ArrayVec;
use csv::Writer;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Maximum number of named values in a single row.
pub const MAX_FIELDS: usize = 16;

const_assert!(MAX_FIELDS >= 12);

pub type Field = (&'static str, f64);
pub type Row = ArrayVec<Field, MAX_FIELDS>;

/// Builds a [`Row`] from a fixed list of fields, dropping anything past
/// [`MAX_FIELDS`].
pub fn row(fields: &[Field]) -> Row {
    fields.iter().copied().take(MAX_FIELDS).collect()
}

pub trait TelemetrySink {
    fn emit(&mut self, subsystem: &str, tick: u64, time: f64, fields: &[Field]);

    /// Push buffered rows to their destination. Failures are reported, not returned.
    fn flush(&mut self) {}
}

/// Discards every row.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&mut self, _subsystem: &str, _tick: u64, _time: f64, _fields: &[Field]) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub subsystem: String,
    pub tick: u64,
    pub time: f64,
    pub fields: Vec<(String, f64)>,
}

impl TelemetryRecord {
    pub fn value(&self, key: &str) -> Option<f64> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }
}

/// Keeps every row in memory, in emission order.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Vec<TelemetryRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    pub fn rows_for<'a>(&'a self, subsystem: &'a str) -> impl Iterator<Item = &'a TelemetryRecord> + 'a {
        self.records.iter().filter(move |r| r.subsystem == subsystem)
    }

    /// Value of `key` in the last row `subsystem` emitted at `tick`.
    pub fn value_at(&self, subsystem: &str, tick: u64, key: &str) -> Option<f64> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.subsystem == subsystem && r.tick == tick)
            .find_map(|r| r.value(key))
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&mut self, subsystem: &str, tick: u64, time: f64, fields: &[Field]) {
        self.records.push(TelemetryRecord {
            subsystem: subsystem.to_owned(),
            tick,
            time,
            fields: row(fields).iter().map(|(k, v)| ((*k).to_owned(), *v)).collect(),
        });
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to create telemetry directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("CSV write error: {0}")]
    Csv(#[from] csv::Error),
}

struct SubsystemFile {
    writer: Writer<File>,
    columns: Vec<&'static str>,
    reported_unknown: bool,
}

/// One wide CSV file per subsystem: `tick,time_s,<columns...>`.
///
/// The column set is fixed by the first row a subsystem emits; later rows
/// are written in that column order and missing values are left empty.
/// Fields outside the header are dropped and reported once per subsystem.
pub struct CsvSink {
    dir: PathBuf,
    files: HashMap<String, SubsystemFile>,
    failed: HashSet<String>,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, TelemetryError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| TelemetryError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            files: HashMap::new(),
            failed: HashSet::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True once a row for `subsystem` carried a field its header lacks.
    pub fn dropped_fields(&self, subsystem: &str) -> bool {
        self.files.get(subsystem).is_some_and(|f| f.reported_unknown)
    }

    fn open(&self, subsystem: &str, fields: &[Field]) -> Result<SubsystemFile, TelemetryError> {
        let path = self.dir.join(format!("{subsystem}.csv"));
        let mut writer = Writer::from_path(&path)?;
        let columns: Vec<&'static str> = row(fields).iter().map(|(k, _)| *k).collect();

        let mut header = vec!["tick", "time_s"];
        header.extend(columns.iter().copied());
        writer.write_record(&header)?;
        debug!("Opened telemetry file {}", path.display());

        Ok(SubsystemFile {
            writer,
            columns,
            reported_unknown: false,
        })
    }

    fn write(&mut self, subsystem: &str, tick: u64, time: f64, fields: &[Field]) -> Result<(), TelemetryError> {
        if !self.files.contains_key(subsystem) {
            let file = self.open(subsystem, fields)?;
            self.files.insert(subsystem.to_owned(), file);
        }
        let Some(file) = self.files.get_mut(subsystem) else {
            return Ok(());
        };

        let mut record = Vec::with_capacity(file.columns.len() + 2);
        record.push(tick.to_string());
        record.push(time.to_string());
        for column in &file.columns {
            let cell = fields
                .iter()
                .find(|(k, _)| k == column)
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            record.push(cell);
        }
        file.writer.write_record(&record)?;

        if !file.reported_unknown {
            let unknown: Vec<&str> = fields
                .iter()
                .map(|(k, _)| *k)
                .filter(|k| !file.columns.contains(k))
                .collect();
            if !unknown.is_empty() {
                warn!(
                    "Telemetry for {} has fields outside its header, dropping: {}",
                    subsystem,
                    unknown.join(",")
                );
                file.reported_unknown = true;
            }
        }
        Ok(())
    }
}

impl TelemetrySink for CsvSink {
    fn emit(&mut self, subsystem: &str, tick: u64, time: f64, fields: &[Field]) {
        if self.failed.contains(subsystem) {
            return;
        }
        if let Err(e) = self.write(subsystem, tick, time, fields) {
            error!("Telemetry for {} disabled after write failure: {}", subsystem, e);
            self.failed.insert(subsystem.to_owned());
        }
    }

    fn flush(&mut self) {
        for (name, file) in &mut self.files {
            if let Err(e) = file.writer.flush() {
                error!("Failed to flush telemetry for {}: {}", name, e);
            }
        }
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_lookup() {
        let mut sink = MemorySink::new();
        sink.emit("PowerBus", 3, 0.3, &[("available_power", 12.5)]);
        sink.emit("Battery", 3, 0.3, &[("charge_Wh", 500.0)]);

        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.value_at("PowerBus", 3, "available_power"), Some(12.5));
        assert_eq!(sink.value_at("PowerBus", 4, "available_power"), None);
        assert_eq!(sink.rows_for("Battery").count(), 1);
    }

    #[test]
    fn test_row_truncates_at_capacity() {
        let fields: Vec<Field> = (0..MAX_FIELDS + 4).map(|_| ("x", 1.0)).collect();
        assert_eq!(row(&fields).len(), MAX_FIELDS);
    }

    #[test]
    fn test_csv_sink_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sink = CsvSink::new(dir.path()).unwrap();
            sink.emit("Battery", 1, 60.0, &[("charge_Wh", 500.0), ("capacity_Wh", 1000.0)]);
            sink.emit("Battery", 2, 120.0, &[("charge_Wh", 490.0), ("capacity_Wh", 1000.0)]);
        }

        let text = std::fs::read_to_string(dir.path().join("Battery.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "tick,time_s,charge_Wh,capacity_Wh");
        assert_eq!(lines[2], "2,120,490,1000");
    }

    #[test]
    fn test_csv_sink_leaves_missing_columns_empty() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sink = CsvSink::new(dir.path()).unwrap();
            sink.emit("Heater", 1, 1.0, &[("requested_w", 10.0), ("received_w", 8.0)]);
            sink.emit("Heater", 2, 2.0, &[("received_w", 4.0)]);
        }

        let text = std::fs::read_to_string(dir.path().join("Heater.csv")).unwrap();
        assert_eq!(text.lines().nth(2), Some("2,2,,4"));
    }

    #[test]
    fn test_csv_sink_reports_fields_outside_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path()).unwrap();
        sink.emit("Heater", 1, 1.0, &[("requested_w", 10.0)]);
        assert!(!sink.dropped_fields("Heater"));

        sink.emit("Heater", 2, 2.0, &[("requested_w", 10.0), ("received_w", 8.0)]);
        assert!(sink.dropped_fields("Heater"));
        assert!(!sink.dropped_fields("Battery"));
    }
}
