//! Progress lines and experiment tracking, emitted by the primary only.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::info;
use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::{dist::Role, error::Result};

/// An ordered list of named scalars.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatRecord {
    entries: Vec<(&'static str, f64)>,
}

impl StatRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value and gives the record back to keep chaining calls.
    pub fn with(mut self, name: &'static str, value: impl Into<f64>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: &'static str, value: impl Into<f64>) {
        self.entries.push((name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for StatRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0. && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Builds `"{prefix} name: value | name: value {suffix}"`.
fn format_line(record: &StatRecord, prefix: &str, suffix: &str) -> String {
    let body = record
        .iter()
        .map(|(name, value)| format!("{name}: {}", format_value(value)))
        .collect::<Vec<_>>()
        .join(" | ");

    [prefix, body.as_str(), suffix]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A sink for the records of a run.
pub trait Tracker: Send {
    fn log(&mut self, record: &StatRecord) -> io::Result<()>;

    /// Flushes and closes the run.
    fn finish(&mut self) -> io::Result<()>;
}

/// Writes one JSON object per record to `<dir>/<project>/<run_name>.jsonl`.
pub struct JsonlTracker {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonlTracker {
    /// Creates the run file, truncating any previous run with the same name.
    ///
    /// # Arguments
    /// * `dir` - The root of every tracked project.
    /// * `project` - The project the run belongs to.
    /// * `run_name` - The name of the run file.
    pub fn create(dir: &Path, project: &str, run_name: &str) -> io::Result<Self> {
        let project_dir = dir.join(project);
        fs::create_dir_all(&project_dir)?;

        let path = project_dir.join(format!("{run_name}.jsonl"));
        let out = BufWriter::new(File::create(&path)?);

        info!("tracking the run at {}", path.display());
        Ok(Self { path, out })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Tracker for JsonlTracker {
    fn log(&mut self, record: &StatRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    records: Vec<StatRecord>,
    finished: usize,
}

/// Keeps records in memory, clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryTracker {
    log: Arc<Mutex<MemoryLog>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<StatRecord> {
        self.log.lock().records.clone()
    }

    /// How many times `finish` was called.
    pub fn finished(&self) -> usize {
        self.log.lock().finished
    }
}

impl Tracker for MemoryTracker {
    fn log(&mut self, record: &StatRecord) -> io::Result<()> {
        self.log.lock().records.push(record.clone());
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.log.lock().finished += 1;
        Ok(())
    }
}

/// Emits progress on behalf of a worker, staying silent unless it's the primary.
pub struct Reporter {
    role: Role,
    tracker: Option<Box<dyn Tracker>>,
}

impl Reporter {
    pub fn new(role: Role, tracker: Option<Box<dyn Tracker>>) -> Self {
        Self { role, tracker }
    }

    /// A reporter that only logs.
    pub fn untracked(role: Role) -> Self {
        Self::new(role, None)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Logs `record` as a single line and forwards it to the tracker.
    ///
    /// # Arguments
    /// * `record` - The values to report.
    /// * `prefix` - Text placed before the values.
    /// * `suffix` - Text placed after the values.
    /// * `to_tracker` - Whether the tracker receives the record too.
    ///
    /// # Returns
    /// The emitted line, `None` on replicas.
    pub fn report(
        &mut self,
        record: &StatRecord,
        prefix: &str,
        suffix: &str,
        to_tracker: bool,
    ) -> Result<Option<String>> {
        if !self.role.is_primary() {
            return Ok(None);
        }

        let line = format_line(record, prefix, suffix);
        info!("{line}");

        if let Some(tracker) = self.tracker.as_mut().filter(|_| to_tracker) {
            tracker.log(record)?;
        }

        Ok(Some(line))
    }

    pub fn print(&self, msg: &str) {
        if self.role.is_primary() {
            info!("{msg}");
        }
    }

    /// Closes the tracker, later calls do nothing.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut tracker) = self.tracker.take() {
            tracker.finish()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> StatRecord {
        StatRecord::new()
            .with("train_loss", 0.5)
            .with("step", 3u32)
    }

    #[test]
    fn lines_follow_the_record_order() {
        let line = format_line(&record(), "At the beginning of i = 3,", "");
        assert_eq!(line, "At the beginning of i = 3, train_loss: 0.5 | step: 3");
    }

    #[test]
    fn records_serialize_in_order() {
        let json = serde_json::to_string(&record()).unwrap();
        assert_eq!(json, r#"{"train_loss":0.5,"step":3.0}"#);
    }

    #[test]
    fn only_the_primary_reports() {
        let tracker = MemoryTracker::new();
        let mut primary = Reporter::new(Role::Primary, Some(Box::new(tracker.clone())));
        let mut replica = Reporter::untracked(Role::Replica);

        assert!(primary.report(&record(), "", "", true).unwrap().is_some());
        assert!(primary.report(&record(), "", "", false).unwrap().is_some());
        assert_eq!(replica.report(&record(), "", "", true).unwrap(), None);

        assert_eq!(tracker.records(), [record()]);
    }

    #[test]
    fn repeated_reports_are_identical() {
        let tracker = MemoryTracker::new();
        let mut primary = Reporter::new(Role::Primary, Some(Box::new(tracker.clone())));

        let first = primary.report(&record(), "At i = 3,", "done", true).unwrap();
        let second = primary.report(&record(), "At i = 3,", "done", true).unwrap();

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(tracker.records(), [record(), record()]);
    }

    #[test]
    fn tracked_replicas_stay_silent() {
        let tracker = MemoryTracker::new();
        let mut replica = Reporter::new(Role::Replica, Some(Box::new(tracker.clone())));

        assert_eq!(replica.report(&record(), "", "", true).unwrap(), None);
        assert_eq!(replica.report(&record(), "", "", true).unwrap(), None);
        assert!(tracker.records().is_empty());
    }

    #[test]
    fn the_tracker_is_finished_once() {
        let tracker = MemoryTracker::new();
        let mut reporter = Reporter::new(Role::Primary, Some(Box::new(tracker.clone())));

        reporter.finish().unwrap();
        reporter.finish().unwrap();
        assert_eq!(tracker.finished(), 1);
    }

    #[test]
    fn jsonl_runs_land_in_the_project_dir() {
        let dir = std::env::temp_dir().join(format!("normtune-report-{}", std::process::id()));
        let mut tracker = JsonlTracker::create(&dir, "proj", "run").unwrap();

        tracker.log(&record()).unwrap();
        tracker.log(&record()).unwrap();
        tracker.finish().unwrap();

        let written = fs::read_to_string(dir.join("proj").join("run.jsonl")).unwrap();
        assert_eq!(written.lines().count(), 2);

        fs::remove_dir_all(dir).unwrap();
    }
}
