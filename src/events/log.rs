use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Event;
use crate::error::Result;

/// One line of the event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub event: Event,
    pub processed_at: DateTime<Utc>,
    pub triggers_activated: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl LogEntry {
    pub fn new(event: Event, triggers_activated: Vec<String>) -> Self {
        Self {
            event,
            processed_at: Utc::now(),
            triggers_activated,
            errors: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Rotate when the current file reaches this many bytes.
    pub max_bytes: u64,
    /// Rotate when the current file reaches this many lines.
    pub max_lines: u64,
    /// Number of rotated tail files kept (`.1` .. `.N`).
    pub rotate_count: u32,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            max_bytes: crate::config::DEFAULT_MAX_LOG_SIZE,
            max_lines: 10_000,
            rotate_count: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogStats {
    pub lines: u64,
    pub bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

struct LogState {
    /// Cached line count of the current file; avoids a scan per append.
    lines: u64,
}

/// Append-only JSON-per-line event log with size/count rotation.
pub struct EventLog {
    path: PathBuf,
    config: EventLogConfig,
    state: Mutex<LogState>,
}

impl EventLog {
    pub fn open(path: &Path, config: EventLogConfig) -> Result<Self> {
        let lines = if path.exists() {
            count_lines(path)?
        } else {
            0
        };
        Ok(Self {
            path: path.to_path_buf(),
            config,
            state: Mutex::new(LogState { lines }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotated_path(&self, n: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// Append one entry, rotating first when the current file is full.
    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut state = self.state.lock().expect("event log lock poisoned");

        let bytes = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if bytes >= self.config.max_bytes || state.lines >= self.config.max_lines {
            if let Err(err) = self.rotate() {
                // Last resort: truncate rather than grow without bound.
                tracing::warn!(error = %err, "log rotation failed; truncating current file");
                fs::write(&self.path, b"")?;
            }
            state.lines = 0;
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        state.lines += 1;
        Ok(())
    }

    pub fn append_event(&self, event: Event, triggers_activated: Vec<String>) -> Result<()> {
        self.append(&LogEntry::new(event, triggers_activated))
    }

    fn rotate(&self) -> Result<()> {
        let oldest = self.rotated_path(self.config.rotate_count);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.config.rotate_count).rev() {
            let from = self.rotated_path(n);
            if from.exists() {
                fs::rename(&from, self.rotated_path(n + 1))?;
            }
        }
        if self.path.exists() {
            fs::rename(&self.path, self.rotated_path(1))?;
        }
        File::create(&self.path)?;
        Ok(())
    }

    /// Every parseable entry, oldest first, across rotated tails and the
    /// current file. Corrupt lines are dropped silently.
    pub fn read_all(&self) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for n in (1..=self.config.rotate_count).rev() {
            read_file_into(&self.rotated_path(n), &mut entries)?;
        }
        read_file_into(&self.path, &mut entries)?;
        Ok(entries)
    }

    /// The most recent `n` entries, oldest of those first.
    pub fn read_recent(&self, n: usize) -> Result<Vec<LogEntry>> {
        let mut entries = self.read_all()?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }

    pub fn read_by_type(&self, event_type: &str, n: usize) -> Result<Vec<LogEntry>> {
        let mut matching: Vec<LogEntry> = self
            .read_all()?
            .into_iter()
            .filter(|e| e.event.event_type() == event_type)
            .collect();
        let skip = matching.len().saturating_sub(n);
        Ok(matching.split_off(skip))
    }

    pub fn read_by_node(&self, node_id: &str, n: usize) -> Result<Vec<LogEntry>> {
        let mut matching: Vec<LogEntry> = self
            .read_all()?
            .into_iter()
            .filter(|e| e.event.node_id() == Some(node_id))
            .collect();
        let skip = matching.len().saturating_sub(n);
        Ok(matching.split_off(skip))
    }

    pub fn read_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.event.timestamp >= start && e.event.timestamp <= end)
            .collect())
    }

    pub fn stats(&self) -> Result<LogStats> {
        let entries = self.read_all()?;
        let bytes = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        let lines = self.state.lock().expect("event log lock poisoned").lines;
        Ok(LogStats {
            lines,
            bytes,
            oldest: entries.first().map(|e| e.event.timestamp),
            newest: entries.last().map(|e| e.event.timestamp),
        })
    }
}

fn read_file_into(path: &Path, out: &mut Vec<LogEntry>) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => out.push(entry),
            Err(err) => {
                tracing::debug!(file = %path.display(), error = %err, "dropping corrupt log line");
            }
        }
    }
    Ok(())
}

fn count_lines(path: &Path) -> Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    Ok(reader.lines().count() as u64)
}
