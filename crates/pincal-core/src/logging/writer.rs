//! Append-only JSONL writer, one file per instance per day.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::JsonLogEntry;

/// Appends entries to `logs/raw/<date>_<instance>.jsonl`
pub struct InstanceLogWriter {
    instance: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl InstanceLogWriter {
    /// Open (or create) today's file for `instance`, creating `raw/` if needed.
    pub fn new(logs_dir: impl AsRef<Path>, instance: impl Into<String>) -> std::io::Result<Self> {
        let instance = instance.into();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, instance));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            instance,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush, so a crash loses at most the current line.
    pub fn write(&self, entry: &JsonLogEntry) -> std::io::Result<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for InstanceLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every instance's entries, sorted by timestamp.
///
/// Malformed lines are skipped.
pub fn read_all_entries(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<JsonLogEntry>> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for file in fs::read_dir(&raw_dir)? {
        let path = file?.path();
        if path.extension().map(|e| e != "jsonl").unwrap_or(true) {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        entries.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .filter_map(|line| JsonLogEntry::from_json_line(line).ok()),
        );
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}

/// Entries tagged with one calendar session, sorted by timestamp.
pub fn read_calendar_entries(
    logs_dir: impl AsRef<Path>,
    calendar: &str,
) -> std::io::Result<Vec<JsonLogEntry>> {
    let mut entries = read_all_entries(logs_dir)?;
    entries.retain(|e| e.calendar.as_deref() == Some(calendar));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_creates_raw_dir() {
        let temp = TempDir::new().unwrap();
        let logs_dir = temp.path().join("logs");

        let writer = InstanceLogWriter::new(&logs_dir, "coordinator").unwrap();

        assert!(logs_dir.join("raw").exists());
        assert!(writer.path().exists());
        assert!(writer.path().to_string_lossy().ends_with("_coordinator.jsonl"));
    }

    #[test]
    fn test_read_merges_instances_and_filters_calendar() {
        let temp = TempDir::new().unwrap();
        let logs_dir = temp.path().join("logs");

        let coordinator = InstanceLogWriter::new(&logs_dir, "coordinator").unwrap();
        let tab = InstanceLogWriter::new(&logs_dir, "tab-0").unwrap();
        coordinator
            .write(&JsonLogEntry::new("info", "coordinator", "c", "Elected").with_calendar("a"))
            .unwrap();
        tab.write(&JsonLogEntry::new("info", "tab-0", "t", "Started").with_calendar("b"))
            .unwrap();
        fs::write(logs_dir.join("raw").join("notes.txt"), "not a log").unwrap();
        drop(coordinator);
        drop(tab);

        let all = read_all_entries(&logs_dir).unwrap();
        assert_eq!(all.len(), 2);

        let only_a = read_calendar_entries(&logs_dir, "a").unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].msg, "Elected");
    }

    #[test]
    fn test_missing_dir_reads_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_all_entries(temp.path().join("nope")).unwrap().is_empty());
    }
}
