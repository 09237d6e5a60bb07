//! Session data logging: a transient per-session CSV that is either
//! promoted into the permanent dataset or discarded when the session ends.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use model::LogRecord;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

/// What to do with the transient rows when a logging session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promote {
    /// Merge the rows into the permanent dataset at this path.
    Into(PathBuf),
    /// Drop the rows; the dataset is left untouched.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSummary {
    pub rows: u64,
    pub dropped: u64,
    pub promoted: Option<PathBuf>,
}

/// Append-only log of one recording session. Rows land in a uniquely named
/// transient file; nothing touches the permanent dataset until
/// [`SessionLog::finish`] promotes it. Dropping an unfinished log discards
/// the transient file.
pub struct SessionLog {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows: u64,
    dropped: u64,
    finished: bool,
}

impl SessionLog {
    pub fn start(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create log directory {}", dir.display()))?;
        let tag = Uuid::new_v4().simple().to_string();
        let path = dir.join(format!("car_data_{}.csv", &tag[..12]));
        let writer = csv::Writer::from_path(&path)
            .with_context(|| format!("create transient log {}", path.display()))?;
        info!(path = %path.display(), "logging session started");
        Ok(Self {
            path,
            writer: Some(writer),
            rows: 0,
            dropped: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append one row. A write failure is counted, not propagated; the
    /// control loop must keep its tick cadence.
    pub fn append(&mut self, rec: &LogRecord) {
        let Some(writer) = self.writer.as_mut() else {
            self.dropped += 1;
            return;
        };
        match writer.serialize(rec) {
            Ok(()) => self.rows += 1,
            Err(e) => {
                self.dropped += 1;
                warn!(error = %e, "logging write failed (continuing without this row)");
            }
        }
    }

    /// End the session: promote the transient rows into the dataset or
    /// discard them. The transient file is removed either way.
    pub fn finish(mut self, promote: Promote) -> Result<LogSummary> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("flush transient log")?;
        }
        self.finished = true;
        let promoted = match promote {
            Promote::Discard => {
                fs::remove_file(&self.path)
                    .with_context(|| format!("remove {}", self.path.display()))?;
                info!(rows = self.rows, "session rows discarded");
                None
            }
            Promote::Into(dest) if self.rows == 0 => {
                // nothing was written, not even a header
                fs::remove_file(&self.path)
                    .with_context(|| format!("remove {}", self.path.display()))?;
                info!(dest = %dest.display(), "no rows recorded, nothing to promote");
                None
            }
            Promote::Into(dest) => {
                merge_into(&self.path, &dest)?;
                fs::remove_file(&self.path)
                    .with_context(|| format!("remove {}", self.path.display()))?;
                info!(rows = self.rows, dest = %dest.display(), "session rows promoted");
                Some(dest)
            }
        };
        Ok(LogSummary {
            rows: self.rows,
            dropped: self.dropped,
            promoted,
        })
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        if !self.finished {
            self.writer.take();
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Append every row of `src` to the dataset at `dest`. The header is
/// written only when `dest` is new or empty, so files from many sessions
/// concatenate cleanly.
pub fn merge_into(src: &Path, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dataset directory {}", parent.display()))?;
        }
    }
    let write_header = fs::metadata(dest).map(|m| m.len() == 0).unwrap_or(true);

    let mut rdr = csv::Reader::from_path(src)
        .with_context(|| format!("open transient log {}", src.display()))?;
    let headers = rdr.headers().context("read transient header")?.clone();

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dest)
        .with_context(|| format!("open dataset {}", dest.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if write_header {
        writer.write_record(&headers)?;
    }
    let mut appended = 0u64;
    for record in rdr.records() {
        writer.write_record(&record?)?;
        appended += 1;
    }
    writer.flush()?;
    Ok(appended)
}

/// Wall-clock stamp for log rows.
pub fn wall_clock() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{CarControl, CarState};

    fn record(step: u64) -> LogRecord {
        LogRecord::new(
            step,
            "00:00:00".into(),
            &CarState::default(),
            &CarControl::default(),
        )
    }

    fn dataset_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn promote_writes_header_once_and_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dataset").join("drive_log.csv");

        let mut log = SessionLog::start(dir.path()).unwrap();
        log.append(&record(1));
        log.append(&record(2));
        let transient = log.path().to_owned();
        let summary = log.finish(Promote::Into(dest.clone())).unwrap();
        assert_eq!(summary.rows, 2);
        assert!(!transient.exists());

        let mut log = SessionLog::start(dir.path()).unwrap();
        log.append(&record(3));
        log.finish(Promote::Into(dest.clone())).unwrap();

        let lines = dataset_lines(&dest);
        assert_eq!(lines.len(), 4); // one header, three rows
        assert!(lines[0].starts_with("Step,Time,SpeedX"));
        assert!(lines.iter().skip(1).all(|l| !l.starts_with("Step,")));
    }

    #[test]
    fn discard_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("drive_log.csv");

        let mut log = SessionLog::start(dir.path()).unwrap();
        log.append(&record(1));
        let transient = log.path().to_owned();
        let summary = log.finish(Promote::Discard).unwrap();

        assert_eq!(summary.rows, 1);
        assert_eq!(summary.promoted, None);
        assert!(!transient.exists());
        assert!(!dest.exists());
    }

    #[test]
    fn discard_is_idempotent_on_the_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("drive_log.csv");

        let mut log = SessionLog::start(dir.path()).unwrap();
        log.append(&record(1));
        log.finish(Promote::Into(dest.clone())).unwrap();
        let before = dataset_lines(&dest);

        let mut log = SessionLog::start(dir.path()).unwrap();
        log.append(&record(2));
        log.finish(Promote::Discard).unwrap();

        assert_eq!(dataset_lines(&dest), before);
    }

    #[test]
    fn unfinished_log_is_discarded_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let transient;
        {
            let mut log = SessionLog::start(dir.path()).unwrap();
            log.append(&record(1));
            transient = log.path().to_owned();
        }
        assert!(!transient.exists());
    }

    #[test]
    fn empty_session_promotes_to_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("drive_log.csv");
        let log = SessionLog::start(dir.path()).unwrap();
        let summary = log.finish(Promote::Into(dest.clone())).unwrap();
        assert_eq!(summary.rows, 0);
        assert_eq!(summary.promoted, None);
        assert!(!dest.exists());
    }

    #[test]
    fn row_count_matches_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SessionLog::start(dir.path()).unwrap();
        for step in 0..25 {
            log.append(&record(step));
        }
        assert_eq!(log.rows(), 25);
        assert_eq!(log.dropped(), 0);
    }
}
