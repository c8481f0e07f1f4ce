use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// One line of supervised output. `seq` is strictly increasing per
/// execution; a gap in a replayed file is an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub execution_id: String,
    pub seq: u64,
    pub stream: LogStream,
    pub ts: i64,
    #[serde(rename = "bytes")]
    pub data: String,
}

/// Bounded in-memory tail of an execution's output. Older records are
/// evicted by byte budget, never by count.
pub struct LogRing {
    capacity_bytes: usize,
    used_bytes: usize,
    records: VecDeque<LogRecord>,
}

impl LogRing {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes: capacity_bytes.max(1),
            used_bytes: 0,
            records: VecDeque::new(),
        }
    }

    pub fn push(&mut self, record: LogRecord) {
        self.used_bytes += record.data.len();
        self.records.push_back(record);
        while self.used_bytes > self.capacity_bytes && self.records.len() > 1 {
            if let Some(evicted) = self.records.pop_front() {
                self.used_bytes -= evicted.data.len();
            }
        }
    }

    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub fn log_file_path(logs_dir: &Path, execution_id: &str) -> PathBuf {
    logs_dir.join(format!("{execution_id}.jsonl"))
}

/// Append-only line-delimited JSON log of one execution, fsynced once at
/// terminal exit.
pub struct ExecutionLogWriter {
    path: PathBuf,
    file: File,
}

impl ExecutionLogWriter {
    pub fn create(logs_dir: &Path, execution_id: &str) -> Result<Self> {
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create {}", logs_dir.display()))?;
        let path = log_file_path(logs_dir, execution_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{line}")
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// Flush and fsync. Called exactly once, at terminal exit.
    pub fn finalize(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file
            .sync_all()
            .with_context(|| format!("Failed to fsync {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Replays a persisted execution log in order, verifying the sequence is
/// gapless and strictly increasing.
pub fn read_log_file(path: &Path) -> Result<Vec<LogRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut records = Vec::new();
    let mut last_seq: Option<u64> = None;

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = serde_json::from_str(&line)
            .with_context(|| format!("Corrupt log line in {}", path.display()))?;
        if let Some(last) = last_seq
            && record.seq != last + 1
        {
            return Err(anyhow::anyhow!(
                "Sequence gap in {}: {last} -> {}",
                path.display(),
                record.seq
            ));
        }
        last_seq = Some(record.seq);
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(seq: u64, data: &str) -> LogRecord {
        LogRecord {
            execution_id: "e-1".into(),
            seq,
            stream: LogStream::Stdout,
            ts: 0,
            data: data.to_string(),
        }
    }

    #[test]
    fn ring_evicts_by_bytes_oldest_first() {
        let mut ring = LogRing::new(10);
        ring.push(record(0, "aaaa"));
        ring.push(record(1, "bbbb"));
        ring.push(record(2, "cccc"));

        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].seq, 1);
        assert_eq!(snapshot[1].seq, 2);
    }

    #[test]
    fn ring_always_keeps_the_newest_record() {
        let mut ring = LogRing::new(4);
        ring.push(record(0, "this record alone exceeds the budget"));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn write_then_replay_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mut writer = ExecutionLogWriter::create(tmp.path(), "e-1").unwrap();
        for seq in 0..5 {
            writer.append(&record(seq, &format!("line {seq}"))).unwrap();
        }
        writer.finalize().unwrap();

        let replayed = read_log_file(writer.path()).unwrap();
        assert_eq!(replayed.len(), 5);
        assert!(replayed.windows(2).all(|w| w[1].seq == w[0].seq + 1));
        assert_eq!(replayed[3].data, "line 3");
    }

    #[test]
    fn replay_detects_sequence_gaps() {
        let tmp = TempDir::new().unwrap();
        let mut writer = ExecutionLogWriter::create(tmp.path(), "e-1").unwrap();
        writer.append(&record(0, "a")).unwrap();
        writer.append(&record(2, "c")).unwrap();
        writer.finalize().unwrap();

        assert!(read_log_file(writer.path()).is_err());
    }

    #[test]
    fn log_path_is_per_execution() {
        let dir = Path::new("/root/.logs");
        assert_eq!(
            log_file_path(dir, "abc"),
            PathBuf::from("/root/.logs/abc.jsonl")
        );
    }
}
