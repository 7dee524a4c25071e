use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{NewTraceEntry, TraceEntry};
use crate::errors::TraceError;
use crate::stage::Stage;

/// Appends to and replays the project's trace ledger.
///
/// Appends are serialized twice over: an in-process mutex, and an exclusive
/// advisory lock on the ledger file so separate processes cannot interleave.
pub struct TraceRecorder {
    path: PathBuf,
    writer: Mutex<()>,
}

impl TraceRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry, assigning the next sequence number.
    ///
    /// The entry is durable (synced) when this returns `Ok`.
    pub fn append(&self, entry: NewTraceEntry) -> Result<TraceEntry, TraceError> {
        let _guard = self.writer.lock().map_err(|_| TraceError::LockPoisoned)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io(e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| self.io(e))?;
        file.lock_exclusive().map_err(|e| TraceError::Lock {
            path: self.path.clone(),
            source: e,
        })?;

        let result = self.append_locked(&mut file, entry);
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    fn append_locked(&self, file: &mut File, entry: NewTraceEntry) -> Result<TraceEntry, TraceError> {
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| self.io(e))?;
        let complete = complete_lines(&contents);
        if complete.len() < contents.len() {
            // Torn tail from an interrupted append; the entry never completed
            warn!(
                path = %self.path.display(),
                torn_bytes = contents.len() - complete.len(),
                "Truncating incomplete trailing trace line"
            );
            file.set_len(complete.len() as u64)
                .and_then(|_| file.sync_data())
                .map_err(|e| self.io(e))?;
        }
        let last = match complete.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => {
                let line_no = complete.lines().count();
                parse_line(line, line_no)?.sequence
            }
            None => 0,
        };

        let entry = entry.into_entry(last + 1);
        let mut line = serde_json::to_string(&entry).map_err(TraceError::Encode)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| self.io(e))?;

        debug!(
            sequence = entry.sequence,
            run_id = %entry.run_id,
            stage = %entry.stage,
            "Appended trace entry"
        );
        Ok(entry)
    }

    /// Every entry in ledger order. Sequence numbers must run 1, 2, 3, ...
    /// An unterminated final line is ignored.
    pub fn read_all(&self) -> Result<Vec<TraceEntry>, TraceError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io(e)),
        };

        let mut entries: Vec<TraceEntry> = Vec::new();
        for (idx, line) in complete_lines(&contents).lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = parse_line(line, idx + 1)?;
            let expected = entries.last().map(|e| e.sequence + 1).unwrap_or(1);
            if entry.sequence != expected {
                return Err(TraceError::Corrupted {
                    line: idx + 1,
                    reason: format!(
                        "expected sequence {}, found {}",
                        expected, entry.sequence
                    ),
                });
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn len(&self) -> Result<usize, TraceError> {
        Ok(self.read_all()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, TraceError> {
        Ok(self.len()? == 0)
    }

    pub fn for_run(&self, run_id: Uuid) -> Result<Vec<TraceEntry>, TraceError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.run_id == run_id)
            .collect())
    }

    /// Latest entry for one stage of one run.
    pub fn last_for(&self, run_id: Uuid, stage: Stage) -> Result<Option<TraceEntry>, TraceError> {
        Ok(self
            .read_all()?
            .into_iter()
            .rfind(|e| e.run_id == run_id && e.stage == stage))
    }

    fn io(&self, source: std::io::Error) -> TraceError {
        TraceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// The ledger up to and including its last newline. Anything after it is a
/// line whose append never finished.
fn complete_lines(contents: &str) -> &str {
    match contents.rfind('\n') {
        Some(idx) => &contents[..=idx],
        None => "",
    }
}

fn parse_line(line: &str, line_no: usize) -> Result<TraceEntry, TraceError> {
    serde_json::from_str(line).map_err(|e| TraceError::Corrupted {
        line: line_no,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{DecisionRef, GateId};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn entry(run_id: Uuid, stage: Stage) -> NewTraceEntry {
        NewTraceEntry {
            run_id,
            stage,
            input_hash: "in".into(),
            output_hash: "out".into(),
            provider: Some("command:mock".into()),
            prompt_hash: Some("p".into()),
            decisions: Vec::new(),
        }
    }

    // =========================================
    // append / read_all
    // =========================================

    #[test]
    fn test_sequence_starts_at_one_and_increments() {
        let dir = tempdir().unwrap();
        let recorder = TraceRecorder::new(dir.path().join("TRACE.jsonl"));
        let run = Uuid::new_v4();

        let first = recorder.append(entry(run, Stage::Bootstrap)).unwrap();
        let second = recorder.append(entry(run, Stage::Design)).unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);

        let all = recorder.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].stage, Stage::Design);
    }

    #[test]
    fn test_missing_ledger_reads_empty() {
        let dir = tempdir().unwrap();
        let recorder = TraceRecorder::new(dir.path().join("TRACE.jsonl"));
        assert!(recorder.read_all().unwrap().is_empty());
        assert!(recorder.is_empty().unwrap());
    }

    #[test]
    fn test_sequence_survives_new_recorder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("TRACE.jsonl");
        let run = Uuid::new_v4();
        TraceRecorder::new(&path)
            .append(entry(run, Stage::Bootstrap))
            .unwrap();

        // A fresh process picks up where the ledger left off
        let next = TraceRecorder::new(&path)
            .append(entry(run, Stage::Design))
            .unwrap();
        assert_eq!(next.sequence, 2);
    }

    #[test]
    fn test_concurrent_appends_have_no_gaps() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(TraceRecorder::new(dir.path().join("TRACE.jsonl")));
        let run = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let recorder = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        recorder.append(entry(run, Stage::Test)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let all = recorder.read_all().unwrap();
        let sequences: Vec<u64> = all.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=40).collect::<Vec<u64>>());
    }

    #[test]
    fn test_gap_is_reported_as_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("TRACE.jsonl");
        let recorder = TraceRecorder::new(&path);
        let run = Uuid::new_v4();
        let first = recorder.append(entry(run, Stage::Bootstrap)).unwrap();

        let mut skipped = first.clone();
        skipped.sequence = 3;
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str(&serde_json::to_string(&skipped).unwrap());
        contents.push('\n');
        fs::write(&path, contents).unwrap();

        let err = recorder.read_all().unwrap_err();
        assert!(matches!(err, TraceError::Corrupted { line: 2, .. }));
    }

    #[test]
    fn test_garbage_line_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("TRACE.jsonl");
        fs::write(&path, "{not json}\n").unwrap();
        let err = TraceRecorder::new(&path).read_all().unwrap_err();
        assert!(matches!(err, TraceError::Corrupted { line: 1, .. }));
    }

    #[test]
    fn test_torn_tail_is_ignored_then_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("TRACE.jsonl");
        let recorder = TraceRecorder::new(&path);
        let run = Uuid::new_v4();
        recorder.append(entry(run, Stage::Bootstrap)).unwrap();

        // Interrupted append: half a line, no newline
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"sequence":2,"run_id":""#).unwrap();
        drop(file);

        assert_eq!(recorder.read_all().unwrap().len(), 1);
        assert_eq!(recorder.last_for(run, Stage::Design).unwrap(), None);

        let next = recorder.append(entry(run, Stage::Design)).unwrap();
        assert_eq!(next.sequence, 2);

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.ends_with('\n'));
        let sequences: Vec<u64> = recorder
            .read_all()
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_torn_first_line_reads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("TRACE.jsonl");
        fs::write(&path, r#"{"sequence":1"#).unwrap();
        let recorder = TraceRecorder::new(&path);
        assert!(recorder.is_empty().unwrap());
        let first = recorder.append(entry(Uuid::new_v4(), Stage::Bootstrap)).unwrap();
        assert_eq!(first.sequence, 1);
    }

    // =========================================
    // queries
    // =========================================

    #[test]
    fn test_for_run_and_last_for() {
        let dir = tempdir().unwrap();
        let recorder = TraceRecorder::new(dir.path().join("TRACE.jsonl"));
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        recorder.append(entry(run_a, Stage::Bootstrap)).unwrap();
        recorder.append(entry(run_b, Stage::Bootstrap)).unwrap();
        let mut design = entry(run_a, Stage::Design);
        design.decisions = vec![DecisionRef {
            gate: GateId::new(Stage::Design, "architecture-choice"),
            choice: "A".into(),
        }];
        recorder.append(design).unwrap();

        assert_eq!(recorder.for_run(run_a).unwrap().len(), 2);
        assert_eq!(recorder.for_run(run_b).unwrap().len(), 1);

        let last = recorder.last_for(run_a, Stage::Design).unwrap().unwrap();
        assert_eq!(last.sequence, 3);
        assert_eq!(last.decisions[0].choice, "A");
        assert!(recorder.last_for(run_b, Stage::Design).unwrap().is_none());
    }
}
