//! The per-partition recovery + write state machine (spec §4.5). This is
//! the heart of the system: two sub-machines share one state variable,
//! advanced one step at a time so that a failure at any step leaves enough
//! context behind for the next call to retry from exactly that step.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::error::SinkError;
use crate::naming::{self, Partition};
use crate::record_writer::{Record, RecordWriter, RecordWriterProvider};
use crate::storage::Storage;
use crate::upstream::Upstream;
use crate::wal::Wal;

/// Settings shared by every partition a [`crate::coordinator::Coordinator`]
/// owns; cheap to clone (an `Arc` internally would be overkill given how
/// small it is, so it is plain data passed by value).
#[derive(Debug, Clone)]
pub struct PartitionSettings {
    pub root: PathBuf,
    pub topics_dir: String,
    pub flush_size: usize,
    pub retry_backoff_ms: u64,
}

/// Recovery sub-machine followed by the write sub-machine (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    RecoveryStarted,
    RecoveryPartitionPaused,
    WalCreated,
    WalApplied,
    WalTruncated,
    OffsetReset,
    WriteStarted,
    WritePartitionPaused,
    ShouldRotate,
    TempFileClosed,
    WalAppended,
    FileCommitted,
}

enum StepOutcome {
    Continue,
    Blocked,
}

/// All per-partition runtime state, co-located in one record rather than
/// split across parallel maps (spec §9).
pub struct PartitionRuntime {
    pub partition: Partition,
    state: State,
    buffer: VecDeque<Record>,
    writer: Option<Box<dyn RecordWriter>>,
    temp_name: Option<PathBuf>,
    wal: Option<Box<dyn Wal>>,
    /// Last committed end offset, or `None` before the partition's first
    /// commit. Only ever updated by an actual `storage.commit`, so
    /// `committed_offset()` never reports a value for a range that has not
    /// been durably written.
    high_water: Option<u64>,
    /// The first record's own offset for the temp artifact currently being
    /// accumulated, captured when it is opened. Used as the range start
    /// when `high_water` is still `None` (spec §8: "the first committed
    /// range starts at that offset"), avoiding an off-by-one sentinel on a
    /// partition whose very first record is offset zero.
    pending_start: Option<u64>,
    records_in_temp: usize,
    recovered: bool,
    pub failure_time: Option<Instant>,
    /// `(temp_path, final_path, end_offset)` stashed between the
    /// `TempFileClosed` and `FileCommitted` steps, so that a failed
    /// `storage.commit` can be retried without recomputing the range.
    pending_commit: Option<(PathBuf, PathBuf, u64)>,

    storage: Arc<dyn Storage>,
    writer_provider: Arc<dyn RecordWriterProvider>,
    upstream: Arc<dyn Upstream>,
    settings: PartitionSettings,
}

impl PartitionRuntime {
    pub fn new(
        partition: Partition,
        storage: Arc<dyn Storage>,
        writer_provider: Arc<dyn RecordWriterProvider>,
        upstream: Arc<dyn Upstream>,
        settings: PartitionSettings,
    ) -> Self {
        Self {
            partition,
            state: State::RecoveryStarted,
            buffer: VecDeque::new(),
            writer: None,
            temp_name: None,
            wal: None,
            high_water: None,
            pending_start: None,
            records_in_temp: 0,
            recovered: false,
            failure_time: None,
            pending_commit: None,
            storage,
            writer_provider,
            upstream,
            settings,
        }
    }

    /// The next offset the upstream should commit for this partition (spec
    /// §8, invariant 4). `None` until the first commit.
    pub fn committed_offset(&self) -> Option<u64> {
        self.high_water.map(|h| h + 1)
    }

    /// Enqueue a record. Records already covered by a committed range are
    /// dropped rather than buffered, satisfying the deduplication law (spec
    /// §8): a replaying upstream cannot produce a duplicate committed file.
    pub fn push(&mut self, record: Record) {
        if self.recovered {
            if let Some(hw) = self.high_water {
                if record.offset <= hw {
                    tracing::trace!(
                        partition = ?self.partition,
                        offset = record.offset,
                        high_water = hw,
                        "dropping record already reflected in a committed file"
                    );
                    return;
                }
            }
        }
        self.buffer.push_back(record);
    }

    /// Whether a failure is still within its backoff window and this
    /// partition should be skipped this round (spec §4.6).
    pub fn in_backoff(&self, now: Instant) -> bool {
        match self.failure_time {
            Some(t) => now.duration_since(t).as_millis() < self.settings.retry_backoff_ms as u128,
            None => false,
        }
    }

    /// Drive the state machine forward until it blocks (buffer drained, or
    /// recovery/write loop has nothing left to do this call) or a step
    /// fails. Mirrors the "fall-through" progression of the source: each
    /// step is independently retryable (spec §9).
    pub fn execute(&mut self) -> Result<(), SinkError> {
        loop {
            match self.step() {
                Ok(StepOutcome::Continue) => continue,
                Ok(StepOutcome::Blocked) => {
                    self.failure_time = None;
                    return Ok(());
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.failure_time = Some(Instant::now());
                        self.upstream.request_backoff(self.settings.retry_backoff_ms);
                        tracing::warn!(
                            partition = ?self.partition,
                            state = ?self.state,
                            error = %e,
                            "partition drain failed, will retry after backoff"
                        );
                    } else {
                        tracing::error!(
                            partition = ?self.partition,
                            error = %e,
                            "non-retryable failure driving partition"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    fn step(&mut self) -> Result<StepOutcome, SinkError> {
        let before = self.state;
        let outcome = self.step_inner()?;
        if before != self.state {
            tracing::trace!(partition = ?self.partition, from = ?before, to = ?self.state, "state transition");
        }
        Ok(outcome)
    }

    fn step_inner(&mut self) -> Result<StepOutcome, SinkError> {
        match self.state {
            State::RecoveryStarted => {
                self.upstream.pause(&self.partition)?;
                self.state = State::RecoveryPartitionPaused;
                Ok(StepOutcome::Continue)
            }
            State::RecoveryPartitionPaused => {
                let wal = self.storage.open_wal(&self.partition).map_err(|e| match e {
                    crate::error::WalError::Fenced(path) => crate::error::CoordinationError(format!(
                        "another writer holds the WAL lease for {:?} at {}",
                        self.partition,
                        path.display()
                    ))
                    .into(),
                    other => SinkError::from(other),
                })?;
                self.wal = Some(wal);
                self.state = State::WalCreated;
                Ok(StepOutcome::Continue)
            }
            State::WalCreated => {
                self.wal
                    .as_mut()
                    .expect("WAL opened before WalCreated")
                    .apply(self.storage.as_ref())?;
                self.state = State::WalApplied;
                Ok(StepOutcome::Continue)
            }
            State::WalApplied => {
                self.wal
                    .as_mut()
                    .expect("WAL opened before WalApplied")
                    .truncate()?;
                self.state = State::WalTruncated;
                Ok(StepOutcome::Continue)
            }
            State::WalTruncated => {
                let dir = self.partition.dir(&self.settings.root, &self.settings.topics_dir);
                let names = self.storage.list_status(&dir, &naming::committed_filter)?;
                self.high_water = names
                    .iter()
                    .filter_map(|n| naming::parse_committed(n))
                    .map(|(_, end)| end)
                    .max();
                let next_offset = self.high_water.map(|h| h + 1).unwrap_or(0);
                self.upstream.seek(&self.partition, next_offset);
                self.state = State::OffsetReset;
                Ok(StepOutcome::Continue)
            }
            State::OffsetReset => {
                self.upstream.resume(&self.partition)?;
                self.recovered = true;
                self.state = State::WriteStarted;
                Ok(StepOutcome::Continue)
            }
            State::WriteStarted => {
                if self.buffer.is_empty() {
                    return Ok(StepOutcome::Blocked);
                }
                self.upstream.pause(&self.partition)?;
                self.state = State::WritePartitionPaused;
                Ok(StepOutcome::Continue)
            }
            State::WritePartitionPaused => {
                if self.buffer.is_empty() {
                    self.upstream.resume(&self.partition)?;
                    self.state = State::WriteStarted;
                    return Ok(StepOutcome::Continue);
                }
                if self.writer.is_none() {
                    let temp = naming::temp_path(&self.settings.root, &self.settings.topics_dir, &self.partition);
                    let first = self.buffer.front().expect("checked non-empty above");
                    if self.high_water.is_none() {
                        self.pending_start = Some(first.offset);
                    }
                    let writer = self
                        .writer_provider
                        .new_writer(self.storage.as_ref(), &temp, first)?;
                    self.writer = Some(writer);
                    self.temp_name = Some(temp);
                }
                let record = self.buffer.pop_front().expect("checked non-empty above");
                self.writer
                    .as_mut()
                    .expect("writer opened above")
                    .write(record.timestamp_millis, &record)?;
                self.records_in_temp += 1;
                if self.records_in_temp >= self.settings.flush_size {
                    self.state = State::ShouldRotate;
                }
                Ok(StepOutcome::Continue)
            }
            State::ShouldRotate => {
                self.writer
                    .as_mut()
                    .expect("rotation only triggered with an open writer")
                    .close()?;
                self.writer = None;
                self.state = State::TempFileClosed;
                Ok(StepOutcome::Continue)
            }
            State::TempFileClosed => {
                self.pending_commit = Some(self.compute_pending_commit());
                self.state = State::WalAppended;
                // Fall through is split across two states (spec §4.5): this
                // one appends the intent, the next performs the rename.
                let (temp, final_path, _end) = self
                    .pending_commit
                    .clone()
                    .expect("just set above");
                self.wal
                    .as_mut()
                    .expect("WAL open for the whole write sub-machine")
                    .append(
                        temp.to_str().expect("temp path is valid utf-8"),
                        final_path.to_str().expect("final path is valid utf-8"),
                    )?;
                Ok(StepOutcome::Continue)
            }
            State::WalAppended => {
                let (temp, final_path, end) = self
                    .pending_commit
                    .clone()
                    .expect("WalAppended reached without a pending commit");
                self.storage.commit(&temp, &final_path)?;
                self.high_water = Some(end);
                self.pending_start = None;
                self.records_in_temp = 0;
                self.temp_name = None;
                self.pending_commit = None;
                self.state = State::FileCommitted;
                Ok(StepOutcome::Continue)
            }
            State::FileCommitted => {
                self.state = State::WritePartitionPaused;
                Ok(StepOutcome::Continue)
            }
        }
    }

    fn compute_pending_commit(&self) -> (PathBuf, PathBuf, u64) {
        let start = match self.high_water {
            Some(hw) => hw + 1,
            None => self.pending_start.expect("set when the current temp was opened"),
        };
        let end = start + self.records_in_temp as u64 - 1;
        let final_path = naming::committed_path(
            &self.settings.root,
            &self.settings.topics_dir,
            &self.partition,
            start,
            end,
            self.writer_provider.extension(),
        );
        let temp = self.temp_name.clone().expect("temp file open while rotating");
        (temp, final_path, end)
    }

    /// Best-effort teardown, used both on revocation and from
    /// [`crate::coordinator::Coordinator::close`] (spec §4.5, §4.6): if a
    /// writer is open, close it, append the WAL intent, and commit whatever
    /// range was in flight, then release the WAL lease. Errors are
    /// returned (rather than swallowed here) so the caller can decide
    /// whether to log-and-drop (revocation) or aggregate (`close`).
    pub fn finalize(&mut self) -> Result<(), SinkError> {
        let mut first_error = None;

        if self.writer.is_some() {
            if let Err(e) = self.finalize_open_writer() {
                first_error = Some(e);
            }
        }

        if let Some(mut wal) = self.wal.take() {
            if let Err(e) = wal.close() {
                if first_error.is_none() {
                    first_error = Some(e.into());
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn finalize_open_writer(&mut self) -> Result<(), SinkError> {
        let mut writer = self.writer.take().expect("caller checked writer is Some");
        writer.close()?;
        let (temp, final_path, end) = self.compute_pending_commit();
        self.wal
            .as_mut()
            .expect("writer cannot be open without an open WAL")
            .append(
                temp.to_str().expect("temp path is valid utf-8"),
                final_path.to_str().expect("final path is valid utf-8"),
            )?;
        self.storage.commit(&temp, &final_path)?;
        self.high_water = Some(end);
        self.pending_start = None;
        self.records_in_temp = 0;
        self.temp_name = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_writer::JsonLinesWriterProvider;
    use crate::storage::LocalFsStorage;
    use crate::upstream::mock::MockUpstream;
    use serde_json::json;
    use tempfile::tempdir;

    fn settings(root: &std::path::Path, flush_size: usize) -> PartitionSettings {
        PartitionSettings {
            root: root.to_path_buf(),
            topics_dir: "topics".into(),
            flush_size,
            retry_backoff_ms: 1_000,
        }
    }

    fn record(offset: u64) -> Record {
        Record {
            offset,
            timestamp_millis: offset as i64,
            payload: json!({"offset": offset}),
        }
    }

    fn new_runtime(
        root: &std::path::Path,
        partition: Partition,
        flush_size: usize,
    ) -> (PartitionRuntime, Arc<MockUpstream>) {
        let storage: Arc<dyn Storage> = Arc::new(LocalFsStorage::new(root, "topics"));
        let provider: Arc<dyn RecordWriterProvider> = Arc::new(JsonLinesWriterProvider);
        let upstream = Arc::new(MockUpstream::new([partition.clone()]));
        let runtime = PartitionRuntime::new(
            partition,
            storage,
            provider,
            upstream.clone(),
            settings(root, flush_size),
        );
        (runtime, upstream)
    }

    fn committed_files(root: &std::path::Path, partition: &Partition) -> Vec<String> {
        let dir = partition.dir(root, "topics");
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .map(|it| {
                it.filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .filter(|n| naming::committed_filter(n))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn happy_path_rotates_at_flush_size() {
        let dir = tempdir().unwrap();
        let p = Partition::new("orders", 0);
        let (mut rt, _upstream) = new_runtime(dir.path(), p.clone(), 3);

        for offset in 10..=15 {
            rt.push(record(offset));
        }
        rt.execute().unwrap();

        let files = committed_files(dir.path(), &p);
        assert_eq!(files, vec!["orders+0+10+12.jsonl", "orders+0+13+15.jsonl"]);
        assert_eq!(rt.committed_offset(), Some(16));
    }

    #[test]
    fn partial_batch_leaves_the_temp_artifact_open() {
        let dir = tempdir().unwrap();
        let p = Partition::new("orders", 0);
        let (mut rt, _upstream) = new_runtime(dir.path(), p.clone(), 2);

        rt.push(record(0));
        rt.execute().unwrap();
        assert!(committed_files(dir.path(), &p).is_empty());
        assert_eq!(rt.committed_offset(), None);

        rt.push(record(1));
        rt.execute().unwrap();
        assert_eq!(committed_files(dir.path(), &p), vec!["orders+0+0+1.jsonl"]);
        assert_eq!(rt.committed_offset(), Some(2));

        rt.push(record(2));
        rt.execute().unwrap();
        assert_eq!(committed_files(dir.path(), &p), vec!["orders+0+0+1.jsonl"]);
        assert_eq!(rt.committed_offset(), Some(2));
    }

    #[test]
    fn flush_size_one_commits_every_record() {
        let dir = tempdir().unwrap();
        let p = Partition::new("orders", 0);
        let (mut rt, _upstream) = new_runtime(dir.path(), p.clone(), 1);

        rt.push(record(5));
        rt.push(record(6));
        rt.execute().unwrap();

        assert_eq!(
            committed_files(dir.path(), &p),
            vec!["orders+0+5+5.jsonl", "orders+0+6+6.jsonl"]
        );
    }

    #[test]
    fn recovery_reads_high_water_from_existing_committed_files() {
        let dir = tempdir().unwrap();
        let p = Partition::new("orders", 0);
        let pdir = p.dir(dir.path(), "topics");
        std::fs::create_dir_all(&pdir).unwrap();
        std::fs::write(pdir.join("orders+0+0+9.jsonl"), b"").unwrap();

        let (mut rt, upstream) = new_runtime(dir.path(), p.clone(), 5);
        rt.push(record(10));
        rt.push(record(11));
        rt.push(record(12));
        rt.push(record(13));
        rt.push(record(14));
        rt.execute().unwrap();

        assert_eq!(
            committed_files(dir.path(), &p),
            vec!["orders+0+0+9.jsonl", "orders+0+10+14.jsonl"]
        );
        assert!(upstream
            .calls()
            .contains(&crate::upstream::mock::Call::Seek(p, 10)));
    }

    #[test]
    fn redelivered_records_already_committed_are_deduplicated() {
        let dir = tempdir().unwrap();
        let p = Partition::new("orders", 0);
        let (mut rt, _upstream) = new_runtime(dir.path(), p.clone(), 3);

        rt.push(record(10));
        rt.push(record(11));
        rt.push(record(12));
        rt.execute().unwrap();
        assert_eq!(rt.committed_offset(), Some(13));

        // The upstream redelivers 11 and 12 alongside new offsets.
        rt.push(record(11));
        rt.push(record(12));
        rt.push(record(13));
        rt.execute().unwrap();

        assert_eq!(committed_files(dir.path(), &p), vec!["orders+0+10+12.jsonl"]);
        assert_eq!(rt.committed_offset(), Some(13));
    }

    #[test]
    fn revocation_mid_drain_commits_the_open_temp() {
        let dir = tempdir().unwrap();
        let p = Partition::new("orders", 0);
        let (mut rt, _upstream) = new_runtime(dir.path(), p.clone(), 10);

        rt.push(record(0));
        rt.push(record(1));
        rt.execute().unwrap();
        assert!(committed_files(dir.path(), &p).is_empty());

        rt.finalize().unwrap();
        assert_eq!(committed_files(dir.path(), &p), vec!["orders+0+0+1.jsonl"]);
    }

    /// A [`Storage`] decorator that fails a fixed number of `commit` calls
    /// before delegating to the real backend, for exercising the retry path
    /// (spec §8, seed test 5) without a conditional branch in production
    /// code.
    struct FlakyStorage {
        inner: LocalFsStorage,
        commit_failures_remaining: parking_lot::Mutex<usize>,
    }

    impl FlakyStorage {
        fn new(inner: LocalFsStorage, fail_commits: usize) -> Self {
            Self {
                inner,
                commit_failures_remaining: parking_lot::Mutex::new(fail_commits),
            }
        }
    }

    impl Storage for FlakyStorage {
        fn exists(&self, path: &std::path::Path) -> Result<bool, crate::error::StorageError> {
            self.inner.exists(path)
        }

        fn mkdirs(&self, path: &std::path::Path) -> Result<(), crate::error::StorageError> {
            self.inner.mkdirs(path)
        }

        fn list_status(
            &self,
            dir: &std::path::Path,
            filter: &dyn Fn(&str) -> bool,
        ) -> Result<Vec<String>, crate::error::StorageError> {
            self.inner.list_status(dir, filter)
        }

        fn create(&self, path: &std::path::Path) -> Result<Box<dyn std::io::Write + Send>, crate::error::StorageError> {
            self.inner.create(path)
        }

        fn open_read(&self, path: &std::path::Path) -> Result<Box<dyn std::io::Read + Send>, crate::error::StorageError> {
            self.inner.open_read(path)
        }

        fn commit(&self, temp: &std::path::Path, final_path: &std::path::Path) -> Result<(), crate::error::StorageError> {
            let mut remaining = self.commit_failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(crate::error::StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected commit failure",
                )));
            }
            drop(remaining);
            self.inner.commit(temp, final_path)
        }

        fn delete(&self, path: &std::path::Path) -> Result<(), crate::error::StorageError> {
            self.inner.delete(path)
        }

        fn open_wal(&self, partition: &Partition) -> Result<Box<dyn Wal>, crate::error::WalError> {
            self.inner.open_wal(partition)
        }

        fn close(&self) -> Result<(), crate::error::StorageError> {
            self.inner.close()
        }
    }

    #[test]
    fn transient_commit_failure_retries_from_wal_appended() {
        let dir = tempdir().unwrap();
        let p = Partition::new("orders", 0);
        let storage: Arc<dyn Storage> = Arc::new(FlakyStorage::new(LocalFsStorage::new(dir.path(), "topics"), 1));
        let provider: Arc<dyn RecordWriterProvider> = Arc::new(JsonLinesWriterProvider);
        let upstream = Arc::new(MockUpstream::new([p.clone()]));
        let mut rt = PartitionRuntime::new(p.clone(), storage, provider, upstream.clone(), settings(dir.path(), 1));

        rt.push(record(0));
        let result = rt.execute();
        assert!(result.is_err());
        assert_eq!(rt.state, State::WalAppended);
        assert!(rt.failure_time.is_some());
        assert!(upstream
            .calls()
            .iter()
            .any(|c| matches!(c, crate::upstream::mock::Call::Backoff(_))));
        assert!(committed_files(dir.path(), &p).is_empty());

        // The fault only fires once; a retry after backoff advances past it.
        let result = rt.execute();
        assert!(result.is_ok());
        assert_eq!(committed_files(dir.path(), &p), vec!["orders+0+0+0.jsonl"]);
        assert_eq!(rt.committed_offset(), Some(1));
    }

    #[test]
    fn recovery_replays_a_wal_entry_whose_rename_never_happened() {
        let dir = tempdir().unwrap();
        let p = Partition::new("orders", 0);
        let pdir = p.dir(dir.path(), "topics");
        std::fs::create_dir_all(&pdir).unwrap();

        let temp = pdir.join("crashed.tmp");
        std::fs::write(&temp, b"{\"offset\":100}\n").unwrap();
        let final_path = naming::committed_path(dir.path(), "topics", &p, 100, 104, "jsonl");

        {
            let mut wal = crate::wal::FileWal::open(pdir.join("wal.log"), pdir.join("wal.lock")).unwrap();
            wal.append(temp.to_str().unwrap(), final_path.to_str().unwrap()).unwrap();
            // Process "crashes" here: no truncate, no rename yet.
        }

        let (mut rt, upstream) = new_runtime(dir.path(), p.clone(), 5);
        rt.execute().unwrap();

        assert!(!temp.exists());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"{\"offset\":100}\n");
        assert_eq!(committed_files(dir.path(), &p), vec!["orders+0+100+104.jsonl"]);
        assert_eq!(std::fs::metadata(pdir.join("wal.log")).unwrap().len(), 0);
        assert_eq!(rt.committed_offset(), Some(105));
        assert!(upstream
            .calls()
            .contains(&crate::upstream::mock::Call::Seek(p, 105)));
    }

    #[test]
    fn recovery_replays_a_wal_entry_whose_rename_already_happened() {
        let dir = tempdir().unwrap();
        let p = Partition::new("orders", 0);
        let pdir = p.dir(dir.path(), "topics");
        std::fs::create_dir_all(&pdir).unwrap();

        let final_path = naming::committed_path(dir.path(), "topics", &p, 200, 204, "jsonl");
        std::fs::write(&final_path, b"{\"offset\":200}\n").unwrap();
        // The temp this WAL entry names was already renamed away before the crash.
        let temp = pdir.join("already-gone.tmp");

        {
            let mut wal = crate::wal::FileWal::open(pdir.join("wal.log"), pdir.join("wal.lock")).unwrap();
            wal.append(temp.to_str().unwrap(), final_path.to_str().unwrap()).unwrap();
        }

        let (mut rt, _upstream) = new_runtime(dir.path(), p.clone(), 5);
        rt.execute().unwrap();

        assert_eq!(committed_files(dir.path(), &p), vec!["orders+0+200+204.jsonl"]);
        assert_eq!(std::fs::read(&final_path).unwrap(), b"{\"offset\":200}\n");
        assert_eq!(std::fs::metadata(pdir.join("wal.log")).unwrap().len(), 0);
        assert_eq!(rt.committed_offset(), Some(205));
    }
}
