/// Durable operation log and snapshots
///
/// The log is append-only JSON lines, synced after every append. Snapshots
/// are written to a temporary file and renamed into place; the previous one
/// is kept so a damaged snapshot can be recovered from.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use replica::{Operation, ProjectId};

use crate::{CollaborationError, Result};

const SNAPSHOT_MAGIC: &[u8; 4] = b"CSNP";
const HEADER_LEN: usize = 4 + 8 + 8;

/// Log position a snapshot covers: records with `seq` below it are included
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub id: SnapshotId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: u64,
    pub path: String,
    pub operation: Operation,
}

/// Records read back from the log
#[derive(Debug, Clone, Default)]
pub struct LogReplay {
    pub records: Vec<LogRecord>,
    /// Unreadable records other than a torn final line
    pub corrupt: usize,
}

/// Whether local changes may be made durable
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OperatingMode {
    #[default]
    ReadWrite,
    ReadOnly { reason: String },
}

impl OperatingMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly { .. })
    }
}

/// Durable storage for a project's operations and snapshots
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Append one applied operation; durable when this returns
    async fn append_operation(&self, project: ProjectId, path: &str, op: &Operation) -> Result<()>;

    /// Position the next appended record will take
    async fn log_position(&self, project: ProjectId) -> Result<SnapshotId>;

    /// Store a snapshot covering the log up to `covers`
    async fn save_snapshot(&self, project: ProjectId, covers: SnapshotId, bytes: &[u8]) -> Result<SnapshotId>;

    /// Readable snapshots, newest first
    async fn load_snapshots(&self, project: ProjectId) -> Result<Vec<StoredSnapshot>>;

    /// Log records at or after `since` (all records for `None`)
    async fn load_operations_since(&self, project: ProjectId, since: Option<SnapshotId>) -> Result<LogReplay>;

    async fn load_snapshot(&self, project: ProjectId) -> Result<Option<StoredSnapshot>> {
        Ok(self.load_snapshots(project).await?.into_iter().next())
    }
}

fn persistence_error(context: &str, e: impl std::fmt::Display) -> CollaborationError {
    CollaborationError::Persistence(format!("{}: {}", context, e))
}

/// File-backed store, one directory per project
pub struct FileStore {
    root: PathBuf,
    positions: tokio::sync::Mutex<HashMap<ProjectId, u64>>,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            positions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn project_dir(&self, project: ProjectId) -> PathBuf {
        self.root.join(project.0.to_string())
    }

    fn log_file(&self, project: ProjectId) -> PathBuf {
        self.project_dir(project).join("ops.jsonl")
    }

    fn snapshot_file(&self, project: ProjectId) -> PathBuf {
        self.project_dir(project).join("snapshot.bin")
    }

    fn previous_snapshot_file(&self, project: ProjectId) -> PathBuf {
        self.project_dir(project).join("snapshot.prev.bin")
    }

    /// Next sequence number, scanning the log on first use.
    /// A torn final line is cut off so later appends start cleanly.
    async fn next_seq(&self, project: ProjectId, positions: &mut HashMap<ProjectId, u64>) -> Result<u64> {
        if let Some(seq) = positions.get(&project) {
            return Ok(*seq);
        }

        let path = self.log_file(project);
        let mut next = 0;
        if fs::try_exists(&path).await.unwrap_or(false) {
            let raw = fs::read(&path)
                .await
                .map_err(|e| persistence_error("Failed to read operation log", e))?;
            let complete = match raw.iter().rposition(|b| *b == b'\n') {
                Some(idx) => idx + 1,
                None => 0,
            };
            if complete < raw.len() {
                warn!(project = %project, bytes = raw.len() - complete, "truncating torn log record");
                let file = fs::OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .await
                    .map_err(|e| persistence_error("Failed to open operation log", e))?;
                file.set_len(complete as u64)
                    .await
                    .map_err(|e| persistence_error("Failed to truncate operation log", e))?;
                file.sync_all()
                    .await
                    .map_err(|e| persistence_error("Failed to sync operation log", e))?;
            }
            let (records, _) = parse_log(&raw[..complete]);
            next = records.iter().map(|r| r.seq + 1).max().unwrap_or(0);
        }

        positions.insert(project, next);
        Ok(next)
    }

    async fn read_snapshot(path: &Path) -> Option<StoredSnapshot> {
        let raw = fs::read(path).await.ok()?;
        match decode_snapshot(&raw) {
            Some(snapshot) => Some(snapshot),
            None => {
                warn!(path = %path.display(), "ignoring damaged snapshot");
                None
            }
        }
    }
}

#[async_trait]
impl PersistenceStore for FileStore {
    async fn append_operation(&self, project: ProjectId, path: &str, op: &Operation) -> Result<()> {
        let mut positions = self.positions.lock().await;
        let seq = self.next_seq(project, &mut positions).await?;

        let record = LogRecord {
            seq,
            path: path.to_string(),
            operation: op.clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        fs::create_dir_all(self.project_dir(project))
            .await
            .map_err(|e| persistence_error("Failed to create project directory", e))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file(project))
            .await
            .map_err(|e| persistence_error("Failed to open operation log", e))?;
        file.write_all(&line)
            .await
            .map_err(|e| persistence_error("Failed to append operation", e))?;
        file.sync_data()
            .await
            .map_err(|e| persistence_error("Failed to sync operation log", e))?;

        positions.insert(project, seq + 1);
        Ok(())
    }

    async fn log_position(&self, project: ProjectId) -> Result<SnapshotId> {
        let mut positions = self.positions.lock().await;
        Ok(SnapshotId(self.next_seq(project, &mut positions).await?))
    }

    async fn save_snapshot(&self, project: ProjectId, covers: SnapshotId, bytes: &[u8]) -> Result<SnapshotId> {
        let dir = self.project_dir(project);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| persistence_error("Failed to create project directory", e))?;

        let tmp = dir.join("snapshot.tmp");
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| persistence_error("Failed to create snapshot", e))?;
        file.write_all(&encode_snapshot(covers, bytes))
            .await
            .map_err(|e| persistence_error("Failed to write snapshot", e))?;
        file.sync_all()
            .await
            .map_err(|e| persistence_error("Failed to sync snapshot", e))?;

        let current = self.snapshot_file(project);
        if fs::try_exists(&current).await.unwrap_or(false) {
            fs::rename(&current, self.previous_snapshot_file(project))
                .await
                .map_err(|e| persistence_error("Failed to rotate snapshot", e))?;
        }
        fs::rename(&tmp, &current)
            .await
            .map_err(|e| persistence_error("Failed to install snapshot", e))?;

        debug!(project = %project, covers = covers.0, bytes = bytes.len(), "saved snapshot");
        Ok(covers)
    }

    async fn load_snapshots(&self, project: ProjectId) -> Result<Vec<StoredSnapshot>> {
        let mut snapshots = Vec::new();
        for path in [self.snapshot_file(project), self.previous_snapshot_file(project)] {
            if let Some(snapshot) = Self::read_snapshot(&path).await {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn load_operations_since(&self, project: ProjectId, since: Option<SnapshotId>) -> Result<LogReplay> {
        let path = self.log_file(project);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(LogReplay::default());
        }

        let raw = fs::read(&path)
            .await
            .map_err(|e| persistence_error("Failed to read operation log", e))?;
        let (mut records, corrupt) = parse_log(&raw);
        if corrupt > 0 {
            warn!(project = %project, corrupt, "operation log has unreadable records");
        }

        let floor = since.map(|s| s.0).unwrap_or(0);
        records.retain(|r| r.seq >= floor);
        Ok(LogReplay { records, corrupt })
    }
}

/// Parse log lines. An unterminated final line is a torn write and is
/// dropped without counting as corruption.
fn parse_log(raw: &[u8]) -> (Vec<LogRecord>, usize) {
    let terminated = raw.last().map(|b| *b == b'\n').unwrap_or(true);
    let lines: Vec<&[u8]> = raw.split(|b| *b == b'\n').collect();
    let last = lines.len().saturating_sub(1);

    let mut records = Vec::new();
    let mut corrupt = 0;
    for (idx, line) in lines.into_iter().enumerate() {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match serde_json::from_slice::<LogRecord>(line) {
            Ok(record) => records.push(record),
            Err(_) if idx == last && !terminated => {
                warn!("dropping torn log record");
            }
            Err(_) => corrupt += 1,
        }
    }
    (records, corrupt)
}

fn encode_snapshot(covers: SnapshotId, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + bytes.len());
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(&covers.0.to_le_bytes());
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

fn decode_snapshot(raw: &[u8]) -> Option<StoredSnapshot> {
    if raw.len() < HEADER_LEN || &raw[..4] != SNAPSHOT_MAGIC {
        return None;
    }
    let covers = u64::from_le_bytes(raw[4..12].try_into().ok()?);
    let len = u64::from_le_bytes(raw[12..20].try_into().ok()?) as usize;
    let body = &raw[HEADER_LEN..];
    if body.len() != len {
        return None;
    }
    Some(StoredSnapshot {
        id: SnapshotId(covers),
        bytes: body.to_vec(),
    })
}

#[derive(Debug, Default)]
struct MemoryLog {
    records: Vec<LogRecord>,
    snapshots: Vec<StoredSnapshot>,
}

/// In-memory store for tests and ephemeral peers
#[derive(Debug, Default)]
pub struct MemoryStore {
    projects: parking_lot::Mutex<HashMap<ProjectId, MemoryLog>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, as a full or broken disk would
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn record_count(&self, project: ProjectId) -> usize {
        self.projects
            .lock()
            .get(&project)
            .map(|log| log.records.len())
            .unwrap_or(0)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CollaborationError::Persistence("write failed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn append_operation(&self, project: ProjectId, path: &str, op: &Operation) -> Result<()> {
        self.check_writable()?;
        let mut projects = self.projects.lock();
        let log = projects.entry(project).or_default();
        let seq = log.records.len() as u64;
        log.records.push(LogRecord {
            seq,
            path: path.to_string(),
            operation: op.clone(),
        });
        Ok(())
    }

    async fn log_position(&self, project: ProjectId) -> Result<SnapshotId> {
        Ok(SnapshotId(self.record_count(project) as u64))
    }

    async fn save_snapshot(&self, project: ProjectId, covers: SnapshotId, bytes: &[u8]) -> Result<SnapshotId> {
        self.check_writable()?;
        let mut projects = self.projects.lock();
        let log = projects.entry(project).or_default();
        log.snapshots.insert(
            0,
            StoredSnapshot {
                id: covers,
                bytes: bytes.to_vec(),
            },
        );
        log.snapshots.truncate(2);
        Ok(covers)
    }

    async fn load_snapshots(&self, project: ProjectId) -> Result<Vec<StoredSnapshot>> {
        Ok(self
            .projects
            .lock()
            .get(&project)
            .map(|log| log.snapshots.clone())
            .unwrap_or_default())
    }

    async fn load_operations_since(&self, project: ProjectId, since: Option<SnapshotId>) -> Result<LogReplay> {
        let floor = since.map(|s| s.0).unwrap_or(0);
        let records = self
            .projects
            .lock()
            .get(&project)
            .map(|log| log.records.iter().filter(|r| r.seq >= floor).cloned().collect())
            .unwrap_or_default();
        Ok(LogReplay { records, corrupt: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica::{ActorId, LocalEdit, ReplicatedDocument};

    fn ops(n: usize) -> Vec<Operation> {
        let mut doc = ReplicatedDocument::new("src/lib.rs", ActorId::new());
        (0..n)
            .map(|i| doc.create_local_operation(LocalEdit::insert(i, "a")).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_file_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let project = ProjectId::new();

        for op in ops(3) {
            store.append_operation(project, "src/lib.rs", &op).await.unwrap();
        }

        let replay = store.load_operations_since(project, None).await.unwrap();
        assert_eq!(replay.records.len(), 3);
        assert_eq!(replay.corrupt, 0);
        assert_eq!(store.log_position(project).await.unwrap(), SnapshotId(3));

        let tail = store
            .load_operations_since(project, Some(SnapshotId(2)))
            .await
            .unwrap();
        assert_eq!(tail.records.len(), 1);
        assert_eq!(tail.records[0].seq, 2);
    }

    #[tokio::test]
    async fn test_torn_tail_is_dropped_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let project = ProjectId::new();
        let ops = ops(2);

        {
            let store = FileStore::new(dir.path());
            store.append_operation(project, "src/lib.rs", &ops[0]).await.unwrap();
        }
        let log = dir.path().join(project.0.to_string()).join("ops.jsonl");
        let mut raw = std::fs::read(&log).unwrap();
        raw.extend_from_slice(b"{\"seq\":1,\"path\":\"src/li");
        std::fs::write(&log, raw).unwrap();

        let store = FileStore::new(dir.path());
        let replay = store.load_operations_since(project, None).await.unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.corrupt, 0);

        store.append_operation(project, "src/lib.rs", &ops[1]).await.unwrap();
        let replay = store.load_operations_since(project, None).await.unwrap();
        assert_eq!(replay.records.len(), 2);
        assert_eq!(replay.corrupt, 0);
    }

    #[tokio::test]
    async fn test_corrupt_middle_record_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let project = ProjectId::new();
        store.append_operation(project, "a", &ops(1)[0]).await.unwrap();

        let log = dir.path().join(project.0.to_string()).join("ops.jsonl");
        let mut raw = b"not json\n".to_vec();
        raw.extend(std::fs::read(&log).unwrap());
        std::fs::write(&log, raw).unwrap();

        let replay = store.load_operations_since(project, None).await.unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.corrupt, 1);
    }

    #[tokio::test]
    async fn test_snapshot_rotation_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let project = ProjectId::new();

        store.save_snapshot(project, SnapshotId(1), b"first").await.unwrap();
        store.save_snapshot(project, SnapshotId(4), b"second").await.unwrap();

        let snapshots = store.load_snapshots(project).await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].bytes, b"second");
        assert_eq!(snapshots[1].id, SnapshotId(1));

        let current = dir.path().join(project.0.to_string()).join("snapshot.bin");
        std::fs::write(&current, b"CSNP garbage").unwrap();

        let latest = store.load_snapshot(project).await.unwrap().unwrap();
        assert_eq!(latest.bytes, b"first");
    }

    #[tokio::test]
    async fn test_memory_store_write_failure() {
        let store = MemoryStore::new();
        let project = ProjectId::new();
        let op = &ops(1)[0];

        store.append_operation(project, "a", op).await.unwrap();
        store.set_fail_writes(true);
        assert!(matches!(
            store.append_operation(project, "a", op).await,
            Err(CollaborationError::Persistence(_))
        ));
        assert_eq!(store.record_count(project), 1);
    }
}
