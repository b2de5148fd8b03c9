//! Durable checkpoint storage and the ordered background writer.
//!
//! A store keeps the highest-sequence [`Checkpoint`] per execution and a
//! lease that serialises recovery attempts. The executor never writes to a
//! store directly; it hands snapshots to a [`CheckpointWriter`], which saves
//! them in submission order off the scheduling loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::{Checkpoint, CheckpointError, EventBus, ExecutionEvent, ExecutionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `checkpoint` atomically. A checkpoint older than the stored
    /// one is ignored.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load_latest(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Try to become the only recovery owner of `execution_id`.
    async fn acquire_lease(
        &self,
        execution_id: ExecutionId,
        owner: Uuid,
    ) -> Result<bool, CheckpointError>;

    /// Refresh a lease this owner holds. Returns false if it was lost.
    async fn renew_lease(
        &self,
        execution_id: ExecutionId,
        owner: Uuid,
    ) -> Result<bool, CheckpointError> {
        self.acquire_lease(execution_id, owner).await
    }

    /// Give up a lease. Releasing a lease held by another owner does nothing.
    async fn release_lease(&self, execution_id: ExecutionId, owner: Uuid)
        -> Result<(), CheckpointError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<ExecutionId, Checkpoint>>,
    leases: Mutex<HashMap<ExecutionId, Uuid>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.write().await;
        let newer = checkpoints
            .get(&checkpoint.execution_id)
            .map_or(true, |existing| checkpoint.sequence > existing.sequence);
        if newer {
            checkpoints.insert(checkpoint.execution_id, checkpoint.clone());
        }
        Ok(())
    }

    async fn load_latest(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.read().await.get(&execution_id).cloned())
    }

    async fn acquire_lease(
        &self,
        execution_id: ExecutionId,
        owner: Uuid,
    ) -> Result<bool, CheckpointError> {
        let mut leases = self.leases.lock().await;
        match leases.get(&execution_id) {
            Some(holder) => Ok(*holder == owner),
            None => {
                leases.insert(execution_id, owner);
                Ok(true)
            }
        }
    }

    async fn release_lease(
        &self,
        execution_id: ExecutionId,
        owner: Uuid,
    ) -> Result<(), CheckpointError> {
        let mut leases = self.leases.lock().await;
        if leases.get(&execution_id) == Some(&owner) {
            leases.remove(&execution_id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Contents of a lease file.
#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    owner: Uuid,
    renewed_at: DateTime<Utc>,
}

/// One JSON file per execution, replaced by write-then-rename.
///
/// Leases are lock files created exclusively and stamped with their last
/// renewal. A lease not renewed within the TTL, or one that cannot be read,
/// belongs to a dead process and is broken by the next acquirer.
pub struct FileCheckpointStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
    lease_ttl: Duration,
}

impl FileCheckpointStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            lease_ttl: DEFAULT_LEASE_TTL,
        })
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn checkpoint_path(&self, execution_id: ExecutionId) -> PathBuf {
        self.dir.join(format!("{execution_id}.json"))
    }

    fn lease_path(&self, execution_id: ExecutionId) -> PathBuf {
        self.dir.join(format!("{execution_id}.lease"))
    }

    async fn read_lease(&self, path: &Path) -> Result<Option<LeaseRecord>, CheckpointError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn expired(&self, lease: &LeaseRecord) -> bool {
        (Utc::now() - lease.renewed_at)
            .to_std()
            .is_ok_and(|age| age > self.lease_ttl)
    }

    /// Write the lease beside `path`, then link it into place. Fails with
    /// `AlreadyExists` if another owner got there first.
    async fn create_lease(&self, path: &Path, record: &LeaseRecord) -> std::io::Result<()> {
        let tmp = path.with_extension(format!("lease.{}", record.owner));
        tokio::fs::write(&tmp, serde_json::to_vec(record)?).await?;
        let linked = tokio::fs::hard_link(&tmp, path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        linked
    }

    async fn replace_lease(&self, path: &Path, record: &LeaseRecord) -> Result<(), CheckpointError> {
        let tmp = path.with_extension(format!("lease.{}", record.owner));
        tokio::fs::write(&tmp, serde_json::to_vec(record)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        let path = self.checkpoint_path(checkpoint.execution_id);

        if let Some(existing) = self.read(&path).await? {
            if existing.sequence >= checkpoint.sequence {
                tracing::debug!(
                    execution_id = %checkpoint.execution_id,
                    stored = existing.sequence,
                    offered = checkpoint.sequence,
                    "ignoring stale checkpoint"
                );
                return Ok(());
            }
        }

        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_latest(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        self.read(&self.checkpoint_path(execution_id)).await
    }

    async fn acquire_lease(
        &self,
        execution_id: ExecutionId,
        owner: Uuid,
    ) -> Result<bool, CheckpointError> {
        let path = self.lease_path(execution_id);
        let record = LeaseRecord {
            owner,
            renewed_at: Utc::now(),
        };
        // A second attempt follows breaking a stale lease.
        for _ in 0..2 {
            match self.create_lease(&path, &record).await {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            match self.read_lease(&path).await? {
                Some(held) if held.owner == owner => {
                    self.replace_lease(&path, &record).await?;
                    return Ok(true);
                }
                Some(held) if !self.expired(&held) => return Ok(false),
                held => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        holder = ?held.map(|h| h.owner),
                        "Breaking stale recovery lease"
                    );
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(false)
    }

    async fn release_lease(
        &self,
        execution_id: ExecutionId,
        owner: Uuid,
    ) -> Result<(), CheckpointError> {
        let path = self.lease_path(execution_id);
        match self.read_lease(&path).await? {
            Some(held) if held.owner == owner => match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Ordered writer
// ---------------------------------------------------------------------------

enum Command {
    Save(Box<Checkpoint>),
    Flush(oneshot::Sender<Result<(), CheckpointError>>),
}

/// Background task that saves checkpoints one at a time, in the order they
/// were submitted.
pub struct CheckpointWriter {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    last_saved: Arc<AtomicU64>,
}

impl CheckpointWriter {
    pub fn spawn(store: Arc<dyn CheckpointStore>, events: EventBus) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let last_saved = Arc::new(AtomicU64::new(0));
        let saved = last_saved.clone();
        let task = tokio::spawn(async move {
            let mut failure: Option<CheckpointError> = None;
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Save(checkpoint) => match store.save(&checkpoint).await {
                        Ok(()) => {
                            saved.fetch_max(checkpoint.sequence, Ordering::SeqCst);
                            tracing::debug!(
                                execution_id = %checkpoint.execution_id,
                                sequence = checkpoint.sequence,
                                "checkpoint saved"
                            );
                            events.emit(ExecutionEvent::CheckpointSaved {
                                execution_id: checkpoint.execution_id,
                                sequence: checkpoint.sequence,
                                timestamp: Utc::now(),
                            });
                        }
                        Err(e) => {
                            tracing::error!(
                                execution_id = %checkpoint.execution_id,
                                sequence = checkpoint.sequence,
                                "checkpoint save failed: {}",
                                e
                            );
                            failure.get_or_insert(e);
                        }
                    },
                    Command::Flush(reply) => {
                        let _ = reply.send(failure.take().map_or(Ok(()), Err));
                    }
                }
            }
        });
        Self {
            tx,
            task,
            last_saved,
        }
    }

    /// Highest sequence stored so far. Exact after [`flush`](Self::flush).
    pub fn last_saved(&self) -> Option<u64> {
        match self.last_saved.load(Ordering::SeqCst) {
            0 => None,
            sequence => Some(sequence),
        }
    }

    pub fn submit(&self, checkpoint: Checkpoint) {
        if self.tx.send(Command::Save(Box::new(checkpoint))).is_err() {
            tracing::warn!("checkpoint writer has stopped, dropping checkpoint");
        }
    }

    /// Wait until everything submitted so far is stored. Reports the first
    /// save error since the previous flush.
    pub async fn flush(&self) -> Result<(), CheckpointError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Flush, then stop the background task.
    pub async fn close(self) -> Result<(), CheckpointError> {
        let result = self.flush().await;
        let Self { tx, task, .. } = self;
        drop(tx);
        let _ = task.await;
        result
    }
}

fn stopped() -> CheckpointError {
    CheckpointError::Storage("checkpoint writer has stopped".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::{Execution, NodeExecution};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn checkpoint(execution: &Execution, sequence: u64) -> Checkpoint {
        let completed: BTreeSet<String> = execution.results.keys().cloned().collect();
        Checkpoint::capture(execution, &completed, sequence)
    }

    fn execution() -> Execution {
        let mut execution = Execution::new(Uuid::new_v4(), json!({"x": 1}));
        let mut a = NodeExecution::ready("a", 1);
        a.succeed(json!({}), json!({"y": 5}), None);
        execution.push_record(a);
        execution
    }

    #[tokio::test]
    async fn memory_store_keeps_highest_sequence() {
        let store = InMemoryCheckpointStore::new();
        let execution = execution();
        store.save(&checkpoint(&execution, 2)).await.unwrap();
        store.save(&checkpoint(&execution, 1)).await.unwrap();

        let latest = store.load_latest(execution.id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert!(store.load_latest(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leases_are_exclusive() {
        let store = InMemoryCheckpointStore::new();
        let id = Uuid::new_v4();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(store.acquire_lease(id, first).await.unwrap());
        assert!(!store.acquire_lease(id, second).await.unwrap());
        store.release_lease(id, second).await.unwrap();
        assert!(!store.acquire_lease(id, second).await.unwrap());
        store.release_lease(id, first).await.unwrap();
        assert!(store.acquire_lease(id, second).await.unwrap());
    }

    #[tokio::test]
    async fn file_store_round_trip_and_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path().join("checkpoints")).await.unwrap();
        let execution = execution();

        store.save(&checkpoint(&execution, 3)).await.unwrap();
        store.save(&checkpoint(&execution, 1)).await.unwrap();
        let latest = store.load_latest(execution.id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 3);
        assert_eq!(latest.node_outputs["a"], json!({"y": 5}));

        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(store.acquire_lease(execution.id, first).await.unwrap());
        assert!(!store.acquire_lease(execution.id, second).await.unwrap());
        store.release_lease(execution.id, first).await.unwrap();
        assert!(store.acquire_lease(execution.id, second).await.unwrap());
    }

    #[tokio::test]
    async fn file_lease_expires_without_renewal() {
        let dir = tempfile::tempdir().unwrap();
        let holder = FileCheckpointStore::open(dir.path())
            .await
            .unwrap()
            .with_lease_ttl(Duration::from_millis(200));
        let other = FileCheckpointStore::open(dir.path())
            .await
            .unwrap()
            .with_lease_ttl(Duration::from_millis(200));
        let id = Uuid::new_v4();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(holder.acquire_lease(id, first).await.unwrap());
        assert!(!other.acquire_lease(id, second).await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(holder.renew_lease(id, first).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!other.acquire_lease(id, second).await.unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(other.acquire_lease(id, second).await.unwrap());
        assert!(!holder.renew_lease(id, first).await.unwrap());

        // The old owner's release leaves the new lease in place.
        holder.release_lease(id, first).await.unwrap();
        assert!(!holder.acquire_lease(id, first).await.unwrap());
    }

    #[tokio::test]
    async fn unreadable_lease_file_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        let id = Uuid::new_v4();
        tokio::fs::write(store.lease_path(id), b"").await.unwrap();

        assert!(store.acquire_lease(id, Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn writer_saves_in_order_and_flushes() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let writer = CheckpointWriter::spawn(store.clone(), bus);
        let execution = execution();

        for sequence in 1..=5 {
            writer.submit(checkpoint(&execution, sequence));
        }
        writer.close().await.unwrap();

        let latest = store.load_latest(execution.id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 5);
        let first = events.recv().await.unwrap();
        assert!(matches!(first, ExecutionEvent::CheckpointSaved { sequence: 1, .. }));
    }
}
