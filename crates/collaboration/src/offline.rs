/// Durable outbound queue
/// Holds local operations no peer has confirmed yet, so edits made offline
/// or left unflushed by a dropped session survive until the next sync
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use replica::{Frontier, OpId, Operation, ProjectId};

use crate::{coalesce, CollaborationError, DocumentOps, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub path: String,
    pub operation: Operation,
}

/// Outbound operation queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundQueue {
    /// Project this queue belongs to
    pub project_id: ProjectId,

    /// Queued operations, in creation order
    pub entries: Vec<QueuedOperation>,

    /// Last modification
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl OutboundQueue {
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            entries: Vec::new(),
            updated_at: chrono::Utc::now(),
        }
    }

    /// Add an operation; returns false if it is already queued
    pub fn enqueue(&mut self, path: impl Into<String>, operation: Operation) -> bool {
        if self.contains(&operation.id) {
            return false;
        }
        self.entries.push(QueuedOperation {
            path: path.into(),
            operation,
        });
        self.updated_at = chrono::Utc::now();
        true
    }

    /// Add every operation of the batches; returns how many were new
    pub fn extend(&mut self, batches: impl IntoIterator<Item = DocumentOps>) -> usize {
        let mut added = 0;
        for batch in batches {
            for op in batch.operations {
                if self.enqueue(batch.path.clone(), op) {
                    added += 1;
                }
            }
        }
        added
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.entries.iter().any(|e| e.operation.id == *id)
    }

    /// Queued operations grouped by document
    pub fn batches(&self) -> Vec<DocumentOps> {
        coalesce(
            self.entries
                .iter()
                .map(|e| DocumentOps::new(e.path.clone(), vec![e.operation.clone()])),
        )
    }

    /// Drop the given operations after a successful flush
    pub fn remove(&mut self, ids: &HashSet<OpId>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !ids.contains(&e.operation.id));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.updated_at = chrono::Utc::now();
        }
        removed
    }

    /// Drop operations a peer's frontier proves it already has
    pub fn acknowledge(&mut self, frontiers: &BTreeMap<String, Frontier>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| {
            frontiers
                .get(&e.path)
                .map(|f| !f.covers(&e.operation.id))
                .unwrap_or(true)
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            self.updated_at = chrono::Utc::now();
        }
        removed
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get queue size
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// JSON persistence for the outbound queue
#[derive(Debug, Clone)]
pub struct OutboundQueueStore {
    /// Storage directory for queues; `None` keeps the queue in memory only
    storage_dir: Option<PathBuf>,
}

impl OutboundQueueStore {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: Some(storage_dir.as_ref().to_path_buf()),
        }
    }

    pub fn in_memory() -> Self {
        Self { storage_dir: None }
    }

    fn queue_file(&self, project_id: ProjectId) -> Option<PathBuf> {
        self.storage_dir
            .as_ref()
            .map(|dir| dir.join(format!("outbound_{}.json", project_id.0)))
    }

    /// Save the queue; an empty queue removes the file
    pub async fn save(&self, queue: &OutboundQueue) -> Result<()> {
        let Some(path) = self.queue_file(queue.project_id) else {
            return Ok(());
        };

        if queue.is_empty() {
            if fs::try_exists(&path).await.unwrap_or(false) {
                fs::remove_file(&path).await.map_err(|e| {
                    CollaborationError::Persistence(format!("Failed to delete queue file: {}", e))
                })?;
            }
            return Ok(());
        }

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(|e| {
                CollaborationError::Persistence(format!("Failed to create storage directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(queue)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(|e| {
            CollaborationError::Persistence(format!("Failed to write queue to disk: {}", e))
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            CollaborationError::Persistence(format!("Failed to replace queue file: {}", e))
        })?;

        debug!(project = %queue.project_id, entries = queue.len(), "saved outbound queue");
        Ok(())
    }

    /// Load the queue for a project, empty if none was saved
    pub async fn load(&self, project_id: ProjectId) -> Result<OutboundQueue> {
        let Some(path) = self.queue_file(project_id) else {
            return Ok(OutboundQueue::new(project_id));
        };
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(OutboundQueue::new(project_id));
        }

        let json = fs::read_to_string(&path).await.map_err(|e| {
            CollaborationError::Persistence(format!("Failed to read queue from disk: {}", e))
        })?;
        let queue: OutboundQueue = serde_json::from_str(&json)?;

        if queue.project_id != project_id {
            return Err(CollaborationError::ProjectMismatch {
                expected: project_id,
                actual: queue.project_id,
            });
        }
        Ok(queue)
    }
}
