/// Full-state snapshots for persistence and cold peer bootstrap
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::document::Item;
use crate::{ActorId, BufferLimits, Operation, ReplicaError, ReplicatedDocument, Result};

/// Leading byte of every encoded snapshot
pub const SNAPSHOT_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct DocumentState {
    path: String,
    clock: u64,
    items: Vec<Item>,
    /// Applied operations in application order
    history: Vec<Operation>,
}

impl ReplicatedDocument {
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let state = DocumentState {
            path: self.path.clone(),
            clock: self.clock,
            items: self.items.clone(),
            history: self.operations().cloned().collect(),
        };
        encode(&state)
    }

    /// Rebuild a document from a snapshot, owned by `actor`
    pub fn restore(bytes: &[u8], actor: ActorId) -> Result<Self> {
        Self::restore_with_limits(bytes, actor, BufferLimits::default())
    }

    pub fn restore_with_limits(bytes: &[u8], actor: ActorId, limits: BufferLimits) -> Result<Self> {
        let state: DocumentState = decode(bytes)?;
        let mut doc = ReplicatedDocument::with_limits(state.path, actor, limits);

        for op in state.history {
            doc.record(op);
        }
        if let Some(orphan) = state.items.iter().find(|item| !doc.contains(&item.id.op)) {
            return Err(ReplicaError::Snapshot(format!(
                "character from unknown operation {}",
                orphan.id.op
            )));
        }

        doc.items = state.items;
        doc.clock = doc.clock.max(state.clock);
        Ok(doc)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value).map_err(|e| ReplicaError::Snapshot(e.to_string()))?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(SNAPSHOT_VERSION);
    out.extend(body);
    Ok(out)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match bytes.split_first() {
        Some((&SNAPSHOT_VERSION, body)) => {
            bincode::deserialize(body).map_err(|e| ReplicaError::Snapshot(e.to_string()))
        }
        Some((version, _)) => Err(ReplicaError::Snapshot(format!(
            "unsupported snapshot version {}",
            version
        ))),
        None => Err(ReplicaError::Snapshot("empty snapshot".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalEdit;

    #[test]
    fn test_snapshot_restore_preserves_content_and_history() {
        let actor = ActorId::new();
        let mut doc = ReplicatedDocument::new("notes.md", actor);
        doc.create_local_operation(LocalEdit::insert(0, "hello world"))
            .unwrap();
        doc.create_local_operation(LocalEdit::delete(0, 6)).unwrap();

        let bytes = doc.snapshot().unwrap();
        let mut restored = ReplicatedDocument::restore(&bytes, actor).unwrap();

        assert_eq!(restored.text(), "world");
        assert_eq!(restored.frontier(), doc.frontier());
        assert_eq!(restored.operation_count(), 2);

        // Counter keeps advancing after restore
        let op = restored
            .create_local_operation(LocalEdit::insert(5, "!"))
            .unwrap();
        assert_eq!(op.id.counter, 3);
    }

    #[test]
    fn test_restore_rejects_unknown_version() {
        let mut bytes = ReplicatedDocument::new("a", ActorId::new())
            .snapshot()
            .unwrap();
        bytes[0] = 99;

        assert!(matches!(
            ReplicatedDocument::restore(&bytes, ActorId::new()),
            Err(ReplicaError::Snapshot(_))
        ));
        assert!(ReplicatedDocument::restore(&[], ActorId::new()).is_err());
    }
}
