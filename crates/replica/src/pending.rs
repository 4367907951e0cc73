/// Buffer for operations that arrived before their causal dependencies.
/// Keyed by missing dependency so arrivals release waiters directly.
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::{OpId, Operation, ReplicaError, Result};

/// Opaque tag for the connection an operation arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub uuid::Uuid);

/// A buffered operation dropped at the end of its retention window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredOp {
    pub id: OpId,
    /// Who sent it, when it arrived over a connection
    pub source: Option<SourceId>,
}

/// Limits for the per-document pending buffer
#[derive(Debug, Clone, Copy)]
pub struct BufferLimits {
    pub capacity: usize,
    pub retention: Duration,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            capacity: 1024,
            retention: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    op: Operation,
    missing: BTreeSet<OpId>,
    source: Option<SourceId>,
    received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PendingBuffer {
    entries: HashMap<OpId, PendingEntry>,
    waiting_on: HashMap<OpId, BTreeSet<OpId>>,
    limits: BufferLimits,
}

impl PendingBuffer {
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            entries: HashMap::new(),
            waiting_on: HashMap::new(),
            limits,
        }
    }

    pub fn insert(
        &mut self,
        op: Operation,
        missing: BTreeSet<OpId>,
        source: Option<SourceId>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.entries.contains_key(&op.id) {
            return Ok(());
        }
        if self.entries.len() >= self.limits.capacity {
            return Err(ReplicaError::BufferFull(self.entries.len()));
        }

        for dep in &missing {
            self.waiting_on.entry(*dep).or_default().insert(op.id);
        }
        self.entries.insert(
            op.id,
            PendingEntry {
                op,
                missing,
                source,
                received_at: now,
            },
        );
        Ok(())
    }

    /// Mark `dep` as applied and return operations that became ready
    pub fn satisfy(&mut self, dep: OpId) -> Vec<Operation> {
        let Some(waiters) = self.waiting_on.remove(&dep) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        for id in waiters {
            let now_ready = match self.entries.get_mut(&id) {
                Some(entry) => {
                    entry.missing.remove(&dep);
                    entry.missing.is_empty()
                }
                None => false,
            };
            if now_ready {
                if let Some(entry) = self.entries.remove(&id) {
                    ready.push(entry.op);
                }
            }
        }
        ready.sort_by_key(|op| op.id.counter);
        ready
    }

    /// Drop operations held longer than the retention window
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<ExpiredOp> {
        let retention = chrono::Duration::from_std(self.limits.retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let expired: Vec<ExpiredOp> = self
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.received_at > retention)
            .map(|(id, entry)| ExpiredOp {
                id: *id,
                source: entry.source,
            })
            .collect();

        for ExpiredOp { id, .. } in &expired {
            if let Some(entry) = self.entries.remove(id) {
                for dep in entry.missing {
                    if let Some(waiters) = self.waiting_on.get_mut(&dep) {
                        waiters.remove(id);
                        if waiters.is_empty() {
                            self.waiting_on.remove(&dep);
                        }
                    }
                }
            }
        }
        expired
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn missing_for(&self, id: &OpId) -> Option<&BTreeSet<OpId>> {
        self.entries.get(id).map(|entry| &entry.missing)
    }

    /// Every dependency some buffered operation is still waiting for
    pub fn missing(&self) -> BTreeSet<OpId> {
        self.waiting_on.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorId, Anchor};

    fn op(actor: ActorId, counter: u64, deps: &[OpId]) -> Operation {
        Operation::insert(
            OpId::new(actor, counter),
            deps.iter().copied().collect(),
            Anchor::Start,
            "x",
        )
    }

    #[test]
    fn test_release_when_all_dependencies_arrive() {
        let a = ActorId::new();
        let b = ActorId::new();
        let dep1 = OpId::new(a, 1);
        let dep2 = OpId::new(b, 1);

        let mut buffer = PendingBuffer::new(BufferLimits::default());
        let waiting = op(a, 2, &[dep1, dep2]);
        buffer
            .insert(waiting, BTreeSet::from([dep1, dep2]), None, Utc::now())
            .unwrap();

        assert!(buffer.satisfy(dep1).is_empty());
        let ready = buffer.satisfy(dep2);
        assert_eq!(ready.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let a = ActorId::new();
        let limits = BufferLimits {
            capacity: 1,
            ..Default::default()
        };
        let mut buffer = PendingBuffer::new(limits);
        let missing = BTreeSet::from([OpId::new(a, 1)]);

        buffer.insert(op(a, 2, &[]), missing.clone(), None, Utc::now()).unwrap();
        let result = buffer.insert(op(a, 3, &[]), missing, None, Utc::now());
        assert!(matches!(result, Err(ReplicaError::BufferFull(1))));
    }

    #[test]
    fn test_expire_drops_stale_entries_and_names_sender() {
        let a = ActorId::new();
        let dep = OpId::new(a, 1);
        let sender = SourceId(uuid::Uuid::new_v4());
        let mut buffer = PendingBuffer::new(BufferLimits::default());

        let old = Utc::now() - chrono::Duration::seconds(120);
        buffer
            .insert(op(a, 2, &[dep]), BTreeSet::from([dep]), Some(sender), old)
            .unwrap();
        buffer
            .insert(op(a, 3, &[dep]), BTreeSet::from([dep]), None, Utc::now())
            .unwrap();

        let expired = buffer.expire(Utc::now());
        assert_eq!(
            expired,
            vec![ExpiredOp {
                id: OpId::new(a, 2),
                source: Some(sender),
            }]
        );
        assert_eq!(buffer.len(), 1);
        buffer.expire(Utc::now() + chrono::Duration::seconds(120));
        assert!(buffer.missing().is_empty());
        assert!(buffer.satisfy(dep).is_empty());
    }
}
