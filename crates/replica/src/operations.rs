/// Replicated edit operations
/// Operations are immutable; positions are stable character anchors, not offsets
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::{ActorId, ReplicaError, Result};

/// Unique operation identifier: the producing actor plus its local counter.
///
/// The derived ordering is lexicographic on `(actor, counter)` and is the
/// tie-break between concurrent inserts sharing the same neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub actor: ActorId,
    pub counter: u64,
}

impl OpId {
    pub fn new(actor: ActorId, counter: u64) -> Self {
        Self { actor, counter }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.actor, self.counter)
    }
}

/// Stable identity of a single inserted character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharId {
    pub op: OpId,
    pub offset: u32,
}

impl CharId {
    pub fn new(op: OpId, offset: u32) -> Self {
        Self { op, offset }
    }
}

/// Insert position, expressed relative to an existing character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Anchor {
    /// Beginning of the document
    Start,
    /// Immediately after the given character (tombstoned or not)
    After(CharId),
}

/// A run of consecutive characters produced by one insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharSpan {
    pub op: OpId,
    pub start: u32,
    pub len: u32,
}

impl CharSpan {
    pub fn contains(&self, id: &CharId) -> bool {
        id.op == self.op && id.offset >= self.start && id.offset < self.start + self.len
    }

    pub fn char_ids(&self) -> impl Iterator<Item = CharId> + '_ {
        (self.start..self.start + self.len).map(move |offset| CharId::new(self.op, offset))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// `before` is the character that followed the anchor when the insert
    /// was made (`None` at the end of the document)
    Insert {
        anchor: Anchor,
        #[serde(default)]
        before: Option<CharId>,
        text: String,
    },
    Delete { spans: Vec<CharSpan> },
}

/// Atomic edit unit exchanged between replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,

    /// Operations that must be applied before this one
    pub deps: BTreeSet<OpId>,

    pub payload: Payload,
}

impl Operation {
    pub fn insert(id: OpId, deps: BTreeSet<OpId>, anchor: Anchor, text: impl Into<String>) -> Self {
        Self::insert_between(id, deps, anchor, None, text)
    }

    pub fn insert_between(
        id: OpId,
        deps: BTreeSet<OpId>,
        anchor: Anchor,
        before: Option<CharId>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id,
            deps,
            payload: Payload::Insert {
                anchor,
                before,
                text: text.into(),
            },
        }
    }

    pub fn delete(id: OpId, deps: BTreeSet<OpId>, spans: Vec<CharSpan>) -> Self {
        Self {
            id,
            deps,
            payload: Payload::Delete { spans },
        }
    }

    /// Operations whose characters this one refers to
    pub fn referenced_ops(&self) -> BTreeSet<OpId> {
        match &self.payload {
            Payload::Insert { anchor, before, .. } => {
                let after = match anchor {
                    Anchor::After(c) => Some(c.op),
                    Anchor::Start => None,
                };
                after.into_iter().chain(before.map(|c| c.op)).collect()
            }
            Payload::Delete { spans } => spans.iter().map(|s| s.op).collect(),
        }
    }

    /// Structural checks that do not need document state
    pub fn validate(&self) -> Result<()> {
        if self.id.counter == 0 {
            return Err(ReplicaError::Malformed(self.id, "zero counter".into()));
        }
        if self.deps.contains(&self.id) {
            return Err(ReplicaError::Malformed(self.id, "depends on itself".into()));
        }
        match &self.payload {
            Payload::Insert { text, .. } => {
                if text.is_empty() {
                    return Err(ReplicaError::Malformed(self.id, "empty insert".into()));
                }
                // Neighbouring characters always come from a causally earlier op
                if let Some(op) = self
                    .referenced_ops()
                    .into_iter()
                    .find(|op| op.counter >= self.id.counter)
                {
                    return Err(ReplicaError::Malformed(
                        self.id,
                        format!("anchor {} is not causally earlier", op),
                    ));
                }
            }
            Payload::Delete { spans } => {
                if spans.is_empty() || spans.iter().any(|s| s.len == 0) {
                    return Err(ReplicaError::Malformed(self.id, "empty delete span".into()));
                }
            }
        }
        Ok(())
    }
}

/// A local edit in visible character offsets, before anchoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalEdit {
    Insert { offset: usize, text: String },
    Delete { offset: usize, len: usize },
}

impl LocalEdit {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            offset,
            text: text.into(),
        }
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self::Delete { offset, len }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_id_ordering_is_actor_then_counter() {
        let a = ActorId(uuid::Uuid::from_u128(1));
        let b = ActorId(uuid::Uuid::from_u128(2));

        assert!(OpId::new(a, 9) < OpId::new(b, 1));
        assert!(OpId::new(a, 1) < OpId::new(a, 2));
    }

    #[test]
    fn test_validate_rejects_bad_anchor() {
        let actor = ActorId::new();
        let anchor = Anchor::After(CharId::new(OpId::new(actor, 5), 0));
        let op = Operation::insert(OpId::new(actor, 3), BTreeSet::new(), anchor, "x");

        assert!(matches!(op.validate(), Err(ReplicaError::Malformed(..))));
    }

    #[test]
    fn test_referenced_ops_include_both_neighbours() {
        let actor = ActorId::new();
        let left = CharId::new(OpId::new(actor, 1), 2);
        let right = CharId::new(OpId::new(ActorId::new(), 2), 0);
        let op = Operation::insert_between(
            OpId::new(actor, 3),
            BTreeSet::new(),
            Anchor::After(left),
            Some(right),
            "x",
        );

        assert_eq!(op.referenced_ops(), BTreeSet::from([left.op, right.op]));
        assert!(Operation::insert(OpId::new(actor, 1), BTreeSet::new(), Anchor::Start, "x")
            .referenced_ops()
            .is_empty());
    }

    #[test]
    fn test_span_contains() {
        let op = OpId::new(ActorId::new(), 1);
        let span = CharSpan { op, start: 2, len: 3 };

        assert!(span.contains(&CharId::new(op, 2)));
        assert!(span.contains(&CharId::new(op, 4)));
        assert!(!span.contains(&CharId::new(op, 5)));
        assert_eq!(span.char_ids().count(), 3);
    }
}
