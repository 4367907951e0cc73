/// Causal frontier: the latest operation known from each contributing actor
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{ActorId, OpId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontier {
    heads: BTreeMap<ActorId, u64>,
}

impl Frontier {
    pub fn new() -> Self {
        Self {
            heads: BTreeMap::new(),
        }
    }

    /// Record an applied operation
    pub fn observe(&mut self, id: OpId) {
        let head = self.heads.entry(id.actor).or_insert(0);
        *head = (*head).max(id.counter);
    }

    pub fn get(&self, actor: ActorId) -> Option<u64> {
        self.heads.get(&actor).copied()
    }

    /// Whether `id` is at or behind the head of its actor.
    ///
    /// Every operation depends on its actor's previous one, so a head
    /// covers the actor's entire chain below it.
    pub fn covers(&self, id: &OpId) -> bool {
        self.get(id.actor).is_some_and(|head| id.counter <= head)
    }

    /// Head ids, used as causal dependencies of the next local operation
    pub fn ids(&self) -> BTreeSet<OpId> {
        self.heads
            .iter()
            .map(|(actor, counter)| OpId::new(*actor, *counter))
            .collect()
    }

    /// Pointwise maximum
    pub fn merge(&mut self, other: &Frontier) {
        for (actor, &counter) in &other.heads {
            let head = self.heads.entry(*actor).or_insert(0);
            *head = (*head).max(counter);
        }
    }

    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.heads.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_covers() {
        let actor = ActorId::new();
        let mut frontier = Frontier::new();

        frontier.observe(OpId::new(actor, 3));
        frontier.observe(OpId::new(actor, 2));

        assert_eq!(frontier.get(actor), Some(3));
        assert!(frontier.covers(&OpId::new(actor, 1)));
        assert!(!frontier.covers(&OpId::new(actor, 4)));
        assert!(!frontier.covers(&OpId::new(ActorId::new(), 1)));
    }

    #[test]
    fn test_merge_takes_pointwise_max() {
        let a = ActorId::new();
        let b = ActorId::new();

        let mut f1 = Frontier::new();
        f1.observe(OpId::new(a, 3));

        let mut f2 = Frontier::new();
        f2.observe(OpId::new(b, 2));

        f2.observe(OpId::new(a, 1));

        f1.merge(&f2);
        assert_eq!(f1.get(a), Some(3));
        assert_eq!(f1.get(b), Some(2));
        assert_eq!(f1.ids().len(), 2);
    }
}
