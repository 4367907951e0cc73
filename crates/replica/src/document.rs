/// Convergent text document (operation-based sequence CRDT)
///
/// Every inserted character keeps a stable [`CharId`]. An insert names the
/// character it follows and the one that followed it when it was made, and
/// integrates between the two. Concurrent inserts between the same
/// neighbours are ordered by operation id `(actor, counter)`, so the
/// rendered order is independent of arrival order. Deletes only set
/// tombstones, which remain as anchors for later inserts.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;
use tracing::{debug, warn};

use crate::{
    ActorId, Anchor, BufferLimits, CharId, CharSpan, ExpiredOp, Frontier, LocalEdit, OpId,
    Operation, Payload, PendingBuffer, ReplicaError, Result, SourceId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Item {
    pub id: CharId,
    /// Left neighbour at creation (`None` for the document start)
    pub origin: Option<CharId>,
    /// Right neighbour at creation (`None` for the document end)
    pub before: Option<CharId>,
    pub ch: char,
    pub deleted: bool,
}

/// Result of applying a single operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation (and any buffered operations it unblocked) merged
    Applied {
        applied: Vec<OpId>,
        rejected: Vec<OpId>,
    },
    /// Held until the listed dependencies arrive
    Buffered { missing: BTreeSet<OpId> },
    /// Already applied; no-op
    Duplicate,
}

/// Summary of merging a batch of operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: Vec<OpId>,
    pub buffered: BTreeSet<OpId>,
    pub rejected: Vec<OpId>,
    /// The pending buffer overflowed; the sender is too far ahead
    pub overflowed: bool,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && !self.overflowed
    }
}

/// One replica of a tracked file
#[derive(Debug, Clone)]
pub struct ReplicatedDocument {
    pub(crate) path: String,
    pub(crate) actor: ActorId,
    pub(crate) clock: u64,
    pub(crate) items: Vec<Item>,
    pub(crate) history: HashMap<OpId, Operation>,
    pub(crate) order: Vec<OpId>,
    pub(crate) order_index: HashMap<OpId, usize>,
    pub(crate) frontier: Frontier,
    pub(crate) pending: PendingBuffer,
}

impl ReplicatedDocument {
    pub fn new(path: impl Into<String>, actor: ActorId) -> Self {
        Self::with_limits(path, actor, BufferLimits::default())
    }

    pub fn with_limits(path: impl Into<String>, actor: ActorId, limits: BufferLimits) -> Self {
        Self {
            path: path.into(),
            actor,
            clock: 0,
            items: Vec::new(),
            history: HashMap::new(),
            order: Vec::new(),
            order_index: HashMap::new(),
            frontier: Frontier::new(),
            pending: PendingBuffer::new(limits),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// Rendered content
    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .map(|item| item.ch)
            .collect()
    }

    /// Visible length in characters
    pub fn len(&self) -> usize {
        self.items.iter().filter(|item| !item.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.history.contains_key(id)
    }

    pub fn operation(&self, id: &OpId) -> Option<&Operation> {
        self.history.get(id)
    }

    /// History in application order (always a causal order)
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.order.iter().filter_map(|id| self.history.get(id))
    }

    pub fn operation_count(&self) -> usize {
        self.order.len()
    }

    /// Turn a local edit into an anchored operation and apply it
    pub fn create_local_operation(&mut self, edit: LocalEdit) -> Result<Operation> {
        let visible = self.visible_positions();
        let length = visible.len();
        let id = OpId::new(self.actor, self.clock + 1);
        let deps = self.frontier.ids();

        let op = match edit {
            LocalEdit::Insert { offset, text } => {
                if text.is_empty() {
                    return Err(ReplicaError::EmptyEdit);
                }
                if offset > length {
                    return Err(ReplicaError::OutOfBounds {
                        offset,
                        len: 0,
                        length,
                    });
                }
                let at = match offset {
                    0 => 0,
                    _ => visible[offset - 1] + 1,
                };
                let anchor = match at {
                    0 => Anchor::Start,
                    _ => Anchor::After(self.items[at - 1].id),
                };
                let before = self.items.get(at).map(|item| item.id);
                Operation::insert_between(id, deps, anchor, before, text)
            }
            LocalEdit::Delete { offset, len } => {
                if len == 0 {
                    return Err(ReplicaError::EmptyEdit);
                }
                if offset + len > length {
                    return Err(ReplicaError::OutOfBounds {
                        offset,
                        len,
                        length,
                    });
                }
                let ids = visible[offset..offset + len]
                    .iter()
                    .map(|&pos| self.items[pos].id);
                Operation::delete(id, deps, spans_from_ids(ids))
            }
        };

        self.integrate(&op)?;
        self.record(op.clone());
        debug!(path = %self.path, op = %op.id, "created local operation");
        Ok(op)
    }

    /// Replace `len` characters at `offset` with `text`
    pub fn replace_range(&mut self, offset: usize, len: usize, text: &str) -> Result<Vec<Operation>> {
        let mut ops = Vec::new();
        if len > 0 {
            ops.push(self.create_local_operation(LocalEdit::delete(offset, len))?);
        }
        if !text.is_empty() {
            ops.push(self.create_local_operation(LocalEdit::insert(offset, text))?);
        }
        Ok(ops)
    }

    pub fn apply_operation(&mut self, op: Operation) -> Result<ApplyOutcome> {
        self.apply_operation_at(op, None, Utc::now())
    }

    /// Apply a remote operation, buffering it if dependencies are missing.
    /// `source` is remembered so an expired operation can be traced to its sender.
    pub fn apply_operation_at(
        &mut self,
        op: Operation,
        source: Option<SourceId>,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        if self.history.contains_key(&op.id) {
            return Ok(ApplyOutcome::Duplicate);
        }
        if let Some(missing) = self.pending.missing_for(&op.id) {
            return Ok(ApplyOutcome::Buffered {
                missing: missing.clone(),
            });
        }
        op.validate()?;

        // Characters an operation points at count as dependencies too
        let missing: BTreeSet<OpId> = op
            .deps
            .iter()
            .copied()
            .chain(op.referenced_ops())
            .filter(|dep| !self.history.contains_key(dep))
            .collect();
        if !missing.is_empty() {
            debug!(path = %self.path, op = %op.id, missing = missing.len(), "buffering operation");
            self.pending.insert(op, missing.clone(), source, now)?;
            return Ok(ApplyOutcome::Buffered { missing });
        }

        self.integrate(&op)?;
        let first = op.id;
        self.record(op);

        let mut applied = vec![first];
        let mut rejected = Vec::new();
        let mut ready = self.pending.satisfy(first);

        while let Some(next) = ready.pop() {
            let id = next.id;
            if self.history.contains_key(&id) {
                continue;
            }
            match self.integrate(&next) {
                Ok(()) => {
                    self.record(next);
                    applied.push(id);
                    ready.extend(self.pending.satisfy(id));
                }
                Err(e) => {
                    warn!(path = %self.path, op = %id, error = %e, "rejecting buffered operation");
                    rejected.push(id);
                }
            }
        }

        Ok(ApplyOutcome::Applied { applied, rejected })
    }

    /// Merge a set of operations in any order
    pub fn merge(&mut self, ops: impl IntoIterator<Item = Operation>) -> MergeReport {
        self.merge_from(ops, None)
    }

    /// Merge operations delivered by `source`
    pub fn merge_from(
        &mut self,
        ops: impl IntoIterator<Item = Operation>,
        source: Option<SourceId>,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let now = Utc::now();

        for op in ops {
            let id = op.id;
            match self.apply_operation_at(op, source, now) {
                Ok(ApplyOutcome::Applied { applied, rejected }) => {
                    report.applied.extend(applied);
                    report.rejected.extend(rejected);
                }
                Ok(ApplyOutcome::Buffered { .. }) => {
                    report.buffered.insert(id);
                }
                Ok(ApplyOutcome::Duplicate) => {}
                Err(ReplicaError::BufferFull(_)) => {
                    report.overflowed = true;
                    report.rejected.push(id);
                }
                Err(e) => {
                    warn!(path = %self.path, op = %id, error = %e, "rejecting operation");
                    report.rejected.push(id);
                }
            }
        }

        report.buffered.retain(|id| !self.history.contains_key(id));
        report
    }

    /// Operations not reachable from `frontier`, in causal order
    pub fn missing_for(&self, frontier: &Frontier) -> Vec<Operation> {
        let mut known: HashSet<OpId> = HashSet::new();
        let mut stack: Vec<OpId> = frontier
            .ids()
            .into_iter()
            .filter(|id| self.history.contains_key(id))
            .collect();

        while let Some(id) = stack.pop() {
            if !known.insert(id) {
                continue;
            }
            if let Some(op) = self.history.get(&id) {
                stack.extend(op.deps.iter().copied());
            }
        }

        self.order
            .iter()
            .filter(|id| !known.contains(*id) && !frontier.covers(id))
            .filter_map(|id| self.history.get(id).cloned())
            .collect()
    }

    /// Whether `a` is a causal ancestor of `b`
    pub fn happened_before(&self, a: &OpId, b: &OpId) -> bool {
        match self.order_index.get(a) {
            Some(&floor) => self.ancestors_within(b, floor).contains(a),
            None => false,
        }
    }

    /// Recent operations causally concurrent with `id`
    pub fn concurrent_with(&self, id: &OpId, window: usize) -> Vec<OpId> {
        let Some(&idx) = self.order_index.get(id) else {
            return Vec::new();
        };
        let lo = idx.saturating_sub(window);
        let hi = (idx + window + 1).min(self.order.len());
        let ancestors = self.ancestors_within(id, lo);

        (lo..hi)
            .filter(|&j| j != idx)
            .map(|j| self.order[j])
            .filter(|other| {
                if self.order_index[other] < idx {
                    !ancestors.contains(other)
                } else {
                    !self.happened_before(id, other)
                }
            })
            .collect()
    }

    /// Line span (0-based, end exclusive) affected by an applied operation
    pub fn touched_lines(&self, id: &OpId) -> Option<Range<usize>> {
        let op = self.history.get(id)?;
        let mut line = 0usize;
        let mut span: Option<(usize, usize)> = None;

        for item in &self.items {
            let hit = match &op.payload {
                Payload::Insert { .. } => item.id.op == op.id,
                Payload::Delete { spans } => spans.iter().any(|s| s.contains(&item.id)),
            };
            if hit {
                span = Some(match span {
                    Some((lo, hi)) => (lo.min(line), hi.max(line)),
                    None => (line, line),
                });
            }
            if !item.deleted && item.ch == '\n' {
                line += 1;
            }
        }

        span.map(|(lo, hi)| lo..hi + 1)
    }

    /// Character offsets covering the given line span
    pub fn line_span_to_chars(&self, lines: Range<usize>) -> Range<usize> {
        let mut line = 0usize;
        let mut start = None;
        let mut offset = 0usize;

        for ch in self.items.iter().filter(|item| !item.deleted).map(|item| item.ch) {
            if start.is_none() && line >= lines.start {
                start = Some(offset);
            }
            if line >= lines.end {
                break;
            }
            offset += 1;
            if ch == '\n' {
                line += 1;
            }
        }

        let start = start.unwrap_or(offset);
        start..offset.max(start)
    }

    /// Rendered text of a line span (0-based, end exclusive)
    pub fn lines_text(&self, lines: Range<usize>) -> String {
        let span = self.line_span_to_chars(lines);
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .skip(span.start)
            .take(span.len())
            .map(|item| item.ch)
            .collect()
    }

    /// Text of a line span as it would read without the `excluded`
    /// operations: their inserts are hidden and their deletes undone
    pub fn render_lines_excluding(&self, lines: Range<usize>, excluded: &BTreeSet<OpId>) -> String {
        let (lo, hi) = self.item_bounds(lines);
        let deleted: HashSet<CharId> = self
            .history
            .values()
            .filter(|op| !excluded.contains(&op.id))
            .filter_map(|op| match &op.payload {
                Payload::Delete { spans } => Some(spans),
                Payload::Insert { .. } => None,
            })
            .flat_map(|spans| spans.iter().flat_map(|span| span.char_ids()))
            .collect();

        self.items[lo..hi]
            .iter()
            .filter(|item| !excluded.contains(&item.id.op) && !deleted.contains(&item.id))
            .map(|item| item.ch)
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Dependencies buffered operations are waiting for
    pub fn pending_missing(&self) -> BTreeSet<OpId> {
        self.pending.missing()
    }

    /// Drop buffered operations older than the retention window
    pub fn expire_pending(&mut self, now: DateTime<Utc>) -> Vec<ExpiredOp> {
        let expired = self.pending.expire(now);
        if !expired.is_empty() {
            warn!(path = %self.path, dropped = expired.len(), "dropped unresolved operations");
        }
        expired
    }

    fn visible_positions(&self) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.deleted)
            .map(|(pos, _)| pos)
            .collect()
    }

    fn position(&self, id: &CharId) -> Option<usize> {
        self.items.iter().position(|item| item.id == *id)
    }

    /// Item index bounds of a visible line span, tombstones included
    fn item_bounds(&self, lines: Range<usize>) -> (usize, usize) {
        let mut line = 0usize;
        let mut lo = None;

        for (idx, item) in self.items.iter().enumerate() {
            if lo.is_none() && line >= lines.start {
                lo = Some(idx);
            }
            if line >= lines.end {
                return (lo.unwrap_or(idx), idx);
            }
            if !item.deleted && item.ch == '\n' {
                line += 1;
            }
        }

        let end = self.items.len();
        (lo.unwrap_or(end), end)
    }

    fn ancestors_within(&self, id: &OpId, floor: usize) -> HashSet<OpId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<OpId> = match self.history.get(id) {
            Some(op) => op.deps.iter().copied().collect(),
            None => return seen,
        };

        while let Some(dep) = stack.pop() {
            match self.order_index.get(&dep) {
                Some(&i) if i >= floor => {}
                _ => continue,
            }
            if seen.insert(dep) {
                if let Some(op) = self.history.get(&dep) {
                    stack.extend(op.deps.iter().copied());
                }
            }
        }
        seen
    }

    fn integrate(&mut self, op: &Operation) -> Result<()> {
        match &op.payload {
            Payload::Insert { anchor, before, text } => {
                let origin = match anchor {
                    Anchor::Start => None,
                    Anchor::After(c) => Some(*c),
                };
                let idx = self.integration_index(op.id, origin, *before)?;

                let run = text.chars().enumerate().map(|(i, ch)| Item {
                    id: CharId::new(op.id, i as u32),
                    origin: match i {
                        0 => origin,
                        _ => Some(CharId::new(op.id, i as u32 - 1)),
                    },
                    before: *before,
                    ch,
                    deleted: false,
                });
                self.items.splice(idx..idx, run);
            }
            Payload::Delete { spans } => {
                let ops: HashSet<OpId> = spans.iter().map(|s| s.op).collect();
                let index: HashMap<CharId, usize> = self
                    .items
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| ops.contains(&item.id.op))
                    .map(|(pos, item)| (item.id, pos))
                    .collect();

                let mut targets = Vec::new();
                for span in spans {
                    for id in span.char_ids() {
                        let pos = index.get(&id).ok_or_else(|| {
                            ReplicaError::Malformed(op.id, format!("unknown character in {}", id.op))
                        })?;
                        targets.push(*pos);
                    }
                }
                for pos in targets {
                    self.items[pos].deleted = true;
                }
            }
        }
        Ok(())
    }

    /// Index a new run lands at between `origin` and `before`.
    ///
    /// Scans the characters between the two neighbours. A concurrent run with
    /// the same origin and a smaller id goes first, along with everything
    /// anchored inside it; scanning stops at the first character anchored
    /// outside the scanned region.
    fn integration_index(&self, id: OpId, origin: Option<CharId>, before: Option<CharId>) -> Result<usize> {
        let mut index = match origin {
            None => 0,
            Some(c) => {
                self.position(&c).ok_or_else(|| {
                    ReplicaError::Malformed(id, format!("unknown anchor in {}", c.op))
                })? + 1
            }
        };
        let end = match before {
            None => self.items.len(),
            Some(c) => self.position(&c).ok_or_else(|| {
                ReplicaError::Malformed(id, format!("unknown right neighbour in {}", c.op))
            })?,
        };
        if end < index {
            return Err(ReplicaError::Malformed(id, "neighbours out of order".into()));
        }

        let mut scanned: HashSet<CharId> = HashSet::new();
        let mut contested: HashSet<CharId> = HashSet::new();
        for pos in index..end {
            let item = &self.items[pos];
            scanned.insert(item.id);
            contested.insert(item.id);

            if item.origin == origin {
                if item.id.op < id {
                    index = pos + 1;
                    contested.clear();
                } else if item.before == before {
                    break;
                }
            } else if let Some(o) = item.origin.filter(|o| scanned.contains(o)) {
                if !contested.contains(&o) {
                    index = pos + 1;
                    contested.clear();
                }
            } else {
                break;
            }
        }
        Ok(index)
    }

    pub(crate) fn record(&mut self, op: Operation) {
        self.clock = self.clock.max(op.id.counter);
        self.frontier.observe(op.id);
        self.order_index.insert(op.id, self.order.len());
        self.order.push(op.id);
        self.history.insert(op.id, op);
    }
}

/// Group character ids into contiguous per-insert spans
fn spans_from_ids(ids: impl Iterator<Item = CharId>) -> Vec<CharSpan> {
    let mut spans: Vec<CharSpan> = Vec::new();
    for id in ids {
        match spans.last_mut() {
            Some(last) if last.op == id.op && last.start + last.len == id.offset => last.len += 1,
            _ => spans.push(CharSpan {
                op: id.op,
                start: id.offset,
                len: 1,
            }),
        }
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(n: u128) -> ActorId {
        ActorId(uuid::Uuid::from_u128(n))
    }

    fn doc_with(actor_id: ActorId, text: &str) -> (ReplicatedDocument, Operation) {
        let mut doc = ReplicatedDocument::new("src/lib.rs", actor_id);
        let op = doc.create_local_operation(LocalEdit::insert(0, text)).unwrap();
        (doc, op)
    }

    #[test]
    fn test_local_insert_and_delete() {
        let (mut doc, _) = doc_with(actor(1), "hello world");

        doc.create_local_operation(LocalEdit::delete(5, 6)).unwrap();
        assert_eq!(doc.text(), "hello");

        doc.create_local_operation(LocalEdit::insert(5, "!")).unwrap();
        assert_eq!(doc.text(), "hello!");
        assert_eq!(doc.operation_count(), 3);
    }

    #[test]
    fn test_out_of_bounds_edit_fails() {
        let (mut doc, _) = doc_with(actor(1), "abc");

        let result = doc.create_local_operation(LocalEdit::delete(2, 5));
        assert!(matches!(result, Err(ReplicaError::OutOfBounds { .. })));

        let result = doc.create_local_operation(LocalEdit::insert(1, ""));
        assert!(matches!(result, Err(ReplicaError::EmptyEdit)));
    }

    #[test]
    fn test_remote_operation_applies() {
        let (mut a, base) = doc_with(actor(1), "fn main() {}");
        let mut b = ReplicatedDocument::new("src/lib.rs", actor(2));

        b.apply_operation(base).unwrap();
        let op = a.create_local_operation(LocalEdit::insert(11, " run(); ")).unwrap();
        let outcome = b.apply_operation(op).unwrap();

        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
        assert_eq!(a.text(), b.text());
    }

    #[test]
    fn test_concurrent_inserts_at_same_anchor_converge() {
        let (mut a, base) = doc_with(actor(1), "ab");
        let mut b = ReplicatedDocument::new("f.txt", actor(2));
        b.apply_operation(base).unwrap();

        let op_a = a.create_local_operation(LocalEdit::insert(1, "X")).unwrap();
        let op_b = b.create_local_operation(LocalEdit::insert(1, "Y")).unwrap();

        a.apply_operation(op_b).unwrap();
        b.apply_operation(op_a).unwrap();

        assert_eq!(a.text(), b.text());
        assert_eq!(a.len(), 4);
    }

    #[test]
    fn test_concurrent_inserts_ordered_by_actor_not_counter() {
        let (_, base) = doc_with(actor(1), "ab");
        let a_char = CharId::new(base.id, 0);
        let b_char = CharId::new(base.id, 1);
        let deps = BTreeSet::from([base.id]);

        for (counter_x, counter_y) in [(5, 2), (2, 5)] {
            let x = Operation::insert_between(
                OpId::new(actor(1), counter_x),
                deps.clone(),
                Anchor::After(a_char),
                Some(b_char),
                "X",
            );
            let y = Operation::insert_between(
                OpId::new(actor(2), counter_y),
                deps.clone(),
                Anchor::After(a_char),
                Some(b_char),
                "Y",
            );

            for order in [[x.clone(), y.clone()], [y.clone(), x.clone()]] {
                let mut doc = ReplicatedDocument::new("f.txt", actor(3));
                doc.apply_operation(base.clone()).unwrap();
                assert!(doc.merge(order).is_clean());
                assert_eq!(doc.text(), "aXYb");
            }
        }
    }

    #[test]
    fn test_insert_before_existing_sibling_keeps_position() {
        // Actor 2 inserts right after `a`, ahead of a character actor 9 put there
        let (mut high, base) = doc_with(actor(9), "ac");
        let mut low = ReplicatedDocument::new("f", actor(2));
        low.apply_operation(base).unwrap();

        let b = high.create_local_operation(LocalEdit::insert(1, "b")).unwrap();
        low.apply_operation(b).unwrap();
        let mark = low.create_local_operation(LocalEdit::insert(1, "_")).unwrap();
        high.apply_operation(mark).unwrap();

        assert_eq!(low.text(), "a_bc");
        assert_eq!(high.text(), "a_bc");
    }

    #[test]
    fn test_unknown_anchor_is_buffered() {
        let (mut a, base) = doc_with(actor(1), "xy");
        let mut b = ReplicatedDocument::new("f", actor(2));
        b.apply_operation(base.clone()).unwrap();
        let mid = a.create_local_operation(LocalEdit::insert(1, "m")).unwrap();
        b.apply_operation(mid.clone()).unwrap();

        // A third replica sees an op anchored on `mid` with only `base` as a dep
        let child = b.create_local_operation(LocalEdit::insert(2, "!")).unwrap();
        let stripped = Operation {
            deps: BTreeSet::from([base.id]),
            ..child
        };
        let mut c = ReplicatedDocument::new("f", actor(3));
        c.apply_operation(base).unwrap();

        let outcome = c.apply_operation(stripped).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Buffered { .. }));
        assert_eq!(c.pending_missing(), BTreeSet::from([mid.id]));

        c.apply_operation(mid).unwrap();
        assert_eq!(c.text(), "xm!y");
    }

    #[test]
    fn test_typing_sequence_keeps_order() {
        let (mut doc, _) = doc_with(actor(1), "ac");

        doc.create_local_operation(LocalEdit::insert(1, "b")).unwrap();
        doc.create_local_operation(LocalEdit::insert(1, "_")).unwrap();
        assert_eq!(doc.text(), "a_bc");
    }

    #[test]
    fn test_duplicate_is_noop() {
        let (a, base) = doc_with(actor(1), "xyz");
        let mut b = ReplicatedDocument::new("f", actor(2));

        b.apply_operation(base.clone()).unwrap();
        let before = b.text();
        assert_eq!(b.apply_operation(base).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(b.text(), before);
        assert_eq!(b.text(), a.text());
    }

    #[test]
    fn test_out_of_order_operation_is_buffered() {
        let (mut a, base) = doc_with(actor(1), "one");
        let second = a.create_local_operation(LocalEdit::insert(3, " two")).unwrap();

        let mut b = ReplicatedDocument::new("f", actor(2));
        let outcome = b.apply_operation(second.clone()).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Buffered { .. }));
        assert_eq!(b.text(), "");
        assert_eq!(b.pending_missing(), BTreeSet::from([base.id]));

        match b.apply_operation(base).unwrap() {
            ApplyOutcome::Applied { applied, .. } => assert_eq!(applied.len(), 2),
            other => panic!("expected applied, got {:?}", other),
        }
        assert_eq!(b.text(), "one two");
        assert_eq!(b.pending_len(), 0);
    }

    #[test]
    fn test_delete_of_unknown_character_waits_for_it() {
        let mut doc = ReplicatedDocument::new("f", actor(1));
        let ghost = OpId::new(actor(9), 1);
        let op = Operation::delete(
            OpId::new(actor(2), 2),
            BTreeSet::new(),
            vec![CharSpan {
                op: ghost,
                start: 0,
                len: 1,
            }],
        );

        assert_eq!(
            doc.apply_operation(op).unwrap(),
            ApplyOutcome::Buffered {
                missing: BTreeSet::from([ghost])
            }
        );
    }

    #[test]
    fn test_delete_past_end_of_known_run_is_malformed() {
        let (mut doc, base) = doc_with(actor(1), "ab");
        let op = Operation::delete(
            OpId::new(actor(2), 2),
            BTreeSet::from([base.id]),
            vec![CharSpan {
                op: base.id,
                start: 1,
                len: 5,
            }],
        );

        assert!(matches!(
            doc.apply_operation(op),
            Err(ReplicaError::Malformed(..))
        ));
        assert_eq!(doc.text(), "ab");
    }

    #[test]
    fn test_missing_for_returns_unreachable_ops() {
        let (mut a, base) = doc_with(actor(1), "base");
        let mut b = ReplicatedDocument::new("f", actor(2));
        b.apply_operation(base).unwrap();
        let b_frontier = b.frontier().clone();

        let op1 = a.create_local_operation(LocalEdit::insert(4, "1")).unwrap();
        let op2 = a.create_local_operation(LocalEdit::insert(5, "2")).unwrap();

        let missing = a.missing_for(&b_frontier);
        assert_eq!(missing, vec![op1, op2]);
        assert_eq!(a.missing_for(&Frontier::new()).len(), 3);
        assert!(a.missing_for(a.frontier()).is_empty());
    }

    #[test]
    fn test_touched_lines() {
        let (mut doc, _) = doc_with(actor(1), "line0\nline1\nline2\n");

        let ins = doc.create_local_operation(LocalEdit::insert(8, "XX")).unwrap();
        assert_eq!(doc.touched_lines(&ins.id), Some(1..2));

        // Deleting across newlines collapses the span onto a single line
        let del = doc.create_local_operation(LocalEdit::delete(3, 12)).unwrap();
        assert_eq!(doc.text(), "linine2\n");
        assert_eq!(doc.touched_lines(&del.id), Some(0..1));
    }

    #[test]
    fn test_line_span_to_chars() {
        let (doc, _) = doc_with(actor(1), "ab\ncd\nef");

        assert_eq!(doc.line_span_to_chars(1..2), 3..6);
        assert_eq!(doc.line_span_to_chars(2..3), 6..8);
        assert_eq!(doc.line_span_to_chars(0..3), 0..8);
    }

    #[test]
    fn test_render_without_concurrent_side() {
        let (mut a, base) = doc_with(actor(1), "fn f() {\n    one();\n}\n");
        let mut b = ReplicatedDocument::new("f", actor(2));
        b.apply_operation(base).unwrap();

        let op_a = a.create_local_operation(LocalEdit::insert(20, "    two();\n")).unwrap();
        let op_b = b.create_local_operation(LocalEdit::delete(13, 3)).unwrap();
        a.apply_operation(op_b.clone()).unwrap();

        assert_eq!(a.lines_text(0..4), "fn f() {\n    ();\n    two();\n}\n");
        assert_eq!(
            a.render_lines_excluding(0..4, &BTreeSet::from([op_b.id])),
            "fn f() {\n    one();\n    two();\n}\n"
        );
        assert_eq!(
            a.render_lines_excluding(0..4, &BTreeSet::from([op_a.id])),
            "fn f() {\n    ();\n}\n"
        );
    }

    #[test]
    fn test_concurrency_detection() {
        let (mut a, base) = doc_with(actor(1), "0123456789");
        let mut b = ReplicatedDocument::new("f", actor(2));
        b.apply_operation(base.clone()).unwrap();

        let op_a = a.create_local_operation(LocalEdit::insert(2, "a")).unwrap();
        let op_b = b.create_local_operation(LocalEdit::insert(8, "b")).unwrap();
        a.apply_operation(op_b.clone()).unwrap();

        assert!(a.happened_before(&base.id, &op_a.id));
        assert_eq!(a.concurrent_with(&op_b.id, 16), vec![op_a.id]);
        assert!(a.concurrent_with(&base.id, 16).is_empty());
    }
}
