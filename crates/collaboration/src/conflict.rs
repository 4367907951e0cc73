/// Conflict records and their lifecycle
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use tokio::time::Instant;
use uuid::Uuid;

use reasoning::{ConflictKind, Resolution};
use replica::OpId;

use crate::{CollaborationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictId(pub Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Detected,
    Analyzing,
    AutoResolved,
    ResolutionProposed,
    PresentedToUser,
    ManuallyResolved,
}

impl ConflictStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AutoResolved | Self::ManuallyResolved)
    }

    /// Statuses only move forward; a presented conflict may still be
    /// resolved by a retried analysis or by the user
    pub fn can_transition_to(&self, next: ConflictStatus) -> bool {
        use ConflictStatus::*;
        matches!(
            (self, next),
            (Detected, Analyzing)
                | (Analyzing, AutoResolved)
                | (Analyzing, ResolutionProposed)
                | (Analyzing, PresentedToUser)
                | (ResolutionProposed, ManuallyResolved)
                | (ResolutionProposed, PresentedToUser)
                | (PresentedToUser, AutoResolved)
                | (PresentedToUser, ResolutionProposed)
                | (PresentedToUser, ManuallyResolved)
        )
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Detected => "detected",
            Self::Analyzing => "analyzing",
            Self::AutoResolved => "auto_resolved",
            Self::ResolutionProposed => "resolution_proposed",
            Self::PresentedToUser => "presented_to_user",
            Self::ManuallyResolved => "manually_resolved",
        };
        write!(f, "{}", name)
    }
}

/// A compile-time, type-level or semantic inconsistency produced by a merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub file_path: String,

    /// Affected lines of the merged document (end exclusive)
    pub region: Range<usize>,

    pub conflict_type: ConflictKind,

    /// Language the file was analysed as
    #[serde(default)]
    pub language: Option<String>,

    /// Operations whose combination produced the conflict
    pub contributing_operations: Vec<OpId>,

    /// Confidence of the latest resolution, 0 until one is produced
    pub confidence: f64,

    pub status: ConflictStatus,

    /// Latest resolution; for presented conflicts it carries no patch
    pub resolution: Option<Resolution>,

    pub diagnostics: Vec<String>,

    /// The reasoning call failed and will be retried
    pub needs_retry: bool,

    /// A later conflict over the same region
    pub superseded_by: Option<ConflictId>,

    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conflict {
    pub fn new(
        file_path: impl Into<String>,
        region: Range<usize>,
        conflict_type: ConflictKind,
        contributing_operations: Vec<OpId>,
        diagnostics: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConflictId::new(),
            file_path: file_path.into(),
            region,
            conflict_type,
            language: None,
            contributing_operations,
            confidence: 0.0,
            status: ConflictStatus::Detected,
            resolution: None,
            diagnostics,
            needs_retry: false,
            superseded_by: None,
            detected_at: now,
            updated_at: now,
        }
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    /// Same file, and the regions share a line (empty regions count as one line)
    pub fn overlaps(&self, path: &str, region: &Range<usize>) -> bool {
        let end = |r: &Range<usize>| r.end.max(r.start + 1);
        self.file_path == path && self.region.start < end(region) && region.start < end(&self.region)
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal() && self.superseded_by.is_none()
    }
}

/// All conflicts of a workspace, in detection order
#[derive(Debug, Default)]
pub struct ConflictStore {
    conflicts: Vec<Conflict>,
    index: HashMap<ConflictId, usize>,

    /// Latest issued reasoning attempt per conflict
    attempts: HashMap<ConflictId, u64>,

    retry_at: HashMap<ConflictId, Instant>,
}

impl ConflictStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new conflict; older open conflicts over the same region are
    /// marked as superseded by it. Returns the superseded ids.
    pub fn insert(&mut self, conflict: Conflict) -> Vec<ConflictId> {
        let mut superseded = Vec::new();
        for older in self.conflicts.iter_mut() {
            if older.is_open() && older.overlaps(&conflict.file_path, &conflict.region) {
                older.superseded_by = Some(conflict.id);
                older.updated_at = Utc::now();
                superseded.push(older.id);
            }
        }
        for id in &superseded {
            self.retry_at.remove(id);
        }

        self.index.insert(conflict.id, self.conflicts.len());
        self.conflicts.push(conflict);
        superseded
    }

    pub fn get(&self, id: ConflictId) -> Result<&Conflict> {
        self.index
            .get(&id)
            .map(|&i| &self.conflicts[i])
            .ok_or(CollaborationError::ConflictNotFound(id))
    }

    fn get_mut(&mut self, id: ConflictId) -> Result<&mut Conflict> {
        match self.index.get(&id) {
            Some(&i) => Ok(&mut self.conflicts[i]),
            None => Err(CollaborationError::ConflictNotFound(id)),
        }
    }

    /// Conflicts of one file, or all of them
    pub fn list(&self, path: Option<&str>) -> Vec<Conflict> {
        self.conflicts
            .iter()
            .filter(|c| path.map_or(true, |p| c.file_path == p))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn transition(&mut self, id: ConflictId, next: ConflictStatus) -> Result<()> {
        let conflict = self.get_mut(id)?;
        if !conflict.status.can_transition_to(next) {
            return Err(CollaborationError::InvalidTransition(format!(
                "conflict {} cannot move from {} to {}",
                id, conflict.status, next
            )));
        }
        conflict.status = next;
        conflict.updated_at = Utc::now();
        Ok(())
    }

    /// Start a reasoning attempt, moving a fresh conflict to `Analyzing`.
    /// Only presented conflicts may be analysed again.
    pub fn begin_attempt(&mut self, id: ConflictId) -> Result<u64> {
        let conflict = self.get_mut(id)?;
        match conflict.status {
            ConflictStatus::Detected => {
                conflict.status = ConflictStatus::Analyzing;
                conflict.updated_at = Utc::now();
            }
            ConflictStatus::PresentedToUser if conflict.superseded_by.is_none() => {}
            status => {
                return Err(CollaborationError::InvalidTransition(format!(
                    "conflict {} is {} and cannot be analysed",
                    id, status
                )))
            }
        }
        self.retry_at.remove(&id);

        let attempt = self.attempts.entry(id).or_insert(0);
        *attempt += 1;
        Ok(*attempt)
    }

    /// Whether `attempt` is still the latest one issued for the conflict
    pub fn is_current(&self, id: ConflictId, attempt: u64) -> bool {
        self.attempts.get(&id) == Some(&attempt)
    }

    /// Store the outcome of a reasoning attempt.
    /// Returns false, leaving the conflict untouched, when a newer attempt
    /// has been issued or the conflict has been superseded.
    pub fn finish_attempt(
        &mut self,
        id: ConflictId,
        attempt: u64,
        status: ConflictStatus,
        resolution: Option<Resolution>,
        needs_retry: bool,
    ) -> Result<bool> {
        if !self.is_current(id, attempt) {
            return Ok(false);
        }
        let current = self.get(id)?.status;
        if current != status {
            self.transition(id, status)?;
        }

        let conflict = self.get_mut(id)?;
        if let Some(resolution) = &resolution {
            conflict.confidence = resolution.confidence;
        }
        if resolution.is_some() || conflict.resolution.is_none() {
            conflict.resolution = resolution;
        }
        conflict.needs_retry = needs_retry;
        conflict.updated_at = Utc::now();
        Ok(true)
    }

    pub fn schedule_retry(&mut self, id: ConflictId, at: Instant) {
        self.retry_at.insert(id, at);
    }

    /// Conflicts whose retry is due, removed from the retry list
    pub fn due_retries(&mut self, now: Instant) -> Vec<ConflictId> {
        let mut due: Vec<ConflictId> = self
            .retry_at
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        due.sort_by_key(|id| self.index.get(id).copied());
        for id in &due {
            self.retry_at.remove(id);
        }
        due.retain(|id| self.get(*id).map(|c| c.is_open()).unwrap_or(false));
        due
    }

    pub fn next_retry(&self) -> Option<Instant> {
        self.retry_at.values().min().copied()
    }

    /// Replace the stored resolution, e.g. after a user-chosen approach
    pub fn set_resolution(&mut self, id: ConflictId, resolution: Resolution) -> Result<()> {
        let conflict = self.get_mut(id)?;
        conflict.confidence = resolution.confidence;
        conflict.resolution = Some(resolution);
        conflict.needs_retry = false;
        conflict.updated_at = Utc::now();
        Ok(())
    }

    /// Stop treating in-flight attempts as current, e.g. once the user decided
    pub fn retire_attempts(&mut self, id: ConflictId) {
        if let Some(attempt) = self.attempts.get_mut(&id) {
            *attempt += 1;
        }
        self.retry_at.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(path: &str, region: Range<usize>) -> Conflict {
        Conflict::new(path, region, ConflictKind::CompileTime, Vec::new(), Vec::new())
    }

    fn resolution(confidence: f64) -> Resolution {
        Resolution {
            patch: None,
            explanation: "balance the braces".into(),
            confidence,
            alternatives: Vec::new(),
        }
    }

    #[test]
    fn test_status_never_regresses() {
        use ConflictStatus::*;

        assert!(Detected.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(ResolutionProposed));
        assert!(ResolutionProposed.can_transition_to(ManuallyResolved));
        assert!(PresentedToUser.can_transition_to(ManuallyResolved));

        assert!(!Analyzing.can_transition_to(Detected));
        assert!(!AutoResolved.can_transition_to(PresentedToUser));
        assert!(!ManuallyResolved.can_transition_to(ResolutionProposed));
        assert!(!Detected.can_transition_to(AutoResolved));
    }

    #[test]
    fn test_later_conflict_supersedes_overlapping_region() {
        let mut store = ConflictStore::new();
        let first = conflict("src/lib.rs", 3..6);
        let first_id = first.id;
        store.insert(first);
        store.insert(conflict("src/main.rs", 3..6));

        let second = conflict("src/lib.rs", 5..5);
        let second_id = second.id;
        assert_eq!(store.insert(second), vec![first_id]);

        let first = store.get(first_id).unwrap();
        assert_eq!(first.superseded_by, Some(second_id));
        assert_eq!(first.status, ConflictStatus::Detected);
        assert!(!first.is_open());
        assert_eq!(store.list(Some("src/lib.rs")).len(), 2);
        assert_eq!(store.list(None).len(), 3);
    }

    #[test]
    fn test_late_attempt_is_discarded() {
        let mut store = ConflictStore::new();
        let c = conflict("src/lib.rs", 0..1);
        let id = c.id;
        store.insert(c);

        let first = store.begin_attempt(id).unwrap();
        assert_eq!(store.get(id).unwrap().status, ConflictStatus::Analyzing);
        store
            .finish_attempt(id, first, ConflictStatus::PresentedToUser, None, true)
            .unwrap();

        let second = store.begin_attempt(id).unwrap();
        assert!(!store.is_current(id, first));

        // The retried call answers first; the original one arrives late
        assert!(store
            .finish_attempt(id, second, ConflictStatus::ResolutionProposed, Some(resolution(0.75)), false)
            .unwrap());
        assert!(!store
            .finish_attempt(id, first, ConflictStatus::PresentedToUser, Some(resolution(0.2)), false)
            .unwrap());

        let c = store.get(id).unwrap();
        assert_eq!(c.status, ConflictStatus::ResolutionProposed);
        assert_eq!(c.confidence, 0.75);
        assert!(!c.needs_retry);
    }

    #[test]
    fn test_retry_list() {
        let mut store = ConflictStore::new();
        let c = conflict("src/lib.rs", 0..1);
        let id = c.id;
        store.insert(c);
        let attempt = store.begin_attempt(id).unwrap();
        store
            .finish_attempt(id, attempt, ConflictStatus::PresentedToUser, None, true)
            .unwrap();

        let now = Instant::now();
        store.schedule_retry(id, now + std::time::Duration::from_secs(60));
        assert!(store.due_retries(now).is_empty());
        assert_eq!(store.due_retries(now + std::time::Duration::from_secs(61)), vec![id]);
        assert!(store.next_retry().is_none());
    }

    #[test]
    fn test_unknown_conflict() {
        let mut store = ConflictStore::new();
        assert!(matches!(
            store.transition(ConflictId::new(), ConflictStatus::Analyzing),
            Err(CollaborationError::ConflictNotFound(_))
        ));
    }
}
