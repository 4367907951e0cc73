/// Conflict resolution through a reasoning backend
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use reasoning::{ConflictContext, ReasoningBackend, ReasoningError, Resolution};
use replica::{ActorId, OpId, ReplicatedDocument};

use crate::{Conflict, ConflictStatus, Decision, ResolutionPolicy};

/// Lines of context on each side of a conflict region
const SURROUNDING_LINES: usize = 3;

/// What to do with the answer to one reasoning call
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Apply the patch now
    AutoApply(Resolution),
    /// Hold the patch for an explicit accept or reject
    Propose(Resolution),
    /// Show the conflict with the explanation only
    Present(Resolution),
    /// No usable answer; try again later
    Failed(String),
}

impl Outcome {
    pub fn status(&self) -> ConflictStatus {
        match self {
            Self::AutoApply(_) => ConflictStatus::AutoResolved,
            Self::Propose(_) => ConflictStatus::ResolutionProposed,
            Self::Present(_) | Self::Failed(_) => ConflictStatus::PresentedToUser,
        }
    }
}

/// Holds the reasoning capability and the confidence policy
#[derive(Clone)]
pub struct ResolutionEngine {
    backend: Arc<dyn ReasoningBackend>,
    policy: ResolutionPolicy,
}

impl ResolutionEngine {
    pub fn new(backend: Arc<dyn ReasoningBackend>, policy: ResolutionPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &ResolutionPolicy {
        &self.policy
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Ask the backend, bounded by the reasoning timeout
    pub async fn request(&self, context: &ConflictContext) -> reasoning::Result<Resolution> {
        let timeout = self.policy.reasoning_timeout();
        let resolution = tokio::time::timeout(timeout, self.backend.resolve(context))
            .await
            .map_err(|_| ReasoningError::Timeout(timeout))??;
        resolution.validate()?;
        Ok(resolution)
    }

    /// Map a backend answer onto the confidence policy
    pub fn decide(&self, answer: reasoning::Result<Resolution>) -> Outcome {
        let resolution = match answer {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(backend = self.backend.name(), "reasoning failed: {}", e);
                return Outcome::Failed(e.to_string());
            }
        };

        match self.policy.decide(resolution.confidence) {
            Decision::AutoApply if resolution.patch.is_some() => Outcome::AutoApply(resolution),
            Decision::Propose if resolution.patch.is_some() => Outcome::Propose(resolution),
            decision => {
                debug!(?decision, confidence = resolution.confidence, "presenting conflict");
                Outcome::Present(Resolution {
                    patch: None,
                    ..resolution
                })
            }
        }
    }

    /// Request and decide in one step
    pub async fn resolve(&self, context: &ConflictContext) -> Outcome {
        let answer = self.request(context).await;
        self.decide(answer)
    }
}

/// Reconstruct what each side of a conflict wrote.
///
/// The local side is the contributing operations authored by `local_actor`
/// (or, when it took no part, by the lowest contributing actor); the remote
/// side is everything else that contributed.
pub fn build_context(
    doc: &ReplicatedDocument,
    conflict: &Conflict,
    local_actor: ActorId,
    language: Option<String>,
) -> ConflictContext {
    let contributing: BTreeSet<OpId> = conflict.contributing_operations.iter().copied().collect();
    let ours_actor = if contributing.iter().any(|id| id.actor == local_actor) {
        Some(local_actor)
    } else {
        contributing.iter().map(|id| id.actor).min()
    };
    let (ours, theirs): (BTreeSet<OpId>, BTreeSet<OpId>) = contributing
        .into_iter()
        .partition(|id| Some(id.actor) == ours_actor);

    let line_count = syntax::line_count(&doc.text());
    let start = conflict.region.start.min(line_count);
    let region = start..conflict.region.end.clamp(start, line_count);
    let surrounding =
        region.start.saturating_sub(SURROUNDING_LINES)..(region.end + SURROUNDING_LINES).min(line_count);

    ConflictContext {
        file_path: conflict.file_path.clone(),
        language,
        conflict_type: conflict.conflict_type,
        region: region.clone(),
        merged: doc.lines_text(region.clone()),
        local_version: doc.render_lines_excluding(region.clone(), &theirs),
        remote_version: doc.render_lines_excluding(region, &ours),
        surrounding_code: doc.lines_text(surrounding),
        diagnostics: conflict.diagnostics.clone(),
    }
}
