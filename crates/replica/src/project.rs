/// Project aggregate: roster, tracked files and their replicated documents
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::snapshot::{decode, encode};
use crate::{
    ActorId, ApplyOutcome, BufferLimits, Frontier, LocalEdit, Operation, ProjectId, ReplicaError,
    ReplicatedDocument, Result,
};

/// Shared handle to a document; the lock is the per-document merge exclusion
pub type DocumentHandle = Arc<Mutex<ReplicatedDocument>>;

/// Reference to the team's encryption key (key management lives elsewhere)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef(pub String);

/// Grow-only project metadata, merged by union
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub roster: BTreeSet<ActorId>,
    pub files: BTreeSet<String>,
    pub archived: bool,
}

impl ProjectMeta {
    pub fn merge(&mut self, other: &ProjectMeta) {
        self.roster.extend(other.roster.iter().copied());
        self.files.extend(other.files.iter().cloned());
        self.archived |= other.archived;
    }
}

#[derive(Serialize, Deserialize)]
struct ProjectState {
    id: ProjectId,
    root: PathBuf,
    key_ref: KeyRef,
    meta: ProjectMeta,
    documents: Vec<(String, Vec<u8>)>,
}

#[derive(Debug)]
pub struct Project {
    id: ProjectId,
    root: PathBuf,
    local_actor: ActorId,
    key_ref: KeyRef,
    meta: ProjectMeta,
    documents: BTreeMap<String, DocumentHandle>,
    limits: BufferLimits,
}

impl Project {
    pub fn new(id: ProjectId, root: impl Into<PathBuf>, local_actor: ActorId, key_ref: KeyRef) -> Self {
        Self::with_limits(id, root, local_actor, key_ref, BufferLimits::default())
    }

    pub fn with_limits(
        id: ProjectId,
        root: impl Into<PathBuf>,
        local_actor: ActorId,
        key_ref: KeyRef,
        limits: BufferLimits,
    ) -> Self {
        let mut meta = ProjectMeta::default();
        meta.roster.insert(local_actor);

        Self {
            id,
            root: root.into(),
            local_actor,
            key_ref,
            meta,
            documents: BTreeMap::new(),
            limits,
        }
    }

    pub fn id(&self) -> ProjectId {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn local_actor(&self) -> ActorId {
        self.local_actor
    }

    pub fn key_ref(&self) -> &KeyRef {
        &self.key_ref
    }

    pub fn meta(&self) -> &ProjectMeta {
        &self.meta
    }

    pub fn roster(&self) -> &BTreeSet<ActorId> {
        &self.meta.roster
    }

    pub fn is_archived(&self) -> bool {
        self.meta.archived
    }

    /// Returns true if the actor was not yet on the roster
    pub fn add_member(&mut self, actor: ActorId) -> bool {
        self.meta.roster.insert(actor)
    }

    pub fn merge_meta(&mut self, other: &ProjectMeta) {
        self.meta.merge(other);
        let files: Vec<String> = self.meta.files.iter().cloned().collect();
        for path in files {
            self.ensure_document(&path);
        }
    }

    pub fn archive(&mut self) {
        if !self.meta.archived {
            info!(project = %self.id, "archiving project");
        }
        self.meta.archived = true;
    }

    /// Tracked file paths, relative to the project root
    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.documents.keys()
    }

    pub fn document(&self, path: &str) -> Option<DocumentHandle> {
        self.documents.get(&normalize_path(path)).cloned()
    }

    /// Look up a document, starting to track it if it is new
    pub fn open_document(&mut self, path: &str) -> Result<DocumentHandle> {
        let path = normalize_path(path);
        if let Some(handle) = self.documents.get(&path) {
            return Ok(handle.clone());
        }
        if self.meta.archived {
            return Err(ReplicaError::Archived(self.id));
        }
        Ok(self.ensure_document(&path))
    }

    pub fn edit(&mut self, path: &str, edit: LocalEdit) -> Result<Operation> {
        if self.meta.archived {
            return Err(ReplicaError::Archived(self.id));
        }
        let handle = self.open_document(path)?;
        let op = handle.lock().create_local_operation(edit)?;
        Ok(op)
    }

    /// Apply an operation received from a peer; its author joins the roster
    pub fn apply_remote(&mut self, path: &str, op: Operation) -> Result<ApplyOutcome> {
        self.add_member(op.id.actor);
        let path = normalize_path(path);
        let handle = self.ensure_document(&path);
        let outcome = handle.lock().apply_operation(op)?;
        Ok(outcome)
    }

    pub fn frontiers(&self) -> BTreeMap<String, Frontier> {
        self.documents
            .iter()
            .map(|(path, handle)| (path.clone(), handle.lock().frontier().clone()))
            .collect()
    }

    /// Operations the holder of `frontiers` has not seen, grouped by file.
    /// Files absent from `frontiers` are sent in full.
    pub fn missing_for(&self, frontiers: &BTreeMap<String, Frontier>) -> Vec<(String, Vec<Operation>)> {
        let empty = Frontier::new();
        self.documents
            .iter()
            .filter_map(|(path, handle)| {
                let frontier = frontiers.get(path).unwrap_or(&empty);
                let ops = handle.lock().missing_for(frontier);
                (!ops.is_empty()).then(|| (path.clone(), ops))
            })
            .collect()
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let mut documents = Vec::with_capacity(self.documents.len());
        for (path, handle) in &self.documents {
            documents.push((path.clone(), handle.lock().snapshot()?));
        }

        encode(&ProjectState {
            id: self.id,
            root: self.root.clone(),
            key_ref: self.key_ref.clone(),
            meta: self.meta.clone(),
            documents,
        })
    }

    pub fn restore(bytes: &[u8], local_actor: ActorId) -> Result<Self> {
        Self::restore_with_limits(bytes, local_actor, BufferLimits::default())
    }

    pub fn restore_with_limits(bytes: &[u8], local_actor: ActorId, limits: BufferLimits) -> Result<Self> {
        let state: ProjectState = decode(bytes)?;
        let mut project = Self::with_limits(state.id, state.root, local_actor, state.key_ref, limits);
        project.meta.merge(&state.meta);

        for (path, doc_bytes) in state.documents {
            let doc = ReplicatedDocument::restore_with_limits(&doc_bytes, local_actor, limits)?;
            project.meta.files.insert(path.clone());
            project.documents.insert(path, Arc::new(Mutex::new(doc)));
        }
        Ok(project)
    }

    fn ensure_document(&mut self, path: &str) -> DocumentHandle {
        let limits = self.limits;
        let actor = self.local_actor;
        self.meta.files.insert(path.to_string());
        self.documents
            .entry(path.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ReplicatedDocument::with_limits(path, actor, limits)))
            })
            .clone()
    }
}

/// Canonical form of a project-relative path
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    unified
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(actor: ActorId) -> Project {
        Project::new(
            ProjectId(uuid::Uuid::from_u128(7)),
            "/work/demo",
            actor,
            KeyRef("team-key".into()),
        )
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src//main.rs"), "src/main.rs");
        assert_eq!(normalize_path("src\\lib.rs"), "src/lib.rs");
    }

    #[test]
    fn test_edit_tracks_file_and_roster() {
        let actor = ActorId::new();
        let mut p = project(actor);

        p.edit("./src/main.rs", LocalEdit::insert(0, "fn main() {}"))
            .unwrap();

        assert!(p.meta().files.contains("src/main.rs"));
        assert!(p.roster().contains(&actor));
        let doc = p.document("src/main.rs").unwrap();
        assert_eq!(doc.lock().text(), "fn main() {}");
    }

    #[test]
    fn test_remote_author_joins_roster() {
        let a = ActorId::new();
        let b = ActorId::new();
        let mut pa = project(a);
        let mut pb = project(b);

        let op = pa.edit("README.md", LocalEdit::insert(0, "# demo")).unwrap();
        pb.apply_remote("README.md", op).unwrap();

        assert!(pb.roster().contains(&a));
        assert_eq!(pb.document("README.md").unwrap().lock().text(), "# demo");
    }

    #[test]
    fn test_missing_for_groups_by_file() {
        let a = ActorId::new();
        let mut pa = project(a);
        pa.edit("a.txt", LocalEdit::insert(0, "a")).unwrap();
        pa.edit("b.txt", LocalEdit::insert(0, "b")).unwrap();

        let mut known = pa.frontiers();
        known.remove("b.txt");

        let missing = pa.missing_for(&known);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0, "b.txt");
    }

    #[test]
    fn test_archived_project_refuses_new_edits() {
        let mut p = project(ActorId::new());
        p.archive();

        assert!(matches!(
            p.edit("x.rs", LocalEdit::insert(0, "x")),
            Err(ReplicaError::Archived(_))
        ));
    }

    #[test]
    fn test_meta_merge_is_union() {
        let mut m1 = ProjectMeta::default();
        m1.files.insert("a".into());
        let mut m2 = ProjectMeta::default();
        m2.files.insert("b".into());
        m2.archived = true;

        m1.merge(&m2);
        assert_eq!(m1.files.len(), 2);
        assert!(m1.archived);
    }

    #[test]
    fn test_project_snapshot_round_trip() {
        let actor = ActorId::new();
        let mut p = project(actor);
        p.edit("src/lib.rs", LocalEdit::insert(0, "pub fn f() {}"))
            .unwrap();

        let bytes = p.snapshot().unwrap();
        let restored = Project::restore(&bytes, actor).unwrap();

        assert_eq!(restored.id(), p.id());
        assert_eq!(restored.meta(), p.meta());
        assert_eq!(
            restored.document("src/lib.rs").unwrap().lock().text(),
            "pub fn f() {}"
        );
    }
}
