/// Collaborative workspace
///
/// Owns one replicated project and everything around it: persistence, the
/// durable outbound queue, live peer sessions, and the conflict pipeline.
/// Merges complete under short synchronous locks; conflict analysis and
/// reasoning calls run on a background worker fed through a job channel.
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use reasoning::{LocalBackend, Patch, ReasoningBackend, Resolution};
use replica::{
    ActorId, Frontier, KeyRef, LocalEdit, OpId, Operation, Project, ProjectId, ProjectMeta, ReplicaError,
    SourceId,
};
use syntax::LanguageRegistry;

use crate::resolution::build_context;
use crate::session::{run_session, SessionCommand};
use crate::{
    presence_union, Channel, CollaborationError, Conflict, ConflictDetector, ConflictId, ConflictStatus, ConflictStore,
    DocumentOps, MemoryStore, MergeEvent, MergeOrigin, MergeView, OperatingMode, Outcome,
    OutboundQueue, OutboundQueueStore, PeerHealth, PeerPresence, PersistenceStore, PresenceSlot,
    PresenceUpdate, ResolutionEngine, ResolutionPolicy, Result, SessionEnd, SessionId, SessionInfo,
    SnapshotId, SyncConfig, SyncMessage, CONCURRENCY_WINDOW,
};

/// Poll interval while waiting for the analysis worker to go quiet
const SETTLE_POLL: Duration = Duration::from_millis(5);

/// How often buffered operations are checked against the retention window
const EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

enum Job {
    Merge(MergeEvent),
    Retry(ConflictId),
    /// Answered with whether the worker had nothing to do
    Barrier(oneshot::Sender<bool>),
}

struct SessionEntry {
    info: SessionInfo,
    presence: PresenceSlot,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

/// Totals of merging one inbound batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteMerge {
    pub applied: usize,
    pub buffered: usize,
    /// Operations rejected or dropped for lack of buffer space
    pub violations: usize,
}

impl RemoteMerge {
    pub fn is_clean(&self) -> bool {
        self.violations == 0
    }
}

struct Shared {
    project_id: ProjectId,
    local_actor: ActorId,
    display_name: String,
    config: SyncConfig,
    project: Mutex<Project>,
    conflicts: Mutex<ConflictStore>,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    queue: Mutex<OutboundQueue>,
    queue_store: OutboundQueueStore,
    /// Serializes queue writes so an older copy never lands last
    queue_save: tokio::sync::Mutex<()>,
    store: Arc<dyn PersistenceStore>,
    engine: ResolutionEngine,
    mode: watch::Sender<OperatingMode>,
    jobs: mpsc::UnboundedSender<Job>,
}

/// Handle to a running workspace; cheap to clone
#[derive(Clone)]
pub struct Workspace {
    shared: Arc<Shared>,
}

pub struct WorkspaceBuilder {
    project_id: ProjectId,
    root: PathBuf,
    local_actor: ActorId,
    display_name: Option<String>,
    key_ref: KeyRef,
    config: SyncConfig,
    policy: ResolutionPolicy,
    backend: Arc<dyn ReasoningBackend>,
    store: Arc<dyn PersistenceStore>,
    queue_store: OutboundQueueStore,
    registry: LanguageRegistry,
}

impl WorkspaceBuilder {
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn actor(mut self, actor: ActorId) -> Self {
        self.local_actor = actor;
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn key_ref(mut self, key_ref: KeyRef) -> Self {
        self.key_ref = key_ref;
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, policy: ResolutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ReasoningBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = store;
        self
    }

    pub fn queue_store(mut self, queue_store: OutboundQueueStore) -> Self {
        self.queue_store = queue_store;
        self
    }

    pub fn registry(mut self, registry: LanguageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Recover the project from persistence and start the analysis worker
    pub async fn open(self) -> Result<Workspace> {
        let limits = self.config.buffer_limits();
        let mut mode = OperatingMode::ReadWrite;

        let snapshots = self.store.load_snapshots(self.project_id).await?;
        let had_snapshots = !snapshots.is_empty();
        let mut project = None;
        let mut since = None;
        for snapshot in snapshots {
            match Project::restore_with_limits(&snapshot.bytes, self.local_actor, limits) {
                Ok(restored) if restored.id() == self.project_id => {
                    info!(project = %self.project_id, covers = snapshot.id.0, "restored snapshot");
                    project = Some(restored);
                    since = Some(snapshot.id);
                    break;
                }
                Ok(restored) => warn!(
                    expected = %self.project_id,
                    found = %restored.id(),
                    "ignoring snapshot of another project"
                ),
                Err(e) => warn!(project = %self.project_id, "unusable snapshot: {}", e),
            }
        }
        if had_snapshots && project.is_none() {
            let reason = "no usable snapshot".to_string();
            error!(project = %self.project_id, "{}, rebuilding from the operation log", reason);
            mode = OperatingMode::ReadOnly { reason };
        }
        let mut project = project.unwrap_or_else(|| {
            Project::with_limits(
                self.project_id,
                self.root.clone(),
                self.local_actor,
                self.key_ref.clone(),
                limits,
            )
        });
        project.add_member(self.local_actor);

        let replay = self.store.load_operations_since(self.project_id, since).await?;
        if replay.corrupt > 0 {
            let reason = format!("operation log has {} unreadable records", replay.corrupt);
            error!(project = %self.project_id, "{}", reason);
            mode = OperatingMode::ReadOnly { reason };
        }
        let replayed = replay.records.len();
        for record in replay.records {
            if let Err(e) = project.apply_remote(&record.path, record.operation) {
                warn!(path = %record.path, "log record could not be merged: {}", e);
            }
        }
        if replayed > 0 {
            debug!(project = %self.project_id, replayed, "replayed operation log");
        }

        let queue = match self.queue_store.load(self.project_id).await {
            Ok(queue) => queue,
            Err(e) => {
                warn!(project = %self.project_id, "discarding unreadable outbound queue: {}", e);
                OutboundQueue::new(self.project_id)
            }
        };

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (mode_tx, _) = watch::channel(mode);
        let display_name = self
            .display_name
            .unwrap_or_else(|| format!("peer-{}", self.local_actor));

        let shared = Arc::new(Shared {
            project_id: self.project_id,
            local_actor: self.local_actor,
            display_name,
            config: self.config,
            project: Mutex::new(project),
            conflicts: Mutex::new(ConflictStore::new()),
            sessions: Mutex::new(HashMap::new()),
            queue: Mutex::new(queue),
            queue_store: self.queue_store,
            queue_save: tokio::sync::Mutex::new(()),
            store: self.store,
            engine: ResolutionEngine::new(self.backend, self.policy),
            mode: mode_tx,
            jobs: jobs_tx,
        });

        tokio::spawn(analysis_worker(
            Arc::downgrade(&shared),
            jobs_rx,
            ConflictDetector::new(self.registry),
        ));
        tokio::spawn(expiry_worker(Arc::downgrade(&shared)));

        info!(
            project = %shared.project_id,
            actor = %shared.local_actor,
            name = %shared.display_name,
            "workspace open"
        );
        Ok(Workspace { shared })
    }
}

impl Workspace {
    pub fn builder(project_id: ProjectId) -> WorkspaceBuilder {
        WorkspaceBuilder {
            project_id,
            root: PathBuf::from("."),
            local_actor: ActorId::new(),
            display_name: None,
            key_ref: KeyRef("local".into()),
            config: SyncConfig::default(),
            policy: ResolutionPolicy::default(),
            backend: Arc::new(LocalBackend::new()),
            store: Arc::new(MemoryStore::new()),
            queue_store: OutboundQueueStore::in_memory(),
            registry: LanguageRegistry::with_builtin(),
        }
    }

    pub fn project_id(&self) -> ProjectId {
        self.shared.project_id
    }

    pub fn local_actor(&self) -> ActorId {
        self.shared.local_actor
    }

    pub fn display_name(&self) -> &str {
        &self.shared.display_name
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    // ----- Editing --------------------------------------------------------

    fn ensure_writable(&self) -> Result<()> {
        match &*self.shared.mode.borrow() {
            OperatingMode::ReadOnly { reason } => Err(CollaborationError::ReadOnly(reason.clone())),
            OperatingMode::ReadWrite => Ok(()),
        }
    }

    /// Apply a local edit and share it with every peer
    pub async fn edit(&self, path: &str, edit: LocalEdit) -> Result<Operation> {
        self.ensure_writable()?;
        let op = self.shared.project.lock().edit(path, edit)?;
        let path = replica::normalize_path(path);
        self.after_local(&path, vec![op.clone()], MergeOrigin::Local).await;
        Ok(op)
    }

    /// Replace `len` characters at `offset` with `text`
    pub async fn replace(&self, path: &str, offset: usize, len: usize, text: &str) -> Result<Vec<Operation>> {
        self.ensure_writable()?;
        let ops = {
            let handle = {
                let mut project = self.shared.project.lock();
                if project.is_archived() {
                    return Err(ReplicaError::Archived(project.id()).into());
                }
                project.open_document(path)?
            };
            let mut doc = handle.lock();
            doc.replace_range(offset, len, text)?
        };
        let path = replica::normalize_path(path);
        self.after_local(&path, ops.clone(), MergeOrigin::Local).await;
        Ok(ops)
    }

    /// Persist, publish and analyse operations created on this replica
    async fn after_local(&self, path: &str, ops: Vec<Operation>, origin: MergeOrigin) {
        if ops.is_empty() {
            return;
        }
        self.persist(path, &ops).await;
        self.publish(DocumentOps::new(path, ops.clone())).await;
        self.queue_job(Job::Merge(MergeEvent::new(
            path,
            ops.iter().map(|op| op.id).collect(),
            origin,
        )));
    }

    async fn persist(&self, path: &str, ops: &[Operation]) {
        if self.mode().is_read_only() {
            return;
        }
        for op in ops {
            if let Err(e) = self
                .shared
                .store
                .append_operation(self.shared.project_id, path, op)
                .await
            {
                self.enter_read_only(format!("cannot append to operation log: {}", e));
                return;
            }
        }
    }

    /// Hand operations to every session, or to the durable queue when offline
    async fn publish(&self, ops: DocumentOps) {
        let undelivered = {
            let sessions = self.shared.sessions.lock();
            let mut delivered = false;
            for entry in sessions.values() {
                if entry
                    .commands
                    .send(SessionCommand::Operations(vec![ops.clone()]))
                    .is_ok()
                {
                    delivered = true;
                }
            }
            (!delivered).then_some(ops)
        };
        if let Some(ops) = undelivered {
            self.requeue(vec![ops]).await;
        }
    }

    // ----- Sessions -------------------------------------------------------

    /// Run a session over an established channel until it ends
    pub async fn attach(&self, channel: Channel) -> Result<SessionEnd> {
        run_session(self.clone(), channel).await
    }

    pub(crate) fn hello(&self) -> SyncMessage {
        SyncMessage::Hello {
            peer_id: self.shared.local_actor,
            project_id: self.shared.project_id,
            protocol_version: self.shared.config.protocol_version,
            display_name: self.shared.display_name.clone(),
        }
    }

    /// Our frontiers and project metadata, opening an exchange with a peer
    pub(crate) fn sync_request(&self) -> SyncMessage {
        let project = self.shared.project.lock();
        SyncMessage::SyncRequest {
            frontiers: project.frontiers(),
            meta: project.meta().clone(),
        }
    }

    pub(crate) fn register_session(&self, info: SessionInfo, commands: mpsc::UnboundedSender<SessionCommand>) {
        self.shared.project.lock().add_member(info.peer_id);
        self.shared.sessions.lock().insert(
            info.id,
            SessionEntry {
                info,
                presence: PresenceSlot::default(),
                commands,
            },
        );
    }

    pub(crate) fn unregister_session(&self, id: SessionId) {
        self.shared.sessions.lock().remove(&id);
    }

    pub(crate) fn set_health(&self, id: SessionId, health: PeerHealth) {
        if let Some(entry) = self.shared.sessions.lock().get_mut(&id) {
            entry.info.health = health;
        }
    }

    pub(crate) fn record_frontier(&self, id: SessionId, frontiers: &BTreeMap<String, Frontier>) {
        if let Some(entry) = self.shared.sessions.lock().get_mut(&id) {
            entry.info.last_frontier = frontiers.clone();
        }
    }

    pub(crate) fn record_presence(&self, id: SessionId, update: PresenceUpdate) {
        if let Some(entry) = self.shared.sessions.lock().get_mut(&id) {
            entry.presence.update(update);
        }
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .shared
            .sessions
            .lock()
            .values()
            .map(|e| e.info.clone())
            .collect();
        sessions.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        sessions
    }

    /// Ask every session to close; their unsent operations are queued
    pub fn disconnect_all(&self) {
        for entry in self.shared.sessions.lock().values() {
            let _ = entry.commands.send(SessionCommand::Close);
        }
    }

    // ----- Synchronization ------------------------------------------------

    pub fn frontiers(&self) -> BTreeMap<String, Frontier> {
        self.shared.project.lock().frontiers()
    }

    pub(crate) fn missing_for(&self, frontiers: &BTreeMap<String, Frontier>) -> Vec<DocumentOps> {
        self.shared
            .project
            .lock()
            .missing_for(frontiers)
            .into_iter()
            .map(|(path, ops)| DocumentOps::new(path, ops))
            .collect()
    }

    /// Merge operations received from a peer
    pub async fn merge_remote(&self, batches: Vec<DocumentOps>) -> RemoteMerge {
        self.merge_batches(batches, None).await
    }

    /// Merge operations delivered over `session`
    pub(crate) async fn merge_from(&self, session: SessionId, batches: Vec<DocumentOps>) -> RemoteMerge {
        self.merge_batches(batches, Some(SourceId(session.0))).await
    }

    async fn merge_batches(&self, batches: Vec<DocumentOps>, source: Option<SourceId>) -> RemoteMerge {
        let mut totals = RemoteMerge::default();
        let mut merged: Vec<DocumentOps> = Vec::new();
        {
            let mut project = self.shared.project.lock();
            for batch in batches {
                for op in &batch.operations {
                    project.add_member(op.id.actor);
                }
                let handle = match project.open_document(&batch.path) {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(path = %batch.path, "rejecting operations: {}", e);
                        totals.violations += batch.operations.len();
                        continue;
                    }
                };
                let mut doc = handle.lock();
                let report = doc.merge_from(batch.operations, source);
                if !report.is_clean() {
                    warn!(
                        path = %batch.path,
                        rejected = report.rejected.len(),
                        overflowed = report.overflowed,
                        "merge violation"
                    );
                }
                totals.applied += report.applied.len();
                totals.buffered += report.buffered.len();
                totals.violations += report.rejected.len();

                let applied: Vec<Operation> = report
                    .applied
                    .iter()
                    .filter_map(|id| doc.operation(id).cloned())
                    .collect();
                if !applied.is_empty() {
                    merged.push(DocumentOps::new(doc.path(), applied));
                }
            }
        }

        for batch in merged {
            self.persist(&batch.path, &batch.operations).await;
            self.queue_job(Job::Merge(MergeEvent::new(
                batch.path,
                batch.operations.iter().map(|op| op.id).collect(),
                MergeOrigin::Remote,
            )));
        }
        totals
    }

    /// Drop buffered operations past the retention window.
    /// Returns how many were dropped per sending session.
    pub(crate) fn expire_pending(&self) -> BTreeMap<SessionId, usize> {
        let now = Utc::now();
        let mut dropped: BTreeMap<SessionId, usize> = BTreeMap::new();
        let project = self.shared.project.lock();
        let paths: Vec<String> = project.paths().cloned().collect();
        for handle in paths.iter().filter_map(|path| project.document(path)) {
            for expired in handle.lock().expire_pending(now) {
                match expired.source {
                    Some(SourceId(id)) => *dropped.entry(SessionId(id)).or_default() += 1,
                    None => debug!(op = %expired.id, "dropped operation with no live sender"),
                }
            }
        }
        dropped
    }

    /// Flag sessions whose operations were dropped and ask them for a full resync
    fn resync_senders(&self, dropped: BTreeMap<SessionId, usize>) {
        let sessions = self.shared.sessions.lock();
        for (session, count) in dropped {
            match sessions.get(&session) {
                Some(entry) => {
                    warn!(session = %session, dropped = count, "peer is behind");
                    let _ = entry.commands.send(SessionCommand::Resync);
                }
                None => debug!(session = %session, dropped = count, "sender already disconnected"),
            }
        }
    }

    // ----- Project metadata -----------------------------------------------

    pub fn roster(&self) -> BTreeSet<ActorId> {
        self.shared.project.lock().roster().clone()
    }

    pub fn is_archived(&self) -> bool {
        self.shared.project.lock().is_archived()
    }

    /// Union a peer's metadata into ours
    pub(crate) fn merge_meta(&self, meta: &ProjectMeta) {
        let mut project = self.shared.project.lock();
        let was_archived = project.is_archived();
        project.merge_meta(meta);
        if project.is_archived() && !was_archived {
            info!(project = %self.shared.project_id, "project archived by a peer");
        }
    }

    /// Archive the project: new files and edits are refused from now on.
    /// Peers learn about it on their next exchange.
    pub async fn archive(&self) -> Result<()> {
        self.shared.project.lock().archive();
        for entry in self.shared.sessions.lock().values() {
            let _ = entry.commands.send(SessionCommand::Announce);
        }
        self.checkpoint().await?;
        Ok(())
    }

    // ----- Durable outbound queue -----------------------------------------

    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub(crate) fn queued_batches(&self) -> Vec<DocumentOps> {
        self.shared.queue.lock().batches()
    }

    pub(crate) async fn requeue(&self, batches: Vec<DocumentOps>) {
        let added = self.shared.queue.lock().extend(batches);
        if added > 0 {
            debug!(added, "operations queued for later delivery");
            self.save_queue().await;
        }
    }

    pub(crate) async fn drain_queue(&self, ids: &HashSet<OpId>) {
        if self.shared.queue.lock().remove(ids) > 0 {
            self.save_queue().await;
        }
    }

    /// A peer's frontier proves it already holds these queued operations
    pub(crate) async fn acknowledge(&self, frontiers: &BTreeMap<String, Frontier>) {
        if self.shared.queue.lock().acknowledge(frontiers) > 0 {
            self.save_queue().await;
        }
    }

    async fn save_queue(&self) {
        let _guard = self.shared.queue_save.lock().await;
        let queue = self.shared.queue.lock().clone();
        if let Err(e) = self.shared.queue_store.save(&queue).await {
            self.enter_read_only(format!("cannot save outbound queue: {}", e));
        }
    }

    // ----- Persistence ----------------------------------------------------

    pub fn mode(&self) -> OperatingMode {
        self.shared.mode.borrow().clone()
    }

    /// Operating mode changes, e.g. to show a read-only banner
    pub fn subscribe_mode(&self) -> watch::Receiver<OperatingMode> {
        self.shared.mode.subscribe()
    }

    fn enter_read_only(&self, reason: String) {
        error!(project = %self.shared.project_id, "switching to read-only mode: {}", reason);
        self.shared.mode.send_replace(OperatingMode::ReadOnly { reason });
    }

    /// Write a snapshot covering everything logged so far
    pub async fn checkpoint(&self) -> Result<SnapshotId> {
        self.ensure_writable()?;
        let store = &self.shared.store;
        let position = store.log_position(self.shared.project_id).await?;
        let bytes = self.shared.project.lock().snapshot()?;
        match store.save_snapshot(self.shared.project_id, position, &bytes).await {
            Ok(id) => {
                info!(project = %self.shared.project_id, covers = id.0, "checkpoint written");
                Ok(id)
            }
            Err(e) => {
                self.enter_read_only(format!("cannot write snapshot: {}", e));
                Err(e)
            }
        }
    }

    // ----- Presence -------------------------------------------------------

    /// Broadcast where we are; best effort
    pub fn set_local_presence(&self, update: PresenceUpdate) {
        for entry in self.shared.sessions.lock().values() {
            let _ = entry.commands.send(SessionCommand::Presence(update.clone()));
        }
    }

    /// Latest presence of every connected peer
    pub fn presence(&self) -> Vec<PeerPresence> {
        let sessions = self.shared.sessions.lock();
        presence_union(sessions.values().map(|e| &e.presence))
    }

    /// Peers with recent activity in `path`
    pub fn active_in(&self, path: &str) -> Vec<PeerPresence> {
        let idle = self.shared.config.presence_idle();
        let now = Utc::now();
        self.presence()
            .into_iter()
            .filter(|p| p.is_in(path) && !p.is_idle(idle, now))
            .collect()
    }

    // ----- Query surface --------------------------------------------------

    pub fn paths(&self) -> Vec<String> {
        self.shared.project.lock().paths().cloned().collect()
    }

    pub fn get_document_snapshot(&self, path: &str) -> Result<String> {
        let handle = self
            .shared
            .project
            .lock()
            .document(path)
            .ok_or_else(|| CollaborationError::DocumentNotFound(path.to_string()))?;
        let text = handle.lock().text();
        Ok(text)
    }

    pub fn list_conflicts(&self, project: ProjectId) -> Result<Vec<Conflict>> {
        if project != self.shared.project_id {
            return Err(CollaborationError::ProjectMismatch {
                expected: self.shared.project_id,
                actual: project,
            });
        }
        Ok(self.shared.conflicts.lock().list(None))
    }

    pub fn conflicts_in(&self, path: &str) -> Vec<Conflict> {
        self.shared
            .conflicts
            .lock()
            .list(Some(&replica::normalize_path(path)))
    }

    pub fn conflict(&self, id: ConflictId) -> Result<Conflict> {
        self.shared.conflicts.lock().get(id).cloned()
    }

    /// Apply a proposed resolution's patch
    pub async fn accept_resolution(&self, id: ConflictId) -> Result<()> {
        let conflict = self.conflict(id)?;
        if conflict.status != ConflictStatus::ResolutionProposed {
            return Err(CollaborationError::InvalidTransition(format!(
                "conflict {} is {}, not proposed",
                id, conflict.status
            )));
        }
        let patch = conflict
            .resolution
            .as_ref()
            .and_then(|r| r.patch.clone())
            .ok_or_else(|| CollaborationError::InvalidTransition(format!("conflict {} has no patch", id)))?;

        self.apply_patch(&conflict.file_path, &patch).await?;
        let mut conflicts = self.shared.conflicts.lock();
        conflicts.retire_attempts(id);
        conflicts.transition(id, ConflictStatus::ManuallyResolved)
    }

    /// Decline a proposed resolution; the conflict is presented instead
    pub fn reject_resolution(&self, id: ConflictId) -> Result<()> {
        let mut conflicts = self.shared.conflicts.lock();
        conflicts.transition(id, ConflictStatus::PresentedToUser)?;
        if let Some(resolution) = conflicts.get(id)?.resolution.clone() {
            conflicts.set_resolution(
                id,
                Resolution {
                    patch: None,
                    ..resolution
                },
            )?;
        }
        Ok(())
    }

    /// Settle a conflict with the approach the user chose, e.g. at the end
    /// of an interactive exchange. A patch, if any, is applied first.
    pub async fn submit_user_resolution(&self, id: ConflictId, resolution: Resolution) -> Result<()> {
        let conflict = self.conflict(id)?;
        if !conflict.status.can_transition_to(ConflictStatus::ManuallyResolved) {
            return Err(CollaborationError::InvalidTransition(format!(
                "conflict {} is {} and cannot be resolved manually",
                id, conflict.status
            )));
        }
        if let Some(patch) = &resolution.patch {
            self.apply_patch(&conflict.file_path, patch).await?;
        }
        let mut conflicts = self.shared.conflicts.lock();
        conflicts.retire_attempts(id);
        conflicts.transition(id, ConflictStatus::ManuallyResolved)?;
        conflicts.set_resolution(id, resolution)
    }

    /// Ask the reasoning backend again for a presented conflict
    pub fn retry_conflict(&self, id: ConflictId) -> Result<()> {
        self.conflict(id)?;
        self.queue_job(Job::Retry(id));
        Ok(())
    }

    /// Replace a patch's lines, provided they still read as it expects
    async fn apply_patch(&self, path: &str, patch: &Patch) -> Result<Vec<Operation>> {
        self.ensure_writable()?;
        let ops = {
            let handle = self
                .shared
                .project
                .lock()
                .document(path)
                .ok_or_else(|| CollaborationError::DocumentNotFound(path.to_string()))?;
            let mut doc = handle.lock();
            let current = doc.lines_text(patch.lines.clone());
            if current != patch.original {
                return Err(CollaborationError::StalePatch(format!(
                    "lines {}..{} of {} changed since the patch was made",
                    patch.lines.start, patch.lines.end, path
                )));
            }
            let chars = doc.line_span_to_chars(patch.lines.clone());
            doc.replace_range(chars.start, chars.len(), &patch.replacement)?
        };
        debug!(path, operations = ops.len(), "applied resolution patch");
        self.after_local(path, ops.clone(), MergeOrigin::Resolution).await;
        Ok(ops)
    }

    /// Wait until every merge so far has been analysed and no reasoning
    /// call is in flight
    pub async fn settle(&self) {
        loop {
            let (tx, rx) = oneshot::channel();
            if self.shared.jobs.send(Job::Barrier(tx)).is_err() {
                return;
            }
            match rx.await {
                Ok(false) => tokio::time::sleep(SETTLE_POLL).await,
                Ok(true) | Err(_) => return,
            }
        }
    }

    fn queue_job(&self, job: Job) {
        if self.shared.jobs.send(job).is_err() {
            debug!("analysis worker has stopped");
        }
    }

    // ----- Analysis (worker side) -----------------------------------------

    fn analyze(&self, detector: &mut ConflictDetector, tasks: &mut JoinSet<(ConflictId, u64, Outcome)>, event: MergeEvent) {
        let Some(handle) = self.shared.project.lock().document(&event.path) else {
            return;
        };
        let view = {
            let doc = handle.lock();
            MergeView::capture(&doc, &event.ops, CONCURRENCY_WINDOW)
        };

        let language = detector.language_for(&view);
        for detected in detector.analyze(&view, event.origin) {
            let conflict = Conflict::new(
                detected.path,
                detected.region,
                detected.kind,
                detected.contributing,
                detected.diagnostics,
            )
            .with_language(language.clone());
            let id = conflict.id;
            info!(
                conflict = %id,
                path = %conflict.file_path,
                kind = %conflict.conflict_type,
                lines = ?conflict.region,
                "conflict detected"
            );
            let superseded = self.shared.conflicts.lock().insert(conflict);
            for old in superseded {
                debug!(conflict = %old, by = %id, "conflict superseded");
            }
            self.start_attempt(tasks, id);
        }
    }

    fn start_attempt(&self, tasks: &mut JoinSet<(ConflictId, u64, Outcome)>, id: ConflictId) {
        let (conflict, attempt) = {
            let mut conflicts = self.shared.conflicts.lock();
            let attempt = match conflicts.begin_attempt(id) {
                Ok(attempt) => attempt,
                Err(e) => {
                    debug!(conflict = %id, "not analysing: {}", e);
                    return;
                }
            };
            match conflicts.get(id) {
                Ok(conflict) => (conflict.clone(), attempt),
                Err(_) => return,
            }
        };

        let Some(handle) = self.shared.project.lock().document(&conflict.file_path) else {
            return;
        };
        let context = {
            let doc = handle.lock();
            build_context(&doc, &conflict, self.shared.local_actor, conflict.language.clone())
        };

        let engine = self.shared.engine.clone();
        debug!(conflict = %id, attempt, backend = engine.backend_name(), "requesting resolution");
        tasks.spawn(async move {
            let outcome = engine.resolve(&context).await;
            (id, attempt, outcome)
        });
    }

    async fn finish_attempt(&self, id: ConflictId, attempt: u64, outcome: Outcome) {
        if !self.shared.conflicts.lock().is_current(id, attempt) {
            debug!(conflict = %id, attempt, "discarding superseded resolution");
            return;
        }

        let (status, resolution, needs_retry) = match outcome {
            Outcome::AutoApply(resolution) => {
                let file_path = match self.conflict(id) {
                    Ok(conflict) => conflict.file_path,
                    Err(_) => return,
                };
                let applied = match &resolution.patch {
                    Some(patch) => self.apply_patch(&file_path, patch).await,
                    None => Ok(Vec::new()),
                };
                match applied {
                    Ok(_) => (ConflictStatus::AutoResolved, Some(resolution), false),
                    Err(e) => {
                        warn!(conflict = %id, "could not auto-apply resolution: {}", e);
                        let explanation = format!("{} (not applied: {})", resolution.explanation, e);
                        let presented = Resolution {
                            patch: None,
                            explanation,
                            ..resolution
                        };
                        (ConflictStatus::PresentedToUser, Some(presented), false)
                    }
                }
            }
            Outcome::Propose(resolution) => (ConflictStatus::ResolutionProposed, Some(resolution), false),
            Outcome::Present(resolution) => (ConflictStatus::PresentedToUser, Some(resolution), false),
            Outcome::Failed(reason) => {
                debug!(conflict = %id, "reasoning failed, scheduling retry: {}", reason);
                (ConflictStatus::PresentedToUser, None, true)
            }
        };

        let mut conflicts = self.shared.conflicts.lock();
        match conflicts.finish_attempt(id, attempt, status, resolution, needs_retry) {
            Ok(true) => {
                if needs_retry {
                    let retry_at = tokio::time::Instant::now() + self.shared.engine.policy().retry_interval();
                    conflicts.schedule_retry(id, retry_at);
                }
                info!(conflict = %id, status = %status, "conflict updated");
            }
            Ok(false) => debug!(conflict = %id, attempt, "discarding superseded resolution"),
            Err(e) => warn!(conflict = %id, "cannot record resolution: {}", e),
        }
    }
}

/// Drops buffered operations past their retention window, once per interval
/// for the whole project, and sends each sender a resync request
async fn expiry_worker(shared: Weak<Shared>) {
    let mut tick = tokio::time::interval(EXPIRY_INTERVAL);
    loop {
        tick.tick().await;
        let Some(shared) = shared.upgrade() else { break };
        let workspace = Workspace { shared };
        let dropped = workspace.expire_pending();
        if !dropped.is_empty() {
            workspace.resync_senders(dropped);
        }
    }
}

async fn analysis_worker(
    shared: Weak<Shared>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    mut detector: ConflictDetector,
) {
    let mut tasks: JoinSet<(ConflictId, u64, Outcome)> = JoinSet::new();

    loop {
        let next_retry = match shared.upgrade() {
            Some(shared) => shared.conflicts.lock().next_retry(),
            None => break,
        };
        let retry_sleep = tokio::time::sleep_until(
            next_retry.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600)),
        );

        tokio::select! {
            job = jobs.recv() => {
                let Some(job) = job else { break };
                let Some(shared) = shared.upgrade() else { break };
                let workspace = Workspace { shared };

                let mut batch = vec![job];
                while let Ok(job) = jobs.try_recv() {
                    batch.push(job);
                }

                let mut merges: Vec<MergeEvent> = Vec::new();
                let mut retries = Vec::new();
                let mut barriers = Vec::new();
                for job in batch {
                    match job {
                        Job::Merge(event) => match merges.iter_mut().find(|m| m.path == event.path) {
                            Some(existing) => existing.absorb(event),
                            None => merges.push(event),
                        },
                        Job::Retry(id) => retries.push(id),
                        Job::Barrier(reply) => barriers.push(reply),
                    }
                }

                let busy = !merges.is_empty() || !retries.is_empty();
                for event in merges {
                    workspace.analyze(&mut detector, &mut tasks, event);
                }
                for id in retries {
                    workspace.start_attempt(&mut tasks, id);
                }

                let quiet = !busy && tasks.is_empty();
                for reply in barriers {
                    let _ = reply.send(quiet);
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                let Some(shared) = shared.upgrade() else { break };
                match joined {
                    Ok((id, attempt, outcome)) => {
                        Workspace { shared }.finish_attempt(id, attempt, outcome).await;
                    }
                    Err(e) => warn!("resolution task failed: {}", e),
                }
            }
            _ = retry_sleep, if next_retry.is_some() => {
                let Some(shared) = shared.upgrade() else { break };
                let workspace = Workspace { shared };
                let due = workspace.shared.conflicts.lock().due_retries(tokio::time::Instant::now());
                for id in due {
                    debug!(conflict = %id, "retrying reasoning");
                    workspace.start_attempt(&mut tasks, id);
                }
            }
        }
    }
    debug!("analysis worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{pipe, TransportKind};
    use crate::PeerAddress;

    async fn open(project: ProjectId, store: Arc<MemoryStore>) -> Workspace {
        Workspace::builder(project).store(store).open().await.unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn connect(a: &Workspace, b: &Workspace) {
        let (ours, theirs) = pipe(
            PeerAddress::new(TransportKind::Memory, "b"),
            PeerAddress::new(TransportKind::Memory, "a"),
        );
        let a = a.clone();
        let b = b.clone();
        tokio::spawn(async move { a.attach(ours).await });
        tokio::spawn(async move { b.attach(theirs).await });
    }

    #[tokio::test]
    async fn test_offline_edits_are_logged_and_queued() {
        let store = Arc::new(MemoryStore::new());
        let project = ProjectId::new();
        let ws = open(project, store.clone()).await;

        ws.edit("notes.txt", LocalEdit::insert(0, "hello")).await.unwrap();
        ws.replace("./notes.txt", 0, 1, "j").await.unwrap();

        assert_eq!(ws.get_document_snapshot("notes.txt").unwrap(), "jello");
        assert_eq!(ws.queued_len(), 3);
        assert_eq!(store.record_count(project), 3);
        assert_eq!(ws.paths(), vec!["notes.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_write_enters_read_only() {
        let store = Arc::new(MemoryStore::new());
        let ws = open(ProjectId::new(), store.clone()).await;
        let mut mode = ws.subscribe_mode();

        store.set_fail_writes(true);
        ws.edit("a.txt", LocalEdit::insert(0, "x")).await.unwrap();

        mode.changed().await.unwrap();
        assert!(mode.borrow().is_read_only());
        assert!(matches!(
            ws.edit("a.txt", LocalEdit::insert(0, "y")).await,
            Err(CollaborationError::ReadOnly(_))
        ));
        // Reads keep working
        assert_eq!(ws.get_document_snapshot("a.txt").unwrap(), "x");
    }

    #[tokio::test]
    async fn test_recovery_from_checkpoint_and_log() {
        let store = Arc::new(MemoryStore::new());
        let project = ProjectId::new();
        let actor = ActorId::new();

        let ws = Workspace::builder(project)
            .actor(actor)
            .store(store.clone())
            .open()
            .await
            .unwrap();
        ws.edit("a.txt", LocalEdit::insert(0, "abc")).await.unwrap();
        ws.checkpoint().await.unwrap();
        ws.edit("a.txt", LocalEdit::insert(3, "def")).await.unwrap();
        drop(ws);

        let reopened = Workspace::builder(project)
            .actor(actor)
            .store(store)
            .open()
            .await
            .unwrap();
        assert_eq!(reopened.get_document_snapshot("a.txt").unwrap(), "abcdef");
        assert_eq!(reopened.mode(), OperatingMode::ReadWrite);

        // The counter continues past the recovered history
        let op = reopened.edit("a.txt", LocalEdit::insert(6, "!")).await.unwrap();
        assert_eq!(op.id.counter, 3);
    }

    #[tokio::test]
    async fn test_peers_converge_and_drain_queue() {
        let project = ProjectId::new();
        let a = open(project, Arc::new(MemoryStore::new())).await;
        let b = open(project, Arc::new(MemoryStore::new())).await;

        a.edit("notes.txt", LocalEdit::insert(0, "0123456789abcdef")).await.unwrap();
        assert_eq!(a.queued_len(), 1);
        connect(&a, &b);

        eventually(|| b.get_document_snapshot("notes.txt").is_ok()).await;
        eventually(|| a.queued_len() == 0).await;

        a.edit("notes.txt", LocalEdit::insert(10, "x=1")).await.unwrap();
        b.edit("notes.txt", LocalEdit::delete(5, 3)).await.unwrap();

        let expected = "0123489x=1abcdef";
        eventually(|| {
            a.get_document_snapshot("notes.txt").ok().as_deref() == Some(expected)
                && b.get_document_snapshot("notes.txt").ok().as_deref() == Some(expected)
        })
        .await;

        a.settle().await;
        b.settle().await;
        assert!(a.list_conflicts(project).unwrap().is_empty());
        assert!(b.list_conflicts(project).unwrap().is_empty());
        assert_eq!(a.sessions().len(), 1);
        assert_eq!(a.sessions()[0].peer_id, b.local_actor());
    }

    #[tokio::test]
    async fn test_presence_reaches_peer() {
        let project = ProjectId::new();
        let a = open(project, Arc::new(MemoryStore::new())).await;
        let b = open(project, Arc::new(MemoryStore::new())).await;
        connect(&a, &b);
        eventually(|| a.sessions().len() == 1 && b.sessions().len() == 1).await;

        a.set_local_presence(PresenceUpdate::new(a.local_actor(), "ada").with_cursor("src/lib.rs", 4));
        eventually(|| !b.presence().is_empty()).await;

        let seen = b.presence();
        assert_eq!(seen[0].update.peer_id, a.local_actor());
        assert_eq!(b.active_in("src/lib.rs").len(), 1);
        assert!(b.active_in("src/main.rs").is_empty());
    }

    #[tokio::test]
    async fn test_foreign_project_is_rejected() {
        let a = open(ProjectId::new(), Arc::new(MemoryStore::new())).await;
        let b = open(ProjectId::new(), Arc::new(MemoryStore::new())).await;
        let (ours, theirs) = pipe(
            PeerAddress::new(TransportKind::Memory, "b"),
            PeerAddress::new(TransportKind::Memory, "a"),
        );

        let (left, right) = tokio::join!(a.attach(ours), b.attach(theirs));
        assert!(left.is_err());
        assert!(right.is_err());
        assert!(a.sessions().is_empty());
        assert!(matches!(
            a.list_conflicts(b.project_id()),
            Err(CollaborationError::ProjectMismatch { .. })
        ));
    }
}
