/// Peer sessions
///
/// One task per connection: handshake, an initial frontier exchange, then a
/// loop that merges inbound operations and streams local ones in short
/// batches. Nothing here holds a lock across a network await.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use replica::{ActorId, Frontier, OpId};

use crate::{
    check_hello, coalesce, Channel, CollaborationError, DocumentOps, PeerAddress, PresenceUpdate, Result,
    SessionId, SyncMessage, Workspace,
};

/// Health signal surfaced per peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerHealth {
    Healthy,
    /// The peer sent operations that could not be merged; a full resync was requested
    NeedsResync,
    Rejected,
}

impl fmt::Display for PeerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::NeedsResync => write!(f, "needs resync"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Work handed to a running session by the workspace
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Operations(Vec<DocumentOps>),
    Presence(PresenceUpdate),
    /// Operations this peer sent were dropped unresolved
    Resync,
    /// Project metadata changed locally; re-send our sync request
    Announce,
    Close,
}

/// Public view of a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer_id: ActorId,
    pub display_name: String,
    pub address: PeerAddress,
    pub protocol_version: u32,
    pub health: PeerHealth,
    /// Frontiers from the peer's latest sync request
    pub last_frontier: BTreeMap<String, Frontier>,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Closed from this side
    Closed,
    /// The peer went away
    Disconnected,
}

/// Exchange `Hello`s; a mismatched peer is told why and dropped
async fn handshake(workspace: &Workspace, channel: &mut Channel) -> Result<crate::PeerHello> {
    channel.send(workspace.hello())?;

    let timeout = workspace.config().handshake_timeout();
    let message = match tokio::time::timeout(timeout, channel.recv()).await {
        Ok(Some(message)) => message,
        Ok(None) => {
            return Err(CollaborationError::NetworkError(format!(
                "{} closed during handshake",
                channel.remote()
            )))
        }
        Err(_) => {
            return Err(CollaborationError::Timeout(format!(
                "no hello from {} within {:?}",
                channel.remote(),
                timeout
            )))
        }
    };

    if let SyncMessage::Error { message } = message {
        return Err(CollaborationError::Rejected(message));
    }

    let checked = check_hello(message, workspace.project_id(), workspace.config().protocol_version)
        .and_then(|hello| {
            if hello.peer_id == workspace.local_actor() {
                Err(CollaborationError::Rejected("peer has our own identity".into()))
            } else {
                Ok(hello)
            }
        });
    if let Err(e) = &checked {
        warn!(peer = %channel.remote(), "rejecting handshake: {}", e);
        let _ = channel.send(SyncMessage::Error {
            message: e.to_string(),
        });
    }
    checked
}

/// Drive one connection until it closes.
/// Handshake rejections are returned as errors so callers stop retrying.
pub(crate) async fn run_session(workspace: Workspace, mut channel: Channel) -> Result<SessionEnd> {
    let hello = match handshake(&workspace, &mut channel).await {
        Ok(hello) => hello,
        Err(e) => {
            channel.close().await;
            return Err(e);
        }
    };

    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    let info = SessionInfo {
        id: SessionId::new(),
        peer_id: hello.peer_id,
        display_name: hello.display_name,
        address: channel.remote().clone(),
        protocol_version: hello.protocol_version,
        health: PeerHealth::Healthy,
        last_frontier: BTreeMap::new(),
    };
    let session = info.id;
    info!(
        session = %session,
        peer = %info.peer_id,
        name = %info.display_name,
        address = %info.address,
        "session established"
    );
    workspace.register_session(info, commands_tx);

    let mut pending: Vec<DocumentOps> = Vec::new();
    let end = session_loop(&workspace, session, &mut channel, &mut commands, &mut pending).await;

    workspace.unregister_session(session);
    // Anything not handed to the channel survives in the durable queue
    while let Ok(command) = commands.try_recv() {
        if let SessionCommand::Operations(batch) = command {
            pending.extend(batch);
        }
    }
    if !pending.is_empty() {
        workspace.requeue(pending).await;
    }
    if end == SessionEnd::Closed {
        channel.close().await;
    }
    info!(session = %session, ?end, "session ended");
    Ok(end)
}

async fn session_loop(
    workspace: &Workspace,
    session: SessionId,
    channel: &mut Channel,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    pending: &mut Vec<DocumentOps>,
) -> SessionEnd {
    if channel.send(workspace.sync_request()).is_err() {
        return SessionEnd::Disconnected;
    }

    let queued = workspace.queued_batches();
    if !queued.is_empty() {
        let ids: HashSet<OpId> = queued
            .iter()
            .flat_map(|d| d.operations.iter().map(|op| op.id))
            .collect();
        if channel.send(SyncMessage::Operations { batch: queued }).is_err() {
            return SessionEnd::Disconnected;
        }
        debug!(session = %session, operations = ids.len(), "flushed outbound queue");
        workspace.drain_queue(&ids).await;
    }

    let mut batch_tick = tokio::time::interval(workspace.config().batch_window());

    loop {
        tokio::select! {
            message = channel.recv() => {
                let Some(message) = message else {
                    return SessionEnd::Disconnected;
                };
                if let Err(e) = handle_message(workspace, session, channel, message).await {
                    debug!(session = %session, "peer unreachable: {}", e);
                    return SessionEnd::Disconnected;
                }
            }
            command = commands.recv() => match command {
                Some(SessionCommand::Operations(batch)) => pending.extend(batch),
                Some(SessionCommand::Presence(update)) => {
                    // Presence is best effort and never retried
                    let _ = channel.send(SyncMessage::Presence { update });
                }
                Some(SessionCommand::Resync) => request_resync(workspace, session, channel),
                Some(SessionCommand::Announce) => {
                    if channel.send(workspace.sync_request()).is_err() {
                        return SessionEnd::Disconnected;
                    }
                }
                Some(SessionCommand::Close) | None => {
                    flush(channel, pending);
                    return SessionEnd::Closed;
                }
            },
            _ = batch_tick.tick(), if !pending.is_empty() => {
                if !flush(channel, pending) {
                    return SessionEnd::Disconnected;
                }
            }
        }
    }
}

/// Send coalesced pending operations; they stay pending if the channel is gone
fn flush(channel: &Channel, pending: &mut Vec<DocumentOps>) -> bool {
    if pending.is_empty() {
        return true;
    }
    let batch = coalesce(std::mem::take(pending));
    match channel.send(SyncMessage::Operations { batch: batch.clone() }) {
        Ok(()) => true,
        Err(_) => {
            *pending = batch;
            false
        }
    }
}

fn request_resync(workspace: &Workspace, session: SessionId, channel: &Channel) {
    warn!(session = %session, "peer needs a full resync");
    workspace.set_health(session, PeerHealth::NeedsResync);
    let _ = channel.send(workspace.sync_request());
}

async fn handle_message(
    workspace: &Workspace,
    session: SessionId,
    channel: &Channel,
    message: SyncMessage,
) -> Result<()> {
    match message {
        SyncMessage::SyncRequest { frontiers, meta } => {
            workspace.merge_meta(&meta);
            workspace.acknowledge(&frontiers).await;
            workspace.record_frontier(session, &frontiers);
            let documents = workspace.missing_for(&frontiers);
            debug!(
                session = %session,
                documents = documents.len(),
                "answering sync request"
            );
            channel.send(SyncMessage::SyncResponse { documents })?;
        }
        SyncMessage::SyncResponse { documents } => {
            let report = workspace.merge_from(session, documents).await;
            let health = if report.is_clean() {
                PeerHealth::Healthy
            } else {
                PeerHealth::NeedsResync
            };
            workspace.set_health(session, health);
        }
        SyncMessage::Operations { batch } => {
            let report = workspace.merge_from(session, batch).await;
            if !report.is_clean() {
                request_resync(workspace, session, channel);
            }
        }
        SyncMessage::Presence { update } => workspace.record_presence(session, update),
        SyncMessage::Ping => channel.send(SyncMessage::Pong)?,
        SyncMessage::Pong => {}
        SyncMessage::Error { message } => {
            warn!(session = %session, "peer reported: {}", message);
        }
        SyncMessage::Hello { .. } => {
            warn!(session = %session, "ignoring repeated hello");
        }
    }
    Ok(())
}
