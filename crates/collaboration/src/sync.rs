/// Peer synchronization protocol
/// Messages are exchanged as JSON text frames over any [`Channel`](crate::Channel)
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use replica::{ActorId, Frontier, Operation, ProjectId, ProjectMeta};

use crate::{CollaborationError, PresenceUpdate, Result};

/// Operations of one document, in causal order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentOps {
    pub path: String,
    pub operations: Vec<Operation>,
}

impl DocumentOps {
    pub fn new(path: impl Into<String>, operations: Vec<Operation>) -> Self {
        Self {
            path: path.into(),
            operations,
        }
    }
}

/// Message types exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    // Connection management
    #[serde(rename = "hello")]
    Hello {
        peer_id: ActorId,
        project_id: ProjectId,
        protocol_version: u32,
        #[serde(default)]
        display_name: String,
    },

    // Operation synchronization
    #[serde(rename = "sync_request")]
    SyncRequest {
        frontiers: BTreeMap<String, Frontier>,
        /// Sender's roster, file set and archive flag
        #[serde(default)]
        meta: ProjectMeta,
    },

    #[serde(rename = "sync_response")]
    SyncResponse { documents: Vec<DocumentOps> },

    #[serde(rename = "operations")]
    Operations { batch: Vec<DocumentOps> },

    // Presence updates
    #[serde(rename = "presence")]
    Presence { update: PresenceUpdate },

    // Error handling
    #[serde(rename = "error")]
    Error { message: String },

    // Heartbeat
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}

impl SyncMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| CollaborationError::Protocol(format!("undecodable frame: {}", e)))
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::SyncRequest { .. } => "sync_request",
            Self::SyncResponse { .. } => "sync_response",
            Self::Operations { .. } => "operations",
            Self::Presence { .. } => "presence",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

/// Identity a peer announces in its `Hello`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHello {
    pub peer_id: ActorId,
    pub display_name: String,
    pub protocol_version: u32,
}

/// Validate a peer's `Hello` against the local project and version
pub fn check_hello(message: SyncMessage, project: ProjectId, version: u32) -> Result<PeerHello> {
    match message {
        SyncMessage::Hello {
            peer_id,
            project_id,
            protocol_version,
            display_name,
        } => {
            if project_id != project {
                return Err(CollaborationError::ProjectMismatch {
                    expected: project,
                    actual: project_id,
                });
            }
            if protocol_version != version {
                return Err(CollaborationError::Rejected(format!(
                    "protocol version {} is incompatible with {}",
                    protocol_version, version
                )));
            }
            Ok(PeerHello {
                peer_id,
                display_name,
                protocol_version,
            })
        }
        other => Err(CollaborationError::Protocol(format!(
            "expected hello, got {}",
            other.kind()
        ))),
    }
}

/// Merge batches for the same path, keeping first-seen order
pub fn coalesce(batches: impl IntoIterator<Item = DocumentOps>) -> Vec<DocumentOps> {
    let mut merged: Vec<DocumentOps> = Vec::new();
    for batch in batches {
        match merged.iter_mut().find(|d| d.path == batch.path) {
            Some(existing) => {
                for op in batch.operations {
                    if !existing.operations.iter().any(|o| o.id == op.id) {
                        existing.operations.push(op);
                    }
                }
            }
            None => merged.push(batch),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica::{LocalEdit, ReplicatedDocument};

    fn hello(project_id: ProjectId, protocol_version: u32) -> SyncMessage {
        SyncMessage::Hello {
            peer_id: ActorId::new(),
            project_id,
            protocol_version,
            display_name: "ada".into(),
        }
    }

    #[test]
    fn test_message_wire_format() {
        let json = SyncMessage::Ping.encode().unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);

        let mut doc = ReplicatedDocument::new("src/lib.rs", ActorId::new());
        let op = doc.create_local_operation(LocalEdit::insert(0, "fn")).unwrap();
        let mut frontiers = BTreeMap::new();
        frontiers.insert("src/lib.rs".to_string(), doc.frontier().clone());

        let mut meta = ProjectMeta::default();
        meta.files.insert("src/lib.rs".to_string());
        meta.archived = true;

        for message in [
            SyncMessage::SyncRequest { frontiers, meta },
            SyncMessage::Operations {
                batch: vec![DocumentOps::new("src/lib.rs", vec![op])],
            },
        ] {
            let decoded = SyncMessage::decode(&message.encode().unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_sync_request_without_meta_decodes() {
        let message = SyncMessage::decode(r#"{"type":"sync_request","frontiers":{}}"#).unwrap();
        assert_eq!(
            message,
            SyncMessage::SyncRequest {
                frontiers: BTreeMap::new(),
                meta: ProjectMeta::default(),
            }
        );
    }

    #[test]
    fn test_hello_rejections() {
        let project = ProjectId::new();

        assert!(check_hello(hello(project, 1), project, 1).is_ok());
        assert!(matches!(
            check_hello(hello(ProjectId::new(), 1), project, 1),
            Err(CollaborationError::ProjectMismatch { .. })
        ));
        assert!(matches!(
            check_hello(hello(project, 2), project, 1),
            Err(CollaborationError::Rejected(_))
        ));
        assert!(matches!(
            check_hello(SyncMessage::Pong, project, 1),
            Err(CollaborationError::Protocol(_))
        ));
    }

    #[test]
    fn test_garbage_frame_is_protocol_error() {
        assert!(matches!(
            SyncMessage::decode("{\"type\":\"teleport\"}"),
            Err(CollaborationError::Protocol(_))
        ));
    }

    #[test]
    fn test_coalesce_groups_by_path() {
        let mut doc = ReplicatedDocument::new("a", ActorId::new());
        let op1 = doc.create_local_operation(LocalEdit::insert(0, "x")).unwrap();
        let op2 = doc.create_local_operation(LocalEdit::insert(1, "y")).unwrap();

        let merged = coalesce(vec![
            DocumentOps::new("a", vec![op1.clone()]),
            DocumentOps::new("b", vec![]),
            DocumentOps::new("a", vec![op1, op2]),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].operations.len(), 2);
    }
}
