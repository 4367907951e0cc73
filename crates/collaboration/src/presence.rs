/// Peer presence for collaborative editing
/// Shows where peers are working and their current selection.
///
/// Each session keeps only its peer's latest update; the view across all
/// peers is assembled on read and never stored.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use replica::ActorId;

/// Color assigned to a peer for cursor/selection highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PeerColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Generate a color based on peer ID (deterministic)
    pub fn from_actor(actor: ActorId) -> Self {
        let bytes = actor.0.as_bytes();
        Self {
            r: bytes[0],
            g: bytes[1],
            b: bytes[2],
        }
    }

    /// Convert to hex color string
    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Cursor position in a document, in characters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub path: String,
    pub offset: usize,
}

/// Selected character range in a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub path: String,
    pub start: usize,
    pub end: usize,
}

/// Presence update message; the latest one from a peer supersedes the rest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub peer_id: ActorId,
    pub display_name: String,
    pub color: PeerColor,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<Selection>,
    pub sent_at: DateTime<Utc>,
}

impl PresenceUpdate {
    pub fn new(peer_id: ActorId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            color: PeerColor::from_actor(peer_id),
            cursor: None,
            selection: None,
            sent_at: Utc::now(),
        }
    }

    pub fn with_cursor(mut self, path: impl Into<String>, offset: usize) -> Self {
        self.cursor = Some(CursorPosition {
            path: path.into(),
            offset,
        });
        self
    }

    pub fn with_selection(mut self, path: impl Into<String>, start: usize, end: usize) -> Self {
        self.selection = Some(Selection {
            path: path.into(),
            start,
            end,
        });
        self
    }
}

/// A peer's last known presence, as held by its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPresence {
    pub update: PresenceUpdate,
    pub received_at: DateTime<Utc>,
}

impl PeerPresence {
    pub fn new(update: PresenceUpdate) -> Self {
        Self {
            update,
            received_at: Utc::now(),
        }
    }

    /// Check if the peer is considered idle
    pub fn is_idle(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        let elapsed = now - self.received_at;
        elapsed.to_std().map(|e| e > threshold).unwrap_or(false)
    }

    pub fn is_in(&self, path: &str) -> bool {
        self.update.cursor.as_ref().map(|c| c.path == path).unwrap_or(false)
            || self.update.selection.as_ref().map(|s| s.path == path).unwrap_or(false)
    }
}

/// Session-scoped presence slot
#[derive(Debug, Clone, Default)]
pub struct PresenceSlot {
    latest: Option<PeerPresence>,
}

impl PresenceSlot {
    /// Store an update unless a newer one is already held.
    /// Returns false for stale updates.
    pub fn update(&mut self, update: PresenceUpdate) -> bool {
        if let Some(current) = &self.latest {
            if current.update.sent_at > update.sent_at {
                return false;
            }
        }
        self.latest = Some(PeerPresence::new(update));
        true
    }

    pub fn get(&self) -> Option<&PeerPresence> {
        self.latest.as_ref()
    }
}

/// Latest presence per peer across a set of session slots.
/// A peer connected through several sessions is reported once.
pub fn presence_union<'a>(slots: impl IntoIterator<Item = &'a PresenceSlot>) -> Vec<PeerPresence> {
    let mut latest: HashMap<ActorId, PeerPresence> = HashMap::new();
    for presence in slots.into_iter().filter_map(|slot| slot.get()) {
        match latest.get(&presence.update.peer_id) {
            Some(existing) if existing.update.sent_at >= presence.update.sent_at => {}
            _ => {
                latest.insert(presence.update.peer_id, presence.clone());
            }
        }
    }

    let mut peers: Vec<PeerPresence> = latest.into_values().collect();
    peers.sort_by(|a, b| a.update.display_name.cmp(&b.update.display_name));
    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_color_from_id() {
        let color = PeerColor::from_actor(ActorId::new());

        let hex = color.to_hex();
        assert!(hex.starts_with('#'));
        assert_eq!(hex.len(), 7);
    }

    #[test]
    fn test_stale_update_is_ignored() {
        let peer = ActorId::new();
        let mut slot = PresenceSlot::default();

        let newer = PresenceUpdate::new(peer, "ada").with_cursor("src/lib.rs", 10);
        let mut older = PresenceUpdate::new(peer, "ada").with_cursor("src/lib.rs", 3);
        older.sent_at = newer.sent_at - chrono::Duration::seconds(5);

        assert!(slot.update(newer));
        assert!(!slot.update(older));
        assert_eq!(slot.get().unwrap().update.cursor.as_ref().unwrap().offset, 10);
    }

    #[test]
    fn test_union_keeps_latest_per_peer() {
        let peer = ActorId::new();
        let other = ActorId::new();

        let mut first = PresenceSlot::default();
        let mut second = PresenceSlot::default();
        let mut third = PresenceSlot::default();

        let mut early = PresenceUpdate::new(peer, "ada").with_cursor("a.rs", 1);
        early.sent_at = Utc::now() - chrono::Duration::seconds(10);
        first.update(early);
        second.update(PresenceUpdate::new(peer, "ada").with_cursor("b.rs", 2));
        third.update(PresenceUpdate::new(other, "bob").with_selection("a.rs", 0, 4));

        let union = presence_union([&first, &second, &third]);
        assert_eq!(union.len(), 2);
        assert!(union[0].is_in("b.rs"));
        assert!(union[1].is_in("a.rs"));
    }

    #[test]
    fn test_idle_detection() {
        let mut presence = PeerPresence::new(PresenceUpdate::new(ActorId::new(), "bob"));
        let threshold = Duration::from_secs(60);

        // Initially not idle
        assert!(!presence.is_idle(threshold, Utc::now()));

        // Set activity to 2 minutes ago
        presence.received_at = Utc::now() - chrono::Duration::seconds(120);

        // Should be considered idle
        assert!(presence.is_idle(threshold, Utc::now()));
    }
}
