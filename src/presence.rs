//! In-memory presence: connection registry + room membership index.
//!
//! DESIGN
//! ======
//! Two structures kept in lockstep:
//! - `ConnectionRegistry`: connection handle -> durable session id.
//! - `RoomIndex`: presentation id -> live members and their event senders.
//!
//! Both live inside one `Presence` aggregate; `AppState` wraps it in a single
//! `RwLock` so every paired mutation is serialized and readers can never
//! observe the registry and the room index disagreeing. Rooms exist only
//! while non-empty: the last `evict` removes the room entry itself.
//!
//! Neither structure ever calls the Persistent Store. Presence is empty at
//! process start and rebuilt purely from live connection activity.

use std::collections::HashMap;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event::{ErrorCode, Event};

// =============================================================================
// CONNECTION HANDLE
// =============================================================================

/// Opaque handle for one live transport connection. Minted at websocket
/// upgrade, never reused after the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ConnId(Uuid);

impl ConnId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// A paired mutation would leave the two structures inconsistent. This is a
/// bug class, not an expected runtime condition; the lifecycle controller
/// reacts by forcing the affected connection out.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("connection {conn} is already a member of presentation {existing}")]
    AlreadyJoined { conn: ConnId, existing: Uuid },
}

impl ErrorCode for PresenceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyJoined { .. } => "E_INVARIANT",
        }
    }
}

// =============================================================================
// CONNECTION REGISTRY
// =============================================================================

/// Connection handle -> session id. No side effects beyond its own map.
#[derive(Default)]
pub struct ConnectionRegistry {
    bindings: HashMap<ConnId, Uuid>,
}

impl ConnectionRegistry {
    /// Associate a connection with a session. Overwrites any prior binding
    /// for the same connection; the newer binding is authoritative.
    pub fn bind(&mut self, conn: ConnId, session_id: Uuid) {
        self.bindings.insert(conn, session_id);
    }

    #[must_use]
    pub fn identity_of(&self, conn: ConnId) -> Option<Uuid> {
        self.bindings.get(&conn).copied()
    }

    pub fn unbind(&mut self, conn: ConnId) -> Option<Uuid> {
        self.bindings.remove(&conn)
    }

    /// Reverse lookup for reconnect detection. Linear scan; the map only
    /// holds currently-open connections.
    #[must_use]
    pub fn connection_for(&self, session_id: Uuid) -> Option<ConnId> {
        self.bindings
            .iter()
            .find(|(_, bound)| **bound == session_id)
            .map(|(conn, _)| *conn)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

// =============================================================================
// ROOM INDEX
// =============================================================================

/// Presentation id -> live members. Each member carries the sender the
/// broadcast router fans out over.
#[derive(Default)]
pub struct RoomIndex {
    rooms: HashMap<Uuid, HashMap<ConnId, mpsc::Sender<Event>>>,
}

impl RoomIndex {
    /// Add a member, creating the room if absent. Joining twice is a no-op
    /// on the membership set (the sender is refreshed).
    pub fn join(&mut self, presentation_id: Uuid, conn: ConnId, tx: mpsc::Sender<Event>) {
        self.rooms.entry(presentation_id).or_default().insert(conn, tx);
    }

    /// Remove a member. Deletes the room entry the moment it empties.
    /// Leaving a non-member (or an absent room) is a no-op.
    pub fn leave(&mut self, presentation_id: Uuid, conn: ConnId) -> bool {
        let Some(members) = self.rooms.get_mut(&presentation_id) else {
            return false;
        };
        let removed = members.remove(&conn).is_some();
        if members.is_empty() {
            self.rooms.remove(&presentation_id);
        }
        removed
    }

    /// Current members. Empty for an absent room, never an error.
    #[must_use]
    pub fn members_of(&self, presentation_id: Uuid) -> Vec<ConnId> {
        self.rooms
            .get(&presentation_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Distinguishes "no room" from "room with no members" (the latter must
    /// never exist).
    #[must_use]
    pub fn contains_room(&self, presentation_id: Uuid) -> bool {
        self.rooms.contains_key(&presentation_id)
    }

    /// Snapshot of member senders for fanout.
    #[must_use]
    pub fn senders(&self, presentation_id: Uuid) -> Vec<(ConnId, mpsc::Sender<Event>)> {
        self.rooms
            .get(&presentation_id)
            .map(|m| m.iter().map(|(conn, tx)| (*conn, tx.clone())).collect())
            .unwrap_or_default()
    }

    /// Which room a connection is in, if any.
    #[must_use]
    pub fn room_of(&self, conn: ConnId) -> Option<Uuid> {
        self.rooms
            .iter()
            .find(|(_, members)| members.contains_key(&conn))
            .map(|(id, _)| *id)
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

// =============================================================================
// PRESENCE AGGREGATE
// =============================================================================

/// Registry and room index behind one mutation surface. Callers hold the
/// surrounding lock for the duration of a paired operation, so the two maps
/// move in lockstep.
#[derive(Default)]
pub struct Presence {
    registry: ConnectionRegistry,
    rooms: RoomIndex,
}

impl Presence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection and add it to a room as one step.
    ///
    /// # Errors
    ///
    /// Refuses a connection that is already a member of any room: a handle
    /// belongs to at most one room, and the caller must evict first.
    pub fn admit(
        &mut self,
        conn: ConnId,
        session_id: Uuid,
        presentation_id: Uuid,
        tx: mpsc::Sender<Event>,
    ) -> Result<(), PresenceError> {
        if let Some(existing) = self.rooms.room_of(conn) {
            return Err(PresenceError::AlreadyJoined { conn, existing });
        }
        self.registry.bind(conn, session_id);
        self.rooms.join(presentation_id, conn, tx);
        Ok(())
    }

    /// Unbind a connection and remove it from its room as one step.
    /// Idempotent: evicting an unknown connection returns `None`.
    pub fn evict(&mut self, conn: ConnId) -> Option<Eviction> {
        let session_id = self.registry.unbind(conn);
        let presentation_id = self.rooms.room_of(conn);
        if let Some(presentation_id) = presentation_id {
            self.rooms.leave(presentation_id, conn);
        }
        match (session_id, presentation_id) {
            (None, None) => None,
            (session_id, presentation_id) => Some(Eviction { session_id, presentation_id }),
        }
    }

    #[must_use]
    pub fn identity_of(&self, conn: ConnId) -> Option<Uuid> {
        self.registry.identity_of(conn)
    }

    #[must_use]
    pub fn connection_for(&self, session_id: Uuid) -> Option<ConnId> {
        self.registry.connection_for(session_id)
    }

    #[must_use]
    pub fn members_of(&self, presentation_id: Uuid) -> Vec<ConnId> {
        self.rooms.members_of(presentation_id)
    }

    #[must_use]
    pub fn contains_room(&self, presentation_id: Uuid) -> bool {
        self.rooms.contains_room(presentation_id)
    }

    #[must_use]
    pub fn room_of(&self, conn: ConnId) -> Option<Uuid> {
        self.rooms.room_of(conn)
    }

    #[must_use]
    pub fn senders(&self, presentation_id: Uuid) -> Vec<(ConnId, mpsc::Sender<Event>)> {
        self.rooms.senders(presentation_id)
    }

    #[must_use]
    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.room_count()
    }

    /// Structural consistency check: every bound connection sits in exactly
    /// one room and every room member is bound. Used when a paired mutation
    /// is refused, and heavily by tests.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let mut seen = 0usize;
        for presentation_id in self.rooms.rooms.keys() {
            for conn in self.rooms.members_of(*presentation_id) {
                if self.registry.identity_of(conn).is_none() {
                    return false;
                }
                if self.rooms.room_of(conn) != Some(*presentation_id) {
                    return false;
                }
                seen += 1;
            }
        }
        // No orphan bindings and no hidden double-membership.
        seen == self.registry.len() && self.rooms.rooms.values().all(|m| !m.is_empty())
    }
}

/// What `evict` actually removed. Either side may be absent if a previous
/// cleanup already ran.
#[derive(Debug, Clone, Copy)]
pub struct Eviction {
    pub session_id: Option<Uuid>,
    pub presentation_id: Option<Uuid>,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Data;

    fn sender() -> mpsc::Sender<Event> {
        mpsc::channel(8).0
    }

    #[test]
    fn registry_bind_identity_unbind() {
        let mut registry = ConnectionRegistry::default();
        let conn = ConnId::new();
        let session = Uuid::new_v4();

        assert!(registry.identity_of(conn).is_none());
        registry.bind(conn, session);
        assert_eq!(registry.identity_of(conn), Some(session));
        assert_eq!(registry.unbind(conn), Some(session));
        assert!(registry.identity_of(conn).is_none());
        assert!(registry.unbind(conn).is_none());
    }

    #[test]
    fn registry_rebind_overwrites() {
        let mut registry = ConnectionRegistry::default();
        let conn = ConnId::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        registry.bind(conn, first);
        registry.bind(conn, second);
        assert_eq!(registry.identity_of(conn), Some(second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reverse_lookup_finds_bound_connection() {
        let mut registry = ConnectionRegistry::default();
        let conn = ConnId::new();
        let session = Uuid::new_v4();

        registry.bind(conn, session);
        assert_eq!(registry.connection_for(session), Some(conn));
        assert!(registry.connection_for(Uuid::new_v4()).is_none());
    }

    #[test]
    fn room_join_is_idempotent() {
        let mut rooms = RoomIndex::default();
        let presentation = Uuid::new_v4();
        let conn = ConnId::new();

        rooms.join(presentation, conn, sender());
        rooms.join(presentation, conn, sender());
        assert_eq!(rooms.members_of(presentation).len(), 1);
    }

    #[test]
    fn empty_room_is_removed_not_kept_empty() {
        let mut rooms = RoomIndex::default();
        let presentation = Uuid::new_v4();
        let conn = ConnId::new();

        rooms.join(presentation, conn, sender());
        assert!(rooms.contains_room(presentation));

        assert!(rooms.leave(presentation, conn));
        assert!(!rooms.contains_room(presentation), "last leave must delete the room entry");
        assert!(rooms.members_of(presentation).is_empty());
    }

    #[test]
    fn leave_non_member_is_noop() {
        let mut rooms = RoomIndex::default();
        let presentation = Uuid::new_v4();
        rooms.join(presentation, ConnId::new(), sender());

        assert!(!rooms.leave(presentation, ConnId::new()));
        assert!(!rooms.leave(Uuid::new_v4(), ConnId::new()));
        assert_eq!(rooms.members_of(presentation).len(), 1);
    }

    #[test]
    fn admit_refuses_second_room() {
        let mut presence = Presence::new();
        let conn = ConnId::new();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();

        presence.admit(conn, Uuid::new_v4(), room_a, sender()).expect("first admit");
        let err = presence.admit(conn, Uuid::new_v4(), room_b, sender());
        assert!(matches!(err, Err(PresenceError::AlreadyJoined { existing, .. }) if existing == room_a));
        assert!(presence.is_consistent());
    }

    #[test]
    fn evict_clears_both_structures() {
        let mut presence = Presence::new();
        let conn = ConnId::new();
        let session = Uuid::new_v4();
        let presentation = Uuid::new_v4();

        presence.admit(conn, session, presentation, sender()).expect("admit");
        assert!(presence.is_consistent());

        let eviction = presence.evict(conn).expect("eviction");
        assert_eq!(eviction.session_id, Some(session));
        assert_eq!(eviction.presentation_id, Some(presentation));

        assert!(presence.identity_of(conn).is_none());
        assert!(!presence.contains_room(presentation));
        assert!(presence.is_consistent());

        // Duplicate eviction (e.g. duplicate disconnect signal) is a no-op.
        assert!(presence.evict(conn).is_none());
    }

    #[test]
    fn interleaved_joins_and_evictions_stay_consistent() {
        let mut presence = Presence::new();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        let conns: Vec<ConnId> = (0..6).map(|_| ConnId::new()).collect();

        for (i, conn) in conns.iter().enumerate() {
            let room = if i % 2 == 0 { room_a } else { room_b };
            presence.admit(*conn, Uuid::new_v4(), room, sender()).expect("admit");
            assert!(presence.is_consistent(), "after admit {i}");
        }
        assert_eq!(presence.members_of(room_a).len(), 3);
        assert_eq!(presence.members_of(room_b).len(), 3);

        for (i, conn) in conns.iter().enumerate() {
            presence.evict(*conn);
            assert!(presence.is_consistent(), "after evict {i}");
        }
        assert_eq!(presence.registry_len(), 0);
        assert_eq!(presence.room_count(), 0);
    }

    #[test]
    fn senders_snapshot_matches_membership() {
        let mut presence = Presence::new();
        let presentation = Uuid::new_v4();
        let conn_a = ConnId::new();
        let conn_b = ConnId::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);

        presence.admit(conn_a, Uuid::new_v4(), presentation, tx_a).expect("admit a");
        presence.admit(conn_b, Uuid::new_v4(), presentation, sender()).expect("admit b");

        let senders = presence.senders(presentation);
        assert_eq!(senders.len(), 2);

        let (_, tx) = senders.iter().find(|(conn, _)| *conn == conn_a).expect("a present");
        tx.try_send(Event::new("member-joined", Data::new())).expect("send");
        assert_eq!(rx_a.try_recv().expect("recv").kind, "member-joined");
    }
}
