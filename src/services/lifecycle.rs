//! Session lifecycle: join, leave, disconnect, heartbeat.
//!
//! ARCHITECTURE
//! ============
//! Each websocket connection owns a `Connection` value whose `Phase` is an
//! explicit state machine. The machine makes illegal orderings (acting
//! before joining, joining twice, leaving after close) unrepresentable as
//! anything but a typed error.
//!
//! Ordering rules:
//! - Join admits into presence only after the store accepted the session;
//!   any later failure unwinds both sides.
//! - Leave and disconnect write the durable demotion first, then clear
//!   memory. A store failure never blocks the memory cleanup.
//! - All presence mutations happen under one write lock acquisition so the
//!   registry and room index move in lockstep.
//!
//! ERROR HANDLING
//! ==============
//! `LifecycleError` wraps store and presence errors and adds the two
//! lifecycle-specific conditions. Store outages during join fail closed;
//! during leave/disconnect they are logged and skipped.

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event::{Data, ErrorCode, Event};
use crate::presence::{ConnId, PresenceError};
use crate::services::broadcast;
use crate::services::store::{DeckSnapshot, Role, StoreError, UserSession};
use crate::state::AppState;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error("cannot {action} while {from}")]
    InvalidTransition { from: &'static str, action: &'static str },

    #[error("not a member of any presentation")]
    NotJoined,
}

impl ErrorCode for LifecycleError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
            Self::Presence(e) => e.error_code(),
            Self::InvalidTransition { .. } => "E_BAD_TRANSITION",
            Self::NotJoined => "E_NOT_JOINED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            Self::Presence(e) => e.retryable(),
            Self::InvalidTransition { .. } | Self::NotJoined => false,
        }
    }
}

// =============================================================================
// PHASE
// =============================================================================

/// Connection lifecycle state. The transient `Joining` and `Leaving` states
/// exist so a half-finished transition is visible as itself rather than as
/// either endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unjoined,
    Joining,
    Joined { presentation_id: Uuid, session_id: Uuid },
    Leaving { presentation_id: Uuid, session_id: Uuid },
    Disconnected,
    Closed,
}

impl Phase {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Unjoined => "unjoined",
            Self::Joining => "joining",
            Self::Joined { .. } => "joined",
            Self::Leaving { .. } => "leaving",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        }
    }

    fn refuse(self, action: &'static str) -> LifecycleError {
        LifecycleError::InvalidTransition { from: self.name(), action }
    }

    pub fn begin_join(self) -> Result<Self, LifecycleError> {
        match self {
            Self::Unjoined => Ok(Self::Joining),
            other => Err(other.refuse("join")),
        }
    }

    pub fn complete_join(self, presentation_id: Uuid, session_id: Uuid) -> Result<Self, LifecycleError> {
        match self {
            Self::Joining => Ok(Self::Joined { presentation_id, session_id }),
            other => Err(other.refuse("complete join")),
        }
    }

    /// Unwind a failed join attempt back to the starting state.
    #[must_use]
    pub fn abort_join(self) -> Self {
        match self {
            Self::Joining => Self::Unjoined,
            other => other,
        }
    }

    pub fn begin_leave(self) -> Result<Self, LifecycleError> {
        match self {
            Self::Joined { presentation_id, session_id } => {
                Ok(Self::Leaving { presentation_id, session_id })
            }
            other => Err(other.refuse("leave")),
        }
    }

    pub fn close(self) -> Result<Self, LifecycleError> {
        match self {
            Self::Leaving { .. } | Self::Disconnected | Self::Closed => Ok(Self::Closed),
            other => Err(other.refuse("close")),
        }
    }

    /// Transport dropped out from under the connection. A joined connection
    /// still has cleanup ahead; everything else is simply done.
    #[must_use]
    pub fn on_transport_loss(self) -> Self {
        match self {
            Self::Joined { .. } => Self::Disconnected,
            _ => Self::Closed,
        }
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Per-connection state owned by the websocket task.
pub struct Connection {
    pub conn_id: ConnId,
    pub tx: mpsc::Sender<Event>,
    pub phase: Phase,
}

impl Connection {
    #[must_use]
    pub fn new(conn_id: ConnId, tx: mpsc::Sender<Event>) -> Self {
        Self { conn_id, tx, phase: Phase::Unjoined }
    }

    /// `(presentation_id, session_id)` while joined, otherwise `None`.
    #[must_use]
    pub fn joined(&self) -> Option<(Uuid, Uuid)> {
        match self.phase {
            Phase::Joined { presentation_id, session_id } => Some((presentation_id, session_id)),
            _ => None,
        }
    }
}

// =============================================================================
// PRESENCE COLORS
// =============================================================================

const PRESENCE_COLORS: [&str; 8] = [
    "#ef4444", "#f97316", "#eab308", "#22c55e", "#14b8a6", "#3b82f6", "#8b5cf6", "#ec4899",
];

fn presence_color() -> &'static str {
    PRESENCE_COLORS[rand::rng().random_range(0..PRESENCE_COLORS.len())]
}

// =============================================================================
// OUTCOMES
// =============================================================================

#[derive(Debug)]
pub struct JoinOutcome {
    pub session: UserSession,
    pub snapshot: DeckSnapshot,
    /// Active roster including the joiner, ordered by join time.
    pub members: Vec<UserSession>,
    /// Stale connection pushed out by this join, if any.
    pub displaced: Option<DisplacedPeer>,
}

#[derive(Debug)]
pub struct DisplacedPeer {
    pub conn_id: ConnId,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Copy)]
pub struct Departure {
    pub presentation_id: Uuid,
    pub session_id: Uuid,
}

// =============================================================================
// JOIN
// =============================================================================

/// Admit a connection into a presentation.
///
/// Fails closed: if the presentation cannot be verified or the session
/// cannot be created, nothing is registered in memory and the connection's
/// phase returns to `Unjoined`.
///
/// # Errors
///
/// Store errors, an invalid phase, or a presence refusal.
pub async fn join(
    state: &AppState,
    conn: &mut Connection,
    presentation_id: Uuid,
    nickname: &str,
    role: Option<Role>,
) -> Result<JoinOutcome, LifecycleError> {
    conn.phase = conn.phase.begin_join()?;

    match join_inner(state, conn, presentation_id, nickname, role).await {
        Ok(outcome) => {
            conn.phase = conn
                .phase
                .complete_join(presentation_id, outcome.session.session_id)?;
            info!(
                conn_id = %conn.conn_id,
                %presentation_id,
                session_id = %outcome.session.session_id,
                nickname,
                "lifecycle: joined"
            );
            Ok(outcome)
        }
        Err(e) => {
            conn.phase = conn.phase.abort_join();
            Err(e)
        }
    }
}

async fn join_inner(
    state: &AppState,
    conn: &Connection,
    presentation_id: Uuid,
    nickname: &str,
    role: Option<Role>,
) -> Result<JoinOutcome, LifecycleError> {
    state.store.find_presentation(presentation_id).await?;

    let displaced = displace_stale_member(state, presentation_id, nickname).await?;

    let session = state
        .store
        .create_session(presentation_id, nickname, role.unwrap_or(Role::Editor), presence_color())
        .await?;

    {
        let mut presence = state.presence.write().await;
        if let Err(e) = presence.admit(conn.conn_id, session.session_id, presentation_id, conn.tx.clone())
        {
            // The connection claims one room while already sitting in
            // another. Force it out of both structures so the maps stay in
            // lockstep, then unwind the half-made session.
            warn!(conn_id = %conn.conn_id, error = %e, "lifecycle: presence refused admit");
            presence.evict(conn.conn_id);
            drop(presence);
            unwind_join(state, session.session_id).await;
            return Err(e.into());
        }
    }

    // Snapshot reads happen outside the lock; a failure here unwinds the
    // admit and the session.
    let snapshot = match state.store.deck_snapshot(presentation_id).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            state.presence.write().await.evict(conn.conn_id);
            unwind_join(state, session.session_id).await;
            return Err(e.into());
        }
    };
    let members = match state.store.list_active_sessions(presentation_id).await {
        Ok(members) => members,
        Err(e) => {
            state.presence.write().await.evict(conn.conn_id);
            unwind_join(state, session.session_id).await;
            return Err(e.into());
        }
    };

    Ok(JoinOutcome { session, snapshot, members, displaced })
}

/// Roll back a session created by a join that failed later. Best effort.
async fn unwind_join(state: &AppState, session_id: Uuid) {
    if let Err(e) = state.store.set_session_inactive(session_id).await {
        warn!(%session_id, error = %e, "lifecycle: failed to unwind session");
    }
}

/// Reconnect handling: a participant rejoining under the same nickname
/// pushes out their stale session and, if it still has a live connection,
/// that connection too. The stale socket gets a `session-replaced` notice
/// before its membership is removed, and the room gets `member-left` here
/// rather than at join completion: the displacement is already durable, so
/// peers must learn of it even when the rejoin itself then fails.
async fn displace_stale_member(
    state: &AppState,
    presentation_id: Uuid,
    nickname: &str,
) -> Result<Option<DisplacedPeer>, LifecycleError> {
    let sessions = state.store.list_active_sessions(presentation_id).await?;
    let Some(stale) = sessions.into_iter().find(|s| s.nickname == nickname) else {
        return Ok(None);
    };

    state.store.set_session_inactive(stale.session_id).await?;

    let displaced = {
        let mut presence = state.presence.write().await;
        let Some(conn_id) = presence.connection_for(stale.session_id) else {
            // Active row with no live connection: a crashed client the
            // reaper has not caught yet. Demoting the row was enough.
            return Ok(None);
        };
        let notice = Event::new("session-replaced", Data::new())
            .with_presentation_id(presentation_id)
            .with_data("session_id", stale.session_id.to_string());
        if let Some((_, tx)) = presence
            .senders(presentation_id)
            .into_iter()
            .find(|(member, _)| *member == conn_id)
        {
            // Best effort; the socket may already be gone.
            let _ = tx.try_send(notice);
        }
        presence.evict(conn_id);
        DisplacedPeer { conn_id, session_id: stale.session_id }
    };

    let notice = Event::new("member-left", Data::new())
        .with_presentation_id(presentation_id)
        .with_data("session_id", stale.session_id.to_string());
    broadcast::broadcast(state, presentation_id, &notice, None).await;

    info!(
        %presentation_id,
        session_id = %displaced.session_id,
        conn_id = %displaced.conn_id,
        "lifecycle: displaced stale connection"
    );
    Ok(Some(displaced))
}

// =============================================================================
// LEAVE / DISCONNECT
// =============================================================================

/// Voluntary departure. Durable demotion first, then memory cleanup; the
/// connection ends up `Closed` and the socket loop terminates.
///
/// # Errors
///
/// `NotJoined` when the connection has no membership. Store outages are
/// logged, not surfaced: memory cleanup must proceed regardless.
pub async fn leave(state: &AppState, conn: &mut Connection) -> Result<Departure, LifecycleError> {
    let Some((presentation_id, session_id)) = conn.joined() else {
        return Err(LifecycleError::NotJoined);
    };
    conn.phase = conn.phase.begin_leave()?;

    if let Err(e) = state.store.set_session_inactive(session_id).await {
        warn!(%session_id, error = %e, "lifecycle: session demotion deferred to reaper");
    }
    state.presence.write().await.evict(conn.conn_id);

    conn.phase = conn.phase.close()?;
    info!(conn_id = %conn.conn_id, %presentation_id, %session_id, "lifecycle: left");
    Ok(Departure { presentation_id, session_id })
}

/// Transport-level departure, keyed by handle alone so it can run after the
/// `Connection` value is unreachable. Same durable-then-memory ordering as
/// `leave`. Idempotent: a connection that already left, never joined, or was
/// displaced yields `None` and nothing is announced.
pub async fn disconnect(state: &AppState, conn_id: ConnId) -> Option<Departure> {
    let (session_id, presentation_id) = {
        let presence = state.presence.read().await;
        (presence.identity_of(conn_id), presence.room_of(conn_id))
    };

    let (session_id, presentation_id) = match (session_id, presentation_id) {
        (Some(session_id), Some(presentation_id)) => (session_id, presentation_id),
        (None, None) => return None,
        _ => {
            warn!(%conn_id, "lifecycle: disconnect found partial presence state");
            state.presence.write().await.evict(conn_id);
            return None;
        }
    };

    // Demote before evicting: a roster read must never see an active row
    // whose connection is already gone from presence.
    if let Err(e) = state.store.set_session_inactive(session_id).await {
        warn!(%session_id, error = %e, "lifecycle: session demotion deferred to reaper");
    }
    state.presence.write().await.evict(conn_id);

    info!(%conn_id, %presentation_id, %session_id, "lifecycle: disconnected");
    Some(Departure { presentation_id, session_id })
}

// =============================================================================
// HEARTBEAT
// =============================================================================

/// Refresh a session's heartbeat off the hot path. Any inbound traffic from
/// a joined connection counts; a failed touch only hastens the reaper.
pub fn touch_fire_and_forget(state: &AppState, session_id: Uuid) {
    let store = state.store.clone();
    tokio::spawn(async move {
        if let Err(e) = store.touch_last_seen(session_id).await {
            warn!(%session_id, error = %e, "lifecycle: heartbeat touch failed");
        }
    });
}

#[cfg(test)]
#[path = "lifecycle_test.rs"]
mod tests;
