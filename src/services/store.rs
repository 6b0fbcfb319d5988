//! Persistent Store boundary: deck state and participant sessions.
//!
//! ARCHITECTURE
//! ============
//! The coordination layer treats the database as an opaque collaborator
//! behind the `SessionStore` trait. `PgStore` is the production
//! implementation over SQLx/Postgres; tests substitute an in-memory store.
//!
//! Deck actions are pass-through writes: the router never interprets deck
//! semantics beyond parsing the payload, and every broadcast happens only
//! after the write here has committed.
//!
//! ERROR HANDLING
//! ==============
//! Missing rows surface as typed not-found variants; everything the driver
//! reports collapses into `Unavailable`, the one retryable store error.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::event::{Data, ErrorCode};

// =============================================================================
// DOMAIN TYPES
// =============================================================================

/// Participant role within a presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "editor" => Some(Self::Editor),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presentation {
    pub id: Uuid,
    pub title: String,
    pub current_slide: i32,
    pub present_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    pub id: Uuid,
    pub slide_id: Uuid,
    pub content: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slide {
    pub id: Uuid,
    pub presentation_id: Uuid,
    pub position: i32,
    pub blocks: Vec<TextBlock>,
}

/// One participant's durable session record. Survives the connection; the
/// reaper or a leave only ever flips `active`, never deletes the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub session_id: Uuid,
    pub presentation_id: Uuid,
    pub nickname: String,
    pub role: Role,
    pub color: String,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Full deck state handed to a joiner: the presentation row plus its slides
/// with embedded text blocks, ordered by position.
#[derive(Debug, Clone, Serialize)]
pub struct DeckSnapshot {
    pub presentation: Presentation,
    pub slides: Vec<Slide>,
}

// =============================================================================
// DECK ACTIONS
// =============================================================================

/// The deck mutations the websocket relays. Parsed from inbound event
/// payloads, applied verbatim by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum DeckAction {
    AddSlide { position: Option<i32> },
    RemoveSlide { slide_id: Uuid },
    UpdateSlideIndex { slide_id: Uuid, position: i32 },
    UpdateCurrentSlide { index: i32 },
    AddTextBlock { slide_id: Uuid, content: String, x: f64, y: f64 },
    UpdateTextBlock { block_id: Uuid, content: Option<String>, x: Option<f64>, y: Option<f64> },
    RemoveTextBlock { block_id: Uuid },
    UpdateUserRole { session_id: Uuid, role: Role },
    EnterPresentMode,
    ExitPresentMode,
}

fn data_str<'a>(data: &'a Data, key: &str) -> Option<&'a str> {
    data.get(key).and_then(serde_json::Value::as_str)
}

fn data_uuid(data: &Data, key: &str) -> Result<Uuid, String> {
    data_str(data, key)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| format!("{key} required"))
}

fn data_i32(data: &Data, key: &str) -> Result<i32, String> {
    data.get(key)
        .and_then(serde_json::Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| format!("{key} required"))
}

fn data_f64(data: &Data, key: &str) -> Result<f64, String> {
    data.get(key)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| format!("{key} required"))
}

impl DeckAction {
    /// Parse an inbound event into a deck action.
    ///
    /// Returns `None` when the kind is not a deck action at all, and
    /// `Some(Err(..))` when the kind is recognized but the payload is
    /// malformed. The distinction lets the dispatcher produce different
    /// error messages for the two cases.
    pub fn parse(kind: &str, data: &Data) -> Option<Result<Self, String>> {
        let parsed = match kind {
            "add-slide" => {
                let position = data
                    .get("position")
                    .and_then(serde_json::Value::as_i64)
                    .and_then(|v| i32::try_from(v).ok());
                Ok(Self::AddSlide { position })
            }
            "remove-slide" => data_uuid(data, "slide_id").map(|slide_id| Self::RemoveSlide { slide_id }),
            "update-slide-index" => data_uuid(data, "slide_id").and_then(|slide_id| {
                data_i32(data, "position").map(|position| Self::UpdateSlideIndex { slide_id, position })
            }),
            "update-current-slide" => data_i32(data, "index").map(|index| Self::UpdateCurrentSlide { index }),
            "add-text-block" => data_uuid(data, "slide_id").and_then(|slide_id| {
                let content = data_str(data, "content").unwrap_or_default().to_string();
                let x = data_f64(data, "x")?;
                let y = data_f64(data, "y")?;
                Ok(Self::AddTextBlock { slide_id, content, x, y })
            }),
            "update-text-block" => data_uuid(data, "block_id").map(|block_id| Self::UpdateTextBlock {
                block_id,
                content: data_str(data, "content").map(ToString::to_string),
                x: data.get("x").and_then(serde_json::Value::as_f64),
                y: data.get("y").and_then(serde_json::Value::as_f64),
            }),
            "remove-text-block" => {
                data_uuid(data, "block_id").map(|block_id| Self::RemoveTextBlock { block_id })
            }
            "update-user-role" => data_uuid(data, "session_id").and_then(|session_id| {
                let role = data_str(data, "role")
                    .and_then(Role::from_str)
                    .ok_or_else(|| "role must be owner, editor, or viewer".to_string())?;
                Ok(Self::UpdateUserRole { session_id, role })
            }),
            "enter-present-mode" => Ok(Self::EnterPresentMode),
            "exit-present-mode" => Ok(Self::ExitPresentMode),
            _ => return None,
        };
        Some(parsed)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("presentation {0} not found")]
    PresentationNotFound(Uuid),

    #[error("slide {0} not found")]
    SlideNotFound(Uuid),

    #[error("text block {0} not found")]
    TextBlockNotFound(Uuid),

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        !matches!(self, Self::Unavailable(_))
    }
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::PresentationNotFound(_) => "E_PRESENTATION_NOT_FOUND",
            Self::SlideNotFound(_) => "E_SLIDE_NOT_FOUND",
            Self::TextBlockNotFound(_) => "E_TEXT_BLOCK_NOT_FOUND",
            Self::SessionNotFound(_) => "E_SESSION_NOT_FOUND",
            Self::Unavailable(_) => "E_STORE_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Everything the coordination layer needs from durable state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_presentation(&self, id: Uuid) -> Result<Presentation, StoreError>;

    async fn deck_snapshot(&self, id: Uuid) -> Result<DeckSnapshot, StoreError>;

    async fn create_session(
        &self,
        presentation_id: Uuid,
        nickname: &str,
        role: Role,
        color: &str,
    ) -> Result<UserSession, StoreError>;

    /// Flip a session inactive. Idempotent; an already-inactive or unknown
    /// session is left alone.
    async fn set_session_inactive(&self, session_id: Uuid) -> Result<(), StoreError>;

    async fn list_active_sessions(&self, presentation_id: Uuid) -> Result<Vec<UserSession>, StoreError>;

    async fn touch_last_seen(&self, session_id: Uuid) -> Result<(), StoreError>;

    /// Active sessions whose heartbeat is older than the threshold.
    async fn stale_sessions(&self, older_than: time::Duration) -> Result<Vec<UserSession>, StoreError>;

    /// Apply one deck action and return the delta to broadcast.
    async fn apply_action(
        &self,
        presentation_id: Uuid,
        action: &DeckAction,
    ) -> Result<serde_json::Value, StoreError>;
}

// =============================================================================
// POSTGRES IMPLEMENTATION
// =============================================================================

type SessionRow = (Uuid, Uuid, String, String, String, bool, OffsetDateTime, OffsetDateTime);

const SESSION_COLUMNS: &str = "id, presentation_id, nickname, role, color, active, joined_at, last_seen";

fn session_from_row(row: SessionRow) -> UserSession {
    let (session_id, presentation_id, nickname, role, color, active, joined_at, last_seen) = row;
    UserSession {
        session_id,
        presentation_id,
        nickname,
        // The role column carries a CHECK constraint; an unknown value can
        // only mean a schema drift, so degrade rather than fail the read.
        role: Role::from_str(&role).unwrap_or(Role::Viewer),
        color,
        active,
        joined_at,
        last_seen,
    }
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn find_presentation(&self, id: Uuid) -> Result<Presentation, StoreError> {
        let row: Option<(Uuid, String, i32, bool)> = sqlx::query_as(
            "SELECT id, title, current_slide, present_mode FROM presentations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let (id, title, current_slide, present_mode) =
            row.ok_or(StoreError::PresentationNotFound(id))?;
        Ok(Presentation { id, title, current_slide, present_mode })
    }

    async fn deck_snapshot(&self, id: Uuid) -> Result<DeckSnapshot, StoreError> {
        let presentation = self.find_presentation(id).await?;

        let slide_rows: Vec<(Uuid, Uuid, i32)> = sqlx::query_as(
            "SELECT id, presentation_id, position FROM slides \
             WHERE presentation_id = $1 ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let block_rows: Vec<(Uuid, Uuid, String, f64, f64)> = sqlx::query_as(
            "SELECT b.id, b.slide_id, b.content, b.x, b.y FROM text_blocks b \
             JOIN slides s ON s.id = b.slide_id WHERE s.presentation_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut blocks_by_slide: HashMap<Uuid, Vec<TextBlock>> = HashMap::new();
        for (id, slide_id, content, x, y) in block_rows {
            blocks_by_slide
                .entry(slide_id)
                .or_default()
                .push(TextBlock { id, slide_id, content, x, y });
        }

        let slides = slide_rows
            .into_iter()
            .map(|(id, presentation_id, position)| Slide {
                id,
                presentation_id,
                position,
                blocks: blocks_by_slide.remove(&id).unwrap_or_default(),
            })
            .collect();

        Ok(DeckSnapshot { presentation, slides })
    }

    async fn create_session(
        &self,
        presentation_id: Uuid,
        nickname: &str,
        role: Role,
        color: &str,
    ) -> Result<UserSession, StoreError> {
        // INSERT..SELECT so a vanished presentation surfaces as not-found
        // instead of a raw foreign key violation.
        let query = format!(
            "INSERT INTO user_sessions (id, presentation_id, nickname, role, color) \
             SELECT $1, $2, $3, $4, $5 \
             WHERE EXISTS (SELECT 1 FROM presentations WHERE id = $2) \
             RETURNING {SESSION_COLUMNS}"
        );
        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(presentation_id)
            .bind(nickname)
            .bind(role.as_str())
            .bind(color)
            .fetch_optional(&self.pool)
            .await?;

        row.map(session_from_row)
            .ok_or(StoreError::PresentationNotFound(presentation_id))
    }

    async fn set_session_inactive(&self, session_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE user_sessions SET active = FALSE WHERE id = $1 AND active")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_active_sessions(&self, presentation_id: Uuid) -> Result<Vec<UserSession>, StoreError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM user_sessions \
             WHERE presentation_id = $1 AND active ORDER BY joined_at"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&query)
            .bind(presentation_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(session_from_row).collect())
    }

    async fn touch_last_seen(&self, session_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE user_sessions SET last_seen = now() WHERE id = $1 AND active")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stale_sessions(&self, older_than: time::Duration) -> Result<Vec<UserSession>, StoreError> {
        let cutoff = OffsetDateTime::now_utc() - older_than;
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM user_sessions WHERE active AND last_seen < $1"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(session_from_row).collect())
    }

    async fn apply_action(
        &self,
        presentation_id: Uuid,
        action: &DeckAction,
    ) -> Result<serde_json::Value, StoreError> {
        match action {
            DeckAction::AddSlide { position } => {
                let id = Uuid::new_v4();
                let row: Option<(Uuid, Uuid, i32)> = match position {
                    Some(position) => {
                        sqlx::query_as(
                            "INSERT INTO slides (id, presentation_id, position) \
                             SELECT $1, $2, $3 \
                             WHERE EXISTS (SELECT 1 FROM presentations WHERE id = $2) \
                             RETURNING id, presentation_id, position",
                        )
                        .bind(id)
                        .bind(presentation_id)
                        .bind(position)
                        .fetch_optional(&self.pool)
                        .await?
                    }
                    None => {
                        // Append at the end of the deck.
                        sqlx::query_as(
                            "INSERT INTO slides (id, presentation_id, position) \
                             SELECT $1, $2, \
                                 (SELECT COALESCE(MAX(position) + 1, 0) FROM slides WHERE presentation_id = $2) \
                             WHERE EXISTS (SELECT 1 FROM presentations WHERE id = $2) \
                             RETURNING id, presentation_id, position",
                        )
                        .bind(id)
                        .bind(presentation_id)
                        .fetch_optional(&self.pool)
                        .await?
                    }
                };
                let (id, presentation_id, position) =
                    row.ok_or(StoreError::PresentationNotFound(presentation_id))?;
                let slide = Slide { id, presentation_id, position, blocks: Vec::new() };
                Ok(serde_json::json!({ "slide": slide }))
            }

            DeckAction::RemoveSlide { slide_id } => {
                let result = sqlx::query("DELETE FROM slides WHERE id = $1 AND presentation_id = $2")
                    .bind(slide_id)
                    .bind(presentation_id)
                    .execute(&self.pool)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::SlideNotFound(*slide_id));
                }
                Ok(serde_json::json!({ "slide_id": slide_id }))
            }

            DeckAction::UpdateSlideIndex { slide_id, position } => {
                let result = sqlx::query(
                    "UPDATE slides SET position = $1 WHERE id = $2 AND presentation_id = $3",
                )
                .bind(position)
                .bind(slide_id)
                .bind(presentation_id)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::SlideNotFound(*slide_id));
                }
                Ok(serde_json::json!({ "slide_id": slide_id, "position": position }))
            }

            DeckAction::UpdateCurrentSlide { index } => {
                let result = sqlx::query("UPDATE presentations SET current_slide = $1 WHERE id = $2")
                    .bind(index)
                    .bind(presentation_id)
                    .execute(&self.pool)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::PresentationNotFound(presentation_id));
                }
                Ok(serde_json::json!({ "current_slide": index }))
            }

            DeckAction::AddTextBlock { slide_id, content, x, y } => {
                let row: Option<(Uuid, Uuid, String, f64, f64)> = sqlx::query_as(
                    "INSERT INTO text_blocks (id, slide_id, content, x, y) \
                     SELECT $1, $2, $3, $4, $5 \
                     WHERE EXISTS (SELECT 1 FROM slides WHERE id = $2 AND presentation_id = $6) \
                     RETURNING id, slide_id, content, x, y",
                )
                .bind(Uuid::new_v4())
                .bind(slide_id)
                .bind(content)
                .bind(x)
                .bind(y)
                .bind(presentation_id)
                .fetch_optional(&self.pool)
                .await?;
                let (id, slide_id, content, x, y) = row.ok_or(StoreError::SlideNotFound(*slide_id))?;
                let block = TextBlock { id, slide_id, content, x, y };
                Ok(serde_json::json!({ "text_block": block }))
            }

            DeckAction::UpdateTextBlock { block_id, content, x, y } => {
                // COALESCE keeps any field the client omitted.
                let row: Option<(Uuid, Uuid, String, f64, f64)> = sqlx::query_as(
                    "UPDATE text_blocks b \
                     SET content = COALESCE($1, b.content), \
                         x = COALESCE($2, b.x), \
                         y = COALESCE($3, b.y) \
                     FROM slides s \
                     WHERE b.id = $4 AND b.slide_id = s.id AND s.presentation_id = $5 \
                     RETURNING b.id, b.slide_id, b.content, b.x, b.y",
                )
                .bind(content.as_deref())
                .bind(x)
                .bind(y)
                .bind(block_id)
                .bind(presentation_id)
                .fetch_optional(&self.pool)
                .await?;
                let (id, slide_id, content, x, y) = row.ok_or(StoreError::TextBlockNotFound(*block_id))?;
                let block = TextBlock { id, slide_id, content, x, y };
                Ok(serde_json::json!({ "text_block": block }))
            }

            DeckAction::RemoveTextBlock { block_id } => {
                let result = sqlx::query(
                    "DELETE FROM text_blocks b USING slides s \
                     WHERE b.id = $1 AND b.slide_id = s.id AND s.presentation_id = $2",
                )
                .bind(block_id)
                .bind(presentation_id)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::TextBlockNotFound(*block_id));
                }
                Ok(serde_json::json!({ "block_id": block_id }))
            }

            DeckAction::UpdateUserRole { session_id, role } => {
                let query = format!(
                    "UPDATE user_sessions SET role = $1 \
                     WHERE id = $2 AND presentation_id = $3 \
                     RETURNING {SESSION_COLUMNS}"
                );
                let row: Option<SessionRow> = sqlx::query_as(&query)
                    .bind(role.as_str())
                    .bind(session_id)
                    .bind(presentation_id)
                    .fetch_optional(&self.pool)
                    .await?;
                let session = row.map(session_from_row).ok_or(StoreError::SessionNotFound(*session_id))?;
                Ok(serde_json::json!({ "session": session }))
            }

            DeckAction::EnterPresentMode | DeckAction::ExitPresentMode => {
                let entering = matches!(action, DeckAction::EnterPresentMode);
                let result = sqlx::query("UPDATE presentations SET present_mode = $1 WHERE id = $2")
                    .bind(entering)
                    .bind(presentation_id)
                    .execute(&self.pool)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::PresentationNotFound(presentation_id));
                }
                Ok(serde_json::json!({ "present_mode": entering }))
            }
        }
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
