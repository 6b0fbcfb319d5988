//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the Persistent Store client and the live presence structures. The
//! single `RwLock<Presence>` is the one mutual-exclusion domain for all
//! registry/room mutations; store I/O always happens outside it.
//!
//! Presence has process lifetime: empty at startup, rebuilt purely from live
//! connection activity, dropped wholesale on restart.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::presence::Presence;
use crate::services::store::SessionStore;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum — all inner fields are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub presence: Arc<RwLock<Presence>>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store, presence: Arc::new(RwLock::new(Presence::new())) }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
