//! Domain services used by the websocket routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own lifecycle, fanout, reaping, and persistence concerns
//! so the route handlers can stay focused on protocol translation.

pub mod broadcast;
pub mod lifecycle;
pub mod reaper;
pub mod store;
