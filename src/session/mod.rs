//! Per-command session lifecycle.

mod state;

pub use state::SessionState;
