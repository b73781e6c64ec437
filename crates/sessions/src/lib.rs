//! Session storage and management.
//!
//! Sessions are stored as JSONL transcripts (one message per line) at
//! `<stateDir>/agents/<agentId>/sessions/<sessionId>.jsonl`, indexed by
//! session key in `sessions.json` next to them. Appends are file-locked.

pub mod key;
pub mod metadata;
pub mod registry;
pub mod store;

pub use {
    key::SessionKey,
    metadata::SessionEntry,
    registry::{ResolvedSession, SessionRegistry, SessionState},
    store::{Role, TranscriptMessage},
};
