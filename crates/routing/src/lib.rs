//! Inbound message routing.
//!
//! Every normalized message is gated by its channel rules, then matched
//! against broadcast groups and bindings to pick the agent(s) and session
//! keys that will handle it.

pub mod bindings;
pub mod context;
pub mod gating;
pub mod message;
pub mod router;

pub use {
    bindings::MatchedBy,
    context::{ContextEntry, ContextSnapshot, RecentContext},
    gating::Rejection,
    message::{Attachment, NormalizedMessage, Peer, PeerKind},
    router::{RouteDecision, RouteTarget, Router},
};
