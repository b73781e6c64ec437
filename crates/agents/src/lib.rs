//! Model access for agent turns: auth profile rotation, HTTP providers,
//! CLI backends and cross-model failover.

pub mod auth_profiles;
pub mod cli_backend;
pub mod failover;
pub mod http;
pub mod model;

pub use {
    auth_profiles::{AuthError, AuthProfile, AuthProfileRegistry, AuthProfileStore, Credential, FailureReason},
    cli_backend::{CliBackend, CliBackendError, builtin_backends, parse_output},
    failover::{Attempt, FailoverError, ModelCaller, run_with_failover},
    model::{ChatMessage, ModelBackend, ModelRef, ModelRegistry, ModelReply, ModelRequest, ProviderError},
};
