//! Execution plumbing for agent turns: shell exec, background processes,
//! sandbox contexts and tool policy.
//!
//! Policy is layered global → agent → sandbox → subagent; each layer may
//! only narrow what the previous ones allowed.

pub mod exec;
pub mod policy;
pub mod process;
pub mod sandbox;

pub use {
    exec::{ExecError, ExecOpts, ExecResult, exec_command},
    policy::{EffectivePolicy, resolve_policy},
    process::{ProcessError, ProcessInfo, ProcessRegistry},
};
