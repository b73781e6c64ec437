//! Gateway: the long-running control plane that owns the listen port.
//!
//! Lifecycle of one generation:
//! 1. Take the port lock (`lock`)
//! 2. Build every registry from the config snapshot (`state`)
//! 3. Serve `/health`, `/rpc`, `/ws` and webhook inbound routes (`server`)
//! 4. Pump channel messages through routing into agent turns (`dispatch`)
//! 5. Apply config reloads hot, or end the generation for a restart (`reload`)
//!
//! Domain logic lives in the sibling crates and is reached through the
//! method handlers registered in `methods.rs`.

pub mod auth;
pub mod dispatch;
pub mod events;
pub mod executor;
pub mod exit_codes;
pub mod lock;
pub mod methods;
pub mod reload;
pub mod server;
pub mod state;
pub mod ws;

pub use {
    dispatch::{AgentOutcome, Delivery, DispatchReport, InboundPump},
    events::{EventBus, GatewayEvent},
    executor::{AgentExecutor, LiveExecutor, TurnError, TurnInput},
    lock::{GatewayLock, LockError},
    methods::{MethodContext, MethodRegistry},
    server::{GatewayError, GatewayServer, build_gateway_app},
    state::{GatewayOptions, GatewayState, LogLevelHook},
};
