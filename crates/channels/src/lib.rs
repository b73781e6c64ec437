//! Channel adapters: the edge where platform messages become
//! [`clawgate_routing::NormalizedMessage`]s and replies go back out.

pub mod adapter;
pub mod memory;
pub mod registry;
pub mod webhook;

pub use {
    adapter::{ChannelAdapter, ChannelError, ChannelStatus, InboundSink},
    memory::{MemoryChannel, OutboundRecord},
    registry::{AnyChannel, ChannelRegistry},
    webhook::WebhookChannel,
};
