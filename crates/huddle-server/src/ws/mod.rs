//! Signaling transport: one websocket per client, JSON envelopes both ways

pub mod handler;
mod outbound;

pub use outbound::Outbound;
