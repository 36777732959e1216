//! knockout-runtime: the tokio process around knockout-core.
//!
//! One [`arena::Arena`] owns the live state: membership registry, lobby
//! trackers, one actor task per running session and the notification
//! fan-out. [`ws_server::WsServer`] is the only transport.

pub mod arena;
pub mod cli;
pub mod config;
pub mod identity;
mod lobby;
pub mod notify;
pub mod protocol;
mod round;
pub mod ws_server;

pub use arena::{Arena, ClientHandle, JoinOutcome};
