//! HTTP and WebSocket front end of the relay broker.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod state;
pub mod ws;
