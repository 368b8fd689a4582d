//! VaultPilot gateway: the operations pipeline, sync scheduler, event bus,
//! and REST/SSE API, wired over the store and upstream crates.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod runtime;
pub mod state;
