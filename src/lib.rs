// ABOUTME: Root library module for the drover binary
// ABOUTME: Exposes the CLI and re-exports the engine and provider crates

pub mod cli;
pub mod logging;

pub use drover_agent as agent;
pub use drover_core as core;
pub use drover_core::{Config, Engine};
