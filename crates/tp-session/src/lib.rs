//! Process layer for taskpilot: tagged subprocess spawning with tree
//! termination, per-backend CLI command templates, and the cooperative
//! shutdown signal.

pub mod cli_adapter;
pub mod process_registry;
pub mod shutdown;
