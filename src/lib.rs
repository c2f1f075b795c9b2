//! Lazy command dispatch for shell profiles.
//!
//! Commands are registered up front from a manifest; the fragment that
//! defines a command is only sourced the first time the command is looked up.
//! Every load and dispatch is recorded as a tail-sampled wide event.

include!(concat!(env!("OUT_DIR"), "/translations.rs"));

pub mod cli;
pub mod constants;
pub mod core;
pub mod models;
pub mod session;
pub mod system;
