// src/core/mod.rs

pub mod batch;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod fingerprint;
pub mod fragment;
pub mod loader;
pub mod manifest;
pub mod paths;
pub mod registry;
