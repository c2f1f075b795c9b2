//! # System Interaction Layer
//!
//! The boundary between the loading core and the host shell.
//!
//! ## Modules
//!
//! - **`host`**: The `FragmentHost` seam and `SessionScope`, the in-process
//!   stand-in for a shell's global scope.
//! - **`hook`**: The command-not-found handler chain that replaces the host's
//!   lookup extension point.
//! - **`probe`**: Cached `PATH` lookups for external tools.
//! - **`executor`**: Runs loaded commands through an external interpreter.

pub mod executor;
pub mod hook;
pub mod host;
pub mod probe;
