//! Dynamic verification sandbox
//!
//! The slow path of identity verification: execute the bundle in an isolated
//! Lua VM with stubbed SDK modules and observe what it actually registers.

pub mod modules;
pub mod verifier;

pub use verifier::{version_satisfies, SandboxReport, SandboxVerifier};
