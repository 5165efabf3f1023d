//! Static analysis of artifact bundles
//!
//! The fast path of identity verification: inspect declared service names
//! without executing untrusted code.

pub mod analyzer;
pub mod lexer;

pub use analyzer::{Confidence, Finding, StaticAnalyzer, StaticReport, REGISTRATION_FUNCTIONS, SERVICE_SDK_MODULE};
