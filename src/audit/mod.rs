//! Audit trail of validation decisions

pub mod log;

pub use log::{AuditLog, AuditQuery, AuditRecord, Outcome, Stage};
