//! Binding tokens
//!
//! Signed, revocable capability tokens that bind a workflow identity to the
//! runtime configuration its deployments must exhibit.

pub mod claims;
pub mod codec;
pub mod service;

pub use claims::{BindingClaims, ExpectedIdentity, BINDING_TOKEN_TYPE};
pub use codec::{peek_claims, TokenSigner, TokenVerifier};
pub use service::{IssueRequest, IssuedToken, TokenService};
