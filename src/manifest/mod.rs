//! Build manifests and artifact bundles

pub mod types;
pub mod validator;

pub use types::{Artifact, Manifest, LUA_BUNDLE_FORMAT};
pub use validator::ManifestValidator;
