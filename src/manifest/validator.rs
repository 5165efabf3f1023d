//! Manifest checks against token claims and the uploaded bundle

use crate::error::ValidationError;
use crate::manifest::types::{Artifact, Manifest, LUA_BUNDLE_FORMAT};
use crate::token::BindingClaims;

/// Stateless validator for build manifests
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestValidator;

impl ManifestValidator {
    pub fn new() -> Self {
        Self
    }

    /// Field-by-field comparison with the identity the token expects
    pub fn check(&self, manifest: &Manifest, claims: &BindingClaims) -> Result<(), ValidationError> {
        let expected = &claims.expected_identity;

        if manifest.entry_point != expected.entry_point {
            return Err(ValidationError::ManifestMismatch(format!(
                "entryPoint '{}' does not match expected '{}'",
                manifest.entry_point, expected.entry_point
            )));
        }
        if manifest.handler_export != expected.handler_export {
            return Err(ValidationError::ManifestMismatch(format!(
                "handlerExport '{}' does not match expected '{}'",
                manifest.handler_export, expected.handler_export
            )));
        }
        if manifest.artifact_hash.trim().is_empty() {
            return Err(ValidationError::ManifestMismatch(
                "artifactHash is missing".into(),
            ));
        }

        Ok(())
    }

    /// Tie the manifest to the bytes actually uploaded
    pub fn check_artifact(&self, manifest: &Manifest, artifact: &Artifact) -> Result<(), ValidationError> {
        if manifest.format != LUA_BUNDLE_FORMAT {
            return Err(ValidationError::ManifestMismatch(format!(
                "unsupported artifact format '{}', expected '{}'",
                manifest.format, LUA_BUNDLE_FORMAT
            )));
        }

        let actual = artifact.hash();
        if !manifest.artifact_hash.eq_ignore_ascii_case(&actual) {
            return Err(ValidationError::ManifestMismatch(format!(
                "artifactHash {} does not match uploaded bundle {}",
                manifest.artifact_hash, actual
            )));
        }

        if artifact.source(&manifest.entry_point).is_none() {
            return Err(ValidationError::ManifestMismatch(format!(
                "entry point '{}' is not part of the bundle",
                manifest.entry_point
            )));
        }

        Ok(())
    }
}
