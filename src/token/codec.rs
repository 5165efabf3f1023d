//! Binding token signing and verification
//!
//! Wire format: `base64url(claims JSON) "." base64url(Ed25519 signature)`, no padding.
//! The signature covers the encoded payload segment exactly as transmitted.

use crate::error::ValidationError;
use crate::token::claims::{BindingClaims, BINDING_TOKEN_TYPE};
use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use std::path::Path;

/// Issuing half of the key pair. Never serialised beyond the local key file.
pub struct TokenSigner {
    key: SigningKey,
}

/// Public half, safe to distribute to anything that verifies tokens
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    key: VerifyingKey,
}

impl TokenSigner {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_seed_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Signing key seed must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    /// Load the hex seed at `path`, creating a fresh key there on first start
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let seed_hex = std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("Failed to read signing key '{}': {}", path.display(), e)
            })?;
            return Self::from_seed_hex(&seed_hex);
        }

        tracing::warn!("🔑 No signing key at {}, generating a new one", path.display());
        let signer = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(signer.key.to_bytes()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(signer)
    }

    pub fn verifier(&self) -> TokenVerifier {
        TokenVerifier {
            key: self.key.verifying_key(),
        }
    }

    pub fn sign(&self, claims: &BindingClaims) -> Result<String> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signature = self.key.sign(payload.as_bytes());
        Ok(format!(
            "{}.{}",
            payload,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

impl TokenVerifier {
    pub fn from_public_hex(public_hex: &str) -> Result<Self> {
        let bytes = hex::decode(public_hex.trim())?;
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Public key must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self {
            key: VerifyingKey::from_bytes(&raw)?,
        })
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Check the signature and discriminator, returning the decoded claims
    ///
    /// Every failure is `TokenInvalid`; revocation is decided later against the
    /// workflow record.
    pub fn decode(&self, token: &str) -> Result<BindingClaims, ValidationError> {
        let (payload, signature) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| ValidationError::TokenInvalid("token is not of the form payload.signature".into()))?;

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| ValidationError::TokenInvalid("signature segment is not base64url".into()))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| ValidationError::TokenInvalid("signature has the wrong length".into()))?;

        self.key
            .verify_strict(payload.as_bytes(), &signature)
            .map_err(|_| ValidationError::TokenInvalid("signature verification failed".into()))?;

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| ValidationError::TokenInvalid("payload segment is not base64url".into()))?;
        let claims: BindingClaims = serde_json::from_slice(&claims_bytes)
            .map_err(|e| ValidationError::TokenInvalid(format!("malformed claims: {}", e)))?;

        if claims.token_type != BINDING_TOKEN_TYPE {
            return Err(ValidationError::TokenInvalid(format!(
                "unexpected token type '{}'",
                claims.token_type
            )));
        }

        Ok(claims)
    }
}

/// Decode the payload WITHOUT checking the signature
///
/// Only for labelling records of uploads that have not been verified yet.
/// Nothing read here may influence an accept decision.
pub fn peek_claims(token: &str) -> Option<BindingClaims> {
    let (payload, _) = token.trim().split_once('.')?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::claims::ExpectedIdentity;
    use crate::workflow::types::now_micros;

    fn claims() -> BindingClaims {
        BindingClaims {
            token_type: BINDING_TOKEN_TYPE.into(),
            unique_id: "tok-1".into(),
            issued_at: now_micros(),
            workflow_id: "wf-abc123".into(),
            owner_id: "owner-1".into(),
            environment: "production".into(),
            expected_identity: ExpectedIdentity {
                service_name: "wf-abc123".into(),
                entry_point: "main.lua".into(),
                handler_export: "handler".into(),
                max_services: 1,
                min_sdk_version: "1.0.0".into(),
            },
        }
    }

    #[test]
    fn signed_token_decodes_to_the_same_claims() {
        let signer = TokenSigner::generate();
        let original = claims();
        let token = signer.sign(&original).unwrap();
        let decoded = signer.verifier().decode(&token).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn foreign_key_is_rejected() {
        let token = TokenSigner::generate().sign(&claims()).unwrap();
        let err = TokenSigner::generate().verifier().decode(&token).unwrap_err();
        assert!(matches!(err, ValidationError::TokenInvalid(_)));
    }

    #[test]
    fn edited_payload_is_rejected() {
        let signer = TokenSigner::generate();
        let token = signer.sign(&claims()).unwrap();
        let (_, signature) = token.split_once('.').unwrap();

        let mut forged = claims();
        forged.expected_identity.service_name = "MaliciousService".into();
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());

        let err = signer
            .verifier()
            .decode(&format!("{}.{}", payload, signature))
            .unwrap_err();
        assert!(matches!(err, ValidationError::TokenInvalid(_)));
    }

    #[test]
    fn wrong_discriminator_is_rejected() {
        let signer = TokenSigner::generate();
        let mut other = claims();
        other.token_type = "session".into();
        let token = signer.sign(&other).unwrap();
        assert!(matches!(
            signer.verifier().decode(&token),
            Err(ValidationError::TokenInvalid(_))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        let verifier = TokenSigner::generate().verifier();
        for token in ["", "abc", "a.b", "!!!.???"] {
            assert!(matches!(verifier.decode(token), Err(ValidationError::TokenInvalid(_))));
        }
    }

    #[test]
    fn peek_reads_unsigned_payloads_without_trusting_them() {
        let mut forged = claims();
        forged.unique_id = "tok-forged".into();
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let token = format!("{}.AAAA", payload);

        assert_eq!(peek_claims(&token).map(|c| c.unique_id), Some("tok-forged".into()));
        assert!(TokenSigner::generate().verifier().decode(&token).is_err());
        assert!(peek_claims("not-a-token").is_none());
    }

    #[test]
    fn key_file_is_reused_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("binding_key.hex");

        let first = TokenSigner::load_or_generate(&path).unwrap();
        let second = TokenSigner::load_or_generate(&path).unwrap();
        assert_eq!(first.verifier().public_hex(), second.verifier().public_hex());

        let published = TokenVerifier::from_public_hex(&first.verifier().public_hex()).unwrap();
        let token = first.sign(&claims()).unwrap();
        assert!(published.decode(&token).is_ok());
    }
}
