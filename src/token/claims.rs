//! Binding token claim set

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminator carried in every binding token
pub const BINDING_TOKEN_TYPE: &str = "workflow_binding";

/// Runtime configuration a deployment must exhibit to be promoted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedIdentity {
    /// The only service name the artifact may register
    pub service_name: String,
    /// Bundle file executed first (e.g., "main.lua")
    pub entry_point: String,
    /// Export of the entry point that serves requests
    pub handler_export: String,
    /// Upper bound on registered services, enforced on declared and read-back sets
    pub max_services: u32,
    pub min_sdk_version: String,
}

/// Signed claim set binding a workflow identity to its expected runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingClaims {
    #[serde(rename = "type")]
    pub token_type: String,
    pub unique_id: String,
    pub issued_at: DateTime<Utc>,
    pub workflow_id: String,
    pub owner_id: String,
    pub environment: String,
    pub expected_identity: ExpectedIdentity,
}

impl ExpectedIdentity {
    /// Reject identities that could never be satisfied by a deployment
    pub fn validate(&self) -> Result<(), String> {
        if self.service_name.trim().is_empty() {
            return Err("expectedIdentity.serviceName must not be empty".into());
        }
        if self.entry_point.trim().is_empty() {
            return Err("expectedIdentity.entryPoint must not be empty".into());
        }
        if self.handler_export.trim().is_empty() {
            return Err("expectedIdentity.handlerExport must not be empty".into());
        }
        if self.max_services == 0 {
            return Err("expectedIdentity.maxServices must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ExpectedIdentity {
        ExpectedIdentity {
            service_name: "wf-abc123".into(),
            entry_point: "main.lua".into(),
            handler_export: "handler".into(),
            max_services: 1,
            min_sdk_version: "1.0.0".into(),
        }
    }

    #[test]
    fn claims_use_camel_case_wire_names() {
        let claims = BindingClaims {
            token_type: BINDING_TOKEN_TYPE.into(),
            unique_id: "tok-1".into(),
            issued_at: Utc::now(),
            workflow_id: "wf-abc123".into(),
            owner_id: "owner-1".into(),
            environment: "production".into(),
            expected_identity: identity(),
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["type"], "workflow_binding");
        assert_eq!(json["uniqueId"], "tok-1");
        assert_eq!(json["expectedIdentity"]["serviceName"], "wf-abc123");
        assert_eq!(json["expectedIdentity"]["maxServices"], 1);
    }

    #[test]
    fn validate_rejects_unsatisfiable_identities() {
        assert!(identity().validate().is_ok());

        let mut bad = identity();
        bad.max_services = 0;
        assert!(bad.validate().is_err());

        let mut bad = identity();
        bad.service_name = "  ".into();
        assert!(bad.validate().is_err());
    }
}
