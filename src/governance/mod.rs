//! Adapter governance: the policy gate applied on every backend operation.
//!
//! Authorization happens before dispatch and fails fast; denials are
//! terminal for the calling step and are never retried. The gate has no
//! side effects beyond one structured log event per denial.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::backends::{BackendKind, Payload};
use crate::error::{CoreError, Result};

/// Default policy stance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceMode {
    /// Deny unless an explicit allow entry exists.
    #[default]
    Strict,
    /// Allow unless an explicit deny entry exists.
    Lenient,
}

/// Policy entry for one `(kind, operation)` pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyRule {
    pub allow: bool,
    /// Payload field whitelist. `None` leaves the payload unconstrained.
    pub fields: Option<Vec<String>>,
    /// Ceiling on the serialized payload size in bytes.
    pub max_payload_bytes: Option<usize>,
}

impl Default for PolicyRule {
    fn default() -> Self {
        Self {
            allow: true,
            fields: None,
            max_payload_bytes: None,
        }
    }
}

/// Governance configuration.
///
/// Policy keys are `"<kind>.<operation>"`, e.g. `"vector.add_documents"`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub mode: GovernanceMode,
    pub policies: HashMap<String, PolicyRule>,
}

impl GovernanceConfig {
    /// A lenient gate with no explicit policies; everything passes.
    pub fn permissive() -> Self {
        Self {
            mode: GovernanceMode::Lenient,
            policies: HashMap::new(),
        }
    }
}

/// Saga/step context a caller may attach for denial logging.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    pub saga_id: Option<Uuid>,
    pub step_id: Option<String>,
}

impl OpContext {
    pub fn for_step(saga_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            saga_id: Some(saga_id),
            step_id: Some(step_id.into()),
        }
    }
}

/// The policy gate.
pub struct GovernanceGate {
    mode: GovernanceMode,
    policies: HashMap<String, PolicyRule>,
}

impl GovernanceGate {
    pub fn new(config: GovernanceConfig) -> Self {
        Self {
            mode: config.mode,
            policies: config.policies,
        }
    }

    fn rule(&self, kind: BackendKind, operation: &str) -> Option<&PolicyRule> {
        self.policies.get(&format!("{}.{}", kind, operation))
    }

    fn deny(
        &self,
        kind: BackendKind,
        operation: &str,
        reason: &str,
        ctx: Option<&OpContext>,
    ) -> CoreError {
        warn!(
            kind = %kind,
            operation = %operation,
            reason = %reason,
            saga_id = ?ctx.and_then(|c| c.saga_id),
            step_id = ?ctx.and_then(|c| c.step_id.as_deref()),
            "governance denied operation"
        );
        #[cfg(feature = "otel")]
        crate::utils::metrics::GOVERNANCE_DENIED_TOTAL.add(1, &[]);
        CoreError::PolicyDenied {
            kind,
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Authorize a `(kind, operation)` pair.
    pub fn ensure_allowed(
        &self,
        kind: BackendKind,
        operation: &str,
        ctx: Option<&OpContext>,
    ) -> Result<()> {
        match (self.mode, self.rule(kind, operation)) {
            (_, Some(rule)) if !rule.allow => {
                Err(self.deny(kind, operation, "Disallowed", ctx))
            }
            (_, Some(_)) => Ok(()),
            (GovernanceMode::Strict, None) => {
                Err(self.deny(kind, operation, "UnknownPolicy", ctx))
            }
            (GovernanceMode::Lenient, None) => Ok(()),
        }
    }

    /// Enforce declared payload constraints for an allowed operation.
    pub fn validate_payload(
        &self,
        kind: BackendKind,
        operation: &str,
        payload: &Payload,
        ctx: Option<&OpContext>,
    ) -> Result<()> {
        let Some(rule) = self.rule(kind, operation) else {
            return Ok(());
        };

        if let Some(fields) = &rule.fields {
            for key in payload.keys() {
                if !fields.iter().any(|f| f == key) {
                    let reason = format!("UndeclaredField({})", key);
                    return Err(self.deny(kind, operation, &reason, ctx));
                }
            }
        }

        if let Some(limit) = rule.max_payload_bytes {
            let actual = Value::Object(payload.clone()).to_string().len();
            if actual > limit {
                let reason = format!("PayloadTooLarge(limit={}, actual={})", limit, actual);
                return Err(self.deny(kind, operation, &reason, ctx));
            }
        }

        Ok(())
    }

    /// Combined allow + payload check, the shape dispatch uses.
    pub fn authorize(
        &self,
        kind: BackendKind,
        operation: &str,
        payload: &Payload,
        ctx: Option<&OpContext>,
    ) -> Result<()> {
        self.ensure_allowed(kind, operation, ctx)?;
        self.validate_payload(kind, operation, payload, ctx)
    }
}
