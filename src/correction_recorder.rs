//! Correction Recorder
//!
//! Turns an engineer override into an immutable [`OverrideRecord`] with
//! provenance and compliance flags, and offers it to the audit sink.

use crate::audit::{self, AuditContext, AuditEntry, AuditSink};
use crate::confidence_policy::ConfidencePolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverrideField {
    BuildingType,
    MemberTag,
}

impl OverrideField {
    pub fn as_str(self) -> &'static str {
        match self {
            OverrideField::BuildingType => "buildingType",
            OverrideField::MemberTag => "memberTag",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRecord {
    pub id: String,
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
    pub field: OverrideField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    pub original_value: String,
    pub new_value: String,
    pub reviewer_id: Option<String>,
    /// Actor that issued the change; `"anonymous"` when unknown.
    pub requested_by: String,
    pub confidence: f64,
    pub original_confidence: f64,
    /// Whether the replaced value failed rule validation.
    pub original_had_violations: bool,
    pub compliance_flags: Vec<String>,
}

impl OverrideRecord {
    pub fn is_anonymous(&self) -> bool {
        self.reviewer_id.is_none()
    }
}

/// Everything the MCP knows about a change before it becomes a record.
#[derive(Debug, Clone)]
pub struct OverrideDraft {
    pub model_id: String,
    pub field: OverrideField,
    pub member_id: Option<String>,
    pub original_value: String,
    pub new_value: String,
    pub reviewer_id: Option<String>,
    pub confidence: f64,
    pub original_confidence: f64,
    pub original_had_violations: bool,
    pub new_has_violations: bool,
}

pub fn compliance_flags(draft: &OverrideDraft, policy: &ConfidencePolicy) -> Vec<String> {
    let mut flags = Vec::new();
    if draft.reviewer_id.is_none() {
        flags.push("unattributed".to_string());
    }
    if draft.original_had_violations {
        flags.push("fixes_rule_violation".to_string());
    } else {
        flags.push("contradicts_passing_rules".to_string());
    }
    if draft.new_has_violations {
        flags.push("introduces_rule_violation".to_string());
    }
    if draft.original_confidence >= policy.high_confidence {
        flags.push("overrides_high_confidence".to_string());
    }
    flags
}

#[derive(Clone)]
pub struct CorrectionRecorder {
    sink: Arc<dyn AuditSink>,
    policy: ConfidencePolicy,
}

impl CorrectionRecorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            policy: ConfidencePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ConfidencePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    pub fn record(&self, draft: OverrideDraft, ctx: &AuditContext) -> OverrideRecord {
        let flags = compliance_flags(&draft, &self.policy);
        let record = OverrideRecord {
            id: Uuid::new_v4().to_string(),
            model_id: draft.model_id,
            timestamp: Utc::now(),
            field: draft.field,
            member_id: draft.member_id,
            original_value: draft.original_value,
            new_value: draft.new_value,
            reviewer_id: draft.reviewer_id,
            requested_by: ctx.actor_or_anonymous(),
            confidence: draft.confidence,
            original_confidence: draft.original_confidence,
            original_had_violations: draft.original_had_violations,
            compliance_flags: flags,
        };

        debug!(
            "Recorded {} override {} on model {}",
            record.field.as_str(),
            record.id,
            record.model_id
        );

        let entry = AuditEntry::new(
            format!("override.{}", record.field.as_str()),
            ctx,
            json!({ "memberId": record.member_id, "value": record.original_value }),
            json!({ "memberId": record.member_id, "value": record.new_value, "overrideId": record.id }),
        )
        .with_flags(record.compliance_flags.clone());
        audit::offer(self.sink.as_ref(), entry);

        record
    }

    /// Offer a non-override audit entry.
    pub fn note(&self, entry: AuditEntry) {
        audit::offer(self.sink.as_ref(), entry);
    }
}
