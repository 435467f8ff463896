//! Master Control Point
//!
//! The canonical classification record for one structural model, plus the
//! engine that moves it through `Uninitialized -> Ready -> Locked`.
//!
//! The engine is synchronous and owns no state: the repository holds the
//! per-model write lock and hands the engine `&mut MasterControlPoint`, so
//! every check-then-act sequence here runs under that lock. Every mutation
//! revalidates the record before returning, which keeps `validation` and
//! `building_type_confidence` current.

use crate::audit::{AuditContext, AuditEntry};
use crate::classifier_adapter::{AlternativeType, ClassificationOutcome};
use crate::confidence_policy::{clamp_unit, ConfidencePolicy, RuleOutcome};
use crate::correction_recorder::{CorrectionRecorder, OverrideDraft, OverrideField, OverrideRecord};
use crate::errors::{McpError, McpResult};
use crate::geometry_facts::{self, GeometryFacts};
use crate::rule_validator::{RuleValidator, ValidationResult};
use crate::structural_model::{normalize_label, StructuralModel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum McpState {
    Uninitialized,
    Ready,
    Locked,
}

/// Where the current building type came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassificationSource {
    Model,
    Fallback,
    Manual,
}

/// Who is asking for a member tag change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagOrigin {
    /// Engineer override; allowed while automation is frozen.
    Manual,
    /// Classifier or tooling; refused while automation is frozen.
    Automated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberTag {
    pub member_id: String,
    pub tag: String,
    /// Last tag the classifier proposed for this member.
    pub auto_tag: String,
    pub manual_override: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub last_validated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterControlPoint {
    pub id: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub is_locked: bool,
    pub confirmed_by_user: bool,
    pub automation_frozen: bool,
    pub building_type: String,
    pub building_type_confidence: f64,
    pub manual_override: bool,
    pub classification_source: ClassificationSource,
    /// Why the classifier fell back, if it did.
    pub fallback_cause: Option<String>,
    pub ai_reasoning: Vec<String>,
    pub alternatives: Vec<AlternativeType>,
    pub facts: GeometryFacts,
    pub member_tags: Vec<MemberTag>,
    pub validation: McpValidation,
    pub training_candidates: Vec<OverrideRecord>,
}

impl MasterControlPoint {
    pub fn state(&self) -> McpState {
        if self.is_locked {
            McpState::Locked
        } else {
            McpState::Ready
        }
    }

    pub fn member_tag(&self, member_id: &str) -> Option<&MemberTag> {
        self.member_tags.iter().find(|t| t.member_id == member_id)
    }

    fn member_tag_mut(&mut self, member_id: &str) -> Option<&mut MemberTag> {
        self.member_tags.iter_mut().find(|t| t.member_id == member_id)
    }

    pub fn training_candidate(&self, override_id: &str) -> Option<&OverrideRecord> {
        self.training_candidates.iter().find(|r| r.id == override_id)
    }

    fn ensure_unlocked(&self, operation: &str) -> McpResult<()> {
        if self.is_locked {
            Err(McpError::locked(&self.model_id, operation))
        } else {
            Ok(())
        }
    }

    fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

fn outcome_of(result: &ValidationResult) -> RuleOutcome {
    if result.has_violations() {
        RuleOutcome::Violated
    } else if result.warnings.is_empty() {
        RuleOutcome::Clean
    } else {
        RuleOutcome::PassedWithWarnings
    }
}

#[derive(Clone)]
pub struct McpEngine {
    validator: RuleValidator,
    recorder: CorrectionRecorder,
}

impl McpEngine {
    /// The recorder flags overrides against the validator's policy table.
    pub fn new(validator: RuleValidator, recorder: CorrectionRecorder) -> Self {
        let recorder = recorder.with_policy(validator.policy.clone());
        Self { validator, recorder }
    }

    pub fn validator(&self) -> &RuleValidator {
        &self.validator
    }

    fn policy(&self) -> &ConfidencePolicy {
        &self.validator.policy
    }

    /// Build the initial record from a classification outcome. Both outcome
    /// branches produce a usable record.
    pub fn build(&self, model: &StructuralModel, outcome: ClassificationOutcome, ctx: &AuditContext) -> MasterControlPoint {
        let used_fallback = outcome.used_fallback();
        let fallback_cause = match &outcome {
            ClassificationOutcome::FallbackUsed { cause, .. } => Some(cause.clone()),
            ClassificationOutcome::Classified(_) => None,
        };
        let prediction = outcome.into_prediction();
        let facts = geometry_facts::extract(model);
        let now = Utc::now();

        let member_tags = model
            .members
            .iter()
            .filter_map(|member| {
                let tag = prediction.member_tags.get(&member.id)?;
                let raw = prediction
                    .member_confidences
                    .get(&member.id)
                    .copied()
                    .unwrap_or(prediction.confidence);
                let checked = self.validator.validate_member_tag(model, &member.id, tag);
                Some(MemberTag {
                    member_id: member.id.clone(),
                    tag: tag.clone(),
                    auto_tag: tag.clone(),
                    manual_override: false,
                    confidence: checked.adjusted_confidence(raw),
                })
            })
            .collect();

        let building_check = self
            .validator
            .validate_building_type_with_facts(&facts, &prediction.building_type);

        let mut mcp = MasterControlPoint {
            id: Uuid::new_v4().to_string(),
            model_id: model.id.clone(),
            created_at: now,
            last_modified: now,
            is_locked: false,
            confirmed_by_user: false,
            automation_frozen: false,
            building_type: prediction.building_type.clone(),
            building_type_confidence: building_check.adjusted_confidence(prediction.confidence),
            manual_override: false,
            classification_source: if used_fallback {
                ClassificationSource::Fallback
            } else {
                ClassificationSource::Model
            },
            fallback_cause,
            ai_reasoning: prediction.reasoning,
            alternatives: prediction.alternative_types,
            facts,
            member_tags,
            validation: McpValidation {
                is_valid: false,
                errors: Vec::new(),
                warnings: Vec::new(),
                last_validated: now,
            },
            training_candidates: Vec::new(),
        };
        self.revalidate(&mut mcp, model);

        info!(
            "MCP {} initialized for model {}: {} ({:.2}), fallback={}, valid={}",
            mcp.id, mcp.model_id, mcp.building_type, mcp.building_type_confidence, used_fallback, mcp.validation.is_valid
        );
        self.recorder.note(AuditEntry::new(
            "mcp.initialize",
            ctx,
            serde_json::Value::Null,
            json!({
                "mcpId": mcp.id,
                "buildingType": mcp.building_type,
                "confidence": mcp.building_type_confidence,
                "source": mcp.classification_source,
            }),
        ));
        mcp
    }

    /// Recompute `validation` from the current building type and tags.
    pub fn revalidate(&self, mcp: &mut MasterControlPoint, model: &StructuralModel) {
        let mut results = vec![
            self.validator
                .validate_building_type_with_facts(&mcp.facts, &mcp.building_type),
            self.validator.validate_model_structure(&mcp.facts),
        ];
        results.extend(
            mcp.member_tags
                .iter()
                .map(|t| self.validator.validate_member_tag(model, &t.member_id, &t.tag)),
        );
        let merged = ValidationResult::merge(results, self.policy());

        let mut warnings = merged.warnings;
        if mcp.classification_source == ClassificationSource::Fallback {
            let cause = mcp.fallback_cause.as_deref().unwrap_or("classifier unavailable");
            warnings.insert(
                0,
                format!("Low-confidence fallback classification ({cause}); engineer review required"),
            );
        }
        if mcp.member_tags.is_empty() {
            warnings.push("no member tags assigned".to_string());
        }

        mcp.validation = McpValidation {
            is_valid: merged.passed,
            errors: merged.violations,
            warnings,
            last_validated: Utc::now(),
        };
    }

    /// Replace the building type. Returns the override record when the value
    /// actually changed.
    pub fn update_building_type(
        &self,
        mcp: &mut MasterControlPoint,
        model: &StructuralModel,
        new_type: &str,
        reviewer_id: Option<&str>,
        confidence: Option<f64>,
        ctx: &AuditContext,
    ) -> McpResult<Option<OverrideRecord>> {
        mcp.ensure_unlocked("update building type")?;
        let new_type = normalize_label(new_type);
        if new_type.is_empty() {
            return Err(McpError::validation("buildingType", "must not be empty"));
        }

        let new_check = self.validator.validate_building_type_with_facts(&mcp.facts, &new_type);
        let new_confidence = match (reviewer_id, confidence) {
            (Some(_), _) => self.policy().reviewer_confirmed,
            (None, Some(supplied)) => clamp_unit(supplied),
            (None, None) => self
                .policy()
                .adjust(self.policy().unreviewed_override_base, outcome_of(&new_check)),
        };

        let previous = mcp.building_type.clone();
        let previous_confidence = mcp.building_type_confidence;
        let record = if previous != new_type {
            let original_check = self.validator.validate_building_type_with_facts(&mcp.facts, &previous);
            let record = self.recorder.record(
                OverrideDraft {
                    model_id: mcp.model_id.clone(),
                    field: OverrideField::BuildingType,
                    member_id: None,
                    original_value: previous.clone(),
                    new_value: new_type.clone(),
                    reviewer_id: reviewer_id.map(str::to_string),
                    confidence: new_confidence,
                    original_confidence: previous_confidence,
                    original_had_violations: original_check.has_violations(),
                    new_has_violations: new_check.has_violations(),
                },
                ctx,
            );
            mcp.training_candidates.push(record.clone());
            Some(record)
        } else {
            None
        };

        mcp.building_type = new_type.clone();
        mcp.building_type_confidence = new_confidence;
        mcp.manual_override = true;
        mcp.classification_source = ClassificationSource::Manual;
        if reviewer_id.is_some() {
            mcp.confirmed_by_user = true;
        }
        mcp.touch();
        self.revalidate(mcp, model);

        debug!(
            "Model {} building type {} -> {} ({:.2})",
            mcp.model_id, previous, new_type, new_confidence
        );
        self.recorder.note(AuditEntry::new(
            "mcp.update_building_type",
            ctx,
            json!({ "buildingType": previous, "confidence": previous_confidence }),
            json!({ "buildingType": new_type, "confidence": new_confidence, "reviewerId": reviewer_id }),
        ));
        Ok(record)
    }

    /// Change one member's tag. Automated changes are refused while
    /// automation is frozen and never replace a manual override; nothing
    /// changes on a locked record.
    pub fn update_member_tag(
        &self,
        mcp: &mut MasterControlPoint,
        model: &StructuralModel,
        member_id: &str,
        new_tag: &str,
        reviewer_id: Option<&str>,
        origin: TagOrigin,
        ctx: &AuditContext,
    ) -> McpResult<Option<OverrideRecord>> {
        mcp.ensure_unlocked("update member tag")?;
        if origin == TagOrigin::Automated && mcp.automation_frozen {
            return Err(McpError::locked(&mcp.model_id, "automated member tag update (automation frozen)"));
        }
        let new_tag = normalize_label(new_tag);
        if new_tag.is_empty() {
            return Err(McpError::validation("tag", "must not be empty"));
        }
        if model.member(member_id).is_none() {
            return Err(McpError::not_found("member", member_id));
        }

        let new_check = self.validator.validate_member_tag(model, member_id, &new_tag);
        let new_confidence = match reviewer_id {
            Some(_) => self.policy().reviewer_confirmed,
            None => self
                .policy()
                .adjust(self.policy().unreviewed_override_base, outcome_of(&new_check)),
        };

        let existing = mcp.member_tag(member_id).cloned();
        if origin == TagOrigin::Automated && existing.as_ref().is_some_and(|t| t.manual_override) {
            debug!("Skipping automated retag of manually overridden member {}", member_id);
            return Ok(None);
        }

        let (previous_tag, previous_confidence) = existing
            .as_ref()
            .map(|t| (t.tag.clone(), t.confidence))
            .unwrap_or_else(|| ("UNTAGGED".to_string(), 0.0));

        let changed = previous_tag != new_tag;
        let record = if changed && origin == TagOrigin::Manual {
            let original_check = self.validator.validate_member_tag(model, member_id, &previous_tag);
            let record = self.recorder.record(
                OverrideDraft {
                    model_id: mcp.model_id.clone(),
                    field: OverrideField::MemberTag,
                    member_id: Some(member_id.to_string()),
                    original_value: previous_tag.clone(),
                    new_value: new_tag.clone(),
                    reviewer_id: reviewer_id.map(str::to_string),
                    confidence: new_confidence,
                    original_confidence: previous_confidence,
                    original_had_violations: existing.is_some() && original_check.has_violations(),
                    new_has_violations: new_check.has_violations(),
                },
                ctx,
            );
            mcp.training_candidates.push(record.clone());
            Some(record)
        } else {
            None
        };

        let manual = origin == TagOrigin::Manual;
        match mcp.member_tag_mut(member_id) {
            Some(tag) => {
                tag.tag = new_tag.clone();
                tag.confidence = new_confidence;
                tag.manual_override |= manual;
                if !manual {
                    tag.auto_tag = new_tag.clone();
                }
            }
            None => mcp.member_tags.push(MemberTag {
                member_id: member_id.to_string(),
                tag: new_tag.clone(),
                auto_tag: if manual { String::new() } else { new_tag.clone() },
                manual_override: manual,
                confidence: new_confidence,
            }),
        }
        mcp.touch();
        self.revalidate(mcp, model);

        self.recorder.note(AuditEntry::new(
            "mcp.update_member_tag",
            ctx,
            json!({ "memberId": member_id, "tag": previous_tag }),
            json!({ "memberId": member_id, "tag": new_tag, "origin": origin, "reviewerId": reviewer_id }),
        ));
        Ok(record)
    }

    pub fn lock(&self, mcp: &mut MasterControlPoint, ctx: &AuditContext) -> McpResult<()> {
        if mcp.is_locked {
            return Ok(());
        }
        if mcp.member_tags.is_empty() {
            return Err(McpError::precondition("lock", "no member tags assigned"));
        }
        if !mcp.validation.is_valid {
            return Err(McpError::precondition(
                "lock",
                format!("validation failed: {}", mcp.validation.errors.join("; ")),
            ));
        }

        mcp.is_locked = true;
        mcp.confirmed_by_user = true;
        mcp.touch();
        info!("MCP for model {} locked", mcp.model_id);
        self.recorder.note(AuditEntry::new(
            "mcp.lock",
            ctx,
            json!({ "isLocked": false }),
            json!({ "isLocked": true, "confirmedByUser": true }),
        ));
        Ok(())
    }

    pub fn unlock(&self, mcp: &mut MasterControlPoint, ctx: &AuditContext) {
        let was_locked = mcp.is_locked;
        mcp.is_locked = false;
        mcp.touch();
        info!("MCP for model {} unlocked", mcp.model_id);
        self.recorder.note(AuditEntry::new(
            "mcp.unlock",
            ctx,
            json!({ "isLocked": was_locked }),
            json!({ "isLocked": false }),
        ));
    }

    pub fn set_automation_frozen(&self, mcp: &mut MasterControlPoint, frozen: bool, ctx: &AuditContext) -> McpResult<()> {
        mcp.ensure_unlocked(if frozen { "freeze automation" } else { "resume automation" })?;
        if mcp.automation_frozen == frozen {
            return Ok(());
        }
        mcp.automation_frozen = frozen;
        mcp.touch();
        self.recorder.note(AuditEntry::new(
            if frozen { "mcp.freeze_automation" } else { "mcp.resume_automation" },
            ctx,
            json!({ "automationFrozen": !frozen }),
            json!({ "automationFrozen": frozen }),
        ));
        Ok(())
    }

    /// Apply a fresh classification to an unlocked record. Manual choices
    /// survive; only `auto_tag` is refreshed on overridden members.
    pub fn apply_reclassification(
        &self,
        mcp: &mut MasterControlPoint,
        model: &StructuralModel,
        outcome: ClassificationOutcome,
        ctx: &AuditContext,
    ) -> McpResult<()> {
        mcp.ensure_unlocked("refresh classification")?;
        if mcp.automation_frozen {
            return Err(McpError::locked(&mcp.model_id, "refresh classification (automation frozen)"));
        }

        let used_fallback = outcome.used_fallback();
        let cause = match &outcome {
            ClassificationOutcome::FallbackUsed { cause, .. } => Some(cause.clone()),
            ClassificationOutcome::Classified(_) => None,
        };
        let prediction = outcome.into_prediction();
        let previous_type = mcp.building_type.clone();

        if !mcp.manual_override {
            let check = self
                .validator
                .validate_building_type_with_facts(&mcp.facts, &prediction.building_type);
            mcp.building_type = prediction.building_type.clone();
            mcp.building_type_confidence = check.adjusted_confidence(prediction.confidence);
            mcp.classification_source = if used_fallback {
                ClassificationSource::Fallback
            } else {
                ClassificationSource::Model
            };
            mcp.fallback_cause = cause;
        } else if used_fallback {
            warn!(
                "Reclassification of model {} fell back; manual building type kept",
                mcp.model_id
            );
        }

        for (member_id, tag) in &prediction.member_tags {
            let raw = prediction
                .member_confidences
                .get(member_id)
                .copied()
                .unwrap_or(prediction.confidence);
            let check = self.validator.validate_member_tag(model, member_id, tag);
            match mcp.member_tag_mut(member_id) {
                Some(existing) if existing.manual_override => existing.auto_tag = tag.clone(),
                Some(existing) => {
                    existing.tag = tag.clone();
                    existing.auto_tag = tag.clone();
                    existing.confidence = check.adjusted_confidence(raw);
                }
                None => mcp.member_tags.push(MemberTag {
                    member_id: member_id.clone(),
                    tag: tag.clone(),
                    auto_tag: tag.clone(),
                    manual_override: false,
                    confidence: check.adjusted_confidence(raw),
                }),
            }
        }

        mcp.ai_reasoning = prediction.reasoning;
        mcp.alternatives = prediction.alternative_types;
        mcp.touch();
        self.revalidate(mcp, model);

        self.recorder.note(AuditEntry::new(
            "mcp.refresh_classification",
            ctx,
            json!({ "buildingType": previous_type }),
            json!({ "buildingType": mcp.building_type, "fallback": used_fallback }),
        ));
        Ok(())
    }
}
