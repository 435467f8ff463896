//! Approval Workflow
//!
//! Second state machine, one instance per pending-validation batch. A batch is
//! scored and routed to an approval tier on creation; human decisions move it
//! from PENDING (or ESCALATED, its higher-tier pending form) to APPROVED or
//! REJECTED. Approval is the only path to the training gateway.
//!
//! Transitions on one batch are serialized by that batch's mutex. Gateway
//! calls happen after the mutex is released.

use crate::approval_tier::{ApprovalTier, TierThresholds};
use crate::audit::{self, AuditContext, AuditEntry, AuditSink};
use crate::correction_recorder::OverrideRecord;
use crate::errors::{McpError, McpResult, SafeLock, SafeReadLock, SafeWriteLock};
use crate::risk_scoring::{RiskFactors, RiskScoringEngine};
use crate::rule_validator::ValidationResult;
use crate::training_gateway::{DedupGateway, SubmissionAck, TrainingGateway};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

const AUTO_APPROVER: &str = "system:auto-approve";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Approved,
    Rejected,
    /// Pending again at a strictly higher tier.
    Escalated,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Approved | BatchStatus::Rejected)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Approved => "APPROVED",
            BatchStatus::Rejected => "REJECTED",
            BatchStatus::Escalated => "ESCALATED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approve,
    Reject,
    Escalate,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::Escalate => "escalate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reviewer {
    pub id: String,
    pub authority: ApprovalTier,
}

impl Reviewer {
    pub fn new(id: impl Into<String>, authority: ApprovalTier) -> Self {
        Self {
            id: id.into(),
            authority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEvent {
    pub at: DateTime<Utc>,
    pub actor_id: String,
    pub decision: Option<Decision>,
    pub status: BatchStatus,
    pub tier: ApprovalTier,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionState {
    NotSubmitted,
    Acknowledged { ack: SubmissionAck },
    Failed { message: String, at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingValidationBatch {
    pub id: String,
    pub model_id: String,
    pub override_ids: Vec<String>,
    pub requested_by: String,
    pub request_time: DateTime<Utc>,
    pub validation_result: ValidationResult,
    pub risk_score: f64,
    pub risk_factors: RiskFactors,
    pub approval_level: ApprovalTier,
    pub status: BatchStatus,
    pub history: Vec<BatchEvent>,
    pub submission: SubmissionState,
    /// Rejected batches whose overrides this batch proposes again.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reproposes: Vec<String>,
}

/// What a decision did to the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(PendingValidationBatch),
    /// Repeat of the decision the batch already carries.
    NoOp(PendingValidationBatch),
}

impl Transition {
    pub fn batch(&self) -> &PendingValidationBatch {
        match self {
            Transition::Applied(b) | Transition::NoOp(b) => b,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Input for a new batch.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub model_id: String,
    pub overrides: Vec<OverrideRecord>,
    pub validation_result: ValidationResult,
    pub requested_by: String,
    /// Allow overrides whose earlier batch was rejected.
    pub reproposal: bool,
}

/// Whether an escalate request has already taken effect. With an expected
/// tier the batch must still sit at that tier; without one, a repeat of the
/// reviewer's own latest escalation is the retry.
fn escalation_already_applied(
    batch: &PendingValidationBatch,
    reviewer: &Reviewer,
    expected_tier: Option<ApprovalTier>,
) -> McpResult<bool> {
    match expected_tier {
        Some(tier) if tier == batch.approval_level => Ok(false),
        Some(tier) if tier < batch.approval_level && batch.status == BatchStatus::Escalated => Ok(true),
        Some(tier) => Err(McpError::conflict(
            "batch",
            &batch.id,
            format!("expected the batch at {tier}, it is {} at {}", batch.status, batch.approval_level),
        )),
        None => Ok(batch.status == BatchStatus::Escalated
            && batch
                .history
                .last()
                .is_some_and(|e| e.decision == Some(Decision::Escalate) && e.actor_id == reviewer.id)),
    }
}

/// Apply one decision to a locked batch. Pure state logic, no I/O.
fn transition(
    batch: &mut PendingValidationBatch,
    reviewer: &Reviewer,
    decision: Decision,
    expected_tier: Option<ApprovalTier>,
    comments: Option<&str>,
) -> McpResult<Transition> {
    match (batch.status, decision) {
        (BatchStatus::Approved, Decision::Approve) | (BatchStatus::Rejected, Decision::Reject) => {
            return Ok(Transition::NoOp(batch.clone()));
        }
        (status, _) if status.is_terminal() => {
            return Err(McpError::conflict(
                "batch",
                &batch.id,
                format!("cannot {} a batch that is already {}", decision.as_str(), status),
            ));
        }
        (_, Decision::Escalate) => {
            if escalation_already_applied(batch, reviewer, expected_tier)? {
                return Ok(Transition::NoOp(batch.clone()));
            }
        }
        _ => {}
    }

    if reviewer.authority < batch.approval_level {
        return Err(McpError::insufficient_authority(batch.approval_level, reviewer.authority));
    }

    match decision {
        Decision::Approve => batch.status = BatchStatus::Approved,
        Decision::Reject => batch.status = BatchStatus::Rejected,
        Decision::Escalate => {
            let next = batch.approval_level.next().ok_or_else(|| {
                McpError::conflict("batch", &batch.id, "already at the highest approval tier")
            })?;
            batch.approval_level = next;
            batch.status = BatchStatus::Escalated;
        }
    }

    batch.history.push(BatchEvent {
        at: Utc::now(),
        actor_id: reviewer.id.clone(),
        decision: Some(decision),
        status: batch.status,
        tier: batch.approval_level,
        comments: comments.map(str::to_string),
    });
    Ok(Transition::Applied(batch.clone()))
}

fn error_outcome(err: &McpError) -> &'static str {
    match err {
        McpError::Conflict { .. } => "conflict",
        McpError::InsufficientAuthority { .. } => "insufficient_authority",
        McpError::NotFound { .. } => "not_found",
        _ => "error",
    }
}

pub struct ApprovalWorkflow {
    batches: RwLock<HashMap<String, Arc<Mutex<PendingValidationBatch>>>>,
    /// override id -> id of the latest batch holding it
    claims: RwLock<HashMap<String, String>>,
    scoring: RiskScoringEngine,
    thresholds: TierThresholds,
    gateway: DedupGateway,
    audit: Arc<dyn AuditSink>,
}

impl ApprovalWorkflow {
    pub fn new(
        scoring: RiskScoringEngine,
        thresholds: TierThresholds,
        gateway: Arc<dyn TrainingGateway>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            batches: RwLock::new(HashMap::new()),
            claims: RwLock::new(HashMap::new()),
            scoring,
            thresholds,
            gateway: DedupGateway::new(gateway),
            audit,
        }
    }

    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    pub fn scoring(&self) -> &RiskScoringEngine {
        &self.scoring
    }

    fn cell(&self, batch_id: &str) -> McpResult<Arc<Mutex<PendingValidationBatch>>> {
        self.batches
            .safe_read()?
            .get(batch_id)
            .cloned()
            .ok_or_else(|| McpError::not_found("batch", batch_id))
    }

    pub fn get(&self, batch_id: &str) -> McpResult<PendingValidationBatch> {
        let cell = self.cell(batch_id)?;
        let batch = cell.safe_lock()?;
        Ok(batch.clone())
    }

    /// Batches, oldest first, optionally filtered by status.
    pub fn list(&self, status: Option<BatchStatus>) -> McpResult<Vec<PendingValidationBatch>> {
        let cells: Vec<_> = self.batches.safe_read()?.values().cloned().collect();
        let mut batches = Vec::with_capacity(cells.len());
        for cell in cells {
            let batch = cell.safe_lock()?;
            if status.map_or(true, |s| s == batch.status) {
                batches.push(batch.clone());
            }
        }
        batches.sort_by(|a, b| a.request_time.cmp(&b.request_time).then_with(|| a.id.cmp(&b.id)));
        Ok(batches)
    }

    /// Batch currently holding an override, if any.
    pub fn claimed_by(&self, override_id: &str) -> McpResult<Option<String>> {
        Ok(self.claims.safe_read()?.get(override_id).cloned())
    }

    /// Claim the batch's overrides and store it, atomically with respect to
    /// other creations. An override held by a batch that was not rejected is
    /// a `Conflict`; one from a rejected batch needs `reproposal`.
    fn claim_and_store(
        &self,
        mut batch: PendingValidationBatch,
        reproposal: bool,
    ) -> McpResult<PendingValidationBatch> {
        let mut claims = self.claims.safe_write()?;
        for override_id in &batch.override_ids {
            let Some(owner) = claims.get(override_id) else {
                continue;
            };
            match self.get(owner)?.status {
                BatchStatus::Rejected if reproposal => {
                    if !batch.reproposes.contains(owner) {
                        batch.reproposes.push(owner.clone());
                    }
                }
                BatchStatus::Rejected => {
                    return Err(McpError::conflict(
                        "override",
                        override_id,
                        format!("rejected in batch {owner}; re-proposing it must be explicit"),
                    ));
                }
                status => {
                    return Err(McpError::conflict(
                        "override",
                        override_id,
                        format!("already in batch {owner} ({status})"),
                    ));
                }
            }
        }

        for override_id in &batch.override_ids {
            claims.insert(override_id.clone(), batch.id.clone());
        }
        self.batches
            .safe_write()?
            .insert(batch.id.clone(), Arc::new(Mutex::new(batch.clone())));
        Ok(batch)
    }

    /// Score, route and store a new batch. AUTO-tier batches are approved
    /// and submitted at once when auto-approval is enabled.
    pub async fn create_batch(&self, new: NewBatch, ctx: &AuditContext) -> McpResult<PendingValidationBatch> {
        if new.overrides.is_empty() {
            return Err(McpError::validation("overrideIds", "a batch needs at least one override"));
        }
        let reproposal = new.reproposal;

        let assessment = self.scoring.assess(&new.overrides);
        let tier = self.thresholds.route(assessment.score);
        let now = Utc::now();
        let mut batch = PendingValidationBatch {
            id: Uuid::new_v4().to_string(),
            model_id: new.model_id,
            override_ids: new.overrides.iter().map(|o| o.id.clone()).collect(),
            requested_by: new.requested_by.clone(),
            request_time: now,
            validation_result: new.validation_result,
            risk_score: assessment.score,
            risk_factors: assessment.factors,
            approval_level: tier,
            status: BatchStatus::Pending,
            history: vec![BatchEvent {
                at: now,
                actor_id: new.requested_by,
                decision: None,
                status: BatchStatus::Pending,
                tier,
                comments: None,
            }],
            submission: SubmissionState::NotSubmitted,
            reproposes: Vec::new(),
        };

        let auto_approve = tier == ApprovalTier::Auto && self.thresholds.auto_approve;
        if auto_approve {
            batch.status = BatchStatus::Approved;
            batch.history.push(BatchEvent {
                at: now,
                actor_id: AUTO_APPROVER.to_string(),
                decision: Some(Decision::Approve),
                status: BatchStatus::Approved,
                tier,
                comments: Some(format!("risk score {:.3} below review threshold", assessment.score)),
            });
        }

        let (model_id, override_ids) = (batch.model_id.clone(), batch.override_ids.clone());
        let batch = match self.claim_and_store(batch, reproposal) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Batch for model {} refused: {}", model_id, e);
                audit::offer(
                    self.audit.as_ref(),
                    AuditEntry::new(
                        "batch.create",
                        ctx,
                        serde_json::Value::Null,
                        json!({ "overrideIds": override_ids, "outcome": error_outcome(&e), "error": e.to_string() }),
                    )
                    .with_flags(vec!["refused".to_string()]),
                );
                return Err(e);
            }
        };

        info!(
            "Batch {} created for model {}: {} overrides, risk {:.3}, tier {}, status {}",
            batch.id,
            batch.model_id,
            batch.override_ids.len(),
            batch.risk_score,
            batch.approval_level,
            batch.status
        );
        let flags = if batch.reproposes.is_empty() {
            Vec::new()
        } else {
            vec!["reproposed_after_rejection".to_string()]
        };
        audit::offer(
            self.audit.as_ref(),
            AuditEntry::new(
                "batch.create",
                ctx,
                serde_json::Value::Null,
                json!({
                    "batchId": batch.id,
                    "overrideIds": batch.override_ids,
                    "riskScore": batch.risk_score,
                    "approvalLevel": batch.approval_level,
                    "status": batch.status,
                    "reproposes": batch.reproposes,
                }),
            )
            .with_flags(flags),
        );

        let batch_id = batch.id;
        if auto_approve {
            // failure is recorded on the batch; retry_submission picks it up
            let _ = self.submit(&batch_id).await;
        }
        self.get(&batch_id)
    }

    pub async fn approve(
        &self,
        batch_id: &str,
        reviewer: &Reviewer,
        comments: Option<&str>,
        ctx: &AuditContext,
    ) -> McpResult<Transition> {
        self.decide(batch_id, reviewer, Decision::Approve, None, comments, ctx).await
    }

    pub async fn reject(
        &self,
        batch_id: &str,
        reviewer: &Reviewer,
        comments: Option<&str>,
        ctx: &AuditContext,
    ) -> McpResult<Transition> {
        self.decide(batch_id, reviewer, Decision::Reject, None, comments, ctx).await
    }

    /// Move the batch one tier up. Repeating the reviewer's own latest
    /// escalation is a no-op.
    pub async fn escalate(
        &self,
        batch_id: &str,
        reviewer: &Reviewer,
        comments: Option<&str>,
        ctx: &AuditContext,
    ) -> McpResult<Transition> {
        self.decide(batch_id, reviewer, Decision::Escalate, None, comments, ctx).await
    }

    /// Escalate only if the batch still sits at `from_tier`. A batch already
    /// escalated past it yields a no-op; any other mismatch is a `Conflict`.
    pub async fn escalate_from(
        &self,
        batch_id: &str,
        from_tier: ApprovalTier,
        reviewer: &Reviewer,
        comments: Option<&str>,
        ctx: &AuditContext,
    ) -> McpResult<Transition> {
        self.decide(batch_id, reviewer, Decision::Escalate, Some(from_tier), comments, ctx)
            .await
    }

    async fn decide(
        &self,
        batch_id: &str,
        reviewer: &Reviewer,
        decision: Decision,
        expected_tier: Option<ApprovalTier>,
        comments: Option<&str>,
        ctx: &AuditContext,
    ) -> McpResult<Transition> {
        let result = self.cell(batch_id).and_then(|cell| {
            let mut batch = cell.safe_lock()?;
            let before = json!({ "status": batch.status, "approvalLevel": batch.approval_level });
            let applied = transition(&mut batch, reviewer, decision, expected_tier, comments)?;
            Ok((before, applied))
        });

        let action = format!("batch.{}", decision.as_str());
        match &result {
            Ok((before, t)) => {
                let batch = t.batch();
                let outcome = if t.is_applied() { "applied" } else { "noop" };
                info!(
                    "Batch {} {} by {} ({}): now {} at {}",
                    batch_id,
                    decision.as_str(),
                    reviewer.id,
                    outcome,
                    batch.status,
                    batch.approval_level
                );
                audit::offer(
                    self.audit.as_ref(),
                    AuditEntry::new(
                        action,
                        ctx,
                        before.clone(),
                        json!({
                            "batchId": batch_id,
                            "reviewerId": reviewer.id,
                            "outcome": outcome,
                            "status": batch.status,
                            "approvalLevel": batch.approval_level,
                            "comments": comments,
                        }),
                    ),
                );
            }
            Err(e) => {
                warn!("Batch {} {} by {} refused: {}", batch_id, decision.as_str(), reviewer.id, e);
                audit::offer(
                    self.audit.as_ref(),
                    AuditEntry::new(
                        action,
                        ctx,
                        serde_json::Value::Null,
                        json!({
                            "batchId": batch_id,
                            "reviewerId": reviewer.id,
                            "outcome": error_outcome(e),
                            "error": e.to_string(),
                            "comments": comments,
                        }),
                    )
                    .with_flags(vec!["refused".to_string()]),
                );
            }
        }

        let (_, transition) = result?;
        let needs_submission = decision == Decision::Approve
            && !matches!(transition.batch().submission, SubmissionState::Acknowledged { .. });
        if !needs_submission {
            return Ok(transition);
        }

        // a gateway failure never undoes the approval
        let _ = self.submit(batch_id).await;
        let batch = self.get(batch_id)?;
        Ok(match transition {
            Transition::Applied(_) => Transition::Applied(batch),
            Transition::NoOp(_) => Transition::NoOp(batch),
        })
    }

    /// Re-offer an approved batch to the gateway. Returns the existing
    /// acknowledgement if the batch was already accepted.
    pub async fn retry_submission(&self, batch_id: &str, ctx: &AuditContext) -> McpResult<SubmissionAck> {
        let status = self.get(batch_id)?.status;
        if status != BatchStatus::Approved {
            return Err(McpError::conflict(
                "batch",
                batch_id,
                format!("only APPROVED batches are submitted, batch is {status}"),
            ));
        }
        let result = self.submit(batch_id).await;
        audit::offer(
            self.audit.as_ref(),
            AuditEntry::new(
                "batch.retry_submission",
                ctx,
                serde_json::Value::Null,
                json!({ "batchId": batch_id, "acknowledged": result.is_ok() }),
            ),
        );
        result
    }

    async fn submit(&self, batch_id: &str) -> McpResult<SubmissionAck> {
        let override_ids = self.get(batch_id)?.override_ids;
        let result = self.gateway.submit(batch_id, &override_ids).await;

        let cell = self.cell(batch_id)?;
        let mut batch = cell.safe_lock()?;
        match &result {
            Ok(ack) => {
                info!("Batch {} accepted for retraining as {}", batch_id, ack.submission_id);
                batch.submission = SubmissionState::Acknowledged { ack: ack.clone() };
            }
            Err(e) => {
                warn!("Batch {} approved but submission failed: {}", batch_id, e);
                batch.submission = SubmissionState::Failed {
                    message: e.to_string(),
                    at: Utc::now(),
                };
            }
        }
        result
    }
}
