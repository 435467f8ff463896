//! Approval workflow: tier authority, idempotent decisions, submission.

use async_trait::async_trait;
use chrono::Utc;
use mcp_guard::{
    approval_tier::{ApprovalTier, TierThresholds},
    approval_workflow::{ApprovalWorkflow, BatchStatus, NewBatch, Reviewer, SubmissionState, Transition},
    audit::{AuditContext, MemoryAuditSink},
    confidence_policy::ConfidencePolicy,
    correction_recorder::{OverrideField, OverrideRecord},
    risk_scoring::RiskScoringEngine,
    rule_validator::ValidationResult,
    training_gateway::{LocalAckGateway, SubmissionAck, TrainingGateway},
    McpError, McpResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts calls; fails the first `failures` of them.
struct CountingGateway {
    calls: AtomicUsize,
    failures: usize,
}

impl CountingGateway {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrainingGateway for CountingGateway {
    async fn submit(&self, batch_id: &str, override_ids: &[String]) -> McpResult<SubmissionAck> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(McpError::gateway("submit", "retraining service unavailable"));
        }
        LocalAckGateway.submit(batch_id, override_ids).await
    }
}

fn record(id: &str, reviewer: Option<&str>, original_had_violations: bool, original_confidence: f64) -> OverrideRecord {
    OverrideRecord {
        id: id.to_string(),
        model_id: "m-1".to_string(),
        timestamp: Utc::now(),
        field: OverrideField::MemberTag,
        member_id: Some("R1".to_string()),
        original_value: "RAFTER".to_string(),
        new_value: "CRANE_BEAM".to_string(),
        reviewer_id: reviewer.map(str::to_string),
        requested_by: reviewer.unwrap_or("anonymous").to_string(),
        confidence: 0.7,
        original_confidence,
        original_had_violations,
        compliance_flags: Vec::new(),
    }
}

fn new_batch(overrides: Vec<OverrideRecord>) -> NewBatch {
    NewBatch {
        model_id: "m-1".to_string(),
        overrides,
        validation_result: ValidationResult::from_findings(Vec::new(), &ConfidencePolicy::default()),
        requested_by: "eng-1".to_string(),
        reproposal: false,
    }
}

fn workflow(gateway: Arc<CountingGateway>, sink: Arc<MemoryAuditSink>) -> ApprovalWorkflow {
    ApprovalWorkflow::new(RiskScoringEngine::default(), TierThresholds::default(), gateway, sink)
}

fn ctx() -> AuditContext {
    AuditContext::for_actor("reviewer")
}

#[tokio::test]
async fn anonymous_contradiction_needs_admin() {
    let wf = workflow(CountingGateway::new(0), Arc::new(MemoryAuditSink::new()));
    let batch = wf
        .create_batch(new_batch(vec![record("o1", None, false, 0.9)]), &ctx())
        .await
        .unwrap();

    assert_eq!(batch.approval_level, ApprovalTier::Admin);
    assert_eq!(batch.status, BatchStatus::Pending);

    let engineer = Reviewer::new("eng-3", ApprovalTier::Engineer);
    let err = wf.approve(&batch.id, &engineer, None, &ctx()).await.unwrap_err();
    assert!(matches!(err, McpError::InsufficientAuthority { .. }));
    assert_eq!(wf.get(&batch.id).unwrap().status, BatchStatus::Pending);
}

#[tokio::test]
async fn repeated_approval_is_a_noop_and_submits_once() {
    let gateway = CountingGateway::new(0);
    let wf = workflow(gateway.clone(), Arc::new(MemoryAuditSink::new()));
    let batch = wf
        .create_batch(new_batch(vec![record("o1", None, false, 0.9)]), &ctx())
        .await
        .unwrap();
    let admin = Reviewer::new("admin-1", ApprovalTier::Admin);

    let first = wf.approve(&batch.id, &admin, Some("looks right"), &ctx()).await.unwrap();
    assert!(first.is_applied());
    assert_eq!(first.batch().status, BatchStatus::Approved);
    assert!(matches!(first.batch().submission, SubmissionState::Acknowledged { .. }));

    let second = wf.approve(&batch.id, &admin, None, &ctx()).await.unwrap();
    assert!(matches!(second, Transition::NoOp(_)));
    assert_eq!(second.batch().history.len(), first.batch().history.len());
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test]
async fn cross_terminal_decisions_conflict() {
    let sink = Arc::new(MemoryAuditSink::new());
    let wf = workflow(CountingGateway::new(0), sink.clone());
    let admin = Reviewer::new("admin-1", ApprovalTier::Admin);

    let rejected = wf
        .create_batch(new_batch(vec![record("o1", None, false, 0.9)]), &ctx())
        .await
        .unwrap();
    wf.reject(&rejected.id, &admin, Some("wrong member"), &ctx()).await.unwrap();
    let err = wf.approve(&rejected.id, &admin, None, &ctx()).await.unwrap_err();
    assert!(err.is_conflict());
    let repeat = wf.reject(&rejected.id, &admin, None, &ctx()).await.unwrap();
    assert!(!repeat.is_applied());
    assert_eq!(repeat.batch().status, BatchStatus::Rejected);

    let refused = sink
        .entries()
        .into_iter()
        .rev()
        .find(|e| e.action == "batch.approve")
        .expect("refused approval is audited");
    assert_eq!(refused.after["outcome"], "conflict");
}

#[tokio::test]
async fn escalation_raises_the_tier_until_committee() {
    let wf = workflow(CountingGateway::new(0), Arc::new(MemoryAuditSink::new()));
    let admin = Reviewer::new("admin-1", ApprovalTier::Admin);
    let committee = Reviewer::new("board", ApprovalTier::Committee);
    let batch = wf
        .create_batch(new_batch(vec![record("o1", None, false, 0.9)]), &ctx())
        .await
        .unwrap();

    let escalated = wf.escalate(&batch.id, &admin, Some("needs a second look"), &ctx()).await.unwrap();
    assert_eq!(escalated.batch().status, BatchStatus::Escalated);
    assert_eq!(escalated.batch().approval_level, ApprovalTier::Committee);

    let err = wf.approve(&batch.id, &admin, None, &ctx()).await.unwrap_err();
    assert!(matches!(err, McpError::InsufficientAuthority { .. }));

    let err = wf.escalate(&batch.id, &committee, None, &ctx()).await.unwrap_err();
    assert!(err.is_conflict());

    let approved = wf.approve(&batch.id, &committee, None, &ctx()).await.unwrap();
    assert_eq!(approved.batch().status, BatchStatus::Approved);

    let pending = wf.list(Some(BatchStatus::Escalated)).unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn retried_escalation_does_not_climb_twice() {
    let sink = Arc::new(MemoryAuditSink::new());
    let wf = workflow(CountingGateway::new(0), sink.clone());
    let admin = Reviewer::new("admin-1", ApprovalTier::Admin);
    let batch = wf
        .create_batch(new_batch(vec![record("o1", None, false, 0.9)]), &ctx())
        .await
        .unwrap();
    assert_eq!(batch.approval_level, ApprovalTier::Admin);

    let first = wf.escalate(&batch.id, &admin, None, &ctx()).await.unwrap();
    assert!(first.is_applied());
    let retry = wf.escalate(&batch.id, &admin, None, &ctx()).await.unwrap();
    assert!(matches!(retry, Transition::NoOp(_)));
    assert_eq!(retry.batch().approval_level, ApprovalTier::Committee);
    assert_eq!(retry.batch().history.len(), first.batch().history.len());

    let outcomes: Vec<_> = sink
        .entries()
        .into_iter()
        .filter(|e| e.action == "batch.escalate")
        .map(|e| e.after["outcome"].clone())
        .collect();
    assert_eq!(outcomes, vec!["applied", "noop"]);
}

#[tokio::test]
async fn engineer_retrying_own_escalation_is_a_noop() {
    let wf = workflow(CountingGateway::new(0), Arc::new(MemoryAuditSink::new()));
    let engineer = Reviewer::new("eng-2", ApprovalTier::Engineer);
    let batch = wf
        .create_batch(new_batch(vec![record("o1", Some("eng-1"), false, 0.9)]), &ctx())
        .await
        .unwrap();
    assert_eq!(batch.approval_level, ApprovalTier::Engineer);

    wf.escalate(&batch.id, &engineer, Some("crane loads"), &ctx()).await.unwrap();
    let retry = wf.escalate(&batch.id, &engineer, Some("crane loads"), &ctx()).await.unwrap();
    assert!(!retry.is_applied());
    assert_eq!(retry.batch().status, BatchStatus::Escalated);
    assert_eq!(retry.batch().approval_level, ApprovalTier::Admin);
}

#[tokio::test]
async fn escalate_from_checks_the_expected_tier() {
    let wf = workflow(CountingGateway::new(0), Arc::new(MemoryAuditSink::new()));
    let admin = Reviewer::new("admin-1", ApprovalTier::Admin);
    let other_admin = Reviewer::new("admin-2", ApprovalTier::Admin);
    let batch = wf
        .create_batch(new_batch(vec![record("o1", Some("eng-1"), false, 0.9)]), &ctx())
        .await
        .unwrap();

    let first = wf
        .escalate_from(&batch.id, ApprovalTier::Engineer, &admin, None, &ctx())
        .await
        .unwrap();
    assert!(first.is_applied());
    assert_eq!(first.batch().approval_level, ApprovalTier::Admin);

    // a stale request from another reviewer does not move the batch again
    let stale = wf
        .escalate_from(&batch.id, ApprovalTier::Engineer, &other_admin, None, &ctx())
        .await
        .unwrap();
    assert!(!stale.is_applied());
    assert_eq!(stale.batch().approval_level, ApprovalTier::Admin);

    // the same reviewer may deliberately climb again from the current tier
    let second = wf
        .escalate_from(&batch.id, ApprovalTier::Admin, &admin, None, &ctx())
        .await
        .unwrap();
    assert!(second.is_applied());
    assert_eq!(second.batch().approval_level, ApprovalTier::Committee);

    let committee = Reviewer::new("board", ApprovalTier::Committee);
    let err = wf
        .escalate_from(&batch.id, ApprovalTier::Committee, &committee, None, &ctx())
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn low_risk_batch_is_auto_approved() {
    let gateway = CountingGateway::new(0);
    let wf = workflow(gateway.clone(), Arc::new(MemoryAuditSink::new()));
    let batch = wf
        .create_batch(new_batch(vec![record("o1", Some("eng-1"), true, 0.2)]), &ctx())
        .await
        .unwrap();

    assert_eq!(batch.risk_score, 0.0);
    assert_eq!(batch.approval_level, ApprovalTier::Auto);
    assert_eq!(batch.status, BatchStatus::Approved);
    assert!(matches!(batch.submission, SubmissionState::Acknowledged { .. }));
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test]
async fn failed_submission_keeps_approval_and_can_be_retried() {
    let gateway = CountingGateway::new(1);
    let wf = workflow(gateway.clone(), Arc::new(MemoryAuditSink::new()));
    let admin = Reviewer::new("admin-1", ApprovalTier::Admin);
    let batch = wf
        .create_batch(new_batch(vec![record("o1", None, false, 0.9)]), &ctx())
        .await
        .unwrap();

    let approved = wf.approve(&batch.id, &admin, None, &ctx()).await.unwrap();
    assert_eq!(approved.batch().status, BatchStatus::Approved);
    assert!(matches!(approved.batch().submission, SubmissionState::Failed { .. }));

    let ack = wf.retry_submission(&batch.id, &ctx()).await.unwrap();
    let again = wf.retry_submission(&batch.id, &ctx()).await.unwrap();
    assert_eq!(ack, again);
    assert_eq!(gateway.calls(), 2);
    assert!(matches!(wf.get(&batch.id).unwrap().submission, SubmissionState::Acknowledged { .. }));
}

#[tokio::test]
async fn retry_refuses_undecided_batches() {
    let wf = workflow(CountingGateway::new(0), Arc::new(MemoryAuditSink::new()));
    let batch = wf
        .create_batch(new_batch(vec![record("o1", None, false, 0.9)]), &ctx())
        .await
        .unwrap();
    assert!(wf.retry_submission(&batch.id, &ctx()).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let wf = workflow(CountingGateway::new(0), Arc::new(MemoryAuditSink::new()));
    let err = wf.create_batch(new_batch(Vec::new()), &ctx()).await.unwrap_err();
    assert!(matches!(err, McpError::Validation { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_apply_once() {
    let gateway = CountingGateway::new(0);
    let wf = Arc::new(workflow(gateway.clone(), Arc::new(MemoryAuditSink::new())));
    let batch = wf
        .create_batch(new_batch(vec![record("o1", None, false, 0.9)]), &ctx())
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let wf = wf.clone();
            let id = batch.id.clone();
            tokio::spawn(async move {
                let reviewer = Reviewer::new(format!("admin-{i}"), ApprovalTier::Admin);
                wf.approve(&id, &reviewer, None, &AuditContext::anonymous()).await
            })
        })
        .collect();

    let mut applied = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_applied() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_cannot_share_an_override() {
    let wf = Arc::new(workflow(CountingGateway::new(0), Arc::new(MemoryAuditSink::new())));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let wf = wf.clone();
            tokio::spawn(async move {
                wf.create_batch(new_batch(vec![record("o1", None, false, 0.9)]), &ctx())
                    .await
            })
        })
        .collect();

    let mut created = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(batch) => created.push(batch.id),
            Err(e) => assert!(e.is_conflict(), "{e}"),
        }
    }
    assert_eq!(created.len(), 1);
    assert_eq!(wf.claimed_by("o1").unwrap(), created.first().cloned());
    assert_eq!(wf.list(None).unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_override_needs_explicit_reproposal() {
    let wf = workflow(CountingGateway::new(0), Arc::new(MemoryAuditSink::new()));
    let admin = Reviewer::new("admin-1", ApprovalTier::Admin);
    let first = wf
        .create_batch(new_batch(vec![record("o1", None, false, 0.9)]), &ctx())
        .await
        .unwrap();
    wf.reject(&first.id, &admin, Some("wrong member"), &ctx()).await.unwrap();

    let err = wf
        .create_batch(new_batch(vec![record("o1", None, false, 0.9)]), &ctx())
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let mut again = new_batch(vec![record("o1", None, false, 0.9), record("o2", None, false, 0.9)]);
    again.reproposal = true;
    let second = wf.create_batch(again, &ctx()).await.unwrap();
    assert_eq!(second.reproposes, vec![first.id]);
    assert_eq!(second.status, BatchStatus::Pending);
}
