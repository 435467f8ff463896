//! End-to-end pipeline: ingest, classify, validate, override, batch, route.

mod common;

use common::{gable_model, service, MODEL_ID};
use mcp_guard::{
    approval_tier::ApprovalTier,
    approval_workflow::BatchStatus,
    audit::{AuditContext, MemoryAuditSink},
    audit_verifier::verify_audit_log,
    config::McpConfig,
    mcp::{ClassificationSource, McpState, TagOrigin},
    McpError, McpService,
};
use std::sync::Arc;

#[tokio::test]
async fn crane_beam_override_routes_to_review() {
    let sink = Arc::new(MemoryAuditSink::new());
    let svc = service(sink.clone());
    let engineer = AuditContext::anonymous().with_session("s-1");

    let mcp = svc.initialize(gable_model(), &engineer).await.unwrap();
    assert!(!mcp.is_locked);
    assert_eq!(mcp.state(), McpState::Ready);
    assert_eq!(mcp.building_type, "TRUSS_SINGLE_GABLE");
    assert!((mcp.building_type_confidence - 0.85).abs() < 1e-9);
    assert_eq!(mcp.classification_source, ClassificationSource::Model);
    assert!(mcp.validation.is_valid);
    assert!(mcp.validation.errors.is_empty());

    let model = svc.repository().model(MODEL_ID).unwrap();
    let check = svc
        .repository()
        .engine()
        .validator()
        .validate_member_tag(&model, "R1", "CRANE_BEAM");
    assert_eq!(check.violations.len(), 1, "{:?}", check.violations);
    assert!(!check.passed);

    let record = svc
        .repository()
        .update_member_tag(MODEL_ID, "R1", "CRANE_BEAM", None, TagOrigin::Manual, &engineer)
        .unwrap()
        .expect("changed tag produces an override");
    assert_eq!(record.original_value, "RAFTER");
    assert_eq!(record.new_value, "CRANE_BEAM");
    assert!(record.is_anonymous());
    assert!(record.compliance_flags.contains(&"unattributed".to_string()));

    let mcp = svc.get_mcp(MODEL_ID).unwrap();
    assert!(!mcp.validation.is_valid);
    assert_eq!(mcp.training_candidates.len(), 1);

    let batch = svc
        .propose_training_batch(MODEL_ID, &[record.id.clone()], &engineer)
        .await
        .unwrap();
    assert_eq!(batch.validation_result.violations.len(), 1);
    assert!(batch.risk_score > 0.0);
    assert!(batch.approval_level >= ApprovalTier::Engineer, "{}", batch.approval_level);
    assert_eq!(batch.status, BatchStatus::Pending);

    let actions = sink.actions();
    assert!(actions.contains(&"mcp.initialize".to_string()));
    assert!(actions.contains(&"override.memberTag".to_string()));
    assert!(actions.contains(&"batch.create".to_string()));
}

#[tokio::test]
async fn lock_requires_a_valid_record_and_freezes_it() {
    let svc = service(Arc::new(MemoryAuditSink::new()));
    let ctx = AuditContext::for_actor("eng-2");
    svc.initialize(gable_model(), &ctx).await.unwrap();

    svc.repository()
        .update_member_tag(MODEL_ID, "R1", "CRANE_BEAM", Some("eng-2"), TagOrigin::Manual, &ctx)
        .unwrap();
    let err = svc.repository().lock(MODEL_ID, &ctx).unwrap_err();
    assert!(matches!(err, McpError::Precondition { .. }));
    assert_eq!(svc.repository().state(MODEL_ID).unwrap(), McpState::Ready);

    svc.repository()
        .update_member_tag(MODEL_ID, "R1", "RAFTER", Some("eng-2"), TagOrigin::Manual, &ctx)
        .unwrap();
    svc.repository().lock(MODEL_ID, &ctx).unwrap();
    assert_eq!(svc.repository().state(MODEL_ID).unwrap(), McpState::Locked);

    let before = svc.get_mcp(MODEL_ID).unwrap();
    let err = svc
        .repository()
        .update_building_type(MODEL_ID, "INDUSTRIAL_WAREHOUSE", Some("eng-2"), None, &ctx)
        .unwrap_err();
    assert!(matches!(err, McpError::Locked { .. }));
    assert_eq!(svc.get_mcp(MODEL_ID).unwrap(), before);

    svc.repository().unlock(MODEL_ID, &ctx).unwrap();
    let changed = svc
        .repository()
        .update_building_type(MODEL_ID, "INDUSTRIAL_WAREHOUSE", Some("eng-2"), None, &ctx)
        .unwrap();
    assert!(changed.is_some());
    assert_eq!(svc.get_mcp(MODEL_ID).unwrap().classification_source, ClassificationSource::Manual);
}

#[tokio::test]
async fn malformed_model_is_rejected_with_every_reason() {
    let svc = service(Arc::new(MemoryAuditSink::new()));
    let mut model = gable_model();
    model.nodes.clear();

    let err = svc.initialize(model, &AuditContext::system()).await.unwrap_err();
    match err {
        McpError::InvalidModel { reasons } => {
            assert!(reasons.iter().any(|r| r.contains("node")));
            assert!(reasons.len() > 1, "{reasons:?}");
        }
        other => panic!("expected InvalidModel, got {other:?}"),
    }
    assert_eq!(svc.repository().state(MODEL_ID).unwrap(), McpState::Uninitialized);
}

#[tokio::test]
async fn audit_log_from_config_keeps_an_intact_chain() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("audit").join("mcp.jsonl");
    let mut config = McpConfig::default();
    config.audit.log_path = Some(log.to_string_lossy().to_string());

    let svc = McpService::from_config(&config).unwrap();
    let ctx = AuditContext::for_actor("eng-9").with_client("10.0.0.4", "dashboard/1.2");
    let mcp = svc.initialize(gable_model(), &ctx).await.unwrap();
    assert_eq!(mcp.classification_source, ClassificationSource::Fallback);

    let member = mcp.member_tags[0].member_id.clone();
    svc.repository()
        .update_member_tag(MODEL_ID, &member, "BRACE", Some("eng-9"), TagOrigin::Manual, &ctx)
        .unwrap();
    svc.flush_audit().await.unwrap();

    let report = verify_audit_log(&log).unwrap();
    assert!(report.is_intact());
    assert!(report.lines_checked >= 2);
}
