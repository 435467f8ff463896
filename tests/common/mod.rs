//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use mcp_guard::{
    approval_tier::TierThresholds,
    approval_workflow::ApprovalWorkflow,
    audit::MemoryAuditSink,
    classifier_adapter::{ClassificationRequest, ClassifierAdapter, Prediction, Predictor},
    confidence_policy::ConfidencePolicy,
    correction_recorder::CorrectionRecorder,
    mcp::McpEngine,
    mcp_repository::McpRepository,
    risk_scoring::RiskScoringEngine,
    rule_validator::RuleValidator,
    structural_model::StructuralModel,
    training_gateway::LocalAckGateway,
    McpResult, McpService,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const MODEL_ID: &str = "hangar-07";

/// Four columns standing on y=0 and two rafters rising 2 over 10 to a ridge.
pub fn gable_model() -> StructuralModel {
    serde_json::from_value(json!({
        "id": MODEL_ID,
        "nodes": [
            { "id": "N1", "x": 0.0,  "y": 0.0, "z": 0.0 },
            { "id": "N2", "x": 20.0, "y": 0.0, "z": 0.0 },
            { "id": "N3", "x": 0.0,  "y": 0.0, "z": 30.0 },
            { "id": "N4", "x": 20.0, "y": 0.0, "z": 30.0 },
            { "id": "N5", "x": 0.0,  "y": 6.0, "z": 0.0 },
            { "id": "N6", "x": 20.0, "y": 6.0, "z": 0.0 },
            { "id": "N7", "x": 0.0,  "y": 6.0, "z": 30.0 },
            { "id": "N8", "x": 20.0, "y": 6.0, "z": 30.0 },
            { "id": "N9", "x": 10.0, "y": 8.0, "z": 0.0 }
        ],
        "members": [
            { "id": "C1", "startNodeId": "N1", "endNodeId": "N5", "type": "COLUMN" },
            { "id": "C2", "startNodeId": "N2", "endNodeId": "N6", "type": "COLUMN" },
            { "id": "C3", "startNodeId": "N3", "endNodeId": "N7", "type": "COLUMN" },
            { "id": "C4", "startNodeId": "N4", "endNodeId": "N8", "type": "COLUMN" },
            { "id": "R1", "startNodeId": "N5", "endNodeId": "N9", "type": "RAFTER" },
            { "id": "R2", "startNodeId": "N6", "endNodeId": "N9", "type": "RAFTER" }
        ],
        "geometry": {
            "buildingLength": 30.0,
            "buildingWidth": 20.0,
            "totalHeight": 8.0,
            "eaveHeight": 6.0,
            "roofSlope": 11.3,
            "frameCount": 2,
            "baySpacings": [30.0]
        }
    }))
    .expect("fixture model is well-formed")
}

/// Stands in for the remote classifier.
pub struct GablePredictor;

#[async_trait]
impl Predictor for GablePredictor {
    async fn predict(&self, _request: &ClassificationRequest) -> McpResult<Prediction> {
        Ok(serde_json::from_value(json!({
            "buildingType": "TRUSS_SINGLE_GABLE",
            "confidence": 0.85,
            "reasoning": ["gable frame with ridge at mid-span"],
            "memberTags": {
                "C1": "COLUMN", "C2": "COLUMN", "C3": "COLUMN", "C4": "COLUMN",
                "R1": "RAFTER", "R2": "RAFTER"
            },
            "memberConfidences": {
                "C1": 0.9, "C2": 0.9, "C3": 0.9, "C4": 0.9, "R1": 0.9, "R2": 0.9
            },
            "alternativeTypes": [{ "type": "SINGLE_GABLE_HANGAR", "confidence": 0.1 }]
        }))
        .expect("fixture prediction is well-formed"))
    }
}

pub fn service_with(sink: Arc<MemoryAuditSink>, thresholds: TierThresholds) -> McpService {
    let classifier = ClassifierAdapter::new(
        Some(Arc::new(GablePredictor)),
        Duration::from_secs(1),
        ConfidencePolicy::default(),
    );
    let engine = McpEngine::new(RuleValidator::default(), CorrectionRecorder::new(sink.clone()));
    let workflow = ApprovalWorkflow::new(
        RiskScoringEngine::default(),
        thresholds,
        Arc::new(LocalAckGateway),
        sink,
    );
    McpService::new(McpRepository::new(engine, classifier), workflow)
}

pub fn service(sink: Arc<MemoryAuditSink>) -> McpService {
    service_with(sink, TierThresholds::default())
}
