use std::sync::Arc;

use tracing::info;

use crate::{
    approval_workflow::{ApprovalWorkflow, BatchStatus, NewBatch, PendingValidationBatch},
    audit::{AuditContext, AuditSink, JsonlAuditSink, TracingAuditSink},
    classifier_adapter::{ClassifierAdapter, HttpPredictor, Predictor},
    config::McpConfig,
    correction_recorder::{CorrectionRecorder, OverrideField, OverrideRecord},
    errors::{McpError, McpResult},
    mcp::{MasterControlPoint, McpEngine},
    mcp_repository::McpRepository,
    risk_scoring::RiskScoringEngine,
    rule_validator::{RuleValidator, ValidationResult},
    structural_model::StructuralModel,
    training_gateway::{HttpTrainingGateway, LocalAckGateway, TrainingGateway},
};

/// The assembled pipeline: MCP repository, approval workflow and the audit
/// log they share. Shared behind an `Arc` by the HTTP layer and the CLI.
pub struct McpService {
    repository: Arc<McpRepository>,
    workflow: Arc<ApprovalWorkflow>,
    audit_log: Option<Arc<JsonlAuditSink>>,
}

impl McpService {
    pub fn new(repository: McpRepository, workflow: ApprovalWorkflow) -> Self {
        Self {
            repository: Arc::new(repository),
            workflow: Arc::new(workflow),
            audit_log: None,
        }
    }

    /// Wire every component from configuration. Opening a file audit log
    /// needs a running Tokio runtime.
    pub fn from_config(config: &McpConfig) -> McpResult<Self> {
        let audit_log = match &config.audit.log_path {
            Some(path) => Some(Arc::new(JsonlAuditSink::open(path)?)),
            None => None,
        };
        let audit: Arc<dyn AuditSink> = match &audit_log {
            Some(log) => log.clone(),
            None => Arc::new(TracingAuditSink),
        };

        let policy = config.confidence_policy();
        let predictor: Option<Arc<dyn Predictor>> = match &config.classifier.endpoint {
            Some(endpoint) => Some(Arc::new(HttpPredictor::new(endpoint.clone())?)),
            None => {
                info!("No classifier endpoint configured; every model uses the rule-based fallback");
                None
            }
        };
        let classifier = ClassifierAdapter::new(predictor, config.classifier.timeout(), policy.clone())
            .with_rule_limits(config.rules.clone());

        let validator = RuleValidator::new(config.rules.clone(), policy);
        let engine = McpEngine::new(validator, CorrectionRecorder::new(audit.clone()));

        let gateway: Arc<dyn TrainingGateway> = match &config.gateway.endpoint {
            Some(endpoint) => Arc::new(HttpTrainingGateway::new(endpoint.clone(), config.gateway.timeout())?),
            None => Arc::new(LocalAckGateway),
        };
        let workflow = ApprovalWorkflow::new(
            RiskScoringEngine::new(config.risk.clone()),
            config.tiers.clone(),
            gateway,
            audit,
        );

        Ok(Self {
            repository: Arc::new(McpRepository::new(engine, classifier)),
            workflow: Arc::new(workflow),
            audit_log,
        })
    }

    pub fn repository(&self) -> &Arc<McpRepository> {
        &self.repository
    }

    pub fn workflow(&self) -> &Arc<ApprovalWorkflow> {
        &self.workflow
    }

    pub async fn initialize(&self, model: StructuralModel, ctx: &AuditContext) -> McpResult<MasterControlPoint> {
        self.repository.initialize(model, ctx).await
    }

    /// Bundle training candidates of one model into a batch awaiting review.
    ///
    /// The corrected values are validated again against the model so the
    /// batch carries the rule outcome of what would be trained on, not of
    /// what the classifier originally said. An override already held by a
    /// batch is a `Conflict`, including one whose batch was rejected.
    pub async fn propose_training_batch(
        &self,
        model_id: &str,
        override_ids: &[String],
        ctx: &AuditContext,
    ) -> McpResult<PendingValidationBatch> {
        self.propose(model_id, override_ids, false, ctx).await
    }

    /// Like [`Self::propose_training_batch`], but overrides from rejected
    /// batches are accepted. The new batch lists the rejected batches it
    /// supersedes and its creation is audited as a re-proposal.
    pub async fn repropose_training_batch(
        &self,
        model_id: &str,
        override_ids: &[String],
        ctx: &AuditContext,
    ) -> McpResult<PendingValidationBatch> {
        self.propose(model_id, override_ids, true, ctx).await
    }

    async fn propose(
        &self,
        model_id: &str,
        override_ids: &[String],
        reproposal: bool,
        ctx: &AuditContext,
    ) -> McpResult<PendingValidationBatch> {
        let mut ids: Vec<String> = Vec::with_capacity(override_ids.len());
        for id in override_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }

        let overrides = self.repository.overrides(model_id, &ids)?;
        let model = self.repository.model(model_id)?;
        let validation_result = self.revalidate_corrections(&model, &overrides)?;

        self.workflow
            .create_batch(
                NewBatch {
                    model_id: model_id.to_string(),
                    overrides,
                    validation_result,
                    requested_by: ctx.actor_or_anonymous(),
                    reproposal,
                },
                ctx,
            )
            .await
    }

    fn revalidate_corrections(
        &self,
        model: &StructuralModel,
        overrides: &[OverrideRecord],
    ) -> McpResult<ValidationResult> {
        let validator = self.repository.engine().validator();
        let mut results = Vec::with_capacity(overrides.len());
        for o in overrides {
            let result = match o.field {
                OverrideField::BuildingType => validator.validate_building_type(model, &o.new_value),
                OverrideField::MemberTag => {
                    let member_id = o
                        .member_id
                        .as_deref()
                        .ok_or_else(|| McpError::internal(format!("member tag override {} has no member id", o.id)))?;
                    validator.validate_member_tag(model, member_id, &o.new_value)
                }
            };
            results.push(result);
        }
        Ok(ValidationResult::merge(results, &validator.policy))
    }

    pub fn get_mcp(&self, model_id: &str) -> McpResult<MasterControlPoint> {
        self.repository.get(model_id)
    }

    /// Batches with the given status. Without one, the batches still
    /// waiting for a decision (PENDING or ESCALATED).
    pub fn get_pending_validations(&self, status: Option<BatchStatus>) -> McpResult<Vec<PendingValidationBatch>> {
        match status {
            Some(status) => self.workflow.list(Some(status)),
            None => Ok(self
                .workflow
                .list(None)?
                .into_iter()
                .filter(|b| !b.status.is_terminal())
                .collect()),
        }
    }

    pub fn get_override_history(&self, model_id: &str) -> McpResult<Vec<OverrideRecord>> {
        self.repository.override_history(model_id)
    }

    /// Wait for queued audit entries to reach the log file, if there is one.
    pub async fn flush_audit(&self) -> McpResult<()> {
        match &self.audit_log {
            Some(log) => log.flush().await,
            None => Ok(()),
        }
    }
}
