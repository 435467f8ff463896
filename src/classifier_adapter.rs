//! Classifier Adapter
//!
//! Wraps the external prediction service behind a hard deadline. The adapter
//! never fails: a timeout, a transport error or a missing endpoint all yield
//! [`ClassificationOutcome::FallbackUsed`] carrying a deterministic prediction
//! of the same shape, with confidence capped by the policy table.

use crate::confidence_policy::{clamp_unit, ConfidencePolicy};
use crate::errors::{McpError, McpResult};
use crate::geometry_facts::{self, GeometryFacts, HeightClass, MemberKind, RoofType};
use crate::rule_validator::RuleLimits;
use crate::structural_model::{normalize_label, Member, StructuralModel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_REASONS: usize = 10;

/// Per-member features sent to the predictor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberFeatures {
    pub member_id: String,
    pub declared_type: Option<String>,
    pub length: f64,
    pub angle_from_horizontal_deg: f64,
    pub relative_elevation: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRequest {
    pub model_id: String,
    pub facts: GeometryFacts,
    pub members: Vec<MemberFeatures>,
}

impl ClassificationRequest {
    pub fn from_model(model: &StructuralModel, facts: &GeometryFacts) -> Self {
        let (ground, top) = model.elevation_range();
        let height = (top - ground).max(f64::EPSILON);
        let members = model
            .members
            .iter()
            .filter_map(|m| {
                let g = model.member_geometry(m)?;
                Some(MemberFeatures {
                    member_id: m.id.clone(),
                    declared_type: StructuralModel::member_kind_label(m).map(str::to_string),
                    length: g.length,
                    angle_from_horizontal_deg: g.angle_from_horizontal_deg(),
                    relative_elevation: ((g.low_y + g.high_y) / 2.0 - ground) / height,
                })
            })
            .collect();
        Self {
            model_id: model.id.clone(),
            facts: facts.clone(),
            members,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlternativeType {
    #[serde(rename = "type")]
    pub building_type: String,
    pub confidence: f64,
}

/// Response shape shared by the remote predictor and the fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub building_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Vec<String>,
    #[serde(default)]
    pub member_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub member_confidences: BTreeMap<String, f64>,
    #[serde(default)]
    pub alternative_types: Vec<AlternativeType>,
}

/// Result of one classification attempt. Both branches carry a usable
/// prediction; the second records why the remote call was not used.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationOutcome {
    Classified(Prediction),
    FallbackUsed { prediction: Prediction, cause: String },
}

impl ClassificationOutcome {
    pub fn prediction(&self) -> &Prediction {
        match self {
            ClassificationOutcome::Classified(p) => p,
            ClassificationOutcome::FallbackUsed { prediction, .. } => prediction,
        }
    }

    pub fn into_prediction(self) -> Prediction {
        match self {
            ClassificationOutcome::Classified(p) => p,
            ClassificationOutcome::FallbackUsed { prediction, .. } => prediction,
        }
    }

    pub fn used_fallback(&self) -> bool {
        matches!(self, ClassificationOutcome::FallbackUsed { .. })
    }
}

/// External building/member classifier.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, request: &ClassificationRequest) -> McpResult<Prediction>;
}

/// Predictor backed by the ML service's HTTP endpoint.
pub struct HttpPredictor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPredictor {
    pub fn new(endpoint: impl Into<String>) -> McpResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mcp_guard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| McpError::network("build classifier client", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, request: &ClassificationRequest) -> McpResult<Prediction> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| McpError::network("classifier request", e))?;

        if !response.status().is_success() {
            return Err(McpError::classifier(format!(
                "classifier returned {}",
                response.status()
            )));
        }

        response
            .json::<Prediction>()
            .await
            .map_err(|e| McpError::network("classifier response", e))
    }
}

pub struct ClassifierAdapter {
    predictor: Option<Arc<dyn Predictor>>,
    deadline: Duration,
    policy: ConfidencePolicy,
    limits: RuleLimits,
}

impl ClassifierAdapter {
    pub fn new(predictor: Option<Arc<dyn Predictor>>, deadline: Duration, policy: ConfidencePolicy) -> Self {
        Self {
            predictor,
            deadline,
            policy,
            limits: RuleLimits::default(),
        }
    }

    /// Use the validator's limits for geometry-based tagging.
    pub fn with_rule_limits(mut self, limits: RuleLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Adapter that always uses the deterministic fallback.
    pub fn offline(policy: ConfidencePolicy) -> Self {
        Self::new(None, Duration::from_millis(0), policy)
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Classify a model. Issues at most one remote call and never retries.
    pub async fn classify(&self, model: &StructuralModel) -> ClassificationOutcome {
        let facts = geometry_facts::extract(model);

        let Some(predictor) = &self.predictor else {
            return self.fallback(model, &facts, "no classifier endpoint configured".to_string());
        };

        let request = ClassificationRequest::from_model(model, &facts);
        match tokio::time::timeout(self.deadline, predictor.predict(&request)).await {
            Ok(Ok(prediction)) => {
                debug!(
                    "Classifier predicted {} ({:.2}) for model {}",
                    prediction.building_type, prediction.confidence, model.id
                );
                ClassificationOutcome::Classified(self.complete(model, &facts, prediction))
            }
            Ok(Err(e)) => {
                warn!("Classifier call failed for model {}: {}", model.id, e);
                self.fallback(model, &facts, format!("classifier error: {e}"))
            }
            Err(_) => {
                warn!(
                    "Classifier timed out after {}ms for model {}",
                    self.deadline.as_millis(),
                    model.id
                );
                self.fallback(
                    model,
                    &facts,
                    format!("classifier timed out after {}ms", self.deadline.as_millis()),
                )
            }
        }
    }

    /// Normalise labels, clamp confidences and fill in tags the predictor
    /// left out.
    fn complete(&self, model: &StructuralModel, facts: &GeometryFacts, mut prediction: Prediction) -> Prediction {
        prediction.building_type = normalize_label(&prediction.building_type);
        prediction.confidence = clamp_unit(prediction.confidence);
        for tag in prediction.member_tags.values_mut() {
            *tag = normalize_label(tag);
        }
        for c in prediction.member_confidences.values_mut() {
            *c = clamp_unit(*c);
        }
        for alt in &mut prediction.alternative_types {
            alt.building_type = normalize_label(&alt.building_type);
            alt.confidence = clamp_unit(alt.confidence);
        }
        prediction
            .member_tags
            .retain(|member_id, _| model.member(member_id).is_some());

        let mut filled = 0;
        for member in &model.members {
            if prediction.member_tags.contains_key(&member.id) {
                prediction.member_confidences.entry(member.id.clone()).or_insert(prediction.confidence);
                continue;
            }
            let (tag, confidence) = fallback_member_tag(model, member, &self.policy, &self.limits);
            prediction.member_tags.insert(member.id.clone(), tag);
            prediction
                .member_confidences
                .insert(member.id.clone(), self.policy.cap_fallback(confidence));
            filled += 1;
        }
        if filled > 0 {
            prediction
                .reasoning
                .push(format!("{filled} member tags inferred from geometry (not returned by classifier)"));
        }

        prediction.reasoning.extend(narrate(facts));
        prediction.reasoning.truncate(MAX_REASONS);
        prediction
    }

    fn fallback(&self, model: &StructuralModel, facts: &GeometryFacts, cause: String) -> ClassificationOutcome {
        let mut prediction = fallback_prediction(model, facts, &self.policy, &self.limits);
        prediction.confidence = self.policy.cap_fallback(prediction.confidence);
        for c in prediction.member_confidences.values_mut() {
            *c = self.policy.cap_fallback(*c);
        }
        prediction
            .reasoning
            .insert(0, format!("Deterministic fallback used: {cause}"));
        prediction.reasoning.extend(narrate(facts));
        prediction.reasoning.truncate(MAX_REASONS);
        ClassificationOutcome::FallbackUsed { prediction, cause }
    }
}

/// Pure rule from aspect ratio and roof slope. Never touches the network.
pub fn fallback_building_type(facts: &GeometryFacts) -> &'static str {
    if facts.height_to_footprint >= 3.0 {
        return "ELEVATOR_SHAFT";
    }
    match facts.roof_type {
        RoofType::Flat => {
            if facts.height_class != HeightClass::LowRise || (facts.floor_count >= 2 && facts.total_height >= 6.0) {
                "SYMMETRIC_MULTI_STORY"
            } else if facts.height_to_footprint < 0.5 {
                "CAR_SHED_CANOPY"
            } else {
                "TEMPORARY_STRUCTURE"
            }
        }
        RoofType::Mono => "MONO_SLOPE_BUILDING",
        RoofType::Gable | RoofType::Steep => {
            if facts.plan_aspect_ratio > 2.0 {
                "INDUSTRIAL_WAREHOUSE"
            } else {
                "TRUSS_SINGLE_GABLE"
            }
        }
    }
}

/// Declared label if the parser supplied one, otherwise orientation.
fn fallback_member_tag(
    model: &StructuralModel,
    member: &Member,
    policy: &ConfidencePolicy,
    limits: &RuleLimits,
) -> (String, f64) {
    if let Some(label) = StructuralModel::member_kind_label(member) {
        return (normalize_label(label), policy.fallback_declared_member);
    }

    let tag = match model.member_geometry(member) {
        Some(g) => {
            let angle = g.angle_from_horizontal_deg();
            if angle > 60.0 {
                "COLUMN"
            } else if angle < 30.0 {
                let (ground, top) = model.elevation_range();
                if g.low_y >= ground + limits.roof_band_fraction * (top - ground) {
                    "RAFTER"
                } else {
                    "BEAM"
                }
            } else {
                "BRACE"
            }
        }
        None => "UNKNOWN",
    };
    (tag.to_string(), policy.fallback_oriented_member)
}

pub fn fallback_prediction(
    model: &StructuralModel,
    facts: &GeometryFacts,
    policy: &ConfidencePolicy,
    limits: &RuleLimits,
) -> Prediction {
    let building_type = fallback_building_type(facts).to_string();
    let mut member_tags = BTreeMap::new();
    let mut member_confidences = BTreeMap::new();
    for member in &model.members {
        let (tag, confidence) = fallback_member_tag(model, member, policy, limits);
        member_tags.insert(member.id.clone(), tag);
        member_confidences.insert(member.id.clone(), confidence);
    }

    Prediction {
        reasoning: vec![format!(
            "Rule-based: plan aspect {:.2}, roof {:?} at {:.1}° -> {}",
            facts.plan_aspect_ratio, facts.roof_type, facts.roof_slope_deg, building_type
        )],
        building_type,
        confidence: policy.fallback_building,
        member_tags,
        member_confidences,
        alternative_types: Vec::new(),
    }
}

fn narrate(facts: &GeometryFacts) -> Vec<String> {
    let mut lines = vec![format!("Height classification: {:?}", facts.height_class)];
    if facts.building_length > 0.0 && facts.building_width > 0.0 {
        lines.push(format!(
            "Building dimensions: {:.1} x {:.1}",
            facts.building_length, facts.building_width
        ));
        let ratio = facts.building_length / facts.building_width.max(1.0);
        if ratio > 2.0 {
            lines.push("Long, narrow structure suggests hangar or industrial building".to_string());
        } else if ratio < 0.8 {
            lines.push("Square footprint suggests multi-story or specialized structure".to_string());
        }
    }
    if facts.count(MemberKind::CraneBeam) > 0 {
        lines.push("Crane runway members present".to_string());
    }
    lines
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::structural_model::fixtures::gable_frame;

    fn adapter(predictor: Arc<dyn Predictor>, deadline_ms: u64) -> ClassifierAdapter {
        ClassifierAdapter::new(
            Some(predictor),
            Duration::from_millis(deadline_ms),
            ConfidencePolicy::default(),
        )
    }

    #[tokio::test]
    async fn uses_remote_prediction_within_deadline() {
        let predictor = Arc::new(FixedPredictor {
            prediction: gable_prediction(),
            delay: Duration::ZERO,
        });
        let outcome = adapter(predictor, 1000).classify(&gable_frame()).await;
        assert!(!outcome.used_fallback());
        let p = outcome.prediction();
        assert_eq!(p.building_type, "TRUSS_SINGLE_GABLE");
        assert_eq!(p.confidence, 0.85);
        assert_eq!(p.member_tags.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_into_fallback() {
        let predictor = Arc::new(FixedPredictor {
            prediction: gable_prediction(),
            delay: Duration::from_secs(30),
        });
        let outcome = adapter(predictor, 1000).classify(&gable_frame()).await;
        match &outcome {
            ClassificationOutcome::FallbackUsed { cause, prediction } => {
                assert!(cause.contains("timed out"));
                assert!(prediction.confidence <= 0.5);
                assert!(prediction.reasoning[0].contains("fallback"));
            }
            other => panic!("expected fallback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_error_falls_back_with_same_shape() {
        let outcome = adapter(Arc::new(FailingPredictor), 1000).classify(&gable_frame()).await;
        assert!(outcome.used_fallback());
        let p = outcome.prediction();
        assert_eq!(p.member_tags.len(), 6);
        assert_eq!(p.member_tags["C1"], "COLUMN");
        assert!(p.member_confidences.values().all(|c| *c <= 0.5));
    }

    #[tokio::test]
    async fn missing_member_tags_are_filled() {
        let mut partial = gable_prediction();
        partial.member_tags.remove("R2");
        partial.member_tags.insert("ghost".to_string(), "COLUMN".to_string());
        let predictor = Arc::new(FixedPredictor {
            prediction: partial,
            delay: Duration::ZERO,
        });
        let outcome = adapter(predictor, 1000).classify(&gable_frame()).await;
        let p = outcome.prediction();
        assert_eq!(p.member_tags["R2"], "RAFTER");
        assert!(!p.member_tags.contains_key("ghost"));
        assert!(p.member_confidences["R2"] <= 0.5);
    }

    #[test]
    fn fallback_rule_is_deterministic() {
        let facts = geometry_facts::extract(&gable_frame());
        assert_eq!(fallback_building_type(&facts), "TRUSS_SINGLE_GABLE");

        let mut long = facts.clone();
        long.plan_aspect_ratio = 3.0;
        assert_eq!(fallback_building_type(&long), "INDUSTRIAL_WAREHOUSE");

        let mut tower = facts;
        tower.height_to_footprint = 4.0;
        assert_eq!(fallback_building_type(&tower), "ELEVATOR_SHAFT");
    }

    #[test]
    fn orientation_tags_unlabelled_members() {
        let mut model = gable_frame();
        for m in &mut model.members {
            m.member_type = None;
        }
        let facts = geometry_facts::extract(&model);
        let p = fallback_prediction(&model, &facts, &ConfidencePolicy::default(), &RuleLimits::default());
        assert_eq!(p.member_tags["C1"], "COLUMN");
        assert_eq!(p.member_tags["R1"], "RAFTER");
        assert_eq!(p.member_confidences["R1"], 0.4);
    }

    #[tokio::test]
    async fn fallback_reads_policy_and_rule_limits() {
        let mut model = gable_frame();
        model.members[0].member_type = None;
        model.members[4].member_type = None;
        let policy = ConfidencePolicy {
            fallback_building: 0.25,
            fallback_declared_member: 0.45,
            fallback_oriented_member: 0.15,
            ..ConfidencePolicy::default()
        };
        // rafter R1 starts at y=6 of 8: above a 0.7 band, below a 0.9 one
        let limits = RuleLimits {
            roof_band_fraction: 0.9,
            ..RuleLimits::default()
        };

        let outcome = ClassifierAdapter::offline(policy)
            .with_rule_limits(limits)
            .classify(&model)
            .await;
        let p = outcome.prediction();
        assert!(outcome.used_fallback());
        assert_eq!(p.confidence, 0.25);
        assert_eq!(p.member_confidences["C1"], 0.15);
        assert_eq!(p.member_confidences["C2"], 0.45);
        assert_eq!(p.member_tags["C1"], "COLUMN");
        assert_eq!(p.member_tags["R1"], "BEAM");
    }

    #[tokio::test]
    async fn predictor_labels_are_normalised() {
        let mut prediction = gable_prediction();
        prediction.building_type = " truss_single_gable".to_string();
        prediction.member_tags.insert("R1".to_string(), "rafter ".to_string());
        prediction.alternative_types[0].building_type = "single_gable_hangar".to_string();
        let predictor = Arc::new(FixedPredictor {
            prediction,
            delay: Duration::ZERO,
        });

        let outcome = adapter(predictor, 1000).classify(&gable_frame()).await;
        let p = outcome.prediction();
        assert_eq!(p.building_type, "TRUSS_SINGLE_GABLE");
        assert_eq!(p.member_tags["R1"], "RAFTER");
        assert_eq!(p.alternative_types[0].building_type, "SINGLE_GABLE_HANGAR");
    }
}
