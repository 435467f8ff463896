//! Rule-Based Validator
//!
//! Deterministic structural plausibility checks applied to classifier output.
//! Each rule is a free function returning at most one [`RuleFinding`], so it
//! can be evaluated and tested on its own. The validator only gathers them.
//! `passed` is true iff no finding is a violation; warnings never block.

use crate::confidence_policy::{clamp_unit, ConfidencePolicy, RuleOutcome};
use crate::geometry_facts::{self, GeometryFacts, MemberKind};
use crate::structural_model::{MemberGeometry, StructuralModel};
use serde::{Deserialize, Serialize};

/// Thresholds for every rule, in model units unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleLimits {
    pub hangar_min_span: f64,
    pub hangar_min_length: f64,
    pub canopy_max_height_to_footprint: f64,
    pub multi_story_min_height: f64,
    pub elevator_min_height_to_footprint: f64,
    pub ground_tolerance: f64,
    /// Fraction of total height above which roof members are expected.
    pub roof_band_fraction: f64,
    /// Rise over run.
    pub crane_max_slope: f64,
    pub bracing_min_deg: f64,
    pub bracing_max_deg: f64,
    pub min_member_length: f64,
    pub min_columns: usize,
    pub min_horizontal_members: usize,
    pub high_rise_height: f64,
    pub max_plan_aspect_ratio: f64,
}

impl Default for RuleLimits {
    fn default() -> Self {
        Self {
            hangar_min_span: 20.0,
            hangar_min_length: 30.0,
            canopy_max_height_to_footprint: 0.5,
            multi_story_min_height: 6.0,
            elevator_min_height_to_footprint: 3.0,
            ground_tolerance: 0.1,
            roof_band_fraction: 0.7,
            crane_max_slope: 0.05,
            bracing_min_deg: 15.0,
            bracing_max_deg: 75.0,
            min_member_length: 0.1,
            min_columns: 4,
            min_horizontal_members: 2,
            high_rise_height: 60.0,
            max_plan_aspect_ratio: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Violation,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    SignageRoofConflict,
    HangarSpan,
    CanopyProportion,
    MultiStoryHeight,
    ElevatorProportion,
    ColumnGrounded,
    RoofBand,
    CraneBeamSlope,
    BracingAngle,
    MinimumLength,
    MemberMissing,
    ColumnCount,
    HorizontalCount,
    HighRise,
    PlanAspect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleFinding {
    pub rule: RuleId,
    pub severity: Severity,
    pub message: String,
    pub recommendation: String,
}

impl RuleFinding {
    fn violation(rule: RuleId, message: String, recommendation: impl Into<String>) -> Self {
        Self {
            rule,
            severity: Severity::Violation,
            message,
            recommendation: recommendation.into(),
        }
    }

    fn warning(rule: RuleId, message: String, recommendation: impl Into<String>) -> Self {
        Self {
            rule,
            severity: Severity::Warning,
            message,
            recommendation: recommendation.into(),
        }
    }
}

/// Immutable verdict of one validation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub passed: bool,
    /// Confidence multiplier in [0, 1] taken from the policy table.
    pub score: f64,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub findings: Vec<RuleFinding>,
}

impl ValidationResult {
    pub fn from_findings(findings: Vec<RuleFinding>, policy: &ConfidencePolicy) -> Self {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        let mut recommendations = Vec::new();
        for f in &findings {
            match f.severity {
                Severity::Violation => violations.push(f.message.clone()),
                Severity::Warning => warnings.push(f.message.clone()),
            }
            if !recommendations.contains(&f.recommendation) {
                recommendations.push(f.recommendation.clone());
            }
        }

        let outcome = if !violations.is_empty() {
            RuleOutcome::Violated
        } else if !warnings.is_empty() {
            RuleOutcome::PassedWithWarnings
        } else {
            RuleOutcome::Clean
        };

        Self {
            passed: violations.is_empty(),
            score: policy.factor(outcome),
            violations,
            warnings,
            recommendations,
            findings,
        }
    }

    /// Combine several results into one; passes only if all passed.
    pub fn merge(results: impl IntoIterator<Item = ValidationResult>, policy: &ConfidencePolicy) -> Self {
        let findings = results.into_iter().flat_map(|r| r.findings).collect();
        Self::from_findings(findings, policy)
    }

    /// Confidence handed back to the caller after rule scaling.
    pub fn adjusted_confidence(&self, raw: f64) -> f64 {
        clamp_unit(raw * self.score)
    }

    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }
}

/// Building category implied by a predicted building type label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildingKind {
    Signage,
    Hangar,
    Canopy,
    MultiStory,
    ElevatorShaft,
    Other,
}

impl BuildingKind {
    pub fn from_type(label: &str) -> Self {
        let label = label.to_ascii_uppercase();
        if label.contains("SIGN") || label.contains("BILLBOARD") {
            BuildingKind::Signage
        } else if label.contains("HANGAR") {
            BuildingKind::Hangar
        } else if label.contains("CANOPY") {
            BuildingKind::Canopy
        } else if label.contains("MULTI_STORY") || label.contains("MULTISTORY") {
            BuildingKind::MultiStory
        } else if label.contains("ELEVATOR") {
            BuildingKind::ElevatorShaft
        } else {
            BuildingKind::Other
        }
    }
}

// building-type rules

pub fn check_signage_roof_conflict(kind: BuildingKind, facts: &GeometryFacts) -> Option<RuleFinding> {
    (kind == BuildingKind::Signage && facts.has_roof_bearing_members()).then(|| {
        RuleFinding::violation(
            RuleId::SignageRoofConflict,
            format!(
                "signage/billboard structure cannot carry roof members ({} rafters, {} purlins present)",
                facts.count(MemberKind::Rafter),
                facts.count(MemberKind::Purlin)
            ),
            "Reclassify the building or retag the roof-bearing members",
        )
    })
}

pub fn check_hangar_span(kind: BuildingKind, facts: &GeometryFacts, limits: &RuleLimits) -> Option<RuleFinding> {
    if kind != BuildingKind::Hangar {
        return None;
    }
    let span = facts.building_width.min(facts.building_length);
    let length = facts.building_width.max(facts.building_length);
    (span < limits.hangar_min_span || length < limits.hangar_min_length).then(|| {
        RuleFinding::violation(
            RuleId::HangarSpan,
            format!(
                "hangar requires span >= {:.1} and length >= {:.1}, model is {:.1} x {:.1}",
                limits.hangar_min_span, limits.hangar_min_length, span, length
            ),
            "Hangar classification needs a wide clear span; consider a warehouse type",
        )
    })
}

pub fn check_canopy_proportion(kind: BuildingKind, facts: &GeometryFacts, limits: &RuleLimits) -> Option<RuleFinding> {
    (kind == BuildingKind::Canopy && facts.height_to_footprint > limits.canopy_max_height_to_footprint).then(|| {
        RuleFinding::violation(
            RuleId::CanopyProportion,
            format!(
                "canopy height-to-footprint ratio {:.2} exceeds {:.2}",
                facts.height_to_footprint, limits.canopy_max_height_to_footprint
            ),
            "Canopies are low and broad; check the building type",
        )
    })
}

pub fn check_multi_story_height(kind: BuildingKind, facts: &GeometryFacts, limits: &RuleLimits) -> Option<RuleFinding> {
    (kind == BuildingKind::MultiStory && facts.total_height < limits.multi_story_min_height).then(|| {
        RuleFinding::violation(
            RuleId::MultiStoryHeight,
            format!(
                "multi-story building requires height >= {:.1}, model is {:.1}",
                limits.multi_story_min_height, facts.total_height
            ),
            "Model is too short for more than one storey",
        )
    })
}

pub fn check_elevator_proportion(kind: BuildingKind, facts: &GeometryFacts, limits: &RuleLimits) -> Option<RuleFinding> {
    (kind == BuildingKind::ElevatorShaft && facts.height_to_footprint < limits.elevator_min_height_to_footprint).then(|| {
        RuleFinding::warning(
            RuleId::ElevatorProportion,
            format!(
                "elevator shaft height-to-footprint ratio {:.2} is below the expected {:.2}",
                facts.height_to_footprint, limits.elevator_min_height_to_footprint
            ),
            "Confirm the shaft proportions with the engineer",
        )
    })
}

// member rules

pub fn check_minimum_length(member_id: &str, geom: &MemberGeometry, limits: &RuleLimits) -> Option<RuleFinding> {
    (geom.length < limits.min_member_length).then(|| {
        RuleFinding::violation(
            RuleId::MinimumLength,
            format!(
                "member {member_id} length {:.3} is below the minimum {:.3}",
                geom.length, limits.min_member_length
            ),
            "Degenerate geometry; fix the model before classification",
        )
    })
}

pub fn check_column_grounded(
    member_id: &str,
    geom: &MemberGeometry,
    ground: f64,
    limits: &RuleLimits,
) -> Option<RuleFinding> {
    let gap = geom.low_y - ground;
    (gap > limits.ground_tolerance).then(|| {
        RuleFinding::violation(
            RuleId::ColumnGrounded,
            format!("column {member_id} base sits {gap:.3} above ground"),
            "Columns must reach the foundation; check the tag or the base node",
        )
    })
}

pub fn check_roof_band(
    member_id: &str,
    geom: &MemberGeometry,
    (ground, top): (f64, f64),
    limits: &RuleLimits,
) -> Option<RuleFinding> {
    let band_floor = ground + limits.roof_band_fraction * (top - ground);
    (geom.low_y < band_floor).then(|| {
        RuleFinding::warning(
            RuleId::RoofBand,
            format!(
                "roof member {member_id} sits at {:.2}, below {:.0}% of building height",
                geom.low_y,
                limits.roof_band_fraction * 100.0
            ),
            "Roof members are expected in the upper band of the structure",
        )
    })
}

pub fn check_crane_beam_slope(member_id: &str, geom: &MemberGeometry, limits: &RuleLimits) -> Option<RuleFinding> {
    let slope = geom.slope();
    (slope > limits.crane_max_slope).then(|| {
        RuleFinding::violation(
            RuleId::CraneBeamSlope,
            format!(
                "crane beam {member_id} slope {:.1}% exceeds {:.1}%",
                slope * 100.0,
                limits.crane_max_slope * 100.0
            ),
            "Crane runway beams must be level",
        )
    })
}

pub fn check_bracing_angle(member_id: &str, geom: &MemberGeometry, limits: &RuleLimits) -> Option<RuleFinding> {
    let angle = geom.angle_from_horizontal_deg();
    (angle < limits.bracing_min_deg || angle > limits.bracing_max_deg).then(|| {
        RuleFinding::warning(
            RuleId::BracingAngle,
            format!(
                "bracing {member_id} angle {angle:.1}° is outside {:.0}°..{:.0}°",
                limits.bracing_min_deg, limits.bracing_max_deg
            ),
            "Bracing is normally diagonal; check the tag",
        )
    })
}

#[derive(Debug, Clone, Default)]
pub struct RuleValidator {
    pub limits: RuleLimits,
    pub policy: ConfidencePolicy,
}

impl RuleValidator {
    pub fn new(limits: RuleLimits, policy: ConfidencePolicy) -> Self {
        Self { limits, policy }
    }

    pub fn validate_building_type(&self, model: &StructuralModel, predicted_type: &str) -> ValidationResult {
        let facts = geometry_facts::extract(model);
        self.validate_building_type_with_facts(&facts, predicted_type)
    }

    pub fn validate_building_type_with_facts(&self, facts: &GeometryFacts, predicted_type: &str) -> ValidationResult {
        let kind = BuildingKind::from_type(predicted_type);
        let limits = &self.limits;
        let findings = [
            check_signage_roof_conflict(kind, facts),
            check_hangar_span(kind, facts, limits),
            check_canopy_proportion(kind, facts, limits),
            check_multi_story_height(kind, facts, limits),
            check_elevator_proportion(kind, facts, limits),
        ]
        .into_iter()
        .flatten()
        .collect();
        ValidationResult::from_findings(findings, &self.policy)
    }

    pub fn validate_member_tag(&self, model: &StructuralModel, member_id: &str, predicted_tag: &str) -> ValidationResult {
        let geom = match model.member(member_id).and_then(|m| model.member_geometry(m)) {
            Some(geom) => geom,
            None => {
                let finding = RuleFinding::violation(
                    RuleId::MemberMissing,
                    format!("member {member_id} is not present in the model"),
                    "Tag only members that exist in the model",
                );
                return ValidationResult::from_findings(vec![finding], &self.policy);
            }
        };

        let limits = &self.limits;
        let range = model.elevation_range();
        let mut findings: Vec<RuleFinding> = check_minimum_length(member_id, &geom, limits).into_iter().collect();

        let kind_finding = match MemberKind::from_label(predicted_tag) {
            MemberKind::Column => check_column_grounded(member_id, &geom, range.0, limits),
            MemberKind::Rafter | MemberKind::Purlin => check_roof_band(member_id, &geom, range, limits),
            MemberKind::CraneBeam => check_crane_beam_slope(member_id, &geom, limits),
            MemberKind::Bracing => check_bracing_angle(member_id, &geom, limits),
            MemberKind::Beam | MemberKind::Other => None,
        };
        findings.extend(kind_finding);
        ValidationResult::from_findings(findings, &self.policy)
    }

    /// Advisory checks on the model as a whole. Only ever warns.
    pub fn validate_model_structure(&self, facts: &GeometryFacts) -> ValidationResult {
        let limits = &self.limits;
        let mut findings = Vec::new();

        let columns = facts.count(MemberKind::Column);
        if columns < limits.min_columns {
            findings.push(RuleFinding::warning(
                RuleId::ColumnCount,
                format!("only {columns} columns; a typical building needs at least {}", limits.min_columns),
                "Check that vertical members are typed as columns",
            ));
        }

        let horizontal: usize = facts
            .member_counts
            .iter()
            .filter(|(kind, _)| kind.is_horizontal())
            .map(|(_, n)| *n)
            .sum();
        if horizontal < limits.min_horizontal_members {
            findings.push(RuleFinding::warning(
                RuleId::HorizontalCount,
                format!("only {horizontal} horizontal structural members"),
                "Check beams and rafters are present and typed",
            ));
        }

        if facts.total_height > limits.high_rise_height {
            findings.push(RuleFinding::warning(
                RuleId::HighRise,
                format!("height {:.1} exceeds {:.1}; high-rise provisions apply", facts.total_height, limits.high_rise_height),
                "Additional load provisions apply to tall structures",
            ));
        }

        if facts.plan_aspect_ratio > limits.max_plan_aspect_ratio {
            findings.push(RuleFinding::warning(
                RuleId::PlanAspect,
                format!("plan aspect ratio {:.1} may require special analysis", facts.plan_aspect_ratio),
                "Consider dividing the plan with expansion joints",
            ));
        }

        ValidationResult::from_findings(findings, &self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structural_model::fixtures::{gable_frame, member, node};

    fn crane_model(rise: f64) -> StructuralModel {
        let mut model = gable_frame();
        model.nodes.push(node("K1", 0.0, 5.0, 5.0));
        model.nodes.push(node("K2", 10.0, 5.0 + rise, 5.0));
        model.members.push(member("K", "K1", "K2", "BEAM"));
        model
    }

    #[test]
    fn crane_beam_slope_threshold() {
        let validator = RuleValidator::default();

        let steep = validator.validate_member_tag(&crane_model(1.0), "K", "CRANE_BEAM");
        assert!(!steep.passed);
        assert_eq!(steep.violations.len(), 1);
        assert!(steep.violations[0].contains("10.0%"));

        let level = validator.validate_member_tag(&crane_model(0.2), "K", "CRANE_BEAM");
        assert!(level.passed);
        assert!(level.violations.is_empty());
    }

    #[test]
    fn gable_frame_passes_as_predicted() {
        let validator = RuleValidator::default();
        let model = gable_frame();
        let building = validator.validate_building_type(&model, "TRUSS_SINGLE_GABLE");
        assert!(building.passed && building.warnings.is_empty());
        assert_eq!(building.score, 1.0);

        for id in ["C1", "C2", "C3", "C4"] {
            assert!(validator.validate_member_tag(&model, id, "COLUMN").passed);
        }
        for id in ["R1", "R2"] {
            let r = validator.validate_member_tag(&model, id, "RAFTER");
            assert!(r.passed && r.warnings.is_empty());
        }
    }

    #[test]
    fn signage_with_rafters_is_a_violation() {
        let result = RuleValidator::default().validate_building_type(&gable_frame(), "SIGNAGE_BILLBOARD");
        assert!(!result.passed);
        assert_eq!(result.findings[0].rule, RuleId::SignageRoofConflict);
        assert_eq!(result.score, ConfidencePolicy::default().violation_factor);
    }

    #[test]
    fn hangar_needs_span() {
        let validator = RuleValidator::default();
        let facts = geometry_facts::extract(&gable_frame());
        // 20 x 30 meets the default limits exactly
        assert!(validator.validate_building_type_with_facts(&facts, "SINGLE_GABLE_HANGAR").passed);

        let mut narrow = facts.clone();
        narrow.building_width = 12.0;
        assert!(check_hangar_span(BuildingKind::Hangar, &narrow, &validator.limits).is_some());
    }

    #[test]
    fn canopy_and_multi_story_proportions() {
        let limits = RuleLimits::default();
        let mut facts = geometry_facts::extract(&gable_frame());
        facts.height_to_footprint = 0.9;
        assert!(check_canopy_proportion(BuildingKind::Canopy, &facts, &limits).is_some());
        facts.total_height = 4.0;
        assert!(check_multi_story_height(BuildingKind::MultiStory, &facts, &limits).is_some());
        assert!(check_multi_story_height(BuildingKind::Other, &facts, &limits).is_none());
    }

    #[test]
    fn squat_elevator_shaft_only_warns() {
        let result = RuleValidator::default().validate_building_type(&gable_frame(), "ELEVATOR_SHAFT");
        assert!(result.passed);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.score, ConfidencePolicy::default().warning_factor);
    }

    #[test]
    fn floating_column_is_a_violation() {
        let validator = RuleValidator::default();
        // R1 runs from eave to ridge; tagging it as a column leaves it off the ground
        let result = validator.validate_member_tag(&gable_frame(), "R1", "COLUMN");
        assert!(!result.passed);
        assert_eq!(result.findings[0].rule, RuleId::ColumnGrounded);
    }

    #[test]
    fn low_rafter_and_flat_bracing_warn() {
        let validator = RuleValidator::default();
        let model = crane_model(0.0);
        let rafter = validator.validate_member_tag(&model, "K", "RAFTER");
        assert!(rafter.passed);
        assert_eq!(rafter.findings[0].rule, RuleId::RoofBand);

        let brace = validator.validate_member_tag(&model, "K", "X_BRACE");
        assert!(brace.passed);
        assert_eq!(brace.findings[0].rule, RuleId::BracingAngle);
    }

    #[test]
    fn degenerate_member_is_a_violation() {
        let mut model = gable_frame();
        model.nodes.push(node("D1", 1.0, 1.0, 1.0));
        model.nodes.push(node("D2", 1.0, 1.0, 1.01));
        model.members.push(member("D", "D1", "D2", "BEAM"));
        let result = RuleValidator::default().validate_member_tag(&model, "D", "BEAM");
        assert_eq!(result.findings[0].rule, RuleId::MinimumLength);
        assert!(!result.passed);
    }

    #[test]
    fn unknown_member_is_reported() {
        let result = RuleValidator::default().validate_member_tag(&gable_frame(), "nope", "COLUMN");
        assert!(!result.passed);
        assert_eq!(result.findings[0].rule, RuleId::MemberMissing);
    }

    #[test]
    fn structure_advisories_only_warn() {
        let validator = RuleValidator::default();
        let mut facts = geometry_facts::extract(&gable_frame());
        facts.member_counts.clear();
        facts.total_height = 80.0;
        let result = validator.validate_model_structure(&facts);
        assert!(result.passed);
        assert_eq!(result.warnings.len(), 3);
    }
}
