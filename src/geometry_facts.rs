//! Geometry Facts Extractor
//!
//! Derives normalized scalar facts from a [`StructuralModel`]. Pure: no state,
//! no I/O, the same model always yields the same facts.

use crate::structural_model::StructuralModel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Below this the roof counts as flat (degrees).
const FLAT_ROOF_DEG: f64 = 2.0;
/// Above this the roof counts as steep (degrees).
const STEEP_ROOF_DEG: f64 = 30.0;
const LOW_RISE_LIMIT: f64 = 60.0;
const MID_RISE_LIMIT: f64 = 160.0;
const MAX_FLOORS: u32 = 10;
const IRREGULAR_OFFSET: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeightClass {
    LowRise,
    MidRise,
    HighRise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RigidityClass {
    Rigid,
    SemiRigid,
    Flexible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoofType {
    Flat,
    Mono,
    Gable,
    Steep,
}

/// Structural role implied by a member tag or parser type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberKind {
    Column,
    Rafter,
    Purlin,
    CraneBeam,
    Bracing,
    Beam,
    Other,
}

impl MemberKind {
    pub fn from_label(label: &str) -> Self {
        let label = label.to_ascii_uppercase();
        // crane first: "CRANE_BEAM" would otherwise read as a plain beam
        if label.contains("CRANE") || label.contains("RUNWAY") {
            MemberKind::CraneBeam
        } else if label.contains("COLUMN") {
            MemberKind::Column
        } else if label.contains("RAFTER") {
            MemberKind::Rafter
        } else if label.contains("PURLIN") {
            MemberKind::Purlin
        } else if label.contains("BRAC") {
            MemberKind::Bracing
        } else if label.contains("BEAM") || label.contains("GIRT") || label.contains("CHORD") {
            MemberKind::Beam
        } else {
            MemberKind::Other
        }
    }

    /// Members that carry roof load.
    pub fn is_roof_bearing(self) -> bool {
        matches!(self, MemberKind::Rafter | MemberKind::Purlin)
    }

    pub fn is_horizontal(self) -> bool {
        matches!(
            self,
            MemberKind::Beam | MemberKind::Rafter | MemberKind::Purlin | MemberKind::CraneBeam
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometryFacts {
    pub min_elevation: f64,
    pub max_elevation: f64,
    pub total_height: f64,
    pub eave_height: f64,
    pub building_length: f64,
    pub building_width: f64,
    pub plan_area: f64,
    pub height_class: HeightClass,
    /// Longer plan side over shorter plan side, >= 1.
    pub plan_aspect_ratio: f64,
    pub height_to_width: f64,
    /// Height over the square root of the plan area.
    pub height_to_footprint: f64,
    pub rigidity_class: RigidityClass,
    pub roof_type: RoofType,
    pub roof_slope_deg: f64,
    pub floor_count: u32,
    pub plan_centroid_offset: f64,
    pub plan_irregular: bool,
    pub member_counts: BTreeMap<MemberKind, usize>,
}

impl GeometryFacts {
    pub fn count(&self, kind: MemberKind) -> usize {
        self.member_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn has_roof_bearing_members(&self) -> bool {
        self.count(MemberKind::Rafter) + self.count(MemberKind::Purlin) > 0
    }
}

/// Extract every fact from a model. Summary values from the parser win over
/// values recomputed from node coordinates.
pub fn extract(model: &StructuralModel) -> GeometryFacts {
    let (min_elevation, max_elevation) = model.elevation_range();
    let (bbox_length, bbox_width) = plan_extent(model);

    let geometry = &model.geometry;
    let total_height = positive(geometry.total_height).unwrap_or(max_elevation - min_elevation);
    let building_length = positive(geometry.building_length).unwrap_or(bbox_length);
    let building_width = positive(geometry.building_width).unwrap_or(bbox_width);
    let eave_height = positive(geometry.eave_height).unwrap_or(total_height);
    let plan_area = building_length * building_width;

    let long_side = building_length.max(building_width);
    let short_side = building_length.min(building_width);
    let plan_aspect_ratio = if short_side > 0.0 { long_side / short_side } else { 1.0 };
    let height_to_width = if short_side > 0.0 { total_height / short_side } else { 0.0 };
    let height_to_footprint = if plan_area > 0.0 {
        total_height / plan_area.sqrt()
    } else {
        0.0
    };

    let roof_slope_deg = geometry
        .roof_slope
        .filter(|s| s.is_finite())
        .map(f64::abs)
        .unwrap_or_else(|| mean_roof_member_slope(model));

    let plan_centroid_offset = centroid_offset(model);

    GeometryFacts {
        min_elevation,
        max_elevation,
        total_height,
        eave_height,
        building_length,
        building_width,
        plan_area,
        height_class: classify_height(total_height),
        plan_aspect_ratio,
        height_to_width,
        height_to_footprint,
        rigidity_class: classify_rigidity(plan_aspect_ratio),
        roof_type: classify_roof(model, roof_slope_deg),
        roof_slope_deg,
        floor_count: estimate_floor_count(model),
        plan_centroid_offset,
        plan_irregular: plan_centroid_offset > IRREGULAR_OFFSET,
        member_counts: count_members(model),
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

fn plan_extent(model: &StructuralModel) -> (f64, f64) {
    let mut nodes = model.nodes.iter();
    let Some(first) = nodes.next() else {
        return (0.0, 0.0);
    };
    let (mut min_x, mut max_x, mut min_z, mut max_z) = (first.x, first.x, first.z, first.z);
    for n in nodes {
        min_x = min_x.min(n.x);
        max_x = max_x.max(n.x);
        min_z = min_z.min(n.z);
        max_z = max_z.max(n.z);
    }
    (max_z - min_z, max_x - min_x)
}

pub fn classify_height(height: f64) -> HeightClass {
    if height < LOW_RISE_LIMIT {
        HeightClass::LowRise
    } else if height < MID_RISE_LIMIT {
        HeightClass::MidRise
    } else {
        HeightClass::HighRise
    }
}

pub fn classify_rigidity(plan_aspect_ratio: f64) -> RigidityClass {
    if plan_aspect_ratio <= 2.0 {
        RigidityClass::Rigid
    } else if plan_aspect_ratio <= 3.0 {
        RigidityClass::SemiRigid
    } else {
        RigidityClass::Flexible
    }
}

fn roof_members(model: &StructuralModel) -> impl Iterator<Item = &crate::structural_model::Member> {
    model.members.iter().filter(|m| {
        StructuralModel::member_kind_label(m)
            .map(|label| MemberKind::from_label(label).is_roof_bearing())
            .unwrap_or(false)
    })
}

fn mean_roof_member_slope(model: &StructuralModel) -> f64 {
    let slopes: Vec<f64> = roof_members(model)
        .filter_map(|m| model.member_geometry(m))
        .filter(|g| g.horizontal_length > 0.1)
        .map(|g| g.angle_from_horizontal_deg())
        .collect();
    if slopes.is_empty() {
        0.0
    } else {
        slopes.iter().sum::<f64>() / slopes.len() as f64
    }
}

/// A ridge inside the plan (not on its boundary) means a gable.
fn classify_roof(model: &StructuralModel, slope_deg: f64) -> RoofType {
    if slope_deg < FLAT_ROOF_DEG {
        return RoofType::Flat;
    }
    if slope_deg > STEEP_ROOF_DEG {
        return RoofType::Steep;
    }

    let xs = || model.nodes.iter().map(|n| n.x);
    let zs = || model.nodes.iter().map(|n| n.z);
    let (min_x, max_x) = (xs().fold(f64::INFINITY, f64::min), xs().fold(f64::NEG_INFINITY, f64::max));
    let (min_z, max_z) = (zs().fold(f64::INFINITY, f64::min), zs().fold(f64::NEG_INFINITY, f64::max));
    let tol = 1e-6;

    let interior_ridge = roof_members(model).any(|m| {
        let (Some(a), Some(b)) = (model.node(&m.start_node_id), model.node(&m.end_node_id)) else {
            return false;
        };
        let high = if a.y >= b.y { a } else { b };
        let inside_x = high.x > min_x + tol && high.x < max_x - tol;
        let inside_z = high.z > min_z + tol && high.z < max_z - tol;
        inside_x || inside_z
    });

    if interior_ridge {
        RoofType::Gable
    } else {
        RoofType::Mono
    }
}

fn estimate_floor_count(model: &StructuralModel) -> u32 {
    // millimetre buckets keep float noise from inventing levels
    let mut levels: Vec<i64> = model.nodes.iter().map(|n| (n.y * 1000.0).round() as i64).collect();
    levels.sort_unstable();
    levels.dedup();
    if levels.len() <= 2 {
        return 1;
    }

    let gaps: Vec<f64> = levels.windows(2).map(|w| (w[1] - w[0]) as f64 / 1000.0).collect();
    let average = gaps.iter().sum::<f64>() / gaps.len() as f64;
    let floors = 1 + gaps.iter().filter(|g| **g > average * 0.5).count() as u32;
    floors.min(MAX_FLOORS)
}

fn centroid_offset(model: &StructuralModel) -> f64 {
    if model.nodes.is_empty() {
        return 0.0;
    }
    let n = model.nodes.len() as f64;
    let (sum_x, sum_z) = model.nodes.iter().fold((0.0, 0.0), |(sx, sz), node| (sx + node.x, sz + node.z));
    let (min_x, max_x) = model
        .nodes
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), node| (lo.min(node.x), hi.max(node.x)));
    let (min_z, max_z) = model
        .nodes
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), node| (lo.min(node.z), hi.max(node.z)));

    let offset_x = (sum_x / n - (min_x + max_x) / 2.0).abs() / (max_x - min_x).max(1.0);
    let offset_z = (sum_z / n - (min_z + max_z) / 2.0).abs() / (max_z - min_z).max(1.0);
    offset_x.max(offset_z)
}

fn count_members(model: &StructuralModel) -> BTreeMap<MemberKind, usize> {
    let mut counts = BTreeMap::new();
    for member in &model.members {
        let kind = StructuralModel::member_kind_label(member)
            .map(MemberKind::from_label)
            .unwrap_or(MemberKind::Other);
        *counts.entry(kind).or_insert(0) += 1;
    }
    counts
}
