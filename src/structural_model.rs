//! Structural model as handed over by the parsing subsystem.
//!
//! The model is immutable once it reaches the core. The vertical axis is `y`;
//! `x` and `z` span the plan.

use crate::errors::{McpError, McpResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restraints: Option<BTreeMap<String, bool>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: String,
    pub start_node_id: String,
    pub end_node_id: String,
    /// Parser-assigned member type (COLUMN, RAFTER, ...), if any.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub member_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
}

/// Geometry summary computed by the parser. Every field is optional; the
/// facts extractor falls back to node coordinates when one is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geometry {
    pub building_length: Option<f64>,
    pub building_width: Option<f64>,
    pub total_height: Option<f64>,
    pub eave_height: Option<f64>,
    /// Roof slope in degrees.
    pub roof_slope: Option<f64>,
    pub frame_count: Option<u32>,
    #[serde(default)]
    pub bay_spacings: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralModel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<Node>,
    pub members: Vec<Member>,
    #[serde(default)]
    pub geometry: Geometry,
}

/// Derived line geometry of one member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemberGeometry {
    pub length: f64,
    pub horizontal_length: f64,
    pub rise: f64,
    pub low_y: f64,
    pub high_y: f64,
}

impl MemberGeometry {
    /// Rise over run. Vertical members report `f64::INFINITY`.
    pub fn slope(&self) -> f64 {
        if self.horizontal_length <= f64::EPSILON {
            f64::INFINITY
        } else {
            self.rise / self.horizontal_length
        }
    }

    /// Angle from the horizontal plane in degrees, 0..=90.
    pub fn angle_from_horizontal_deg(&self) -> f64 {
        self.rise.atan2(self.horizontal_length).to_degrees()
    }
}

impl StructuralModel {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn member_geometry(&self, member: &Member) -> Option<MemberGeometry> {
        let a = self.node(&member.start_node_id)?;
        let b = self.node(&member.end_node_id)?;
        let (dx, dy, dz) = (b.x - a.x, b.y - a.y, b.z - a.z);
        let horizontal_length = (dx * dx + dz * dz).sqrt();
        Some(MemberGeometry {
            length: (horizontal_length * horizontal_length + dy * dy).sqrt(),
            horizontal_length,
            rise: dy.abs(),
            low_y: a.y.min(b.y),
            high_y: a.y.max(b.y),
        })
    }

    /// Lowest and highest node elevation. `(0, 0)` for an empty model.
    pub fn elevation_range(&self) -> (f64, f64) {
        let mut ys = self.nodes.iter().map(|n| n.y);
        match ys.next() {
            Some(first) => ys.fold((first, first), |(lo, hi), y| (lo.min(y), hi.max(y))),
            None => (0.0, 0.0),
        }
    }

    /// Effective type of a member: explicit tag first, then parser type.
    pub fn member_kind_label(member: &Member) -> Option<&str> {
        member.tag.as_deref().or(member.member_type.as_deref())
    }
}

/// Canonical spelling of a building type or member tag: trimmed, upper case.
pub fn normalize_label(label: &str) -> String {
    label.trim().to_ascii_uppercase()
}

/// Reject models the pipeline cannot classify at all. Every reason is
/// collected so the caller sees the full list in one round trip.
pub fn validate(model: &StructuralModel) -> McpResult<()> {
    let mut reasons = Vec::new();

    if model.nodes.is_empty() {
        reasons.push("model must have at least one node".to_string());
    }
    if model.members.is_empty() {
        reasons.push("model must have at least one member".to_string());
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for node in &model.nodes {
        if !seen.insert(node.id.as_str()) {
            reasons.push(format!("duplicate node id '{}'", node.id));
        }
        if !(node.x.is_finite() && node.y.is_finite() && node.z.is_finite()) {
            reasons.push(format!("node '{}' has non-finite coordinates", node.id));
        }
    }

    let mut member_ids: HashMap<&str, usize> = HashMap::new();
    for member in &model.members {
        *member_ids.entry(member.id.as_str()).or_default() += 1;
        for endpoint in [&member.start_node_id, &member.end_node_id] {
            if !seen.contains(endpoint.as_str()) {
                reasons.push(format!(
                    "member '{}' references non-existent node '{}'",
                    member.id, endpoint
                ));
            }
        }
    }
    let mut duplicates: Vec<&str> = member_ids
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(id, _)| id)
        .collect();
    duplicates.sort_unstable();
    for id in duplicates {
        reasons.push(format!("duplicate member id '{id}'"));
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(McpError::invalid_model(reasons))
    }
}
