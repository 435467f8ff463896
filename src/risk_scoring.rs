//! Risk Scoring Engine
//!
//! Scores a batch of overrides in `[0, 1]` from four factors, each itself in
//! `[0, 1]`, combined as a weight-normalised sum. All coefficients live in
//! [`RiskWeights`] so they can be tuned from configuration.

use crate::confidence_policy::clamp_unit;
use crate::correction_recorder::OverrideRecord;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskWeights {
    /// Share of overrides without a reviewer.
    pub anonymity: f64,
    /// Share of overrides that replaced a rule-passing value.
    pub rule_contradiction: f64,
    pub velocity: f64,
    pub confidence_swing: f64,
    pub velocity_window_secs: i64,
    /// Overrides per requester per window that carry no velocity risk.
    pub velocity_free_allowance: usize,
    /// Count per window at which velocity risk saturates.
    pub velocity_burst_ceiling: usize,
    /// Original confidence at or below which overriding carries no swing risk.
    pub swing_floor: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            anonymity: 0.35,
            rule_contradiction: 0.25,
            velocity: 0.20,
            confidence_swing: 0.20,
            velocity_window_secs: 300,
            velocity_free_allowance: 3,
            velocity_burst_ceiling: 20,
            swing_floor: 0.3,
        }
    }
}

impl RiskWeights {
    fn total(&self) -> f64 {
        self.anonymity + self.rule_contradiction + self.velocity + self.confidence_swing
    }

    pub fn check(&self) -> Result<(), String> {
        let weights = [self.anonymity, self.rule_contradiction, self.velocity, self.confidence_swing];
        // a zero weight would silently switch its factor off
        if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err("risk weights must be finite and strictly positive".to_string());
        }
        if self.velocity_window_secs <= 0 {
            return Err("velocity window must be positive".to_string());
        }
        if self.velocity_burst_ceiling <= self.velocity_free_allowance {
            return Err("velocity burst ceiling must exceed the free allowance".to_string());
        }
        if !(0.0..1.0).contains(&self.swing_floor) {
            return Err("swing floor must lie in [0, 1)".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactors {
    pub anonymity: f64,
    pub rule_contradiction: f64,
    pub velocity: f64,
    pub confidence_swing: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub score: f64,
    pub factors: RiskFactors,
}

#[derive(Debug, Clone, Default)]
pub struct RiskScoringEngine {
    weights: RiskWeights,
}

impl RiskScoringEngine {
    pub fn new(weights: RiskWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RiskWeights {
        &self.weights
    }

    pub fn score(&self, overrides: &[OverrideRecord]) -> f64 {
        self.assess(overrides).score
    }

    pub fn assess(&self, overrides: &[OverrideRecord]) -> RiskAssessment {
        assess(overrides, &self.weights)
    }
}

pub fn assess(overrides: &[OverrideRecord], weights: &RiskWeights) -> RiskAssessment {
    if overrides.is_empty() {
        return RiskAssessment {
            score: 0.0,
            factors: RiskFactors::default(),
        };
    }

    let n = overrides.len() as f64;
    let factors = RiskFactors {
        anonymity: overrides.iter().filter(|o| o.reviewer_id.is_none()).count() as f64 / n,
        rule_contradiction: overrides.iter().filter(|o| !o.original_had_violations).count() as f64 / n,
        velocity: velocity_factor(overrides, weights),
        confidence_swing: overrides
            .iter()
            .map(|o| swing(o.original_confidence, weights.swing_floor))
            .sum::<f64>()
            / n,
    };

    let total = weights.total();
    let weighted = weights.anonymity * factors.anonymity
        + weights.rule_contradiction * factors.rule_contradiction
        + weights.velocity * factors.velocity
        + weights.confidence_swing * factors.confidence_swing;
    let score = if total > 0.0 { clamp_unit(weighted / total) } else { 0.0 };

    RiskAssessment { score, factors }
}

fn swing(original_confidence: f64, floor: f64) -> f64 {
    clamp_unit((clamp_unit(original_confidence) - floor) / (1.0 - floor))
}

/// Largest number of overrides one requester issued inside any window,
/// scaled between the free allowance and the burst ceiling.
fn velocity_factor(overrides: &[OverrideRecord], weights: &RiskWeights) -> f64 {
    let window = Duration::seconds(weights.velocity_window_secs);
    let mut by_requester: HashMap<&str, Vec<_>> = HashMap::new();
    for o in overrides {
        by_requester.entry(o.requested_by.as_str()).or_default().push(o.timestamp);
    }

    let mut peak = 0usize;
    for times in by_requester.values_mut() {
        times.sort_unstable();
        let mut start = 0;
        for end in 0..times.len() {
            while times[end] - times[start] > window {
                start += 1;
            }
            peak = peak.max(end - start + 1);
        }
    }

    let free = weights.velocity_free_allowance as f64;
    let ceiling = weights.velocity_burst_ceiling as f64;
    clamp_unit((peak as f64 - free) / (ceiling - free))
}
