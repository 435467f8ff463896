//! Confidence policy table
//!
//! Every numeric confidence decision in the crate reads from this table: the
//! classifier adapter uses it to degrade fallback results, the rule validator
//! uses it to scale predictions by rule outcome, and the MCP uses it when an
//! override changes the building type.

use serde::{Deserialize, Serialize};

/// Outcome buckets the validator reports to the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Clean,
    PassedWithWarnings,
    Violated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidencePolicy {
    /// Multiplier when every rule passed without warnings.
    pub clean_factor: f64,
    /// Multiplier when rules passed but raised warnings.
    pub warning_factor: f64,
    /// Multiplier when any rule was violated.
    pub violation_factor: f64,
    /// Ceiling applied to anything produced by the deterministic fallback.
    pub fallback_cap: f64,
    /// Confidence of a value confirmed by a named reviewer.
    pub reviewer_confirmed: f64,
    /// Starting confidence of an unattributed override before rule scaling.
    pub unreviewed_override_base: f64,
    /// Building-type confidence the rule-based fallback reports.
    pub fallback_building: f64,
    /// Fallback member confidence when the parser declared the member type.
    pub fallback_declared_member: f64,
    /// Fallback member confidence inferred from orientation alone.
    pub fallback_oriented_member: f64,
    /// Original confidence at or above which an override is flagged.
    pub high_confidence: f64,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            clean_factor: 1.0,
            warning_factor: 0.8,
            violation_factor: 0.3,
            fallback_cap: 0.5,
            reviewer_confirmed: 1.0,
            unreviewed_override_base: 0.7,
            fallback_building: 0.4,
            fallback_declared_member: 0.6,
            fallback_oriented_member: 0.4,
            high_confidence: 0.8,
        }
    }
}

impl ConfidencePolicy {
    pub fn factor(&self, outcome: RuleOutcome) -> f64 {
        match outcome {
            RuleOutcome::Clean => self.clean_factor,
            RuleOutcome::PassedWithWarnings => self.warning_factor,
            RuleOutcome::Violated => self.violation_factor,
        }
    }

    /// Scale a raw confidence by the rule outcome, clamped to [0, 1].
    pub fn adjust(&self, confidence: f64, outcome: RuleOutcome) -> f64 {
        clamp_unit(confidence * self.factor(outcome))
    }

    pub fn cap_fallback(&self, confidence: f64) -> f64 {
        clamp_unit(confidence.min(self.fallback_cap))
    }

    /// Factors must be non-increasing from clean to violated, all within [0, 1].
    pub fn check(&self) -> Result<(), String> {
        let values = [
            self.clean_factor,
            self.warning_factor,
            self.violation_factor,
            self.fallback_cap,
            self.reviewer_confirmed,
            self.unreviewed_override_base,
            self.fallback_building,
            self.fallback_declared_member,
            self.fallback_oriented_member,
            self.high_confidence,
        ];
        if values.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err("confidence policy values must lie in [0, 1]".to_string());
        }
        if !(self.clean_factor >= self.warning_factor && self.warning_factor >= self.violation_factor) {
            return Err("confidence factors must not increase as rule outcomes worsen".to_string());
        }
        Ok(())
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjustment_is_stepwise() {
        let policy = ConfidencePolicy::default();
        let clean = policy.adjust(0.9, RuleOutcome::Clean);
        let warned = policy.adjust(0.9, RuleOutcome::PassedWithWarnings);
        let violated = policy.adjust(0.9, RuleOutcome::Violated);
        assert!(clean > warned && warned > violated);
        assert!((clean - 0.9).abs() < 1e-12);
    }

    #[test]
    fn fallback_is_capped() {
        let policy = ConfidencePolicy::default();
        assert_eq!(policy.cap_fallback(0.9), 0.5);
        assert_eq!(policy.cap_fallback(0.2), 0.2);
        assert_eq!(clamp_unit(f64::NAN), 0.0);
    }

    #[test]
    fn rejects_inverted_factors() {
        let policy = ConfidencePolicy {
            warning_factor: 0.2,
            violation_factor: 0.6,
            ..ConfidencePolicy::default()
        };
        assert!(policy.check().is_err());
    }

    #[test]
    fn rejects_out_of_range_fallback_values() {
        let policy = ConfidencePolicy {
            fallback_declared_member: 1.4,
            ..ConfidencePolicy::default()
        };
        assert!(policy.check().is_err());
        assert!(ConfidencePolicy::default().check().is_ok());
    }
}
