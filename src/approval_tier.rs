use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Authority level required to decide a pending batch. Ordered: a reviewer
/// may act on any batch whose tier is at or below their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalTier {
    Auto,
    Engineer,
    Admin,
    Committee,
}

impl ApprovalTier {
    /// Next tier up, `None` at the top.
    pub fn next(self) -> Option<ApprovalTier> {
        match self {
            ApprovalTier::Auto => Some(ApprovalTier::Engineer),
            ApprovalTier::Engineer => Some(ApprovalTier::Admin),
            ApprovalTier::Admin => Some(ApprovalTier::Committee),
            ApprovalTier::Committee => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalTier::Auto => "AUTO",
            ApprovalTier::Engineer => "ENGINEER",
            ApprovalTier::Admin => "ADMIN",
            ApprovalTier::Committee => "COMMITTEE",
        }
    }
}

impl FromStr for ApprovalTier {
    type Err = String;

    fn from_str(input: &str) -> Result<ApprovalTier, Self::Err> {
        match input.to_lowercase().as_str() {
            "auto" => Ok(ApprovalTier::Auto),
            "engineer" => Ok(ApprovalTier::Engineer),
            "admin" => Ok(ApprovalTier::Admin),
            "committee" => Ok(ApprovalTier::Committee),
            other => Err(format!("unknown approval tier '{other}'")),
        }
    }
}

impl fmt::Display for ApprovalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk score cut-offs for tier routing. Each bound is inclusive on the
/// lower side: `score >= engineer` leaves AUTO, and so on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub engineer: f64,
    pub admin: f64,
    pub committee: f64,
    /// AUTO batches are approved on creation without a human decision.
    #[serde(default = "default_auto_approve")]
    pub auto_approve: bool,
}

fn default_auto_approve() -> bool {
    true
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            engineer: 0.3,
            admin: 0.5,
            committee: 0.8,
            auto_approve: true,
        }
    }
}

impl TierThresholds {
    pub fn route(&self, score: f64) -> ApprovalTier {
        if score >= self.committee {
            ApprovalTier::Committee
        } else if score >= self.admin {
            ApprovalTier::Admin
        } else if score >= self.engineer {
            ApprovalTier::Engineer
        } else {
            ApprovalTier::Auto
        }
    }

    /// Thresholds must be strictly increasing inside (0, 1].
    pub fn check(&self) -> Result<(), String> {
        let ordered = 0.0 < self.engineer
            && self.engineer < self.admin
            && self.admin < self.committee
            && self.committee <= 1.0;
        if ordered {
            Ok(())
        } else {
            Err(format!(
                "tier thresholds must satisfy 0 < engineer < admin < committee <= 1, got {} / {} / {}",
                self.engineer, self.admin, self.committee
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_is_deterministic_at_the_boundaries() {
        let t = TierThresholds::default();
        assert_eq!(t.route(0.29), ApprovalTier::Auto);
        assert_eq!(t.route(0.31), ApprovalTier::Engineer);
        assert_eq!(t.route(0.79), ApprovalTier::Admin);
        assert_eq!(t.route(0.81), ApprovalTier::Committee);
        assert_eq!(t.route(0.3), ApprovalTier::Engineer);
        assert_eq!(t.route(0.5), ApprovalTier::Admin);
        assert_eq!(t.route(0.8), ApprovalTier::Committee);
    }

    #[test]
    fn tiers_are_ordered_and_escalate_upward() {
        assert!(ApprovalTier::Auto < ApprovalTier::Engineer);
        assert!(ApprovalTier::Admin < ApprovalTier::Committee);
        assert_eq!(ApprovalTier::Engineer.next(), Some(ApprovalTier::Admin));
        assert_eq!(ApprovalTier::Committee.next(), None);
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Admin".parse::<ApprovalTier>(), Ok(ApprovalTier::Admin));
        assert!("root".parse::<ApprovalTier>().is_err());
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let t = TierThresholds {
            engineer: 0.5,
            admin: 0.4,
            committee: 0.8,
            auto_approve: true,
        };
        assert!(t.check().is_err());
        assert!(TierThresholds::default().check().is_ok());
    }
}
