use crate::approval_tier::TierThresholds;
use crate::confidence_policy::ConfidencePolicy;
use crate::errors::{McpError, McpResult};
use crate::risk_scoring::RiskWeights;
use crate::rule_validator::RuleLimits;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "mcp.toml";
pub const CONFIG_PATH_ENV: &str = "MCP_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Prediction service URL. Without one every model uses the fallback.
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
    pub fallback_confidence_cap: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 1000,
            fallback_confidence_cap: 0.5,
        }
    }
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Hash-chained JSONL log. Entries go to `tracing` when unset.
    pub log_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 5000,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub rules: RuleLimits,
    #[serde(default)]
    pub confidence: ConfidencePolicy,
    #[serde(default)]
    pub risk: RiskWeights,
    #[serde(default)]
    pub tiers: TierThresholds,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl McpConfig {
    /// Policy table with the classifier's fallback cap applied.
    pub fn confidence_policy(&self) -> ConfidencePolicy {
        ConfidencePolicy {
            fallback_cap: self.classifier.fallback_confidence_cap,
            ..self.confidence.clone()
        }
    }

    pub fn validate(&self) -> McpResult<()> {
        if self.classifier.timeout_ms == 0 {
            return Err(McpError::config("classifier.timeout_ms must be greater than 0"));
        }
        if self.gateway.timeout_ms == 0 {
            return Err(McpError::config("gateway.timeout_ms must be greater than 0"));
        }
        self.confidence_policy()
            .check()
            .map_err(|e| McpError::config(format!("confidence: {e}")))?;
        self.tiers
            .check()
            .map_err(|e| McpError::config(format!("tiers: {e}")))?;
        self.risk
            .check()
            .map_err(|e| McpError::config(format!("risk: {e}")))?;
        if self.rules.bracing_min_deg >= self.rules.bracing_max_deg {
            return Err(McpError::config("rules.bracing_min_deg must be below rules.bracing_max_deg"));
        }
        Ok(())
    }
}

/// Layered load: defaults, then the TOML file, then `MCP_*` environment
/// variables (`MCP_TIERS__ADMIN=0.6` sets `tiers.admin`).
///
/// The file is `path` if given, else `$MCP_CONFIG_PATH`, else `mcp.toml`.
/// Only an explicitly named file has to exist.
pub fn load_config(path: Option<&str>) -> McpResult<McpConfig> {
    let explicit = path
        .map(str::to_string)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok());
    let file = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

    if let Some(explicit) = &explicit {
        if !Path::new(explicit).exists() {
            return Err(McpError::config(format!("config file {explicit} not found")));
        }
    }

    let figment = Figment::from(Serialized::defaults(McpConfig::default()))
        .merge(Toml::file(&file))
        .merge(Env::prefixed("MCP_").split("__"));

    let config: McpConfig = figment
        .extract()
        .map_err(|e| McpError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
