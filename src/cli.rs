use crate::api::build_query_router;
use crate::app_state::McpService;
use crate::audit::AuditContext;
use crate::audit_verifier::verify_audit_log;
use crate::config::{load_config, McpConfig};
use crate::correction_recorder::OverrideRecord;
use crate::risk_scoring::RiskScoringEngine;
use crate::structural_model::StructuralModel;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Top-level CLI for the MCP guard
#[derive(Parser)]
#[command(
    name = "mcpctl",
    version,
    about = "Classification control point, rule validation and training approval for structural models"
)]
pub struct Cli {
    /// Configuration file (defaults to $MCP_CONFIG_PATH, then mcp.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classify a model and print its initial MCP
    Classify {
        /// StructuralModel JSON file
        #[arg(short, long)]
        model: PathBuf,
        /// Actor recorded in the audit trail
        #[arg(long)]
        actor: Option<String>,
    },

    /// Score a batch of override records and print the approval tier
    Score {
        /// JSON array of OverrideRecord
        #[arg(short, long)]
        overrides: PathBuf,
    },

    /// Check the hash chain of a JSONL audit log
    VerifyAudit {
        /// Log to check (defaults to audit.log_path)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Serve the read-only query API
    Serve {
        /// Host/IP to bind (defaults to server.host)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (defaults to server.port)
        #[arg(long)]
        port: Option<u16>,
    },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Classify { model, actor } => classify(&config, &model, actor).await,
        Commands::Score { overrides } => score(&config, &overrides),
        Commands::VerifyAudit { path } => verify(&config, path),
        Commands::Serve { host, port } => serve(&config, host, port).await,
    }
}

async fn classify(config: &McpConfig, path: &Path, actor: Option<String>) -> anyhow::Result<()> {
    let model: StructuralModel = read_json(path)?;
    let service = McpService::from_config(config)?;
    let ctx = actor.map(AuditContext::for_actor).unwrap_or_else(AuditContext::system);

    let mcp = service.initialize(model, &ctx).await?;
    service.flush_audit().await?;
    println!("{}", serde_json::to_string_pretty(&mcp)?);
    Ok(())
}

fn score(config: &McpConfig, path: &Path) -> anyhow::Result<()> {
    let overrides: Vec<OverrideRecord> = read_json(path)?;
    let assessment = RiskScoringEngine::new(config.risk.clone()).assess(&overrides);
    let tier = config.tiers.route(assessment.score);

    let report = serde_json::json!({
        "overrides": overrides.len(),
        "score": assessment.score,
        "factors": assessment.factors,
        "approvalLevel": tier,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn verify(config: &McpConfig, path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = match path.or_else(|| config.audit.log_path.as_ref().map(PathBuf::from)) {
        Some(p) => p,
        None => bail!("no audit log given and audit.log_path is not configured"),
    };

    let report = verify_audit_log(&path)?;
    match report.first_broken_line {
        None => {
            println!(
                "{}: {} entries, chain intact (head {})",
                path.display(),
                report.lines_checked,
                report.last_hash.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        Some(line) => bail!(
            "{}: hash chain broken at line {} ({} lines checked)",
            path.display(),
            line,
            report.lines_checked
        ),
    }
}

async fn serve(config: &McpConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let addr = format!("{host}:{port}");

    let service = Arc::new(McpService::from_config(config)?);
    let app = build_query_router(service);

    let socket_addr: std::net::SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid bind address {addr}"))?;
    let listener = tokio::net::TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("HTTP query API listening on http://{}", addr);
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
