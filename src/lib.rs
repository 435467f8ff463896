//! Library root for the `mcp_guard` crate

// Core error handling
pub mod errors;

// Model ingest & geometry
pub mod geometry_facts;
pub mod structural_model;

// Classification & rules
pub mod classifier_adapter;
pub mod confidence_policy;
pub mod rule_validator;

// Audit
pub mod audit;
pub mod audit_verifier;
pub mod correction_recorder;

// Master Control Point
pub mod mcp;
pub mod mcp_repository;

// Risk & approval
pub mod approval_tier;
pub mod approval_workflow;
pub mod risk_scoring;
pub mod training_gateway;

// Service, configuration & interfaces
pub mod api;
pub mod app_state;
pub mod cli;
pub mod config;

pub use app_state::McpService;
pub use errors::{McpError, McpResult};
