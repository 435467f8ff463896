//! Keyed repository of MCP records, one per model id.
//!
//! Each record sits behind its own `RwLock`: mutations take the write side
//! and are serialized per model, reads clone under the read side. The
//! classifier runs before any lock is taken, so a slow predictor never
//! blocks other models or readers.

use crate::audit::AuditContext;
use crate::classifier_adapter::ClassifierAdapter;
use crate::correction_recorder::OverrideRecord;
use crate::errors::{McpError, McpResult, SafeReadLock, SafeWriteLock};
use crate::mcp::{MasterControlPoint, McpEngine, McpState, TagOrigin};
use crate::structural_model::{self, StructuralModel};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 256;

/// Change notifications for UI refresh. Nothing in the core depends on
/// anyone listening.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum McpEvent {
    Initialized { model_id: String, mcp_id: String },
    Superseded { model_id: String, previous_mcp_id: String },
    Updated { model_id: String, field: String },
    Locked { model_id: String },
    Unlocked { model_id: String },
}

struct McpEntry {
    model: Arc<StructuralModel>,
    record: RwLock<MasterControlPoint>,
}

pub struct McpRepository {
    entries: RwLock<HashMap<String, Arc<McpEntry>>>,
    engine: McpEngine,
    classifier: ClassifierAdapter,
    events: broadcast::Sender<McpEvent>,
}

impl McpRepository {
    pub fn new(engine: McpEngine, classifier: ClassifierAdapter) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            engine,
            classifier,
            events,
        }
    }

    pub fn engine(&self) -> &McpEngine {
        &self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: McpEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn entry(&self, model_id: &str) -> McpResult<Arc<McpEntry>> {
        self.entries
            .safe_read()?
            .get(model_id)
            .cloned()
            .ok_or_else(|| McpError::not_found("mcp", model_id))
    }

    /// Ingest a model and build its MCP. A previous MCP for the same model id
    /// is superseded. Fails only on a malformed model.
    pub async fn initialize(&self, model: StructuralModel, ctx: &AuditContext) -> McpResult<MasterControlPoint> {
        structural_model::validate(&model)?;

        let outcome = self.classifier.classify(&model).await;
        let mcp = self.engine.build(&model, outcome, ctx);
        let model_id = model.id.clone();
        let entry = Arc::new(McpEntry {
            model: Arc::new(model),
            record: RwLock::new(mcp.clone()),
        });

        let previous = self.entries.safe_write()?.insert(model_id.clone(), entry);
        if let Some(previous) = previous {
            let previous_mcp_id = previous.record.safe_read()?.id.clone();
            info!("MCP {} for model {} superseded", previous_mcp_id, model_id);
            self.notify(McpEvent::Superseded {
                model_id: model_id.clone(),
                previous_mcp_id,
            });
        }
        self.notify(McpEvent::Initialized {
            model_id,
            mcp_id: mcp.id.clone(),
        });
        Ok(mcp)
    }

    pub fn get(&self, model_id: &str) -> McpResult<MasterControlPoint> {
        let entry = self.entry(model_id)?;
        let record = entry.record.safe_read()?;
        Ok(record.clone())
    }

    pub fn model(&self, model_id: &str) -> McpResult<Arc<StructuralModel>> {
        Ok(self.entry(model_id)?.model.clone())
    }

    pub fn state(&self, model_id: &str) -> McpResult<McpState> {
        match self.entry(model_id) {
            Ok(entry) => Ok(entry.record.safe_read()?.state()),
            Err(McpError::NotFound { .. }) => Ok(McpState::Uninitialized),
            Err(e) => Err(e),
        }
    }

    pub fn model_ids(&self) -> McpResult<Vec<String>> {
        let mut ids: Vec<String> = self.entries.safe_read()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn override_history(&self, model_id: &str) -> McpResult<Vec<OverrideRecord>> {
        Ok(self.get(model_id)?.training_candidates)
    }

    /// Look up override records by id, all from one model.
    pub fn overrides(&self, model_id: &str, override_ids: &[String]) -> McpResult<Vec<OverrideRecord>> {
        let entry = self.entry(model_id)?;
        let record = entry.record.safe_read()?;
        override_ids
            .iter()
            .map(|id| {
                record
                    .training_candidate(id)
                    .cloned()
                    .ok_or_else(|| McpError::not_found("override", id.as_str()))
            })
            .collect()
    }

    /// Run `f` under the model's write lock.
    fn mutate<T>(
        &self,
        model_id: &str,
        f: impl FnOnce(&McpEngine, &StructuralModel, &mut MasterControlPoint) -> McpResult<T>,
    ) -> McpResult<T> {
        let entry = self.entry(model_id)?;
        let mut record = entry.record.safe_write()?;
        f(&self.engine, &entry.model, &mut record)
    }

    pub fn update_building_type(
        &self,
        model_id: &str,
        new_type: &str,
        reviewer_id: Option<&str>,
        confidence: Option<f64>,
        ctx: &AuditContext,
    ) -> McpResult<Option<OverrideRecord>> {
        let record = self.mutate(model_id, |engine, model, mcp| {
            engine.update_building_type(mcp, model, new_type, reviewer_id, confidence, ctx)
        })?;
        self.notify(McpEvent::Updated {
            model_id: model_id.to_string(),
            field: "buildingType".to_string(),
        });
        Ok(record)
    }

    pub fn update_member_tag(
        &self,
        model_id: &str,
        member_id: &str,
        new_tag: &str,
        reviewer_id: Option<&str>,
        origin: TagOrigin,
        ctx: &AuditContext,
    ) -> McpResult<Option<OverrideRecord>> {
        let record = self.mutate(model_id, |engine, model, mcp| {
            engine.update_member_tag(mcp, model, member_id, new_tag, reviewer_id, origin, ctx)
        })?;
        self.notify(McpEvent::Updated {
            model_id: model_id.to_string(),
            field: format!("memberTag:{member_id}"),
        });
        Ok(record)
    }

    pub fn lock(&self, model_id: &str, ctx: &AuditContext) -> McpResult<()> {
        self.mutate(model_id, |engine, _, mcp| engine.lock(mcp, ctx))?;
        self.notify(McpEvent::Locked {
            model_id: model_id.to_string(),
        });
        Ok(())
    }

    pub fn unlock(&self, model_id: &str, ctx: &AuditContext) -> McpResult<()> {
        self.mutate(model_id, |engine, _, mcp| {
            engine.unlock(mcp, ctx);
            Ok(())
        })?;
        self.notify(McpEvent::Unlocked {
            model_id: model_id.to_string(),
        });
        Ok(())
    }

    pub fn freeze_automation(&self, model_id: &str, ctx: &AuditContext) -> McpResult<()> {
        self.mutate(model_id, |engine, _, mcp| engine.set_automation_frozen(mcp, true, ctx))
    }

    pub fn resume_automation(&self, model_id: &str, ctx: &AuditContext) -> McpResult<()> {
        self.mutate(model_id, |engine, _, mcp| engine.set_automation_frozen(mcp, false, ctx))
    }

    /// Re-run the classifier and merge its answer into the record.
    pub async fn refresh_classification(&self, model_id: &str, ctx: &AuditContext) -> McpResult<MasterControlPoint> {
        let entry = self.entry(model_id)?;
        {
            let record = entry.record.safe_read()?;
            if record.is_locked {
                return Err(McpError::locked(model_id, "refresh classification"));
            }
        }

        let outcome = self.classifier.classify(&entry.model).await;
        debug!("Reclassified model {} (fallback={})", model_id, outcome.used_fallback());

        // state may have changed while classifying; the engine re-checks
        let mut record = entry.record.safe_write()?;
        self.engine.apply_reclassification(&mut record, &entry.model, outcome, ctx)?;
        let updated = record.clone();
        drop(record);

        self.notify(McpEvent::Updated {
            model_id: model_id.to_string(),
            field: "classification".to_string(),
        });
        Ok(updated)
    }
}
