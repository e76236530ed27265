//! Store seam for the scheduler, plus an in-process implementation.

use agentdeck_core::error::{DeckError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};

use crate::trigger::{FiringLogEntry, NewWorkItem, Trigger, WorkItem, WorkItemId};

/// The four operations the scheduler needs from persistent storage.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Enabled cron triggers that carry an expression.
    async fn list_due_candidates(&self) -> Result<Vec<Trigger>>;

    /// Insert a work item. Fails with [`DeckError::Duplicate`] when an item
    /// with the same `fire_key` already exists.
    async fn insert_work_item(&self, item: &NewWorkItem) -> Result<WorkItemId>;

    /// Record a successful firing. Older timestamps than the stored one are
    /// ignored so `last_fired_at` never goes backwards.
    async fn update_last_fired(&self, trigger_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn append_firing_log(&self, entry: &FiringLogEntry) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    triggers: Vec<Trigger>,
    work_items: Vec<WorkItem>,
    firings: Vec<FiringLogEntry>,
}

/// Non-durable store kept entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| DeckError::Store(format!("memory store lock poisoned: {e}")))
    }

    pub fn add_trigger(&self, trigger: Trigger) -> Result<()> {
        self.lock()?.triggers.push(trigger);
        Ok(())
    }

    pub fn trigger(&self, id: &str) -> Option<Trigger> {
        self.lock()
            .ok()?
            .triggers
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn work_items(&self) -> Vec<WorkItem> {
        self.lock().map(|s| s.work_items.clone()).unwrap_or_default()
    }

    pub fn firings(&self) -> Vec<FiringLogEntry> {
        self.lock().map(|s| s.firings.clone()).unwrap_or_default()
    }

    pub fn firings_for(&self, trigger_id: &str) -> Vec<FiringLogEntry> {
        self.firings()
            .into_iter()
            .filter(|f| f.trigger_id == trigger_id)
            .collect()
    }
}

#[async_trait]
impl TriggerStore for MemoryStore {
    async fn list_due_candidates(&self) -> Result<Vec<Trigger>> {
        Ok(self
            .lock()?
            .triggers
            .iter()
            .filter(|t| t.is_candidate())
            .cloned()
            .collect())
    }

    async fn insert_work_item(&self, item: &NewWorkItem) -> Result<WorkItemId> {
        let mut state = self.lock()?;
        if state
            .work_items
            .iter()
            .any(|w| w.fire_key.as_deref() == Some(item.fire_key.as_str()))
        {
            return Err(DeckError::Duplicate(format!(
                "work item for {} already exists",
                item.fire_key
            )));
        }
        let id = uuid::Uuid::new_v4().to_string();
        state.work_items.push(WorkItem::from_new(id.clone(), item));
        Ok(id)
    }

    async fn update_last_fired(&self, trigger_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        let trigger = state
            .triggers
            .iter_mut()
            .find(|t| t.id == trigger_id)
            .ok_or_else(|| DeckError::TriggerNotFound(trigger_id.to_string()))?;
        if trigger.last_fired_at.is_none_or(|last| last < at) {
            trigger.last_fired_at = Some(at);
        }
        Ok(())
    }

    async fn append_firing_log(&self, entry: &FiringLogEntry) -> Result<()> {
        self.lock()?.firings.push(entry.clone());
        Ok(())
    }
}
