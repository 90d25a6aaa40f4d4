//! Extracted widget payloads and per-action state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::WidgetError;
use crate::markers::WidgetId;

/// State blob a producer attached to one of its actions (e.g. `"lsh-sort"`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub action_id: String,
    pub state: Option<Value>,
    /// Number of internal actions posted for this id.
    pub hits: u64,
}

/// Called after an `internal` action updates its record.
pub trait RefreshHook: Send + Sync {
    fn refresh(&self, record: &ActionRecord);
}

/// Default hook: records that a refresh was requested and does nothing else.
#[derive(Debug, Default)]
pub struct LogRefresh;

impl RefreshHook for LogRefresh {
    fn refresh(&self, record: &ActionRecord) {
        info!(action_id = %record.action_id, hits = record.hits, "widget refresh requested");
    }
}

pub struct WidgetRegistry {
    next_id: AtomicU64,
    payloads: RwLock<HashMap<WidgetId, Arc<[u8]>>>,
    actions: RwLock<HashMap<String, ActionRecord>>,
    hook: Box<dyn RefreshHook>,
}

impl WidgetRegistry {
    pub fn new() -> Self {
        Self::with_refresh_hook(LogRefresh)
    }

    pub fn with_refresh_hook(hook: impl RefreshHook + 'static) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            payloads: RwLock::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
            hook: Box::new(hook),
        }
    }

    /// Store a payload verbatim under the next id.
    pub fn store(&self, payload: Vec<u8>) -> WidgetId {
        let id = WidgetId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(widget_id = %id, bytes = payload.len(), "stored widget");
        self.payloads.write().insert(id, payload.into());
        id
    }

    pub fn fetch(&self, id: WidgetId) -> Result<Arc<[u8]>, WidgetError> {
        self.payloads
            .read()
            .get(&id)
            .cloned()
            .ok_or(WidgetError::NotFound(id))
    }

    pub fn len(&self) -> usize {
        self.payloads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create the record on first sight; replace its state only when a
    /// non-null blob is given.
    pub fn upsert_action_state(&self, action_id: &str, state: Option<Value>) -> ActionRecord {
        let mut actions = self.actions.write();
        let record = actions
            .entry(action_id.to_string())
            .or_insert_with(|| ActionRecord {
                action_id: action_id.to_string(),
                state: None,
                hits: 0,
            });
        record.hits += 1;
        if let Some(state) = state.filter(|s| !s.is_null()) {
            record.state = Some(state);
        }
        record.clone()
    }

    pub fn action(&self, action_id: &str) -> Option<ActionRecord> {
        self.actions.read().get(action_id).cloned()
    }

    pub fn refresh(&self, record: &ActionRecord) {
        self.hook.refresh(record);
    }
}

impl Default for WidgetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
