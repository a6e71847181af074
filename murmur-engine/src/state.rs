//! Preset state surface
//!
//! External preset import/export builds on this: every registered provider
//! contributes a named JSON fragment, and `full_state` assembles them with
//! the phase list and a timestamp. The engine itself registers nothing; the
//! embedder decides what is worth capturing.

use crate::model::PhaseMarker;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// A state provider: returns a JSON fragment describing one subsystem
pub type StateProviderFn = Box<dyn Fn() -> Value + Send + Sync>;

/// Registry of state providers
#[derive(Default)]
pub struct StateProviders {
    providers: Mutex<HashMap<String, StateProviderFn>>,
}

impl StateProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a provider under `id`
    pub fn register(&self, id: &str, provider: StateProviderFn) {
        debug!(id, "state provider registered");
        self.providers
            .lock()
            .unwrap()
            .insert(id.to_string(), provider);
    }

    /// Remove a provider; returns whether it existed
    pub fn unregister(&self, id: &str) -> bool {
        self.providers.lock().unwrap().remove(id).is_some()
    }

    /// Registered provider ids
    pub fn ids(&self) -> Vec<String> {
        self.providers.lock().unwrap().keys().cloned().collect()
    }

    /// Assemble the full state snapshot
    ///
    /// `{ "phases": [...], "timestamp": ..., "<provider id>": <fragment> }`
    pub fn full_state(&self, phases: &[PhaseMarker]) -> Value {
        let mut state = json!({
            "phases": phases,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let map = state.as_object_mut().expect("object literal");
        for (id, provider) in self.providers.lock().unwrap().iter() {
            map.insert(id.clone(), provider());
        }
        state
    }
}
