//! Process-wide engine slot.

use super::provider::ServiceEngine;
use super::Engine;
use log::info;
use once_cell::sync::Lazy;
use std::sync::{Arc, PoisonError, RwLock};

static CURRENT: Lazy<RwLock<Option<Arc<dyn Engine>>>> = Lazy::new(|| RwLock::new(None));

/// Global accessor for the active engine.
///
/// Prefer passing an `Arc<dyn Engine>` explicitly; this slot exists for hosts
/// that wire everything at startup.
pub struct EngineContext;

impl EngineContext {
    /// Active engine, creating an uninitialized `ServiceEngine` on first use.
    pub fn current() -> Arc<dyn Engine> {
        if let Some(engine) = CURRENT
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Arc::clone(engine);
        }

        let mut slot = CURRENT.write().unwrap_or_else(PoisonError::into_inner);
        let engine = slot.get_or_insert_with(|| Arc::new(ServiceEngine::new()) as Arc<dyn Engine>);
        Arc::clone(engine)
    }

    /// Swaps the active engine and returns the previous one. Startup only.
    pub fn replace(engine: Arc<dyn Engine>) -> Option<Arc<dyn Engine>> {
        let previous = CURRENT
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(engine);
        info!(
            "event=engine_replace module=engine status=ok had_previous={}",
            previous.is_some()
        );
        previous
    }
}
