//! Action bridge between host UI triggers and the core
//!
//! The core registers callbacks into slots the host owns; keyboard and UI
//! triggers invoke through the slot names without holding component
//! references. Invoking an empty slot is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Named action slots the host can trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionSlot {
    /// Submit the current frame/image for detection
    Submit,
    /// Re-speak the last announcement
    Speak,
    /// Toggle the camera on or off
    StartStop,
}

impl std::fmt::Display for ActionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Submit => "submit",
            Self::Speak => "speak",
            Self::StartStop => "start-stop",
        };
        f.write_str(name)
    }
}

type Action = Box<dyn Fn() + Send + Sync>;

/// Host-owned registry of action callbacks
#[derive(Clone, Default)]
pub struct ActionBridge {
    slots: Arc<Mutex<HashMap<ActionSlot, Action>>>,
}

impl ActionBridge {
    /// Create an empty bridge
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the callback for `slot`
    pub fn register<F>(&self, slot: ActionSlot, action: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(slot, Box::new(action));
        }
    }

    /// Clear one slot
    pub fn clear(&self, slot: ActionSlot) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(&slot);
        }
    }

    /// Clear every slot (component teardown)
    pub fn clear_all(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.clear();
        }
    }

    /// Invoke `slot` if registered; silently does nothing otherwise
    pub fn invoke(&self, slot: ActionSlot) {
        let Ok(slots) = self.slots.lock() else {
            return;
        };
        if let Some(action) = slots.get(&slot) {
            tracing::debug!(%slot, "action invoked");
            action();
        } else {
            tracing::debug!(%slot, "action slot empty, ignoring");
        }
    }

    /// Whether `slot` currently has a callback
    #[must_use]
    pub fn is_registered(&self, slot: ActionSlot) -> bool {
        self.slots
            .lock()
            .map(|slots| slots.contains_key(&slot))
            .unwrap_or(false)
    }
}
