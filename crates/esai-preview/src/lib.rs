//! Single-slot preview surface for untrusted markup.
//!
//! Content is only ever rendered through [`frame`], which wraps it in a
//! sandboxed frame with an opaque origin, and served by [`server`].

pub mod frame;
pub mod server;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use frame::IsolatedFrame;
pub use server::{PreviewServer, PreviewServerConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewTarget {
    pub content: String,
    pub label: String,
    pub revision: u64,
}

/// Where runners publish markup. Last writer wins; `hide` is idempotent.
pub trait PreviewSink {
    fn show(&self, content: &str, label: &str);
    fn hide(&self);
}

#[derive(Debug, Default)]
struct SlotState {
    target: Option<PreviewTarget>,
    revision: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PreviewSlot {
    state: Arc<Mutex<SlotState>>,
}

impl PreviewSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> Option<PreviewTarget> {
        self.lock().target.clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().target.is_some()
    }

    /// Bumped on every show and every hide that cleared something.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }
}

impl PreviewSink for PreviewSlot {
    fn show(&self, content: &str, label: &str) {
        let mut state = self.lock();
        state.revision += 1;
        state.target = Some(PreviewTarget {
            content: content.to_string(),
            label: label.to_string(),
            revision: state.revision,
        });
    }

    fn hide(&self) {
        let mut state = self.lock();
        if state.target.take().is_some() {
            state.revision += 1;
        }
    }
}
