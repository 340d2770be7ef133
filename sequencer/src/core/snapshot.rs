//! Loop snapshot store: a baseline restored before every solver pass.
//!
//! Lifecycle is `store` (entering `Initializing`), `reset` (entering each
//! pass), `free` (completion or re-initialization). The owning sequence is the
//! only writer.

use tracing::trace;

use crate::core::error::ControlError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopSnapshot<T> {
    saved: Option<T>,
}

impl<T: Clone> LoopSnapshot<T> {
    pub fn new() -> Self {
        Self { saved: None }
    }

    /// Capture a deep copy of `live`, replacing any previous snapshot.
    pub fn store(&mut self, live: &T) {
        trace!("storing loop snapshot");
        self.saved = Some(live.clone());
    }

    /// Overwrite `live` with the stored baseline. The snapshot itself is not
    /// touched, so repeated resets are idempotent.
    pub fn reset(&self, live: &mut T) -> Result<(), ControlError> {
        let saved = self.saved.as_ref().ok_or(ControlError::SnapshotMissing)?;
        trace!("resetting loop data from snapshot");
        live.clone_from(saved);
        Ok(())
    }

    pub fn free(&mut self) {
        self.saved = None;
    }

    pub fn is_stored(&self) -> bool {
        self.saved.is_some()
    }

    pub fn saved(&self) -> Option<&T> {
        self.saved.as_ref()
    }
}
