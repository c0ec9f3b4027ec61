//! Suspend-the-world bracketing.
//!
//! Every capture runs inside a [`FreezeGuard`]: the target's threads are
//! suspended when the guard is created and resumed when it drops, so the
//! resume happens on every exit path, early error returns included.

use tracing::warn;

use crate::error::Result;
use crate::process::ProcessController;

/// Holds the target suspended for the guard's lifetime.
pub struct FreezeGuard<'a, C: ProcessController + ?Sized> {
    controller: &'a C,
}

impl<'a, C: ProcessController + ?Sized> FreezeGuard<'a, C> {
    /// Suspend all of the target's threads. The returned guard resumes them
    /// when dropped.
    pub fn freeze(controller: &'a C) -> Result<Self> {
        controller.suspend()?;
        Ok(Self { controller })
    }
}

impl<C: ProcessController + ?Sized> Drop for FreezeGuard<'_, C> {
    fn drop(&mut self) {
        if let Err(err) = self.controller.resume() {
            // Nothing useful to do from a destructor; the target stays
            // suspended and the operator has to resume it by hand.
            warn!(error = %err, "failed to resume target threads");
        }
    }
}
