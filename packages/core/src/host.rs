//! The host adapter contract: the mutation primitives and timers the commit
//! pipeline drives.
//!
//! Hosts never see lanes or effect lists, only "apply this fiber's mutation
//! now". Every mutation primitive is fallible; a returned error is attributed
//! to the failing fiber and routed to the nearest error boundary without
//! aborting the rest of the commit.

use crate::errors::CapturedValue;
use crate::fiber::{FiberId, Fibers};

/// Handle to a host timer scheduled with [`HostConfig::schedule_timeout`].
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutHandle(pub u64);

/// Sentinel for "no timer pending".
pub const NO_TIMEOUT: TimeoutHandle = TimeoutHandle(u64::MAX);

pub type HostResult = Result<(), CapturedValue>;

/// The tree-mutation backend.
///
/// `schedule_timeout` timers fire by the embedder calling
/// [`crate::Reconciler::flush_delayed_commit`] for the root the timer was
/// scheduled against; the reconciler cancels the handle when new work lands
/// before the deadline.
pub trait HostConfig {
    /// Called once per commit before any mutation. Returns the currently
    /// focused instance, if the host tracks focus.
    fn prepare_for_commit(&mut self) -> Option<FiberId>;

    fn reset_after_commit(&mut self);

    /// The focused instance is about to be deleted or hidden by this commit.
    fn before_active_instance_blur(&mut self);
    fn after_active_instance_blur(&mut self);

    fn schedule_timeout(&mut self, ms: u64) -> TimeoutHandle;
    fn cancel_timeout(&mut self, handle: TimeoutHandle);

    fn commit_placement(&mut self, fibers: &Fibers, fiber: FiberId) -> HostResult;
    fn commit_work(&mut self, fibers: &Fibers, fiber: FiberId) -> HostResult;
    fn commit_deletion(&mut self, fibers: &Fibers, fiber: FiberId) -> HostResult;
    fn commit_hydration(&mut self, fibers: &Fibers, fiber: FiberId) -> HostResult;
    fn reset_text_content(&mut self, fibers: &Fibers, fiber: FiberId) -> HostResult;
}

/// A host that applies nothing. Useful for renderers that only care about
/// the reconciler's bookkeeping (SSR prepasses, tests).
#[derive(Default)]
pub struct NoOpHost {
    next_timeout: u64,
}

impl HostConfig for NoOpHost {
    fn prepare_for_commit(&mut self) -> Option<FiberId> {
        None
    }

    fn reset_after_commit(&mut self) {}

    fn before_active_instance_blur(&mut self) {}

    fn after_active_instance_blur(&mut self) {}

    fn schedule_timeout(&mut self, _ms: u64) -> TimeoutHandle {
        let handle = TimeoutHandle(self.next_timeout);
        self.next_timeout += 1;
        handle
    }

    fn cancel_timeout(&mut self, _handle: TimeoutHandle) {}

    fn commit_placement(&mut self, _fibers: &Fibers, _fiber: FiberId) -> HostResult {
        Ok(())
    }

    fn commit_work(&mut self, _fibers: &Fibers, _fiber: FiberId) -> HostResult {
        Ok(())
    }

    fn commit_deletion(&mut self, _fibers: &Fibers, _fiber: FiberId) -> HostResult {
        Ok(())
    }

    fn commit_hydration(&mut self, _fibers: &Fibers, _fiber: FiberId) -> HostResult {
        Ok(())
    }

    fn reset_text_content(&mut self, _fibers: &Fibers, _fiber: FiberId) -> HostResult {
        Ok(())
    }
}
