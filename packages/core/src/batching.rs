//! Execution-context tracking and the batching wrappers.
//!
//! Each wrapper pushes a bit onto the context word for the duration of the
//! callback and, if the word drains back to empty, flushes the synchronous
//! callback queue - so only the outermost batch triggers a sync flush and
//! nesting is free.

use bitflags::bitflags;

use crate::errors::ReconcileResult;
use crate::hooks::RenderHooks;
use crate::host::HostConfig;
use crate::lanes::Lanes;
use crate::root::RootId;
use crate::scheduler::{TaskPriority, TaskScheduler};
use crate::suspense::SuspenseConfig;
use crate::work_loop::Reconciler;

bitflags! {
    /// Where the reconciler currently is on the call stack.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecutionContext: u8 {
        const BATCHED         = 1 << 0;
        const EVENT           = 1 << 1;
        const DISCRETE_EVENT  = 1 << 2;
        const LEGACY_UNBATCHED = 1 << 3;
        const RENDER          = 1 << 4;
        const COMMIT          = 1 << 5;
    }
}

impl<S: TaskScheduler, H: HostConfig, R: RenderHooks> Reconciler<S, H, R> {
    pub fn execution_context(&self) -> ExecutionContext {
        self.execution_context
    }

    /// Run `f` with the scheduler priority the reconciler reports for
    /// updates requested inside it.
    pub fn run_with_priority<T>(
        &mut self,
        priority: TaskPriority,
        f: impl FnOnce(&mut Self) -> T,
    ) -> T {
        let previous = self.current_priority;
        self.current_priority = priority;
        let value = f(self);
        self.current_priority = previous;
        value
    }

    /// Run `f` with a scoped transition config consulted by
    /// `request_update_lane` and the busy-delay commit deferral.
    pub fn with_suspense_config<T>(
        &mut self,
        config: SuspenseConfig,
        f: impl FnOnce(&mut Self) -> T,
    ) -> T {
        let previous = self.pending_suspense_config.replace(config);
        let value = f(self);
        self.pending_suspense_config = previous;
        value
    }

    /// Batch every update inside `f` into one render pass.
    pub fn batched_updates<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> T,
    ) -> ReconcileResult<T> {
        self.with_context_bit(ExecutionContext::BATCHED, f)
    }

    /// Batch the updates of one host event.
    pub fn batched_event_updates<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> T,
    ) -> ReconcileResult<T> {
        self.with_context_bit(ExecutionContext::EVENT, f)
    }

    /// Run a discrete host event: updates inside get user-blocking priority
    /// and their roots are remembered for [`Self::flush_discrete_updates`].
    pub fn discrete_updates<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> T,
    ) -> ReconcileResult<T> {
        let previous = self.execution_context;
        self.execution_context |= ExecutionContext::DISCRETE_EVENT;
        let value = self.run_with_priority(TaskPriority::UserBlocking, f);
        self.execution_context = previous;
        if self.execution_context.is_empty() {
            self.flush_sync_callback_queue()?;
        }
        Ok(value)
    }

    /// Escape an enclosing batch; used by legacy mounts so the initial
    /// render commits inside the caller's stack frame.
    pub fn unbatched_updates<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> T,
    ) -> ReconcileResult<T> {
        let previous = self.execution_context;
        self.execution_context &= !ExecutionContext::BATCHED;
        self.execution_context |= ExecutionContext::LEGACY_UNBATCHED;
        let value = f(self);
        self.execution_context = previous;
        if self.execution_context.is_empty() {
            self.flush_sync_callback_queue()?;
        }
        Ok(value)
    }

    /// Run `f` and synchronously flush the work it scheduled before
    /// returning. Inside render or commit this degrades to a plain call;
    /// flushing mid-render would tear the tree.
    pub fn flush_sync<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> ReconcileResult<T> {
        if self
            .execution_context
            .intersects(ExecutionContext::RENDER | ExecutionContext::COMMIT)
        {
            tracing::warn!("flush_sync called from inside render or commit; running unflushed");
            return Ok(f(self));
        }
        let previous = self.execution_context;
        self.execution_context |= ExecutionContext::BATCHED;
        let value = self.run_with_priority(TaskPriority::Immediate, f);
        self.execution_context = previous;
        self.flush_sync_callback_queue()?;
        Ok(value)
    }

    /// Like [`Self::flush_sync`] but only flushes when it is the outermost
    /// batch; used for controlled-input reconciliation.
    pub fn flush_controlled<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> ReconcileResult<T> {
        let previous = self.execution_context;
        self.execution_context |= ExecutionContext::BATCHED;
        let value = self.run_with_priority(TaskPriority::Immediate, f);
        self.execution_context = previous;
        if self.execution_context.is_empty() {
            self.flush_sync_callback_queue()?;
        }
        Ok(value)
    }

    /// Run `f` at Normal priority, downgrading any updates it requests.
    pub fn deferred_updates<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.run_with_priority(TaskPriority::Normal, f)
    }

    /// Expire the discrete input lanes of every root touched by a discrete
    /// event and flush them synchronously.
    pub fn flush_discrete_updates(&mut self) -> ReconcileResult<()> {
        if self.execution_context.intersects(
            ExecutionContext::BATCHED | ExecutionContext::RENDER | ExecutionContext::COMMIT,
        ) {
            // already inside a batch; the outer flush will pick these up
            tracing::warn!("flush_discrete_updates called from inside another batch");
            return Ok(());
        }
        self.flush_pending_discrete_updates()
    }

    pub(crate) fn flush_pending_discrete_updates(&mut self) -> ReconcileResult<()> {
        if !self.roots_with_pending_discrete_updates.is_empty() {
            let roots: Vec<RootId> = self.roots_with_pending_discrete_updates.drain(..).collect();
            let now = self.scheduler.now();
            for root_id in roots {
                if self.roots.get(root_id.0).is_some() {
                    let root = &mut self.roots[root_id.0];
                    let discrete_pending = Lanes::INPUT_DISCRETE & root.pending_lanes;
                    root.mark_root_expired(discrete_pending);
                    self.ensure_root_is_scheduled(root_id, now);
                }
            }
        }
        self.flush_sync_callback_queue()
    }

    /// Force `lanes` on one root to render synchronously right now.
    pub fn flush_root(&mut self, root_id: RootId, lanes: Lanes) -> ReconcileResult<()> {
        let now = self.scheduler.now();
        self.root_mut(root_id).mark_root_expired(lanes);
        self.ensure_root_is_scheduled(root_id, now);
        self.flush_sync_callback_queue()
    }

    fn with_context_bit<T>(
        &mut self,
        bit: ExecutionContext,
        f: impl FnOnce(&mut Self) -> T,
    ) -> ReconcileResult<T> {
        let previous = self.execution_context;
        self.execution_context |= bit;
        let value = f(self);
        self.execution_context = previous;
        if self.execution_context.is_empty() {
            self.flush_sync_callback_queue()?;
        }
        Ok(value)
    }
}
