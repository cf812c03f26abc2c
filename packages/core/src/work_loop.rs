//! The cooperative work loop.
//!
//! One [`Reconciler`] instance owns one renderer's entire mutable state: the
//! fiber arena, the root registry, the execution-context word, and the
//! per-render scratch. A render is a restartable begin/complete walk
//! over the work-in-progress tree; concurrent renders yield between fibers
//! whenever the scheduler asks, sync renders run to completion. Thrown
//! values never unwind the Rust stack - `begin_work` reports suspensions and
//! errors as data and the loop routes them through the unwind path.

use std::rc::Rc;

use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use indexmap::IndexSet;
use rustc_hash::FxHashSet;
use slab::Slab;
use smallvec::SmallVec;

use crate::batching::ExecutionContext;
use crate::errors::{CapturedValue, ReconcileError, ReconcileResult};
use crate::fiber::{FiberId, FiberMode, Fibers, Flags, StateNode, WorkTag};
use crate::hooks::{BeginResult, RenderHooks};
use crate::host::{HostConfig, NO_TIMEOUT};
use crate::lanes::{self, Lanes, TOTAL_LANES};
use crate::root::{FiberRoot, RootCallback, RootId};
use crate::scheduler::{
    RootTask, TaskHandle, TaskKind, TaskPriority, TaskScheduler, TaskStatus, VirtualScheduler,
};
use crate::suspense::{SchedulerMsg, SuspenseConfig, Wakeable, WakeableKey};

/// Cascading sync commits allowed on one root before the loop is declared
/// runaway.
pub const NESTED_UPDATE_LIMIT: u32 = 50;
/// Cascading passive-effect rounds on one root before a warning is logged.
pub const NESTED_PASSIVE_UPDATE_LIMIT: u32 = 50;
/// Minimum spacing between consecutive fallback commits on one renderer.
pub const FALLBACK_THROTTLE_MS: u64 = 500;
/// Suspense timeout assumed when a transition config does not provide one.
pub const DEFAULT_SUSPENSE_TIMEOUT_MS: u64 = 5_000;

/// Where a render ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootExitStatus {
    /// Still walking (or yielded mid-walk).
    Incomplete,
    /// An error escaped past every boundary.
    FatalErrored,
    /// Something threw; a boundary captured it.
    Errored,
    /// Some subtree suspended and a fallback is ready.
    Suspended,
    /// Suspended, but the update opted into delaying the fallback.
    SuspendedWithDelay,
    Completed,
}

/// The reconciler: one instance per renderer.
///
/// Generic over the three consumed contracts - the external scheduler `S`,
/// the host adapter `H`, and the element→fiber layer `R`. All entry points
/// are methods; nothing here is thread-safe and nothing needs to be, the
/// whole pipeline is single-threaded and cooperative.
pub struct Reconciler<S: TaskScheduler, H: HostConfig, R: RenderHooks> {
    pub(crate) fibers: Fibers,
    pub(crate) roots: Slab<FiberRoot>,
    pub(crate) scheduler: S,
    pub(crate) host: H,
    pub(crate) hooks: R,

    pub(crate) execution_context: ExecutionContext,
    pub(crate) current_priority: TaskPriority,
    pub(crate) current_event_time: Option<u64>,
    pub(crate) current_event_wip_lanes: Lanes,
    pub(crate) current_event_pending_lanes: Lanes,
    pub(crate) pending_suspense_config: Option<SuspenseConfig>,

    // per-render scratch, reset by prepare_fresh_stack
    pub(crate) wip_root: Option<RootId>,
    pub(crate) wip: Option<FiberId>,
    pub(crate) wip_root_render_lanes: Lanes,
    pub(crate) subtree_render_lanes: Lanes,
    pub(crate) wip_root_included_lanes: Lanes,
    pub(crate) wip_root_exit_status: RootExitStatus,
    pub(crate) wip_root_fatal_error: Option<CapturedValue>,
    pub(crate) wip_root_latest_event_time: Option<u64>,
    pub(crate) wip_root_latest_suspense_timeout: Option<u64>,
    pub(crate) wip_root_can_suspend_using_config: Option<SuspenseConfig>,
    pub(crate) wip_root_skipped_lanes: Lanes,
    pub(crate) wip_root_updated_lanes: Lanes,
    pub(crate) wip_root_pinged_lanes: Lanes,
    pub(crate) wip_event_times: [u64; TOTAL_LANES],

    pub(crate) sync_callback_queue: std::collections::VecDeque<RootId>,
    pub(crate) is_flushing_sync_queue: bool,

    pub(crate) roots_with_pending_discrete_updates: IndexSet<RootId>,

    pub(crate) root_with_pending_passive_effects: Option<RootId>,
    pub(crate) pending_passive_effects_lanes: Lanes,
    pub(crate) pending_passive_effects_first: Option<FiberId>,
    pub(crate) passive_flush_scheduled: bool,
    pub(crate) pending_deleted_fibers: SmallVec<[FiberId; 8]>,

    pub(crate) global_most_recent_fallback_time: u64,
    pub(crate) legacy_error_boundaries_that_already_failed: FxHashSet<FiberId>,
    pub(crate) nested_update_count: u32,
    pub(crate) root_with_nested_updates: Option<RootId>,
    pub(crate) nested_passive_update_count: u32,
    pub(crate) root_with_nested_passive_updates: Option<RootId>,

    pub(crate) retry_cache: FxHashSet<WakeableKey>,
    pub(crate) next_retry_lane: Lanes,
    pub(crate) last_committed_lanes: Lanes,

    pub(crate) tx: UnboundedSender<SchedulerMsg>,
    pub(crate) rx: UnboundedReceiver<SchedulerMsg>,
}

impl<S: TaskScheduler, H: HostConfig, R: RenderHooks> Reconciler<S, H, R> {
    pub fn new(scheduler: S, host: H, hooks: R) -> Self {
        let (tx, rx) = futures_channel::mpsc::unbounded();
        Self {
            fibers: Fibers::new(),
            roots: Slab::new(),
            scheduler,
            host,
            hooks,
            execution_context: ExecutionContext::empty(),
            current_priority: TaskPriority::Normal,
            current_event_time: None,
            current_event_wip_lanes: Lanes::NONE,
            current_event_pending_lanes: Lanes::NONE,
            pending_suspense_config: None,
            wip_root: None,
            wip: None,
            wip_root_render_lanes: Lanes::NONE,
            subtree_render_lanes: Lanes::NONE,
            wip_root_included_lanes: Lanes::NONE,
            wip_root_exit_status: RootExitStatus::Incomplete,
            wip_root_fatal_error: None,
            wip_root_latest_event_time: None,
            wip_root_latest_suspense_timeout: None,
            wip_root_can_suspend_using_config: None,
            wip_root_skipped_lanes: Lanes::NONE,
            wip_root_updated_lanes: Lanes::NONE,
            wip_root_pinged_lanes: Lanes::NONE,
            wip_event_times: [0; TOTAL_LANES],
            sync_callback_queue: std::collections::VecDeque::new(),
            is_flushing_sync_queue: false,
            roots_with_pending_discrete_updates: IndexSet::new(),
            root_with_pending_passive_effects: None,
            pending_passive_effects_lanes: Lanes::NONE,
            pending_passive_effects_first: None,
            passive_flush_scheduled: false,
            pending_deleted_fibers: SmallVec::new(),
            global_most_recent_fallback_time: 0,
            legacy_error_boundaries_that_already_failed: FxHashSet::default(),
            nested_update_count: 0,
            root_with_nested_updates: None,
            nested_passive_update_count: 0,
            root_with_nested_passive_updates: None,
            retry_cache: FxHashSet::default(),
            next_retry_lane: Lanes::RETRY.highest(),
            last_committed_lanes: Lanes::NONE,
            tx,
            rx,
        }
    }

    pub fn fibers(&self) -> &Fibers {
        &self.fibers
    }

    pub fn fibers_mut(&mut self) -> &mut Fibers {
        &mut self.fibers
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn hooks(&self) -> &R {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut R {
        &mut self.hooks
    }

    /// Lanes committed by the most recent commit, for introspection.
    pub fn last_committed_lanes(&self) -> Lanes {
        self.last_committed_lanes
    }

    /// The fiber the next render step would process, if a render is paused.
    pub fn work_in_progress(&self) -> Option<FiberId> {
        self.wip
    }

    /// The root whose alternate tree is currently being built.
    pub fn work_in_progress_root(&self) -> Option<RootId> {
        self.wip_root
    }

    /// The lanes the in-flight render is working on.
    pub fn work_in_progress_lanes(&self) -> Lanes {
        self.wip_root_render_lanes
    }

    /// Register a new tree. The returned root owns one HostRoot fiber that
    /// hooks attach children to.
    pub fn create_root(&mut self, mode: FiberMode) -> RootId {
        let fiber = self.fibers.create_fiber(WorkTag::HostRoot, mode, None, None);
        let entry = self.roots.vacant_entry();
        let id = RootId(entry.key());
        entry.insert(FiberRoot::new(id, fiber));
        self.fibers[fiber].state_node = StateNode::Root(id);
        tracing::debug!(root = %id, ?mode, "created root");
        id
    }

    /// The root fiber of the committed tree.
    pub fn root_fiber(&self, root: RootId) -> FiberId {
        self.roots[root.0].current
    }

    /// Unregister a tree: its bound task and timer are cancelled and its
    /// fibers released. Pending updates for it become no-ops.
    pub fn drop_root(&mut self, root_id: RootId) {
        let Some(mut root) = self.roots.try_remove(root_id.0) else {
            return;
        };
        if let Some(callback) = root.callback_node.take() {
            match callback {
                RootCallback::Scheduler(handle) => self.scheduler.cancel(handle),
                RootCallback::SyncQueue => {
                    self.sync_callback_queue.retain(|queued| *queued != root_id)
                }
            }
        }
        if root.timeout_handle != NO_TIMEOUT {
            self.host.cancel_timeout(root.timeout_handle);
        }
        self.roots_with_pending_discrete_updates.shift_remove(&root_id);
        if self.root_with_pending_passive_effects == Some(root_id) {
            self.root_with_pending_passive_effects = None;
            self.pending_passive_effects_lanes = Lanes::NONE;
            self.pending_passive_effects_first = None;
        }
        if self.wip_root == Some(root_id) {
            self.wip_root = None;
            self.wip = None;
            self.wip_root_render_lanes = Lanes::NONE;
        }
        self.release_tree(root.current);
    }

    fn release_tree(&mut self, fiber: FiberId) {
        let (child, alternate) = {
            let f = &self.fibers[fiber];
            (f.child, f.alternate)
        };
        let mut child = child;
        while let Some(c) = child {
            let sibling = self.fibers[c].sibling;
            self.release_tree(c);
            child = sibling;
        }
        if let Some(alt) = alternate {
            self.fibers.release(alt);
        }
        self.fibers.release(fiber);
    }

    /// The event time shared by every update scheduled in the current host
    /// event. Inside render or commit there is no event, so the clock is
    /// read directly.
    pub fn request_event_time(&mut self) -> u64 {
        if self
            .execution_context
            .intersects(ExecutionContext::RENDER | ExecutionContext::COMMIT)
        {
            return self.scheduler.now();
        }
        match self.current_event_time {
            Some(time) => time,
            None => {
                let time = self.scheduler.now();
                self.current_event_time = Some(time);
                time
            }
        }
    }

    /// Choose the lane for an update on `fiber` given the current context:
    /// mode, transition config, scheduler priority, and which lanes this
    /// event has already rendered or left pending.
    pub fn request_update_lane(&mut self, fiber: FiberId) -> Lanes {
        let mode = self.fibers[fiber].mode;
        if self.current_event_wip_lanes.is_none() {
            self.current_event_wip_lanes = self.wip_root_render_lanes;
        }
        lanes::request_update_lane(
            mode,
            self.pending_suspense_config.as_ref(),
            self.current_priority,
            self.execution_context
                .contains(ExecutionContext::DISCRETE_EVENT),
            self.current_event_wip_lanes,
            self.current_event_pending_lanes,
        )
    }

    fn check_for_nested_updates(&mut self) -> ReconcileResult<()> {
        if self.nested_update_count > NESTED_UPDATE_LIMIT {
            self.nested_update_count = 0;
            self.root_with_nested_updates = None;
            return Err(ReconcileError::NestedUpdateOverflow);
        }
        Ok(())
    }

    /// Record an update on `fiber` at `lane` and make sure its root is bound
    /// to run. The single entry point every update funnels through.
    pub fn schedule_update_on_fiber(
        &mut self,
        fiber: FiberId,
        lane: Lanes,
        event_time: u64,
    ) -> ReconcileResult<Option<RootId>> {
        self.check_for_nested_updates()?;

        let Some(root_id) = self.fibers.mark_update_lane_from_fiber_to_root(fiber, lane) else {
            tracing::warn!(fiber = %fiber, "update scheduled on an unmounted fiber");
            return Ok(None);
        };

        {
            let config = self.pending_suspense_config;
            let root = &mut self.roots[root_id.0];
            root.mark_root_updated(lane, event_time);
            if let Some(config) = config {
                let lanes = match root.last_transition_config {
                    Some((existing, _)) => existing | lane,
                    None => lane,
                };
                root.last_transition_config = Some((lanes, config));
            }
        }

        if self.wip_root == Some(root_id) {
            // an update interleaved with the in-flight render
            self.wip_root_updated_lanes |= lane;
            if self.wip_root_exit_status == RootExitStatus::SuspendedWithDelay {
                // the delayed render is now stale; suspending its lanes makes
                // the binder restart from scratch on the next tick
                let render_lanes = self.wip_root_render_lanes;
                self.roots[root_id.0].mark_root_suspended(render_lanes);
            }
        }

        self.current_event_pending_lanes = self.roots[root_id.0].pending_lanes;

        tracing::trace!(fiber = %fiber, ?lane, root = %root_id, "update scheduled");

        if lane == Lanes::SYNC {
            if self
                .execution_context
                .contains(ExecutionContext::LEGACY_UNBATCHED)
                && !self
                    .execution_context
                    .intersects(ExecutionContext::RENDER | ExecutionContext::COMMIT)
            {
                // legacy mount inside unbatchedUpdates: render in this frame
                self.perform_sync_work_on_root(root_id)?;
            } else {
                self.ensure_root_is_scheduled(root_id, event_time);
                if self.execution_context.is_empty() {
                    self.flush_sync_callback_queue()?;
                }
            }
        } else {
            if self.current_priority == TaskPriority::UserBlocking
                && self
                    .execution_context
                    .contains(ExecutionContext::DISCRETE_EVENT)
            {
                self.roots_with_pending_discrete_updates.insert(root_id);
            }
            self.ensure_root_is_scheduled(root_id, event_time);
        }

        Ok(Some(root_id))
    }

    /// Entry for the embedder's task loop: run the task bound under
    /// `handle`. Stale handles are ignored.
    pub fn run_task(
        &mut self,
        handle: TaskHandle,
        task: RootTask,
        did_timeout: bool,
    ) -> ReconcileResult<TaskStatus> {
        self.process_messages()?;
        match task.kind {
            TaskKind::PassiveEffects => {
                self.passive_flush_scheduled = false;
                self.flush_passive_effects()?;
                Ok(TaskStatus::Complete)
            }
            TaskKind::RenderRoot => {
                if self.roots.get(task.root.0).is_none() {
                    return Ok(TaskStatus::Complete);
                }
                match self.roots[task.root.0].callback_node {
                    Some(RootCallback::Scheduler(bound)) if bound == handle => {}
                    // cancelled or rebound since: nothing to do
                    _ => return Ok(TaskStatus::Complete),
                }
                self.perform_concurrent_work_on_root(task.root, did_timeout)
            }
        }
    }

    /// Concurrent entry: render the root's next lanes, yielding to the
    /// scheduler between fibers.
    pub fn perform_concurrent_work_on_root(
        &mut self,
        root_id: RootId,
        did_timeout: bool,
    ) -> ReconcileResult<TaskStatus> {
        // we're leaving the event the updates arrived in
        self.current_event_time = None;
        self.current_event_wip_lanes = Lanes::NONE;
        self.current_event_pending_lanes = Lanes::NONE;

        let original_callback = self.roots[root_id.0].callback_node;

        // passive effects may schedule higher-priority work that re-binds us
        self.flush_passive_effects()?;
        if self.roots.get(root_id.0).map(|r| r.callback_node) != Some(original_callback) {
            return Ok(TaskStatus::Complete);
        }

        let now = self.scheduler.now();
        self.roots[root_id.0].mark_starved_lanes_as_expired(now);

        let wip_lanes = if self.wip_root == Some(root_id) {
            self.wip_root_render_lanes
        } else {
            Lanes::NONE
        };
        let mut lanes = self.roots[root_id.0].next_lanes(wip_lanes);
        if lanes.is_none() {
            self.ensure_root_is_scheduled(root_id, now);
            return Ok(TaskStatus::Complete);
        }

        if did_timeout {
            // the scheduler starved us; finish without further yielding
            self.roots[root_id.0].mark_root_expired(lanes);
        }
        let render_sync = did_timeout || lanes.intersects(self.roots[root_id.0].expired_lanes);

        let mut exit_status = if render_sync {
            self.render_root_sync(root_id, lanes)
        } else {
            self.render_root_concurrent(root_id, lanes)
        };

        if exit_status == RootExitStatus::Incomplete {
            // yielded; the binder keeps the current task for the remainder
            self.ensure_root_is_scheduled(root_id, now);
            return if self.roots[root_id.0].callback_node == original_callback {
                Ok(TaskStatus::Yielded)
            } else {
                Ok(TaskStatus::Complete)
            };
        }

        if self
            .wip_root_included_lanes
            .intersects(self.wip_root_updated_lanes)
        {
            // an update landed on a lane we were rendering; the tree is
            // inconsistent, throw it away and start over next tick
            self.prepare_fresh_stack(root_id, Lanes::NONE);
            self.ensure_root_is_scheduled(root_id, now);
            return Ok(TaskStatus::Complete);
        }

        if exit_status == RootExitStatus::Errored {
            let retry_lanes = self.lanes_to_retry_synchronously_on_error(root_id);
            if retry_lanes.is_some() {
                lanes = retry_lanes;
                exit_status = self.render_root_sync(root_id, retry_lanes);
            }
        }

        if exit_status == RootExitStatus::FatalErrored {
            let fatal = self.take_fatal_error(root_id, lanes);
            return Err(ReconcileError::FatalRender { value: fatal });
        }

        let current = self.roots[root_id.0].current;
        let finished = self.fibers[current]
            .alternate
            .expect("completed render leaves a work-in-progress tree");
        self.roots[root_id.0].finished_work = Some(finished);
        self.roots[root_id.0].finished_lanes = lanes;
        self.finish_concurrent_render(root_id, lanes, exit_status)?;

        self.ensure_root_is_scheduled(root_id, self.scheduler.now());
        Ok(TaskStatus::Complete)
    }

    /// Sync entry: render and commit in one go, no yielding.
    pub fn perform_sync_work_on_root(&mut self, root_id: RootId) -> ReconcileResult<()> {
        assert!(
            !self
                .execution_context
                .intersects(ExecutionContext::RENDER | ExecutionContext::COMMIT),
            "sync work must not re-enter render or commit"
        );
        if self.roots.get(root_id.0).is_none() {
            return Ok(());
        }

        self.flush_passive_effects()?;

        let now = self.scheduler.now();
        self.current_event_time = None;
        self.current_event_wip_lanes = Lanes::NONE;
        self.current_event_pending_lanes = Lanes::NONE;

        let wip_lanes = if self.wip_root == Some(root_id) {
            self.wip_root_render_lanes
        } else {
            Lanes::NONE
        };
        let mut lanes = self.roots[root_id.0].next_lanes(wip_lanes);
        if lanes.is_none() {
            self.ensure_root_is_scheduled(root_id, now);
            return Ok(());
        }

        let mut exit_status = self.render_root_sync(root_id, lanes);

        if exit_status == RootExitStatus::Errored {
            let retry_lanes = self.lanes_to_retry_synchronously_on_error(root_id);
            if retry_lanes.is_some() {
                lanes = retry_lanes;
                exit_status = self.render_root_sync(root_id, retry_lanes);
            }
        }

        if exit_status == RootExitStatus::FatalErrored {
            let fatal = self.take_fatal_error(root_id, lanes);
            return Err(ReconcileError::FatalRender { value: fatal });
        }

        // sync renders cannot yield; whatever state they ended in commits now
        let current = self.roots[root_id.0].current;
        let finished = self.fibers[current]
            .alternate
            .expect("completed render leaves a work-in-progress tree");
        self.roots[root_id.0].finished_work = Some(finished);
        self.roots[root_id.0].finished_lanes = lanes;
        self.commit_root(root_id)?;

        self.ensure_root_is_scheduled(root_id, self.scheduler.now());
        Ok(())
    }

    fn take_fatal_error(&mut self, root_id: RootId, lanes: Lanes) -> CapturedValue {
        let fatal = self
            .wip_root_fatal_error
            .take()
            .unwrap_or_else(|| CapturedValue::from_message("render unwound to the root"));
        self.prepare_fresh_stack(root_id, Lanes::NONE);
        self.roots[root_id.0].mark_root_suspended(lanes);
        self.ensure_root_is_scheduled(root_id, self.scheduler.now());
        tracing::error!(root = %root_id, ?fatal, "fatal render error");
        fatal
    }

    fn lanes_to_retry_synchronously_on_error(&self, root_id: RootId) -> Lanes {
        let pending = self.roots[root_id.0].pending_lanes;
        let everything_but_offscreen = pending.without(Lanes::OFFSCREEN);
        if everything_but_offscreen.is_some() {
            everything_but_offscreen
        } else if pending.intersects(Lanes::OFFSCREEN) {
            Lanes::OFFSCREEN
        } else {
            Lanes::NONE
        }
    }

    /// Reset every piece of per-render scratch and build a fresh
    /// work-in-progress root fiber. Cancels a pending delayed commit, since
    /// whatever the timer would have committed is about to be replaced.
    pub(crate) fn prepare_fresh_stack(&mut self, root_id: RootId, lanes: Lanes) {
        {
            let root = &mut self.roots[root_id.0];
            root.finished_work = None;
            root.finished_lanes = Lanes::NONE;
            let timeout = root.timeout_handle;
            if timeout != NO_TIMEOUT {
                root.timeout_handle = NO_TIMEOUT;
                self.host.cancel_timeout(timeout);
            }
        }

        if let Some(interrupted) = self.wip {
            // pop the side stacks of everything above the abandoned fiber
            let mut node = self.fibers[interrupted].return_fiber;
            while let Some(fiber) = node {
                self.hooks.unwind_interrupted_work(&mut self.fibers, fiber);
                node = self.fibers[fiber].return_fiber;
            }
        }

        self.wip_root = Some(root_id);
        let current = self.roots[root_id.0].current;
        let wip = self.fibers.create_work_in_progress(current, None);
        self.wip = Some(wip);
        self.wip_root_render_lanes = lanes;
        self.subtree_render_lanes = lanes;
        self.wip_root_included_lanes = lanes;
        self.wip_root_exit_status = RootExitStatus::Incomplete;
        self.wip_root_fatal_error = None;
        self.wip_root_latest_event_time = None;
        self.wip_root_latest_suspense_timeout = None;
        self.wip_root_skipped_lanes = Lanes::NONE;
        self.wip_root_updated_lanes = Lanes::NONE;
        self.wip_root_pinged_lanes = Lanes::NONE;
        self.wip_event_times = self.roots[root_id.0].event_times;
        self.wip_root_can_suspend_using_config =
            match self.roots[root_id.0].last_transition_config {
                Some((config_lanes, config)) if lanes.intersects(config_lanes) => Some(config),
                _ => None,
            };

        tracing::trace!(root = %root_id, ?lanes, "fresh stack");
    }

    fn render_root_sync(&mut self, root_id: RootId, lanes: Lanes) -> RootExitStatus {
        let previous_context = self.execution_context;
        self.execution_context |= ExecutionContext::RENDER;

        if self.wip_root != Some(root_id) || self.wip_root_render_lanes != lanes {
            self.prepare_fresh_stack(root_id, lanes);
        }

        while let Some(unit) = self.wip {
            self.perform_unit_of_work(unit);
        }

        self.execution_context = previous_context;
        // the walk finished; the root is no longer in progress (the scratch
        // fields stay readable for the finish decision)
        self.wip_root = None;
        self.wip_root_render_lanes = Lanes::NONE;
        self.wip_root_exit_status
    }

    fn render_root_concurrent(&mut self, root_id: RootId, lanes: Lanes) -> RootExitStatus {
        let previous_context = self.execution_context;
        self.execution_context |= ExecutionContext::RENDER;

        if self.wip_root != Some(root_id) || self.wip_root_render_lanes != lanes {
            self.prepare_fresh_stack(root_id, lanes);
        }

        while let Some(unit) = self.wip {
            if self.scheduler.should_yield() {
                break;
            }
            self.perform_unit_of_work(unit);
        }

        self.execution_context = previous_context;
        if self.wip.is_some() {
            RootExitStatus::Incomplete
        } else {
            self.wip_root = None;
            self.wip_root_render_lanes = Lanes::NONE;
            self.wip_root_exit_status
        }
    }

    /// One begin step. Completion (and unwinding) happens inline when the
    /// fiber has no more children to descend into.
    fn perform_unit_of_work(&mut self, unit: FiberId) {
        let current = self.fibers[unit].alternate;
        let render_lanes = self.subtree_render_lanes;

        // track which processed updates this render includes, for the
        // throttle and JND decisions later on; retries carry no updates
        let update_lanes = self.fibers[unit].lanes & render_lanes & !Lanes::RETRY;
        if update_lanes.is_some() {
            let newest = update_lanes
                .each_lane()
                .map(|lane| self.wip_event_times[lane.index()])
                .max()
                .unwrap_or(0);
            if newest > 0 {
                self.wip_root_latest_event_time = Some(
                    self.wip_root_latest_event_time
                        .map_or(newest, |existing| existing.max(newest)),
                );
            }
        }
        self.wip_root_skipped_lanes |= self.fibers[unit].lanes.without(render_lanes);

        let result = self
            .hooks
            .begin_work(&mut self.fibers, current, unit, render_lanes);

        let pending = self.fibers[unit].pending_props.clone();
        self.fibers[unit].memoized_props = pending;

        match result {
            BeginResult::ContinueWith(next) => {
                self.wip = Some(next);
            }
            BeginResult::Done => {
                self.complete_unit_of_work(unit);
            }
            BeginResult::Suspend(wakeable) => {
                self.throw_suspension(unit, wakeable);
                self.complete_unit_of_work(unit);
            }
            BeginResult::Error(value) => {
                self.throw_error(unit, value);
                self.complete_unit_of_work(unit);
            }
        }
    }

    /// Complete fibers upward until a sibling offers more begin work, a
    /// boundary captures an unwind, or the root is reached.
    fn complete_unit_of_work(&mut self, unit: FiberId) {
        let mut completed = unit;
        loop {
            let current = self.fibers[completed].alternate;
            let return_fiber = self.fibers[completed].return_fiber;

            if !self.fibers[completed].is_incomplete() {
                let next = self.hooks.complete_work(
                    &mut self.fibers,
                    current,
                    completed,
                    self.subtree_render_lanes,
                );
                self.fibers.bubble_child_lanes(completed);

                if let Some(next) = next {
                    self.wip = Some(next);
                    return;
                }

                if let Some(parent) = return_fiber {
                    if !self.fibers[parent].is_incomplete() {
                        self.append_effects_to_parent(parent, completed);
                    }
                }
            } else {
                let next =
                    self.hooks
                        .unwind_work(&mut self.fibers, completed, self.subtree_render_lanes);

                if let Some(next) = next {
                    // a boundary captured; strip everything but host effects
                    // and resume rendering from it
                    let masked = self.fibers[next].flags & Flags::HOST_EFFECT_MASK;
                    self.fibers[next].flags = masked;
                    self.wip = Some(next);
                    return;
                }

                if let Some(parent) = return_fiber {
                    let parent_fiber = &mut self.fibers[parent];
                    parent_fiber.first_effect = None;
                    parent_fiber.last_effect = None;
                    parent_fiber.flags |= Flags::INCOMPLETE;
                }
            }

            if let Some(sibling) = self.fibers[completed].sibling {
                self.wip = Some(sibling);
                return;
            }

            match return_fiber {
                Some(parent) => {
                    completed = parent;
                    self.wip = Some(parent);
                }
                None => break,
            }
        }

        // reached the root
        self.wip = None;
        if self.fibers[completed].is_incomplete() {
            if self.wip_root_exit_status != RootExitStatus::FatalErrored {
                self.wip_root_exit_status = RootExitStatus::FatalErrored;
            }
        } else if self.wip_root_exit_status == RootExitStatus::Incomplete {
            self.wip_root_exit_status = RootExitStatus::Completed;
        }
    }

    /// Splice `completed`'s subtree effect list onto `parent`, then append
    /// `completed` itself if it carries effects. Keeps the effect list in
    /// DFS-completion order with each fiber visited exactly once.
    fn append_effects_to_parent(&mut self, parent: FiberId, completed: FiberId) {
        let (child_first, child_last) = {
            let f = &self.fibers[completed];
            (f.first_effect, f.last_effect)
        };

        if child_first.is_some() {
            if self.fibers[parent].first_effect.is_none() {
                self.fibers[parent].first_effect = child_first;
            }
            if let Some(parent_last) = self.fibers[parent].last_effect {
                self.fibers[parent_last].next_effect = child_first;
            }
            self.fibers[parent].last_effect = child_last;
        }

        if self.fibers[completed].has_commit_effects() {
            match self.fibers[parent].last_effect {
                Some(parent_last) => {
                    self.fibers[parent_last].next_effect = Some(completed);
                }
                None => {
                    self.fibers[parent].first_effect = Some(completed);
                }
            }
            self.fibers[parent].last_effect = Some(completed);
        }
    }

    /// A fiber reported a pending wakeable: mark the render suspended, flag
    /// the nearest suspense boundary to capture, and subscribe for the ping.
    fn throw_suspension(&mut self, source: FiberId, wakeable: Rc<dyn Wakeable>) {
        let root_id = self
            .wip_root
            .expect("suspensions only happen inside a render");

        {
            let fiber = &mut self.fibers[source];
            fiber.flags |= Flags::INCOMPLETE;
            fiber.first_effect = None;
            fiber.last_effect = None;
        }

        if let Some(config) = self.wip_root_can_suspend_using_config {
            // the update opted into delaying the fallback
            if matches!(
                self.wip_root_exit_status,
                RootExitStatus::Incomplete | RootExitStatus::Suspended
            ) {
                self.wip_root_exit_status = RootExitStatus::SuspendedWithDelay;
            }
            let base = self
                .wip_root_latest_event_time
                .unwrap_or_else(|| self.scheduler.now());
            let timeout = if config.timeout_ms > 0 {
                config.timeout_ms
            } else {
                DEFAULT_SUSPENSE_TIMEOUT_MS
            };
            let deadline = base + timeout;
            self.wip_root_latest_suspense_timeout = Some(
                self.wip_root_latest_suspense_timeout
                    .map_or(deadline, |existing| existing.max(deadline)),
            );
        } else if self.wip_root_exit_status == RootExitStatus::Incomplete {
            self.wip_root_exit_status = RootExitStatus::Suspended;
        }

        // flag the nearest enclosing suspense boundary; unwinding stops
        // there. The root acts as an implicit boundary when none exists, so
        // a bare tree degrades to a root-level fallback instead of a fatal.
        let mut node = self.fibers[source].return_fiber;
        let mut topmost = source;
        loop {
            match node {
                Some(fiber) if self.fibers[fiber].tag == WorkTag::SuspenseBoundary => {
                    self.fibers[fiber].flags |= Flags::SHOULD_CAPTURE;
                    break;
                }
                Some(fiber) => {
                    topmost = fiber;
                    node = self.fibers[fiber].return_fiber;
                }
                None => {
                    self.fibers[topmost].flags |= Flags::SHOULD_CAPTURE;
                    break;
                }
            }
        }

        let render_lanes = self.wip_root_render_lanes;
        self.attach_ping_listener(root_id, &wakeable, render_lanes);

        tracing::debug!(fiber = %source, root = %root_id, "render suspended");
    }

    /// A fiber's render failed: let the hooks attach the error to the
    /// nearest boundary, then unwind. A failure while handling the failure
    /// is fatal.
    fn throw_error(&mut self, source: FiberId, value: CapturedValue) {
        let root_id = self.wip_root.expect("errors only happen inside a render");

        if self.wip_root_exit_status != RootExitStatus::FatalErrored {
            self.wip_root_exit_status = RootExitStatus::Errored;
        }

        {
            let fiber = &mut self.fibers[source];
            fiber.flags |= Flags::INCOMPLETE;
            fiber.first_effect = None;
            fiber.last_effect = None;
        }

        let return_fiber = self.fibers[source].return_fiber;
        let render_lanes = self.wip_root_render_lanes;
        let value = value.with_source(source);

        tracing::debug!(fiber = %source, root = %root_id, ?value, "render threw");

        if let Err(fatal) = self.hooks.throw_exception(
            &mut self.fibers,
            root_id,
            return_fiber,
            source,
            value,
            render_lanes,
        ) {
            self.wip_root_exit_status = RootExitStatus::FatalErrored;
            self.wip_root_fatal_error = Some(fatal);
        }
    }

    /// Decide what to do with a finished concurrent render: commit now,
    /// commit on a timer, or park the lanes as suspended.
    fn finish_concurrent_render(
        &mut self,
        root_id: RootId,
        lanes: Lanes,
        exit_status: RootExitStatus,
    ) -> ReconcileResult<()> {
        match exit_status {
            RootExitStatus::Incomplete | RootExitStatus::FatalErrored => {
                unreachable!("handled by the caller")
            }
            // the error was captured on the second, synchronous attempt
            RootExitStatus::Errored => self.commit_root(root_id),
            RootExitStatus::Completed => {
                if let Some(config) = self.wip_root_can_suspend_using_config {
                    // a busy transition may prefer holding a finished tree
                    // briefly over flashing its busy indicator
                    if config.busy_min_duration_ms > 0 {
                        if let Some(event_time) = self.wip_root_latest_event_time {
                            let now = self.scheduler.now();
                            let elapsed = now.saturating_sub(event_time);
                            let ms_until_timeout = if elapsed <= config.busy_delay_ms {
                                0
                            } else {
                                (config.busy_delay_ms + config.busy_min_duration_ms)
                                    .saturating_sub(elapsed)
                            };
                            if ms_until_timeout > 10 {
                                self.mark_root_suspended_from_render(root_id, lanes);
                                self.schedule_delayed_commit(root_id, ms_until_timeout);
                                return Ok(());
                            }
                        }
                    }
                }
                self.commit_root(root_id)
            }
            RootExitStatus::Suspended => {
                self.mark_root_suspended_from_render(root_id, lanes);

                if self.roots[root_id.0].next_lanes(Lanes::NONE).is_some() {
                    // lower-priority work (or a ping) is waiting; render that
                    // instead of committing this fallback
                    return Ok(());
                }

                if self.wip_root_latest_event_time.is_none() {
                    // a retry that still isn't ready: avoid flashing
                    // fallbacks in quick succession
                    let now = self.scheduler.now();
                    let ms_until_timeout = (self.global_most_recent_fallback_time
                        + FALLBACK_THROTTLE_MS)
                        .saturating_sub(now);
                    if ms_until_timeout > 10 {
                        self.schedule_delayed_commit(root_id, ms_until_timeout);
                        return Ok(());
                    }
                }
                self.commit_root(root_id)
            }
            RootExitStatus::SuspendedWithDelay => {
                self.mark_root_suspended_from_render(root_id, lanes);

                if self.roots[root_id.0].next_lanes(Lanes::NONE).is_some() {
                    return Ok(());
                }

                let now = self.scheduler.now();
                let ms_until_timeout = if let Some(deadline) = self.wip_root_latest_suspense_timeout
                {
                    deadline.saturating_sub(now)
                } else if let Some(event_time) = self.wip_root_latest_event_time {
                    let elapsed = now.saturating_sub(event_time);
                    jnd(elapsed).saturating_sub(elapsed)
                } else {
                    0
                };
                if ms_until_timeout > 10 {
                    self.schedule_delayed_commit(root_id, ms_until_timeout);
                    return Ok(());
                }
                self.commit_root(root_id)
            }
        }
    }

    fn mark_root_suspended_from_render(&mut self, root_id: RootId, lanes: Lanes) {
        // lanes that were pinged or updated during the render stay eligible
        let suspended = lanes
            .without(self.wip_root_pinged_lanes)
            .without(self.wip_root_updated_lanes);
        self.roots[root_id.0].mark_root_suspended(suspended);
    }

    fn schedule_delayed_commit(&mut self, root_id: RootId, ms: u64) {
        let handle = self.host.schedule_timeout(ms);
        self.roots[root_id.0].timeout_handle = handle;
        tracing::debug!(root = %root_id, ms, "commit deferred");
    }

    /// Host-timer callback: commit the tree a delayed commit was holding.
    pub fn flush_delayed_commit(&mut self, root_id: RootId) -> ReconcileResult<()> {
        if self.roots.get(root_id.0).is_none() {
            return Ok(());
        }
        self.roots[root_id.0].timeout_handle = NO_TIMEOUT;
        if self.roots[root_id.0].finished_work.is_some() {
            self.commit_root(root_id)?;
            let now = self.scheduler.now();
            self.ensure_root_is_scheduled(root_id, now);
        }
        Ok(())
    }

    /// Drain ping/retry notifications posted by settled wakeables.
    pub fn process_messages(&mut self) -> ReconcileResult<()> {
        while let Ok(Some(msg)) = self.rx.try_next() {
            self.handle_scheduler_msg(msg)?;
        }
        Ok(())
    }

    fn handle_scheduler_msg(&mut self, msg: SchedulerMsg) -> ReconcileResult<()> {
        match msg {
            SchedulerMsg::Pinged { root, lanes, key } => {
                self.ping_suspended_root(root, key, lanes);
                Ok(())
            }
            SchedulerMsg::Retried { boundary, key } => self.resolve_retry_wakeable(boundary, key),
        }
    }

    /// Whether any root has runnable work (or effects) waiting.
    pub fn has_pending_work(&self) -> bool {
        if !self.sync_callback_queue.is_empty() || self.root_with_pending_passive_effects.is_some()
        {
            return true;
        }
        self.roots.iter().any(|(id, root)| {
            let wip_lanes = if self.wip_root == Some(RootId(id)) {
                self.wip_root_render_lanes
            } else {
                Lanes::NONE
            };
            root.next_lanes(wip_lanes).is_some()
        })
    }

    /// Park until a wakeable settles or runnable work exists. Cancel-safe;
    /// the embedder-facing idle surface for event loops built on futures.
    pub async fn wait_for_work(&mut self) {
        loop {
            // drain anything already queued before deciding to sleep
            let mut progressed = false;
            while let Ok(Some(msg)) = self.rx.try_next() {
                if let Err(err) = self.handle_scheduler_msg(msg) {
                    tracing::error!(?err, "error while handling wakeup");
                }
                progressed = true;
            }
            if progressed || self.has_pending_work() {
                return;
            }
            let msg = self.rx.next().await;
            match msg {
                Some(msg) => {
                    if let Err(err) = self.handle_scheduler_msg(msg) {
                        tracing::error!(?err, "error while handling wakeup");
                    }
                    return;
                }
                // the reconciler owns a sender, so this is unreachable in
                // practice; treat a closed channel as "nothing to wait for"
                None => return,
            }
        }
    }
}

/// The just-noticeable-difference staircase: suspensions shorter than the
/// current step are extended to it so spinners don't flash.
pub(crate) fn jnd(time_elapsed_ms: u64) -> u64 {
    if time_elapsed_ms < 120 {
        120
    } else if time_elapsed_ms < 480 {
        480
    } else if time_elapsed_ms < 1080 {
        1080
    } else if time_elapsed_ms < 1920 {
        1920
    } else if time_elapsed_ms < 3000 {
        3000
    } else if time_elapsed_ms < 4320 {
        4320
    } else {
        time_elapsed_ms.div_ceil(1960) * 1960
    }
}

impl<H: HostConfig, R: RenderHooks> Reconciler<VirtualScheduler, H, R> {
    /// Advance the virtual clock.
    pub fn advance_time(&mut self, ms: u64) {
        self.scheduler.advance_time(ms);
    }

    /// Run exactly one bound task (after draining messages and the sync
    /// queue). Returns whether anything ran.
    pub fn tick(&mut self) -> ReconcileResult<bool> {
        self.process_messages()?;
        self.flush_sync_callback_queue()?;
        let Some((handle, task, timed_out)) = self.scheduler.take_next() else {
            return Ok(false);
        };
        let priority = match task.kind {
            TaskKind::RenderRoot => self
                .try_root(task.root)
                .map(|root| root.callback_priority)
                .unwrap_or(TaskPriority::Normal),
            TaskKind::PassiveEffects => TaskPriority::Normal,
        };
        match self.run_task(handle, task, timed_out)? {
            TaskStatus::Yielded => self.scheduler.requeue(handle, priority, task),
            TaskStatus::Complete => {}
        }
        Ok(true)
    }

    /// Run until no task, sync callback, or message remains. Disarm any
    /// scripted yield first or a perpetually-yielding render never drains.
    pub fn flush_scheduled_work(&mut self) -> ReconcileResult<()> {
        while self.tick()? {}
        self.flush_sync_callback_queue()
    }
}
