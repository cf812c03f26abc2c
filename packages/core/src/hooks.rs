//! The render-hooks contract: the element→fiber layer the work loop drives.
//!
//! Component semantics (hook evaluation, class lifecycles, context, what a
//! suspense boundary renders) live entirely behind this trait. The work loop
//! only walks, completes, unwinds, and commits what the hooks produce.
//!
//! Suspension is a return value, not an exception: `begin_work` reports
//! [`BeginResult::Suspend`] with the pending wakeable instead of throwing it,
//! and the loop takes over from there.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::errors::CapturedValue;
use crate::fiber::{FiberId, Fibers};
use crate::lanes::Lanes;
use crate::root::RootId;
use crate::suspense::Wakeable;

/// Outcome of one `begin_work` step.
pub enum BeginResult {
    /// The fiber produced no children with work; complete it.
    Done,
    /// Descend into this child next.
    ContinueWith(FiberId),
    /// The fiber needs an async resource that is still pending.
    Suspend(Rc<dyn Wakeable>),
    /// The fiber's render failed.
    Error(CapturedValue),
}

pub type HookResult = Result<(), CapturedValue>;

/// Side requests produced while committing one effect.
///
/// Commit-phase hooks cannot call back into the reconciler (it is mid-walk
/// over the effect list), so scheduling requests are queued here and drained
/// by the pipeline after each guarded call: updates go through
/// `schedule_update_on_fiber`, retries through the retry-wakeable cache.
#[derive(Default)]
pub struct CommitSink {
    pub(crate) updates: SmallVec<[(FiberId, Lanes); 4]>,
    pub(crate) retries: SmallVec<[(FiberId, Rc<dyn Wakeable>); 2]>,
}

impl CommitSink {
    /// Request an update on `fiber` at `lane` once this effect's guarded
    /// call returns. `Lanes::NONE` lets the reconciler pick the lane.
    pub fn schedule_update(&mut self, fiber: FiberId, lane: Lanes) {
        self.updates.push((fiber, lane));
    }

    /// Subscribe `boundary` for a retry when `wakeable` settles (suspense
    /// fallbacks committed this pass register their pending resources here).
    pub fn attach_retry(&mut self, boundary: FiberId, wakeable: Rc<dyn Wakeable>) {
        self.retries.push((boundary, wakeable));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.retries.is_empty()
    }
}

/// The element→fiber reconciliation layer.
///
/// Render-phase methods get `&mut Fibers` and build/diff children directly in
/// the arena; the work loop owns traversal order, lane bookkeeping, and the
/// effect list. Commit-phase methods are per-effect guarded calls: an `Err`
/// is captured and attributed, never propagated past the pipeline.
pub trait RenderHooks {
    /// Diff `wip` against `current`, producing its next child (if any).
    fn begin_work(
        &mut self,
        fibers: &mut Fibers,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> BeginResult;

    /// Finish `wip` (create/update its host payload, bubble information up).
    /// Returning a fiber resumes the begin phase there.
    fn complete_work(
        &mut self,
        fibers: &mut Fibers,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId>;

    /// Unwind an incomplete fiber. Returning a fiber means a boundary below
    /// captured the in-flight throw and rendering continues from it.
    fn unwind_work(
        &mut self,
        fibers: &mut Fibers,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId>;

    /// Pop any context the fiber pushed; called top-down when a render is
    /// abandoned mid-tree.
    fn unwind_interrupted_work(&mut self, fibers: &mut Fibers, wip: FiberId);

    /// Attach a render error to the nearest boundary above `source` (or the
    /// root) as a Sync-lane update. Failing here escalates the render to a
    /// fatal error.
    fn throw_exception(
        &mut self,
        fibers: &mut Fibers,
        root: RootId,
        return_fiber: Option<FiberId>,
        source: FiberId,
        value: CapturedValue,
        render_lanes: Lanes,
    ) -> HookResult;

    /// Whether this class fiber is currently able to capture errors.
    fn can_capture_error(&self, fibers: &Fibers, fiber: FiberId) -> bool;

    /// Enqueue an error update on `boundary` (a capturing class fiber or the
    /// host root); the reconciler schedules the Sync-lane render that picks
    /// it up. Used for commit-phase errors, where there is no unwind.
    fn capture_error(
        &mut self,
        fibers: &mut Fibers,
        boundary: FiberId,
        error: CapturedValue,
    ) -> HookResult;

    // commit-phase hooks, one guarded call per effect

    fn commit_snapshot(
        &mut self,
        fibers: &Fibers,
        fiber: FiberId,
        sink: &mut CommitSink,
    ) -> HookResult;

    fn commit_layout_effects(
        &mut self,
        fibers: &mut Fibers,
        fiber: FiberId,
        sink: &mut CommitSink,
    ) -> HookResult;

    fn commit_attach_ref(
        &mut self,
        fibers: &Fibers,
        fiber: FiberId,
        sink: &mut CommitSink,
    ) -> HookResult;

    fn commit_detach_ref(
        &mut self,
        fibers: &Fibers,
        fiber: FiberId,
        sink: &mut CommitSink,
    ) -> HookResult;

    fn commit_passive_unmount(
        &mut self,
        fibers: &mut Fibers,
        fiber: FiberId,
        sink: &mut CommitSink,
    ) -> HookResult;

    fn commit_passive_mount(
        &mut self,
        fibers: &mut Fibers,
        fiber: FiberId,
        sink: &mut CommitSink,
    ) -> HookResult;
}
