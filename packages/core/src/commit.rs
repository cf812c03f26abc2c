//! The commit pipeline: before-mutation, mutation, and layout phases, plus
//! the deferred passive-effects flush.
//!
//! Commit never yields. Every per-effect sub-step runs through a guarded
//! call: a failure is attributed to that effect's fiber, routed to the
//! nearest class boundary above it (or the root) as a Sync-lane error
//! update, and the pipeline moves on to the next effect.

use crate::batching::ExecutionContext;
use crate::errors::{CapturedValue, ReconcileResult};
use crate::fiber::{FiberId, Flags, WorkTag};
use crate::hooks::{CommitSink, RenderHooks};
use crate::host::HostConfig;
use crate::lanes::Lanes;
use crate::root::RootId;
use crate::scheduler::{RootTask, TaskKind, TaskPriority, TaskScheduler};
use crate::work_loop::{Reconciler, NESTED_PASSIVE_UPDATE_LIMIT};

impl<S: TaskScheduler, H: HostConfig, R: RenderHooks> Reconciler<S, H, R> {
    /// Install the root's finished tree: apply its effects to the host in
    /// three ordered phases and swap the buffers. Runs at Immediate
    /// priority so nothing interleaves with the mutation window.
    pub fn commit_root(&mut self, root_id: RootId) -> ReconcileResult<()> {
        let previous_priority = self.current_priority;
        self.current_priority = TaskPriority::Immediate;
        let result = self.commit_root_impl(root_id);
        self.current_priority = previous_priority;
        result
    }

    fn commit_root_impl(&mut self, root_id: RootId) -> ReconcileResult<()> {
        // effects of the previous commit must run before the next mutation
        while self.root_with_pending_passive_effects.is_some() {
            self.flush_passive_effects_impl()?;
        }

        assert!(
            !self
                .execution_context
                .intersects(ExecutionContext::RENDER | ExecutionContext::COMMIT),
            "commit must not re-enter render or commit"
        );

        let (finished, lanes) = {
            let root = &mut self.roots[root_id.0];
            let finished = root.finished_work.take();
            let lanes = root.finished_lanes;
            root.finished_lanes = Lanes::NONE;
            (finished, lanes)
        };
        let Some(finished) = finished else {
            return Ok(());
        };

        {
            let root = &mut self.roots[root_id.0];
            root.callback_node = None;
            root.callback_id = Lanes::NONE;
            root.callback_is_sync = false;
        }

        let remaining = {
            let fiber = &self.fibers[finished];
            fiber.lanes | fiber.child_lanes
        };
        self.roots[root_id.0].mark_root_finished(remaining);
        if let Some((config_lanes, config)) = self.roots[root_id.0].last_transition_config {
            let still_pending = config_lanes & remaining;
            self.roots[root_id.0].last_transition_config =
                still_pending.is_some().then_some((still_pending, config));
        }

        if self.wip_root == Some(root_id) {
            self.wip_root = None;
            self.wip = None;
            self.wip_root_render_lanes = Lanes::NONE;
        }

        // the finished root fiber joins its own effect list when it carries
        // effects of its own (a Snapshot or Callback on the root)
        let first_effect = if self.fibers[finished].has_commit_effects() {
            match self.fibers[finished].last_effect {
                Some(last) => {
                    self.fibers[last].next_effect = Some(finished);
                    self.fibers[finished].first_effect
                }
                None => Some(finished),
            }
        } else {
            self.fibers[finished].first_effect
        };

        if let Some(first) = first_effect {
            let previous_context = self.execution_context;
            self.execution_context |= ExecutionContext::COMMIT;
            let phases = self.run_commit_phases(root_id, finished, first);
            self.execution_context = previous_context;
            let root_has_passive_effects = phases?;

            if root_has_passive_effects {
                // keep the effect list (and any deleted fibers) alive until
                // the passive flush has walked it
                self.root_with_pending_passive_effects = Some(root_id);
                self.pending_passive_effects_lanes = lanes;
                self.pending_passive_effects_first = Some(first);
            } else {
                self.teardown_effect_list(Some(first));
            }
        } else {
            self.roots[root_id.0].current = finished;
        }

        self.last_committed_lanes = lanes;
        tracing::debug!(root = %root_id, ?lanes, "committed");

        let remaining = self.roots[root_id.0].pending_lanes;
        if remaining.is_none() {
            self.legacy_error_boundaries_that_already_failed.clear();
        }
        let now = self.scheduler.now();
        self.ensure_root_is_scheduled(root_id, now);

        // a root that keeps committing sync work without anything else
        // intervening is cascading; count it towards the overflow limit
        if remaining == Lanes::SYNC {
            if self.root_with_nested_updates == Some(root_id) {
                self.nested_update_count += 1;
            } else {
                self.nested_update_count = 0;
                self.root_with_nested_updates = Some(root_id);
            }
        } else {
            self.nested_update_count = 0;
            self.root_with_nested_updates = None;
        }

        // legacy mounts defer the flush to the outer unbatched scope
        if !self
            .execution_context
            .contains(ExecutionContext::LEGACY_UNBATCHED)
        {
            self.flush_sync_callback_queue()?;
        }

        Ok(())
    }

    /// Phases 7-13: before-mutation, mutation, buffer swap, layout, paint.
    /// Returns whether any effect queued passive work.
    fn run_commit_phases(
        &mut self,
        root_id: RootId,
        finished: FiberId,
        first: FiberId,
    ) -> ReconcileResult<bool> {
        let mut root_has_passive_effects = false;

        // --- before-mutation phase ---
        let mut effect = Some(first);
        while let Some(fiber) = effect {
            let flags = self.fibers[fiber].flags;
            if flags.contains(Flags::SNAPSHOT) {
                let mut sink = CommitSink::default();
                let outcome = self.hooks.commit_snapshot(&self.fibers, fiber, &mut sink);
                self.settle_guarded_call(fiber, outcome, sink)?;
            }
            if flags.contains(Flags::PASSIVE) && !root_has_passive_effects {
                root_has_passive_effects = true;
                if !self.passive_flush_scheduled {
                    self.passive_flush_scheduled = true;
                    self.scheduler.schedule(
                        TaskPriority::Normal,
                        RootTask {
                            root: root_id,
                            kind: TaskKind::PassiveEffects,
                        },
                    );
                }
            }
            effect = self.fibers[fiber].next_effect;
        }

        let focused_instance = self.host.prepare_for_commit();
        let mut should_fire_after_blur = false;

        // --- mutation phase ---
        let mut effect = Some(first);
        while let Some(fiber) = effect {
            let flags = self.fibers[fiber].flags;

            if flags.contains(Flags::CONTENT_RESET) {
                let outcome = self.host.reset_text_content(&self.fibers, fiber);
                self.settle_guarded_call(fiber, outcome, CommitSink::default())?;
            }

            if flags.contains(Flags::REF) && self.fibers[fiber].alternate.is_some() {
                let mut sink = CommitSink::default();
                let outcome = self.hooks.commit_detach_ref(&self.fibers, fiber, &mut sink);
                self.settle_guarded_call(fiber, outcome, sink)?;
            }

            let primary =
                flags & (Flags::PLACEMENT | Flags::UPDATE | Flags::DELETION | Flags::HYDRATING);
            if primary.contains(Flags::PLACEMENT) {
                let outcome = self.host.commit_placement(&self.fibers, fiber);
                self.settle_guarded_call(fiber, outcome, CommitSink::default())?;
                // placement handled; the insertion must not re-run if the
                // fiber commits again
                self.fibers[fiber].flags &= !Flags::PLACEMENT;
                if primary.contains(Flags::UPDATE) {
                    let outcome = self.host.commit_work(&self.fibers, fiber);
                    self.settle_guarded_call(fiber, outcome, CommitSink::default())?;
                }
            } else if primary.contains(Flags::HYDRATING) {
                self.fibers[fiber].flags &= !Flags::HYDRATING;
                let outcome = self.host.commit_hydration(&self.fibers, fiber);
                self.settle_guarded_call(fiber, outcome, CommitSink::default())?;
                if primary.contains(Flags::UPDATE) {
                    let outcome = self.host.commit_work(&self.fibers, fiber);
                    self.settle_guarded_call(fiber, outcome, CommitSink::default())?;
                }
            } else if primary.contains(Flags::DELETION) {
                if let Some(focused) = focused_instance {
                    if !should_fire_after_blur && self.subtree_contains(fiber, focused) {
                        should_fire_after_blur = true;
                        self.host.before_active_instance_blur();
                    }
                }
                let outcome = self.host.commit_deletion(&self.fibers, fiber);
                self.settle_guarded_call(fiber, outcome, CommitSink::default())?;
                self.pending_deleted_fibers.push(fiber);
            } else if primary.contains(Flags::UPDATE) {
                let outcome = self.host.commit_work(&self.fibers, fiber);
                self.settle_guarded_call(fiber, outcome, CommitSink::default())?;
            }

            if self.fibers[fiber].tag == WorkTag::SuspenseBoundary
                && flags.contains(Flags::DID_CAPTURE)
            {
                // a fallback is becoming visible; stamp for the throttle
                self.global_most_recent_fallback_time = self.scheduler.now();
            }

            effect = self.fibers[fiber].next_effect;
        }

        // the atomic buffer swap: before this line the host tree matches
        // `current`, after it the host tree matches `finished`
        self.roots[root_id.0].current = finished;

        self.host.reset_after_commit();
        if should_fire_after_blur {
            self.host.after_active_instance_blur();
        }

        // --- layout phase ---
        let mut effect = Some(first);
        while let Some(fiber) = effect {
            let flags = self.fibers[fiber].flags;
            if flags.intersects(Flags::UPDATE | Flags::CALLBACK) {
                let mut sink = CommitSink::default();
                let outcome = self
                    .hooks
                    .commit_layout_effects(&mut self.fibers, fiber, &mut sink);
                self.settle_guarded_call(fiber, outcome, sink)?;
            }
            if flags.contains(Flags::REF) {
                let mut sink = CommitSink::default();
                let outcome = self.hooks.commit_attach_ref(&self.fibers, fiber, &mut sink);
                self.settle_guarded_call(fiber, outcome, sink)?;
            }
            effect = self.fibers[fiber].next_effect;
        }

        self.scheduler.request_paint();
        Ok(root_has_passive_effects)
    }

    /// Route a commit-phase failure to the nearest class boundary above the
    /// failing fiber - or the root - as a Sync-lane error update. A boundary
    /// that fails while capturing is remembered and skipped next time.
    pub fn capture_commit_phase_error(
        &mut self,
        source: FiberId,
        error: CapturedValue,
    ) -> ReconcileResult<()> {
        let error = error.with_source(source);
        tracing::debug!(fiber = %source, ?error, "commit effect failed");

        let mut node = self.fibers.get(source).and_then(|f| f.return_fiber);
        // a failing root fiber routes to itself
        if node.is_none() && self.fibers.get(source).map(|f| f.tag) == Some(WorkTag::HostRoot) {
            node = Some(source);
        }

        while let Some(fiber) = node {
            let tag = self.fibers[fiber].tag;
            let capturable = match tag {
                WorkTag::HostRoot => true,
                WorkTag::ClassComponent => {
                    !self
                        .legacy_error_boundaries_that_already_failed
                        .contains(&fiber)
                        && self.hooks.can_capture_error(&self.fibers, fiber)
                }
                _ => false,
            };
            if capturable {
                match self
                    .hooks
                    .capture_error(&mut self.fibers, fiber, error.clone())
                {
                    Ok(()) => {
                        let event_time = self.request_event_time();
                        self.schedule_update_on_fiber(fiber, Lanes::SYNC, event_time)?;
                        return Ok(());
                    }
                    Err(_) if tag == WorkTag::ClassComponent => {
                        // the boundary itself failed; remember it and keep
                        // looking for an ancestor
                        self.mark_legacy_error_boundary_as_failed(fiber);
                    }
                    Err(inner) => {
                        tracing::error!(?inner, "root failed to record a commit-phase error");
                        return Ok(());
                    }
                }
            }
            node = self.fibers[fiber].return_fiber;
        }

        tracing::error!(?error, "commit-phase error had no boundary to land on");
        Ok(())
    }

    /// Remember a legacy boundary that already failed once, so future errors
    /// skip it and surface at the next ancestor instead.
    pub fn mark_legacy_error_boundary_as_failed(&mut self, boundary: FiberId) {
        self.legacy_error_boundaries_that_already_failed
            .insert(boundary);
    }

    /// Run queued passive effects now instead of waiting for the scheduled
    /// Normal-priority flush.
    pub fn flush_passive_effects(&mut self) -> ReconcileResult<bool> {
        if self.root_with_pending_passive_effects.is_none() {
            return Ok(false);
        }
        let previous_priority = self.current_priority;
        // passive work never runs above Normal priority
        self.current_priority = previous_priority.max(TaskPriority::Normal);
        let result = self.flush_passive_effects_impl();
        self.current_priority = previous_priority;
        result
    }

    pub(crate) fn flush_passive_effects_impl(&mut self) -> ReconcileResult<bool> {
        let Some(root_id) = self.root_with_pending_passive_effects.take() else {
            return Ok(false);
        };
        let lanes = self.pending_passive_effects_lanes;
        self.pending_passive_effects_lanes = Lanes::NONE;
        let first = self.pending_passive_effects_first.take();

        assert!(
            !self
                .execution_context
                .intersects(ExecutionContext::RENDER | ExecutionContext::COMMIT),
            "passive effects must not flush mid render or commit"
        );

        tracing::debug!(root = %root_id, ?lanes, "flushing passive effects");

        let previous_context = self.execution_context;
        self.execution_context |= ExecutionContext::COMMIT;
        let passes = self.run_passive_passes(first);
        self.execution_context = previous_context;
        passes?;

        self.teardown_effect_list(first);

        if self.root_with_nested_passive_updates == Some(root_id) {
            self.nested_passive_update_count += 1;
            if self.nested_passive_update_count >= NESTED_PASSIVE_UPDATE_LIMIT {
                tracing::warn!(
                    root = %root_id,
                    "passive effects keep scheduling more passive effects; possible loop"
                );
                self.nested_passive_update_count = 0;
            }
        } else {
            self.nested_passive_update_count = 0;
            self.root_with_nested_passive_updates = Some(root_id);
        }

        // effects may have scheduled sync work
        self.flush_sync_callback_queue()?;
        Ok(true)
    }

    fn run_passive_passes(&mut self, first: Option<FiberId>) -> ReconcileResult<()> {
        // first pass: destroys, in the order the effects were queued
        let mut effect = first;
        while let Some(fiber) = effect {
            let flags = self.fibers[fiber].flags;
            if flags.contains(Flags::PASSIVE) || flags.contains(Flags::DELETION) {
                let mut sink = CommitSink::default();
                let outcome = self
                    .hooks
                    .commit_passive_unmount(&mut self.fibers, fiber, &mut sink);
                self.settle_guarded_call(fiber, outcome, sink)?;
            }
            effect = self.fibers[fiber].next_effect;
        }

        // second pass: creates; a deleted fiber has nothing left to mount
        let mut effect = first;
        while let Some(fiber) = effect {
            let flags = self.fibers[fiber].flags;
            if flags.contains(Flags::PASSIVE) && !flags.contains(Flags::DELETION) {
                let mut sink = CommitSink::default();
                let outcome = self
                    .hooks
                    .commit_passive_mount(&mut self.fibers, fiber, &mut sink);
                self.settle_guarded_call(fiber, outcome, sink)?;
            }
            effect = self.fibers[fiber].next_effect;
        }
        Ok(())
    }

    /// Apply the outcome of one guarded commit sub-step: route a failure,
    /// then drain whatever the hook queued on the sink.
    fn settle_guarded_call(
        &mut self,
        fiber: FiberId,
        outcome: Result<(), CapturedValue>,
        sink: CommitSink,
    ) -> ReconcileResult<()> {
        if let Err(error) = outcome {
            self.capture_commit_phase_error(fiber, error)?;
        }
        if sink.is_empty() {
            return Ok(());
        }
        for (target, lane) in sink.updates {
            let lane = if lane.is_some() {
                lane
            } else {
                self.request_update_lane(target)
            };
            let event_time = self.request_event_time();
            self.schedule_update_on_fiber(target, lane, event_time)?;
        }
        for (boundary, wakeable) in sink.retries {
            self.attach_retry_listener(boundary, wakeable);
        }
        Ok(())
    }

    /// Whether `descendant` sits inside the subtree rooted at `ancestor`.
    fn subtree_contains(&self, ancestor: FiberId, descendant: FiberId) -> bool {
        let mut node = Some(descendant);
        while let Some(fiber) = node {
            if fiber == ancestor {
                return true;
            }
            node = self.fibers.get(fiber).and_then(|f| f.return_fiber);
        }
        false
    }

    /// Null out effect-list links so completed work can be collected, then
    /// release the arena slots of subtrees deleted by this commit.
    fn teardown_effect_list(&mut self, first: Option<FiberId>) {
        let mut effect = first;
        while let Some(fiber) = effect {
            let next = self.fibers[fiber].next_effect.take();
            effect = next;
        }

        let deleted: Vec<FiberId> = self.pending_deleted_fibers.drain(..).collect();
        for fiber in deleted {
            if self.fibers.contains(fiber) {
                self.release_deleted_subtree(fiber);
            }
        }
    }

    fn release_deleted_subtree(&mut self, fiber: FiberId) {
        let (mut child, alternate) = {
            let f = &self.fibers[fiber];
            (f.child, f.alternate)
        };
        while let Some(c) = child {
            let sibling = self.fibers[c].sibling;
            self.release_deleted_subtree(c);
            child = sibling;
        }
        if let Some(alt) = alternate {
            self.fibers.release(alt);
        }
        self.fibers.release(fiber);
    }
}
