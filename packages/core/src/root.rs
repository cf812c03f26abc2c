//! Per-tree containers and the task binder.
//!
//! A [`FiberRoot`] owns the lane bookkeeping for one tree: which lanes are
//! pending, suspended, pinged, or expired, the per-lane event/expiration
//! stamps, and the single task currently bound for the root.
//! [`Reconciler::ensure_root_is_scheduled`] is the only place a root's task
//! is (re)bound; at any instant a root has at most one scheduled task.

use std::fmt::Display;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::fiber::FiberId;
use crate::host::{TimeoutHandle, NO_TIMEOUT};
use crate::hooks::RenderHooks;
use crate::host::HostConfig;
use crate::lanes::{
    highest_lane_priority, highest_priority_lanes, lane_expiration_ms,
    lane_priority_to_task_priority, LanePriority, Lanes, TOTAL_LANES,
};
use crate::scheduler::{RootTask, TaskHandle, TaskKind, TaskPriority, TaskScheduler};
use crate::suspense::WakeableKey;
use crate::work_loop::Reconciler;

/// A root's index in the registry.
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RootId(pub usize);

impl Display for RootId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The task currently bound for a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RootCallback {
    /// Bound into the external scheduler.
    Scheduler(TaskHandle),
    /// Queued on the in-process immediate queue (Sync lane work).
    SyncQueue,
}

/// Per-tree container: the committed tree, outstanding-lane masks, stamp
/// arrays, and the bound-task state.
pub struct FiberRoot {
    pub(crate) id: RootId,
    /// The currently committed tree.
    pub(crate) current: FiberId,

    pub(crate) pending_lanes: Lanes,
    pub(crate) suspended_lanes: Lanes,
    pub(crate) pinged_lanes: Lanes,
    pub(crate) expired_lanes: Lanes,
    pub(crate) finished_lanes: Lanes,

    pub(crate) event_times: [u64; TOTAL_LANES],
    pub(crate) expiration_times: [Option<u64>; TOTAL_LANES],

    pub(crate) callback_node: Option<RootCallback>,
    pub(crate) callback_id: Lanes,
    pub(crate) callback_is_sync: bool,
    pub(crate) callback_priority: TaskPriority,
    pub(crate) expires_at: Option<u64>,

    /// Pending delayed-commit timer, [`NO_TIMEOUT`] when none.
    pub(crate) timeout_handle: TimeoutHandle,

    /// The work-in-progress tree awaiting commit.
    pub(crate) finished_work: Option<FiberId>,

    /// Lane sets already subscribed per pending wakeable, so a root attaches
    /// at most one ping listener per (wakeable, lanes) pair.
    pub(crate) ping_cache: FxHashMap<WakeableKey, SmallVec<[Lanes; 2]>>,

    /// The most recent transition config and the lanes it was scheduled on;
    /// consulted when a render of those lanes starts.
    pub(crate) last_transition_config: Option<(Lanes, crate::suspense::SuspenseConfig)>,
}

impl FiberRoot {
    pub(crate) fn new(id: RootId, current: FiberId) -> Self {
        Self {
            id,
            current,
            pending_lanes: Lanes::NONE,
            suspended_lanes: Lanes::NONE,
            pinged_lanes: Lanes::NONE,
            expired_lanes: Lanes::NONE,
            finished_lanes: Lanes::NONE,
            event_times: [0; TOTAL_LANES],
            expiration_times: [None; TOTAL_LANES],
            callback_node: None,
            callback_id: Lanes::NONE,
            callback_is_sync: false,
            callback_priority: TaskPriority::Normal,
            expires_at: None,
            timeout_handle: NO_TIMEOUT,
            finished_work: None,
            ping_cache: FxHashMap::default(),
            last_transition_config: None,
        }
    }

    pub fn id(&self) -> RootId {
        self.id
    }

    /// The committed tree's root fiber.
    pub fn current(&self) -> FiberId {
        self.current
    }

    pub fn pending_lanes(&self) -> Lanes {
        self.pending_lanes
    }

    pub fn suspended_lanes(&self) -> Lanes {
        self.suspended_lanes
    }

    pub fn pinged_lanes(&self) -> Lanes {
        self.pinged_lanes
    }

    pub fn expired_lanes(&self) -> Lanes {
        self.expired_lanes
    }

    pub fn has_pending_work(&self) -> bool {
        self.pending_lanes.is_some()
    }

    /// Record a new update: the lane becomes pending and any suspension at
    /// its priority or below is superseded (the fresh work may resolve it).
    pub(crate) fn mark_root_updated(&mut self, lane: Lanes, event_time: u64) {
        debug_assert_eq!(lane.count(), 1, "updates land on a single lane");
        self.pending_lanes |= lane;
        let higher_priority = Lanes(lane.0.wrapping_sub(1));
        self.suspended_lanes &= higher_priority;
        self.pinged_lanes &= higher_priority;
        self.event_times[lane.index()] = event_time;
    }

    /// The render of `lanes` suspended. They stay pending but stop being
    /// eligible until pinged or expired; their expiration stamps are dropped
    /// so a suspended lane cannot starve into a forced sync render.
    pub(crate) fn mark_root_suspended(&mut self, lanes: Lanes) {
        self.suspended_lanes |= lanes;
        self.pinged_lanes = self.pinged_lanes.without(lanes);
        for lane in lanes.each_lane() {
            self.expiration_times[lane.index()] = None;
        }
    }

    /// A wakeable for `lanes` resolved; suspended bits move to pinged.
    pub(crate) fn mark_root_pinged(&mut self, lanes: Lanes) {
        self.pinged_lanes |= self.suspended_lanes & lanes;
    }

    /// Force `lanes` to render synchronously on the next turn.
    pub(crate) fn mark_root_expired(&mut self, lanes: Lanes) {
        self.expired_lanes |= lanes & self.pending_lanes;
    }

    /// A commit landed; everything not in `remaining` is done.
    pub(crate) fn mark_root_finished(&mut self, remaining: Lanes) {
        let no_longer_pending = self.pending_lanes.without(remaining);

        self.pending_lanes = remaining;
        self.suspended_lanes = Lanes::NONE;
        self.pinged_lanes = Lanes::NONE;
        self.expired_lanes &= remaining;

        for lane in no_longer_pending.each_lane() {
            let index = lane.index();
            self.event_times[index] = 0;
            self.expiration_times[index] = None;
        }
    }

    /// Stamp expiration deadlines for pending lanes and promote overdue ones
    /// into `expired_lanes`. Suspended-without-ping lanes are exempt; they
    /// are waiting on data, not on CPU.
    pub(crate) fn mark_starved_lanes_as_expired(&mut self, now: u64) {
        for lane in self.pending_lanes.each_lane() {
            let index = lane.index();
            match self.expiration_times[index] {
                None => {
                    let eligible = !self.suspended_lanes.intersects(lane)
                        || self.pinged_lanes.intersects(lane);
                    if eligible {
                        if let Some(timeout) = lane_expiration_ms(lane) {
                            self.expiration_times[index] = Some(now + timeout);
                        }
                    }
                }
                Some(at) if at <= now => self.expired_lanes |= lane,
                Some(_) => {}
            }
        }
    }

    /// The highest-priority lanes the root should render next, or none.
    ///
    /// Expired lanes trump everything (they render sync). Otherwise the
    /// highest unblocked class wins; a class that is entirely suspended is
    /// only eligible through its pinged bits. When a render is already in
    /// flight, its lanes are preferred unless the new work is strictly
    /// higher priority.
    pub fn next_lanes(&self, wip_lanes: Lanes) -> Lanes {
        let pending = self.pending_lanes;
        if pending.is_none() {
            return Lanes::NONE;
        }

        let suspended = self.suspended_lanes;
        let pinged = self.pinged_lanes;

        let mut next = if self.expired_lanes.is_some() {
            self.expired_lanes & pending
        } else {
            Lanes::NONE
        };

        if next.is_none() {
            let non_idle_pending = pending & Lanes::NON_IDLE;
            next = if non_idle_pending.is_some() {
                let unblocked = non_idle_pending.without(suspended);
                if unblocked.is_some() {
                    highest_priority_lanes(unblocked).0
                } else {
                    highest_priority_lanes(non_idle_pending & pinged).0
                }
            } else {
                let unblocked = pending.without(suspended);
                if unblocked.is_some() {
                    highest_priority_lanes(unblocked).0
                } else {
                    highest_priority_lanes(pinged).0
                }
            };
        }

        if next.is_none() {
            return Lanes::NONE;
        }

        // Sweep in every pending lane of equal or higher priority so one
        // render retires as much entangled work as it can.
        next = pending & equal_or_higher_priority_lanes(next);

        if wip_lanes.is_some() && wip_lanes != next && !wip_lanes.intersects(suspended) {
            let next_priority = highest_lane_priority(next);
            let wip_priority = highest_lane_priority(wip_lanes);
            if next_priority <= wip_priority {
                return wip_lanes;
            }
        }

        next
    }
}

/// All lanes at the priority of `lanes`' least urgent bit or above.
fn equal_or_higher_priority_lanes(lanes: Lanes) -> Lanes {
    debug_assert!(lanes.is_some());
    let lowest_priority_bit = 1u32 << (31 - lanes.0.leading_zeros());
    Lanes((lowest_priority_bit.wrapping_shl(1)).wrapping_sub(1) & Lanes::ALL.0)
}

impl<S: TaskScheduler, H: HostConfig, R: RenderHooks> Reconciler<S, H, R> {
    pub fn root(&self, id: RootId) -> &FiberRoot {
        &self.roots[id.0]
    }

    pub(crate) fn root_mut(&mut self, id: RootId) -> &mut FiberRoot {
        &mut self.roots[id.0]
    }

    pub fn try_root(&self, id: RootId) -> Option<&FiberRoot> {
        self.roots.get(id.0)
    }

    /// Bind (or re-bind) the root's single task to match its next lanes.
    ///
    /// Called on every update, after every commit, and whenever a render
    /// yields - it is idempotent: an existing binding for the same lanes and
    /// flavour is kept untouched.
    pub(crate) fn ensure_root_is_scheduled(&mut self, root_id: RootId, current_time: u64) {
        let wip_lanes = if self.wip_root == Some(root_id) {
            self.wip_root_render_lanes
        } else {
            Lanes::NONE
        };

        let root = &mut self.roots[root_id.0];
        root.mark_starved_lanes_as_expired(current_time);
        let next_lanes = root.next_lanes(wip_lanes);

        if next_lanes.is_none() {
            if let Some(callback) = root.callback_node.take() {
                root.callback_id = Lanes::NONE;
                root.callback_is_sync = false;
                self.unbind(root_id, callback);
            }
            return;
        }

        let lane_priority = highest_lane_priority(next_lanes);
        let bind_sync = lane_priority == LanePriority::Sync;

        if let Some(existing) = root.callback_node {
            if root.callback_id == next_lanes && root.callback_is_sync == bind_sync {
                // same lanes, same flavour: the existing task still stands
                return;
            }
            root.callback_node = None;
            self.unbind(root_id, existing);
        }

        let root = &mut self.roots[root_id.0];
        root.callback_id = next_lanes;
        root.callback_is_sync = bind_sync;
        let expires_at = next_lanes
            .each_lane()
            .filter_map(|lane| root.expiration_times[lane.index()])
            .min();
        root.expires_at = expires_at;

        if bind_sync {
            root.callback_node = Some(RootCallback::SyncQueue);
            root.callback_priority = TaskPriority::Immediate;
            self.schedule_sync_callback(root_id);
        } else {
            let priority = lane_priority_to_task_priority(lane_priority);
            root.callback_priority = priority;
            let handle = self.scheduler.schedule(
                priority,
                RootTask {
                    root: root_id,
                    kind: TaskKind::RenderRoot,
                },
            );
            self.roots[root_id.0].callback_node = Some(RootCallback::Scheduler(handle));
            tracing::debug!(root = %root_id, lanes = ?next_lanes, ?priority, "bound root task");
        }
    }

    fn unbind(&mut self, root_id: RootId, callback: RootCallback) {
        match callback {
            RootCallback::Scheduler(handle) => self.scheduler.cancel(handle),
            RootCallback::SyncQueue => {
                self.sync_callback_queue.retain(|queued| *queued != root_id);
            }
        }
    }

    fn schedule_sync_callback(&mut self, root_id: RootId) {
        if !self.sync_callback_queue.contains(&root_id) {
            self.sync_callback_queue.push_back(root_id);
        }
    }

    /// Drain the in-process immediate queue. Reentrant calls (a sync render
    /// scheduling more sync work) fold into the running drain.
    pub(crate) fn flush_sync_callback_queue(&mut self) -> crate::errors::ReconcileResult<()> {
        if self.is_flushing_sync_queue {
            return Ok(());
        }
        self.is_flushing_sync_queue = true;
        let previous_priority = self.current_priority;
        self.current_priority = TaskPriority::Immediate;

        let result = loop {
            let Some(root_id) = self.sync_callback_queue.pop_front() else {
                break Ok(());
            };
            if let Err(err) = self.perform_sync_work_on_root(root_id) {
                break Err(err);
            }
        };

        self.current_priority = previous_priority;
        self.is_flushing_sync_queue = false;
        result
    }
}
