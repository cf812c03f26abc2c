//! The suspension and ping protocol.
//!
//! A suspending fiber hands the work loop a [`Wakeable`] (the pending async
//! resource). The loop marks the render suspended and subscribes a
//! [`PingListener`]; when the resource settles - resolution or rejection
//! alike - the listener posts a message onto the reconciler channel, which
//! pings the root so the suspended lanes become eligible again. Boundaries
//! that committed a fallback register the same resources for a retry render
//! on a Retry lane.

use std::rc::Rc;

use futures_channel::mpsc::UnboundedSender;

use crate::errors::ReconcileResult;
use crate::fiber::{FiberId, FiberMode};
use crate::hooks::RenderHooks;
use crate::host::HostConfig;
use crate::lanes::Lanes;
use crate::root::RootId;
use crate::scheduler::{TaskPriority, TaskScheduler};
use crate::work_loop::{Reconciler, RootExitStatus, FALLBACK_THROTTLE_MS};

/// Hints carried by a transition update, consulted when classifying its lane
/// and when deciding how long a completed-but-busy render may be held back.
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspenseConfig {
    /// How long the transition may stay suspended before its fallback is
    /// forced (also classifies Short vs Long transition lanes).
    pub timeout_ms: u64,
    /// Renders finishing within this window commit immediately.
    pub busy_delay_ms: u64,
    /// Once past `busy_delay_ms`, hold the commit until the busy indicator
    /// has been visible at least this long.
    pub busy_min_duration_ms: u64,
}

impl SuspenseConfig {
    pub fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            busy_delay_ms: 0,
            busy_min_duration_ms: 0,
        }
    }
}

/// Identity of a pending async resource, keyed by the `Rc` it travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakeableKey(usize);

pub fn wakeable_key(wakeable: &Rc<dyn Wakeable>) -> WakeableKey {
    WakeableKey(Rc::as_ptr(wakeable) as *const () as usize)
}

/// A pending async resource a fiber suspended on.
///
/// `subscribe` must invoke the listener exactly once when the resource
/// settles, whether it resolves or rejects; a rejected resource surfaces as
/// a render error on the retry, not through the listener.
pub trait Wakeable {
    fn subscribe(&self, listener: PingListener);
}

/// Notifications posted by settled wakeables, drained by
/// [`Reconciler::process_messages`].
#[derive(Debug, Clone, Copy)]
pub enum SchedulerMsg {
    Pinged {
        root: RootId,
        lanes: Lanes,
        key: WakeableKey,
    },
    Retried {
        boundary: FiberId,
        key: WakeableKey,
    },
}

/// One-shot callback handed to [`Wakeable::subscribe`].
#[derive(Clone)]
pub struct PingListener {
    pub(crate) tx: UnboundedSender<SchedulerMsg>,
    pub(crate) msg: SchedulerMsg,
}

impl PingListener {
    /// Post the notification. Safe to call after the reconciler is gone; the
    /// message is simply dropped.
    pub fn notify(&self) {
        let _ = self.tx.unbounded_send(self.msg);
    }
}

impl<S: TaskScheduler, H: HostConfig, R: RenderHooks> Reconciler<S, H, R> {
    /// Subscribe the root for a ping when `wakeable` settles, at most once
    /// per (wakeable, lanes) pair.
    pub(crate) fn attach_ping_listener(
        &mut self,
        root_id: RootId,
        wakeable: &Rc<dyn Wakeable>,
        lanes: Lanes,
    ) {
        let key = wakeable_key(wakeable);
        let threads = self.roots[root_id.0].ping_cache.entry(key).or_default();
        if threads.contains(&lanes) {
            return;
        }
        threads.push(lanes);
        wakeable.subscribe(PingListener {
            tx: self.tx.clone(),
            msg: SchedulerMsg::Pinged {
                root: root_id,
                lanes,
                key,
            },
        });
    }

    /// A wakeable for `pinged_lanes` settled: make the lanes eligible again
    /// and, when the ping lands on the render currently in flight, decide
    /// whether to restart it from the top.
    pub fn ping_suspended_root(&mut self, root_id: RootId, key: WakeableKey, pinged_lanes: Lanes) {
        if self.roots.get(root_id.0).is_none() {
            return;
        }
        let now = self.scheduler.now();
        let root = &mut self.roots[root_id.0];
        root.ping_cache.remove(&key);
        root.mark_root_pinged(pinged_lanes);

        tracing::debug!(root = %root_id, lanes = ?pinged_lanes, "ping");

        if self.wip_root == Some(root_id) && self.wip_root_render_lanes.contains(pinged_lanes) {
            // The in-flight render suspended on exactly this data. Restart
            // from the top if we are only showing (or about to show) a
            // fallback nobody asked for; otherwise note the ping and let the
            // render finish.
            let inside_throttle_window =
                now < self.global_most_recent_fallback_time + FALLBACK_THROTTLE_MS;
            let restart = match self.wip_root_exit_status {
                RootExitStatus::SuspendedWithDelay => true,
                RootExitStatus::Suspended => {
                    self.wip_root_latest_event_time.is_none() && inside_throttle_window
                }
                _ => false,
            };
            if restart {
                self.prepare_fresh_stack(root_id, Lanes::NONE);
            } else {
                self.wip_root_pinged_lanes |= pinged_lanes;
            }
        }

        self.ensure_root_is_scheduled(root_id, now);
    }

    /// Subscribe a committed fallback's boundary for a retry when `wakeable`
    /// settles. The retry cache keeps one subscription per resource.
    pub(crate) fn attach_retry_listener(&mut self, boundary: FiberId, wakeable: Rc<dyn Wakeable>) {
        let key = wakeable_key(&wakeable);
        if !self.retry_cache.insert(key) {
            return;
        }
        wakeable.subscribe(PingListener {
            tx: self.tx.clone(),
            msg: SchedulerMsg::Retried { boundary, key },
        });
    }

    /// A resource a fallback was waiting on settled; drop it from the retry
    /// cache and schedule the boundary's retry render.
    pub fn resolve_retry_wakeable(
        &mut self,
        boundary: FiberId,
        key: WakeableKey,
    ) -> ReconcileResult<()> {
        self.retry_cache.remove(&key);
        self.retry_timed_out_boundary(boundary, Lanes::NONE)
    }

    /// Schedule a suspense boundary to retry its real content. Passing
    /// `Lanes::NONE` allocates a fresh retry lane for the boundary's mode.
    pub fn retry_timed_out_boundary(
        &mut self,
        boundary: FiberId,
        retry_lane: Lanes,
    ) -> ReconcileResult<()> {
        if !self.fibers.contains(boundary) {
            return Ok(());
        }
        let lane = if retry_lane.is_some() {
            retry_lane
        } else {
            self.request_retry_lane(boundary)
        };
        let event_time = self.request_event_time();
        self.schedule_update_on_fiber(boundary, lane, event_time)?;
        Ok(())
    }

    fn request_retry_lane(&mut self, boundary: FiberId) -> Lanes {
        let mode = self.fibers[boundary].mode;
        if !mode.contains(FiberMode::BLOCKING) {
            Lanes::SYNC
        } else if !mode.contains(FiberMode::CONCURRENT) {
            if self.current_priority == TaskPriority::Immediate {
                Lanes::SYNC
            } else {
                Lanes::SYNC_BATCHED
            }
        } else {
            self.claim_retry_lane()
        }
    }

    /// Rotate through the Retry class so consecutive retries land on
    /// distinct bits.
    fn claim_retry_lane(&mut self) -> Lanes {
        let lane = self.next_retry_lane;
        let shifted = Lanes(lane.0 << 1) & Lanes::RETRY;
        self.next_retry_lane = if shifted.is_none() {
            Lanes::RETRY.highest()
        } else {
            shifted
        };
        lane
    }
}
