//! The external task scheduler contract, plus a deterministic in-process
//! implementation for embedders (and tests) that have no platform event loop.
//!
//! The reconciler owns exactly one task slot per root. It never runs work
//! inside `schedule` - the embedder's loop pops tasks from its scheduler and
//! hands them back through [`crate::Reconciler::run_task`], so the scheduler
//! stays a dumb prioritised FIFO and all reentrancy lives in the work loop.

use std::cell::Cell;
use std::collections::VecDeque;

use crate::root::RootId;

/// Priority classes understood by the external scheduler, most urgent first.
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    Immediate = 0,
    UserBlocking = 1,
    Normal = 2,
    Low = 3,
    Idle = 4,
}

impl TaskPriority {
    /// How long a task at this priority may starve before the scheduler
    /// reports `did_timeout` when running it.
    pub fn starvation_timeout_ms(self) -> Option<u64> {
        match self {
            TaskPriority::Immediate => Some(0),
            TaskPriority::UserBlocking => Some(250),
            TaskPriority::Normal => Some(5_000),
            TaskPriority::Low => Some(10_000),
            TaskPriority::Idle => None,
        }
    }
}

/// Opaque handle to a scheduled task. Handles are never reused.
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

/// What a bound task should do when the embedder runs it.
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Render the root's next lanes (concurrent unless the binding was sync).
    RenderRoot,
    /// Flush pending passive effects for the root.
    PassiveEffects,
}

/// The descriptor the reconciler binds into the scheduler. Plain data: the
/// scheduler never calls into the reconciler.
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootTask {
    pub root: RootId,
    pub kind: TaskKind,
}

/// Outcome of running a bound task, reported back to the embedder's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task is done (or was stale); drop it from the scheduler.
    Complete,
    /// The render yielded with work remaining and the same binding is still
    /// current; run the task again later.
    Yielded,
}

/// The priority scheduler the reconciler consumes.
///
/// Single-threaded and cooperative: `should_yield` is polled between fibers
/// during concurrent renders, never mid-unit. `now` is monotonic
/// milliseconds and is the only clock the reconciler reads.
pub trait TaskScheduler {
    fn schedule(&mut self, priority: TaskPriority, task: RootTask) -> TaskHandle;
    fn cancel(&mut self, handle: TaskHandle);
    fn should_yield(&self) -> bool;
    fn request_paint(&mut self);
    fn now(&self) -> u64;
}

struct VirtualTask {
    handle: TaskHandle,
    priority: TaskPriority,
    task: RootTask,
    /// Insertion order, for FIFO within a priority class.
    seq: u64,
    /// Virtual instant at which this task counts as starved.
    deadline: Option<u64>,
}

/// A deterministic [`TaskScheduler`] driven by virtual time.
///
/// Tasks run strictly in (priority, insertion) order. Yielding is scripted:
/// [`VirtualScheduler::set_yield_after`] arms `should_yield` to allow a fixed
/// number of work units before demanding control back, which is how the test
/// suite reproduces deadline expiry without wall-clock timers.
pub struct VirtualScheduler {
    tasks: Vec<VirtualTask>,
    now: u64,
    next_handle: u64,
    next_seq: u64,
    yield_after: Cell<Option<u32>>,
    paint_requests: u32,
    cancelled: VecDeque<TaskHandle>,
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            now: 0,
            next_handle: 1,
            next_seq: 0,
            yield_after: Cell::new(None),
            paint_requests: 0,
            cancelled: VecDeque::new(),
        }
    }

    /// Advance virtual time. Nothing runs by itself; starved tasks are only
    /// reported as timed out when the embedder next pops them.
    pub fn advance_time(&mut self, ms: u64) {
        self.now += ms;
    }

    /// Arm `should_yield` to return `false` for the next `units` polls and
    /// `true` afterwards. `clear_yield` disarms it again.
    pub fn set_yield_after(&self, units: u32) {
        self.yield_after.set(Some(units));
    }

    pub fn clear_yield(&self) {
        self.yield_after.set(None);
    }

    /// Pop the most urgent task: lowest priority value first, FIFO within a
    /// class. Returns the handle, the descriptor, and whether the task sat
    /// past its starvation deadline.
    pub fn take_next(&mut self) -> Option<(TaskHandle, RootTask, bool)> {
        let best = self
            .tasks
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| (t.priority, t.seq))
            .map(|(i, _)| i)?;
        let task = self.tasks.remove(best);
        let timed_out = task.deadline.is_some_and(|d| self.now >= d);
        Some((task.handle, task.task, timed_out))
    }

    /// Re-enqueue a yielded task under its original handle and priority.
    /// Lane-level expiration stamps are what actually bound starvation, so a
    /// continuation gets an ordinary deadline here.
    pub fn requeue(&mut self, handle: TaskHandle, priority: TaskPriority, task: RootTask) {
        let deadline = priority
            .starvation_timeout_ms()
            .map(|ms| self.now.saturating_add(ms));
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.push(VirtualTask {
            handle,
            priority,
            task,
            seq,
            deadline,
        });
    }

    pub fn has_pending_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn pending_task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn paint_requests(&self) -> u32 {
        self.paint_requests
    }

    /// Handles cancelled since the last call, oldest first.
    pub fn drain_cancelled(&mut self) -> impl Iterator<Item = TaskHandle> + '_ {
        self.cancelled.drain(..)
    }
}

impl TaskScheduler for VirtualScheduler {
    fn schedule(&mut self, priority: TaskPriority, task: RootTask) -> TaskHandle {
        let handle = TaskHandle(self.next_handle);
        self.next_handle += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline = priority
            .starvation_timeout_ms()
            .map(|ms| self.now.saturating_add(ms));
        self.tasks.push(VirtualTask {
            handle,
            priority,
            task,
            seq,
            deadline,
        });
        handle
    }

    fn cancel(&mut self, handle: TaskHandle) {
        self.tasks.retain(|t| t.handle != handle);
        self.cancelled.push_back(handle);
    }

    fn should_yield(&self) -> bool {
        match self.yield_after.get() {
            None => false,
            Some(0) => true,
            Some(n) => {
                self.yield_after.set(Some(n - 1));
                false
            }
        }
    }

    fn request_paint(&mut self) {
        self.paint_requests += 1;
    }

    fn now(&self) -> u64 {
        self.now
    }
}
