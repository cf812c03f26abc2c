#![doc = include_str!("../README.md")]

pub(crate) mod batching;
pub(crate) mod commit;
pub(crate) mod errors;
pub(crate) mod fiber;
pub(crate) mod hooks;
pub(crate) mod host;
pub(crate) mod lanes;
pub(crate) mod root;
pub(crate) mod scheduler;
pub(crate) mod suspense;
pub(crate) mod work_loop;

pub(crate) mod innerlude {
    pub use crate::batching::*;
    pub use crate::errors::*;
    pub use crate::fiber::*;
    pub use crate::hooks::*;
    pub use crate::host::*;
    pub use crate::lanes::*;
    pub use crate::root::*;
    pub use crate::scheduler::*;
    pub use crate::suspense::*;
    pub use crate::work_loop::*;
}

pub use crate::innerlude::{
    highest_lane_priority, highest_priority_lanes, lane_expiration_ms,
    lane_priority_to_task_priority, request_update_lane, wakeable_key, BeginResult, CapturedValue,
    CommitSink, ExecutionContext, Fiber, FiberId, FiberMode, FiberRoot, Fibers, Flags, HookResult,
    HostConfig, HostResult, LanePriority, Lanes, NoOpHost, PingListener, ReconcileError,
    ReconcileResult, Reconciler, RenderHooks, RootExitStatus, RootId, RootTask, SchedulerMsg,
    StateNode, SuspenseConfig, TaskHandle, TaskKind, TaskPriority, TaskScheduler, TaskStatus,
    TimeoutHandle, VirtualScheduler, Wakeable, WakeableKey, WorkTag, DEFAULT_SUSPENSE_TIMEOUT_MS,
    FALLBACK_THROTTLE_MS, NESTED_PASSIVE_UPDATE_LIMIT, NESTED_UPDATE_LIMIT, NO_TIMEOUT,
    TOTAL_LANES,
};

pub mod prelude {
    pub use crate::innerlude::{
        BeginResult, CapturedValue, CommitSink, FiberId, FiberMode, Fibers, Flags, HostConfig,
        Lanes, NoOpHost, Reconciler, RenderHooks, RootId, SuspenseConfig, TaskPriority,
        TaskScheduler, VirtualScheduler, Wakeable, WorkTag,
    };
}

pub mod exports {
    //! Important dependencies that are used by the rest of the library.
    //! Feel free to just add the dependencies in your own Cargo.toml.
    pub use futures_channel;
    pub use futures_util;
}
