//! Shared harness for the integration tests: a scripted [`RenderHooks`]
//! implementation driven by a named blueprint tree, a recording
//! [`HostConfig`], and manually-resolvable wakeables. Everything of interest
//! is appended to one shared log so tests assert on ordering.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use weft_core::{
    BeginResult, CapturedValue, CommitSink, FiberId, FiberMode, Fibers, Flags, HookResult,
    HostConfig, HostResult, Lanes, PingListener, Reconciler, RenderHooks, RootId, SuspenseConfig,
    TimeoutHandle, VirtualScheduler, Wakeable, WorkTag,
};

pub type Log = Rc<RefCell<Vec<String>>>;

pub type TestReconciler = Reconciler<VirtualScheduler, RecordingHost, TestHooks>;

pub fn logged(log: &Log) -> Vec<String> {
    log.borrow().clone()
}

pub fn log_contains(log: &Log, entry: &str) -> bool {
    log.borrow().iter().any(|line| line == entry)
}

pub fn count_logged(log: &Log, entry: &str) -> usize {
    log.borrow().iter().filter(|line| *line == entry).count()
}

/// A pending async resource tests settle by hand.
pub struct TestWakeable {
    resolved: Cell<bool>,
    listeners: RefCell<Vec<PingListener>>,
}

impl TestWakeable {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            resolved: Cell::new(false),
            listeners: RefCell::new(Vec::new()),
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get()
    }

    pub fn resolve(&self) {
        self.resolved.set(true);
        for listener in self.listeners.borrow_mut().drain(..) {
            listener.notify();
        }
    }
}

impl Wakeable for TestWakeable {
    fn subscribe(&self, listener: PingListener) {
        if self.resolved.get() {
            listener.notify();
        } else {
            self.listeners.borrow_mut().push(listener);
        }
    }
}

/// Blueprint node for the scripted tree.
#[derive(Clone)]
pub struct NodeSpec {
    pub name: &'static str,
    pub tag: WorkTag,
    pub flags: Flags,
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn new(name: &'static str, tag: WorkTag) -> Self {
        Self {
            name,
            tag,
            flags: Flags::NONE,
            children: Vec::new(),
        }
    }

    /// Effect flags stamped on the fiber every time it completes.
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }
}

pub fn host(name: &'static str) -> NodeSpec {
    NodeSpec::new(name, WorkTag::HostComponent)
}

pub fn class(name: &'static str) -> NodeSpec {
    NodeSpec::new(name, WorkTag::ClassComponent)
}

pub fn suspense(name: &'static str) -> NodeSpec {
    NodeSpec::new(name, WorkTag::SuspenseBoundary)
}

struct Entry {
    tag: WorkTag,
    flags: Flags,
    children: Vec<String>,
}

/// Scripted element→fiber layer: renders the blueprint, with per-node
/// scripts for suspending, erroring, capturing, and effect-time updates.
pub struct TestHooks {
    registry: HashMap<String, Entry>,
    top: Vec<String>,
    pub log: Log,
    suspend_on: HashMap<String, Rc<TestWakeable>>,
    error_on: HashMap<String, u32>,
    error_boundaries: HashSet<String>,
    /// boundaries with a commit-phase error update waiting to render
    boundary_errors: HashSet<String>,
    /// layout effects that schedule an update when they run: (remaining, lane)
    layout_updates: HashMap<String, (u32, Lanes)>,
    /// boundaries that register a retry wakeable when their commit lands
    retry_wakeables: HashMap<String, Rc<TestWakeable>>,
    pub fatal_on_throw: bool,
}

impl TestHooks {
    pub fn new(tree: Vec<NodeSpec>, log: Log) -> Self {
        let mut hooks = Self {
            registry: HashMap::new(),
            top: tree.iter().map(|n| n.name.to_string()).collect(),
            log,
            suspend_on: HashMap::new(),
            error_on: HashMap::new(),
            error_boundaries: HashSet::new(),
            boundary_errors: HashSet::new(),
            layout_updates: HashMap::new(),
            retry_wakeables: HashMap::new(),
            fatal_on_throw: false,
        };
        for node in tree {
            hooks.register(node);
        }
        hooks
    }

    fn register(&mut self, node: NodeSpec) {
        let children = node.children.iter().map(|c| c.name.to_string()).collect();
        self.registry.insert(
            node.name.to_string(),
            Entry {
                tag: node.tag,
                flags: node.flags,
                children,
            },
        );
        for child in node.children {
            self.register(child);
        }
    }

    /// Make `name` suspend on `wakeable` until it resolves.
    pub fn suspend(&mut self, name: &str, wakeable: Rc<TestWakeable>) {
        self.suspend_on.insert(name.to_string(), wakeable);
    }

    /// Make `name`'s next `times` renders fail.
    pub fn error_times(&mut self, name: &str, times: u32) {
        self.error_on.insert(name.to_string(), times);
    }

    /// Mark a class node as a capturing error boundary.
    pub fn error_boundary(&mut self, name: &str) {
        self.error_boundaries.insert(name.to_string());
    }

    /// Make `name`'s layout effect schedule `times` updates at `lane` on
    /// itself.
    pub fn layout_update(&mut self, name: &str, times: u32, lane: Lanes) {
        self.layout_updates.insert(name.to_string(), (times, lane));
    }

    /// Register `wakeable` for retry when `name`'s commit lands.
    pub fn retry_on_commit(&mut self, name: &str, wakeable: Rc<TestWakeable>) {
        self.retry_wakeables.insert(name.to_string(), wakeable);
    }

    /// Replace a node's children (the next render diffs against the old
    /// set, deleting what disappeared).
    pub fn set_children(&mut self, parent: &str, children: Vec<NodeSpec>) {
        let names = children.iter().map(|c| c.name.to_string()).collect();
        if let Some(entry) = self.registry.get_mut(parent) {
            entry.children = names;
        }
        for child in children {
            self.register(child);
        }
    }

    fn reconcile_children(
        &mut self,
        fibers: &mut Fibers,
        current: Option<FiberId>,
        wip: FiberId,
        names: &[String],
    ) -> Option<FiberId> {
        let mut existing: HashMap<String, FiberId> = HashMap::new();
        if let Some(current) = current {
            let mut child = fibers[current].child;
            while let Some(c) = child {
                if let Some(key) = fibers[c].key.as_deref() {
                    existing.insert(key.to_string(), c);
                }
                child = fibers[c].sibling;
            }
        }

        let mode = fibers[wip].mode;
        let mut first = None;
        let mut previous: Option<FiberId> = None;
        for name in names {
            let child = match existing.remove(name) {
                Some(current_child) => fibers.create_work_in_progress(current_child, None),
                None => {
                    let tag = self.registry.get(name).map(|e| e.tag).unwrap_or(WorkTag::HostComponent);
                    fibers.create_fiber(tag, mode, Some(Rc::from(name.as_str())), None)
                }
            };
            fibers[child].return_fiber = Some(wip);
            fibers[child].sibling = None;
            match previous {
                Some(prev) => fibers[prev].sibling = Some(child),
                None => fibers[wip].child = Some(child),
            }
            previous = Some(child);
            if first.is_none() {
                first = Some(child);
            }
        }
        if first.is_none() {
            fibers[wip].child = None;
        }

        for (_, deleted) in existing {
            fibers.record_deletion(wip, deleted);
        }
        first
    }
}

pub fn fiber_name(fibers: &Fibers, fiber: FiberId) -> String {
    if fibers[fiber].tag == WorkTag::HostRoot {
        "#root".to_string()
    } else {
        fibers[fiber]
            .key
            .as_deref()
            .unwrap_or("?")
            .to_string()
    }
}

impl RenderHooks for TestHooks {
    fn begin_work(
        &mut self,
        fibers: &mut Fibers,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> BeginResult {
        let name = fiber_name(fibers, wip);
        let tag = fibers[wip].tag;
        self.log.borrow_mut().push(format!("begin:{name}"));

        // a boundary that captured during this render shows its degraded UI
        if fibers[wip].flags.contains(Flags::DID_CAPTURE) {
            let label = if tag == WorkTag::SuspenseBoundary {
                "fallback"
            } else {
                "error-ui"
            };
            self.log.borrow_mut().push(format!("{label}:{name}"));
            let lanes = fibers[wip].lanes;
            fibers[wip].lanes = lanes.without(render_lanes);
            fibers[wip].child = None;
            return BeginResult::Done;
        }

        // a commit-phase error update waiting on this boundary
        if self.boundary_errors.remove(&name) {
            self.log.borrow_mut().push(format!("error-ui:{name}"));
            let lanes = fibers[wip].lanes;
            fibers[wip].lanes = lanes.without(render_lanes);
            return match self.reconcile_children(fibers, current, wip, &[]) {
                Some(first) => BeginResult::ContinueWith(first),
                None => BeginResult::Done,
            };
        }

        if let Some(remaining) = self.error_on.get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                self.log.borrow_mut().push(format!("error:{name}"));
                return BeginResult::Error(CapturedValue::from_message(format!(
                    "{name} exploded"
                )));
            }
        }

        // this render consumes the fiber's update lanes
        let lanes = fibers[wip].lanes;
        fibers[wip].lanes = lanes.without(render_lanes);

        if let Some(wakeable) = self.suspend_on.get(&name) {
            if !wakeable.is_resolved() {
                self.log.borrow_mut().push(format!("suspend:{name}"));
                let wakeable: Rc<dyn Wakeable> = wakeable.clone();
                return BeginResult::Suspend(wakeable);
            }
        }

        let child_names: Vec<String> = if tag == WorkTag::HostRoot {
            self.top.clone()
        } else {
            self.registry
                .get(&name)
                .map(|entry| entry.children.clone())
                .unwrap_or_default()
        };

        match self.reconcile_children(fibers, current, wip, &child_names) {
            Some(first) => BeginResult::ContinueWith(first),
            None => BeginResult::Done,
        }
    }

    fn complete_work(
        &mut self,
        fibers: &mut Fibers,
        current: Option<FiberId>,
        wip: FiberId,
        _render_lanes: Lanes,
    ) -> Option<FiberId> {
        let name = fiber_name(fibers, wip);
        self.log.borrow_mut().push(format!("complete:{name}"));

        if fibers[wip].tag != WorkTag::HostRoot {
            let scripted = self
                .registry
                .get(&name)
                .map(|entry| entry.flags)
                .unwrap_or(Flags::NONE);
            let fiber = &mut fibers[wip];
            fiber.flags |= scripted;
            if current.is_none() {
                fiber.flags |= Flags::PLACEMENT;
            }
        }
        None
    }

    fn unwind_work(
        &mut self,
        fibers: &mut Fibers,
        wip: FiberId,
        _render_lanes: Lanes,
    ) -> Option<FiberId> {
        let name = fiber_name(fibers, wip);
        self.log.borrow_mut().push(format!("unwind:{name}"));
        let flags = fibers[wip].flags;
        if flags.contains(Flags::SHOULD_CAPTURE) {
            fibers[wip].flags = (flags & !Flags::SHOULD_CAPTURE) | Flags::DID_CAPTURE;
            return Some(wip);
        }
        None
    }

    fn unwind_interrupted_work(&mut self, fibers: &mut Fibers, wip: FiberId) {
        let name = fiber_name(fibers, wip);
        self.log.borrow_mut().push(format!("interrupted:{name}"));
    }

    fn throw_exception(
        &mut self,
        fibers: &mut Fibers,
        _root: RootId,
        return_fiber: Option<FiberId>,
        source: FiberId,
        value: CapturedValue,
        _render_lanes: Lanes,
    ) -> HookResult {
        if self.fatal_on_throw {
            return Err(value);
        }

        let mut node = return_fiber;
        while let Some(fiber) = node {
            let name = fiber_name(fibers, fiber);
            if fibers[fiber].tag == WorkTag::ClassComponent && self.error_boundaries.contains(&name)
            {
                fibers[fiber].flags |= Flags::SHOULD_CAPTURE;
                self.log.borrow_mut().push(format!("captured:{name}"));
                return Ok(());
            }
            node = fibers[fiber].return_fiber;
        }

        // no class boundary: the root renders the failure state
        let mut top = source;
        while let Some(parent) = fibers[top].return_fiber {
            top = parent;
        }
        fibers[top].flags |= Flags::SHOULD_CAPTURE;
        self.log.borrow_mut().push("captured:#root".to_string());
        Ok(())
    }

    fn can_capture_error(&self, fibers: &Fibers, fiber: FiberId) -> bool {
        self.error_boundaries.contains(&fiber_name(fibers, fiber))
    }

    fn capture_error(
        &mut self,
        fibers: &mut Fibers,
        boundary: FiberId,
        error: CapturedValue,
    ) -> HookResult {
        let name = fiber_name(fibers, boundary);
        self.log.borrow_mut().push(format!(
            "commit-captured:{name}:{}",
            error.description.as_deref().unwrap_or("<opaque>")
        ));
        self.boundary_errors.insert(name);
        Ok(())
    }

    fn commit_snapshot(
        &mut self,
        fibers: &Fibers,
        fiber: FiberId,
        _sink: &mut CommitSink,
    ) -> HookResult {
        let name = fiber_name(fibers, fiber);
        self.log.borrow_mut().push(format!("snapshot:{name}"));
        Ok(())
    }

    fn commit_layout_effects(
        &mut self,
        fibers: &mut Fibers,
        fiber: FiberId,
        sink: &mut CommitSink,
    ) -> HookResult {
        let name = fiber_name(fibers, fiber);
        self.log.borrow_mut().push(format!("layout:{name}"));
        if let Some((remaining, lane)) = self.layout_updates.get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                sink.schedule_update(fiber, *lane);
            }
        }
        if let Some(wakeable) = self.retry_wakeables.get(&name) {
            let wakeable: Rc<dyn Wakeable> = wakeable.clone();
            sink.attach_retry(fiber, wakeable);
        }
        Ok(())
    }

    fn commit_attach_ref(
        &mut self,
        fibers: &Fibers,
        fiber: FiberId,
        _sink: &mut CommitSink,
    ) -> HookResult {
        let name = fiber_name(fibers, fiber);
        self.log.borrow_mut().push(format!("attach-ref:{name}"));
        Ok(())
    }

    fn commit_detach_ref(
        &mut self,
        fibers: &Fibers,
        fiber: FiberId,
        _sink: &mut CommitSink,
    ) -> HookResult {
        let name = fiber_name(fibers, fiber);
        self.log.borrow_mut().push(format!("detach-ref:{name}"));
        Ok(())
    }

    fn commit_passive_unmount(
        &mut self,
        fibers: &mut Fibers,
        fiber: FiberId,
        _sink: &mut CommitSink,
    ) -> HookResult {
        let name = fiber_name(fibers, fiber);
        self.log.borrow_mut().push(format!("passive-unmount:{name}"));
        Ok(())
    }

    fn commit_passive_mount(
        &mut self,
        fibers: &mut Fibers,
        fiber: FiberId,
        _sink: &mut CommitSink,
    ) -> HookResult {
        let name = fiber_name(fibers, fiber);
        self.log.borrow_mut().push(format!("passive-mount:{name}"));
        Ok(())
    }
}

/// Host adapter that records every primitive into the shared log.
pub struct RecordingHost {
    pub log: Log,
    pub scheduled_timeouts: Vec<(TimeoutHandle, u64)>,
    pub cancelled_timeouts: Vec<TimeoutHandle>,
    pub fail_commit_work_on: HashSet<String>,
    pub focused: Option<FiberId>,
    next_timeout: u64,
}

impl RecordingHost {
    pub fn new(log: Log) -> Self {
        Self {
            log,
            scheduled_timeouts: Vec::new(),
            cancelled_timeouts: Vec::new(),
            fail_commit_work_on: HashSet::new(),
            focused: None,
            next_timeout: 1,
        }
    }

    pub fn last_timeout(&self) -> Option<(TimeoutHandle, u64)> {
        self.scheduled_timeouts.last().copied()
    }
}

impl HostConfig for RecordingHost {
    fn prepare_for_commit(&mut self) -> Option<FiberId> {
        self.log.borrow_mut().push("prepare-commit".to_string());
        self.focused
    }

    fn reset_after_commit(&mut self) {
        self.log.borrow_mut().push("reset-commit".to_string());
    }

    fn before_active_instance_blur(&mut self) {
        self.log.borrow_mut().push("before-blur".to_string());
    }

    fn after_active_instance_blur(&mut self) {
        self.log.borrow_mut().push("after-blur".to_string());
    }

    fn schedule_timeout(&mut self, ms: u64) -> TimeoutHandle {
        let handle = TimeoutHandle(self.next_timeout);
        self.next_timeout += 1;
        self.scheduled_timeouts.push((handle, ms));
        self.log.borrow_mut().push(format!("timeout:{ms}"));
        handle
    }

    fn cancel_timeout(&mut self, handle: TimeoutHandle) {
        self.cancelled_timeouts.push(handle);
        self.log.borrow_mut().push("cancel-timeout".to_string());
    }

    fn commit_placement(&mut self, fibers: &Fibers, fiber: FiberId) -> HostResult {
        let name = fiber_name(fibers, fiber);
        self.log.borrow_mut().push(format!("place:{name}"));
        Ok(())
    }

    fn commit_work(&mut self, fibers: &Fibers, fiber: FiberId) -> HostResult {
        let name = fiber_name(fibers, fiber);
        if self.fail_commit_work_on.remove(&name) {
            self.log.borrow_mut().push(format!("update-failed:{name}"));
            return Err(CapturedValue::from_message(format!(
                "host mutation failed on {name}"
            )));
        }
        self.log.borrow_mut().push(format!("update:{name}"));
        Ok(())
    }

    fn commit_deletion(&mut self, fibers: &Fibers, fiber: FiberId) -> HostResult {
        let name = fiber_name(fibers, fiber);
        self.log.borrow_mut().push(format!("delete:{name}"));
        Ok(())
    }

    fn commit_hydration(&mut self, fibers: &Fibers, fiber: FiberId) -> HostResult {
        let name = fiber_name(fibers, fiber);
        self.log.borrow_mut().push(format!("hydrate:{name}"));
        Ok(())
    }

    fn reset_text_content(&mut self, fibers: &Fibers, fiber: FiberId) -> HostResult {
        let name = fiber_name(fibers, fiber);
        self.log.borrow_mut().push(format!("reset-text:{name}"));
        Ok(())
    }
}

/// Build a reconciler over the blueprint with a concurrent-mode root.
pub fn build(tree: Vec<NodeSpec>) -> (TestReconciler, RootId, Log) {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let hooks = TestHooks::new(tree, log.clone());
    let host = RecordingHost::new(log.clone());
    let mut reconciler = Reconciler::new(VirtualScheduler::new(), host, hooks);
    // keep the virtual clock away from zero, which doubles as "no timestamp"
    reconciler.advance_time(10);
    let root = reconciler.create_root(FiberMode::BLOCKING | FiberMode::CONCURRENT);
    (reconciler, root, log)
}

/// Initial mount: one Default-lane update on the root, flushed to idle.
pub fn mount(reconciler: &mut TestReconciler, root: RootId) {
    let fiber = reconciler.root_fiber(root);
    let time = reconciler.request_event_time();
    reconciler
        .schedule_update_on_fiber(fiber, Lanes::DEFAULT.highest(), time)
        .expect("mount update");
    reconciler.flush_scheduled_work().expect("mount flush");
}

/// Locate a committed fiber by blueprint name.
pub fn find_fiber(reconciler: &TestReconciler, root: RootId, name: &str) -> FiberId {
    fn walk(fibers: &Fibers, id: FiberId, name: &str) -> Option<FiberId> {
        if fibers[id].key.as_deref() == Some(name) {
            return Some(id);
        }
        let mut child = fibers[id].child;
        while let Some(c) = child {
            if let Some(found) = walk(fibers, c, name) {
                return Some(found);
            }
            child = fibers[c].sibling;
        }
        None
    }
    walk(
        reconciler.fibers(),
        reconciler.root_fiber(root),
        name,
    )
    .unwrap_or_else(|| panic!("no committed fiber named {name}"))
}

/// Schedule an update on a named fiber at `lane` and return the fiber.
pub fn update(reconciler: &mut TestReconciler, root: RootId, name: &str, lane: Lanes) -> FiberId {
    let fiber = find_fiber(reconciler, root, name);
    let time = reconciler.request_event_time();
    reconciler
        .schedule_update_on_fiber(fiber, lane, time)
        .expect("update");
    fiber
}

pub fn transition_config(timeout_ms: u64) -> SuspenseConfig {
    SuspenseConfig::with_timeout(timeout_ms)
}
