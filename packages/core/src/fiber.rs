//! The fiber tree and its double-buffered arena.
//!
//! Fibers are arena allocated in a [`Slab`] so additions, removals, and
//! cross-references are cheap to work with. Every tree link (`return`,
//! `child`, `sibling`, `alternate`, the effect list) is a plain [`FiberId`]
//! index into the arena, which keeps the otherwise-cyclic graph free of
//! reference counting. An id is unique across the arena but not across time:
//! once a fiber is released its slot is reused.

use std::any::{Any, TypeId};
use std::fmt::Display;
use std::rc::Rc;

use bitflags::bitflags;
use slab::Slab;

use crate::lanes::Lanes;
use crate::root::RootId;

/// A fiber's index in the arena.
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub usize);

impl Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of node a fiber is. Begin/complete dispatch per tag lives in the
/// render-hooks layer; the core only branches on the handful of structural
/// tags (`HostRoot`, `SuspenseBoundary`, `ClassComponent`).
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkTag {
    HostRoot,
    FunctionComponent,
    ClassComponent,
    HostComponent,
    HostText,
    Fragment,
    SuspenseBoundary,
    SuspenseList,
    Offscreen,
    ForwardRef,
    Memo,
    Block,
}

bitflags! {
    /// Side-effect tags accumulated on a fiber during render and consumed by
    /// the commit phases.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u32 {
        const NONE           = 0;
        /// The fiber did meaningful render work (kept out of the effect list).
        const PERFORMED_WORK = 1 << 0;
        const PLACEMENT      = 1 << 1;
        const UPDATE         = 1 << 2;
        const DELETION       = 1 << 3;
        const CONTENT_RESET  = 1 << 4;
        const CALLBACK       = 1 << 5;
        const DID_CAPTURE    = 1 << 6;
        const REF            = 1 << 7;
        const SNAPSHOT       = 1 << 8;
        const PASSIVE        = 1 << 9;
        const HYDRATING      = 1 << 10;
        /// The fiber threw; completion must take the unwind path.
        const INCOMPLETE     = 1 << 11;
        /// A boundary below wants to capture the in-flight throw.
        const SHOULD_CAPTURE = 1 << 12;

        /// Everything the mutation/layout phases understand. A boundary that
        /// captures during unwind is masked down to these bits.
        const HOST_EFFECT_MASK = Self::PLACEMENT.bits()
            | Self::UPDATE.bits()
            | Self::DELETION.bits()
            | Self::CONTENT_RESET.bits()
            | Self::CALLBACK.bits()
            | Self::DID_CAPTURE.bits()
            | Self::REF.bits()
            | Self::SNAPSHOT.bits()
            | Self::PASSIVE.bits()
            | Self::HYDRATING.bits();
    }
}

bitflags! {
    /// Rendering modes inherited down the tree at fiber creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FiberMode: u8 {
        /// Legacy mode when unset: every update is synchronous.
        const BLOCKING   = 1 << 0;
        const CONCURRENT = 1 << 1;
        const STRICT     = 1 << 2;
        const PROFILE    = 1 << 3;
    }
}

/// The host-side payload of a fiber.
#[derive(Clone)]
pub enum StateNode {
    None,
    /// HostRoot fibers point back at their [`crate::FiberRoot`].
    Root(RootId),
    /// A host instance (or any bookkeeping payload the hooks layer wants).
    Instance(Rc<dyn Any>),
}

impl StateNode {
    pub fn root(&self) -> Option<RootId> {
        match self {
            StateNode::Root(id) => Some(*id),
            _ => None,
        }
    }
}

impl std::fmt::Debug for StateNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateNode::None => write!(f, "None"),
            StateNode::Root(id) => write!(f, "Root({id:?})"),
            StateNode::Instance(_) => write!(f, "Instance(..)"),
        }
    }
}

/// A node of the reconciliation tree.
///
/// Props, state, and the update queue are opaque `Rc<dyn Any>` payloads owned
/// by the render-hooks layer; the core only moves them between buffers.
pub struct Fiber {
    pub tag: WorkTag,
    pub key: Option<Rc<str>>,
    pub element_type: Option<TypeId>,
    pub mode: FiberMode,

    // tree links
    pub return_fiber: Option<FiberId>,
    pub child: Option<FiberId>,
    pub sibling: Option<FiberId>,
    /// The paired fiber in the other buffer. `None` until the node has
    /// rendered at least twice.
    pub alternate: Option<FiberId>,

    // priority bookkeeping
    /// Lanes on which this fiber itself has pending work.
    pub lanes: Lanes,
    /// Union of `lanes | child_lanes` over all descendants.
    pub child_lanes: Lanes,

    // effects
    pub flags: Flags,
    pub first_effect: Option<FiberId>,
    pub last_effect: Option<FiberId>,
    pub next_effect: Option<FiberId>,

    // component payloads (opaque to the core)
    pub pending_props: Option<Rc<dyn Any>>,
    pub memoized_props: Option<Rc<dyn Any>>,
    pub memoized_state: Option<Rc<dyn Any>>,
    pub update_queue: Option<Rc<dyn Any>>,

    pub state_node: StateNode,

    /// Profile-mode render duration. Carried but only stamped when the
    /// PROFILE bit is set on `mode`.
    pub actual_duration: f64,
}

impl Fiber {
    fn new(tag: WorkTag, mode: FiberMode, key: Option<Rc<str>>) -> Self {
        Self {
            tag,
            key,
            element_type: None,
            mode,
            return_fiber: None,
            child: None,
            sibling: None,
            alternate: None,
            lanes: Lanes::NONE,
            child_lanes: Lanes::NONE,
            flags: Flags::NONE,
            first_effect: None,
            last_effect: None,
            next_effect: None,
            pending_props: None,
            memoized_props: None,
            memoized_state: None,
            update_queue: None,
            state_node: StateNode::None,
            actual_duration: 0.0,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        self.flags.contains(Flags::INCOMPLETE)
    }

    /// Whether the fiber earns a spot on the effect list.
    pub fn has_commit_effects(&self) -> bool {
        self.flags.bits() > Flags::PERFORMED_WORK.bits()
    }
}

/// The fiber arena. One per [`crate::Reconciler`], shared by every root.
#[derive(Default)]
pub struct Fibers {
    inner: Slab<Fiber>,
}

impl Fibers {
    pub fn new() -> Self {
        Self {
            inner: Slab::with_capacity(128),
        }
    }

    pub fn create_fiber(
        &mut self,
        tag: WorkTag,
        mode: FiberMode,
        key: Option<Rc<str>>,
        pending_props: Option<Rc<dyn Any>>,
    ) -> FiberId {
        let mut fiber = Fiber::new(tag, mode, key);
        fiber.pending_props = pending_props;
        FiberId(self.inner.insert(fiber))
    }

    pub fn get(&self, id: FiberId) -> Option<&Fiber> {
        self.inner.get(id.0)
    }

    pub fn get_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        self.inner.get_mut(id.0)
    }

    pub fn contains(&self, id: FiberId) -> bool {
        self.inner.contains(id.0)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Release a fiber's slot. The caller is responsible for having unlinked
    /// it from both buffers and any effect list first.
    pub fn release(&mut self, id: FiberId) -> Option<Fiber> {
        if let Some(alt) = self.inner.get(id.0).and_then(|f| f.alternate) {
            if let Some(other) = self.inner.get_mut(alt.0) {
                other.alternate = None;
            }
        }
        self.inner.try_remove(id.0)
    }

    /// Prepare (or reuse) `current`'s alternate as this render's
    /// work-in-progress fiber.
    ///
    /// `current` itself is never mutated during render; only the alternate
    /// this returns.
    pub fn create_work_in_progress(
        &mut self,
        current: FiberId,
        pending_props: Option<Rc<dyn Any>>,
    ) -> FiberId {
        let wip = match self[current].alternate {
            None => {
                let cur = &self.inner[current.0];
                let mut fiber = Fiber::new(cur.tag, cur.mode, cur.key.clone());
                fiber.element_type = cur.element_type;
                fiber.state_node = cur.state_node.clone();
                let wip = FiberId(self.inner.insert(fiber));
                self[wip].alternate = Some(current);
                self[current].alternate = Some(wip);
                wip
            }
            Some(wip) => {
                let fiber = &mut self[wip];
                fiber.flags = Flags::NONE;
                fiber.next_effect = None;
                fiber.first_effect = None;
                fiber.last_effect = None;
                fiber.actual_duration = 0.0;
                wip
            }
        };

        let (lanes, child_lanes, child, sibling, props, state, queue, ty, key, state_node) = {
            let cur = &self[current];
            (
                cur.lanes,
                cur.child_lanes,
                cur.child,
                cur.sibling,
                cur.memoized_props.clone(),
                cur.memoized_state.clone(),
                cur.update_queue.clone(),
                cur.element_type,
                cur.key.clone(),
                cur.state_node.clone(),
            )
        };

        let fiber = &mut self[wip];
        fiber.pending_props = pending_props;
        fiber.lanes = lanes;
        fiber.child_lanes = child_lanes;
        fiber.child = child;
        fiber.sibling = sibling;
        fiber.memoized_props = props;
        fiber.memoized_state = state;
        fiber.update_queue = queue;
        fiber.element_type = ty;
        fiber.key = key;
        fiber.state_node = state_node;
        wip
    }

    /// Walk from `fiber` to its HostRoot, merging `lane` into the source
    /// fiber's own lanes and into `child_lanes` (and each alternate's) along
    /// the way. Returns the owning root, or `None` for a detached subtree.
    pub fn mark_update_lane_from_fiber_to_root(
        &mut self,
        fiber: FiberId,
        lane: Lanes,
    ) -> Option<RootId> {
        {
            let f = self.get_mut(fiber)?;
            f.lanes |= lane;
            let alternate = f.alternate;
            if let Some(alt) = alternate {
                self[alt].lanes |= lane;
            }
        }

        let mut node = fiber;
        while let Some(parent) = self[node].return_fiber {
            let p = &mut self[parent];
            p.child_lanes |= lane;
            let alternate = p.alternate;
            if let Some(alt) = alternate {
                self[alt].child_lanes |= lane;
            }
            node = parent;
        }

        let root_fiber = &self[node];
        if root_fiber.tag == WorkTag::HostRoot {
            root_fiber.state_node.root()
        } else {
            None
        }
    }

    /// Flag `child` for deletion and thread it onto `return_fiber`'s effect
    /// list. Reconciliation records deletions eagerly, so they precede the
    /// subtree's other effects in commit order.
    pub fn record_deletion(&mut self, return_fiber: FiberId, child: FiberId) {
        self[child].flags |= Flags::DELETION;
        self[child].next_effect = None;
        match self[return_fiber].last_effect {
            Some(last) => {
                self[last].next_effect = Some(child);
            }
            None => {
                self[return_fiber].first_effect = Some(child);
            }
        }
        self[return_fiber].last_effect = Some(child);
    }

    /// Re-derive `child_lanes` for a just-completed fiber as the union of
    /// `lanes | child_lanes` over its children.
    pub fn bubble_child_lanes(&mut self, fiber: FiberId) {
        let mut summary = Lanes::NONE;
        let mut child = self[fiber].child;
        while let Some(c) = child {
            let f = &self[c];
            summary |= f.lanes | f.child_lanes;
            child = f.sibling;
        }
        self[fiber].child_lanes = summary;
    }
}

impl std::ops::Index<FiberId> for Fibers {
    type Output = Fiber;

    fn index(&self, id: FiberId) -> &Fiber {
        &self.inner[id.0]
    }
}

impl std::ops::IndexMut<FiberId> for Fibers {
    fn index_mut(&mut self, id: FiberId) -> &mut Fiber {
        &mut self.inner[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_work_in_progress_pairs_alternates() {
        let mut fibers = Fibers::new();
        let current = fibers.create_fiber(WorkTag::HostRoot, FiberMode::CONCURRENT, None, None);
        let wip = fibers.create_work_in_progress(current, None);

        assert_ne!(current, wip);
        assert_eq!(fibers[current].alternate, Some(wip));
        assert_eq!(fibers[wip].alternate, Some(current));
    }

    #[test]
    fn reused_work_in_progress_resets_effect_state() {
        let mut fibers = Fibers::new();
        let current = fibers.create_fiber(WorkTag::HostComponent, FiberMode::CONCURRENT, None, None);
        let wip = fibers.create_work_in_progress(current, None);

        fibers[wip].flags = Flags::PLACEMENT | Flags::UPDATE;
        fibers[wip].next_effect = Some(current);
        fibers[wip].actual_duration = 12.0;

        let again = fibers.create_work_in_progress(current, None);
        assert_eq!(again, wip);
        assert_eq!(fibers[wip].flags, Flags::NONE);
        assert_eq!(fibers[wip].next_effect, None);
        assert_eq!(fibers[wip].first_effect, None);
        assert_eq!(fibers[wip].actual_duration, 0.0);
    }

    #[test]
    fn marking_an_update_bubbles_child_lanes() {
        let mut fibers = Fibers::new();
        let root = fibers.create_fiber(WorkTag::HostRoot, FiberMode::CONCURRENT, None, None);
        fibers[root].state_node = StateNode::Root(RootId(0));
        let parent = fibers.create_fiber(WorkTag::HostComponent, FiberMode::CONCURRENT, None, None);
        let leaf = fibers.create_fiber(WorkTag::HostText, FiberMode::CONCURRENT, None, None);
        fibers[root].child = Some(parent);
        fibers[parent].return_fiber = Some(root);
        fibers[parent].child = Some(leaf);
        fibers[leaf].return_fiber = Some(parent);

        let lane = Lanes::SYNC;
        let found = fibers.mark_update_lane_from_fiber_to_root(leaf, lane);

        assert_eq!(found, Some(RootId(0)));
        assert!(fibers[leaf].lanes.contains(lane));
        assert!(fibers[parent].child_lanes.contains(lane));
        assert!(fibers[root].child_lanes.contains(lane));
    }

    #[test]
    fn bubbled_child_lanes_cover_all_children() {
        let mut fibers = Fibers::new();
        let parent = fibers.create_fiber(WorkTag::HostComponent, FiberMode::CONCURRENT, None, None);
        let a = fibers.create_fiber(WorkTag::HostText, FiberMode::CONCURRENT, None, None);
        let b = fibers.create_fiber(WorkTag::HostText, FiberMode::CONCURRENT, None, None);
        fibers[parent].child = Some(a);
        fibers[a].sibling = Some(b);
        fibers[a].lanes = Lanes::SYNC;
        fibers[b].child_lanes = Lanes::DEFAULT;

        fibers.bubble_child_lanes(parent);
        assert_eq!(fibers[parent].child_lanes, Lanes::SYNC | Lanes::DEFAULT);
    }
}
