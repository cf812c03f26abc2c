//! The lane model: 31 single-bit priority lanes grouped into classes.
//!
//! A lane is one bit; a `Lanes` value is a set of them. Higher-priority
//! classes occupy numerically lower bits, so "highest priority" is always
//! "lowest set bit" and class comparisons are plain integer comparisons.
//! Bits at or above position 31 are deliberately left undefined.
//!
//! `Lanes` stays a raw `u32` newtype rather than a `bitflags` type because
//! lane selection leans on free-form bit tricks (isolate lowest set bit,
//! subtract class masks) that a flags API only gets in the way of.

use crate::fiber::FiberMode;
use crate::scheduler::TaskPriority;
use crate::suspense::SuspenseConfig;

/// Number of defined lanes; sizes the per-lane stamp arrays on a root.
pub const TOTAL_LANES: usize = 31;

/// A set of lanes. A single lane is a `Lanes` value with one bit set.
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Lanes(pub u32);

impl Lanes {
    pub const NONE: Lanes = Lanes(0);

    pub const SYNC: Lanes = Lanes(0x0000_0001);
    pub const SYNC_BATCHED: Lanes = Lanes(0x0000_0002);

    pub const INPUT_DISCRETE_HYDRATION: Lanes = Lanes(0x0000_0004);
    pub const INPUT_DISCRETE: Lanes = Lanes(0x0000_0018);

    pub const INPUT_CONTINUOUS_HYDRATION: Lanes = Lanes(0x0000_0020);
    pub const INPUT_CONTINUOUS: Lanes = Lanes(0x0000_00c0);

    pub const DEFAULT_HYDRATION: Lanes = Lanes(0x0000_0100);
    pub const DEFAULT: Lanes = Lanes(0x0000_0e00);

    pub const TRANSITION_HYDRATION: Lanes = Lanes(0x0000_1000);
    pub const TRANSITION_SHORT: Lanes = Lanes(0x0007_e000);
    pub const TRANSITION_LONG: Lanes = Lanes(0x00f8_0000);

    pub const RETRY: Lanes = Lanes(0x0700_0000);

    pub const SELECTIVE_HYDRATION: Lanes = Lanes(0x0800_0000);
    pub const IDLE_HYDRATION: Lanes = Lanes(0x1000_0000);
    pub const IDLE: Lanes = Lanes(0x2000_0000);
    pub const OFFSCREEN: Lanes = Lanes(0x4000_0000);

    pub const NON_IDLE: Lanes = Lanes(0x0fff_ffff);
    pub const ALL: Lanes = Lanes(0x7fff_ffff);

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub const fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Any overlap with `other`.
    pub const fn intersects(self, other: Lanes) -> bool {
        self.0 & other.0 != 0
    }

    /// Superset test.
    pub const fn contains(self, other: Lanes) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: Lanes) -> Lanes {
        Lanes(self.0 & !other.0)
    }

    /// The single highest-priority lane in the set.
    pub const fn highest(self) -> Lanes {
        Lanes(self.0 & self.0.wrapping_neg())
    }

    /// Bit position of the highest-priority lane, for the per-lane
    /// event/expiration stamp arrays. Meaningless on an empty set.
    pub const fn index(self) -> usize {
        self.0.trailing_zeros() as usize
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn each_lane(self) -> impl Iterator<Item = Lanes> {
        let mut rest = self.0;
        std::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let bit = rest & rest.wrapping_neg();
            rest &= !bit;
            Some(Lanes(bit))
        })
    }
}

impl std::ops::BitOr for Lanes {
    type Output = Lanes;
    fn bitor(self, rhs: Lanes) -> Lanes {
        Lanes(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Lanes {
    fn bitor_assign(&mut self, rhs: Lanes) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for Lanes {
    type Output = Lanes;
    fn bitand(self, rhs: Lanes) -> Lanes {
        Lanes(self.0 & rhs.0)
    }
}

impl std::ops::BitAndAssign for Lanes {
    fn bitand_assign(&mut self, rhs: Lanes) {
        self.0 &= rhs.0;
    }
}

impl std::ops::Not for Lanes {
    type Output = Lanes;
    fn not(self) -> Lanes {
        Lanes(!self.0 & Lanes::ALL.0)
    }
}

impl std::fmt::Debug for Lanes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lanes({:#010x})", self.0)
    }
}

/// Priority classes, one per contiguous lane group. Ordered so that a larger
/// discriminant is more urgent.
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LanePriority {
    NoLane = 0,
    Offscreen,
    Idle,
    IdleHydration,
    SelectiveHydration,
    Retry,
    TransitionLong,
    TransitionShort,
    TransitionHydration,
    Default,
    DefaultHydration,
    InputContinuous,
    InputContinuousHydration,
    InputDiscrete,
    InputDiscreteHydration,
    SyncBatched,
    Sync,
}

/// Class masks from most to least urgent.
const LANE_CLASSES: [(Lanes, LanePriority); 16] = [
    (Lanes::SYNC, LanePriority::Sync),
    (Lanes::SYNC_BATCHED, LanePriority::SyncBatched),
    (
        Lanes::INPUT_DISCRETE_HYDRATION,
        LanePriority::InputDiscreteHydration,
    ),
    (Lanes::INPUT_DISCRETE, LanePriority::InputDiscrete),
    (
        Lanes::INPUT_CONTINUOUS_HYDRATION,
        LanePriority::InputContinuousHydration,
    ),
    (Lanes::INPUT_CONTINUOUS, LanePriority::InputContinuous),
    (Lanes::DEFAULT_HYDRATION, LanePriority::DefaultHydration),
    (Lanes::DEFAULT, LanePriority::Default),
    (
        Lanes::TRANSITION_HYDRATION,
        LanePriority::TransitionHydration,
    ),
    (Lanes::TRANSITION_SHORT, LanePriority::TransitionShort),
    (Lanes::TRANSITION_LONG, LanePriority::TransitionLong),
    (Lanes::RETRY, LanePriority::Retry),
    (
        Lanes::SELECTIVE_HYDRATION,
        LanePriority::SelectiveHydration,
    ),
    (Lanes::IDLE_HYDRATION, LanePriority::IdleHydration),
    (Lanes::IDLE, LanePriority::Idle),
    (Lanes::OFFSCREEN, LanePriority::Offscreen),
];

/// Isolate the most urgent non-empty class of `lanes`, returning the class
/// members present and the class priority.
pub fn highest_priority_lanes(lanes: Lanes) -> (Lanes, LanePriority) {
    for (mask, priority) in LANE_CLASSES {
        let hit = lanes & mask;
        if hit.is_some() {
            return (hit, priority);
        }
    }
    (Lanes::NONE, LanePriority::NoLane)
}

pub fn highest_lane_priority(lanes: Lanes) -> LanePriority {
    highest_priority_lanes(lanes).1
}

/// Translate a lane class to the scheduler priority its task binds at.
pub fn lane_priority_to_task_priority(priority: LanePriority) -> TaskPriority {
    use LanePriority::*;
    match priority {
        Sync | SyncBatched => TaskPriority::Immediate,
        InputDiscreteHydration | InputDiscrete | InputContinuousHydration | InputContinuous => {
            TaskPriority::UserBlocking
        }
        DefaultHydration | Default | TransitionHydration | TransitionShort | TransitionLong
        | Retry | SelectiveHydration => TaskPriority::Normal,
        IdleHydration | Idle | Offscreen => TaskPriority::Idle,
        NoLane => TaskPriority::Normal,
    }
}

fn task_priority_to_lane_priority(priority: TaskPriority) -> LanePriority {
    match priority {
        TaskPriority::Immediate => LanePriority::Sync,
        TaskPriority::UserBlocking => LanePriority::InputContinuous,
        TaskPriority::Normal | TaskPriority::Low => LanePriority::Default,
        TaskPriority::Idle => LanePriority::Idle,
    }
}

/// Lowest free bit of `class` outside `occupied`, if any.
fn pick_free_lane(class: Lanes, occupied: Lanes) -> Option<Lanes> {
    let free = class.without(occupied);
    free.is_some().then(|| free.highest())
}

/// Allocate a lane in `priority`'s class, avoiding lanes currently being
/// rendered. Falls through to the next-lower input class before coalescing.
fn find_update_lane(priority: LanePriority, wip_lanes: Lanes) -> Lanes {
    match priority {
        LanePriority::Sync => Lanes::SYNC,
        LanePriority::SyncBatched => Lanes::SYNC_BATCHED,
        LanePriority::InputDiscrete => pick_free_lane(Lanes::INPUT_DISCRETE, wip_lanes)
            .unwrap_or_else(|| find_update_lane(LanePriority::InputContinuous, wip_lanes)),
        LanePriority::InputContinuous => pick_free_lane(Lanes::INPUT_CONTINUOUS, wip_lanes)
            .unwrap_or_else(|| find_update_lane(LanePriority::Default, wip_lanes)),
        LanePriority::Default => pick_free_lane(Lanes::DEFAULT, wip_lanes)
            .or_else(|| {
                pick_free_lane(
                    Lanes::TRANSITION_SHORT | Lanes::TRANSITION_LONG,
                    wip_lanes,
                )
            })
            .unwrap_or_else(|| Lanes::DEFAULT.highest()),
        LanePriority::Idle => {
            pick_free_lane(Lanes::IDLE, wip_lanes).unwrap_or_else(|| Lanes::IDLE.highest())
        }
        _ => Lanes::DEFAULT.highest(),
    }
}

/// Allocate a transition lane, distributing the updates of one batch across
/// distinct bits. Avoids lanes being rendered *and* lanes still pending on
/// the most recently updated root; when the whole class is occupied, the
/// lowest bit is reused so the entangled updates coalesce.
fn find_transition_lane(class: Lanes, wip_lanes: Lanes, pending_lanes: Lanes) -> Lanes {
    pick_free_lane(class, wip_lanes | pending_lanes)
        .or_else(|| pick_free_lane(class, wip_lanes))
        .unwrap_or_else(|| class.highest())
}

/// Choose the lane for a new update (spec of `requestUpdateLane`).
///
/// `wip_lanes` are the lanes currently being rendered this event;
/// `pending_lanes` are those still pending on the last root that received an
/// update this event. Both are only consulted for distribution.
pub fn request_update_lane(
    mode: FiberMode,
    transition: Option<&SuspenseConfig>,
    current_priority: TaskPriority,
    in_discrete_event: bool,
    wip_lanes: Lanes,
    pending_lanes: Lanes,
) -> Lanes {
    if !mode.contains(FiberMode::BLOCKING) {
        // legacy trees commit in the same tick, always
        return Lanes::SYNC;
    }
    if !mode.contains(FiberMode::CONCURRENT) {
        return if current_priority == TaskPriority::Immediate {
            Lanes::SYNC
        } else {
            Lanes::SYNC_BATCHED
        };
    }
    if let Some(config) = transition {
        let class = if config.timeout_ms < 10_000 {
            Lanes::TRANSITION_SHORT
        } else {
            Lanes::TRANSITION_LONG
        };
        return find_transition_lane(class, wip_lanes, pending_lanes);
    }
    if in_discrete_event && current_priority == TaskPriority::UserBlocking {
        return find_update_lane(LanePriority::InputDiscrete, wip_lanes);
    }
    find_update_lane(task_priority_to_lane_priority(current_priority), wip_lanes)
}

/// How long a lane may sit pending before it is force-expired to sync.
pub fn lane_expiration_ms(lane: Lanes) -> Option<u64> {
    let (_, priority) = highest_priority_lanes(lane);
    use LanePriority::*;
    match priority {
        Sync | SyncBatched | InputDiscreteHydration | InputDiscrete => Some(250),
        InputContinuousHydration | InputContinuous | DefaultHydration | Default => Some(5_000),
        TransitionHydration | TransitionShort | TransitionLong | Retry => Some(10_000),
        // hydration-at-leisure and idle work never expires
        SelectiveHydration | IdleHydration | Idle | Offscreen | NoLane => None,
    }
}
