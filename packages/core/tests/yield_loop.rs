//! Cooperative yielding and starvation expiry.

mod common;

use common::*;
use weft_core::{Flags, Lanes};

#[test]
fn yield_pauses_the_walk_and_resumes_without_reentry() {
    let (mut reconciler, root, log) = build(vec![
        host("a").flags(Flags::UPDATE),
        host("b").flags(Flags::UPDATE),
        host("c").flags(Flags::UPDATE),
    ]);
    mount(&mut reconciler, root);
    log.borrow_mut().clear();

    update(&mut reconciler, root, "a", Lanes::DEFAULT.highest());

    // allow two units of work (the root and "a"), then demand the thread back
    reconciler.scheduler().set_yield_after(2);
    reconciler.tick().unwrap();

    // paused exactly where the walk stopped: "b" is next
    let paused_at = reconciler.work_in_progress().expect("render paused");
    assert_eq!(reconciler.fibers()[paused_at].key.as_deref(), Some("b"));
    assert_eq!(count_logged(&log, "begin:#root"), 1);
    assert_eq!(count_logged(&log, "begin:a"), 1);
    assert_eq!(count_logged(&log, "begin:b"), 0);
    // nothing committed yet
    assert_eq!(count_logged(&log, "update:a"), 0);

    // the continuation picks up from "b" without re-entering completed work
    reconciler.scheduler().clear_yield();
    reconciler.flush_scheduled_work().unwrap();

    assert_eq!(count_logged(&log, "begin:#root"), 1);
    assert_eq!(count_logged(&log, "begin:a"), 1);
    assert_eq!(count_logged(&log, "begin:b"), 1);
    assert_eq!(count_logged(&log, "begin:c"), 1);
    assert_eq!(count_logged(&log, "update:a"), 1);
    assert!(reconciler.root(root).pending_lanes().is_none());
}

#[test]
fn starved_render_downgrades_to_sync() {
    let (mut reconciler, root, log) = build(vec![host("a").flags(Flags::UPDATE)]);
    mount(&mut reconciler, root);
    log.borrow_mut().clear();

    update(&mut reconciler, root, "a", Lanes::DEFAULT.highest());

    // a scheduler that never grants time: the render yields immediately
    reconciler.scheduler().set_yield_after(0);
    reconciler.tick().unwrap();
    assert!(reconciler.work_in_progress().is_some());
    assert_eq!(count_logged(&log, "update:a"), 0);

    // once the lane starves past its deadline the next turn renders
    // synchronously, ignoring the scheduler's yield demands entirely
    reconciler.advance_time(5_001);
    reconciler.tick().unwrap();

    assert_eq!(count_logged(&log, "update:a"), 1);
    assert!(reconciler.root(root).pending_lanes().is_none());
}

#[test]
fn higher_priority_update_discards_an_in_flight_render() {
    let (mut reconciler, root, log) = build(vec![
        host("a").flags(Flags::UPDATE),
        host("b").flags(Flags::UPDATE),
    ]);
    mount(&mut reconciler, root);
    log.borrow_mut().clear();

    update(&mut reconciler, root, "a", Lanes::DEFAULT.highest());

    // pause mid-render, before "b" has been visited
    reconciler.scheduler().set_yield_after(2);
    reconciler.tick().unwrap();
    assert!(reconciler.work_in_progress().is_some());
    reconciler.scheduler().clear_yield();

    // urgent work lands: the paused default render is abandoned and the
    // discrete lanes render (and commit) first
    update(&mut reconciler, root, "b", Lanes(0x10));
    reconciler.tick().unwrap();
    assert!(reconciler.last_committed_lanes().contains(Lanes(0x10)));
    assert!(reconciler
        .root(root)
        .pending_lanes()
        .contains(Lanes::DEFAULT.highest()));

    reconciler.flush_scheduled_work().unwrap();
    assert!(reconciler.root(root).pending_lanes().is_none());
}
