//! Commit-phase error capture and the passive-effects pipeline.

mod common;

use common::*;
use weft_core::{Flags, Lanes};

#[test]
fn mutation_failure_is_captured_and_the_commit_continues() {
    let (mut reconciler, root, log) = build(vec![class("b")
        .child(host("d").flags(Flags::UPDATE))
        .child(host("e").flags(Flags::UPDATE))
        .child(host("f").flags(Flags::UPDATE))]);
    reconciler.hooks_mut().error_boundary("b");
    mount(&mut reconciler, root);
    log.borrow_mut().clear();

    // the host will refuse to mutate "e" during the next commit
    reconciler
        .host_mut()
        .fail_commit_work_on
        .insert("e".to_string());

    update(&mut reconciler, root, "b", Lanes::SYNC);

    let lines = logged(&log);
    let pos = |needle: &str| {
        lines
            .iter()
            .position(|l| l.starts_with(needle))
            .unwrap_or_else(|| panic!("missing {needle}"))
    };

    // the failure was attributed, and the effects after it still applied
    assert!(log_contains(&log, "update:d"));
    assert!(log_contains(&log, "update-failed:e"));
    assert!(log_contains(&log, "update:f"));
    assert!(pos("update-failed:e") < pos("update:f"));

    // the nearest class boundary received a Sync-lane error update, and the
    // follow-up render showed its degraded UI
    assert!(pos("update-failed:e") < pos("commit-captured:b"));
    assert!(pos("commit-captured:b") < pos("error-ui:b"));

    // the error UI dropped the children, which commit as deletions
    assert!(log_contains(&log, "delete:d"));
    assert!(log_contains(&log, "delete:e"));
    assert!(log_contains(&log, "delete:f"));
    assert!(reconciler.root(root).pending_lanes().is_none());
}

#[test]
fn commit_errors_without_a_boundary_land_on_the_root() {
    let (mut reconciler, root, log) = build(vec![host("x").flags(Flags::UPDATE)]);
    mount(&mut reconciler, root);
    log.borrow_mut().clear();

    reconciler
        .host_mut()
        .fail_commit_work_on
        .insert("x".to_string());
    update(&mut reconciler, root, "x", Lanes::SYNC);

    assert!(log_contains(&log, "commit-captured:#root:host mutation failed on x"));
    assert!(log_contains(&log, "error-ui:#root"));
    assert!(reconciler.root(root).pending_lanes().is_none());
}

#[test]
fn render_errors_unwind_to_the_nearest_boundary() {
    let (mut reconciler, root, log) = build(vec![
        class("b").child(host("inner").flags(Flags::UPDATE)),
        host("outer").flags(Flags::UPDATE),
    ]);
    reconciler.hooks_mut().error_boundary("b");
    mount(&mut reconciler, root);
    log.borrow_mut().clear();

    reconciler.hooks_mut().error_times("inner", 1);
    update(&mut reconciler, root, "inner", Lanes::DEFAULT.highest());
    reconciler.flush_scheduled_work().unwrap();

    // the boundary captured and rendered its error UI; its sibling subtree
    // was untouched by the failure
    assert!(log_contains(&log, "error:inner"));
    assert!(log_contains(&log, "captured:b"));
    assert!(log_contains(&log, "error-ui:b"));
    assert!(log_contains(&log, "update:outer"));
    assert!(reconciler.root(root).pending_lanes().is_none());
}

#[test]
fn passive_effects_run_destroys_before_creates_after_paint() {
    let (mut reconciler, root, log) = build(vec![
        host("p").flags(Flags::UPDATE | Flags::PASSIVE),
        host("q").flags(Flags::UPDATE | Flags::PASSIVE),
    ]);
    mount(&mut reconciler, root);

    let lines = logged(&log);
    let pos = |needle: &str| lines.iter().position(|l| l == needle).unwrap();

    // commit finished (host reset) before any passive effect ran
    assert!(pos("reset-commit") < pos("passive-unmount:p"));
    // all destroys precede all creates, both in queued order
    assert!(pos("passive-unmount:p") < pos("passive-unmount:q"));
    assert!(pos("passive-unmount:q") < pos("passive-mount:p"));
    assert!(pos("passive-mount:p") < pos("passive-mount:q"));
}

#[test]
fn flush_passive_effects_runs_pending_work_eagerly() {
    let (mut reconciler, root, log) = build(vec![host("p").flags(Flags::UPDATE | Flags::PASSIVE)]);

    // mount without draining the scheduled passive task
    let fiber = reconciler.root_fiber(root);
    let time = reconciler.request_event_time();
    reconciler
        .schedule_update_on_fiber(fiber, Lanes::DEFAULT.highest(), time)
        .unwrap();
    reconciler.tick().unwrap();

    assert!(!log_contains(&log, "passive-mount:p"));
    let flushed = reconciler.flush_passive_effects().unwrap();
    assert!(flushed);
    assert!(log_contains(&log, "passive-mount:p"));

    // the scheduled flush task is now a no-op
    reconciler.flush_scheduled_work().unwrap();
    assert_eq!(count_logged(&log, "passive-mount:p"), 1);
}
