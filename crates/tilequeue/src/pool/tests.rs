use super::*;
use core::time::Duration;
use std::collections::BTreeMap;

fn serving_pool(size: usize) -> PoolState {
    let mut pool = PoolState::new(size);
    for (pid, id) in (100..).zip(pool.fill()) {
        assert!(pool.on_report(id, &WorkerReport::Serving { pid }));
    }
    pool
}

#[test]
fn fill_allocates_up_to_size() {
    let mut pool = PoolState::new(3);
    let ids = pool.fill();
    assert_eq!(ids.len(), 3);
    assert_eq!(pool.count(WorkerState::Starting), 3);
    assert!(pool.fill().is_empty());
}

#[test]
fn crash_spawns_exactly_one_replacement() {
    let mut pool = serving_pool(4);
    let victim = pool.slots().nth(2).unwrap().id;

    let (slot, action) = pool.on_exit(victim).unwrap();
    assert_eq!(slot.state, WorkerState::Terminated);
    let ExitAction::Respawn(replacement) = action else {
        panic!("expected respawn, got {action:?}");
    };
    assert_ne!(replacement, victim);
    assert_eq!(pool.len(), 4);
    assert_eq!(pool.count(WorkerState::Serving), 3);
    assert_eq!(pool.count(WorkerState::Starting), 1);

    // Other workers were not touched.
    assert!(
        pool.slots()
            .filter(|s| s.id != replacement)
            .all(|s| s.state == WorkerState::Serving)
    );
    // A duplicate exit notification does nothing.
    assert!(pool.on_exit(victim).is_none());
    assert_eq!(pool.len(), 4);
}

#[test]
fn shutdown_stops_everyone_and_never_respawns() {
    let mut pool = serving_pool(3);
    let stopped = pool.begin_shutdown();
    assert_eq!(stopped.len(), 3);
    assert_eq!(pool.count(WorkerState::Draining), 3);
    assert!(pool.fill().is_empty());

    let mut remaining = Vec::new();
    for id in stopped {
        match pool.on_exit(id).unwrap().1 {
            ExitAction::Drained { remaining: r } => remaining.push(r),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(remaining, [2, 1, 0]);
    assert!(pool.is_empty());
}

#[test]
fn self_recycling_worker_reports_draining() {
    let mut pool = serving_pool(2);
    let id = pool.slots().next().unwrap().id;
    assert!(pool.on_report(
        id,
        &WorkerReport::Draining {
            reason: DrainReason::MaxRequests,
            served: 1000,
        }
    ));
    let slot = pool.get(id).unwrap();
    assert_eq!(slot.state, WorkerState::Draining);
    assert_eq!(slot.served, 1000);
    // A draining worker never goes back to serving.
    assert!(!pool.on_report(id, &WorkerReport::Serving { pid: 1 }));
}

#[test]
fn request_stop_is_one_shot() {
    let mut pool = serving_pool(1);
    let id = pool.slots().next().unwrap().id;
    assert!(pool.request_stop(id));
    assert!(!pool.request_stop(id));
    pool.on_exit(id);
    assert!(!pool.request_stop(id));
}

#[test]
fn state_transitions() {
    use WorkerState::*;
    assert!(Starting.can_become(Serving));
    assert!(Serving.can_become(Draining));
    assert!(Draining.can_become(Terminated));
    assert!(!Draining.can_become(Serving));
    assert!(!Terminated.can_become(Starting));
}

#[test]
fn rolling_plan_staggers_active_workers() {
    let mut pool = serving_pool(3);
    let draining = pool.slots().next().unwrap().id;
    pool.request_stop(draining);

    let stagger = Duration::from_secs(3);
    let plan = pool.rolling_plan(stagger);
    assert_eq!(plan.len(), 2);
    assert_eq!(plan[0].0, Duration::ZERO);
    assert_eq!(plan[1].0, stagger);
    assert!(plan.iter().all(|(_, id)| *id != draining));
}

/// Replays a rolling restart against a simulated clock and checks that at
/// no point fewer than `N - 1` workers are serving.
#[test]
fn rolling_restart_keeps_n_minus_one_serving() {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Event {
        Stop(WorkerId),
        Exit(WorkerId),
        Ready(WorkerId),
    }

    const N: usize = 5;
    let drain = Duration::from_millis(1_800);
    let boot = Duration::from_millis(400);
    let stagger = Duration::from_millis(3_000);

    let mut pool = serving_pool(N);
    let mut timeline: BTreeMap<(Duration, Event), ()> = BTreeMap::new();
    for (at, id) in pool.rolling_plan(stagger) {
        timeline.insert((at, Event::Stop(id)), ());
    }

    let mut min_serving = N;
    while let Some(((now, event), ())) = timeline.pop_first() {
        match event {
            Event::Stop(id) => {
                if pool.request_stop(id) {
                    timeline.insert((now + drain, Event::Exit(id)), ());
                }
            }
            Event::Exit(id) => {
                if let Some((_, ExitAction::Respawn(new))) = pool.on_exit(id) {
                    timeline.insert((now + boot, Event::Ready(new)), ());
                }
            }
            Event::Ready(id) => {
                pool.on_report(id, &WorkerReport::Serving { pid: 1 });
            }
        }
        assert!(pool.count(WorkerState::Draining) <= 1);
        min_serving = min_serving.min(pool.count(WorkerState::Serving));
    }

    assert_eq!(min_serving, N - 1);
    assert_eq!(pool.len(), N);
    assert_eq!(pool.count(WorkerState::Serving), N);
    // Every original worker was replaced.
    assert!(pool.slots().all(|s| s.id.to_raw() >= N as u64));
}

#[test]
fn overlapping_rolling_restarts_coalesce() {
    let mut pool = serving_pool(3);
    let stagger = Duration::from_secs(3);
    let plan = pool.rolling_plan(stagger);
    assert_eq!(plan.len(), 3);
    assert!(pool.is_rolling());

    // A second request mid-cycle adds no stops.
    let (_, first) = plan[0];
    assert!(pool.request_stop(first));
    assert!(pool.rolling_plan(stagger).is_empty());

    // The cycle ends once every planned worker has exited.
    for &(_, id) in &plan {
        pool.request_stop(id);
        let Some((_, ExitAction::Respawn(new))) = pool.on_exit(id) else {
            panic!("expected a respawn for {id}");
        };
        pool.on_report(new, &WorkerReport::Serving { pid: 1 });
    }
    assert!(!pool.is_rolling());
    assert_eq!(pool.rolling_plan(stagger).len(), 3);
}
