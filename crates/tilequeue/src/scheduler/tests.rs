use super::*;
use crate::{GRID, OTHER, SequenceGenerator, TILE};
use std::cell::Cell;
use std::sync::Arc;
use std::time::Instant;

struct MockTime {
    now: Cell<Instant>,
}

impl MockTime {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Cell::new(Instant::now()),
        })
    }

    fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl TimeSource for MockTime {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// Payload carrying a human-readable label so assertions read like the
/// scenarios they check.
type Label = &'static str;

struct Harness {
    scheduler: Scheduler<Label, Arc<MockTime>>,
    ids: SequenceGenerator,
    clock: Arc<MockTime>,
    labels: Vec<(SequenceId, Label)>,
}

impl Harness {
    fn new(requests_per_client: usize) -> Self {
        Self::with_config(SchedulerConfig {
            requests_per_client: NonZeroUsize::new(requests_per_client).unwrap(),
            ..SchedulerConfig::default()
        })
    }

    fn with_config(config: SchedulerConfig) -> Self {
        let clock = MockTime::new();
        Self {
            scheduler: Scheduler::with_clock(config, TypePriority::default(), Arc::clone(&clock)),
            ids: SequenceGenerator::new(),
            clock,
            labels: Vec::new(),
        }
    }

    fn request(&mut self, kind: &str, label: Label) -> PendingRequest<Label> {
        let id = self.ids.next_id();
        self.labels.push((id, label));
        PendingRequest::new(id, self.scheduler.types().index_of(kind), label)
    }

    fn id_of(&self, label: Label) -> SequenceId {
        self.labels
            .iter()
            .find(|(_, l)| *l == label)
            .map(|(id, _)| *id)
            .unwrap()
    }

    fn submit(&mut self, fp: &Fingerprint, kind: &str, label: Label) -> Vec<Label> {
        let request = self.request(kind, label);
        labels(self.scheduler.submit(fp.clone(), request))
    }

    fn enqueue(&mut self, fp: &Fingerprint, kind: &str, label: Label) {
        let request = self.request(kind, label);
        self.scheduler.enqueue(fp.clone(), request);
    }

    fn complete(&mut self, fp: &Fingerprint, label: Label) -> Completion<Label> {
        let id = self.id_of(label);
        self.scheduler.complete(fp, id)
    }
}

fn labels(admitted: Vec<Admitted<Label>>) -> Vec<Label> {
    admitted.into_iter().map(|a| a.request.payload).collect()
}

fn released(completion: Completion<Label>) -> Vec<Label> {
    match completion {
        Completion::Released { admitted } => labels(admitted),
        other => panic!("expected a released slot, got {other:?}"),
    }
}

fn client(name: &str) -> Fingerprint {
    Fingerprint::from(name)
}

#[test]
fn first_request_is_admitted_immediately() {
    let mut h = Harness::new(2);
    let fp = client("a");
    assert_eq!(h.submit(&fp, TILE, "t1"), ["t1"]);
    assert_eq!(h.scheduler.in_flight(&fp), 1);
    assert_eq!(h.scheduler.queued(&fp), 0);
}

#[test]
fn back_to_back_batch_prefers_recent_tiles_over_grids() {
    // requests_per_client = 2, types = [tile, grid, other]; tile1, tile2,
    // tile3 and grid1 arrive in one tick.
    let mut h = Harness::new(2);
    let fp = client("a");
    h.enqueue(&fp, TILE, "tile1");
    h.enqueue(&fp, TILE, "tile2");
    h.enqueue(&fp, TILE, "tile3");
    h.enqueue(&fp, GRID, "grid1");

    assert_eq!(labels(h.scheduler.fill(&fp)), ["tile3", "tile2"]);
    assert_eq!(h.scheduler.in_flight(&fp), 2);
    assert_eq!(h.scheduler.queued(&fp), 2);

    assert_eq!(released(h.complete(&fp, "tile3")), ["tile1"]);
    assert_eq!(released(h.complete(&fp, "tile2")), ["grid1"]);
    assert_eq!(h.scheduler.queued(&fp), 0);
}

#[test]
fn recency_within_type() {
    let mut h = Harness::new(1);
    let fp = client("a");
    h.enqueue(&fp, TILE, "r1");
    h.enqueue(&fp, TILE, "r2");
    h.enqueue(&fp, TILE, "r3");

    assert_eq!(labels(h.scheduler.fill(&fp)), ["r3"]);
    assert_eq!(released(h.complete(&fp, "r3")), ["r2"]);
    assert_eq!(released(h.complete(&fp, "r2")), ["r1"]);
    assert!(released(h.complete(&fp, "r1")).is_empty());
}

#[test]
fn fifo_order_dispatches_in_arrival_order() {
    let mut h = Harness::with_config(SchedulerConfig {
        requests_per_client: NonZeroUsize::new(1).unwrap(),
        order: QueueOrder::Fifo,
        ..SchedulerConfig::default()
    });
    let fp = client("a");
    h.enqueue(&fp, TILE, "r1");
    h.enqueue(&fp, TILE, "r2");
    h.enqueue(&fp, TILE, "r3");

    assert_eq!(labels(h.scheduler.fill(&fp)), ["r1"]);
    assert_eq!(released(h.complete(&fp, "r1")), ["r2"]);
    assert_eq!(released(h.complete(&fp, "r2")), ["r3"]);
}

#[test]
fn higher_priority_type_wins_a_freed_slot() {
    let mut h = Harness::new(1);
    let fp = client("a");
    assert_eq!(h.submit(&fp, OTHER, "busy"), ["busy"]);
    // Lower priority arrives first, then higher priority.
    assert!(h.submit(&fp, OTHER, "o1").is_empty());
    assert!(h.submit(&fp, GRID, "g1").is_empty());
    assert!(h.submit(&fp, TILE, "t1").is_empty());

    assert_eq!(released(h.complete(&fp, "busy")), ["t1"]);
    assert_eq!(released(h.complete(&fp, "t1")), ["g1"]);
    assert_eq!(released(h.complete(&fp, "g1")), ["o1"]);
}

#[test]
fn unknown_kind_lands_in_fallback_type() {
    let mut h = Harness::new(1);
    let fp = client("a");
    assert_eq!(h.submit(&fp, TILE, "busy"), ["busy"]);

    let id = h.ids.next_id();
    h.labels.push((id, "stray"));
    h.scheduler
        .enqueue(fp.clone(), PendingRequest::new(id, 99, "stray"));
    assert!(h.submit(&fp, GRID, "g1").is_empty());

    assert_eq!(released(h.complete(&fp, "busy")), ["g1"]);
    assert_eq!(released(h.complete(&fp, "g1")), ["stray"]);
}

#[test]
fn clients_are_independent() {
    let mut h = Harness::new(1);
    let a = client("a");
    let b = client("b");
    assert_eq!(h.submit(&a, TILE, "a1"), ["a1"]);
    assert!(h.submit(&a, TILE, "a2").is_empty());
    assert_eq!(h.submit(&b, TILE, "b1"), ["b1"]);
    assert_eq!(h.scheduler.in_flight(&a), 1);
    assert_eq!(h.scheduler.in_flight(&b), 1);
    assert_eq!(h.scheduler.session_count(), 2);
}

#[test]
fn completion_runs_exactly_once_for_in_flight_requests() {
    // success, backend error and disconnect all call `complete`; every
    // interleaving must release the slot once.
    let signals = ["success", "error", "disconnect"];
    let orders = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    for order in orders {
        let mut h = Harness::new(1);
        let fp = client("a");
        assert_eq!(h.submit(&fp, TILE, "r1"), ["r1"]);
        assert!(h.submit(&fp, TILE, "r2").is_empty());

        let mut firsts = 0;
        let mut admitted = Vec::new();
        for signal in order.map(|i| signals[i]) {
            let completion = h.complete(&fp, "r1");
            if completion.is_first() {
                firsts += 1;
                admitted.extend(released(completion));
            } else {
                assert!(
                    matches!(completion, Completion::AlreadyCompleted),
                    "{signal} after completion must be a no-op"
                );
            }
        }

        assert_eq!(firsts, 1, "order {order:?}");
        assert_eq!(admitted, ["r2"]);
        assert_eq!(h.scheduler.in_flight(&fp), 1);
    }
}

#[test]
fn disconnect_of_queued_request_dequeues_without_touching_budget() {
    let mut h = Harness::new(1);
    let fp = client("a");
    assert_eq!(h.submit(&fp, TILE, "tile1"), ["tile1"]);
    assert!(h.submit(&fp, TILE, "tile2").is_empty());

    match h.complete(&fp, "tile2") {
        Completion::Dequeued { request } => assert_eq!(request.payload, "tile2"),
        other => panic!("expected dequeue, got {other:?}"),
    }
    assert_eq!(h.scheduler.in_flight(&fp), 1);
    assert_eq!(h.scheduler.queued(&fp), 0);

    // A late success/error for the dropped request changes nothing.
    assert!(!h.complete(&fp, "tile2").is_first());

    // tile2 never shows up when capacity frees.
    assert!(released(h.complete(&fp, "tile1")).is_empty());
    assert_eq!(h.scheduler.in_flight(&fp), 0);
}

#[test]
fn completion_for_unknown_client_is_a_no_op() {
    let mut h = Harness::new(1);
    let id = h.ids.next_id();
    assert!(!h.scheduler.complete(&client("ghost"), id).is_first());
    assert_eq!(h.scheduler.session_count(), 0);
}

#[test]
fn budget_is_never_exceeded() {
    const LIMIT: usize = 3;
    let mut h = Harness::new(LIMIT);
    let clients: Vec<_> = ["a", "b", "c"].into_iter().map(client).collect();
    let kinds = [TILE, GRID, OTHER];
    let mut in_flight: Vec<(usize, SequenceId)> = Vec::new();
    let mut queued: Vec<(usize, SequenceId)> = Vec::new();

    // Small xorshift so the walk is deterministic.
    let mut state = 0x9E37_79B9_7F4A_7C15_u64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    for _ in 0..5_000 {
        let roll = next();
        let c = (roll % clients.len() as u64) as usize;
        match (roll >> 8) % 4 {
            0 | 1 => {
                let id = h.ids.next_id();
                let kind = kinds[((roll >> 16) % 3) as usize];
                let request = PendingRequest::new(id, h.scheduler.types().index_of(kind), "x");
                queued.push((c, id));
                for admitted in h.scheduler.submit(clients[c].clone(), request) {
                    let id = admitted.request.id;
                    queued.retain(|(_, q)| *q != id);
                    in_flight.push((c, id));
                }
            }
            2 if !in_flight.is_empty() => {
                let (c, id) = in_flight.remove((roll >> 16) as usize % in_flight.len());
                let Completion::Released { admitted } = h.scheduler.complete(&clients[c], id)
                else {
                    panic!("{id} was in flight");
                };
                for admitted in admitted {
                    let id = admitted.request.id;
                    queued.retain(|(_, q)| *q != id);
                    in_flight.push((c, id));
                }
            }
            3 if !queued.is_empty() => {
                let (c, id) = queued.remove((roll >> 16) as usize % queued.len());
                assert!(matches!(
                    h.scheduler.complete(&clients[c], id),
                    Completion::Dequeued { .. }
                ));
            }
            _ => {}
        }

        for fp in &clients {
            assert!(h.scheduler.in_flight(fp) <= LIMIT);
        }
    }
}

#[test]
fn sweep_evicts_only_idle_sessions_past_ttl() {
    let mut h = Harness::with_config(SchedulerConfig {
        requests_per_client: NonZeroUsize::new(1).unwrap(),
        session_ttl: Duration::from_secs(60),
        ..SchedulerConfig::default()
    });
    let idle = client("idle");
    let busy = client("busy");

    assert_eq!(h.submit(&idle, TILE, "i1"), ["i1"]);
    released(h.complete(&idle, "i1"));
    assert_eq!(h.submit(&busy, TILE, "b1"), ["b1"]);

    h.clock.advance(Duration::from_secs(30));
    assert_eq!(h.scheduler.sweep(), 0);

    h.clock.advance(Duration::from_secs(31));
    assert_eq!(h.scheduler.sweep(), 1);
    assert!(!h.scheduler.has_session(&idle));
    assert!(h.scheduler.has_session(&busy));
    assert_eq!(h.scheduler.in_flight(&busy), 1);
}

#[test]
fn capacity_evicts_least_recently_seen_idle_session() {
    let mut h = Harness::with_config(SchedulerConfig {
        requests_per_client: NonZeroUsize::new(1).unwrap(),
        session_capacity: 2,
        ..SchedulerConfig::default()
    });
    let old = client("old");
    let recent = client("recent");
    let newcomer = client("new");

    assert_eq!(h.submit(&old, TILE, "o1"), ["o1"]);
    released(h.complete(&old, "o1"));
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.submit(&recent, TILE, "r1"), ["r1"]);
    released(h.complete(&recent, "r1"));
    h.clock.advance(Duration::from_secs(1));

    assert_eq!(h.submit(&newcomer, TILE, "n1"), ["n1"]);
    assert_eq!(h.scheduler.session_count(), 2);
    assert!(!h.scheduler.has_session(&old));
    assert!(h.scheduler.has_session(&recent));
}

#[test]
fn capacity_never_evicts_busy_sessions() {
    let mut h = Harness::with_config(SchedulerConfig {
        requests_per_client: NonZeroUsize::new(1).unwrap(),
        session_capacity: 1,
        ..SchedulerConfig::default()
    });
    let a = client("a");
    let b = client("b");

    assert_eq!(h.submit(&a, TILE, "a1"), ["a1"]);
    assert_eq!(h.submit(&b, TILE, "b1"), ["b1"]);
    assert_eq!(h.scheduler.session_count(), 2);
    assert_eq!(h.scheduler.in_flight(&a), 1);

    // Completing a1 still reaches the surviving session.
    assert!(h.complete(&a, "a1").is_first());
}

#[test]
fn queue_order_parses() {
    assert_eq!("LIFO".parse::<QueueOrder>().unwrap(), QueueOrder::Lifo);
    assert_eq!(" fifo ".parse::<QueueOrder>().unwrap(), QueueOrder::Fifo);
    assert!("random".parse::<QueueOrder>().is_err());
}
