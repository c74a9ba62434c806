//! Convergence and ordering properties, exercised through the in-process
//! simulation so delivery interleavings are reproducible.

use quill_sync::engine::{TextEngine, TextOp};
use quill_sync::protocol::ClientUpdate;
use quill_sync::registry::{Outbound, RoomRegistry};
use quill_sync::workload::{ConvergenceReport, WorkloadConfig};
use quill_sync::Simulation;
use tokio::sync::mpsc;
use uuid::Uuid;

fn simulation(seed: u64, replicas: usize) -> Simulation<TextEngine> {
    let config = WorkloadConfig { replicas, seed: Some(seed), ..WorkloadConfig::default() };
    Simulation::new(TextEngine, &config)
}

/// Have replica `index` type each text in turn, delivering everything after each edit.
fn type_in_turn(sim: &mut Simulation<TextEngine>, index: usize, texts: &[&str]) {
    for text in texts {
        let update = sim.replica_mut(index).unwrap().handle_text(text).unwrap().unwrap();
        sim.enqueue(index, update);
        sim.deliver_all().unwrap();
    }
}

fn update(op: TextOp, base_revision: u64) -> ClientUpdate<TextOp> {
    ClientUpdate { operation: op, base_revision, id: Uuid::new_v4() }
}

fn drain_revisions(rx: &mut mpsc::UnboundedReceiver<Outbound<TextOp>>) -> Vec<u64> {
    let mut out = Vec::new();
    while let Ok(Outbound::ServerUpdate { broadcast, .. }) = rx.try_recv() {
        out.push(broadcast.revision);
    }
    out
}

#[test]
fn test_single_replica_single_edit() {
    let mut sim = simulation(1, 1);
    type_in_turn(&mut sim, 0, &["lorem"]);

    let authority = sim.registry().authority("DOC0").unwrap();
    assert_eq!(authority.revision(), 1);
    assert_eq!(authority.state(), "lorem");
    assert_eq!(sim.states(), vec!["lorem".to_string()]);
    assert_eq!(sim.replica(0).unwrap().revision(), 1);
}

#[test]
fn test_concurrent_insert_and_delete() {
    let mut sim = simulation(2, 2);
    type_in_turn(
        &mut sim,
        0,
        &["lorem", "lorem ipsum", "lorem ipsum sit", "lorem ipsum sit amet", "lorem ipsum"],
    );
    assert_eq!(sim.replica(1).unwrap().revision(), 5);

    let from_a = sim.replica_mut(0).unwrap().handle_text("lorem dolor ipsum").unwrap().unwrap();
    let from_b = sim.replica_mut(1).unwrap().handle_text("lorem").unwrap().unwrap();
    assert_eq!(from_a.base_revision, 5);
    assert_eq!(from_b.base_revision, 5);
    sim.enqueue(0, from_a);
    sim.enqueue(1, from_b);
    sim.deliver_all().unwrap();

    assert_eq!(sim.check(), ConvergenceReport::Synchronized("lorem dolor".into()));
    assert_eq!(sim.authority_state(), "lorem dolor");
    assert_eq!(sim.registry().authority("DOC0").unwrap().revision(), 7);
}

#[test]
fn test_checker_sees_undelivered_edit() {
    let mut sim = simulation(3, 2);
    type_in_turn(&mut sim, 0, &["lorem ipsum"]);
    assert!(sim.check().is_synchronized());

    let edit = sim.replica_mut(0).unwrap().handle_text("lorem ipsum dolor").unwrap().unwrap();
    assert_eq!(
        sim.check(),
        ConvergenceReport::NotSynchronized(vec!["lorem ipsum dolor".into(), "lorem ipsum".into()])
    );

    sim.enqueue(0, edit);
    // Applied by the authority, but the broadcast has not reached the other replica yet.
    assert!(sim.step().unwrap());
    assert_eq!(sim.authority_state(), "lorem ipsum dolor");
    assert!(!sim.check().is_synchronized());

    sim.deliver_all().unwrap();
    assert_eq!(sim.check(), ConvergenceReport::Synchronized("lorem ipsum dolor".into()));
}

#[test]
fn test_random_workloads_converge() {
    for seed in 0..25 {
        let mut sim = simulation(seed, 3);
        let report = sim.run(30).unwrap();
        match report {
            ConvergenceReport::Synchronized(text) => assert_eq!(text, sim.authority_state(), "seed {seed}"),
            other => panic!("seed {seed}: {other}"),
        }

        let head = sim.registry().authority("DOC0").unwrap().revision();
        for i in 0..3 {
            let replica = sim.replica(i).unwrap();
            assert_eq!(replica.revision(), head, "seed {seed} replica {i}");
            assert!(replica.is_synchronized());
        }
    }
}

#[test]
fn test_many_replicas_converge() {
    let mut sim = simulation(1234, 8);
    assert!(sim.run(60).unwrap().is_synchronized());
    assert_eq!(
        sim.registry().authority("DOC0").unwrap().replay().unwrap(),
        sim.authority_state()
    );
}

#[test]
fn test_revisions_are_monotonic_and_gap_free() {
    let mut registry = RoomRegistry::new(TextEngine);
    let conn = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.connect(conn, tx);
    registry.join(conn, "DOC0");

    registry.submit_update("DOC0", update(TextOp::insert(0, "abc"), 0)).unwrap();
    // Stale, redundant and fresh updates mixed together.
    registry.submit_update("DOC0", update(TextOp::delete(1, 1), 1)).unwrap();
    registry.submit_update("DOC0", update(TextOp::delete(1, 1), 1)).unwrap();
    registry.submit_update("DOC0", update(TextOp::insert(0, "x"), 0)).unwrap();
    registry.submit_update("DOC0", update(TextOp::insert(3, "y"), 3)).unwrap();

    assert_eq!(drain_revisions(&mut rx), vec![0, 1, 2, 3]);
    // The late insert lands after the text it raced with.
    assert_eq!(registry.authority("DOC0").unwrap().state(), "acxy");
}

#[test]
fn test_noop_leaves_no_trace() {
    let mut registry = RoomRegistry::new(TextEngine);
    let conn = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.connect(conn, tx);
    registry.join(conn, "DOC0");

    registry.submit_update("DOC0", update(TextOp::insert(0, "abc"), 0)).unwrap();
    let before = drain_revisions(&mut rx);

    assert!(registry.submit_update("DOC0", update(TextOp::default(), 1)).unwrap().is_none());
    assert!(rx.try_recv().is_err());
    assert_eq!(before, vec![0]);
    assert_eq!(registry.authority("DOC0").unwrap().revision(), 1);
}

#[test]
fn test_every_subscriber_sees_same_order() {
    let mut registry = RoomRegistry::new(TextEngine);
    let mut receivers = Vec::new();
    for _ in 0..3 {
        let conn = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.connect(conn, tx);
        registry.join(conn, "DOC0");
        receivers.push(rx);
    }

    for i in 0..10 {
        registry.submit_update("DOC0", update(TextOp::insert(0, i.to_string()), i / 2)).unwrap();
    }

    let mut sequences = Vec::new();
    for rx in &mut receivers {
        let mut ops = Vec::new();
        while let Ok(Outbound::ServerUpdate { broadcast, .. }) = rx.try_recv() {
            ops.push(broadcast);
        }
        sequences.push(ops);
    }
    assert_eq!(sequences[0].len(), 10);
    assert!(sequences.iter().all(|s| *s == sequences[0]));
}

#[test]
fn test_join_is_idempotent() {
    let mut registry = RoomRegistry::new(TextEngine);
    let conn = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.connect(conn, tx);
    registry.join(conn, "DOC0");
    registry.join(conn, "DOC0");

    registry.submit_update("DOC0", update(TextOp::insert(0, "x"), 0)).unwrap();
    assert_eq!(drain_revisions(&mut rx), vec![0]);
}
