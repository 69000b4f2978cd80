//! Parallel admits against a file-backed store.
//!
//! Every thread opens its own transaction on the shared engine; the queue must come out
//! dense with each user admitted exactly once.

use peditos_queue::{EngineSettings, OrderKind, OrderStore, QueueEngine, Role, UserId};
use std::sync::{Arc, Barrier};
use std::time::Duration;

fn file_engine(dir: &tempfile::TempDir) -> QueueEngine {
    let _ = env_logger::try_init();
    let store = Arc::new(OrderStore::open(dir.path().join("queue.db")).unwrap());
    QueueEngine::new(store).with_settings(EngineSettings {
        tx_timeout: Duration::from_secs(10),
        max_retries: 5,
    })
}

fn register(engine: &QueueEngine, names: &[&str]) -> Vec<UserId> {
    names
        .iter()
        .map(|n| {
            engine
                .store()
                .insert_user(n, &format!("{n}@example.com"), Role::User)
                .unwrap()
                .id
        })
        .collect()
}

fn admit_in_parallel(engine: &Arc<QueueEngine>, owners: &[UserId]) {
    let barrier = Arc::new(Barrier::new(owners.len()));
    let handles: Vec<_> = owners
        .iter()
        .copied()
        .map(|owner| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                engine.admit(owner, OrderKind::Service)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
}

#[test]
fn parallel_admits_form_a_permutation() {
    const K: usize = 16;
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(file_engine(&dir));
    let names: Vec<String> = (0..K).map(|i| format!("user{i}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let owners = register(&engine, &names);

    admit_in_parallel(&engine, &owners);

    let queued = engine.list_queued().unwrap();
    let mut positions: Vec<u32> = queued.iter().map(|o| o.position.unwrap()).collect();
    positions.sort_unstable();
    assert_eq!(positions, (1..=K as u32).collect::<Vec<_>>());
    let mut seen: Vec<UserId> = queued.iter().map(|o| o.owner_id).collect();
    seen.sort();
    let mut want = owners.clone();
    want.sort();
    assert_eq!(seen, want);
    // FIFO order never runs backwards in time.
    assert!(queued.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[test]
fn concurrent_admits_append_after_existing_queue() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(file_engine(&dir));
    let users = register(&engine, &["a", "b", "d", "e"]);
    engine.admit(users[0], OrderKind::Product).unwrap();
    engine.admit(users[1], OrderKind::Product).unwrap();

    admit_in_parallel(&engine, &users[2..]);

    let queued = engine.list_queued().unwrap();
    let shape: Vec<(UserId, u32)> = queued.iter().map(|o| (o.owner_id, o.position.unwrap())).collect();
    assert_eq!(&shape[..2], &[(users[0], 1), (users[1], 2)]);
    let mut tail: Vec<(UserId, u32)> = shape[2..].to_vec();
    tail.sort();
    let mut positions: Vec<u32> = tail.iter().map(|(_, p)| *p).collect();
    positions.sort_unstable();
    assert_eq!(positions, vec![3, 4]);
    let mut owners: Vec<UserId> = tail.iter().map(|(o, _)| *o).collect();
    owners.sort();
    assert_eq!(owners, vec![users[2], users[3]]);
}

#[test]
fn concurrent_promote_and_admit_keep_positions_dense() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(file_engine(&dir));
    let names: Vec<String> = (0..8).map(|i| format!("u{i}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let owners = register(&engine, &names);
    let admin = engine
        .store()
        .insert_user("admin", "admin@example.com", Role::Admin)
        .unwrap()
        .id;
    for owner in &owners[..4] {
        engine.admit(*owner, OrderKind::Support).unwrap();
    }

    let promoter = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            for _ in 0..3 {
                engine.promote_next(admin).unwrap();
            }
        })
    };
    admit_in_parallel(&engine, &owners[4..]);
    promoter.join().unwrap();

    let queued = engine.list_queued().unwrap();
    let positions: Vec<u32> = queued.iter().map(|o| o.position.unwrap()).collect();
    assert_eq!(positions, (1..=queued.len() as u32).collect::<Vec<_>>());
    assert_eq!(queued.len(), 5);
}
