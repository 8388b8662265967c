use std::thread;
use std::time::{Duration, Instant};

use concord_shared::{LockOptions, MemberId};
use concord_test::{build_cluster, TestRecord};

#[test]
fn lock_excludes_other_nodes_until_released() {
    let cluster = build_cluster(2, 0);
    let key = "alpha".to_string();
    let if_acquireable = LockOptions {
        if_acquireable: true,
        ..LockOptions::default()
    };

    assert!(cluster.servers[0].lock(&key, LockOptions::default(), 0).unwrap());
    assert!(!cluster.servers[1].lock(&key, if_acquireable, 0).unwrap());

    assert!(cluster.servers[0].unlock(&key).unwrap());
    assert!(cluster.servers[1].lock(&key, if_acquireable, 0).unwrap());
    assert!(cluster.servers[1].unlock(&key).unwrap());
}

#[test]
fn blocked_acquire_gets_the_lock_on_release() {
    let cluster = build_cluster(2, 0);
    let key = "handoff".to_string();
    assert!(cluster.servers[0].lock(&key, LockOptions::default(), 0).unwrap());

    let secondary = cluster.servers[1].clone();
    let contender_key = key.clone();
    let contender = thread::spawn(move || {
        let acquired = secondary
            .lock(&contender_key, LockOptions::default(), 0)
            .unwrap();
        (acquired, Instant::now())
    });

    thread::sleep(Duration::from_millis(150));
    let released_at = Instant::now();
    assert!(cluster.servers[0].unlock(&key).unwrap());

    let (acquired, acquired_at) = contender.join().unwrap();
    assert!(acquired);
    assert!(acquired_at >= released_at);
    assert!(cluster.servers[1].unlock(&key).unwrap());
}

#[test]
fn bounded_acquire_times_out_cleanly() {
    let cluster = build_cluster(2, 0);
    let key = "contended".to_string();
    assert!(cluster.servers[0].lock(&key, LockOptions::default(), 0).unwrap());

    let started = Instant::now();
    let acquired = cluster.servers[1]
        .lock(&key, LockOptions::default(), 150)
        .unwrap();
    assert!(!acquired);
    assert!(started.elapsed() >= Duration::from_millis(150));

    // The withdrawal of the forwarded request travels asynchronously; give
    // it time to land at the authority before releasing.
    thread::sleep(Duration::from_millis(100));

    // A release must not hand the lock to the timed-out requester.
    assert!(cluster.servers[0].unlock(&key).unwrap());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(cluster.servers[0].lock_owner(&key), None);
    assert_eq!(cluster.servers[1].lock_owner(&key), None);

    assert!(cluster.servers[1].lock(&key, LockOptions::default(), 0).unwrap());
    assert!(cluster.servers[1].unlock(&key).unwrap());
}

#[test]
fn lock_is_reentrant_on_the_owning_thread() {
    let cluster = build_cluster(2, 0);
    let key = "nested".to_string();

    assert!(cluster.servers[1].lock(&key, LockOptions::default(), 0).unwrap());
    assert!(cluster.servers[1].lock(&key, LockOptions::default(), 0).unwrap());
    assert!(cluster.servers[1].unlock(&key).unwrap());
}

#[test]
fn if_exists_requires_a_resident_key() {
    let cluster = build_cluster(2, 0);
    let key = "conditional".to_string();
    let if_exists = LockOptions {
        if_exists: true,
        ..LockOptions::default()
    };

    assert!(!cluster.servers[1].lock(&key, if_exists, 0).unwrap());

    cluster.servers[0]
        .put(key.clone(), TestRecord::new(1, 1))
        .unwrap();
    assert!(cluster.servers[1].lock(&key, if_exists, 0).unwrap());
    assert!(cluster.servers[1].unlock(&key).unwrap());
}

#[test]
fn grant_is_recorded_on_every_replica() {
    let cluster = build_cluster(3, 0);
    let key = "observed".to_string();

    assert!(cluster.servers[2].lock(&key, LockOptions::default(), 0).unwrap());
    let owner = Some(MemberId::new("server-3"));
    for server in &cluster.servers {
        assert_eq!(server.lock_owner(&key), owner);
    }

    assert!(cluster.servers[2].unlock(&key).unwrap());
    thread::sleep(Duration::from_millis(200));
    for server in &cluster.servers {
        assert_eq!(server.lock_owner(&key), None);
    }
}

#[test]
fn unlock_without_ownership_reports_false() {
    let cluster = build_cluster(2, 0);
    let key = "unowned".to_string();

    assert!(!cluster.servers[0].unlock(&key).unwrap());
    assert!(cluster.servers[0].lock(&key, LockOptions::default(), 0).unwrap());
    assert!(!cluster.servers[1].unlock(&key).unwrap());
    assert!(cluster.servers[0].unlock(&key).unwrap());
}

#[test]
fn departed_members_locks_are_force_released() {
    let mut cluster = build_cluster(3, 0);
    let key = "orphaned".to_string();
    assert!(cluster.servers[1].lock(&key, LockOptions::default(), 0).unwrap());

    let departed = cluster.member("server-2");
    cluster.remove_member(&departed);

    let if_acquireable = LockOptions {
        if_acquireable: true,
        ..LockOptions::default()
    };
    assert!(cluster
        .server("server-3")
        .lock(&key, if_acquireable, 0)
        .unwrap());
    assert!(cluster.server("server-3").unlock(&key).unwrap());
}
