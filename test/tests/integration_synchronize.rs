use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use concord_context::UpdateListener;
use concord_test::{build_cluster, TestRecord};

#[test]
fn main_commands_every_peer_to_pull_its_state() {
    let cluster = build_cluster(3, 0);
    let main = cluster.server("server-1");
    assert!(main.is_main());

    // Divergence: entries only the authority holds.
    main.put_local("a".to_string(), TestRecord::new(1, 1)).unwrap();
    main.put_local("b".to_string(), TestRecord::new(2, 2)).unwrap();

    main.synchronize().unwrap();

    for server in &cluster.servers {
        assert_eq!(server.len().unwrap(), 2);
        assert_eq!(
            server.get_local(&"a".to_string()).unwrap(),
            Some(TestRecord::new(1, 1))
        );
    }
}

#[test]
fn secondary_pull_replaces_its_replica_wholesale() {
    let cluster = build_cluster(3, 0);
    let main = cluster.server("server-1");
    main.put_local("kept".to_string(), TestRecord::new(1, 1)).unwrap();

    let secondary = cluster.server("server-2");
    secondary
        .put_local("stale".to_string(), TestRecord::new(9, 9))
        .unwrap();

    secondary.synchronize().unwrap();

    assert_eq!(
        secondary.get_local(&"kept".to_string()).unwrap(),
        Some(TestRecord::new(1, 1))
    );
    assert_eq!(secondary.get_local(&"stale".to_string()).unwrap(), None);
    // A pull only touches the puller.
    assert_eq!(
        cluster.server("server-3").get_local(&"kept".to_string()).unwrap(),
        None
    );
}

struct CountSnapshotInstalls {
    clears: AtomicUsize,
    entries: AtomicUsize,
}

impl UpdateListener<String, TestRecord> for CountSnapshotInstalls {
    fn on_clear_synchronize(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn on_put_synchronize(&self, _key: &String, _value: &TestRecord) {
        self.entries.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn snapshot_install_notifies_listeners() {
    let cluster = build_cluster(2, 0);
    let main = cluster.server("server-1");
    main.put_local("a".to_string(), TestRecord::new(1, 1)).unwrap();
    main.put_local("b".to_string(), TestRecord::new(2, 2)).unwrap();

    let listener = Arc::new(CountSnapshotInstalls {
        clears: AtomicUsize::new(0),
        entries: AtomicUsize::new(0),
    });
    let secondary = cluster.server("server-2");
    secondary.add_listener(listener.clone());

    secondary.synchronize().unwrap();

    assert_eq!(listener.clears.load(Ordering::SeqCst), 1);
    assert_eq!(listener.entries.load(Ordering::SeqCst), 2);
}

#[test]
fn mutations_resume_after_a_pull() {
    let cluster = build_cluster(2, 0);
    let main = cluster.server("server-1");
    main.put_local("a".to_string(), TestRecord::new(1, 1)).unwrap();

    let secondary = cluster.server("server-2");
    secondary.synchronize().unwrap();

    // The cluster-wide freeze must be fully released on both sides.
    secondary
        .put("after".to_string(), TestRecord::new(7, 7))
        .unwrap();
    assert_eq!(
        main.get_local(&"after".to_string()).unwrap(),
        Some(TestRecord::new(7, 7))
    );
}
