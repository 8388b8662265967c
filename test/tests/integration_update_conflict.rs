use concord_shared::{ContextError, SendError};
use concord_test::{build_cluster, TestRecord};

#[test]
fn secondary_heals_a_missed_update_by_resyncing() {
    let cluster = build_cluster(3, 0);
    let key = "healed".to_string();
    let main = cluster.server("server-1");
    main.put(key.clone(), TestRecord::new(100, 5)).unwrap();

    // server-3 misses one update.
    let stale = cluster.member("server-3");
    cluster.network.disconnect(&stale);
    let mut v1 = main.get_local(&key).unwrap().unwrap();
    v1.price = 110;
    main.update(key.clone(), v1).unwrap();
    cluster.network.reconnect(&stale);

    // The next diff does not follow server-3's version; it must resync
    // before acknowledging.
    let mut v2 = main.get_local(&key).unwrap().unwrap();
    v2.price = 120;
    main.update(key.clone(), v2).unwrap();

    let expected = main.get_local(&key).unwrap().unwrap();
    assert_eq!(expected.price, 120);
    for server in &cluster.servers {
        assert_eq!(server.get_local(&key).unwrap(), Some(expected.clone()));
    }
}

#[test]
fn secondary_heals_a_missed_put_by_resyncing() {
    let cluster = build_cluster(2, 0);
    let key = "late".to_string();
    let main = cluster.server("server-1");

    let stale = cluster.member("server-2");
    cluster.network.disconnect(&stale);
    main.put(key.clone(), TestRecord::new(100, 5)).unwrap();
    cluster.network.reconnect(&stale);
    assert_eq!(cluster.server("server-2").get_local(&key).unwrap(), None);

    let mut next = main.get_local(&key).unwrap().unwrap();
    next.price = 110;
    main.update(key.clone(), next).unwrap();

    let expected = main.get_local(&key).unwrap().unwrap();
    assert_eq!(expected.price, 110);
    assert_eq!(
        cluster.server("server-2").get_local(&key).unwrap(),
        Some(expected)
    );
}

#[test]
fn stale_callers_update_is_rejected_then_converges() {
    let cluster = build_cluster(3, 0);
    let key = "lagging".to_string();
    let main = cluster.server("server-1");
    main.put(key.clone(), TestRecord::new(100, 5)).unwrap();

    // server-2 misses two updates, then issues its own from the stale base.
    let stale = cluster.member("server-2");
    cluster.network.disconnect(&stale);
    for price in [110, 120] {
        let mut next = main.get_local(&key).unwrap().unwrap();
        next.price = price;
        main.update(key.clone(), next).unwrap();
    }
    cluster.network.reconnect(&stale);

    let caller = cluster.server("server-2");
    let mut candidate = caller.get_local(&key).unwrap().unwrap();
    assert_eq!(candidate.price, 100);
    candidate.quantity = 9;

    // The first diff does not advance main's version; the caller must pull
    // the authoritative value, re-diff, and retry instead of returning Ok
    // while the replicas diverge.
    let gets_before = cluster.network.sent_count("get");
    caller.update(key.clone(), candidate).unwrap();
    assert!(cluster.network.sent_count("get") > gets_before);

    let settled = main.get_local(&key).unwrap().unwrap();
    assert_eq!((settled.price, settled.quantity), (100, 9));
    for server in &cluster.servers {
        assert_eq!(server.get_local(&key).unwrap(), Some(settled.clone()));
    }
}

#[test]
fn conflict_at_the_authority_is_an_error() {
    let cluster = build_cluster(2, 0);
    let key = "divergent".to_string();
    let secondary = cluster.server("server-2");
    secondary.put(key.clone(), TestRecord::new(100, 5)).unwrap();

    // The authority misses an update; there is nobody it could resync from.
    let main_id = cluster.member("server-1");
    cluster.network.disconnect(&main_id);
    let mut v1 = secondary.get_local(&key).unwrap().unwrap();
    v1.price = 110;
    secondary.update(key.clone(), v1).unwrap();
    cluster.network.reconnect(&main_id);

    let mut v2 = secondary.get_local(&key).unwrap().unwrap();
    v2.price = 120;
    let result = secondary.update(key.clone(), v2);

    assert!(matches!(
        result,
        Err(ContextError::Send(SendError::Remote { .. }))
    ));
}

#[test]
fn redelivered_diff_is_ignored() {
    let cluster = build_cluster(2, 0);
    let key = "idempotent".to_string();
    let main = cluster.server("server-1");
    main.put(key.clone(), TestRecord::new(100, 5)).unwrap();

    let mut next = main.get_local(&key).unwrap().unwrap();
    next.price = 110;
    main.update(key.clone(), next).unwrap();
    let settled = main.get_local(&key).unwrap().unwrap();

    // An identical update diffs to nothing and sends nothing.
    let updates_before = cluster.network.sent_count("update");
    main.update(key.clone(), settled.clone()).unwrap();
    assert_eq!(cluster.network.sent_count("update"), updates_before);

    for server in &cluster.servers {
        assert_eq!(server.get_local(&key).unwrap(), Some(settled.clone()));
    }
}
