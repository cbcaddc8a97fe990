//! Engine guarantees: termination, idempotence, completeness, resync safety
//! and redelivery safety.

use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use vnc_sync_common::{DeliveryOutcome, MemoryBus, MemoryStore, ObjectKey};
use vnc_sync_test::{
    fixtures::graphs::{self, NETWORK_POLICY, ROUTE_TARGET, ROUTING_INSTANCE, VIRTUAL_NETWORK},
    fixtures::routing_fixtures::{route_target, routing_instance},
    CacheVerifier, ConfigObject, Harness, HarnessOptions,
};

fn assert_each_once(keys: &[ObjectKey]) {
    let mut seen = HashSet::new();
    for key in keys {
        assert!(seen.insert(key), "{key} evaluated more than once");
    }
}

#[tokio::test]
async fn test_ring_of_types_terminates() {
    let types = ["x", "y", "z"];
    let mut h = Harness::new(|handler| graphs::ring(handler, &types)).unwrap();

    // Every object references every object of the next type.
    for (i, obj_type) in types.iter().enumerate() {
        let next = types[(i + 1) % types.len()];
        for n in 0..5 {
            ConfigObject::new(*obj_type, format!("{obj_type}{n}"))
                .with_refs(&format!("{next}_refs"), (0..5).map(|m| format!("{next}{m}")))
                .store_in(&h.store);
        }
    }
    let resync = h.start().await.unwrap();
    assert_eq!(resync.evaluated(), 15);
    assert_each_once(&h.recorder.evaluated_keys());

    h.recorder.clear();
    let x0 = h.store.get("x", "x0").unwrap();
    let report = h
        .apply(vnc_sync_common::ChangeEvent::update("x", "x0", x0))
        .await
        .unwrap();

    assert_eq!(report.evaluated, 15);
    assert_eq!(h.recorder.total(), 15);
    assert_each_once(&h.recorder.evaluated_keys());
    assert!(report.suppressed > 0);
}

#[tokio::test]
async fn test_dense_cycle_visits_each_object_once() {
    let mut h = Harness::new(graphs::cyclic_pair).unwrap();
    for n in 0..10 {
        ConfigObject::new("a", format!("a{n}"))
            .with_refs("b_refs", (0..10).map(|m| format!("b{m}")))
            .store_in(&h.store);
        ConfigObject::new("b", format!("b{n}"))
            .with_refs("a_refs", (0..10).map(|m| format!("a{m}")))
            .store_in(&h.store);
    }
    h.start().await.unwrap();
    h.recorder.clear();

    let report = h
        .consumer
        .engine_mut()
        .evaluate(h.store.as_ref(), "a", "a0")
        .await;

    assert_eq!(report.evaluated, 20);
    assert_each_once(&h.recorder.evaluated_keys());
    // 10 from a0, 10 from each of the other 19 visited objects, minus the
    // 19 first visits.
    assert_eq!(report.suppressed, 20 * 10 - 19);
}

#[tokio::test]
async fn test_repeated_evaluation_is_idempotent() {
    let mut h = Harness::new(graphs::routing_instances).unwrap();
    routing_instance("ri-1", ["rt-1", "rt-2"]).store_in(&h.store);
    route_target("rt-1", 1).store_in(&h.store);
    route_target("rt-2", 2).store_in(&h.store);
    h.start().await.unwrap();

    let writes = h.store.write_count();
    let derived = h.store.derived(ROUTING_INSTANCE, "ri-1").unwrap();

    let store = h.store.clone();
    let first = h
        .consumer
        .engine_mut()
        .evaluate(store.as_ref(), ROUTING_INSTANCE, "ri-1")
        .await;
    let second = h
        .consumer
        .engine_mut()
        .evaluate(store.as_ref(), ROUTING_INSTANCE, "ri-1")
        .await;

    assert_eq!(first, second);
    assert_eq!(first.evaluated, 3);
    assert_eq!(first.updated, 0);
    assert_eq!(first.unchanged, 3);
    assert_eq!(h.store.write_count(), writes);
    assert_eq!(h.store.derived(ROUTING_INSTANCE, "ri-1").unwrap(), derived);
    assert_eq!(
        h.engine().cache().get(ROUTING_INSTANCE, "ri-1").unwrap().derived,
        derived
    );
}

#[tokio::test]
async fn test_update_reaches_referents_under_self() {
    let mut h = Harness::new(graphs::routing_instances).unwrap();
    let ri = routing_instance("ri-1", ["rt-1"]);
    ri.store_in(&h.store);
    route_target("rt-1", 1).store_in(&h.store);
    h.start().await.unwrap();
    h.recorder.clear();

    // An update that leaves the references alone still reaches rt-1.
    let renamed = ri.with_field("display_name", "blue");
    renamed.store_in(&h.store);
    h.apply(renamed.update()).await.unwrap();

    assert_eq!(h.recorder.count(ROUTING_INSTANCE, "ri-1"), 1);
    assert_eq!(h.recorder.count(ROUTE_TARGET, "rt-1"), 1);
}

#[tokio::test]
async fn test_update_reaches_old_and_new_referents() {
    let mut h = Harness::new(graphs::routing_instances).unwrap();
    routing_instance("ri-1", ["rt-1"]).store_in(&h.store);
    route_target("rt-1", 1).store_in(&h.store);
    route_target("rt-2", 2).store_in(&h.store);
    h.start().await.unwrap();
    h.recorder.clear();

    let moved = ConfigObject::new(ROUTING_INSTANCE, "ri-1").with_ref("route_target_refs", "rt-2");
    moved.store_in(&h.store);
    let report = h.apply(moved.update()).await.unwrap();

    assert_eq!(
        h.recorder.evaluated_keys(),
        vec![
            ObjectKey::new(ROUTING_INSTANCE, "ri-1"),
            ObjectKey::new(ROUTE_TARGET, "rt-2"),
            ObjectKey::new(ROUTE_TARGET, "rt-1"),
        ]
    );
    assert_eq!(report.evaluated, 3);
}

#[tokio::test]
async fn test_relation_rules_fire_only_when_relation_changes() {
    let mut h = Harness::new(graphs::policy_attachment).unwrap();
    ConfigObject::new(NETWORK_POLICY, "np-1").store_in(&h.store);
    let vn = ConfigObject::new(VIRTUAL_NETWORK, "vn-1").with_field("display_name", "vn");
    vn.store_in(&h.store);
    h.start().await.unwrap();

    // Attaching the policy re-evaluates it.
    h.recorder.clear();
    let attached = vn.clone().with_ref("network_policy_refs", "np-1");
    h.apply(attached.update()).await.unwrap();
    assert_eq!(h.recorder.count(VIRTUAL_NETWORK, "vn-1"), 1);
    assert_eq!(h.recorder.count(NETWORK_POLICY, "np-1"), 1);

    // Other changes to the network leave the policy alone.
    h.recorder.clear();
    let renamed = attached.clone().with_field("display_name", "vn-blue");
    h.apply(renamed.update()).await.unwrap();
    assert_eq!(h.recorder.count(VIRTUAL_NETWORK, "vn-1"), 1);
    assert_eq!(h.recorder.count(NETWORK_POLICY, "np-1"), 0);

    // Detaching reaches the policy that lost its network.
    h.recorder.clear();
    let detached = renamed.without_refs("network_policy_refs");
    h.apply(detached.update()).await.unwrap();
    assert_eq!(h.recorder.count(NETWORK_POLICY, "np-1"), 1);
}

#[tokio::test]
async fn test_resync_mirrors_store_after_missed_changes() {
    let mut h = Harness::new(graphs::routing_instances).unwrap();
    for i in 0..5 {
        routing_instance(&format!("ri-{i}"), [format!("rt-{i}")]).store_in(&h.store);
        route_target(&format!("rt-{i}"), i).store_in(&h.store);
    }
    h.start().await.unwrap();

    // Changes made upstream while notifications were lost.
    h.store.remove(ROUTING_INSTANCE, "ri-0");
    h.store.remove(ROUTE_TARGET, "rt-4");
    route_target("rt-9", 9).store_in(&h.store);
    routing_instance("ri-1", ["rt-9", "rt-missing"]).store_in(&h.store);
    routing_instance("ri-7", ["rt-1"]).store_in(&h.store);

    let report = h.resync().await.unwrap();
    assert_eq!(report.removed, 2);
    assert_eq!(report.listed, 10);

    let verifier = CacheVerifier::new(h.engine(), &h.store);
    verifier.assert_mirrors_store().unwrap();
    verifier.assert_no_dangling_refs().unwrap();
    verifier.assert_derived_persisted().unwrap();

    // Replaced wholesale: ri-1 no longer references rt-1.
    assert_eq!(
        h.engine()
            .cache()
            .get(ROUTING_INSTANCE, "ri-1")
            .unwrap()
            .ref_ids("route_target_refs"),
        ["rt-9".to_string(), "rt-missing".to_string()]
    );
    assert!(h
        .engine()
        .pending()
        .is_awaited(&ObjectKey::new(ROUTE_TARGET, "rt-missing")));
}

#[tokio::test]
async fn test_failed_write_is_retried_by_resync() {
    let mut h = Harness::new(graphs::routing_instances).unwrap();
    h.start().await.unwrap();

    let ri = routing_instance("ri-1", Vec::<&str>::new());
    ri.store_in(&h.store);
    // One fault per retry attempt.
    h.store.fail_writes(3);
    let report = h.apply(ri.create()).await.unwrap();
    assert_eq!(report.write_failures, 1);
    assert!(h.store.derived(ROUTING_INSTANCE, "ri-1").is_none());

    let report = h.resync().await.unwrap();
    assert_eq!(report.pass.updated, 1);
    assert_eq!(report.pass.write_failures, 0);
    CacheVerifier::new(h.engine(), &h.store)
        .assert_derived_persisted()
        .unwrap();
}

#[tokio::test]
async fn test_duplicate_delivery_changes_nothing() {
    let mut h = Harness::new(graphs::routing_instances).unwrap();
    route_target("rt-1", 1).store_in(&h.store);
    h.start().await.unwrap();

    let ri = routing_instance("ri-1", ["rt-1"]);
    ri.store_in(&h.store);
    for _ in 0..2 {
        assert!(h.publish(&ri.create()).unwrap());
    }

    assert_eq!(
        h.consumer.poll_once().await.unwrap(),
        Some(DeliveryOutcome::Acked)
    );
    let writes = h.store.write_count();
    let derived = h.store.derived(ROUTING_INSTANCE, "ri-1");

    assert_eq!(
        h.consumer.poll_once().await.unwrap(),
        Some(DeliveryOutcome::Acked)
    );
    assert_eq!(h.store.write_count(), writes);
    assert_eq!(h.store.derived(ROUTING_INSTANCE, "ri-1"), derived);
}

/// A consumer dies mid-pass; its replacement gets the unsettled delivery
/// back and ends with the same derived state as a single clean delivery.
#[tokio::test(start_paused = true)]
async fn test_redelivery_after_crash_matches_single_delivery() {
    let ri = routing_instance("ri-1", ["rt-1"]);
    // Back ref maintained upstream, so rt-1's derived state changes once
    // ri-1 is cached.
    let rt = route_target("rt-1", 1).with_ref("routing_instance_back_refs", "ri-1");

    let mut reference = Harness::new(graphs::routing_instances).unwrap();
    rt.store_in(&reference.store);
    reference.start().await.unwrap();
    ri.store_in(&reference.store);
    assert!(reference.publish(&ri.create()).unwrap());
    assert_eq!(
        reference.consumer.poll_once().await.unwrap(),
        Some(DeliveryOutcome::Acked)
    );

    let store = Arc::new(MemoryStore::new());
    let bus = MemoryBus::new();
    rt.store_in(&store);
    let mut first = Harness::with_backends(
        graphs::routing_instances,
        HarnessOptions::default(),
        store.clone(),
        bus.clone(),
    )
    .unwrap();
    first.start().await.unwrap();
    ri.store_in(&store);
    store.stall_writes(ROUTE_TARGET, "rt-1", Duration::from_secs(10));
    assert!(first.publish(&ri.create()).unwrap());

    // ri-1 is written, then the pass hangs writing rt-1 and the process
    // goes away before acknowledging.
    let crashed =
        tokio::time::timeout(Duration::from_millis(20), first.consumer.poll_once()).await;
    assert!(crashed.is_err());
    assert_eq!(
        store.derived(ROUTING_INSTANCE, "ri-1"),
        reference.store.derived(ROUTING_INSTANCE, "ri-1")
    );
    assert_ne!(
        store.derived(ROUTE_TARGET, "rt-1"),
        reference.store.derived(ROUTE_TARGET, "rt-1")
    );
    let queue = first.queue().to_string();
    assert_eq!(bus.inflight_len(&queue), 1);
    drop(first);
    store.clear_stall(ROUTE_TARGET, "rt-1");

    let mut second = Harness::with_backends(
        graphs::routing_instances,
        HarnessOptions::default(),
        store.clone(),
        bus.clone(),
    )
    .unwrap();
    second.start().await.unwrap();
    assert_eq!(bus.ready_len(&queue), 1);
    assert_eq!(
        second.consumer.poll_once().await.unwrap(),
        Some(DeliveryOutcome::Acked)
    );
    assert_eq!(bus.ready_len(&queue), 0);
    assert_eq!(bus.inflight_len(&queue), 0);

    for (obj_type, id) in [(ROUTING_INSTANCE, "ri-1"), (ROUTE_TARGET, "rt-1")] {
        assert_eq!(
            store.derived(obj_type, id),
            reference.store.derived(obj_type, id),
            "{obj_type}:{id}"
        );
    }
}
