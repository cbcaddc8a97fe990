//! Schema transformer handlers driven through the sync engine

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use vnc_schema_transformer::resources::{
    BGP_ROUTER, NETWORK_POLICY, ROUTE_TARGET, ROUTING_INSTANCE, VIRTUAL_NETWORK,
};
use vnc_schema_transformer::{
    register_resources, CollectingUvePublisher, TransformerConfig, TransformerContext,
};
use vnc_sync_common::{MemoryBus, MemoryStore, SyncEngineBuilder};
use vnc_sync_test::{ConfigObject, Harness, HarnessOptions, StoreVerifier};

struct Transformer {
    h: Harness,
    store: Arc<MemoryStore>,
    uve: Arc<CollectingUvePublisher>,
    cx: TransformerContext,
}

fn pool(size: u32) -> TransformerConfig {
    TransformerConfig {
        autonomous_system: 64512,
        route_target_start: 8_000_000,
        route_target_end: 8_000_000 + size,
    }
}

fn transformer(config: TransformerConfig) -> Transformer {
    transformer_over(config, Arc::new(MemoryStore::new()), MemoryBus::new())
}

/// A transformer process over existing backends, as after a restart.
fn transformer_over(
    config: TransformerConfig,
    store: Arc<MemoryStore>,
    bus: MemoryBus,
) -> Transformer {
    let uve = Arc::new(CollectingUvePublisher::new());
    let cx = TransformerContext::new(&config, uve.clone());
    let h = Harness::with_backends(
        |_| register_resources(SyncEngineBuilder::new(), &cx),
        HarnessOptions::default(),
        store.clone(),
        bus,
    )
    .unwrap();
    Transformer { h, store, uve, cx }
}

fn virtual_network(id: &str, instances: &[&str], policies: &[&str]) -> ConfigObject {
    ConfigObject::new(VIRTUAL_NETWORK, id)
        .with_field("display_name", id)
        .with_refs("routing_instances", instances.iter().copied())
        .with_refs("network_policy_refs", policies.iter().copied())
}

fn routing_instance(id: &str) -> ConfigObject {
    ConfigObject::new(ROUTING_INSTANCE, id).with_field("display_name", id)
}

fn route_target(id: &str, name: &str) -> ConfigObject {
    ConfigObject::new(ROUTE_TARGET, id).with_field("name", name)
}

fn pass_policy(id: &str, src: &str, dst: &str, action: &str) -> ConfigObject {
    ConfigObject::new(NETWORK_POLICY, id).with_field(
        "rules",
        json!([{ "action": action, "src": src, "dst": dst }]),
    )
}

#[tokio::test]
async fn test_resync_derives_routing_state() {
    let mut t = transformer(pool(10));
    virtual_network("vn-1", &["ri-1"], &["np-1"]).store_in(&t.h.store);
    virtual_network("vn-2", &[], &["np-1"]).store_in(&t.h.store);
    pass_policy("np-1", "vn-1", "vn-2", "pass")
        .with_refs("virtual_network_back_refs", ["vn-1", "vn-2"])
        .store_in(&t.h.store);
    routing_instance("ri-1")
        .with_single_ref("parent_uuid", "vn-1")
        .with_ref("route_target_refs", "rt-1")
        .store_in(&t.h.store);
    route_target("rt-1", "target:64512:100")
        .with_ref("routing_instance_back_refs", "ri-1")
        .store_in(&t.h.store);

    let report = t.h.start().await.unwrap();
    assert_eq!(report.listed, 5);
    assert_eq!(report.evaluated(), 5);
    assert_eq!(report.failed(), 0);

    let verifier = StoreVerifier::new(&t.store);
    verifier
        .assert_derived_field(ROUTING_INSTANCE, "ri-1", "route_target", &json!("target:64512:8000000"))
        .unwrap();
    verifier
        .assert_derived_field(
            ROUTING_INSTANCE,
            "ri-1",
            "route_target_list",
            &json!(["target:64512:100", "target:64512:8000000"]),
        )
        .unwrap();
    verifier
        .assert_derived_field(ROUTING_INSTANCE, "ri-1", "virtual_network", &json!("vn-1"))
        .unwrap();
    verifier
        .assert_derived_field(VIRTUAL_NETWORK, "vn-1", "connected_networks", &json!(["vn-2"]))
        .unwrap();
    verifier
        .assert_derived_field(VIRTUAL_NETWORK, "vn-2", "connected_networks", &json!(["vn-1"]))
        .unwrap();
    verifier
        .assert_derived_field(VIRTUAL_NETWORK, "vn-1", "routing_instances", &json!(["ri-1"]))
        .unwrap();
    verifier
        .assert_derived_field(NETWORK_POLICY, "np-1", "rule_count", &json!(1))
        .unwrap();
    verifier
        .assert_derived_field(ROUTE_TARGET, "rt-1", "routing_instances", &json!(["ri-1"]))
        .unwrap();

    let uve = t.uve.latest("ObjectVNTable", "vn-1").unwrap();
    assert_eq!(uve.attributes["connected_networks"], json!(["vn-2"]));
    assert_eq!(t.cx.allocator.in_use(), 1);
}

#[tokio::test]
async fn test_policy_changes_update_connected_networks() {
    let mut t = transformer(pool(10));
    virtual_network("vn-1", &[], &[]).store_in(&t.h.store);
    virtual_network("vn-2", &[], &["np-1"]).store_in(&t.h.store);
    let policy = pass_policy("np-1", "vn-1", "vn-2", "pass")
        .with_ref("virtual_network_back_refs", "vn-2");
    policy.store_in(&t.h.store);
    t.h.start().await.unwrap();

    let verifier = StoreVerifier::new(&t.store);
    verifier
        .assert_derived_field(VIRTUAL_NETWORK, "vn-1", "connected_networks", &json!([]))
        .unwrap();

    // Attach the policy to vn-1.
    let attached = virtual_network("vn-1", &[], &["np-1"]);
    attached.store_in(&t.h.store);
    let policy = pass_policy("np-1", "vn-1", "vn-2", "pass")
        .with_refs("virtual_network_back_refs", ["vn-1", "vn-2"]);
    policy.store_in(&t.h.store);
    t.h.apply(policy.update()).await.unwrap();
    t.h.apply(attached.update()).await.unwrap();
    verifier
        .assert_derived_field(VIRTUAL_NETWORK, "vn-1", "connected_networks", &json!(["vn-2"]))
        .unwrap();
    verifier
        .assert_derived_field(NETWORK_POLICY, "np-1", "virtual_networks", &json!(["vn-1", "vn-2"]))
        .unwrap();

    // Turning the rule into a deny disconnects both sides.
    let denied = pass_policy("np-1", "vn-1", "vn-2", "deny")
        .with_refs("virtual_network_back_refs", ["vn-1", "vn-2"]);
    denied.store_in(&t.h.store);
    let report = t.h.apply(denied.update()).await.unwrap();

    assert_eq!(report.evaluated, 3);
    verifier
        .assert_derived_field(VIRTUAL_NETWORK, "vn-1", "connected_networks", &json!([]))
        .unwrap();
    verifier
        .assert_derived_field(VIRTUAL_NETWORK, "vn-2", "connected_networks", &json!([]))
        .unwrap();
}

#[tokio::test]
async fn test_route_target_is_stable_and_released_on_delete() {
    let mut t = transformer(pool(10));
    t.h.start().await.unwrap();
    let verifier = StoreVerifier::new(&t.store);

    let ri1 = routing_instance("ri-1");
    ri1.store_in(&t.h.store);
    t.h.apply(ri1.create()).await.unwrap();
    let ri2 = routing_instance("ri-2");
    ri2.store_in(&t.h.store);
    t.h.apply(ri2.create()).await.unwrap();

    verifier
        .assert_derived_field(ROUTING_INSTANCE, "ri-2", "route_target", &json!("target:64512:8000001"))
        .unwrap();

    let renamed = ri1.with_field("display_name", "renamed");
    renamed.store_in(&t.h.store);
    let report = t.h.apply(renamed.update()).await.unwrap();
    assert_eq!(report.unchanged, 1);
    verifier
        .assert_derived_field(ROUTING_INSTANCE, "ri-1", "route_target", &json!("target:64512:8000000"))
        .unwrap();

    t.h.store.remove(ROUTING_INSTANCE, "ri-1");
    t.h.apply(renamed.delete()).await.unwrap();
    assert_eq!(t.cx.allocator.in_use(), 1);
    assert_eq!(t.cx.allocator.owned_by("ri-1"), None);

    let ri3 = routing_instance("ri-3");
    ri3.store_in(&t.h.store);
    t.h.apply(ri3.create()).await.unwrap();
    verifier
        .assert_derived_field(ROUTING_INSTANCE, "ri-3", "route_target", &json!("target:64512:8000000"))
        .unwrap();
}

#[tokio::test]
async fn test_exhausted_pool_is_a_business_error() {
    let mut t = transformer(pool(1));
    t.h.start().await.unwrap();

    let ri1 = routing_instance("ri-1");
    ri1.store_in(&t.h.store);
    t.h.apply(ri1.create()).await.unwrap();

    let ri2 = routing_instance("ri-2");
    ri2.store_in(&t.h.store);
    let report = t.h.apply(ri2.create()).await.unwrap();

    assert_eq!(report.evaluated, 1);
    assert_eq!(report.invalid, 1);
    let verifier = StoreVerifier::new(&t.store);
    verifier.assert_no_derived(ROUTING_INSTANCE, "ri-2").unwrap();
    verifier
        .assert_derived_exists(ROUTING_INSTANCE, "ri-1")
        .unwrap();
}

#[tokio::test]
async fn test_malformed_route_target_is_rejected() {
    let mut t = transformer(pool(10));
    route_target("rt-1", "target:64512:7").store_in(&t.h.store);
    route_target("rt-2", "route-target-two").store_in(&t.h.store);

    let report = t.h.start().await.unwrap();

    assert_eq!(report.pass.invalid, 1);
    let verifier = StoreVerifier::new(&t.store);
    verifier
        .assert_derived_field(ROUTE_TARGET, "rt-1", "number", &json!(7))
        .unwrap();
    verifier.assert_no_derived(ROUTE_TARGET, "rt-2").unwrap();
}

#[tokio::test]
async fn test_invalid_policy_does_not_block_network() {
    let mut t = transformer(pool(10));
    virtual_network("vn-1", &[], &["np-1"]).store_in(&t.h.store);
    pass_policy("np-1", "vn-1", "vn-2", "mirror")
        .with_ref("virtual_network_back_refs", "vn-1")
        .store_in(&t.h.store);

    let report = t.h.start().await.unwrap();

    assert_eq!(report.pass.invalid, 1);
    let verifier = StoreVerifier::new(&t.store);
    verifier.assert_no_derived(NETWORK_POLICY, "np-1").unwrap();
    verifier
        .assert_derived_field(VIRTUAL_NETWORK, "vn-1", "network_policies", &json!(["np-1"]))
        .unwrap();
    verifier
        .assert_derived_field(VIRTUAL_NETWORK, "vn-1", "connected_networks", &json!([]))
        .unwrap();
}

#[tokio::test]
async fn test_uve_failure_is_retried_by_resync() {
    let mut t = transformer(pool(10));
    t.h.start().await.unwrap();

    t.uve.set_failing(true);
    let vn = virtual_network("vn-1", &[], &[]);
    vn.store_in(&t.h.store);
    let report = t.h.apply(vn.create()).await.unwrap();

    assert_eq!(report.downstream, 1);
    let verifier = StoreVerifier::new(&t.store);
    verifier.assert_no_derived(VIRTUAL_NETWORK, "vn-1").unwrap();

    t.uve.set_failing(false);
    let report = t.h.resync().await.unwrap();
    assert_eq!(report.failed(), 0);
    verifier.assert_derived_exists(VIRTUAL_NETWORK, "vn-1").unwrap();
    assert!(t.uve.latest("ObjectVNTable", "vn-1").is_some());
}

#[tokio::test]
async fn test_bgp_peers_follow_arrivals() {
    let mut t = transformer(pool(10));
    ConfigObject::new(BGP_ROUTER, "br-1")
        .with_refs("bgp_router_refs", ["br-2", "br-3"])
        .store_in(&t.h.store);
    ConfigObject::new(BGP_ROUTER, "br-2")
        .with_field("autonomous_system", 65000)
        .store_in(&t.h.store);
    t.h.start().await.unwrap();

    let verifier = StoreVerifier::new(&t.store);
    verifier
        .assert_derived_field(BGP_ROUTER, "br-1", "peers", &json!(["br-2"]))
        .unwrap();
    verifier
        .assert_derived_field(BGP_ROUTER, "br-1", "autonomous_system", &json!(64512))
        .unwrap();
    verifier
        .assert_derived_field(BGP_ROUTER, "br-2", "autonomous_system", &json!(65000))
        .unwrap();

    let br3 = ConfigObject::new(BGP_ROUTER, "br-3");
    br3.store_in(&t.h.store);
    t.h.apply(br3.create()).await.unwrap();

    verifier
        .assert_derived_field(BGP_ROUTER, "br-1", "peers", &json!(["br-2", "br-3"]))
        .unwrap();
}

#[tokio::test]
async fn test_route_targets_survive_restart() {
    let store = Arc::new(MemoryStore::new());
    let mut first = transformer_over(pool(10), store.clone(), MemoryBus::new());
    first.h.start().await.unwrap();
    for id in ["ri-a", "ri-b"] {
        let ri = routing_instance(id);
        ri.store_in(&store);
        first.h.apply(ri.create()).await.unwrap();
    }
    drop(first);

    // Deleted while no transformer was running.
    store.remove(ROUTING_INSTANCE, "ri-a");

    let mut second = transformer_over(pool(10), store.clone(), MemoryBus::new());
    let report = second.h.start().await.unwrap();

    assert_eq!(report.restored, 1);
    assert_eq!(report.pass.unchanged, 1);
    StoreVerifier::new(&second.store)
        .assert_derived_field(ROUTING_INSTANCE, "ri-b", "route_target", &json!("target:64512:8000001"))
        .unwrap();
    assert_eq!(second.cx.allocator.owned_by("ri-b"), Some(8_000_001));
    assert_eq!(second.cx.allocator.owned_by("ri-a"), None);
}

#[tokio::test]
async fn test_restored_route_targets_are_claimed_before_new_instances() {
    let store = Arc::new(MemoryStore::new());
    let mut first = transformer_over(pool(10), store.clone(), MemoryBus::new());
    first.h.start().await.unwrap();
    for id in ["ri-a", "ri-b"] {
        let ri = routing_instance(id);
        ri.store_in(&store);
        first.h.apply(ri.create()).await.unwrap();
    }
    drop(first);

    // Listed, and evaluated, ahead of the existing instances.
    routing_instance("ri-0").store_in(&store);

    let mut second = transformer_over(pool(10), store.clone(), MemoryBus::new());
    let report = second.h.start().await.unwrap();

    assert_eq!(report.restored, 2);
    let verifier = StoreVerifier::new(&second.store);
    for (id, route_target) in [
        ("ri-a", "target:64512:8000000"),
        ("ri-b", "target:64512:8000001"),
        ("ri-0", "target:64512:8000002"),
    ] {
        verifier
            .assert_derived_field(ROUTING_INSTANCE, id, "route_target", &json!(route_target))
            .unwrap();
    }
    assert_eq!(second.cx.allocator.in_use(), 3);
}
