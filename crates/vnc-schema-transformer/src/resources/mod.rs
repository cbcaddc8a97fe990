//! Resource types handled by the schema transformer and their reactions.
//!
//! ```text
//! routing_instance: self -> [route_target, virtual_network]
//! route_target:     self -> []
//! virtual_network:  self -> [routing_instance, network_policy]
//!                   network_policy_refs -> [network_policy]
//! network_policy:   self -> [virtual_network]
//! bgp_router:       self -> [bgp_router]
//! ```

mod bgp_router;
mod network_policy;
mod route_target;
mod routing_instance;
mod virtual_network;

pub use bgp_router::BgpRouterHandler;
pub use network_policy::{NetworkPolicyHandler, PolicyAction, PolicyRule};
pub use route_target::{parse_route_target, RouteTargetHandler};
pub use routing_instance::{RouteTargetAllocator, RoutingInstanceHandler};
pub use virtual_network::VirtualNetworkHandler;

use crate::config::TransformerConfig;
use crate::uve::{Uve, UvePublisher};
use serde_json::Value;
use std::sync::Arc;
use vnc_sync_common::{
    CachedObject, EvalError, EvalResult, ObjectCache, PropertyBag, Reactions, SyncEngineBuilder,
    TypeSchema,
};

pub const ROUTING_INSTANCE: &str = "routing_instance";
pub const ROUTE_TARGET: &str = "route_target";
pub const VIRTUAL_NETWORK: &str = "virtual_network";
pub const NETWORK_POLICY: &str = "network_policy";
pub const BGP_ROUTER: &str = "bgp_router";

/// State shared by the handlers of one transformer instance.
#[derive(Clone)]
pub struct TransformerContext {
    /// Autonomous system of auto-assigned route targets
    pub autonomous_system: u32,
    /// Route target number pool
    pub allocator: Arc<RouteTargetAllocator>,
    /// UVE sink
    pub uve: Arc<dyn UvePublisher>,
}

impl TransformerContext {
    /// Creates the context from configuration.
    pub fn new(config: &TransformerConfig, uve: Arc<dyn UvePublisher>) -> Self {
        Self {
            autonomous_system: config.autonomous_system,
            allocator: Arc::new(RouteTargetAllocator::new(
                config.route_target_start,
                config.route_target_end,
            )),
            uve,
        }
    }
}

/// Registers every transformer type on `builder`.
///
/// Virtual networks are listed and evaluated first on resync.
pub fn register_resources(
    builder: SyncEngineBuilder,
    cx: &TransformerContext,
) -> SyncEngineBuilder {
    builder
        .register_type(
            TypeSchema::new(ROUTE_TARGET).with_refs("routing_instance_back_refs", ROUTING_INSTANCE),
            Reactions::new(),
            Arc::new(RouteTargetHandler::new(cx.uve.clone())),
        )
        .register_type(
            TypeSchema::new(NETWORK_POLICY)
                .with_refs("virtual_network_back_refs", VIRTUAL_NETWORK),
            Reactions::new().on_self([VIRTUAL_NETWORK]),
            Arc::new(NetworkPolicyHandler::new(cx.uve.clone())),
        )
        .register_type_with_priority(
            TypeSchema::new(VIRTUAL_NETWORK)
                .with_refs("routing_instances", ROUTING_INSTANCE)
                .with_refs("network_policy_refs", NETWORK_POLICY),
            Reactions::new()
                .on_self([ROUTING_INSTANCE, NETWORK_POLICY])
                .on_relation("network_policy_refs", [NETWORK_POLICY]),
            Arc::new(VirtualNetworkHandler::new(cx.uve.clone())),
            0,
        )
        .register_type(
            TypeSchema::new(ROUTING_INSTANCE)
                .with_ref("parent_uuid", VIRTUAL_NETWORK)
                .with_refs("route_target_refs", ROUTE_TARGET),
            Reactions::new().on_self([ROUTE_TARGET, VIRTUAL_NETWORK]),
            Arc::new(RoutingInstanceHandler::new(
                cx.autonomous_system,
                cx.allocator.clone(),
                cx.uve.clone(),
            )),
        )
        .register_type(
            TypeSchema::new(BGP_ROUTER).with_refs("bgp_router_refs", BGP_ROUTER),
            Reactions::new().on_self([BGP_ROUTER]),
            Arc::new(BgpRouterHandler::new(cx.autonomous_system, cx.uve.clone())),
        )
}

/// UVE table of a resource type.
pub fn uve_table(obj_type: &str) -> &'static str {
    match obj_type {
        VIRTUAL_NETWORK => "ObjectVNTable",
        ROUTING_INSTANCE => "ObjectRoutingInstance",
        ROUTE_TARGET => "ObjectRouteTarget",
        NETWORK_POLICY => "ObjectNetworkPolicy",
        BGP_ROUTER => "ObjectBgpRouter",
        _ => "ObjectConfigNode",
    }
}

/// Reports `derived` as the UVE of `obj`.
pub(crate) async fn publish_uve(
    uve: &dyn UvePublisher,
    obj: &CachedObject,
    derived: &PropertyBag,
) -> EvalResult<()> {
    uve.publish(Uve::new(uve_table(&obj.obj_type), obj.id.clone(), derived.clone()))
        .await
        .map_err(EvalError::from)
}

/// Returns the ids of `field` that resolve in the cache, sorted.
pub(crate) fn cached_ids(
    obj: &CachedObject,
    field: &str,
    target: &str,
    cache: &ObjectCache,
) -> Vec<Value> {
    let mut ids: Vec<&String> = obj
        .ref_ids(field)
        .iter()
        .filter(|id| cache.contains(target, id))
        .collect();
    ids.sort();
    ids.dedup();
    ids.into_iter().map(|id| Value::String(id.clone())).collect()
}

/// Returns every id of `field`, sorted.
pub(crate) fn sorted_ids(obj: &CachedObject, field: &str) -> Vec<Value> {
    let mut ids = obj.ref_ids(field).to_vec();
    ids.sort();
    ids.dedup();
    ids.into_iter().map(Value::String).collect()
}
