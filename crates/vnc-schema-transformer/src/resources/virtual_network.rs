//! Virtual network connectivity

use super::network_policy::policy_rules;
use super::{publish_uve, sorted_ids, NETWORK_POLICY};
use crate::uve::UvePublisher;
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;
use vnc_sync_common::{CachedObject, EvalContext, EvalResult, ObjectHandler, PropertyBag};

/// Derives the networks a virtual network is connected to through its
/// attached policies.
pub struct VirtualNetworkHandler {
    uve: Arc<dyn UvePublisher>,
}

impl VirtualNetworkHandler {
    pub fn new(uve: Arc<dyn UvePublisher>) -> Self {
        Self { uve }
    }
}

#[async_trait]
impl ObjectHandler for VirtualNetworkHandler {
    async fn on_evaluate(
        &self,
        obj: &CachedObject,
        cx: EvalContext<'_>,
    ) -> EvalResult<Option<PropertyBag>> {
        let mut connected = BTreeSet::new();
        for policy_id in obj.ref_ids("network_policy_refs") {
            let Some(policy) = cx.cache.get(NETWORK_POLICY, policy_id) else {
                continue;
            };
            // An invalid policy is reported on its own evaluation.
            let Ok(rules) = policy_rules(policy) else {
                debug!(vn = %obj.id, policy = %policy_id, "Skipping invalid policy");
                continue;
            };
            connected.extend(
                rules
                    .iter()
                    .filter_map(|rule| rule.peer_of(&obj.id))
                    .map(str::to_string),
            );
        }

        let derived = json!({
            "routing_instances": sorted_ids(obj, "routing_instances"),
            "network_policies": sorted_ids(obj, "network_policy_refs"),
            "connected_networks": connected,
        });
        let derived = derived.as_object().cloned().unwrap_or_default();

        publish_uve(self.uve.as_ref(), obj, &derived).await?;
        Ok(Some(derived))
    }
}
