//! BGP router peering

use super::{cached_ids, publish_uve, BGP_ROUTER};
use crate::uve::UvePublisher;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use vnc_sync_common::{CachedObject, EvalContext, EvalResult, ObjectHandler, PropertyBag};

pub struct BgpRouterHandler {
    autonomous_system: u32,
    uve: Arc<dyn UvePublisher>,
}

impl BgpRouterHandler {
    pub fn new(autonomous_system: u32, uve: Arc<dyn UvePublisher>) -> Self {
        Self {
            autonomous_system,
            uve,
        }
    }
}

#[async_trait]
impl ObjectHandler for BgpRouterHandler {
    async fn on_evaluate(
        &self,
        obj: &CachedObject,
        cx: EvalContext<'_>,
    ) -> EvalResult<Option<PropertyBag>> {
        let asn = obj
            .property("autonomous_system")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(self.autonomous_system));

        let derived = json!({
            "peers": cached_ids(obj, "bgp_router_refs", BGP_ROUTER, cx.cache),
            "autonomous_system": asn,
        });
        let derived = derived.as_object().cloned().unwrap_or_default();

        publish_uve(self.uve.as_ref(), obj, &derived).await?;
        Ok(Some(derived))
    }
}
