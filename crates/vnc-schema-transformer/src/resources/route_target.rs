//! Route target validation

use super::{publish_uve, sorted_ids};
use crate::error::{Result, SchemaTransformerError};
use crate::uve::UvePublisher;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use vnc_sync_common::{CachedObject, EvalContext, EvalError, EvalResult, ObjectHandler, PropertyBag};

/// `target:<asn>:<number>`
static ROUTE_TARGET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^target:(\d+):(\d+)$").expect("Invalid regex pattern"));

/// Splits a route target name into autonomous system and number.
pub fn parse_route_target(name: &str) -> Result<(u32, u32)> {
    let invalid = || SchemaTransformerError::InvalidRouteTarget {
        name: name.to_string(),
    };
    let caps = ROUTE_TARGET_RE.captures(name).ok_or_else(invalid)?;
    let asn = caps[1].parse().map_err(|_| invalid())?;
    let n = caps[2].parse().map_err(|_| invalid())?;
    Ok((asn, n))
}

/// Validates route targets and lists the routing instances using them.
pub struct RouteTargetHandler {
    uve: Arc<dyn UvePublisher>,
}

impl RouteTargetHandler {
    pub fn new(uve: Arc<dyn UvePublisher>) -> Self {
        Self { uve }
    }
}

#[async_trait]
impl ObjectHandler for RouteTargetHandler {
    async fn on_evaluate(
        &self,
        obj: &CachedObject,
        _cx: EvalContext<'_>,
    ) -> EvalResult<Option<PropertyBag>> {
        let name = obj
            .property("name")
            .and_then(Value::as_str)
            .unwrap_or(&obj.id);
        let (asn, number) = parse_route_target(name).map_err(EvalError::from)?;

        let derived = json!({
            "name": name,
            "autonomous_system": asn,
            "number": number,
            "routing_instances": sorted_ids(obj, "routing_instance_back_refs"),
        });
        let derived = derived.as_object().cloned().unwrap_or_default();

        publish_uve(self.uve.as_ref(), obj, &derived).await?;
        Ok(Some(derived))
    }
}
