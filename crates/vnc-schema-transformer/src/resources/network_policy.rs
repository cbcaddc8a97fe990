//! Network policy validation

use super::{publish_uve, sorted_ids};
use crate::error::{Result, SchemaTransformerError};
use crate::uve::UvePublisher;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use vnc_sync_common::{CachedObject, EvalContext, EvalError, EvalResult, ObjectHandler, PropertyBag};

/// Action of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Pass,
    Deny,
}

impl PolicyAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "pass" => Some(PolicyAction::Pass),
            "deny" => Some(PolicyAction::Deny),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRule {
    action: String,
    #[serde(default)]
    src: Option<String>,
    #[serde(default)]
    dst: Option<String>,
}

/// One rule of a policy's `rules` list, between two virtual networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub action: PolicyAction,
    pub src: Option<String>,
    pub dst: Option<String>,
}

impl PolicyRule {
    /// Returns the network on the other side of a `pass` rule that has
    /// `network` on one side.
    pub fn peer_of(&self, network: &str) -> Option<&str> {
        if self.action != PolicyAction::Pass {
            return None;
        }
        match (self.src.as_deref(), self.dst.as_deref()) {
            (Some(src), Some(dst)) if src == network && dst != network => Some(dst),
            (Some(src), Some(dst)) if dst == network && src != network => Some(src),
            _ => None,
        }
    }
}

/// Parses and validates the rules of a policy object.
pub fn policy_rules(obj: &CachedObject) -> Result<Vec<PolicyRule>> {
    let Some(raw) = obj.property("rules") else {
        return Ok(Vec::new());
    };
    let rules: Vec<RawRule> =
        serde_json::from_value(raw.clone()).map_err(|e| SchemaTransformerError::MalformedRules {
            policy: obj.id.clone(),
            message: e.to_string(),
        })?;

    rules
        .into_iter()
        .enumerate()
        .map(|(index, rule)| -> Result<PolicyRule> {
            let action = PolicyAction::parse(&rule.action).ok_or_else(|| {
                SchemaTransformerError::InvalidPolicyAction {
                    policy: obj.id.clone(),
                    index,
                    action: rule.action.clone(),
                }
            })?;
            Ok(PolicyRule {
                action,
                src: rule.src,
                dst: rule.dst,
            })
        })
        .collect()
}

/// Validates policies and lists the networks they are attached to.
pub struct NetworkPolicyHandler {
    uve: Arc<dyn UvePublisher>,
}

impl NetworkPolicyHandler {
    pub fn new(uve: Arc<dyn UvePublisher>) -> Self {
        Self { uve }
    }
}

#[async_trait]
impl ObjectHandler for NetworkPolicyHandler {
    async fn on_evaluate(
        &self,
        obj: &CachedObject,
        _cx: EvalContext<'_>,
    ) -> EvalResult<Option<PropertyBag>> {
        let rules = policy_rules(obj).map_err(EvalError::from)?;

        let derived = json!({
            "rule_count": rules.len(),
            "virtual_networks": sorted_ids(obj, "virtual_network_back_refs"),
        });
        let derived = derived.as_object().cloned().unwrap_or_default();

        publish_uve(self.uve.as_ref(), obj, &derived).await?;
        Ok(Some(derived))
    }
}
