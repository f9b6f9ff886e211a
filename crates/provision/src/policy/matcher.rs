//! Policy eligibility.

use std::collections::BTreeSet;

use tracing::{error, trace};

use crate::models::{MatchMode, Policy};

/// Compare a node's tags with a policy's tags.
///
/// `or` needs a shared tag; `and` needs every policy tag on the node.
#[must_use]
pub fn tags_match(node_tags: &BTreeSet<String>, policy: &Policy) -> bool {
    match policy.match_using {
        MatchMode::Or => policy.tags.iter().any(|t| node_tags.contains(t)),
        MatchMode::And => policy.tags.iter().all(|t| node_tags.contains(t)),
    }
}

/// Whether `policy` should bind a node carrying `node_tags`.
///
/// A tagged policy must be enabled, under its maximum and match the tags.
/// A tagless policy matches only when it is the default. Anything else is
/// a configuration error and never matches.
#[must_use]
pub fn matches(policy: &Policy, node_tags: &BTreeSet<String>, default_id: Option<&str>) -> bool {
    if policy.tags.is_empty() {
        if default_id == Some(policy.uuid.as_str()) {
            return true;
        }
        error!(
            policy_id = %policy.uuid,
            label = %policy.label,
            "Policy has no tags and is not the default policy; ignoring"
        );
        return false;
    }

    let eligible = policy.enabled && policy.is_under_maximum() && tags_match(node_tags, policy);
    trace!(policy_id = %policy.uuid, eligible, "Evaluated policy");
    eligible
}

/// First policy flagged as default, in table order.
#[must_use]
pub fn default_policy(ordered: &[Policy]) -> Option<&Policy> {
    ordered.iter().find(|p| p.is_default)
}
