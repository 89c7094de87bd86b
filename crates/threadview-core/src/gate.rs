use crate::records::{GateRule, PostRecord, ThreadgateRecord};

/// Outcome of the store-free part of reply-gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateCheck {
    Allowed,
    Violated,
    /// The verdict depends on the owner's follows and/or list membership.
    Lookup(GateLookup),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateLookup {
    pub following: bool,
    pub list_uris: Vec<String>,
}

impl GateLookup {
    /// Whether the viewer violates the gate, given the two membership facts.
    #[must_use]
    pub fn violates(&self, followed_by_owner: bool, in_any_list: bool) -> bool {
        let via_follow = self.following && followed_by_owner;
        let via_list = !self.list_uris.is_empty() && in_any_list;
        !(via_follow || via_list)
    }
}

/// Evaluate a reply gate as far as possible without touching the store.
/// Mention rules are checked first.
#[must_use]
pub fn evaluate_gate(
    viewer: &str,
    owner: &str,
    root: Option<&PostRecord>,
    gate: Option<&ThreadgateRecord>,
) -> GateCheck {
    if viewer == owner {
        return GateCheck::Allowed;
    }
    let Some(allow) = gate.and_then(|gate| gate.allow.as_ref()) else {
        return GateCheck::Allowed;
    };

    let allow_mentions = allow.iter().any(|rule| matches!(rule, GateRule::Mention));
    if allow_mentions && root.is_some_and(|root| root.mentions(viewer)) {
        return GateCheck::Allowed;
    }

    let following = allow.iter().any(|rule| matches!(rule, GateRule::Following));
    let list_uris = allow
        .iter()
        .filter_map(|rule| match rule {
            GateRule::List { list } => Some(list.clone()),
            _ => None,
        })
        .collect::<Vec<_>>();
    if !following && list_uris.is_empty() {
        return GateCheck::Violated;
    }
    GateCheck::Lookup(GateLookup { following, list_uris })
}
