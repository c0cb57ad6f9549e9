use serde::{Deserialize, Serialize};

use crate::intent::{Branch, Route};

/// Target id that terminates the graph.
pub const END: &str = "__end__";

/// An edge connecting two nodes in the workflow graph.
///
/// A node with several outgoing edges fans out; its targets must all lead to
/// the same join node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: EdgeCondition,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    #[default]
    Always,
    /// Traverse only if the route decision includes `branch`.
    Routed { branch: Branch },
}

impl EdgeCondition {
    pub fn branch(&self) -> Option<Branch> {
        match self {
            Self::Always => None,
            Self::Routed { branch } => Some(*branch),
        }
    }
}

impl Edge {
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
        }
    }

    pub fn routed(from: impl Into<String>, to: impl Into<String>, branch: Branch) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Routed { branch },
        }
    }
}

/// Whether a target gated by `gate` runs under `route`.
///
/// Before any routing decision is made every edge is open.
pub fn is_open(gate: Option<Branch>, route: Option<&Route>) -> bool {
    match (gate, route) {
        (None, _) | (_, None) => true,
        (Some(branch), Some(route)) => route.allows(branch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn edge_serde_roundtrip() {
        let edge = Edge::routed("route", "trend", Branch::Trend);
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json["condition"]["type"], "routed");
        assert_eq!(json["condition"]["branch"], "trend");
        let back: Edge = serde_json::from_value(json).unwrap();
        assert_eq!(back, edge);

        let plain: Edge = serde_json::from_str(r#"{"from": "a", "to": "b"}"#).unwrap();
        assert_eq!(plain.condition, EdgeCondition::Always);
    }

    #[test]
    fn gating() {
        let only_trend = Route::Only(BTreeSet::from([Branch::Trend]));
        assert!(is_open(None, Some(&only_trend)));
        assert!(is_open(Some(Branch::Trend), Some(&only_trend)));
        assert!(!is_open(Some(Branch::Filing), Some(&only_trend)));
        assert!(is_open(Some(Branch::Filing), None));
        assert!(is_open(Some(Branch::Filing), Some(&Route::All)));
    }
}
