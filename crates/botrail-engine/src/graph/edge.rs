use serde::{Deserialize, Serialize};

use super::descriptor::{Routing, StepDescriptor};

/// A directed edge between two steps of a validated graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// Which routing declaration produced an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeKind {
    Static,
    /// Taken when the produced value's route key equals `key`.
    Conditional { key: String },
    /// One of the declared targets of a dynamic resolver.
    Dynamic,
    /// Fan-out into the element step of a map region.
    FanOut,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
        }
    }

    /// Expand a step's routing into its outgoing edges.
    pub fn outgoing(step: &StepDescriptor) -> Vec<Edge> {
        let from = step.name.as_str();
        match &step.routing {
            Routing::None => vec![],
            Routing::Static(to) => vec![Edge::new(from, to, EdgeKind::Static)],
            Routing::Conditional(map) => map
                .iter()
                .map(|(key, to)| Edge::new(from, to, EdgeKind::Conditional { key: key.clone() }))
                .collect(),
            Routing::Dynamic { targets, .. } => targets
                .iter()
                .map(|to| Edge::new(from, to, EdgeKind::Dynamic))
                .collect(),
            Routing::MapFanOut(to) => vec![Edge::new(from, to, EdgeKind::FanOut)],
        }
    }

    pub fn is_fan_out(&self) -> bool {
        matches!(self.kind, EdgeKind::FanOut)
    }
}
