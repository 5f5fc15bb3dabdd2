//! Diff Engine (C10, §4.10): a pure, deterministic semantic diff between two
//! [`DiagramSpec`] values, used for timeline rendering and changelog text.
//!
//! Identity rules: nodes by `id`, edges by `from→to`, groups by `id`. Field
//! deltas are reported only for fields that actually changed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::spec::{DiagramSpec, Edge, Group, Node, Theme};

/// A single changed field on a node/edge/group, as a before/after string pair.
///
/// Values are rendered with `Debug` rather than kept as the original typed
/// value — a diff is display data, not a patch to reapply (see
/// [`crate::codec::NodePatch`] for that).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    pub field: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// What happened to a single node between two specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeDiff {
    Added { id: String },
    Removed { id: String },
    Modified { id: String, fields: Vec<FieldDelta> },
}

/// What happened to a single edge between two specs, identified by `from→to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeDiff {
    Added { from: String, to: String },
    Removed { from: String, to: String },
    Modified { from: String, to: String, fields: Vec<FieldDelta> },
}

/// What happened to a single group between two specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupDiff {
    Added { id: String },
    Removed { id: String },
    Modified { id: String, fields: Vec<FieldDelta> },
}

/// The full diff between two specs: element-level changes plus spec-level
/// metadata changes (`type`, `theme`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecDiff {
    pub meta: Vec<FieldDelta>,
    pub nodes: Vec<NodeDiff>,
    pub edges: Vec<EdgeDiff>,
    pub groups: Vec<GroupDiff>,
}

impl SpecDiff {
    /// `true` iff nothing changed between the two specs at all.
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.nodes.is_empty() && self.edges.is_empty() && self.groups.is_empty()
    }
}

fn delta<T: PartialEq + std::fmt::Debug>(field: &str, before: &T, after: &T) -> Option<FieldDelta> {
    if before == after {
        None
    } else {
        Some(FieldDelta { field: field.into(), before: Some(format!("{before:?}")), after: Some(format!("{after:?}")) })
    }
}

fn delta_opt<T: PartialEq + std::fmt::Debug>(field: &str, before: &Option<T>, after: &Option<T>) -> Option<FieldDelta> {
    if before == after {
        None
    } else {
        Some(FieldDelta {
            field: field.into(),
            before: before.as_ref().map(|v| format!("{v:?}")),
            after: after.as_ref().map(|v| format!("{v:?}")),
        })
    }
}

fn theme_delta(before: &Option<Theme>, after: &Option<Theme>) -> Option<FieldDelta> {
    delta_opt("theme", before, after)
}

fn node_fields(before: &Node, after: &Node) -> Vec<FieldDelta> {
    [
        delta("label", &before.label, &after.label),
        delta_opt("type", &before.shape, &after.shape),
        delta_opt("color", &before.color, &after.color),
        delta_opt("details", &before.details, &after.details),
        delta_opt("position", &before.position, &after.position),
        delta_opt("width", &before.width, &after.width),
        delta_opt("height", &before.height, &after.height),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn edge_fields(before: &Edge, after: &Edge) -> Vec<FieldDelta> {
    [
        delta_opt("label", &before.label, &after.label),
        delta_opt("style", &before.style, &after.style),
        delta_opt("color", &before.color, &after.color),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn group_fields(before: &Group, after: &Group) -> Vec<FieldDelta> {
    [
        delta("label", &before.label, &after.label),
        delta("nodeIds", &before.node_ids, &after.node_ids),
        delta_opt("color", &before.color, &after.color),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Computes a [`SpecDiff`] between `before` and `after`.
pub fn diff(before: &DiagramSpec, after: &DiagramSpec) -> SpecDiff {
    let mut meta = Vec::new();
    if before.diagram_type != after.diagram_type {
        meta.push(FieldDelta {
            field: "type".into(),
            before: Some(format!("{:?}", before.diagram_type)),
            after: Some(format!("{:?}", after.diagram_type)),
        });
    }
    if let Some(d) = theme_delta(&before.theme, &after.theme) {
        meta.push(d);
    }

    let before_nodes: HashMap<&str, &Node> = before.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let after_nodes: HashMap<&str, &Node> = after.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut nodes = Vec::new();
    for (id, n) in &before_nodes {
        if !after_nodes.contains_key(id) {
            nodes.push(NodeDiff::Removed { id: n.id.clone() });
        }
    }
    for (id, n) in &after_nodes {
        match before_nodes.get(id) {
            None => nodes.push(NodeDiff::Added { id: n.id.clone() }),
            Some(before_n) => {
                let fields = node_fields(before_n, n);
                if !fields.is_empty() {
                    nodes.push(NodeDiff::Modified { id: n.id.clone(), fields });
                }
            }
        }
    }

    let edge_key = |e: &Edge| (e.from.clone(), e.to.clone());
    let before_edges: HashMap<(String, String), &Edge> = before.edges.iter().map(|e| (edge_key(e), e)).collect();
    let after_edges: HashMap<(String, String), &Edge> = after.edges.iter().map(|e| (edge_key(e), e)).collect();
    let mut edges = Vec::new();
    for (key, e) in &before_edges {
        if !after_edges.contains_key(key) {
            edges.push(EdgeDiff::Removed { from: e.from.clone(), to: e.to.clone() });
        }
    }
    for (key, e) in &after_edges {
        match before_edges.get(key) {
            None => edges.push(EdgeDiff::Added { from: e.from.clone(), to: e.to.clone() }),
            Some(before_e) => {
                let fields = edge_fields(before_e, e);
                if !fields.is_empty() {
                    edges.push(EdgeDiff::Modified { from: e.from.clone(), to: e.to.clone(), fields });
                }
            }
        }
    }

    let before_groups: HashMap<&str, &Group> = before.groups.iter().map(|g| (g.id.as_str(), g)).collect();
    let after_groups: HashMap<&str, &Group> = after.groups.iter().map(|g| (g.id.as_str(), g)).collect();
    let mut groups = Vec::new();
    for (id, g) in &before_groups {
        if !after_groups.contains_key(id) {
            groups.push(GroupDiff::Removed { id: g.id.clone() });
        }
    }
    for (id, g) in &after_groups {
        match before_groups.get(id) {
            None => groups.push(GroupDiff::Added { id: g.id.clone() }),
            Some(before_g) => {
                let fields = group_fields(before_g, g);
                if !fields.is_empty() {
                    groups.push(GroupDiff::Modified { id: g.id.clone(), fields });
                }
            }
        }
    }

    SpecDiff { meta, nodes, edges, groups }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::DiagramType;

    fn node(id: &str, label: &str) -> Node {
        Node {
            id: id.into(),
            label: label.into(),
            shape: None,
            color: None,
            position: None,
            width: None,
            height: None,
            details: None,
            stereotype: None,
            attributes: vec![],
            methods: vec![],
            swimlane: None,
        }
    }

    #[test]
    fn identical_specs_diff_to_empty() {
        let spec = DiagramSpec::empty(DiagramType::Flowchart);
        let result = diff(&spec, &spec);
        assert!(result.is_empty());
    }

    #[test]
    fn detects_added_and_removed_nodes() {
        let mut before = DiagramSpec::empty(DiagramType::Flowchart);
        before.nodes.push(node("a", "A"));
        let mut after = DiagramSpec::empty(DiagramType::Flowchart);
        after.nodes.push(node("b", "B"));

        let result = diff(&before, &after);
        assert!(result.nodes.contains(&NodeDiff::Removed { id: "a".into() }));
        assert!(result.nodes.contains(&NodeDiff::Added { id: "b".into() }));
    }

    #[test]
    fn detects_label_change_as_a_field_delta() {
        let mut before = DiagramSpec::empty(DiagramType::Flowchart);
        before.nodes.push(node("a", "Old"));
        let mut after = DiagramSpec::empty(DiagramType::Flowchart);
        after.nodes.push(node("a", "New"));

        let result = diff(&before, &after);
        match &result.nodes[..] {
            [NodeDiff::Modified { id, fields }] => {
                assert_eq!(id, "a");
                assert!(fields.iter().any(|f| f.field == "label"));
            }
            other => panic!("expected one Modified diff, got {other:?}"),
        }
    }

    #[test]
    fn detects_edge_identity_by_from_to_not_id() {
        let mut before = DiagramSpec::empty(DiagramType::Flowchart);
        before.nodes.push(node("a", "A"));
        before.nodes.push(node("b", "B"));
        before.edges.push(Edge { id: Some("e1".into()), from: "a".into(), to: "b".into(), label: None, style: None, color: None });

        let mut after = before.clone();
        after.edges[0].id = Some("e2".into());
        after.edges[0].label = Some("hi".into());

        let result = diff(&before, &after);
        match &result.edges[..] {
            [EdgeDiff::Modified { from, to, fields }] => {
                assert_eq!((from.as_str(), to.as_str()), ("a", "b"));
                assert!(fields.iter().any(|f| f.field == "label"));
            }
            other => panic!("expected one Modified edge diff, got {other:?}"),
        }
    }

    #[test]
    fn detects_meta_type_change() {
        let before = DiagramSpec::empty(DiagramType::Flowchart);
        let after = DiagramSpec::empty(DiagramType::Sequence);
        let result = diff(&before, &after);
        assert!(result.meta.iter().any(|f| f.field == "type"));
    }
}
