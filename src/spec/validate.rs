//! Strict and lenient spec validation (C1, §4.1).

use std::collections::HashSet;

use serde_json::Value;

use crate::error::{SpecError, ValidationIssue};
use crate::spec::color::is_valid_color;
use crate::spec::types::{DiagramSpec, DiagramType, LenientSpec};

const MAX_NODES: usize = 1000;
const MAX_EDGES: usize = 5000;
const MAX_GROUPS: usize = 100;
const MAX_MESSAGES: usize = 500;
const MAX_RELATIONSHIPS: usize = 500;
const MAX_NODE_ATTRS: usize = 50;
const MAX_NODE_METHODS: usize = 50;
const MAX_GROUP_MEMBERS: usize = 500;

const COORD_RANGE: std::ops::RangeInclusive<f64> = -100_000.0..=100_000.0;
const SIZE_RANGE: std::ops::RangeInclusive<f64> = 1.0..=10_000.0;
const SEQ_ORDER_RANGE: std::ops::RangeInclusive<u32> = 0..=10_000;

/// Parses and strictly validates `raw` as a [`DiagramSpec`].
///
/// Used on every write path into the storage engine (§4.4). Returns every
/// issue found, not just the first, so callers can report them all at once.
pub fn parse_strict(raw: &Value) -> Result<DiagramSpec, SpecError> {
    let spec: DiagramSpec = serde_json::from_value(raw.clone())
        .map_err(|e| SpecError::single("$", format!("could not decode spec: {e}")))?;
    let issues = validate(&spec);
    if issues.is_empty() {
        Ok(spec)
    } else {
        Err(SpecError { issues })
    }
}

/// Decodes `raw` leniently for reads of legacy rows (§4.1, §9 "Legacy data
/// tolerance"). Decoding failure is still fatal (the row is unreadable), but a
/// decodable spec that fails today's bound/referential checks is returned with
/// `valid=false` and the issue list, rather than rejected.
pub fn parse_lenient(raw: &Value) -> Result<LenientSpec, SpecError> {
    let spec: DiagramSpec = serde_json::from_value(raw.clone())
        .map_err(|e| SpecError::single("$", format!("could not decode spec: {e}")))?;
    let issues = validate(&spec);
    let valid = issues.is_empty();
    Ok(LenientSpec { spec, valid, issues })
}

/// Runs every bound and referential-integrity check from §3.1/§3.2(1) against
/// an already-decoded spec, returning all issues found (empty = valid).
pub fn validate(spec: &DiagramSpec) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if spec.nodes.len() > MAX_NODES {
        issues.push(issue("nodes", format!("{} nodes exceeds max {MAX_NODES}", spec.nodes.len())));
    }
    if spec.edges.len() > MAX_EDGES {
        issues.push(issue("edges", format!("{} edges exceeds max {MAX_EDGES}", spec.edges.len())));
    }
    if spec.groups.len() > MAX_GROUPS {
        issues.push(issue("groups", format!("{} groups exceeds max {MAX_GROUPS}", spec.groups.len())));
    }
    if spec.messages.len() > MAX_MESSAGES {
        issues.push(issue(
            "messages",
            format!("{} messages exceeds max {MAX_MESSAGES}", spec.messages.len()),
        ));
    }
    if spec.relationships.len() > MAX_RELATIONSHIPS {
        issues.push(issue(
            "relationships",
            format!("{} relationships exceeds max {MAX_RELATIONSHIPS}", spec.relationships.len()),
        ));
    }
    if !matches!(spec.diagram_type, DiagramType::Sequence) && !spec.messages.is_empty() {
        issues.push(issue("messages", "messages are only valid on sequence diagrams"));
    }
    if !matches!(spec.diagram_type, DiagramType::Er) && !spec.relationships.is_empty() {
        issues.push(issue("relationships", "relationships are only valid on er diagrams"));
    }
    for (field, color) in [
        ("nodeColor", &spec.node_color),
        ("edgeColor", &spec.edge_color),
        ("backgroundColor", &spec.background_color),
    ] {
        if let Some(c) = color {
            if !is_valid_color(c) {
                issues.push(issue(field, format!("invalid color: {c}")));
            }
        }
    }

    let mut node_ids: HashSet<&str> = HashSet::with_capacity(spec.nodes.len());
    for (i, node) in spec.nodes.iter().enumerate() {
        let path = format!("nodes[{i}]");
        if node.id.is_empty() || node.id.len() > 100 {
            issues.push(issue(format!("{path}.id"), "id must be 1..=100 chars"));
        }
        if node.label.is_empty() || node.label.len() > 1000 {
            issues.push(issue(format!("{path}.label"), "label must be 1..=1000 chars"));
        }
        if let Some(details) = &node.details {
            if details.len() > 5000 {
                issues.push(issue(format!("{path}.details"), "details must be <=5000 chars"));
            }
        }
        if let Some(color) = &node.color {
            if !is_valid_color(color) {
                issues.push(issue(format!("{path}.color"), format!("invalid color: {color}")));
            }
        }
        if let Some(pos) = &node.position {
            if !COORD_RANGE.contains(&pos.x) || !COORD_RANGE.contains(&pos.y) {
                issues.push(issue(format!("{path}.position"), "position out of range"));
            }
        }
        if let Some(w) = node.width {
            if !SIZE_RANGE.contains(&w) {
                issues.push(issue(format!("{path}.width"), "width out of range"));
            }
        }
        if let Some(h) = node.height {
            if !SIZE_RANGE.contains(&h) {
                issues.push(issue(format!("{path}.height"), "height out of range"));
            }
        }
        if node.attributes.len() > MAX_NODE_ATTRS {
            issues.push(issue(format!("{path}.attributes"), "too many attributes"));
        }
        if node.methods.len() > MAX_NODE_METHODS {
            issues.push(issue(format!("{path}.methods"), "too many methods"));
        }
        if !node_ids.insert(node.id.as_str()) {
            issues.push(issue(format!("{path}.id"), format!("duplicate node id: {}", node.id)));
        }
    }

    for (i, edge) in spec.edges.iter().enumerate() {
        let path = format!("edges[{i}]");
        check_ref(&mut issues, &node_ids, &edge.from, &format!("{path}.from"));
        check_ref(&mut issues, &node_ids, &edge.to, &format!("{path}.to"));
        if let Some(color) = &edge.color {
            if !is_valid_color(color) {
                issues.push(issue(format!("{path}.color"), format!("invalid color: {color}")));
            }
        }
    }

    for (i, group) in spec.groups.iter().enumerate() {
        let path = format!("groups[{i}]");
        if group.node_ids.len() > MAX_GROUP_MEMBERS {
            issues.push(issue(format!("{path}.nodeIds"), "too many members"));
        }
        for (j, member) in group.node_ids.iter().enumerate() {
            check_ref(&mut issues, &node_ids, member, &format!("{path}.nodeIds[{j}]"));
        }
        if let Some(color) = &group.color {
            if !is_valid_color(color) {
                issues.push(issue(format!("{path}.color"), format!("invalid color: {color}")));
            }
        }
    }

    for (i, msg) in spec.messages.iter().enumerate() {
        let path = format!("messages[{i}]");
        check_ref(&mut issues, &node_ids, &msg.from, &format!("{path}.from"));
        check_ref(&mut issues, &node_ids, &msg.to, &format!("{path}.to"));
        if !SEQ_ORDER_RANGE.contains(&msg.order) {
            issues.push(issue(format!("{path}.order"), "order out of range"));
        }
    }

    for (i, rel) in spec.relationships.iter().enumerate() {
        let path = format!("relationships[{i}]");
        check_ref(&mut issues, &node_ids, &rel.entity1, &format!("{path}.entity1"));
        check_ref(&mut issues, &node_ids, &rel.entity2, &format!("{path}.entity2"));
    }

    issues
}

fn check_ref(issues: &mut Vec<ValidationIssue>, node_ids: &HashSet<&str>, target: &str, path: &str) {
    if !node_ids.contains(target) {
        issues.push(issue(path, format!("references unknown node id: {target}")));
    }
}

fn issue(path: impl Into<String>, message: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        path: path.into(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flowchart_with_nodes(ids: &[&str]) -> Value {
        json!({
            "type": "flowchart",
            "nodes": ids.iter().map(|id| json!({"id": id, "label": id})).collect::<Vec<_>>(),
            "edges": [],
        })
    }

    #[test]
    fn accepts_minimal_valid_spec() {
        let raw = flowchart_with_nodes(&["a", "b"]);
        let spec = parse_strict(&raw).expect("should validate");
        assert_eq!(spec.nodes.len(), 2);
    }

    #[test]
    fn rejects_edge_to_unknown_node() {
        let mut raw = flowchart_with_nodes(&["a"]);
        raw["edges"] = json!([{"from": "a", "to": "missing"}]);
        let err = parse_strict(&raw).unwrap_err();
        assert!(err.issues.iter().any(|i| i.path == "edges[0].to"));
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let raw = flowchart_with_nodes(&["a", "a"]);
        let err = parse_strict(&raw).unwrap_err();
        assert!(err.issues.iter().any(|i| i.path == "nodes[1].id"));
    }

    #[test]
    fn rejects_messages_on_non_sequence_diagram() {
        let mut raw = flowchart_with_nodes(&["a", "b"]);
        raw["messages"] = json!([{"from": "a", "to": "b", "label": "hi", "type": "sync", "order": 0}]);
        let err = parse_strict(&raw).unwrap_err();
        assert!(err.issues.iter().any(|i| i.path == "messages"));
    }

    #[test]
    fn lenient_parse_surfaces_invalid_flag_without_erroring() {
        let mut raw = flowchart_with_nodes(&["a"]);
        raw["edges"] = json!([{"from": "a", "to": "ghost"}]);
        let lenient = parse_lenient(&raw).expect("should decode");
        assert!(!lenient.valid);
        assert!(!lenient.issues.is_empty());
    }
}
