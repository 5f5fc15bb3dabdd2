//! The validated diagram document tree (§3.1).

use serde::{Deserialize, Serialize};

/// Diagram kind. Determines which of `messages`/`relationships` are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagramType {
    Flowchart,
    Architecture,
    Sequence,
    Er,
    State,
    Class,
    Mindmap,
    Network,
    Freeform,
}

/// Visual theme applied by the client renderer. Not interpreted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Dark,
    Light,
    Professional,
}

/// Node shape. The validator only checks membership; rendering is external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeShape {
    Rectangle,
    RoundedRectangle,
    Circle,
    Diamond,
    Hexagon,
    Cylinder,
    Cloud,
    Triangle,
    Parallelogram,
    Actor,
    Interface,
    Note,
    Custom,
}

/// Edge stroke style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStyle {
    Solid,
    Dashed,
    Dotted,
}

/// `sequence`-only message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceMessageType {
    Sync,
    Async,
    Return,
    Create,
    Destroy,
}

/// `er`-only relationship cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    #[serde(rename = "1:1")]
    OneToOne,
    #[serde(rename = "1:N")]
    OneToMany,
    #[serde(rename = "N:1")]
    ManyToOne,
    #[serde(rename = "N:M")]
    ManyToMany,
}

/// `er`-only participation constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Participation {
    Total,
    Partial,
}

/// A 2D point in diagram canvas coordinates, each in `[-100_000, 100_000]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A class/entity member field, e.g. `{name: "id", type: "u64"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
}

/// A class/entity method signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Method {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
}

/// A single diagram node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub label: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub shape: Option<NodeShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stereotype: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<Attribute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<Method>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swimlane: Option<String>,
}

/// A directed edge between two node ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<EdgeStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// A named cluster of node ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub node_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// A `sequence`-diagram message between two participant node ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceMessage {
    pub from: String,
    pub to: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: SequenceMessageType,
    pub order: u32,
}

/// An `er`-diagram relationship between two entity node ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErRelationship {
    pub entity1: String,
    pub entity2: String,
    pub cardinality: Cardinality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participation1: Option<Participation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participation2: Option<Participation>,
}

/// The validated JSON document describing a diagram's contents (§3.1).
///
/// `node_color`/`edge_color`/`background_color` are the persisted targets of
/// a hub `update_style` change (§4.6): a room-wide default stroke/fill that
/// the client applies to any node/edge lacking its own `color`. They are
/// spec-level, not per-element, which is why they live here rather than on
/// [`Node`]/[`Edge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramSpec {
    #[serde(rename = "type")]
    pub diagram_type: DiagramType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub messages: Vec<SequenceMessage>,
    #[serde(default)]
    pub relationships: Vec<ErRelationship>,
}

impl DiagramSpec {
    /// An empty spec of the given type; used by `Create` when no spec is supplied.
    pub fn empty(diagram_type: DiagramType) -> Self {
        Self {
            diagram_type,
            theme: None,
            node_color: None,
            edge_color: None,
            background_color: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            groups: Vec::new(),
            messages: Vec::new(),
            relationships: Vec::new(),
        }
    }
}

/// A decoded spec tagged with whether it passed strict validation.
///
/// Produced by the lenient validator (§4.1) for reads of legacy rows: the tree
/// decodes even if it wouldn't pass today's strict rules, and `valid=false`
/// surfaces that as observability rather than a fatal read error.
#[derive(Debug, Clone, PartialEq)]
pub struct LenientSpec {
    pub spec: DiagramSpec,
    pub valid: bool,
    pub issues: Vec<crate::error::ValidationIssue>,
}
