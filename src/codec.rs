//! Message Codec (C6): the wire schema exchanged over a room's WebSocket
//! connections, plus the size/shape checks every inbound frame passes through
//! before it reaches the hub (§4.6).

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::quota;
use crate::spec::color::is_valid_color;
use crate::spec::{Attribute, DiagramSpec, Edge, EdgeStyle, Method, Node, NodeShape, Position, Theme};

/// Hard cap on a single WebSocket frame (§4.6, §6.1, §6.5).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const CURSOR_RANGE: std::ops::RangeInclusive<f64> = -1_000_000.0..=1_000_000.0;
const MAX_SELECTION: usize = 100;
const MAX_SELECTION_ID_LEN: usize = 100;
const MAX_CHANGES_PER_BATCH: usize = 100;
const MAX_NAME_LEN: usize = 100;
const MAX_DIAGRAM_ID_LEN: usize = 100;

/// A partial [`Node`] update (§4.6 `update_node`). Every field is optional;
/// the codec rejects a patch with none set via [`NodePatch::is_empty`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePatch {
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub shape: Option<NodeShape>,
    pub color: Option<String>,
    pub position: Option<Position>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub details: Option<String>,
    pub stereotype: Option<String>,
    pub attributes: Option<Vec<Attribute>>,
    pub methods: Option<Vec<Method>>,
    pub swimlane: Option<String>,
}

impl NodePatch {
    pub fn is_empty(&self) -> bool {
        self.label.is_none()
            && self.shape.is_none()
            && self.color.is_none()
            && self.position.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.details.is_none()
            && self.stereotype.is_none()
            && self.attributes.is_none()
            && self.methods.is_none()
            && self.swimlane.is_none()
    }

    /// Applies the set fields onto `node` in place.
    pub fn apply(self, node: &mut Node) {
        if let Some(v) = self.label {
            node.label = v;
        }
        if let Some(v) = self.shape {
            node.shape = Some(v);
        }
        if let Some(v) = self.color {
            node.color = Some(v);
        }
        if let Some(v) = self.position {
            node.position = Some(v);
        }
        if let Some(v) = self.width {
            node.width = Some(v);
        }
        if let Some(v) = self.height {
            node.height = Some(v);
        }
        if let Some(v) = self.details {
            node.details = Some(v);
        }
        if let Some(v) = self.stereotype {
            node.stereotype = Some(v);
        }
        if let Some(v) = self.attributes {
            node.attributes = v;
        }
        if let Some(v) = self.methods {
            node.methods = v;
        }
        if let Some(v) = self.swimlane {
            node.swimlane = Some(v);
        }
    }
}

/// A partial [`Edge`] update (§4.6 `update_edge`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgePatch {
    pub label: Option<String>,
    pub style: Option<EdgeStyle>,
    pub color: Option<String>,
}

impl EdgePatch {
    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.style.is_none() && self.color.is_none()
    }

    pub fn apply(self, edge: &mut Edge) {
        if let Some(v) = self.label {
            edge.label = Some(v);
        }
        if let Some(v) = self.style {
            edge.style = Some(v);
        }
        if let Some(v) = self.color {
            edge.color = Some(v);
        }
    }
}

/// A style-wide patch (§4.6 `update_style`). Targets [`DiagramSpec::theme`]
/// and the spec-level default colors, not any single node/edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StylePatch {
    pub theme: Option<Theme>,
    pub node_color: Option<String>,
    pub edge_color: Option<String>,
    pub background_color: Option<String>,
}

impl StylePatch {
    pub fn is_empty(&self) -> bool {
        self.theme.is_none() && self.node_color.is_none() && self.edge_color.is_none() && self.background_color.is_none()
    }

    fn validate(&self) -> Result<(), TransportError> {
        for (field, color) in [
            ("nodeColor", &self.node_color),
            ("edgeColor", &self.edge_color),
            ("backgroundColor", &self.background_color),
        ] {
            if let Some(c) = color {
                if !is_valid_color(c) {
                    return Err(TransportError::InvalidChangeData(format!("{field}: invalid color {c}")));
                }
            }
        }
        Ok(())
    }

    pub fn apply(self, spec: &mut DiagramSpec) {
        if let Some(v) = self.theme {
            spec.theme = Some(v);
        }
        if let Some(v) = self.node_color {
            spec.node_color = Some(v);
        }
        if let Some(v) = self.edge_color {
            spec.edge_color = Some(v);
        }
        if let Some(v) = self.background_color {
            spec.background_color = Some(v);
        }
    }
}

/// A single element-level mutation inside a `change` batch (§4.6).
///
/// Distinct from the full-document [`DiagramSpec`] diff produced by the Diff
/// Engine (C10) — this is the granular, client-authored edit the hub applies
/// to the live document via [`crate::storage::Storage::update`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DiagramChange {
    AddNode { data: Node },
    UpdateNode { target: String, data: NodePatch },
    RemoveNode { target: String },
    AddEdge { data: Edge },
    UpdateEdge { target: String, data: EdgePatch },
    RemoveEdge { target: String },
    UpdateStyle { data: StylePatch },
}

impl DiagramChange {
    /// Shape-level validation that doesn't require the document the change
    /// applies to (§4.6): target id lengths, non-empty patches, valid colors.
    /// Referential integrity (does `target` exist?) is checked when the
    /// change is actually applied, since that requires the live spec.
    fn validate_shape(&self) -> Result<(), TransportError> {
        let check_target = |target: &str| -> Result<(), TransportError> {
            if target.is_empty() || target.len() > MAX_SELECTION_ID_LEN {
                return Err(TransportError::InvalidChangeData(format!(
                    "target must be 1..={MAX_SELECTION_ID_LEN} chars"
                )));
            }
            Ok(())
        };
        match self {
            DiagramChange::AddNode { .. } | DiagramChange::AddEdge { .. } => Ok(()),
            DiagramChange::UpdateNode { target, data } => {
                check_target(target)?;
                if data.is_empty() {
                    return Err(TransportError::InvalidChangeData("update_node requires >=1 field".into()));
                }
                if let Some(color) = &data.color {
                    if !is_valid_color(color) {
                        return Err(TransportError::InvalidChangeData(format!("color: invalid color {color}")));
                    }
                }
                Ok(())
            }
            DiagramChange::RemoveNode { target } => check_target(target),
            DiagramChange::UpdateEdge { target, data } => {
                check_target(target)?;
                if data.is_empty() {
                    return Err(TransportError::InvalidChangeData("update_edge requires >=1 field".into()));
                }
                if let Some(color) = &data.color {
                    if !is_valid_color(color) {
                        return Err(TransportError::InvalidChangeData(format!("color: invalid color {color}")));
                    }
                }
                Ok(())
            }
            DiagramChange::RemoveEdge { target } => check_target(target),
            DiagramChange::UpdateStyle { data } => {
                if data.is_empty() {
                    return Err(TransportError::InvalidChangeData("update_style requires >=1 field".into()));
                }
                data.validate()
            }
        }
    }
}

/// A 2D cursor position broadcast for presence (§4.6, §4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// A client-authored message (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        diagram_id: String,
        #[serde(default = "default_name")]
        name: String,
    },
    Leave,
    Cursor {
        x: f64,
        y: f64,
    },
    #[serde(rename_all = "camelCase")]
    Selection {
        node_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Change {
        changes: Vec<DiagramChange>,
        base_version: u64,
    },
    Ping,
}

fn default_name() -> String {
    "Anonymous".to_string()
}

/// A participant's public presence state as broadcast to a room (§3.1, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: String,
    pub name: String,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selection: Vec<String>,
    pub last_seen: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// The room-state snapshot sent to a joining participant (§4.6 `joined`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub diagram_id: String,
    pub participants: Vec<ParticipantInfo>,
    pub version: u64,
}

/// A server-authored message (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined { participant: ParticipantInfo, room: RoomSnapshot },
    ParticipantJoined { participant: ParticipantInfo },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { participant_id: String },
    #[serde(rename_all = "camelCase")]
    CursorUpdate { participant_id: String, cursor: CursorPosition },
    #[serde(rename_all = "camelCase")]
    SelectionUpdate { participant_id: String, node_ids: Vec<String> },
    Changes { changes: Vec<DiagramChange>, author: String, version: u64 },
    Sync { spec: DiagramSpec, version: u64 },
    #[serde(rename_all = "camelCase")]
    Conflict { message: String, current_version: u64 },
    Error { code: String, message: String },
    Pong,
}

impl ServerMessage {
    /// Builds an `error` frame from any of the crate's typed error codes
    /// (§6.2/§6.3).
    pub fn error(code: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ServerMessage::Error { code: code.into(), message: message.to_string() }
    }
}

/// Decodes and shape-validates a raw client frame (§4.6).
///
/// Oversized frames are rejected before JSON parsing; `join`/`cursor`/
/// `selection` field bounds and a `change` batch's structural rules
/// (including the batch-local add quota, §4.2) are checked before the
/// message is handed to the hub.
pub fn decode_client_message(raw: &[u8]) -> Result<ClientMessage, TransportError> {
    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge { size: raw.len(), max: MAX_MESSAGE_SIZE });
    }
    let message: ClientMessage =
        serde_json::from_slice(raw).map_err(|e| TransportError::InvalidJson(e.to_string()))?;

    validate_message(&message)?;
    Ok(message)
}

fn validate_message(message: &ClientMessage) -> Result<(), TransportError> {
    match message {
        ClientMessage::Join { diagram_id, name } => {
            if diagram_id.is_empty() || diagram_id.len() > MAX_DIAGRAM_ID_LEN {
                return Err(TransportError::InvalidMessage(format!(
                    "diagramId must be 1..={MAX_DIAGRAM_ID_LEN} chars"
                )));
            }
            if name.len() > MAX_NAME_LEN {
                return Err(TransportError::InvalidMessage(format!("name must be <={MAX_NAME_LEN} chars")));
            }
            Ok(())
        }
        ClientMessage::Leave | ClientMessage::Ping => Ok(()),
        ClientMessage::Cursor { x, y } => {
            if !CURSOR_RANGE.contains(x) || !CURSOR_RANGE.contains(y) {
                return Err(TransportError::InvalidMessage("cursor out of range".into()));
            }
            Ok(())
        }
        ClientMessage::Selection { node_ids } => {
            if node_ids.len() > MAX_SELECTION {
                return Err(TransportError::InvalidMessage(format!("selection exceeds max {MAX_SELECTION}")));
            }
            if node_ids.iter().any(|id| id.is_empty() || id.len() > MAX_SELECTION_ID_LEN) {
                return Err(TransportError::InvalidMessage(format!(
                    "selection ids must be 1..={MAX_SELECTION_ID_LEN} chars"
                )));
            }
            Ok(())
        }
        ClientMessage::Change { changes, .. } => {
            if changes.len() > MAX_CHANGES_PER_BATCH {
                return Err(TransportError::InvalidMessage(format!(
                    "change batch exceeds max {MAX_CHANGES_PER_BATCH}"
                )));
            }
            for change in changes {
                change.validate_shape().map_err(|e| match e {
                    TransportError::InvalidChangeData(m) => TransportError::InvalidChangeData(m),
                    other => other,
                })?;
            }
            let add_nodes = changes.iter().filter(|c| matches!(c, DiagramChange::AddNode { .. })).count();
            let add_edges = changes.iter().filter(|c| matches!(c, DiagramChange::AddEdge { .. })).count();
            quota::check_change_batch(add_nodes, add_edges)?;
            Ok(())
        }
    }
}

/// Encodes a server frame to its wire form (§4.6). Infallible: every
/// `ServerMessage` variant always serializes.
pub fn encode_server_message(message: &ServerMessage) -> Vec<u8> {
    serde_json::to_vec(message).expect("ServerMessage always serializes")
}

/// Applies one change to `spec` in place (used by the hub after the batch
/// passes [`decode_client_message`]'s shape validation).
///
/// Referential checks against the live document (does `target` exist?) live
/// here rather than in shape validation, which never sees the document.
pub fn apply_change(spec: &mut DiagramSpec, change: DiagramChange) -> Result<(), TransportError> {
    match change {
        DiagramChange::AddNode { data } => {
            if spec.nodes.iter().any(|n| n.id == data.id) {
                return Err(TransportError::InvalidChangeData(format!("duplicate node id: {}", data.id)));
            }
            spec.nodes.push(data);
        }
        DiagramChange::UpdateNode { target, data } => {
            let node = spec
                .nodes
                .iter_mut()
                .find(|n| n.id == target)
                .ok_or_else(|| TransportError::InvalidChangeData(format!("unknown node: {target}")))?;
            data.apply(node);
        }
        DiagramChange::RemoveNode { target } => {
            let before = spec.nodes.len();
            spec.nodes.retain(|n| n.id != target);
            if spec.nodes.len() == before {
                return Err(TransportError::InvalidChangeData(format!("unknown node: {target}")));
            }
            spec.edges.retain(|e| e.from != target && e.to != target);
            for group in &mut spec.groups {
                group.node_ids.retain(|id| id != &target);
            }
        }
        DiagramChange::AddEdge { data } => {
            let has_from = spec.nodes.iter().any(|n| n.id == data.from);
            let has_to = spec.nodes.iter().any(|n| n.id == data.to);
            if !has_from || !has_to {
                return Err(TransportError::InvalidChangeData("edge endpoint references unknown node".into()));
            }
            spec.edges.push(data);
        }
        DiagramChange::UpdateEdge { target, data } => {
            let edge = spec
                .edges
                .iter_mut()
                .find(|e| e.id.as_deref() == Some(target.as_str()))
                .ok_or_else(|| TransportError::InvalidChangeData(format!("unknown edge: {target}")))?;
            data.apply(edge);
        }
        DiagramChange::RemoveEdge { target } => {
            let before = spec.edges.len();
            spec.edges.retain(|e| e.id.as_deref() != Some(target.as_str()));
            if spec.edges.len() == before {
                return Err(TransportError::InvalidChangeData(format!("unknown edge: {target}")));
            }
        }
        DiagramChange::UpdateStyle { data } => data.apply(spec),
    }
    Ok(())
}
