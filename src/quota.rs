//! Quota Guard (C2): bounds spec size/shape and per-owner diagram counts (§4.2).

use serde::{Deserialize, Serialize};

use crate::error::{QuotaError, QuotaResource};
use crate::spec::DiagramSpec;

/// Configured limits consulted before every insert/update of a spec.
///
/// Defaults match §6.5; a deployment may tighten or loosen them via
/// [`crate::config::Config`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_nodes_per_diagram: usize,
    pub max_edges_per_diagram: usize,
    pub max_groups_per_diagram: usize,
    pub max_messages_per_diagram: usize,
    pub max_relationships_per_diagram: usize,
    pub max_spec_size_bytes: usize,
    pub max_diagrams_per_user: usize,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_nodes_per_diagram: 500,
            max_edges_per_diagram: 1000,
            max_groups_per_diagram: 50,
            max_messages_per_diagram: 200,
            max_relationships_per_diagram: 200,
            max_spec_size_bytes: 1_048_576,
            max_diagrams_per_user: 100,
        }
    }
}

/// Checks a spec's serialized size and element counts against `limits`.
///
/// Serializes the spec exactly once; the byte length is checked first since
/// it is the cheapest and most universal guard, then each collection length.
pub fn check_spec(spec: &DiagramSpec, limits: &QuotaLimits) -> Result<(), QuotaError> {
    let bytes = serde_json::to_vec(spec).expect("DiagramSpec always serializes");
    if bytes.len() > limits.max_spec_size_bytes {
        return Err(QuotaError {
            resource: QuotaResource::SpecBytes,
            limit: limits.max_spec_size_bytes,
            actual: bytes.len(),
        });
    }
    check_len(spec.nodes.len(), limits.max_nodes_per_diagram, QuotaResource::Nodes)?;
    check_len(spec.edges.len(), limits.max_edges_per_diagram, QuotaResource::Edges)?;
    check_len(spec.groups.len(), limits.max_groups_per_diagram, QuotaResource::Groups)?;
    check_len(spec.messages.len(), limits.max_messages_per_diagram, QuotaResource::Messages)?;
    check_len(
        spec.relationships.len(),
        limits.max_relationships_per_diagram,
        QuotaResource::Relationships,
    )?;
    Ok(())
}

/// Checks a prospective owner's diagram count against `limits`. Anonymous
/// owners (`None`) are unlimited.
pub fn check_owner_count(owned: usize, limits: &QuotaLimits) -> Result<(), QuotaError> {
    check_len(owned, limits.max_diagrams_per_user, QuotaResource::DiagramsPerUser)
}

fn check_len(actual: usize, limit: usize, resource: QuotaResource) -> Result<(), QuotaError> {
    if actual > limit {
        Err(QuotaError { resource, limit, actual })
    } else {
        Ok(())
    }
}

/// The cheaper, change-batch-local quota consulted by the message codec (C6)
/// before a `change` message ever reaches the storage engine.
pub const MAX_BATCH_ADD_NODES: usize = 100;
/// See [`MAX_BATCH_ADD_NODES`].
pub const MAX_BATCH_ADD_EDGES: usize = 500;

/// Checks a `change` batch's `add_node`/`add_edge` counts against the
/// batch-local quota (§4.2).
pub fn check_change_batch(add_node_count: usize, add_edge_count: usize) -> Result<(), QuotaError> {
    if add_node_count > MAX_BATCH_ADD_NODES {
        return Err(QuotaError {
            resource: QuotaResource::BatchAddNodes,
            limit: MAX_BATCH_ADD_NODES,
            actual: add_node_count,
        });
    }
    if add_edge_count > MAX_BATCH_ADD_EDGES {
        return Err(QuotaError {
            resource: QuotaResource::BatchAddEdges,
            limit: MAX_BATCH_ADD_EDGES,
            actual: add_edge_count,
        });
    }
    Ok(())
}
