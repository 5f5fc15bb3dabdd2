//! Spec Validator (C1): parses and validates diagram JSON documents.
//!
//! Two modes, per §4.1: [`validate::parse_strict`] is used on every write into
//! the storage engine and fails closed on any issue; [`validate::parse_lenient`]
//! is used when reading rows written under older, looser rules and never
//! aborts a read — it returns the decoded tree plus a `valid` flag and the
//! issue list for callers to log.

pub mod color;
pub mod types;
pub mod validate;

pub use types::{
    Attribute, Cardinality, DiagramSpec, DiagramType, Edge, EdgeStyle, ErRelationship, Group,
    LenientSpec, Method, Node, NodeShape, Participation, Position, SequenceMessage,
    SequenceMessageType, Theme,
};
pub use validate::{parse_lenient, parse_strict, validate};
