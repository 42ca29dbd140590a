//! Identifiers, property values and directions shared across the runtime.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

mod view;

pub use view::{EntityView, NodeView, RelationshipView};

/// Identifier of a node, assigned by the host engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Identifier of a relationship, assigned by the host engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node({})", self.0)
    }
}

impl fmt::Display for RelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel({})", self.0)
    }
}

/// Reference to either kind of graph entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityRef {
    /// A node.
    Node(NodeId),
    /// A relationship.
    Relationship(RelId),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Node(id) => id.fmt(f),
            EntityRef::Relationship(id) => id.fmt(f),
        }
    }
}

impl From<NodeId> for EntityRef {
    fn from(id: NodeId) -> Self {
        EntityRef::Node(id)
    }
}

impl From<RelId> for EntityRef {
    fn from(id: RelId) -> Self {
        EntityRef::Relationship(id)
    }
}

/// Property value with owned data.
///
/// Floats compare and hash by bit pattern so that values can key maps and
/// take part in structural policy equality.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PropValue {
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// Owned string.
    Str(String),
    /// Owned byte vector.
    Bytes(Vec<u8>),
    /// Homogeneous or mixed list of values.
    List(Vec<PropValue>),
}

impl PropValue {
    /// Orders two values when they are comparable.
    ///
    /// Integers and floats compare numerically with each other; strings
    /// compare lexicographically. Every other pairing is incomparable.
    pub fn compare(&self, other: &PropValue) -> Option<Ordering> {
        match (self, other) {
            (PropValue::Int(a), PropValue::Int(b)) => Some(a.cmp(b)),
            (PropValue::Float(a), PropValue::Float(b)) => a.partial_cmp(b),
            (PropValue::Int(a), PropValue::Float(b)) => (*a as f64).partial_cmp(b),
            (PropValue::Float(a), PropValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (PropValue::Str(a), PropValue::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Returns the integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl PartialEq for PropValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropValue::Bool(a), PropValue::Bool(b)) => a == b,
            (PropValue::Int(a), PropValue::Int(b)) => a == b,
            (PropValue::Float(a), PropValue::Float(b)) => a.to_bits() == b.to_bits(),
            (PropValue::Str(a), PropValue::Str(b)) => a == b,
            (PropValue::Bytes(a), PropValue::Bytes(b)) => a == b,
            (PropValue::List(a), PropValue::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for PropValue {}

impl Hash for PropValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            PropValue::Bool(v) => v.hash(state),
            PropValue::Int(v) => v.hash(state),
            PropValue::Float(v) => v.to_bits().hash(state),
            PropValue::Str(v) => v.hash(state),
            PropValue::Bytes(v) => v.hash(state),
            PropValue::List(v) => v.hash(state),
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::Int(v) => write!(f, "{v}"),
            PropValue::Float(v) => write!(f, "{v}"),
            PropValue::Str(v) => write!(f, "{v}"),
            PropValue::Bytes(v) => write!(f, "bytes(len={})", v.len()),
            PropValue::List(v) => {
                write!(f, "[")?;
                for (idx, item) in v.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Str(v.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Str(v)
    }
}

/// Property bag keyed by property name.
pub type Properties = BTreeMap<String, PropValue>;

/// Direction of a relationship relative to a viewpoint node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// The viewpoint is the start node.
    Outgoing,
    /// The viewpoint is the end node.
    Incoming,
    /// Either end; also the resolution for self-relationships.
    Both,
}

impl Direction {
    /// Two directions match when they are equal or either one is [`Direction::Both`].
    pub fn matches(self, other: Direction) -> bool {
        self == Direction::Both || other == Direction::Both || self == other
    }
}

/// Resolves the direction of a relationship `(start, end)` from `viewpoint`.
///
/// Returns `None` when `viewpoint` is on neither end. Self-relationships
/// resolve to [`Direction::Both`].
pub fn resolve_direction(start: NodeId, end: NodeId, viewpoint: NodeId) -> Option<Direction> {
    if start != viewpoint && end != viewpoint {
        return None;
    }
    if start == end {
        return Some(Direction::Both);
    }
    if start == viewpoint {
        Some(Direction::Outgoing)
    } else {
        Some(Direction::Incoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_relationship_resolves_to_both() {
        let n = NodeId(7);
        assert_eq!(resolve_direction(n, n, n), Some(Direction::Both));
    }

    #[test]
    fn direction_is_relative_to_viewpoint() {
        let (a, b) = (NodeId(1), NodeId(2));
        assert_eq!(resolve_direction(a, b, a), Some(Direction::Outgoing));
        assert_eq!(resolve_direction(a, b, b), Some(Direction::Incoming));
        assert_eq!(resolve_direction(a, b, NodeId(3)), None);
    }

    #[test]
    fn both_matches_everything() {
        assert!(Direction::Both.matches(Direction::Incoming));
        assert!(Direction::Outgoing.matches(Direction::Both));
        assert!(!Direction::Outgoing.matches(Direction::Incoming));
    }

    #[test]
    fn mixed_numeric_comparison() {
        assert_eq!(
            PropValue::Int(2).compare(&PropValue::Float(1.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(PropValue::Bool(true).compare(&PropValue::Int(1)), None);
    }

    #[test]
    fn floats_compare_bitwise() {
        assert_eq!(PropValue::Float(f64::NAN), PropValue::Float(f64::NAN));
        assert_ne!(PropValue::Float(1.0), PropValue::Int(1));
    }
}
