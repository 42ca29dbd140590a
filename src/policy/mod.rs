//! Inclusion policies.
//!
//! Every module declares one [`InclusionPolicies`] bundle saying which
//! nodes, relationships and property keys it wants to observe. The runtime
//! prepends the internal-prefix exclusion to each policy so that bookkeeping
//! entities never reach business modules.

mod composite;
mod node;
mod predicate;
mod property;
mod relationship;

pub use composite::{CompositePolicy, Custom};
pub use node::{IncludeNodes, NodePolicy, NodePredicate};
pub use predicate::Predicate;
pub use property::{PropertyPolicy, PropertyPredicate};
pub use relationship::{IncludeRelationships, RelationshipPolicy, RelationshipPredicate};

/// The four policies a module observes the graph through.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InclusionPolicies {
    /// Node policy.
    pub nodes: NodePolicy,
    /// Node property policy.
    pub node_properties: PropertyPolicy,
    /// Relationship policy.
    pub relationships: RelationshipPolicy,
    /// Relationship property policy.
    pub relationship_properties: PropertyPolicy,
}

impl Default for InclusionPolicies {
    fn default() -> Self {
        Self::all()
    }
}

impl InclusionPolicies {
    /// Sees everything.
    pub fn all() -> Self {
        Self {
            nodes: NodePolicy::All,
            node_properties: PropertyPolicy::All,
            relationships: RelationshipPolicy::All,
            relationship_properties: PropertyPolicy::All,
        }
    }

    /// Sees nothing.
    pub fn none() -> Self {
        Self {
            nodes: NodePolicy::None,
            node_properties: PropertyPolicy::None,
            relationships: RelationshipPolicy::None,
            relationship_properties: PropertyPolicy::None,
        }
    }

    /// Replaces the node policy.
    pub fn with_nodes(mut self, policy: impl Into<NodePolicy>) -> Self {
        self.nodes = policy.into();
        self
    }

    /// Replaces the node property policy.
    pub fn with_node_properties(mut self, policy: PropertyPolicy) -> Self {
        self.node_properties = policy;
        self
    }

    /// Replaces the relationship policy.
    pub fn with_relationships(mut self, policy: impl Into<RelationshipPolicy>) -> Self {
        self.relationships = policy.into();
        self
    }

    /// Replaces the relationship property policy.
    pub fn with_relationship_properties(mut self, policy: PropertyPolicy) -> Self {
        self.relationship_properties = policy;
        self
    }

    /// Same policies with the internal-prefix exclusion evaluated first.
    pub fn business(&self, prefix: &str) -> Self {
        let prefix = prefix.to_owned();
        Self {
            nodes: NodePolicy::Composite(CompositePolicy::pair(
                NodePolicy::ExcludeInternal {
                    prefix: prefix.clone(),
                },
                self.nodes.clone(),
            )),
            node_properties: PropertyPolicy::Composite(CompositePolicy::pair(
                PropertyPolicy::ExcludeInternal {
                    prefix: prefix.clone(),
                },
                self.node_properties.clone(),
            )),
            relationships: RelationshipPolicy::Composite(CompositePolicy::pair(
                RelationshipPolicy::ExcludeInternal {
                    prefix: prefix.clone(),
                },
                self.relationships.clone(),
            )),
            relationship_properties: PropertyPolicy::Composite(CompositePolicy::pair(
                PropertyPolicy::ExcludeInternal { prefix },
                self.relationship_properties.clone(),
            )),
        }
    }
}
