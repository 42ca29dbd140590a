use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::policy::composite::{CompositePolicy, Custom};
use crate::policy::predicate::Predicate;
use crate::types::NodeView;

/// Closure type behind [`NodePolicy::Custom`].
pub type NodePredicate = dyn Fn(&dyn NodeView) -> bool + Send + Sync;

/// Decides which nodes a module sees.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodePolicy {
    /// Every node.
    All,
    /// No node.
    None,
    /// Nodes without any label starting with `prefix`.
    ExcludeInternal {
        /// Reserved label prefix.
        prefix: String,
    },
    /// Label and property match.
    Include(IncludeNodes),
    /// Named closure.
    Custom(Custom<NodePredicate>),
    /// Short-circuit AND.
    Composite(CompositePolicy<NodePolicy>),
}

impl NodePolicy {
    /// Wraps a closure under a stable name.
    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&dyn NodeView) -> bool + Send + Sync + 'static,
    {
        let predicate: Arc<NodePredicate> = Arc::new(predicate);
        NodePolicy::Custom(Custom::new(name, predicate))
    }

    /// AND of `policies`; fails with `EmptyComposite` when there are none.
    pub fn all_of(policies: impl IntoIterator<Item = NodePolicy>) -> Result<Self> {
        Ok(NodePolicy::Composite(CompositePolicy::of(policies)?))
    }

    /// Whether `node` is visible.
    pub fn include(&self, node: &dyn NodeView) -> bool {
        match self {
            NodePolicy::All => true,
            NodePolicy::None => false,
            NodePolicy::ExcludeInternal { prefix } => {
                !node.labels().iter().any(|l| l.starts_with(prefix.as_str()))
            }
            NodePolicy::Include(fluent) => fluent.include(node),
            NodePolicy::Custom(custom) => (custom.predicate())(node),
            NodePolicy::Composite(composite) => composite.include(node),
        }
    }
}

impl CompositePolicy<NodePolicy> {
    /// Whether every sub-policy includes `node`, stopping at the first that does not.
    pub fn include(&self, node: &dyn NodeView) -> bool {
        self.policies().iter().all(|p| p.include(node))
    }
}

impl From<IncludeNodes> for NodePolicy {
    fn from(fluent: IncludeNodes) -> Self {
        NodePolicy::Include(fluent)
    }
}

/// Fluent node policy: an optional label AND a map of property predicates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct IncludeNodes {
    label: Option<String>,
    properties: BTreeMap<String, Predicate>,
}

impl IncludeNodes {
    /// Matches every node until narrowed.
    pub fn all() -> Self {
        Self::default()
    }

    /// Requires the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Requires `predicate` to hold for property `key`.
    pub fn with_property(mut self, key: impl Into<String>, predicate: Predicate) -> Self {
        self.properties.insert(key.into(), predicate);
        self
    }

    /// Whether `node` matches.
    pub fn include(&self, node: &dyn NodeView) -> bool {
        if let Some(label) = &self.label {
            if !node.has_label(label) {
                return false;
            }
        }
        self.properties
            .iter()
            .all(|(key, predicate)| predicate.evaluate(node.property(key).as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::host::NodeRecord;
    use crate::types::{NodeId, PropValue};

    fn person(age: i64) -> NodeRecord {
        NodeRecord {
            id: NodeId(1),
            labels: BTreeSet::from(["Person".to_owned()]),
            properties: [("age".to_owned(), PropValue::Int(age))].into_iter().collect(),
        }
    }

    #[test]
    fn fluent_policy_ands_label_and_properties() {
        let adults = IncludeNodes::all()
            .with_label("Person")
            .with_property("age", Predicate::greater_than(17));
        assert!(adults.include(&person(30)));
        assert!(!adults.include(&person(12)));
        let robots = IncludeNodes::all().with_label("Robot");
        assert!(!robots.include(&person(30)));
    }

    #[test]
    fn composite_short_circuits_left_to_right() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let composite = NodePolicy::all_of([
            NodePolicy::None,
            NodePolicy::custom("counting", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }),
        ])?;
        assert!(!composite.include(&person(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn composite_equality_is_order_sensitive() -> Result<()> {
        let a = NodePolicy::all_of([NodePolicy::All, NodePolicy::None])?;
        let b = NodePolicy::all_of([NodePolicy::All, NodePolicy::None])?;
        let c = NodePolicy::all_of([NodePolicy::None, NodePolicy::All])?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn internal_labels_are_hidden() {
        let mut node = person(1);
        node.labels.insert("_SRT_Meta".into());
        let policy = NodePolicy::ExcludeInternal {
            prefix: "_SRT_".into(),
        };
        assert!(!policy.include(&node));
        assert!(policy.include(&person(1)));
    }
}
