use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::policy::composite::{CompositePolicy, Custom};
use crate::types::EntityView;

/// Closure type behind [`PropertyPolicy::Custom`].
pub type PropertyPredicate = dyn Fn(&str, &dyn EntityView) -> bool + Send + Sync;

/// Decides which property keys a module sees on an included entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PropertyPolicy {
    /// Every key.
    All,
    /// No key.
    None,
    /// Keys not starting with `prefix`.
    ExcludeInternal {
        /// Reserved key prefix.
        prefix: String,
    },
    /// Only the listed keys.
    Keys(BTreeSet<String>),
    /// Every key except the listed ones.
    ExceptKeys(BTreeSet<String>),
    /// Named closure over key and owning entity.
    Custom(Custom<PropertyPredicate>),
    /// Short-circuit AND.
    Composite(CompositePolicy<PropertyPolicy>),
}

impl PropertyPolicy {
    /// Only the listed keys.
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PropertyPolicy::Keys(keys.into_iter().map(Into::into).collect())
    }

    /// Every key except the listed ones.
    pub fn except_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PropertyPolicy::ExceptKeys(keys.into_iter().map(Into::into).collect())
    }

    /// Wraps a closure under a stable name.
    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&str, &dyn EntityView) -> bool + Send + Sync + 'static,
    {
        let predicate: Arc<PropertyPredicate> = Arc::new(predicate);
        PropertyPolicy::Custom(Custom::new(name, predicate))
    }

    /// AND of `policies`; fails with `EmptyComposite` when there are none.
    pub fn all_of(policies: impl IntoIterator<Item = PropertyPolicy>) -> Result<Self> {
        Ok(PropertyPolicy::Composite(CompositePolicy::of(policies)?))
    }

    /// Whether property `key` of `owner` is visible.
    pub fn include(&self, key: &str, owner: &dyn EntityView) -> bool {
        match self {
            PropertyPolicy::All => true,
            PropertyPolicy::None => false,
            PropertyPolicy::ExcludeInternal { prefix } => !key.starts_with(prefix.as_str()),
            PropertyPolicy::Keys(keys) => keys.contains(key),
            PropertyPolicy::ExceptKeys(keys) => !keys.contains(key),
            PropertyPolicy::Custom(custom) => (custom.predicate())(key, owner),
            PropertyPolicy::Composite(composite) => composite.include(key, owner),
        }
    }
}

impl CompositePolicy<PropertyPolicy> {
    /// Whether every sub-policy includes the key, stopping at the first that does not.
    pub fn include(&self, key: &str, owner: &dyn EntityView) -> bool {
        self.policies().iter().all(|p| p.include(key, owner))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::host::NodeRecord;
    use crate::types::NodeId;

    #[test]
    fn key_sets_and_internal_prefix() -> Result<()> {
        let node = NodeRecord {
            id: NodeId(1),
            labels: BTreeSet::new(),
            properties: Default::default(),
        };
        let policy = PropertyPolicy::all_of([
            PropertyPolicy::ExcludeInternal {
                prefix: "_SRT_".into(),
            },
            PropertyPolicy::except_keys(["password"]),
        ])?;
        assert!(policy.include("name", &node));
        assert!(!policy.include("password", &node));
        assert!(!policy.include("_SRT_rank", &node));
        assert!(PropertyPolicy::keys(["a"]).include("a", &node));
        assert!(!PropertyPolicy::keys(["a"]).include("b", &node));
        Ok(())
    }
}
