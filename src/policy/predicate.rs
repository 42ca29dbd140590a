use std::cmp::Ordering;

use crate::types::PropValue;

/// Typed predicate over an optional property value.
///
/// Used by the fluent [`IncludeNodes`](super::IncludeNodes) and
/// [`IncludeRelationships`](super::IncludeRelationships) builders in place of
/// string expressions.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Predicate {
    /// The property is present, whatever its value.
    Any,
    /// The property is absent.
    Undefined,
    /// The property equals the value.
    EqualTo(PropValue),
    /// The property compares greater than the value.
    GreaterThan(PropValue),
    /// The property compares less than the value.
    LessThan(PropValue),
    /// At least one predicate holds.
    Or(Vec<Predicate>),
    /// Every predicate holds.
    And(Vec<Predicate>),
    /// The predicate does not hold.
    Not(Box<Predicate>),
}

impl Predicate {
    /// `EqualTo(value)`.
    pub fn equal_to(value: impl Into<PropValue>) -> Self {
        Predicate::EqualTo(value.into())
    }

    /// `GreaterThan(value)`.
    pub fn greater_than(value: impl Into<PropValue>) -> Self {
        Predicate::GreaterThan(value.into())
    }

    /// `LessThan(value)`.
    pub fn less_than(value: impl Into<PropValue>) -> Self {
        Predicate::LessThan(value.into())
    }

    /// Logical OR with `other`.
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut all) => {
                all.push(other);
                Predicate::Or(all)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    /// Logical AND with `other`.
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut all) => {
                all.push(other);
                Predicate::And(all)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Logical negation.
    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Evaluates against a property value, `None` meaning absent.
    ///
    /// Ordering predicates are false for absent or incomparable values.
    pub fn evaluate(&self, value: Option<&PropValue>) -> bool {
        match self {
            Predicate::Any => value.is_some(),
            Predicate::Undefined => value.is_none(),
            Predicate::EqualTo(expected) => value == Some(expected),
            Predicate::GreaterThan(bound) => {
                value.and_then(|v| v.compare(bound)) == Some(Ordering::Greater)
            }
            Predicate::LessThan(bound) => value.and_then(|v| v.compare(bound)) == Some(Ordering::Less),
            Predicate::Or(all) => all.iter().any(|p| p.evaluate(value)),
            Predicate::And(all) => all.iter().all(|p| p.evaluate(value)),
            Predicate::Not(inner) => !inner.evaluate(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparisons_reject_absent_and_incomparable() {
        let gt = Predicate::greater_than(10);
        assert!(gt.evaluate(Some(&PropValue::Int(11))));
        assert!(gt.evaluate(Some(&PropValue::Float(10.5))));
        assert!(!gt.evaluate(Some(&PropValue::Int(10))));
        assert!(!gt.evaluate(None));
        assert!(!gt.evaluate(Some(&"11".into())));
    }

    #[test]
    fn combinators_nest() {
        let teen = Predicate::greater_than(12).and(Predicate::less_than(20));
        let missing_or_teen = Predicate::Undefined.or(teen);
        assert!(missing_or_teen.evaluate(None));
        assert!(missing_or_teen.evaluate(Some(&PropValue::Int(15))));
        assert!(!missing_or_teen.evaluate(Some(&PropValue::Int(30))));
        assert!(missing_or_teen.negate().evaluate(Some(&PropValue::Int(30))));
    }

    #[test]
    fn any_requires_presence() {
        assert!(Predicate::Any.evaluate(Some(&PropValue::Bool(false))));
        assert!(!Predicate::Any.evaluate(None));
    }
}
