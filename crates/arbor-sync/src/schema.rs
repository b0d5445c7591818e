//! What the synchronizer knows about concepts and child roles.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use arbor_types::ConceptRef;

/// How the children of a role are compared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleOrdering {
    /// The order of children is significant.
    Ordered,
    /// Only membership is significant.
    Unordered,
    /// The role is not declared; it is synchronized as if ordered.
    Unknown,
}

/// Source of concept and role metadata for a synchronization.
pub trait Schema: Send + Sync {
    /// Whether `concept` is known.
    fn resolves_concept(&self, concept: &ConceptRef) -> bool;

    /// How children of `role` below a node of `concept` are compared.
    fn role_ordering(&self, concept: Option<&ConceptRef>, role: Option<&str>) -> RoleOrdering;
}

/// A schema that knows nothing and needs nothing: every concept resolves
/// and every role is ordered.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenSchema;

impl Schema for OpenSchema {
    fn resolves_concept(&self, _concept: &ConceptRef) -> bool {
        true
    }

    fn role_ordering(&self, _concept: Option<&ConceptRef>, _role: Option<&str>) -> RoleOrdering {
        RoleOrdering::Ordered
    }
}

/// Child roles declared for one concept.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConceptDeclaration {
    pub ordered: HashSet<String>,
    pub unordered: HashSet<String>,
}

/// A schema with explicitly declared concepts and child roles.
///
/// Deserializes from a map of concept name to its declaration, for example
/// `{"lang.Class": {"ordered": ["members"], "unordered": ["annotations"]}}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeclaredSchema {
    concepts: HashMap<ConceptRef, ConceptDeclaration>,
}

impl DeclaredSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `concept` with its ordered and unordered child roles.
    pub fn concept<'a>(
        mut self,
        concept: impl Into<ConceptRef>,
        ordered: impl IntoIterator<Item = &'a str>,
        unordered: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let declaration = self.concepts.entry(concept.into()).or_default();
        declaration.ordered.extend(ordered.into_iter().map(str::to_owned));
        declaration.unordered.extend(unordered.into_iter().map(str::to_owned));
        self
    }

    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }
}

impl Schema for DeclaredSchema {
    fn resolves_concept(&self, concept: &ConceptRef) -> bool {
        self.concepts.contains_key(concept)
    }

    fn role_ordering(&self, concept: Option<&ConceptRef>, role: Option<&str>) -> RoleOrdering {
        let (Some(declaration), Some(role)) = (concept.and_then(|c| self.concepts.get(c)), role) else {
            return RoleOrdering::Unknown;
        };
        if declaration.unordered.contains(role) {
            RoleOrdering::Unordered
        } else if declaration.ordered.contains(role) {
            RoleOrdering::Ordered
        } else {
            RoleOrdering::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> DeclaredSchema {
        DeclaredSchema::new().concept("lang.Class", ["members"], ["annotations"])
    }

    #[test]
    fn declared_roles() {
        let schema = schema();
        let class = ConceptRef::from("lang.Class");
        assert!(schema.resolves_concept(&class));
        assert_eq!(schema.role_ordering(Some(&class), Some("members")), RoleOrdering::Ordered);
        assert_eq!(schema.role_ordering(Some(&class), Some("annotations")), RoleOrdering::Unordered);
    }

    #[test]
    fn undeclared_items_are_unknown() {
        let schema = schema();
        let class = ConceptRef::from("lang.Class");
        let other = ConceptRef::from("lang.Interface");
        assert!(!schema.resolves_concept(&other));
        assert_eq!(schema.role_ordering(Some(&other), Some("members")), RoleOrdering::Unknown);
        assert_eq!(schema.role_ordering(Some(&class), Some("extends")), RoleOrdering::Unknown);
        assert_eq!(schema.role_ordering(None, None), RoleOrdering::Unknown);
    }

    #[test]
    fn open_schema_orders_everything() {
        assert!(OpenSchema.resolves_concept(&ConceptRef::from("anything")));
        assert_eq!(OpenSchema.role_ordering(None, Some("x")), RoleOrdering::Ordered);
    }

    #[test]
    fn schema_from_json() {
        let json = r#"{"lang.Class": {"ordered": ["members"], "unordered": ["annotations"]}}"#;
        let parsed: DeclaredSchema = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, schema());
    }
}
