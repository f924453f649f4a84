//! Declarative relationship definitions and their registry.
//!
//! Cardinalities form a closed set; each variant carries its own join
//! lowering behavior, so the four cases stay exhaustively checked.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

use crate::error::{QueryError, Result};
use crate::ir::{JoinCondition, JoinType, JunctionSpec};

/// Relationship cardinality between a source and a target collection
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Cardinality {
    /// True when the joined side yields multiple rows per source row
    pub fn is_multi_result(&self) -> bool {
        matches!(self, Cardinality::OneToMany | Cardinality::ManyToMany)
    }

    pub fn join_type(&self) -> JoinType {
        match self {
            Cardinality::OneToOne => JoinType::OneToOne,
            Cardinality::OneToMany => JoinType::OneToMany,
            Cardinality::ManyToOne => JoinType::ManyToOne,
            Cardinality::ManyToMany => JoinType::ManyToMany,
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cardinality::OneToOne => write!(f, "one-to-one"),
            Cardinality::OneToMany => write!(f, "one-to-many"),
            Cardinality::ManyToOne => write!(f, "many-to-one"),
            Cardinality::ManyToMany => write!(f, "many-to-many"),
        }
    }
}

/// A declared relationship, registered once at bootstrap and immutable
/// afterwards. Looked up by (source collection, name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    pub name: String,
    pub target_table: String,
    pub local_field: String,
    pub foreign_field: String,
    pub cardinality: Cardinality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub junction: Option<JunctionSpec>,
}

impl RelationshipDefinition {
    pub fn new(
        name: impl Into<String>,
        target_table: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            target_table: target_table.into(),
            local_field: local_field.into(),
            foreign_field: foreign_field.into(),
            cardinality,
            junction: None,
        }
    }

    pub fn with_junction(mut self, junction: JunctionSpec) -> Self {
        self.junction = Some(junction);
        self
    }

    /// Many-to-many requires a junction; other cardinalities forbid one.
    pub fn validate(&self) -> Result<()> {
        match (self.cardinality, &self.junction) {
            (Cardinality::ManyToMany, None) => Err(QueryError::MalformedInput(format!(
                "relationship '{}' is many-to-many but declares no junction",
                self.name
            ))),
            (Cardinality::ManyToMany, Some(_)) => Ok(()),
            (_, Some(_)) => Err(QueryError::MalformedInput(format!(
                "relationship '{}' is {} and must not declare a junction",
                self.name, self.cardinality
            ))),
            (_, None) => Ok(()),
        }
    }

    /// The equality pairing plus join flavor this relationship lowers to
    pub fn join_condition(&self) -> JoinCondition {
        JoinCondition {
            local_field: self.local_field.clone(),
            foreign_field: self.foreign_field.clone(),
        }
    }

    pub fn is_multi_result(&self) -> bool {
        self.cardinality.is_multi_result()
    }
}

/// Registry of relationship definitions keyed by (source collection,
/// relationship name). Built by the composition root; read-only at
/// query time.
#[derive(Debug, Default)]
pub struct RelationshipRegistry {
    definitions: HashMap<(String, String), RelationshipDefinition>,
}

impl RelationshipRegistry {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    /// Register a single definition for a source collection
    pub fn register(
        &mut self,
        source_collection: &str,
        definition: RelationshipDefinition,
    ) -> Result<()> {
        definition.validate()?;
        let key = (source_collection.to_string(), definition.name.clone());
        if self.definitions.contains_key(&key) {
            warn!(
                source = source_collection,
                name = definition.name.as_str(),
                "overwriting existing relationship definition"
            );
        }
        debug!(
            source = source_collection,
            name = definition.name.as_str(),
            target = definition.target_table.as_str(),
            cardinality = %definition.cardinality,
            "registered relationship"
        );
        self.definitions.insert(key, definition);
        Ok(())
    }

    /// Bulk-register all definitions for a source collection
    pub fn register_bulk(
        &mut self,
        source_collection: &str,
        definitions: Vec<RelationshipDefinition>,
    ) -> Result<()> {
        for definition in definitions {
            self.register(source_collection, definition)?;
        }
        Ok(())
    }

    pub fn get(&self, source_collection: &str, name: &str) -> Option<&RelationshipDefinition> {
        self.definitions
            .get(&(source_collection.to_string(), name.to_string()))
    }

    /// All definitions declared for a source collection
    pub fn get_for_table(&self, source_collection: &str) -> Vec<&RelationshipDefinition> {
        self.definitions
            .iter()
            .filter(|((source, _), _)| source == source_collection)
            .map(|(_, definition)| definition)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn junction() -> JunctionSpec {
        JunctionSpec {
            table: "user_groups".into(),
            local_key: "user_id".into(),
            foreign_key: "group_id".into(),
        }
    }

    #[test]
    fn test_many_to_many_requires_junction() {
        let bad = RelationshipDefinition::new("groups", "groups", "id", "id", Cardinality::ManyToMany);
        assert!(bad.validate().is_err());

        let good = bad.with_junction(junction());
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_singular_forbids_junction() {
        let bad = RelationshipDefinition::new("profile", "profiles", "id", "user_id", Cardinality::OneToOne)
            .with_junction(junction());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_multi_result_flags() {
        assert!(!Cardinality::OneToOne.is_multi_result());
        assert!(!Cardinality::ManyToOne.is_multi_result());
        assert!(Cardinality::OneToMany.is_multi_result());
        assert!(Cardinality::ManyToMany.is_multi_result());
    }

    #[test]
    fn test_registry_lookup_is_source_scoped() {
        let mut registry = RelationshipRegistry::new();
        registry
            .register(
                "users",
                RelationshipDefinition::new("posts", "posts", "id", "user_id", Cardinality::OneToMany),
            )
            .unwrap();

        assert!(registry.get("users", "posts").is_some());
        assert!(registry.get("comments", "posts").is_none());
        assert_eq!(registry.get_for_table("users").len(), 1);
    }

    #[test]
    fn test_bulk_register_rejects_invalid_definition() {
        let mut registry = RelationshipRegistry::new();
        let result = registry.register_bulk(
            "users",
            vec![RelationshipDefinition::new(
                "groups",
                "groups",
                "id",
                "id",
                Cardinality::ManyToMany,
            )],
        );
        assert!(result.is_err());
        assert!(registry.is_empty());
    }
}
