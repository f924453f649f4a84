//! Join-stub resolution against the relationship registry.
//!
//! The converter emits stubs (`on` empty, relationship name set, target
//! only a guess); enhancement fills in the real target, the join
//! conditions and the declared cardinality. Nested joins resolve against
//! the target of their enclosing join, not the root collection.

use tracing::{debug, warn};

use crate::error::{QueryError, Result};
use crate::ir::{IntermediateQuery, JoinClause};
use crate::relationships::{Cardinality, RelationshipRegistry};

/// Resolve every join stub in `query` against `registry`.
///
/// A stub whose relationship name is unknown to the registry is left as
/// supplied and falls through to capability validation later. An empty
/// registry combined with stubs present is a fatal configuration error.
pub fn enhance_joins(query: &mut IntermediateQuery, registry: &RelationshipRegistry) -> Result<()> {
    if query.joins.iter().any(has_stub) && registry.is_empty() {
        return Err(QueryError::RegistryUninitialized);
    }
    let source = query.collection.clone();
    enhance_level(&source, &mut query.joins, registry);
    Ok(())
}

fn has_stub(join: &JoinClause) -> bool {
    join.is_stub() || join.joins.iter().any(has_stub)
}

fn enhance_level(source: &str, joins: &mut [JoinClause], registry: &RelationshipRegistry) {
    for join in joins.iter_mut() {
        if join.is_stub() {
            let name = join
                .relationship
                .as_ref()
                .map(|r| r.name.clone())
                .unwrap_or_default();
            match registry.get(source, &name) {
                Some(definition) => {
                    join.on = vec![definition.join_condition()];
                    join.target = definition.target_table.clone();
                    join.join_type = definition.cardinality.join_type();
                    if definition.cardinality == Cardinality::ManyToMany {
                        if let Some(relationship) = join.relationship.as_mut() {
                            relationship.junction = definition.junction.clone();
                        }
                    }
                    debug!(
                        source,
                        relationship = name.as_str(),
                        target = join.target.as_str(),
                        cardinality = %definition.cardinality,
                        "resolved join stub"
                    );
                }
                None => {
                    // left as supplied; capability validation reports it
                    warn!(source, relationship = name.as_str(), "unresolved join stub");
                }
            }
        }
        // nested field names are relative to the nested collection
        let next_source = join.target.clone();
        enhance_level(&next_source, &mut join.joins, registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::QueryConverter;
    use crate::ir::{JoinType, JunctionSpec};
    use crate::relationships::RelationshipDefinition;

    fn registry() -> RelationshipRegistry {
        let mut registry = RelationshipRegistry::new();
        registry
            .register_bulk(
                "users",
                vec![
                    RelationshipDefinition::new("posts", "posts", "id", "author_id", Cardinality::OneToMany),
                    RelationshipDefinition::new("groups", "groups", "id", "id", Cardinality::ManyToMany)
                        .with_junction(JunctionSpec {
                            table: "user_groups".into(),
                            local_key: "user_id".into(),
                            foreign_key: "group_id".into(),
                        }),
                ],
            )
            .unwrap();
        registry
            .register(
                "posts",
                RelationshipDefinition::new("comments", "post_comments", "id", "post_id", Cardinality::OneToMany),
            )
            .unwrap();
        registry
    }

    fn convert(select: &str) -> IntermediateQuery {
        QueryConverter::convert(
            &[("select".to_string(), select.to_string())],
            "users",
            &[],
        )
        .unwrap()
    }

    #[test]
    fn test_stub_resolution_fills_on_target_and_type() {
        let mut query = convert("name,look_posts(title)");
        enhance_joins(&mut query, &registry()).unwrap();

        let join = &query.joins[0];
        assert!(!join.is_stub());
        assert_eq!(join.target, "posts");
        assert_eq!(join.join_type, JoinType::OneToMany);
        assert!(join.join_type.is_multi_result());
        assert_eq!(join.on[0].local_field, "id");
        assert_eq!(join.on[0].foreign_field, "author_id");
    }

    #[test]
    fn test_nested_join_rekeys_source_to_target() {
        let mut query = convert("posts(title,comments(text))");
        enhance_joins(&mut query, &registry()).unwrap();

        let inner = &query.joins[0].joins[0];
        // resolved against "posts", not "users"
        assert_eq!(inner.target, "post_comments");
        assert_eq!(inner.on[0].foreign_field, "post_id");
    }

    #[test]
    fn test_many_to_many_carries_junction() {
        let mut query = convert("groups(name)");
        enhance_joins(&mut query, &registry()).unwrap();

        let join = &query.joins[0];
        assert_eq!(join.join_type, JoinType::ManyToMany);
        let junction = join.relationship.as_ref().unwrap().junction.as_ref().unwrap();
        assert_eq!(junction.table, "user_groups");
    }

    #[test]
    fn test_unknown_relationship_left_as_supplied() {
        let mut query = convert("avatars(url)");
        enhance_joins(&mut query, &registry()).unwrap();
        assert!(query.joins[0].is_stub());
        assert_eq!(query.joins[0].target, "avatars");
    }

    #[test]
    fn test_empty_registry_with_stubs_is_fatal() {
        let mut query = convert("posts(title)");
        let empty = RelationshipRegistry::new();
        let err = enhance_joins(&mut query, &empty).unwrap_err();
        assert!(matches!(err, QueryError::RegistryUninitialized));
    }
}
