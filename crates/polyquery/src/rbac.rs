//! Role-based field-level access control.
//!
//! Rules are declared per collection, per action, per role as ordered
//! pattern lists. A pattern grants either a plain field or a relation,
//! which recurses into the related collection's rules with a depth cap.
//! The whole table is swapped as one unit on reload; readers never see a
//! partial update.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::{QueryError, Result};
use crate::ir::{IntermediateQuery, QueryType, SelectClause};

/// A declared permission entry scoped to a collection, action and role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RbacPattern {
    /// Grants a plain field
    Field { name: String },
    /// Grants a relation; resolution recurses into the related collection
    Relation { name: String, collection: String },
}

impl RbacPattern {
    pub fn field(name: impl Into<String>) -> Self {
        RbacPattern::Field { name: name.into() }
    }

    pub fn relation(name: impl Into<String>, collection: impl Into<String>) -> Self {
        RbacPattern::Relation {
            name: name.into(),
            collection: collection.into(),
        }
    }
}

type RolePatterns = HashMap<String, Vec<RbacPattern>>;

/// Relationship-permission chains stop expanding past this depth
const MAX_RELATION_DEPTH: u8 = 2;

/// Per-collection, per-action, per-role pattern table
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RbacTable {
    collections: HashMap<String, HashMap<QueryType, RolePatterns>>,
}

impl RbacTable {
    pub fn new() -> Self {
        Self {
            collections: HashMap::new(),
        }
    }

    /// Declare the ordered pattern list for (collection, action, role)
    pub fn allow(
        &mut self,
        collection: impl Into<String>,
        action: QueryType,
        role: impl Into<String>,
        patterns: Vec<RbacPattern>,
    ) -> &mut Self {
        self.collections
            .entry(collection.into())
            .or_default()
            .entry(action)
            .or_default()
            .insert(role.into(), patterns);
        self
    }

    /// Whether any caller role grants the action on the collection
    pub fn has_access(&self, collection: &str, action: QueryType, roles: &[String]) -> bool {
        self.collections
            .get(collection)
            .and_then(|actions| actions.get(&action))
            .map(|by_role| roles.iter().any(|role| by_role.contains_key(role)))
            .unwrap_or(false)
    }

    /// Resolve the allowed field set for (collection, action, roles) into
    /// a deduplicated, lexicographically sorted list of dot-paths.
    pub fn resolve_fields(
        &self,
        collection: &str,
        action: QueryType,
        roles: &[String],
    ) -> Result<Vec<String>> {
        let mut set = BTreeSet::new();
        let mut visited = BTreeSet::new();
        visited.insert(collection.to_string());
        self.resolve_into(collection, action, roles, 1, None, &visited, &mut set)?;
        Ok(collapse_prefix_extensions(set))
    }

    /// Recursive resolution step. Only self-referential hops consume the
    /// depth budget; a distinct-collection hop is free but each branch
    /// visits a collection at most once, so mutual-relation cycles
    /// terminate without starving distinct chains of their hops.
    fn resolve_into(
        &self,
        collection: &str,
        action: QueryType,
        roles: &[String],
        depth: u8,
        path_prefix: Option<&str>,
        visited: &BTreeSet<String>,
        out: &mut BTreeSet<String>,
    ) -> Result<()> {
        if depth > MAX_RELATION_DEPTH {
            return Ok(());
        }
        let actions = self.collections.get(collection).ok_or_else(|| {
            QueryError::MalformedInput(format!("no RBAC rules for collection '{}'", collection))
        })?;
        let by_role = match actions.get(&action) {
            Some(by_role) => by_role,
            None => return Ok(()),
        };

        for role in roles {
            let Some(patterns) = by_role.get(role) else {
                continue;
            };
            for pattern in patterns {
                match pattern {
                    RbacPattern::Field { name } => {
                        out.insert(join_path(path_prefix, name));
                    }
                    RbacPattern::Relation {
                        name,
                        collection: related,
                    } => {
                        let prefix = join_path(path_prefix, name);
                        if related == collection {
                            self.resolve_into(
                                related,
                                action,
                                roles,
                                depth + 1,
                                Some(&prefix),
                                visited,
                                out,
                            )?;
                        } else if !visited.contains(related) {
                            // per-branch guard: siblings may still visit
                            let mut seen = visited.clone();
                            seen.insert(related.clone());
                            self.resolve_into(
                                related,
                                action,
                                roles,
                                depth,
                                Some(&prefix),
                                &seen,
                                out,
                            )?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Constrain the IR's selection to the resolved allowed set. A
    /// non-empty resolution becomes the select when none was requested,
    /// otherwise it intersects with the explicit request (wildcard markers
    /// are always kept). Must run after access has been granted.
    pub fn apply_projection(
        &self,
        query: &mut IntermediateQuery,
        action: QueryType,
        roles: &[String],
    ) -> Result<()> {
        let allowed = self.resolve_fields(&query.collection, action, roles)?;
        if allowed.is_empty() {
            return Ok(());
        }
        debug!(
            collection = query.collection.as_str(),
            allowed = allowed.len(),
            "applying rbac projection"
        );
        match query.select.as_mut() {
            None => {
                query.select = Some(SelectClause {
                    fields: Some(allowed),
                    ..SelectClause::default()
                });
            }
            Some(select) => match select.fields.as_mut() {
                None => select.fields = Some(allowed),
                Some(fields) => {
                    fields.retain(|field| {
                        if field == "*" {
                            return true;
                        }
                        if let Some(stem) = field.strip_suffix(".*") {
                            // embed marker: kept when the relation itself
                            // or any of its fields is granted
                            let dotted = format!("{}.", stem);
                            return allowed.iter().any(|a| a == stem || a.starts_with(&dotted));
                        }
                        allowed.contains(field)
                    });
                }
            },
        }
        Ok(())
    }
}

fn join_path(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}.{}", prefix, name),
        None => name.to_string(),
    }
}

/// Single-pass collapse over the sorted set: drop any entry that is a
/// prefix-extension (`<kept>.`...) of the immediately preceding kept
/// entry. Deliberately sort-order-dependent; do not replace with a
/// closure-based filter, authorization outcomes depend on this shape.
fn collapse_prefix_extensions(set: BTreeSet<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(set.len());
    for entry in set {
        if let Some(kept) = out.last() {
            if entry.starts_with(kept.as_str()) && entry[kept.len()..].starts_with('.') {
                continue;
            }
        }
        out.push(entry);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RbacTable {
        let mut table = RbacTable::new();
        table.allow(
            "users",
            QueryType::Read,
            "user",
            vec![
                RbacPattern::field("name"),
                RbacPattern::field("email"),
                RbacPattern::field("created_at"),
                RbacPattern::relation("posts", "posts"),
            ],
        );
        table.allow(
            "posts",
            QueryType::Read,
            "user",
            vec![RbacPattern::field("title"), RbacPattern::field("body")],
        );
        table
    }

    #[test]
    fn test_has_access() {
        let table = table();
        assert!(table.has_access("users", QueryType::Read, &["user".to_string()]));
        assert!(!table.has_access("users", QueryType::Delete, &["user".to_string()]));
        assert!(!table.has_access("users", QueryType::Read, &["guest".to_string()]));
        assert!(!table.has_access("invoices", QueryType::Read, &["user".to_string()]));
    }

    #[test]
    fn test_resolution_is_sorted_and_prefixed() {
        let fields = table()
            .resolve_fields("users", QueryType::Read, &["user".to_string()])
            .unwrap();
        assert_eq!(
            fields,
            vec!["created_at", "email", "name", "posts.body", "posts.title"]
        );
    }

    #[test]
    fn test_mutual_relations_terminate() {
        let mut table = RbacTable::new();
        table.allow(
            "authors",
            QueryType::Read,
            "user",
            vec![
                RbacPattern::field("name"),
                RbacPattern::relation("books", "books"),
            ],
        );
        table.allow(
            "books",
            QueryType::Read,
            "user",
            vec![
                RbacPattern::field("title"),
                RbacPattern::relation("author", "authors"),
            ],
        );

        let fields = table
            .resolve_fields("authors", QueryType::Read, &["user".to_string()])
            .unwrap();
        assert!(!fields.is_empty());
        assert!(fields.contains(&"name".to_string()));
        assert!(fields.contains(&"books.title".to_string()));
    }

    #[test]
    fn test_self_relation_cuts_off_early() {
        let mut table = RbacTable::new();
        table.allow(
            "categories",
            QueryType::Read,
            "user",
            vec![
                RbacPattern::field("label"),
                RbacPattern::relation("parent", "categories"),
            ],
        );
        let fields = table
            .resolve_fields("categories", QueryType::Read, &["user".to_string()])
            .unwrap();
        // each self-referential hop spends one unit of the depth budget
        assert_eq!(fields, vec!["label", "parent.label"]);
    }

    #[test]
    fn test_distinct_chain_resolves_past_one_hop() {
        let mut table = RbacTable::new();
        table.allow(
            "users",
            QueryType::Read,
            "user",
            vec![
                RbacPattern::field("name"),
                RbacPattern::relation("posts", "posts"),
            ],
        );
        table.allow(
            "posts",
            QueryType::Read,
            "user",
            vec![
                RbacPattern::field("title"),
                RbacPattern::relation("comments", "comments"),
            ],
        );
        table.allow(
            "comments",
            QueryType::Read,
            "user",
            vec![RbacPattern::field("text")],
        );

        let fields = table
            .resolve_fields("users", QueryType::Read, &["user".to_string()])
            .unwrap();
        assert_eq!(fields, vec!["name", "posts.comments.text", "posts.title"]);
    }

    #[test]
    fn test_prefix_collapse_is_single_pass() {
        let set: BTreeSet<String> = ["a", "a.b", "a.b.c", "ab", "b.c"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(collapse_prefix_extensions(set), vec!["a", "ab", "b.c"]);
    }

    #[test]
    fn test_projection_intersects_with_request() {
        let table = table();
        let mut query = IntermediateQuery::new("users");
        query.select = Some(SelectClause {
            fields: Some(vec![
                "name".to_string(),
                "password_hash".to_string(),
                "*".to_string(),
            ]),
            ..SelectClause::default()
        });
        table
            .apply_projection(&mut query, QueryType::Read, &["user".to_string()])
            .unwrap();
        let fields = query.select.unwrap().fields.unwrap();
        assert_eq!(fields, vec!["name", "*"]);
    }

    #[test]
    fn test_projection_fills_missing_select() {
        let table = table();
        let mut query = IntermediateQuery::new("users");
        table
            .apply_projection(&mut query, QueryType::Read, &["user".to_string()])
            .unwrap();
        let fields = query.select.unwrap().fields.unwrap();
        assert!(fields.contains(&"email".to_string()));
    }

    #[test]
    fn test_projection_keeps_granted_embed_marker() {
        let table = table();
        let mut query = IntermediateQuery::new("users");
        query.select = Some(SelectClause {
            fields: Some(vec!["name".to_string(), "posts.*".to_string(), "secrets.*".to_string()]),
            ..SelectClause::default()
        });
        table
            .apply_projection(&mut query, QueryType::Read, &["user".to_string()])
            .unwrap();
        let fields = query.select.unwrap().fields.unwrap();
        assert_eq!(fields, vec!["name", "posts.*"]);
    }

    #[test]
    fn test_unknown_collection_fails_resolution() {
        let table = table();
        let err = table
            .resolve_fields("invoices", QueryType::Read, &["user".to_string()])
            .unwrap_err();
        assert!(matches!(err, QueryError::MalformedInput(_)));
    }
}
