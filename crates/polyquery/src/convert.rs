//! Parameter-map to IR conversion.
//!
//! Each parameter key is either a special key (`select`, `order`, `limit`,
//! `skip`/`offset`, `count`), a logical-operator key (`and`, `or`, `not`,
//! `not.<field>`) or a field-filter key. All filter contributions combine
//! by AND. Unparseable field-filter tokens are dropped, never raised.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{QueryError, Result};
use crate::ir::{
    ComparisonOperator, FieldCondition, FilterCondition, IntermediateQuery, JoinClause,
    LogicalOperator, QueryType, SelectClause, SortClause, SortDirection,
};
use crate::tokenizer::{coerce_set_value, coerce_value, parse_call, split_top_level, strip_outer_parens};

/// Prefix stripped from embed tokens to guess the tentative target
/// collection. The join alias keeps the original token text.
const EMBED_PREFIX: &str = "look_";

/// Stateless converter from REST-style parameter maps into the IR.
pub struct QueryConverter;

impl QueryConverter {
    /// Convert an ordered, possibly multi-valued parameter list into an
    /// `IntermediateQuery` rooted at `collection`.
    pub fn convert(
        params: &[(String, String)],
        collection: &str,
        roles: &[String],
    ) -> Result<IntermediateQuery> {
        let mut query = IntermediateQuery::new(collection);
        query.query_type = Some(QueryType::Read);
        if !roles.is_empty() {
            query.metadata.insert("roles".to_string(), json!(roles));
        }

        for (key, value) in params {
            match key.as_str() {
                "select" => Self::apply_select(&mut query, value),
                "order" => query.sort = Self::parse_order(value),
                "limit" => match value.parse::<u64>() {
                    Ok(n) => query.pagination_mut().limit = Some(n),
                    Err(_) => warn!(value = value.as_str(), "dropping unparseable limit"),
                },
                // last occurrence wins between skip and offset
                "skip" | "offset" => match value.parse::<u64>() {
                    Ok(n) => query.pagination_mut().offset = Some(n),
                    Err(_) => warn!(key = key.as_str(), value = value.as_str(), "dropping unparseable offset"),
                },
                "count" => {
                    query.pagination_mut().count = value == "true" || value == "exact";
                }
                "and" | "or" | "not" => {
                    let op = match key.as_str() {
                        "or" => LogicalOperator::Or,
                        "not" => LogicalOperator::Not,
                        _ => LogicalOperator::And,
                    };
                    let clause = Self::parse_logical_value(op, value);
                    if !clause.is_empty() {
                        query.merge_filter(clause);
                    }
                }
                _ => {
                    if let Some(field) = key.strip_prefix("not.") {
                        match Self::parse_field_param(field, value) {
                            Some(condition) => {
                                let mut negation =
                                    FilterCondition::with_operator(LogicalOperator::Not);
                                negation.conditions.push(condition);
                                query.merge_filter(negation);
                            }
                            None => warn!(key = key.as_str(), value = value.as_str(), "dropping filter token"),
                        }
                    } else {
                        match Self::parse_field_param(key, value) {
                            Some(condition) => query.merge_filter(FilterCondition::of(condition)),
                            None => warn!(key = key.as_str(), value = value.as_str(), "dropping filter token"),
                        }
                    }
                }
            }
        }

        debug!(
            collection,
            joins = query.joins.len(),
            has_filter = query.filter.is_some(),
            "converted parameters to IR"
        );
        Ok(query)
    }

    /// Convenience entry point taking a raw query string.
    pub fn convert_query_string(
        query_string: &str,
        collection: &str,
        roles: &[String],
    ) -> Result<IntermediateQuery> {
        let params: Vec<(String, String)> = serde_urlencoded::from_str(query_string)
            .map_err(|e| QueryError::MalformedInput(format!("bad query string: {}", e)))?;
        Self::convert(&params, collection, roles)
    }

    /// Parse a `<op>.<value>` parameter value for `field`. Returns `None`
    /// when the token cannot be interpreted.
    fn parse_field_param(field: &str, raw: &str) -> Option<FieldCondition> {
        if field.is_empty() {
            return None;
        }
        let (op_str, rest) = match raw.split_once('.') {
            Some((op, rest)) => (op, rest),
            None => (raw, ""),
        };
        let operator = ComparisonOperator::parse(op_str)?;
        let value = Self::coerce_operand(operator, rest)?;
        Some(FieldCondition::new(field, operator, value))
    }

    /// Parse a `<field>.<op>.<value>` token as used inside logical groups
    /// and embed expressions. The field part may itself be a dot-path, so
    /// the first segment parsing as an operator wins.
    fn parse_field_token(token: &str) -> Option<FieldCondition> {
        let parts: Vec<&str> = token.split('.').collect();
        for i in 1..parts.len() {
            if let Some(operator) = ComparisonOperator::parse(parts[i]) {
                let rest = parts[i + 1..].join(".");
                if rest.is_empty() && !operator.is_unary() {
                    continue;
                }
                let field = parts[..i].join(".");
                let value = Self::coerce_operand(operator, &rest)?;
                return Some(FieldCondition::new(field, operator, value));
            }
        }
        None
    }

    fn coerce_operand(operator: ComparisonOperator, rest: &str) -> Option<Value> {
        if operator.is_unary() {
            return Some(Value::Bool(true));
        }
        if rest.is_empty() {
            return None;
        }
        if operator.takes_set() {
            Some(coerce_set_value(rest))
        } else {
            Some(coerce_value(rest))
        }
    }

    /// Parse the value of a logical-operator key: a parenthesized
    /// comma-list of nested logical clauses or field conditions.
    fn parse_logical_value(operator: LogicalOperator, raw: &str) -> FilterCondition {
        let inner = strip_outer_parens(raw).unwrap_or(raw);
        let mut clause = FilterCondition::with_operator(operator);

        for token in split_top_level(inner, ',') {
            match parse_call(&token) {
                Some((name, body)) => match LogicalOperator::parse(name) {
                    Some(nested_op) => {
                        let nested = Self::parse_logical_value(nested_op, body);
                        if !nested.is_empty() {
                            clause.nested.push(nested);
                        }
                    }
                    None => warn!(token = token.as_str(), "dropping non-logical group token"),
                },
                None => match Self::parse_field_token(&token) {
                    Some(condition) => clause.conditions.push(condition),
                    None => warn!(token = token.as_str(), "dropping filter token"),
                },
            }
        }
        clause
    }

    /// Parse a select expression into fields, aliases and join stubs.
    fn apply_select(query: &mut IntermediateQuery, raw: &str) {
        let mut select = query.select.take().unwrap_or_default();
        for token in split_top_level(raw, ',') {
            match parse_call(&token) {
                Some((name, body)) => {
                    let mut join = Self::embed_stub(name);
                    Self::apply_embed_body(&mut join, body);
                    // the outer projection keeps the embedded shape
                    select.push_field(format!("{}.*", name));
                    query.joins.push(join);
                }
                None => Self::apply_select_field(&mut select, &token),
            }
        }
        query.select = Some(select);
    }

    /// Build a join stub for an embed token. The `look_` prefix only
    /// informs the tentative target guess; the alias keeps the original
    /// token text so the output shape matches what the caller asked for.
    fn embed_stub(name: &str) -> JoinClause {
        let relationship = name.strip_prefix(EMBED_PREFIX).unwrap_or(name);
        let mut join = JoinClause::stub(relationship, relationship);
        join.alias = Some(name.to_string());
        join
    }

    /// Parse the inner expression of an embed token, recursively scoped
    /// to the embedded collection.
    fn apply_embed_body(join: &mut JoinClause, body: &str) {
        for token in split_top_level(body, ',') {
            if let Some((name, inner)) = parse_call(&token) {
                match LogicalOperator::parse(name) {
                    Some(op) => {
                        let clause = Self::parse_logical_value(op, inner);
                        if !clause.is_empty() {
                            merge_join_filter(join, clause);
                        }
                    }
                    None => {
                        // nested embed, parented at this join's target
                        let mut nested = Self::embed_stub(name);
                        Self::apply_embed_body(&mut nested, inner);
                        join.select
                            .get_or_insert_with(SelectClause::default)
                            .push_field(format!("{}.*", name));
                        join.joins.push(nested);
                    }
                }
            } else if let Some((field, value)) = token.split_once('=') {
                match Self::parse_field_param(field, value) {
                    Some(condition) => merge_join_filter(join, FilterCondition::of(condition)),
                    None => warn!(token = token.as_str(), "dropping embed filter token"),
                }
            } else {
                let select = join.select.get_or_insert_with(SelectClause::default);
                Self::apply_select_field(select, &token);
            }
        }
    }

    /// Handle a plain (non-embed) select token: `alias:field`,
    /// `field->path` (base field kept) and `field::cast` (base field kept).
    fn apply_select_field(select: &mut SelectClause, token: &str) {
        if let Some((base, _cast)) = token.split_once("::") {
            select.push_field(base);
        } else if let Some((base, _path)) = token.split_once("->") {
            select.push_field(base);
        } else if let Some((alias, field)) = token.split_once(':') {
            select.aliases.insert(alias.to_string(), field.to_string());
            select.push_field(field);
        } else {
            select.push_field(token);
        }
    }

    /// Comma-split field list; a leading `-` sorts descending.
    fn parse_order(raw: &str) -> Vec<SortClause> {
        split_top_level(raw, ',')
            .iter()
            .map(|token| match token.strip_prefix('-') {
                Some(field) => SortClause {
                    field: field.to_string(),
                    direction: SortDirection::Desc,
                    nulls: None,
                },
                None => SortClause {
                    field: token.to_string(),
                    direction: SortDirection::Asc,
                    nulls: None,
                },
            })
            .collect()
    }
}

/// AND-merge a filter contribution into a join, demoting a pre-existing
/// filter into `nested` the same way the root query does.
fn merge_join_filter(join: &mut JoinClause, incoming: FilterCondition) {
    join.filter = Some(match join.filter.take() {
        None => incoming,
        Some(existing) => FilterCondition {
            operator: Some(LogicalOperator::And),
            conditions: Vec::new(),
            nested: vec![existing, incoming],
        },
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_field_filter_coercion() {
        let query =
            QueryConverter::convert(&params(&[("age", "gt.25")]), "users", &[]).unwrap();
        let filter = query.filter.unwrap();
        let condition = &filter.conditions[0];
        assert_eq!(condition.field, "age");
        assert_eq!(condition.operator, ComparisonOperator::Gt);
        assert_eq!(condition.value, json!(25));
    }

    #[test]
    fn test_set_operator_preserves_order_and_count() {
        let query =
            QueryConverter::convert(&params(&[("status", "in.(active,pending)")]), "users", &[])
                .unwrap();
        let filter = query.filter.unwrap();
        assert_eq!(filter.conditions[0].value, json!(["active", "pending"]));
    }

    #[test]
    fn test_unparseable_token_dropped_not_raised() {
        let query =
            QueryConverter::convert(&params(&[("name", "resembles.John")]), "users", &[]).unwrap();
        assert!(query.filter.is_none());
    }

    #[test]
    fn test_not_prefixed_field_key() {
        let query =
            QueryConverter::convert(&params(&[("not.age", "lt.18")]), "users", &[]).unwrap();
        let filter = query.filter.unwrap();
        assert_eq!(filter.operator, Some(LogicalOperator::Not));
        assert_eq!(filter.conditions[0].field, "age");
    }

    #[test]
    fn test_logical_value_with_nesting() {
        let query = QueryConverter::convert(
            &params(&[("or", "(age.gt.65,and(age.lt.18,status.eq.student))")]),
            "users",
            &[],
        )
        .unwrap();
        let filter = query.filter.unwrap();
        assert_eq!(filter.operator, Some(LogicalOperator::Or));
        assert_eq!(filter.conditions.len(), 1);
        assert_eq!(filter.nested.len(), 1);
        assert_eq!(filter.nested[0].operator, Some(LogicalOperator::And));
        assert_eq!(filter.nested[0].conditions.len(), 2);
    }

    #[test]
    fn test_logical_value_with_quoted_paren() {
        let query = QueryConverter::convert(
            &params(&[("or", r#"(name.eq."a)b",x.eq.1)"#)]),
            "users",
            &[],
        )
        .unwrap();
        let filter = query.filter.unwrap();
        assert_eq!(filter.operator, Some(LogicalOperator::Or));
        assert_eq!(filter.conditions.len(), 2);
        assert_eq!(filter.conditions[0].field, "name");
        assert_eq!(filter.conditions[0].value, serde_json::json!("a)b"));
        assert_eq!(filter.conditions[1].field, "x");
    }

    #[test]
    fn test_order_grammar() {
        let query =
            QueryConverter::convert(&params(&[("order", "name,-age")]), "users", &[]).unwrap();
        assert_eq!(query.sort.len(), 2);
        assert_eq!(query.sort[0].field, "name");
        assert_eq!(query.sort[0].direction, SortDirection::Asc);
        assert_eq!(query.sort[1].field, "age");
        assert_eq!(query.sort[1].direction, SortDirection::Desc);
    }

    #[test]
    fn test_pagination_last_offset_wins() {
        let query = QueryConverter::convert(
            &params(&[("skip", "10"), ("limit", "5"), ("offset", "20"), ("count", "exact")]),
            "users",
            &[],
        )
        .unwrap();
        let pagination = query.pagination.unwrap();
        assert_eq!(pagination.offset, Some(20));
        assert_eq!(pagination.limit, Some(5));
        assert!(pagination.count);
    }

    #[test]
    fn test_count_requires_true_or_exact() {
        let query =
            QueryConverter::convert(&params(&[("count", "yes")]), "users", &[]).unwrap();
        assert!(!query.pagination.unwrap().count);
    }

    #[test]
    fn test_nested_embed_select() {
        let query = QueryConverter::convert(
            &params(&[("select", "name,posts(title,comments(text))")]),
            "users",
            &[],
        )
        .unwrap();

        let select = query.select.as_ref().unwrap();
        assert_eq!(
            select.fields.as_ref().unwrap(),
            &vec!["name".to_string(), "posts.*".to_string()]
        );

        assert_eq!(query.joins.len(), 1);
        let outer = &query.joins[0];
        assert_eq!(outer.target, "posts");
        assert!(outer.is_stub());
        assert_eq!(
            outer.select.as_ref().unwrap().fields.as_ref().unwrap(),
            &vec!["title".to_string(), "comments.*".to_string()]
        );

        assert_eq!(outer.joins.len(), 1);
        let inner = &outer.joins[0];
        assert_eq!(inner.target, "comments");
        assert_eq!(
            inner.select.as_ref().unwrap().fields.as_ref().unwrap(),
            &vec!["text".to_string()]
        );
        assert!(inner.joins.is_empty());
    }

    #[test]
    fn test_look_prefix_strips_target_keeps_alias() {
        let query = QueryConverter::convert(
            &params(&[("select", "name,look_posts(title)")]),
            "users",
            &[],
        )
        .unwrap();
        let join = &query.joins[0];
        assert_eq!(join.target, "posts");
        assert_eq!(join.alias.as_deref(), Some("look_posts"));
        assert_eq!(join.relationship.as_ref().unwrap().name, "posts");

        let fields = query.select.unwrap().fields.unwrap();
        assert!(fields.contains(&"look_posts.*".to_string()));
    }

    #[test]
    fn test_embed_filters_and_logical_tokens() {
        let query = QueryConverter::convert(
            &params(&[("select", "posts(title,published=eq.true,or(likes.gt.10,pinned.eq.true))")]),
            "users",
            &[],
        )
        .unwrap();
        let join = &query.joins[0];
        assert_eq!(
            join.select.as_ref().unwrap().fields.as_ref().unwrap(),
            &vec!["title".to_string()]
        );
        let filter = join.filter.as_ref().unwrap();
        // equality filter first, then demoted alongside the or-group
        assert_eq!(filter.operator, Some(LogicalOperator::And));
        assert_eq!(filter.nested.len(), 2);
        assert_eq!(filter.nested[1].operator, Some(LogicalOperator::Or));
    }

    #[test]
    fn test_select_alias_arrow_and_cast() {
        let query = QueryConverter::convert(
            &params(&[("select", "fullname:name,meta->theme,age::int")]),
            "users",
            &[],
        )
        .unwrap();
        let select = query.select.unwrap();
        assert_eq!(
            select.fields.unwrap(),
            vec!["name".to_string(), "meta".to_string(), "age".to_string()]
        );
        assert_eq!(select.aliases.get("fullname"), Some(&"name".to_string()));
    }

    #[test]
    fn test_query_string_entry_point() {
        let query =
            QueryConverter::convert_query_string("age=gt.25&order=-age", "users", &[]).unwrap();
        assert!(query.filter.is_some());
        assert_eq!(query.sort[0].direction, SortDirection::Desc);
    }

    #[test]
    fn test_roles_recorded_in_metadata() {
        let query = QueryConverter::convert(&[], "users", &["user".to_string()]).unwrap();
        assert_eq!(query.metadata.get("roles"), Some(&json!(["user"])));
    }
}
