//! Elasticsearch adapter for polyquery
//!
//! Lowers the IR into the search DSL: the filter tree becomes a `bool`
//! query (`must` / `should` / `must_not`), sort and pagination map to
//! `sort`, `from` and `size`, and aggregations become a terms bucket
//! wrapping metric aggregations. Joins lower best-effort to terms
//! buckets keyed by each join's local field; the buckets group hits by
//! the join key but cannot correlate documents across indices, a known
//! limitation of running relational-style joins against a search index.
//!
//! Mutations go through the document APIs: `_doc` for inserts,
//! `_update_by_query` with a generated script for updates and
//! `_delete_by_query` for deletes.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::debug;

use polyquery::{
    AdapterCapabilities, ComparisonOperator, ExecuteOptions, ExecutionOutcome, FieldCondition,
    FilterCondition, IntermediateQuery, JoinClause, JoinType, LogicalOperator, NativeQuery,
    QueryAdapter, QueryError, QueryType, Result,
};

const AGGREGATE_FUNCTIONS: [&str; 5] = ["count", "sum", "avg", "min", "max"];

/// Elasticsearch adapter implementation
pub struct ElasticAdapter {
    http: reqwest::Client,
    base_url: String,
}

impl ElasticAdapter {
    /// Connect and verify the cluster answers
    pub async fn connect(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        debug!(url = base_url.as_str(), "connecting to Elasticsearch");

        let http = reqwest::Client::new();
        let response = http.get(&base_url).send().await.map_err(|e| {
            QueryError::execution_failed("elasticsearch", format!("connection failed: {}", e))
        })?;
        if !response.status().is_success() {
            return Err(QueryError::execution_failed(
                "elasticsearch",
                format!("cluster answered {}", response.status()),
            ));
        }

        Ok(Self { http, base_url })
    }

    async fn post(
        &self,
        path: &str,
        body: &Value,
        options: &ExecuteOptions,
    ) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.http.post(&url).json(body);
        if let Some(ms) = options.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }

        let response = request.send().await.map_err(|e| {
            QueryError::execution_failed("elasticsearch", format!("request failed: {}", e))
        })?;
        let status = response.status();
        let payload: Value = response.json().await.map_err(|e| {
            QueryError::execution_failed("elasticsearch", format!("unreadable response: {}", e))
        })?;
        if !status.is_success() {
            let reason = payload
                .pointer("/error/reason")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(QueryError::execution_failed(
                "elasticsearch",
                format!("{}: {}", status, reason),
            ));
        }
        Ok(payload)
    }

    async fn execute_read(
        &self,
        query: &IntermediateQuery,
        native: &NativeQuery,
        options: &ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        let body = native
            .get("body")
            .ok_or_else(|| QueryError::Internal("native query is missing its body".into()))?;

        let start = Instant::now();
        let payload = self
            .post(&format!("{}/_search", query.collection), body, options)
            .await?;

        let hits = payload
            .pointer("/hits/hits")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let data: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                let mut source = hit
                    .get("_source")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                if let (Some(object), Some(id)) = (source.as_object_mut(), hit.get("_id")) {
                    object.insert("_id".to_string(), id.clone());
                }
                source
            })
            .collect();

        let total = if query.pagination.as_ref().map(|p| p.count).unwrap_or(false) {
            payload
                .pointer("/hits/total/value")
                .and_then(|v| v.as_u64())
        } else {
            None
        };

        Ok(ExecutionOutcome {
            data,
            execution_time_ms: Some(start.elapsed().as_millis() as u64),
            total,
            ..ExecutionOutcome::default()
        })
    }

    async fn execute_mutation(
        &self,
        query: &IntermediateQuery,
        native: &NativeQuery,
        options: &ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        let body = native
            .get("body")
            .ok_or_else(|| QueryError::Internal("native query is missing its body".into()))?;
        let start = Instant::now();

        let mut outcome = ExecutionOutcome::default();
        match query.query_type {
            Some(QueryType::Insert) => {
                self.post(&format!("{}/_doc", query.collection), body, options)
                    .await?;
                outcome.inserted_count = Some(1);
            }
            Some(QueryType::Update) => {
                let payload = self
                    .post(
                        &format!("{}/_update_by_query", query.collection),
                        body,
                        options,
                    )
                    .await?;
                outcome.matched_count = payload.get("total").and_then(|v| v.as_u64());
                outcome.modified_count = payload.get("updated").and_then(|v| v.as_u64());
            }
            Some(QueryType::Delete) => {
                let payload = self
                    .post(
                        &format!("{}/_delete_by_query", query.collection),
                        body,
                        options,
                    )
                    .await?;
                outcome.deleted_count = payload.get("deleted").and_then(|v| v.as_u64());
            }
            _ => {
                return Err(QueryError::Internal(
                    "mutation execution reached with a read query".into(),
                ))
            }
        }

        outcome.execution_time_ms = Some(start.elapsed().as_millis() as u64);
        Ok(outcome)
    }
}

#[async_trait]
impl QueryAdapter for ElasticAdapter {
    fn adapter_name(&self) -> &'static str {
        "elasticsearch"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            filter_operators: vec![
                ComparisonOperator::Eq,
                ComparisonOperator::Neq,
                ComparisonOperator::Gt,
                ComparisonOperator::Gte,
                ComparisonOperator::Lt,
                ComparisonOperator::Lte,
                ComparisonOperator::In,
                ComparisonOperator::Nin,
                ComparisonOperator::Like,
                ComparisonOperator::Ilike,
                ComparisonOperator::Regex,
                ComparisonOperator::Exists,
                ComparisonOperator::Null,
                ComparisonOperator::Notnull,
                ComparisonOperator::Contains,
                ComparisonOperator::Startswith,
                ComparisonOperator::Endswith,
            ],
            join_types: vec![
                JoinType::OneToOne,
                JoinType::OneToMany,
                JoinType::ManyToOne,
                JoinType::ManyToMany,
                JoinType::Left,
            ],
            aggregations: AGGREGATE_FUNCTIONS.iter().map(|s| s.to_string()).collect(),
            max_complexity: None,
            max_result_size: None,
        }
    }

    fn convert_query(&self, query: &IntermediateQuery) -> Result<NativeQuery> {
        let body = match query.query_type {
            None | Some(QueryType::Read) => build_search(query)?,
            Some(_) => build_mutation(query)?,
        };
        Ok(json!({
            "index": query.collection,
            "body": body,
        }))
    }

    async fn execute_query(
        &self,
        query: &IntermediateQuery,
        native: &NativeQuery,
        options: &ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        match query.query_type {
            None | Some(QueryType::Read) => self.execute_read(query, native, options).await,
            Some(_) => self.execute_mutation(query, native, options).await,
        }
    }
}

/// Lower a read query into a `_search` request body
pub fn build_search(query: &IntermediateQuery) -> Result<Value> {
    let mut body = Map::new();

    let lowered = match &query.filter {
        Some(filter) => lower_filter(filter)?,
        None => None,
    };
    body.insert(
        "query".to_string(),
        lowered.unwrap_or_else(|| json!({"match_all": {}})),
    );

    if !query.sort.is_empty() {
        let sort: Vec<Value> = query
            .sort
            .iter()
            .map(|clause| {
                let order = match clause.direction {
                    polyquery::SortDirection::Asc => "asc",
                    polyquery::SortDirection::Desc => "desc",
                };
                let field = clause.field.clone();
                json!({field: {"order": order}})
            })
            .collect();
        body.insert("sort".to_string(), Value::Array(sort));
    }

    if let Some(pagination) = &query.pagination {
        if let Some(offset) = pagination.offset {
            if offset > 0 {
                body.insert("from".to_string(), json!(offset));
            }
        }
        if let Some(limit) = pagination.limit {
            if limit > 0 {
                body.insert("size".to_string(), json!(limit));
            }
        }
        if pagination.count {
            body.insert("track_total_hits".to_string(), json!(true));
        }
    }

    if let Some(select) = &query.select {
        if let Some(fields) = &select.fields {
            if fields.iter().any(|f| f == "*") {
                body.insert("_source".to_string(), json!(true));
            } else {
                body.insert("_source".to_string(), json!(fields));
            }
        }
    }

    if !query.aggregations.is_empty() {
        body.insert("aggs".to_string(), build_aggs(query)?);
        // aggregation queries want buckets, not documents
        body.insert("size".to_string(), json!(0));
    }

    // joins group hits by the join key; cross-index correlation is not
    // expressible here
    if !query.joins.is_empty() {
        let mut aggs = match body.remove("aggs") {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        for join in &query.joins {
            aggs.insert(join.effective_alias().to_string(), join_bucket(join)?);
        }
        body.insert("aggs".to_string(), Value::Object(aggs));
    }

    Ok(Value::Object(body))
}

fn join_bucket(join: &JoinClause) -> Result<Value> {
    let on = join.on.first().ok_or_else(|| {
        QueryError::MalformedInput(format!(
            "join '{}' has no join conditions",
            join.effective_alias()
        ))
    })?;
    let mut bucket = Map::new();
    bucket.insert("terms".to_string(), json!({"field": on.local_field}));
    if !join.joins.is_empty() {
        let mut nested = Map::new();
        for inner in &join.joins {
            nested.insert(inner.effective_alias().to_string(), join_bucket(inner)?);
        }
        bucket.insert("aggs".to_string(), Value::Object(nested));
    }
    Ok(Value::Object(bucket))
}

/// Lower a mutation into its document-API body
pub fn build_mutation(query: &IntermediateQuery) -> Result<Value> {
    let filter = match &query.filter {
        Some(f) => lower_filter(f)?.unwrap_or_else(|| json!({"match_all": {}})),
        None => json!({"match_all": {}}),
    };

    match query.query_type {
        Some(QueryType::Insert) => query
            .metadata
            .get("payload")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| {
                QueryError::MalformedInput("mutation query carries no payload".into())
            }),
        Some(QueryType::Update) => {
            let payload = query
                .metadata
                .get("payload")
                .and_then(|v| v.as_object())
                .ok_or_else(|| {
                    QueryError::MalformedInput("mutation query carries no payload".into())
                })?;
            let mut keys: Vec<&String> = payload.keys().collect();
            keys.sort();
            let source: String = keys
                .iter()
                .map(|k| format!("ctx._source['{}'] = params['{}'];", k, k))
                .collect::<Vec<String>>()
                .join(" ");
            Ok(json!({
                "query": filter,
                "script": {
                    "source": source,
                    "lang": "painless",
                    "params": payload,
                },
            }))
        }
        Some(QueryType::Delete) => Ok(json!({"query": filter})),
        _ => Err(QueryError::Internal(
            "build_mutation called on a read query".into(),
        )),
    }
}

fn build_aggs(query: &IntermediateQuery) -> Result<Value> {
    let mut metrics = Map::new();
    let mut group_fields: Vec<&str> = Vec::new();

    for aggregation in &query.aggregations {
        let function = aggregation.function.to_lowercase();
        if !AGGREGATE_FUNCTIONS.contains(&function.as_str()) {
            return Err(QueryError::MalformedInput(format!(
                "unknown aggregate function '{}'",
                aggregation.function
            )));
        }
        let name = aggregation
            .alias
            .clone()
            .unwrap_or_else(|| format!("{}_{}", function, aggregation.field.replace('*', "all")));
        let field = if aggregation.field == "*" {
            "_id"
        } else {
            aggregation.field.as_str()
        };
        let metric = match function.as_str() {
            "count" => json!({"value_count": {"field": field}}),
            other => json!({other: {"field": field}}),
        };
        metrics.insert(name, metric);
        for group in &aggregation.group_by {
            if !group_fields.contains(&group.as_str()) {
                group_fields.push(group);
            }
        }
    }

    // grouped metrics nest under a terms bucket per group field
    let mut aggs = Value::Object(metrics);
    for group in group_fields.into_iter().rev() {
        aggs = json!({
            group: {
                "terms": {"field": group},
                "aggs": aggs,
            },
        });
    }
    Ok(aggs)
}

fn lower_filter(filter: &FilterCondition) -> Result<Option<Value>> {
    let mut clauses: Vec<Value> = Vec::new();
    for condition in &filter.conditions {
        clauses.push(condition_query(condition)?);
    }
    for nested in &filter.nested {
        if let Some(lowered) = lower_filter(nested)? {
            clauses.push(lowered);
        }
    }
    if clauses.is_empty() {
        return Ok(None);
    }

    Ok(Some(match filter.operator.unwrap_or(LogicalOperator::And) {
        LogicalOperator::And => {
            if clauses.len() == 1 {
                clauses.remove(0)
            } else {
                json!({"bool": {"must": clauses}})
            }
        }
        LogicalOperator::Or => json!({"bool": {"should": clauses, "minimum_should_match": 1}}),
        LogicalOperator::Not => json!({"bool": {"must_not": clauses}}),
    }))
}

fn condition_query(condition: &FieldCondition) -> Result<Value> {
    let field = condition.field.clone();
    let text = || pattern_text(&condition.value);

    Ok(match condition.operator {
        ComparisonOperator::Eq => json!({"term": {field: condition.value.clone()}}),
        ComparisonOperator::Neq => {
            json!({"bool": {"must_not": [{"term": {field: condition.value.clone()}}]}})
        }
        ComparisonOperator::Gt => json!({"range": {field: {"gt": condition.value.clone()}}}),
        ComparisonOperator::Gte => json!({"range": {field: {"gte": condition.value.clone()}}}),
        ComparisonOperator::Lt => json!({"range": {field: {"lt": condition.value.clone()}}}),
        ComparisonOperator::Lte => json!({"range": {field: {"lte": condition.value.clone()}}}),
        ComparisonOperator::In => json!({"terms": {field: set_values(&condition.value)}}),
        ComparisonOperator::Nin => {
            json!({"bool": {"must_not": [{"terms": {field: set_values(&condition.value)}}]}})
        }
        ComparisonOperator::Like => {
            json!({"wildcard": {field: {"value": like_to_wildcard(&text())}}})
        }
        ComparisonOperator::Ilike => json!({"wildcard": {field: {
            "value": like_to_wildcard(&text()),
            "case_insensitive": true,
        }}}),
        ComparisonOperator::Contains => json!({"wildcard": {field: {
            "value": format!("*{}*", text()),
            "case_insensitive": true,
        }}}),
        ComparisonOperator::Startswith => json!({"prefix": {field: {
            "value": text(),
            "case_insensitive": true,
        }}}),
        ComparisonOperator::Endswith => json!({"wildcard": {field: {
            "value": format!("*{}", text()),
            "case_insensitive": true,
        }}}),
        ComparisonOperator::Regex => json!({"regexp": {field: {
            "value": text(),
            "case_insensitive": true,
        }}}),
        ComparisonOperator::Exists => json!({"exists": {"field": field}}),
        ComparisonOperator::Null => {
            json!({"bool": {"must_not": [{"exists": {"field": field}}]}})
        }
        ComparisonOperator::Notnull => json!({"exists": {"field": field}}),
    })
}

fn set_values(value: &Value) -> Value {
    match value {
        Value::Array(_) => value.clone(),
        other => Value::Array(vec![other.clone()]),
    }
}

fn pattern_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Translate SQL LIKE wildcards into the search DSL's
fn like_to_wildcard(pattern: &str) -> String {
    pattern.replace('%', "*").replace('_', "?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyquery::{
        enhance_joins, AggregationClause, Cardinality, QueryConverter, RelationshipDefinition,
        RelationshipRegistry,
    };

    fn convert(pairs: &[(&str, &str)]) -> IntermediateQuery {
        let params: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QueryConverter::convert(&params, "users", &[]).unwrap()
    }

    #[test]
    fn test_bool_query_shape() {
        let query = convert(&[("name", "eq.John"), ("age", "gt.25")]);
        let body = build_search(&query).unwrap();

        let must = body.pointer("/query/bool/must").unwrap().as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(must[0].pointer("/term/name").unwrap(), "John");
        assert_eq!(must[1].pointer("/range/age/gt").unwrap(), 25);
    }

    #[test]
    fn test_no_filter_is_match_all() {
        let query = convert(&[]);
        let body = build_search(&query).unwrap();
        assert!(body.pointer("/query/match_all").is_some());
        assert!(body.get("from").is_none());
        assert!(body.get("size").is_none());
    }

    #[test]
    fn test_or_and_not_lowering() {
        let query = convert(&[("or", "(age.gt.65,age.lt.18)"), ("not.status", "eq.banned")]);
        let body = build_search(&query).unwrap();

        let must = body.pointer("/query/bool/must").unwrap().as_array().unwrap();
        let should = must[0].pointer("/bool/should").unwrap().as_array().unwrap();
        assert_eq!(should.len(), 2);
        assert_eq!(must[0].pointer("/bool/minimum_should_match").unwrap(), 1);
        assert!(must[1].pointer("/bool/must_not").is_some());
    }

    #[test]
    fn test_pagination_and_source_filtering() {
        let query = convert(&[
            ("select", "name,email"),
            ("limit", "10"),
            ("offset", "20"),
            ("count", "true"),
        ]);
        let body = build_search(&query).unwrap();

        assert_eq!(body.get("size").unwrap(), 10);
        assert_eq!(body.get("from").unwrap(), 20);
        assert_eq!(body.get("track_total_hits").unwrap(), true);
        assert_eq!(body.get("_source").unwrap(), &json!(["name", "email"]));
    }

    #[test]
    fn test_wildcard_translation() {
        let query = convert(&[("name", "like.Jo%n_")]);
        let body = build_search(&query).unwrap();
        assert_eq!(
            body.pointer("/query/wildcard/name/value").unwrap(),
            "Jo*n?"
        );
    }

    #[test]
    fn test_null_operator_negates_exists() {
        let query = convert(&[("deleted_at", "null")]);
        let body = build_search(&query).unwrap();
        assert_eq!(
            body.pointer("/query/bool/must_not/0/exists/field").unwrap(),
            "deleted_at"
        );
    }

    #[test]
    fn test_grouped_aggregation_buckets() {
        let mut query = convert(&[]);
        query.aggregations.push(AggregationClause {
            function: "avg".into(),
            field: "age".into(),
            alias: None,
            group_by: vec!["status".into()],
        });
        let body = build_search(&query).unwrap();

        assert_eq!(body.get("size").unwrap(), 0);
        assert_eq!(
            body.pointer("/aggs/status/terms/field").unwrap(),
            "status"
        );
        assert_eq!(
            body.pointer("/aggs/status/aggs/avg_age/avg/field").unwrap(),
            "age"
        );
    }

    #[test]
    fn test_update_script_from_payload() {
        let mut query = convert(&[("id", "eq.7")]);
        query.query_type = Some(QueryType::Update);
        query
            .metadata
            .insert("payload".into(), json!({"name": "Ada", "age": 36}));

        let body = build_mutation(&query).unwrap();
        assert_eq!(
            body.pointer("/script/source").unwrap(),
            "ctx._source['age'] = params['age']; ctx._source['name'] = params['name'];"
        );
        assert_eq!(body.pointer("/script/params/name").unwrap(), "Ada");
        assert_eq!(body.pointer("/query/term/id").unwrap(), 7);
    }

    #[test]
    fn test_wildcard_select_keeps_full_source() {
        let query = convert(&[("select", "*")]);
        let body = build_search(&query).unwrap();
        assert_eq!(body.get("_source").unwrap(), &json!(true));
    }

    #[test]
    fn test_join_lowers_to_terms_bucket() {
        let mut registry = RelationshipRegistry::new();
        registry
            .register(
                "users",
                RelationshipDefinition::new("posts", "posts", "id", "author_id", Cardinality::OneToMany),
            )
            .unwrap();
        let mut query = convert(&[("select", "name,posts(title)")]);
        enhance_joins(&mut query, &registry).unwrap();

        let adapter = ElasticAdapter {
            http: reqwest::Client::new(),
            base_url: "http://localhost:9200".to_string(),
        };
        let report = adapter.validate_query(&query);
        assert!(report.valid, "resolved joins must pass validation");

        let body = build_search(&query).unwrap();
        assert_eq!(
            body.pointer("/aggs/posts/terms/field").unwrap(),
            "id"
        );
    }

    #[test]
    fn test_nested_join_buckets_nest() {
        let mut registry = RelationshipRegistry::new();
        registry
            .register(
                "users",
                RelationshipDefinition::new("posts", "posts", "id", "author_id", Cardinality::OneToMany),
            )
            .unwrap();
        registry
            .register(
                "posts",
                RelationshipDefinition::new("comments", "comments", "id", "post_id", Cardinality::OneToMany),
            )
            .unwrap();
        let mut query = convert(&[("select", "posts(title,comments(text))")]);
        enhance_joins(&mut query, &registry).unwrap();

        let body = build_search(&query).unwrap();
        assert_eq!(
            body.pointer("/aggs/posts/aggs/comments/terms/field").unwrap(),
            "id"
        );
    }

    #[test]
    fn test_delete_body_requires_only_filter() {
        let mut query = convert(&[("status", "eq.stale")]);
        query.query_type = Some(QueryType::Delete);
        let body = build_mutation(&query).unwrap();
        assert_eq!(body.pointer("/query/term/status").unwrap(), "stale");
    }
}
