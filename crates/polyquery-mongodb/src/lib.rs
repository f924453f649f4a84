//! MongoDB adapter for polyquery
//!
//! Lowers the IR into an aggregation pipeline: per-join `$lookup` blocks
//! first (singular relationships unwound to one object, many-to-many via
//! a two-hop junction lookup whose artifact never reaches the output),
//! then `$match`, `$sort`, `$skip`, `$limit` and a trailing `$project`.
//! Mutations bypass the pipeline and lower to a single descriptor.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::{options::ClientOptions, Client};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use polyquery::{
    AdapterCapabilities, ComparisonOperator, ExecuteOptions, ExecutionOutcome, FieldCondition,
    FilterCondition, IntermediateQuery, JoinClause, JoinType, LogicalOperator, NativeQuery,
    QueryAdapter, QueryError, QueryType, Result, SelectClause,
};

/// MongoDB adapter implementation
pub struct MongoAdapter {
    client: Client,
    database: String,
}

impl MongoAdapter {
    /// Connect and verify the deployment is reachable
    pub async fn connect(url: &str, database: &str) -> Result<Self> {
        debug!(url, database, "connecting to MongoDB");

        let options = ClientOptions::parse(url).await.map_err(|e| {
            error!(error = %e, "failed to parse MongoDB URL");
            QueryError::execution_failed("mongodb", format!("failed to parse URL: {}", e))
        })?;

        let client = Client::with_options(options).map_err(|e| {
            QueryError::execution_failed("mongodb", format!("failed to create client: {}", e))
        })?;

        client.list_database_names().await.map_err(|e| {
            QueryError::execution_failed("mongodb", format!("connection check failed: {}", e))
        })?;

        Ok(Self {
            client,
            database: database.to_string(),
        })
    }

    /// Wrap an existing client, e.g. one shared with a connection pool
    pub fn from_client(client: Client, database: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
        }
    }

    async fn execute_read(
        &self,
        query: &IntermediateQuery,
        native: &NativeQuery,
        options: &ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        let stages = native
            .get("pipeline")
            .and_then(|v| v.as_array())
            .ok_or_else(|| QueryError::Internal("native query is missing its pipeline".into()))?
            .iter()
            .map(|stage| {
                bson::to_document(stage).map_err(|e| {
                    QueryError::Internal(format!("pipeline stage is not a document: {}", e))
                })
            })
            .collect::<Result<Vec<Document>>>()?;

        let collection = self
            .client
            .database(&self.database)
            .collection::<Document>(&query.collection);

        let start = Instant::now();
        let cursor = with_timeout(options, async { collection.aggregate(stages).await }).await?;
        let cursor = cursor
            .map_err(|e| QueryError::execution_failed("mongodb", format!("aggregate failed: {}", e)))?;
        let documents: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|e| QueryError::execution_failed("mongodb", format!("cursor failed: {}", e)))?;

        let data = documents
            .iter()
            .map(|d| {
                serde_json::to_value(d)
                    .map_err(|e| QueryError::Internal(format!("result not serializable: {}", e)))
            })
            .collect::<Result<Vec<Value>>>()?;

        // exact total only when the caller asked to count
        let total = if query.pagination.as_ref().map(|p| p.count).unwrap_or(false) {
            let filter = match &query.filter {
                Some(f) => lower_filter(f)?,
                None => Document::new(),
            };
            let count = collection.count_documents(filter).await.map_err(|e| {
                QueryError::execution_failed("mongodb", format!("count failed: {}", e))
            })?;
            Some(count)
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

    async fn execute_mutation(&self, query: &IntermediateQuery) -> Result<ExecutionOutcome> {
        let descriptor = build_mutation(query)?;
        let collection = self
            .client
            .database(&self.database)
            .collection::<Document>(&query.collection);
        let start = Instant::now();

        let mut outcome = ExecutionOutcome::default();
        match query.query_type {
            Some(QueryType::Insert) => {
                let document = descriptor.get_document("document").map_err(|e| {
                    QueryError::Internal(format!("insert descriptor missing document: {}", e))
                })?;
                collection.insert_one(document.clone()).await.map_err(|e| {
                    QueryError::execution_failed("mongodb", format!("insert failed: {}", e))
                })?;
                outcome.inserted_count = Some(1);
            }
            Some(QueryType::Update) => {
                let filter = descriptor.get_document("filter").cloned().unwrap_or_default();
                let document = descriptor.get_document("document").map_err(|e| {
                    QueryError::Internal(format!("update descriptor missing document: {}", e))
                })?;
                let partial = descriptor.get_bool("partial").unwrap_or(true);
                let result = if partial {
                    collection
                        .update_many(filter, doc! {"$set": document.clone()})
                        .await
                        .map_err(|e| {
                            QueryError::execution_failed("mongodb", format!("update failed: {}", e))
                        })?
                } else {
                    collection
                        .replace_one(filter, document.clone())
                        .await
                        .map_err(|e| {
                            QueryError::execution_failed("mongodb", format!("replace failed: {}", e))
                        })?
                };
                outcome.matched_count = Some(result.matched_count);
                outcome.modified_count = Some(result.modified_count);
            }
            Some(QueryType::Delete) => {
                let filter = descriptor.get_document("filter").cloned().unwrap_or_default();
                let result = collection.delete_many(filter).await.map_err(|e| {
                    QueryError::execution_failed("mongodb", format!("delete failed: {}", e))
                })?;
                outcome.deleted_count = Some(result.deleted_count);
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

async fn with_timeout<F: std::future::Future>(options: &ExecuteOptions, fut: F) -> Result<F::Output> {
    match options.timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), fut)
            .await
            .map_err(|_| QueryError::execution_failed("mongodb", format!("timeout after {}ms", ms))),
        None => Ok(fut.await),
    }
}

#[async_trait]
impl QueryAdapter for MongoAdapter {
    fn adapter_name(&self) -> &'static str {
        "mongodb"
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
            aggregations: vec![],
            max_complexity: None,
            max_result_size: None,
        }
    }

    fn convert_query(&self, query: &IntermediateQuery) -> Result<NativeQuery> {
        match query.query_type {
            None | Some(QueryType::Read) => {
                let pipeline = build_pipeline(query)?;
                Ok(json!({
                    "collection": query.collection,
                    "pipeline": pipeline,
                }))
            }
            Some(_) => {
                let descriptor = build_mutation(query)?;
                Ok(json!({
                    "collection": query.collection,
                    "mutation": serde_json::to_value(&descriptor)
                        .map_err(|e| QueryError::Internal(format!("descriptor not serializable: {}", e)))?,
                }))
            }
        }
    }

    async fn execute_query(
        &self,
        query: &IntermediateQuery,
        native: &NativeQuery,
        options: &ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        match query.query_type {
            None | Some(QueryType::Read) => self.execute_read(query, native, options).await,
            Some(_) => self.execute_mutation(query).await,
        }
    }
}

/// Lower a read query into an ordered aggregation pipeline
pub fn build_pipeline(query: &IntermediateQuery) -> Result<Vec<Document>> {
    let mut pipeline = Vec::new();

    for join in &query.joins {
        append_join_stages(join, &mut pipeline)?;
    }

    if let Some(filter) = &query.filter {
        let matched = lower_filter(filter)?;
        if !matched.is_empty() {
            pipeline.push(doc! {"$match": matched});
        }
    }

    if !query.sort.is_empty() {
        let mut sort = Document::new();
        for clause in &query.sort {
            let direction = match clause.direction {
                polyquery::SortDirection::Asc => 1,
                polyquery::SortDirection::Desc => -1,
            };
            sort.insert(clause.field.clone(), direction);
        }
        pipeline.push(doc! {"$sort": sort});
    }

    if let Some(pagination) = &query.pagination {
        if let Some(offset) = pagination.offset {
            if offset > 0 {
                pipeline.push(doc! {"$skip": offset as i64});
            }
        }
        if let Some(limit) = pagination.limit {
            if limit > 0 {
                pipeline.push(doc! {"$limit": limit as i64});
            }
        }
    }

    // projection last so sort keys stay visible to $sort
    if let Some(projection) = projection_doc(query.select.as_ref()) {
        pipeline.push(doc! {"$project": projection});
    }

    Ok(pipeline)
}

/// Lower a mutation into its single descriptor
pub fn build_mutation(query: &IntermediateQuery) -> Result<Document> {
    let filter = match &query.filter {
        Some(f) => lower_filter(f)?,
        None => Document::new(),
    };
    let payload = query.metadata.get("payload");

    match query.query_type {
        Some(QueryType::Insert) => {
            let document = payload_document(payload)?;
            Ok(doc! {"document": document})
        }
        Some(QueryType::Update) => {
            let document = payload_document(payload)?;
            let partial = query
                .metadata
                .get("partial")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            Ok(doc! {"filter": filter, "document": document, "partial": partial})
        }
        Some(QueryType::Delete) => Ok(doc! {"filter": filter}),
        _ => Err(QueryError::Internal(
            "build_mutation called on a read query".into(),
        )),
    }
}

fn payload_document(payload: Option<&Value>) -> Result<Document> {
    let value = payload.ok_or_else(|| {
        QueryError::MalformedInput("mutation query carries no payload".into())
    })?;
    bson::to_document(value)
        .map_err(|e| QueryError::MalformedInput(format!("mutation payload is not an object: {}", e)))
}

fn append_join_stages(join: &JoinClause, pipeline: &mut Vec<Document>) -> Result<()> {
    let alias = join.effective_alias().to_string();
    let on = join.on.first().ok_or_else(|| {
        QueryError::MalformedInput(format!("join '{}' has no join conditions", alias))
    })?;

    if join.join_type == JoinType::ManyToMany {
        let junction = join
            .relationship
            .as_ref()
            .and_then(|r| r.junction.as_ref())
            .ok_or_else(|| {
                QueryError::MalformedInput(format!(
                    "many-to-many join '{}' is missing its junction",
                    alias
                ))
            })?;
        let junction_field = format!("__junction_{}", alias);

        // hop 1: junction rows for this source row
        pipeline.push(doc! {"$lookup": {
            "from": junction.table.clone(),
            "let": {"local": format!("${}", on.local_field)},
            "pipeline": [
                {"$match": {"$expr": {"$eq": [format!("${}", junction.local_key), "$$local"]}}},
            ],
            "as": junction_field.clone(),
        }});

        // hop 2: targets keyed by the collected junction keys
        let mut inner = vec![doc! {"$match": {
            "$expr": {"$in": [format!("${}", on.foreign_field), "$$keys"]}
        }}];
        append_inner_stages(join, &mut inner)?;
        pipeline.push(doc! {"$lookup": {
            "from": join.target.clone(),
            "let": {"keys": format!("${}.{}", junction_field, junction.foreign_key)},
            "pipeline": inner,
            "as": alias,
        }});

        // the junction rows are a lowering artifact, never part of the shape
        pipeline.push(doc! {"$unset": junction_field});
        return Ok(());
    }

    let mut inner = vec![doc! {"$match": {
        "$expr": {"$eq": [format!("${}", on.foreign_field), "$$local"]}
    }}];
    append_inner_stages(join, &mut inner)?;
    pipeline.push(doc! {"$lookup": {
        "from": join.target.clone(),
        "let": {"local": format!("${}", on.local_field)},
        "pipeline": inner,
        "as": alias.clone(),
    }});

    if !join.join_type.is_multi_result() {
        let preserve = join
            .relationship
            .as_ref()
            .and_then(|r| r.preserve_null)
            .unwrap_or(true);
        pipeline.push(doc! {"$unwind": {
            "path": format!("${}", alias),
            "preserveNullAndEmptyArrays": preserve,
        }});
    }
    Ok(())
}

/// Stages applied inside a lookup sub-pipeline: join-level filter, nested
/// joins (scoped to this join's target), then the join's projection.
fn append_inner_stages(join: &JoinClause, inner: &mut Vec<Document>) -> Result<()> {
    if let Some(filter) = &join.filter {
        let matched = lower_filter(filter)?;
        if !matched.is_empty() {
            inner.push(doc! {"$match": matched});
        }
    }
    for nested in &join.joins {
        append_join_stages(nested, inner)?;
    }
    if let Some(projection) = projection_doc(join.select.as_ref()) {
        inner.push(doc! {"$project": projection});
    }
    Ok(())
}

fn projection_doc(select: Option<&SelectClause>) -> Option<Document> {
    let select = select?;
    let mut projection = Document::new();

    if let Some(fields) = &select.fields {
        if fields.iter().any(|f| f == "*") {
            return None;
        }
        for field in fields {
            // embed markers include the joined alias as a whole
            let name = field.strip_suffix(".*").unwrap_or(field);
            projection.insert(name.to_string(), 1);
        }
    } else if let Some(exclude) = &select.exclude {
        for field in exclude {
            projection.insert(field.clone(), 0);
        }
    }

    for (output, source) in &select.aliases {
        projection.insert(output.clone(), format!("${}", source));
    }

    if projection.is_empty() {
        None
    } else {
        Some(projection)
    }
}

/// Lower a filter tree into a match document
pub fn lower_filter(filter: &FilterCondition) -> Result<Document> {
    let mut clauses: Vec<Document> = Vec::new();
    for condition in &filter.conditions {
        clauses.push(condition_doc(condition)?);
    }
    for nested in &filter.nested {
        let lowered = lower_filter(nested)?;
        if !lowered.is_empty() {
            clauses.push(lowered);
        }
    }
    if clauses.is_empty() {
        return Ok(Document::new());
    }

    let conjunction = |mut parts: Vec<Document>| {
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            doc! {"$and": parts}
        }
    };

    Ok(match filter.operator.unwrap_or(LogicalOperator::And) {
        LogicalOperator::And => conjunction(clauses),
        LogicalOperator::Or => doc! {"$or": clauses},
        // negation of the conjunction of the direct children
        LogicalOperator::Not => doc! {"$nor": [conjunction(clauses)]},
    })
}

fn condition_doc(condition: &FieldCondition) -> Result<Document> {
    let field = condition.field.clone();
    let text = || pattern_text(&condition.value);

    let predicate = match condition.operator {
        ComparisonOperator::Eq => doc! {"$eq": to_bson(&condition.value)?},
        ComparisonOperator::Neq => doc! {"$ne": to_bson(&condition.value)?},
        ComparisonOperator::Gt => doc! {"$gt": to_bson(&condition.value)?},
        ComparisonOperator::Gte => doc! {"$gte": to_bson(&condition.value)?},
        ComparisonOperator::Lt => doc! {"$lt": to_bson(&condition.value)?},
        ComparisonOperator::Lte => doc! {"$lte": to_bson(&condition.value)?},
        ComparisonOperator::In => doc! {"$in": set_bson(&condition.value)?},
        ComparisonOperator::Nin => doc! {"$nin": set_bson(&condition.value)?},
        ComparisonOperator::Like | ComparisonOperator::Ilike => {
            doc! {"$regex": like_to_regex(&text()), "$options": "i"}
        }
        ComparisonOperator::Contains => {
            doc! {"$regex": regex_escape(&text()), "$options": "i"}
        }
        ComparisonOperator::Startswith => {
            doc! {"$regex": format!("^{}", regex_escape(&text())), "$options": "i"}
        }
        ComparisonOperator::Endswith => {
            doc! {"$regex": format!("{}$", regex_escape(&text())), "$options": "i"}
        }
        ComparisonOperator::Regex => doc! {"$regex": text(), "$options": "i"},
        ComparisonOperator::Exists => doc! {"$exists": true},
        ComparisonOperator::Null => doc! {"$eq": Bson::Null},
        ComparisonOperator::Notnull => doc! {"$ne": Bson::Null},
    };

    Ok(doc! {field: predicate})
}

fn to_bson(value: &Value) -> Result<Bson> {
    bson::to_bson(value)
        .map_err(|e| QueryError::Internal(format!("filter value not representable: {}", e)))
}

fn set_bson(value: &Value) -> Result<Bson> {
    match value {
        Value::Array(_) => to_bson(value),
        other => Ok(Bson::Array(vec![to_bson(other)?])),
    }
}

fn pattern_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn regex_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if ".^$*+?()[]{}|\\".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Translate SQL LIKE wildcards into an anchored regex
fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c if ".^$*+?()[]{}|\\".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyquery::{enhance_joins, Cardinality, JunctionSpec, QueryConverter, RelationshipDefinition, RelationshipRegistry};
    use serde_json::json;

    fn convert(pairs: &[(&str, &str)]) -> IntermediateQuery {
        let params: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QueryConverter::convert(&params, "users", &[]).unwrap()
    }

    #[test]
    fn test_read_pipeline_shape() {
        let mut query = convert(&[
            ("name", "eq.John"),
            ("age", "gt.25"),
            ("select", "name,email"),
            ("order", "-created_at"),
            ("limit", "10"),
        ]);
        query.query_type = Some(QueryType::Read);

        let pipeline = build_pipeline(&query).unwrap();
        let names: Vec<&str> = pipeline
            .iter()
            .map(|d| d.keys().next().map(|s| s.as_str()).unwrap_or(""))
            .collect();
        // no $skip: offset was never set
        assert_eq!(names, vec!["$match", "$sort", "$limit", "$project"]);

        let matched = pipeline[0].get_document("$match").unwrap();
        let and = matched.get_array("$and").unwrap();
        assert_eq!(and.len(), 2);

        let sort = pipeline[1].get_document("$sort").unwrap();
        assert_eq!(sort.get_i32("created_at").unwrap(), -1);

        assert_eq!(pipeline[2].get_i64("$limit").unwrap(), 10);

        let projection = pipeline[3].get_document("$project").unwrap();
        assert!(projection.contains_key("name"));
        assert!(projection.contains_key("email"));
    }

    #[test]
    fn test_absent_filter_is_unconstrained() {
        let query = convert(&[]);
        let pipeline = build_pipeline(&query).unwrap();
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_or_and_not_lowering() {
        let query = convert(&[("or", "(age.gt.65,age.lt.18)"), ("not.status", "eq.banned")]);
        let pipeline = build_pipeline(&query).unwrap();
        let matched = pipeline[0].get_document("$match").unwrap();
        let and = matched.get_array("$and").unwrap();
        assert_eq!(and.len(), 2);

        let or_doc = and[0].as_document().unwrap();
        assert_eq!(or_doc.get_array("$or").unwrap().len(), 2);

        let not_doc = and[1].as_document().unwrap();
        assert!(not_doc.contains_key("$nor"));
    }

    #[test]
    fn test_pattern_operators() {
        let starts = condition_doc(&FieldCondition::new(
            "name",
            ComparisonOperator::Startswith,
            json!("Jo."),
        ))
        .unwrap();
        let predicate = starts.get_document("name").unwrap();
        assert_eq!(predicate.get_str("$regex").unwrap(), "^Jo\\.");
        assert_eq!(predicate.get_str("$options").unwrap(), "i");

        let like = condition_doc(&FieldCondition::new(
            "name",
            ComparisonOperator::Like,
            json!("Jo%n_"),
        ))
        .unwrap();
        assert_eq!(
            like.get_document("name").unwrap().get_str("$regex").unwrap(),
            "^Jo.*n.$"
        );
    }

    #[test]
    fn test_singular_join_unwinds_preserving_nulls() {
        let mut registry = RelationshipRegistry::new();
        registry
            .register(
                "users",
                RelationshipDefinition::new("profile", "profiles", "id", "user_id", Cardinality::OneToOne),
            )
            .unwrap();
        let mut query = convert(&[("select", "name,profile(bio)")]);
        enhance_joins(&mut query, &registry).unwrap();

        let pipeline = build_pipeline(&query).unwrap();
        assert!(pipeline[0].contains_key("$lookup"));
        let unwind = pipeline[1].get_document("$unwind").unwrap();
        assert_eq!(unwind.get_str("path").unwrap(), "$profile");
        assert!(unwind.get_bool("preserveNullAndEmptyArrays").unwrap());
    }

    #[test]
    fn test_many_to_many_never_leaks_junction() {
        let mut registry = RelationshipRegistry::new();
        registry
            .register(
                "users",
                RelationshipDefinition::new("groups", "groups", "id", "id", Cardinality::ManyToMany)
                    .with_junction(JunctionSpec {
                        table: "memberships".into(),
                        local_key: "user_id".into(),
                        foreign_key: "group_id".into(),
                    }),
            )
            .unwrap();
        let mut query = convert(&[("select", "name,groups(label)")]);
        enhance_joins(&mut query, &registry).unwrap();

        let pipeline = build_pipeline(&query).unwrap();
        let junction_lookup = pipeline[0].get_document("$lookup").unwrap();
        assert_eq!(junction_lookup.get_str("from").unwrap(), "memberships");
        assert_eq!(junction_lookup.get_str("as").unwrap(), "__junction_groups");

        let target_lookup = pipeline[1].get_document("$lookup").unwrap();
        assert_eq!(target_lookup.get_str("from").unwrap(), "groups");
        assert_eq!(target_lookup.get_str("as").unwrap(), "groups");

        // the artifact is discarded and no later stage references it
        assert_eq!(pipeline[2].get_str("$unset").unwrap(), "__junction_groups");
        let serialized = serde_json::to_string(&pipeline[3..]).unwrap();
        assert!(!serialized.contains("__junction_groups"));
        // no $unwind follows: multi-result joins keep the array
        assert!(pipeline[3..].iter().all(|d| !d.contains_key("$unwind")));
    }

    #[test]
    fn test_nested_join_lowered_inside_parent_lookup() {
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

        let pipeline = build_pipeline(&query).unwrap();
        let lookup = pipeline[0].get_document("$lookup").unwrap();
        let inner = lookup.get_array("pipeline").unwrap();
        let has_nested_lookup = inner
            .iter()
            .filter_map(|s| s.as_document())
            .any(|d| d.contains_key("$lookup"));
        assert!(has_nested_lookup);
    }

    #[test]
    fn test_update_mutation_descriptor() {
        let mut query = convert(&[("id", "eq.7")]);
        query.query_type = Some(QueryType::Update);
        query
            .metadata
            .insert("payload".into(), json!({"name": "Ada"}));
        query.metadata.insert("partial".into(), json!(true));

        let descriptor = build_mutation(&query).unwrap();
        assert!(descriptor.get_document("filter").is_ok());
        assert_eq!(
            descriptor
                .get_document("document")
                .unwrap()
                .get_str("name")
                .unwrap(),
            "Ada"
        );
        assert!(descriptor.get_bool("partial").unwrap());
    }

    #[test]
    fn test_mutation_without_payload_rejected() {
        let mut query = convert(&[]);
        query.query_type = Some(QueryType::Insert);
        assert!(build_mutation(&query).is_err());
    }
}
