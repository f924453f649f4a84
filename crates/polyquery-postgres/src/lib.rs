//! PostgreSQL adapter for polyquery
//!
//! Lowers the IR into parameterized SQL. Every identifier is quoted per
//! dot segment and every value travels as a `$n` placeholder, so field
//! names and values never splice into the statement text. Joins become
//! JOIN clauses (many-to-many expands through its junction table),
//! filters become a WHERE tree and aggregations become a grouped select
//! list.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};

use polyquery::{
    AdapterCapabilities, ComparisonOperator, ExecuteOptions, ExecutionOutcome, FieldCondition,
    FilterCondition, IntermediateQuery, JoinClause, JoinType, LogicalOperator, NativeQuery,
    NullsOrder, QueryAdapter, QueryError, QueryType, Result, SortDirection,
};

const AGGREGATE_FUNCTIONS: [&str; 5] = ["count", "sum", "avg", "min", "max"];

/// A lowered statement: SQL text plus positional parameter values
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// PostgreSQL adapter implementation
pub struct PostgresAdapter {
    client: Arc<RwLock<Client>>,
}

impl PostgresAdapter {
    /// Connect and spawn the connection task
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self> {
        let config = format!(
            "host={} port={} user={} password={} dbname={}",
            host, port, username, password, database
        );

        debug!(host, port, database, "connecting to PostgreSQL");

        let (client, connection) = tokio_postgres::connect(&config, NoTls).await.map_err(|e| {
            QueryError::execution_failed("postgres", format!("connection failed: {}", e))
        })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(Self {
            client: Arc::new(RwLock::new(client)),
        })
    }

    fn row_to_json(row: &Row) -> Result<Value> {
        let mut object = serde_json::Map::new();
        for (idx, column) in row.columns().iter().enumerate() {
            object.insert(column.name().to_string(), Self::extract_value(row, idx));
        }
        Ok(Value::Object(object))
    }

    /// Extract a column as JSON, null on any unreadable value
    fn extract_value(row: &Row, idx: usize) -> Value {
        let type_name = row.columns()[idx].type_().name();
        match type_name {
            "bool" => row
                .try_get::<_, Option<bool>>(idx)
                .ok()
                .flatten()
                .map(Value::Bool)
                .unwrap_or(Value::Null),
            "int2" | "int4" => row
                .try_get::<_, Option<i32>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::Number(v.into()))
                .unwrap_or(Value::Null),
            "int8" => row
                .try_get::<_, Option<i64>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::Number(v.into()))
                .unwrap_or(Value::Null),
            "float4" => row
                .try_get::<_, Option<f32>>(idx)
                .ok()
                .flatten()
                .and_then(|v| serde_json::Number::from_f64(v as f64))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            "float8" | "numeric" => row
                .try_get::<_, Option<f64>>(idx)
                .ok()
                .flatten()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            "timestamp" | "timestamptz" => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null),
            "json" | "jsonb" => row
                .try_get::<_, Option<Value>>(idx)
                .ok()
                .flatten()
                .unwrap_or(Value::Null),
            "uuid" => row
                .try_get::<_, Option<uuid::Uuid>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null),
            _ => row
                .try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(Value::String)
                .unwrap_or(Value::Null),
        }
    }

    async fn execute_read(
        &self,
        query: &IntermediateQuery,
        native: &NativeQuery,
        options: &ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        let (sql, params) = native_statement(native)?;
        let boxed = bind_params(&params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();

        let client = self.client.read().await;
        let start = Instant::now();
        let rows = with_timeout(options, async { client.query(&sql, &refs).await })
            .await?
            .map_err(|e| QueryError::execution_failed("postgres", format!("query failed: {}", e)))?;

        let data = rows
            .iter()
            .map(Self::row_to_json)
            .collect::<Result<Vec<Value>>>()?;

        let total = if query.pagination.as_ref().map(|p| p.count).unwrap_or(false) {
            let counted = build_count(query)?;
            let boxed = bind_params(&counted.params);
            let refs: Vec<&(dyn ToSql + Sync)> =
                boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
            let row = client.query_one(&counted.sql, &refs).await.map_err(|e| {
                QueryError::execution_failed("postgres", format!("count failed: {}", e))
            })?;
            let count: i64 = row.try_get(0).map_err(|e| {
                QueryError::execution_failed("postgres", format!("count unreadable: {}", e))
            })?;
            Some(count as u64)
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
        let (sql, params) = native_statement(native)?;
        let boxed = bind_params(&params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();

        let client = self.client.read().await;
        let start = Instant::now();
        let affected = with_timeout(options, async { client.execute(&sql, &refs).await })
            .await?
            .map_err(|e| {
                QueryError::execution_failed("postgres", format!("statement failed: {}", e))
            })?;

        let mut outcome = ExecutionOutcome::default();
        match query.query_type {
            Some(QueryType::Insert) => outcome.inserted_count = Some(affected),
            Some(QueryType::Update) => {
                outcome.matched_count = Some(affected);
                outcome.modified_count = Some(affected);
            }
            Some(QueryType::Delete) => outcome.deleted_count = Some(affected),
            _ => {}
        }
        outcome.execution_time_ms = Some(start.elapsed().as_millis() as u64);
        Ok(outcome)
    }
}

fn native_statement(native: &NativeQuery) -> Result<(String, Vec<Value>)> {
    let sql = native
        .get("sql")
        .and_then(|v| v.as_str())
        .ok_or_else(|| QueryError::Internal("native query is missing its SQL text".into()))?
        .to_string();
    let params = native
        .get("params")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    Ok((sql, params))
}

// boxed as Send too: the parameter vector lives across awaits inside
// futures that must themselves be Send
fn bind_params(values: &[Value]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    values
        .iter()
        .map(|value| -> Box<dyn ToSql + Sync + Send> {
            match value {
                Value::Null => Box::new(Option::<String>::None),
                Value::Bool(b) => Box::new(*b),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Box::new(i)
                    } else {
                        Box::new(n.as_f64().unwrap_or(f64::NAN))
                    }
                }
                Value::String(s) => Box::new(s.clone()),
                // arrays and objects bind as jsonb
                other => Box::new(other.clone()),
            }
        })
        .collect()
}

async fn with_timeout<F: std::future::Future>(options: &ExecuteOptions, fut: F) -> Result<F::Output> {
    match options.timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), fut)
            .await
            .map_err(|_| QueryError::execution_failed("postgres", format!("timeout after {}ms", ms))),
        None => Ok(fut.await),
    }
}

#[async_trait]
impl QueryAdapter for PostgresAdapter {
    fn adapter_name(&self) -> &'static str {
        "postgres"
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
                JoinType::Inner,
                JoinType::Right,
                JoinType::Cross,
            ],
            aggregations: AGGREGATE_FUNCTIONS.iter().map(|s| s.to_string()).collect(),
            max_complexity: None,
            max_result_size: None,
        }
    }

    fn convert_query(&self, query: &IntermediateQuery) -> Result<NativeQuery> {
        let statement = match query.query_type {
            None | Some(QueryType::Read) => build_select(query)?,
            Some(_) => build_mutation(query)?,
        };
        Ok(serde_json::json!({
            "sql": statement.sql,
            "params": statement.params,
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

/// Lower a read query into a SELECT statement
pub fn build_select(query: &IntermediateQuery) -> Result<SqlQuery> {
    let mut builder = SqlBuilder::default();
    let mut sql = format!(
        "SELECT {} FROM {}",
        select_list(query)?,
        quote_ident(&query.collection)
    );

    builder.append_joins(&query.collection, &query.joins, &mut sql)?;

    if let Some(filter) = &query.filter {
        let clause = builder.filter_sql(filter, None)?;
        if !clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
    }

    if !query.aggregations.is_empty() {
        let group_by = group_by_list(query);
        if !group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_by.join(", "));
        }
    }

    if !query.sort.is_empty() {
        let clauses: Vec<String> = query
            .sort
            .iter()
            .map(|clause| {
                let direction = match clause.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                let nulls = match clause.nulls {
                    Some(NullsOrder::First) => " NULLS FIRST",
                    Some(NullsOrder::Last) => " NULLS LAST",
                    None => "",
                };
                format!("{} {}{}", quote_ident(&clause.field), direction, nulls)
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&clauses.join(", "));
    }

    // an offset without a limit is not honored
    if let Some(pagination) = &query.pagination {
        if let Some(limit) = pagination.limit {
            if limit > 0 {
                sql.push_str(&format!(" LIMIT {}", limit));
                if let Some(offset) = pagination.offset {
                    if offset > 0 {
                        sql.push_str(&format!(" OFFSET {}", offset));
                    }
                }
            }
        }
    }

    Ok(SqlQuery {
        sql,
        params: builder.params,
    })
}

/// Same joins and filter as the read statement, counting instead
pub fn build_count(query: &IntermediateQuery) -> Result<SqlQuery> {
    let mut builder = SqlBuilder::default();
    let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&query.collection));

    builder.append_joins(&query.collection, &query.joins, &mut sql)?;

    if let Some(filter) = &query.filter {
        let clause = builder.filter_sql(filter, None)?;
        if !clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
    }

    Ok(SqlQuery {
        sql,
        params: builder.params,
    })
}

/// Lower a mutation into INSERT, UPDATE or DELETE
pub fn build_mutation(query: &IntermediateQuery) -> Result<SqlQuery> {
    let mut builder = SqlBuilder::default();
    let table = quote_ident(&query.collection);

    let sql = match query.query_type {
        Some(QueryType::Insert) => {
            let payload = payload_fields(query)?;
            let columns: Vec<String> = payload.iter().map(|(k, _)| quote_ident(k)).collect();
            let placeholders: Vec<String> = payload
                .iter()
                .map(|(_, v)| builder.push((*v).clone()))
                .collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders.join(", ")
            )
        }
        Some(QueryType::Update) => {
            let payload = payload_fields(query)?;
            let assignments: Vec<String> = payload
                .iter()
                .map(|(k, v)| format!("{} = {}", quote_ident(k), builder.push((*v).clone())))
                .collect();
            let mut sql = format!("UPDATE {} SET {}", table, assignments.join(", "));
            if let Some(filter) = &query.filter {
                let clause = builder.filter_sql(filter, None)?;
                if !clause.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clause);
                }
            }
            sql
        }
        Some(QueryType::Delete) => {
            let mut sql = format!("DELETE FROM {}", table);
            if let Some(filter) = &query.filter {
                let clause = builder.filter_sql(filter, None)?;
                if !clause.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clause);
                }
            }
            sql
        }
        _ => {
            return Err(QueryError::Internal(
                "build_mutation called on a read query".into(),
            ))
        }
    };

    Ok(SqlQuery {
        sql,
        params: builder.params,
    })
}

fn payload_fields(query: &IntermediateQuery) -> Result<Vec<(String, &Value)>> {
    let payload = query
        .metadata
        .get("payload")
        .and_then(|v| v.as_object())
        .ok_or_else(|| QueryError::MalformedInput("mutation query carries no payload".into()))?;
    if payload.is_empty() {
        return Err(QueryError::MalformedInput("mutation payload is empty".into()));
    }
    let mut fields: Vec<(String, &Value)> = payload.iter().map(|(k, v)| (k.clone(), v)).collect();
    // deterministic column order regardless of payload key order
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(fields)
}

fn select_list(query: &IntermediateQuery) -> Result<String> {
    if !query.aggregations.is_empty() {
        let mut items = group_by_list(query);
        for aggregation in &query.aggregations {
            let function = aggregation.function.to_lowercase();
            if !AGGREGATE_FUNCTIONS.contains(&function.as_str()) {
                return Err(QueryError::MalformedInput(format!(
                    "unknown aggregate function '{}'",
                    aggregation.function
                )));
            }
            let argument = if aggregation.field == "*" {
                "*".to_string()
            } else {
                quote_ident(&aggregation.field)
            };
            let alias = aggregation
                .alias
                .clone()
                .unwrap_or_else(|| format!("{}_{}", function, aggregation.field.replace('*', "all")));
            items.push(format!(
                "{}({}) AS {}",
                function.to_uppercase(),
                argument,
                quote_ident(&alias)
            ));
        }
        return Ok(items.join(", "));
    }

    // the default projection is qualified to the root table so joined
    // junction columns never bleed into the result rows
    let root_wildcard = format!("{}.*", quote_ident(&query.collection));
    let select = match &query.select {
        Some(s) => s,
        None => return Ok(root_wildcard),
    };
    let fields = match &select.fields {
        Some(f) if !f.iter().any(|x| x == "*") => f,
        _ => return Ok(root_wildcard),
    };

    // map alias sources back to their output names
    let mut outputs: Vec<String> = Vec::with_capacity(fields.len());
    for field in fields {
        if let Some(stem) = field.strip_suffix(".*") {
            outputs.push(format!("{}.*", quote_ident(stem)));
            continue;
        }
        match select.aliases.iter().find(|(_, source)| *source == field) {
            Some((output, source)) => {
                outputs.push(format!("{} AS {}", quote_ident(source), quote_ident(output)))
            }
            None => outputs.push(quote_ident(field)),
        }
    }
    Ok(outputs.join(", "))
}

fn group_by_list(query: &IntermediateQuery) -> Vec<String> {
    let mut seen = Vec::new();
    for aggregation in &query.aggregations {
        for field in &aggregation.group_by {
            let quoted = quote_ident(field);
            if !seen.contains(&quoted) {
                seen.push(quoted);
            }
        }
    }
    seen
}

/// Quote an identifier per dot segment, doubling embedded quotes
pub fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|segment| format!("\"{}\"", segment.replace('"', "\"\"")))
        .collect::<Vec<String>>()
        .join(".")
}

#[derive(Default)]
struct SqlBuilder {
    params: Vec<Value>,
}

impl SqlBuilder {
    fn push(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    fn append_joins(&mut self, source: &str, joins: &[JoinClause], sql: &mut String) -> Result<()> {
        for join in joins {
            let alias = join.effective_alias().to_string();
            let on = join.on.first().ok_or_else(|| {
                QueryError::MalformedInput(format!("join '{}' has no join conditions", alias))
            })?;
            let keyword = join.join_type.sql_keyword();

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
                let junction_alias = format!("__junction_{}", alias);
                sql.push_str(&format!(
                    " {} {} AS {} ON {}.{} = {}.{}",
                    keyword,
                    quote_ident(&junction.table),
                    quote_ident(&junction_alias),
                    quote_ident(source),
                    quote_ident(&on.local_field),
                    quote_ident(&junction_alias),
                    quote_ident(&junction.local_key),
                ));
                sql.push_str(&format!(
                    " {} {} AS {} ON {}.{} = {}.{}",
                    keyword,
                    quote_ident(&join.target),
                    quote_ident(&alias),
                    quote_ident(&junction_alias),
                    quote_ident(&junction.foreign_key),
                    quote_ident(&alias),
                    quote_ident(&on.foreign_field),
                ));
            } else {
                sql.push_str(&format!(
                    " {} {} AS {} ON {}.{} = {}.{}",
                    keyword,
                    quote_ident(&join.target),
                    quote_ident(&alias),
                    quote_ident(source),
                    quote_ident(&on.local_field),
                    quote_ident(&alias),
                    quote_ident(&on.foreign_field),
                ));
            }

            if let Some(filter) = &join.filter {
                let clause = self.filter_sql(filter, Some(&alias))?;
                if !clause.is_empty() {
                    sql.push_str(" AND ");
                    sql.push_str(&clause);
                }
            }

            self.append_joins(&alias, &join.joins, sql)?;
        }
        Ok(())
    }

    fn filter_sql(&mut self, filter: &FilterCondition, qualifier: Option<&str>) -> Result<String> {
        let mut parts: Vec<String> = Vec::new();
        for condition in &filter.conditions {
            parts.push(self.condition_sql(condition, qualifier)?);
        }
        for nested in &filter.nested {
            let clause = self.filter_sql(nested, qualifier)?;
            if !clause.is_empty() {
                parts.push(format!("({})", clause));
            }
        }
        if parts.is_empty() {
            return Ok(String::new());
        }

        Ok(match filter.operator.unwrap_or(LogicalOperator::And) {
            LogicalOperator::And => parts.join(" AND "),
            LogicalOperator::Or => parts.join(" OR "),
            LogicalOperator::Not => format!("NOT ({})", parts.join(" AND ")),
        })
    }

    fn condition_sql(
        &mut self,
        condition: &FieldCondition,
        qualifier: Option<&str>,
    ) -> Result<String> {
        let column = match qualifier {
            Some(q) => format!("{}.{}", quote_ident(q), quote_ident(&condition.field)),
            None => quote_ident(&condition.field),
        };
        let text = || pattern_text(&condition.value);

        Ok(match condition.operator {
            ComparisonOperator::Eq => format!("{} = {}", column, self.push(condition.value.clone())),
            ComparisonOperator::Neq => {
                format!("{} <> {}", column, self.push(condition.value.clone()))
            }
            ComparisonOperator::Gt => format!("{} > {}", column, self.push(condition.value.clone())),
            ComparisonOperator::Gte => {
                format!("{} >= {}", column, self.push(condition.value.clone()))
            }
            ComparisonOperator::Lt => format!("{} < {}", column, self.push(condition.value.clone())),
            ComparisonOperator::Lte => {
                format!("{} <= {}", column, self.push(condition.value.clone()))
            }
            ComparisonOperator::In | ComparisonOperator::Nin => {
                let elements = match &condition.value {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                if elements.is_empty() {
                    // empty membership set matches nothing
                    return Ok(match condition.operator {
                        ComparisonOperator::In => "FALSE".to_string(),
                        _ => "TRUE".to_string(),
                    });
                }
                let placeholders: Vec<String> =
                    elements.into_iter().map(|v| self.push(v)).collect();
                let keyword = if condition.operator == ComparisonOperator::In {
                    "IN"
                } else {
                    "NOT IN"
                };
                format!("{} {} ({})", column, keyword, placeholders.join(", "))
            }
            ComparisonOperator::Like => format!("{} LIKE {}", column, self.push(text().into())),
            ComparisonOperator::Ilike => format!("{} ILIKE {}", column, self.push(text().into())),
            ComparisonOperator::Contains => {
                format!("{} ILIKE {}", column, self.push(format!("%{}%", text()).into()))
            }
            ComparisonOperator::Startswith => {
                format!("{} ILIKE {}", column, self.push(format!("{}%", text()).into()))
            }
            ComparisonOperator::Endswith => {
                format!("{} ILIKE {}", column, self.push(format!("%{}", text()).into()))
            }
            ComparisonOperator::Regex => format!("{} ~* {}", column, self.push(text().into())),
            ComparisonOperator::Exists => format!("{} IS NOT NULL", column),
            ComparisonOperator::Null => format!("{} IS NULL", column),
            ComparisonOperator::Notnull => format!("{} IS NOT NULL", column),
        })
    }
}

fn pattern_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
