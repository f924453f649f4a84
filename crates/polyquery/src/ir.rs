use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Action a query performs against its root collection
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Read,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryType::Read => write!(f, "read"),
            QueryType::Insert => write!(f, "insert"),
            QueryType::Update => write!(f, "update"),
            QueryType::Delete => write!(f, "delete"),
        }
    }
}

/// Logical combinator over filter-tree children
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    And,
    Or,
    /// Negates the conjunction of the direct conditions and nested children
    Not,
}

impl LogicalOperator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "and" => Some(LogicalOperator::And),
            "or" => Some(LogicalOperator::Or),
            "not" => Some(LogicalOperator::Not),
            _ => None,
        }
    }
}

/// Closed set of field comparison operators
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Like,
    Ilike,
    Regex,
    Exists,
    Null,
    Notnull,
    Contains,
    Startswith,
    Endswith,
}

impl ComparisonOperator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Self::Eq),
            "neq" => Some(Self::Neq),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "in" => Some(Self::In),
            "nin" => Some(Self::Nin),
            "like" => Some(Self::Like),
            "ilike" => Some(Self::Ilike),
            "regex" => Some(Self::Regex),
            "exists" => Some(Self::Exists),
            "null" => Some(Self::Null),
            "notnull" => Some(Self::Notnull),
            "contains" => Some(Self::Contains),
            "startswith" => Some(Self::Startswith),
            "endswith" => Some(Self::Endswith),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::Nin => "nin",
            Self::Like => "like",
            Self::Ilike => "ilike",
            Self::Regex => "regex",
            Self::Exists => "exists",
            Self::Null => "null",
            Self::Notnull => "notnull",
            Self::Contains => "contains",
            Self::Startswith => "startswith",
            Self::Endswith => "endswith",
        }
    }

    /// Operators whose value is a parenthesized set of scalars
    pub fn takes_set(&self) -> bool {
        matches!(self, Self::In | Self::Nin)
    }

    /// Operators that carry no meaningful value token
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::Exists | Self::Null | Self::Notnull)
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single field comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub operator: ComparisonOperator,
    pub value: Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub modifiers: HashMap<String, Value>,
}

impl FieldCondition {
    pub fn new(field: impl Into<String>, operator: ComparisonOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            modifiers: HashMap::new(),
        }
    }
}

/// Tree of logical combinators over field conditions
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<LogicalOperator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<FieldCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<FilterCondition>,
}

impl FilterCondition {
    /// An implicit conjunction over a single field condition
    pub fn of(condition: FieldCondition) -> Self {
        Self {
            operator: None,
            conditions: vec![condition],
            nested: Vec::new(),
        }
    }

    pub fn with_operator(operator: LogicalOperator) -> Self {
        Self {
            operator: Some(operator),
            conditions: Vec::new(),
            nested: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.nested.is_empty()
    }
}

/// Field projection for a query or a join
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectClause {
    /// Allow-list of fields; `*` marks a wildcard
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    /// Deny-list; only consulted when `fields` is absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
    /// Output name -> source field
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub aliases: HashMap<String, String>,
    /// Output name -> computed expression
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub computed: HashMap<String, Value>,
}

impl SelectClause {
    pub fn push_field(&mut self, field: impl Into<String>) {
        self.fields.get_or_insert_with(Vec::new).push(field.into());
    }

    pub fn has_wildcard(&self) -> bool {
        self.fields
            .as_ref()
            .map(|f| f.iter().any(|s| s == "*"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortClause {
    pub field: String,
    pub direction: SortDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nulls: Option<NullsOrder>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PaginationClause {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default)]
    pub count: bool,
}

/// Join flavor. Enhancement rewrites stubs to the declared cardinality;
/// explicit SQL-style keywords pass through untouched.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Cross,
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl JoinType {
    /// Fixed cardinality -> SQL keyword map; unmapped kinds default to LEFT
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Cross => "CROSS JOIN",
            _ => "LEFT JOIN",
        }
    }

    /// True when the joined side yields multiple rows per source row
    pub fn is_multi_result(&self) -> bool {
        matches!(self, JoinType::OneToMany | JoinType::ManyToMany)
    }
}

/// Equality pairing between a source field and a target field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinCondition {
    pub local_field: String,
    pub foreign_field: String,
}

/// Junction table materializing a many-to-many pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JunctionSpec {
    pub table: String,
    pub local_key: String,
    pub foreign_key: String,
}

/// Reference from a join to a declared relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub junction: Option<JunctionSpec>,
    /// Keep source rows with no match when unwinding singular joins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_null: Option<bool>,
}

/// A join against another collection. Before enhancement this may be a
/// stub: `on` empty, `relationship.name` set, `target` only a guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinClause {
    pub join_type: JoinType,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on: Vec<JoinCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<SelectClause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterCondition>,
    /// Nested joins, scoped to `target` rather than the root collection
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<JoinClause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<RelationshipRef>,
}

impl JoinClause {
    /// A join stub referencing a relationship by name only
    pub fn stub(relationship_name: impl Into<String>, tentative_target: impl Into<String>) -> Self {
        let name = relationship_name.into();
        Self {
            join_type: JoinType::Left,
            target: tentative_target.into(),
            alias: None,
            on: Vec::new(),
            select: None,
            filter: None,
            joins: Vec::new(),
            relationship: Some(RelationshipRef {
                name,
                junction: None,
                preserve_null: None,
            }),
        }
    }

    /// True until enhancement has filled in the join conditions
    pub fn is_stub(&self) -> bool {
        self.on.is_empty()
            && self
                .relationship
                .as_ref()
                .map(|r| !r.name.is_empty())
                .unwrap_or(false)
    }

    pub fn effective_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationClause {
    pub function: String,
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
}

/// Backend-agnostic query representation. One query always targets
/// exactly one root collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateQuery {
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_type: Option<QueryType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<SelectClause>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortClause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationClause>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<JoinClause>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<AggregationClause>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl IntermediateQuery {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            query_type: None,
            filter: None,
            select: None,
            sort: Vec::new(),
            pagination: None,
            joins: Vec::new(),
            aggregations: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Combine an incoming filter contribution by AND: a pre-existing
    /// filter is demoted into `nested` alongside the new one.
    pub fn merge_filter(&mut self, incoming: FilterCondition) {
        self.filter = Some(match self.filter.take() {
            None => incoming,
            Some(existing) => FilterCondition {
                operator: Some(LogicalOperator::And),
                conditions: Vec::new(),
                nested: vec![existing, incoming],
            },
        });
    }

    pub fn pagination_mut(&mut self) -> &mut PaginationClause {
        self.pagination.get_or_insert_with(PaginationClause::default)
    }
}
