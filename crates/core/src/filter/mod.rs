//! Typed retrieval filter.
//!
//! The shield returns filter expressions as literal text. They are parsed with
//! [`literal::parse_literal`] and validated into [`SearchFilter`] before they
//! reach the search tool, so only the operators below ever leave the process.

pub mod literal;

use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;

use self::literal::{parse_literal, Literal};

#[derive(Clone, Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("filter expression is not a valid literal at offset {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("filter expression has an unsupported shape: {0}")]
    Shape(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl FilterValue {
    fn to_json(&self) -> Value {
        match self {
            Self::Str(value) => Value::String(value.clone()),
            Self::Int(value) => json!(value),
            Self::Float(value) => json!(value),
            Self::Bool(value) => Value::Bool(*value),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SearchFilter {
    Eq { column: String, value: FilterValue },
    Contains { column: String, value: FilterValue },
    Gte { column: String, value: FilterValue },
    Lte { column: String, value: FilterValue },
    And(Vec<SearchFilter>),
    Or(Vec<SearchFilter>),
    Not(Box<SearchFilter>),
}

impl SearchFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Eq { column: column.into(), value: FilterValue::Str(value.into()) }
    }

    pub fn operator(&self) -> &'static str {
        match self {
            Self::Eq { .. } => "@eq",
            Self::Contains { .. } => "@contains",
            Self::Gte { .. } => "@gte",
            Self::Lte { .. } => "@lte",
            Self::And(_) => "@and",
            Self::Or(_) => "@or",
            Self::Not(_) => "@not",
        }
    }

    /// Wire form understood by the search tool, e.g. `{"@eq": {"region": "EMEA"}}`.
    pub fn to_json(&self) -> Value {
        let body = match self {
            Self::Eq { column, value }
            | Self::Contains { column, value }
            | Self::Gte { column, value }
            | Self::Lte { column, value } => {
                let mut comparison = Map::new();
                comparison.insert(column.clone(), value.to_json());
                Value::Object(comparison)
            }
            Self::And(filters) | Self::Or(filters) => {
                Value::Array(filters.iter().map(Self::to_json).collect())
            }
            Self::Not(filter) => filter.to_json(),
        };

        let mut wrapper = Map::new();
        wrapper.insert(self.operator().to_string(), body);
        Value::Object(wrapper)
    }
}

impl Serialize for SearchFilter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl TryFrom<Literal> for SearchFilter {
    type Error = FilterError;

    fn try_from(literal: Literal) -> Result<Self, Self::Error> {
        let (operator, operand) = single_entry(literal, "filter")?;

        match operator.as_str() {
            "@eq" | "@contains" | "@gte" | "@lte" => {
                let (column, value) = single_entry(operand, &operator)?;
                let value = scalar(value, &operator)?;
                Ok(match operator.as_str() {
                    "@eq" => Self::Eq { column, value },
                    "@contains" => Self::Contains { column, value },
                    "@gte" => Self::Gte { column, value },
                    _ => Self::Lte { column, value },
                })
            }
            "@and" | "@or" => {
                let filters = match operand {
                    Literal::List(items) | Literal::Tuple(items) => items
                        .into_iter()
                        .map(Self::try_from)
                        .collect::<Result<Vec<_>, _>>()?,
                    other => {
                        return Err(FilterError::Shape(format!(
                            "`{operator}` expects a list, found {}",
                            other.kind()
                        )))
                    }
                };
                if filters.is_empty() {
                    return Err(FilterError::Shape(format!("`{operator}` must not be empty")));
                }
                Ok(if operator == "@and" { Self::And(filters) } else { Self::Or(filters) })
            }
            "@not" => Ok(Self::Not(Box::new(Self::try_from(operand)?))),
            other => Err(FilterError::Shape(format!("unknown operator `{other}`"))),
        }
    }
}

/// Parses a shield filter expression. Blank input, `None` and `{}` all mean
/// "no filter".
pub fn parse_filter_expression(expression: &str) -> Result<Option<SearchFilter>, FilterError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    match parse_literal(trimmed)? {
        Literal::None => Ok(None),
        Literal::Dict(entries) if entries.is_empty() => Ok(None),
        literal => SearchFilter::try_from(literal).map(Some),
    }
}

fn single_entry(literal: Literal, context: &str) -> Result<(String, Literal), FilterError> {
    let entries = match literal {
        Literal::Dict(entries) => entries,
        other => {
            return Err(FilterError::Shape(format!(
                "{context} must be a dict, found {}",
                other.kind()
            )))
        }
    };

    let mut entries = entries.into_iter();
    match (entries.next(), entries.next()) {
        (Some((Literal::Str(key), value)), None) => Ok((key, value)),
        (Some((key, _)), None) => Err(FilterError::Shape(format!(
            "{context} key must be a string, found {}",
            key.kind()
        ))),
        _ => Err(FilterError::Shape(format!("{context} must have exactly one entry"))),
    }
}

fn scalar(literal: Literal, operator: &str) -> Result<FilterValue, FilterError> {
    match literal {
        Literal::Str(value) => Ok(FilterValue::Str(value)),
        Literal::Int(value) => Ok(FilterValue::Int(value)),
        Literal::Float(value) => Ok(FilterValue::Float(value)),
        Literal::Bool(value) => Ok(FilterValue::Bool(value)),
        other => Err(FilterError::Shape(format!(
            "`{operator}` expects a scalar value, found {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_filter_expression, FilterError, FilterValue, SearchFilter};

    #[test]
    fn blank_expression_means_no_filter() {
        assert_eq!(parse_filter_expression("   \n"), Ok(None));
    }

    #[test]
    fn empty_dict_and_none_literals_mean_no_filter() {
        assert_eq!(parse_filter_expression("{}"), Ok(None));
        assert_eq!(parse_filter_expression(" None "), Ok(None));
        assert!(parse_filter_expression("[]").is_err());
    }

    #[test]
    fn equality_filter_serializes_to_search_wire_form() {
        let filter = parse_filter_expression("{'@eq': {'region': 'EMEA'}}")
            .expect("filter should parse")
            .expect("filter should be present");

        assert_eq!(filter, SearchFilter::eq("region", "EMEA"));
        assert_eq!(filter.to_json(), json!({"@eq": {"region": "EMEA"}}));
    }

    #[test]
    fn nested_boolean_filter_is_validated_recursively() {
        let filter = parse_filter_expression(
            "{'@and': [{'@gte': {'deal_value': 1000}}, {'@not': {'@eq': {'sales_rep': 'Bob'}}}]}",
        )
        .expect("filter should parse")
        .expect("filter should be present");

        assert_eq!(
            filter,
            SearchFilter::And(vec![
                SearchFilter::Gte {
                    column: "deal_value".to_string(),
                    value: FilterValue::Int(1000)
                },
                SearchFilter::Not(Box::new(SearchFilter::eq("sales_rep", "Bob"))),
            ])
        );
        assert_eq!(
            serde_json::to_value(&filter).expect("filter should serialize"),
            json!({
                "@and": [{"@gte": {"deal_value": 1000}}, {"@not": {"@eq": {"sales_rep": "Bob"}}}]
            })
        );
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let error = parse_filter_expression("{'@regex': {'region': '.*'}}")
            .expect_err("unknown operator should fail");
        assert!(matches!(error, FilterError::Shape(message) if message.contains("@regex")));
    }

    #[test]
    fn comparison_with_multiple_columns_is_rejected() {
        assert!(parse_filter_expression("{'@eq': {'a': 1, 'b': 2}}").is_err());
    }

    #[test]
    fn non_scalar_comparison_value_is_rejected() {
        assert!(parse_filter_expression("{'@eq': {'a': [1, 2]}}").is_err());
        assert!(parse_filter_expression("{'@or': []}").is_err());
    }

    #[test]
    fn json_style_input_is_also_accepted() {
        let filter = parse_filter_expression(r#"{"@contains": {"tags": "renewal"}}"#)
            .expect("double-quoted literal should parse");
        assert!(matches!(filter, Some(SearchFilter::Contains { .. })));
    }
}
