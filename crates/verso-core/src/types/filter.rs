//! Filter types for versioned-row queries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Comparison applied to one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to. `Eq(null)` matches null columns.
    Eq(serde_json::Value),
    /// Not equal to.
    Ne(serde_json::Value),
    Gt(serde_json::Value),
    Gte(serde_json::Value),
    Lt(serde_json::Value),
    Lte(serde_json::Value),
    /// In list.
    In(Vec<serde_json::Value>),
    /// Not in list.
    Nin(Vec<serde_json::Value>),
    /// Contains substring (case-sensitive).
    Contains(String),
    /// Contains substring (case-insensitive).
    Icontains(String),
    /// Inclusive range.
    Between {
        min: serde_json::Value,
        max: serde_json::Value,
    },
    IsNull,
    IsNotNull,
}

/// A single filter condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Column name to filter on.
    pub field: String,
    /// Operator to apply.
    pub operator: FilterOperator,
}

impl FilterCondition {
    fn new(field: impl Into<String>, operator: FilterOperator) -> Self {
        Self {
            field: field.into(),
            operator,
        }
    }
}

/// Composite filter with AND/OR/NOT logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Single condition.
    Condition(FilterCondition),
    /// AND of multiple filters. Empty matches everything.
    And(Vec<Filter>),
    /// OR of multiple filters. Empty matches nothing.
    Or(Vec<Filter>),
    /// NOT of a filter.
    Not(Box<Filter>),
}

impl Filter {
    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Filter::Condition(FilterCondition::new(field, FilterOperator::Eq(value.into())))
    }

    /// Create an inequality filter.
    pub fn ne(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Filter::Condition(FilterCondition::new(field, FilterOperator::Ne(value.into())))
    }

    /// Create a greater than filter.
    pub fn gt(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Filter::Condition(FilterCondition::new(field, FilterOperator::Gt(value.into())))
    }

    /// Create a greater than or equal filter.
    pub fn gte(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Filter::Condition(FilterCondition::new(field, FilterOperator::Gte(value.into())))
    }

    /// Create a less than filter.
    pub fn lt(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Filter::Condition(FilterCondition::new(field, FilterOperator::Lt(value.into())))
    }

    /// Create a less than or equal filter.
    pub fn lte(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Filter::Condition(FilterCondition::new(field, FilterOperator::Lte(value.into())))
    }

    /// Create an in-list filter.
    pub fn in_list(field: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Filter::Condition(FilterCondition::new(field, FilterOperator::In(values)))
    }

    /// Create a not-in-list filter.
    pub fn not_in_list(field: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Filter::Condition(FilterCondition::new(field, FilterOperator::Nin(values)))
    }

    /// Create a contains filter.
    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Condition(FilterCondition::new(
            field,
            FilterOperator::Contains(value.into()),
        ))
    }

    /// Create a case-insensitive contains filter.
    pub fn icontains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Condition(FilterCondition::new(
            field,
            FilterOperator::Icontains(value.into()),
        ))
    }

    /// Create a range filter.
    pub fn between(
        field: impl Into<String>,
        min: impl Into<serde_json::Value>,
        max: impl Into<serde_json::Value>,
    ) -> Self {
        Filter::Condition(FilterCondition::new(
            field,
            FilterOperator::Between {
                min: min.into(),
                max: max.into(),
            },
        ))
    }

    /// Create an is null filter.
    pub fn is_null(field: impl Into<String>) -> Self {
        Filter::Condition(FilterCondition::new(field, FilterOperator::IsNull))
    }

    /// Create an is not null filter.
    pub fn is_not_null(field: impl Into<String>) -> Self {
        Filter::Condition(FilterCondition::new(field, FilterOperator::IsNotNull))
    }

    /// Create an AND filter.
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    /// Create an OR filter.
    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    /// Create a NOT filter.
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Conjoin with another filter, flattening nested ANDs.
    pub fn and_also(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), right) => {
                left.push(right);
                Filter::And(left)
            }
            (left, Filter::And(mut right)) => {
                right.insert(0, left);
                Filter::And(right)
            }
            (left, right) => Filter::And(vec![left, right]),
        }
    }

    /// Every column name the filter references.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Filter::Condition(c) => vec![c.field.as_str()],
            Filter::And(filters) | Filter::Or(filters) => {
                filters.iter().flat_map(Filter::fields).collect()
            }
            Filter::Not(inner) => inner.fields(),
        }
    }
}

/// Trait for translating filters to backend-specific formats.
pub trait FilterTranslator {
    type Output;
    type Error;

    /// Translate a filter to the backend-specific format.
    fn translate(&self, filter: &Filter) -> Result<Self::Output, Self::Error>;
}

/// Convert a simple key-value map to an equality filter.
///
/// Returns `None` for an empty map.
pub fn from_simple_filters(filters: &BTreeMap<String, serde_json::Value>) -> Option<Filter> {
    let mut conditions: Vec<Filter> = filters
        .iter()
        .map(|(k, v)| Filter::eq(k.clone(), v.clone()))
        .collect();

    match conditions.len() {
        0 => None,
        1 => conditions.pop(),
        _ => Some(Filter::And(conditions)),
    }
}
