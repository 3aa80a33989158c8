//! Context filters and the matcher that evaluates them
//!
//! A context filter is a tree of conjunctions and disjunctions whose leaves
//! are `[propertyPath, operator, operand...]` conditions. Call receivers use
//! it to decide whether a remote operation applies to their local context.
//! Evaluation is total: a well-formed filter never fails, a missing property
//! path makes `exists` false and every comparison operator false.

use std::cmp::Ordering;

use regex::Regex;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::model::object::CoatyObject;

/// Structured boolean expression over an object's properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFilter {
    pub conditions: FilterConditions,
}

impl ContextFilter {
    /// Filter with a single condition
    pub fn condition(condition: FilterCondition) -> Self {
        Self {
            conditions: FilterConditions::Condition(condition),
        }
    }

    /// Filter requiring all of the given subtrees
    pub fn all(conditions: Vec<FilterConditions>) -> Self {
        Self {
            conditions: FilterConditions::And { and: conditions },
        }
    }

    /// Filter requiring any of the given subtrees
    pub fn any(conditions: Vec<FilterConditions>) -> Self {
        Self {
            conditions: FilterConditions::Or { or: conditions },
        }
    }
}

/// Node of the condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterConditions {
    Condition(FilterCondition),
    And { and: Vec<FilterConditions> },
    Or { or: Vec<FilterConditions> },
}

/// Supported condition operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Between,
    Like,
    Exists,
    Contains,
    In,
    NotIn,
}

/// Single condition: property path, operator, operands
///
/// Serialized as a JSON array `[path, operator, operand...]`. `between`
/// carries two operands, `exists` none, everything else one. Property paths
/// use `.` to descend into nested objects.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCondition {
    pub property: String,
    pub operator: FilterOperator,
    pub operands: Vec<Value>,
}

impl FilterCondition {
    pub fn new<S: Into<String>>(
        property: S,
        operator: FilterOperator,
        operands: Vec<Value>,
    ) -> Self {
        Self {
            property: property.into(),
            operator,
            operands,
        }
    }
}

impl Serialize for FilterCondition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2 + self.operands.len()))?;
        seq.serialize_element(&self.property)?;
        seq.serialize_element(&self.operator)?;
        for operand in &self.operands {
            seq.serialize_element(operand)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for FilterCondition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ConditionVisitor;

        impl<'de> Visitor<'de> for ConditionVisitor {
            type Value = FilterCondition;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a [propertyPath, operator, operand...] array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let property: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let operator: FilterOperator = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let mut operands = Vec::new();
                while let Some(operand) = seq.next_element::<Value>()? {
                    operands.push(operand);
                }
                Ok(FilterCondition {
                    property,
                    operator,
                    operands,
                })
            }
        }

        deserializer.deserialize_seq(ConditionVisitor)
    }
}

/// Evaluate a context filter against an object
pub fn matches_filter(filter: &ContextFilter, object: &CoatyObject) -> bool {
    match serde_json::to_value(object) {
        Ok(value) => eval_node(&filter.conditions, &value),
        Err(_) => false,
    }
}

fn eval_node(node: &FilterConditions, object: &Value) -> bool {
    match node {
        FilterConditions::Condition(condition) => eval_condition(condition, object),
        FilterConditions::And { and } => and.iter().all(|n| eval_node(n, object)),
        FilterConditions::Or { or } => or.iter().any(|n| eval_node(n, object)),
    }
}

fn eval_condition(condition: &FilterCondition, object: &Value) -> bool {
    let value = lookup_path(object, &condition.property);

    if condition.operator == FilterOperator::Exists {
        return value.is_some();
    }

    // All comparison operators are false on a missing path.
    let value = match value {
        Some(v) => v,
        None => return false,
    };
    let operand = condition.operands.first();

    match condition.operator {
        // handled above; the path is known to exist here
        FilterOperator::Exists => true,
        FilterOperator::Equals => operand.is_some_and(|op| value == op),
        FilterOperator::NotEquals => operand.is_some_and(|op| value != op),
        FilterOperator::LessThan => {
            compare(value, operand).is_some_and(|ord| ord == Ordering::Less)
        }
        FilterOperator::LessThanOrEqual => {
            compare(value, operand).is_some_and(|ord| ord != Ordering::Greater)
        }
        FilterOperator::GreaterThan => {
            compare(value, operand).is_some_and(|ord| ord == Ordering::Greater)
        }
        FilterOperator::GreaterThanOrEqual => {
            compare(value, operand).is_some_and(|ord| ord != Ordering::Less)
        }
        FilterOperator::Between => eval_between(value, &condition.operands),
        FilterOperator::Like => match (value, operand) {
            (Value::String(s), Some(Value::String(pattern))) => like_match(s, pattern),
            _ => false,
        },
        FilterOperator::Contains => eval_contains(value, operand),
        FilterOperator::In => match operand {
            Some(Value::Array(set)) => set.contains(value),
            _ => false,
        },
        FilterOperator::NotIn => match operand {
            Some(Value::Array(set)) => !set.contains(value),
            _ => false,
        },
    }
}

fn eval_between(value: &Value, operands: &[Value]) -> bool {
    if operands.len() != 2 {
        return false;
    }
    let (low, high) = match compare_values(&operands[0], &operands[1]) {
        Some(Ordering::Greater) => (&operands[1], &operands[0]),
        Some(_) => (&operands[0], &operands[1]),
        None => return false,
    };
    let lower_ok = compare_values(value, low).is_some_and(|ord| ord != Ordering::Less);
    let upper_ok = compare_values(value, high).is_some_and(|ord| ord != Ordering::Greater);
    lower_ok && upper_ok
}

fn eval_contains(value: &Value, operand: Option<&Value>) -> bool {
    match (value, operand) {
        (Value::Array(items), Some(Value::Array(wanted))) => {
            wanted.iter().all(|w| items.contains(w))
        }
        (Value::Array(items), Some(single)) => items.contains(single),
        (Value::String(s), Some(Value::String(needle))) => s.contains(needle.as_str()),
        _ => false,
    }
}

fn compare(value: &Value, operand: Option<&Value>) -> Option<Ordering> {
    operand.and_then(|op| compare_values(value, op))
}

/// Total order on comparable JSON scalars; None for mixed or non-scalar pairs
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL-style pattern match: `%` any run, `_` one character
fn like_match(value: &str, pattern: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).map(|re| re.is_match(value)).unwrap_or(false)
}

fn lookup_path<'a>(object: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = object;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
