//! Query model: dotted-path predicates evaluated against a document's JSON form.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Exists(bool),
    IsNumber,
}

/// A conjunction of `(path, predicate)` clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Predicate)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, predicate: Predicate) -> Self {
        self.clauses.push((path.into(), predicate));
        self
    }

    pub fn eq(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Predicate::Eq(value.into()))
    }

    pub fn ne(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Predicate::Ne(value.into()))
    }

    pub fn is_in<I, V>(self, path: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.with(path, Predicate::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn not_in<I, V>(self, path: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.with(
            path,
            Predicate::NotIn(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn gt(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Predicate::Gt(value.into()))
    }

    pub fn gte(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Predicate::Gte(value.into()))
    }

    pub fn lt(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Predicate::Lt(value.into()))
    }

    pub fn lte(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Predicate::Lte(value.into()))
    }

    pub fn exists(self, path: impl Into<String>, present: bool) -> Self {
        self.with(path, Predicate::Exists(present))
    }

    pub fn is_number(self, path: impl Into<String>) -> Self {
        self.with(path, Predicate::IsNumber)
    }

    /// Appends every clause of `other`.
    pub fn and(mut self, other: Filter) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    /// Parses a JSON query object: plain values are equality matches, `{"$op": ..}`
    /// objects map onto predicates.
    pub fn from_query(query: &Map<String, Value>) -> Result<Self, StoreError> {
        let mut filter = Filter::new();
        for (path, value) in query {
            match value {
                Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    for (op, arg) in ops {
                        filter = filter.with(path.clone(), parse_operator(op, arg)?);
                    }
                }
                other => filter = filter.with(path.clone(), Predicate::Eq(other.clone())),
            }
        }
        Ok(filter)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(path, predicate)| predicate_matches(predicate, lookup(doc, path)))
    }
}

fn parse_operator(op: &str, arg: &Value) -> Result<Predicate, StoreError> {
    let list = |arg: &Value| -> Result<Vec<Value>, StoreError> {
        arg.as_array()
            .cloned()
            .ok_or_else(|| StoreError::InvalidQuery(format!("{op} expects an array")))
    };

    Ok(match op {
        "$eq" => Predicate::Eq(arg.clone()),
        "$ne" => Predicate::Ne(arg.clone()),
        "$in" => Predicate::In(list(arg)?),
        "$nin" => Predicate::NotIn(list(arg)?),
        "$gt" => Predicate::Gt(arg.clone()),
        "$gte" => Predicate::Gte(arg.clone()),
        "$lt" => Predicate::Lt(arg.clone()),
        "$lte" => Predicate::Lte(arg.clone()),
        "$exists" => Predicate::Exists(arg.as_bool().unwrap_or(true)),
        other => return Err(StoreError::InvalidQuery(format!("unsupported operator {other}"))),
    })
}

/// Resolves a dotted path such as `scoreData.percent`.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        _ => None,
    })
}

/// Sets a dotted path, creating intermediate objects.
pub fn assign(doc: &mut Value, path: &str, value: Value) -> Result<(), StoreError> {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        let map = current
            .as_object_mut()
            .ok_or_else(|| StoreError::InvalidQuery(format!("cannot set {path}: not an object")))?;
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Err(StoreError::InvalidQuery("empty path".to_string()))
}

fn predicate_matches(predicate: &Predicate, field: Option<&Value>) -> bool {
    match predicate {
        Predicate::Eq(expected) => eq_or_contains(field, expected),
        Predicate::Ne(expected) => !eq_or_contains(field, expected),
        Predicate::In(values) => values.iter().any(|v| eq_or_contains(field, v)),
        Predicate::NotIn(values) => !values.iter().any(|v| eq_or_contains(field, v)),
        Predicate::Gt(bound) => range(field, bound, |o| o == Ordering::Greater),
        Predicate::Gte(bound) => range(field, bound, |o| o != Ordering::Less),
        Predicate::Lt(bound) => range(field, bound, |o| o == Ordering::Less),
        Predicate::Lte(bound) => range(field, bound, |o| o != Ordering::Greater),
        Predicate::Exists(present) => field.is_some() == *present,
        Predicate::IsNumber => matches!(field, Some(Value::Number(_))),
    }
}

// Array fields match a scalar if any element matches.
fn eq_or_contains(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

// Range comparisons only apply within the same type bracket.
fn range(field: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match (field, bound) {
        (Some(Value::Number(x)), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).map(&accept).unwrap_or(false),
            _ => false,
        },
        (Some(Value::String(x)), Value::String(y)) => accept(x.as_str().cmp(y.as_str())),
        _ => false,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order used for sorting: missing/null, numbers, strings, objects, arrays, booleans.
pub fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or(f64::NAN)
            .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sort_by(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((path.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn ordering(&self, a: &Value, b: &Value) -> Ordering {
        for (path, order) in &self.sort {
            let cmp = compare_fields(lookup(a, path), lookup(b, path));
            let cmp = match order {
                SortOrder::Asc => cmp,
                SortOrder::Desc => cmp.reverse(),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    }
}

/// `$group: { _id: null, ... }` style accumulators.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Count,
    CountWhere(Filter),
    Sum(String),
    Max(String),
}
