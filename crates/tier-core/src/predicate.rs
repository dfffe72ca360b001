//! Conjunctive predicates over the relation and their key-range decomposition.

use crate::error::{Result, TierError};
use crate::range::{intersect_sets, normalize, KeyRange};
use crate::schema::Schema;
use crate::types::{Key, Row, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::GtEq => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        };
        write!(f, "{}", symbol)
    }
}

/// A single conjunct. NULL never satisfies a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    /// Inclusive on both ends, like SQL `BETWEEN`.
    Between {
        column: String,
        low: Value,
        high: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
}

impl Condition {
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Condition::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn between(
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        Condition::Between {
            column: column.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Condition::In {
            column: column.into(),
            values,
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Condition::Compare { column, .. }
            | Condition::Between { column, .. }
            | Condition::In { column, .. } => column,
        }
    }

    /// Literal values referenced by the condition.
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Condition::Compare { value, .. } => vec![value],
            Condition::Between { low, high, .. } => vec![low, high],
            Condition::In { values, .. } => values.iter().collect(),
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        if value.is_null() {
            return false;
        }
        match self {
            Condition::Compare { op, value: rhs, .. } => {
                !rhs.is_null() && op.holds(value.cmp(rhs))
            }
            Condition::Between { low, high, .. } => {
                !low.is_null() && !high.is_null() && value >= low && value <= high
            }
            Condition::In { values, .. } => values.iter().any(|v| !v.is_null() && v == value),
        }
    }

    pub fn evaluate(&self, schema: &Schema, row: &Row) -> Result<bool> {
        let index = schema.index_of(self.column())?;
        let value = row
            .get(index)
            .ok_or_else(|| TierError::InvalidRow(format!("missing column {}", index)))?;
        Ok(self.matches(value))
    }

    /// Key ranges satisfying this condition when it constrains the key column.
    fn key_ranges(&self) -> Result<Vec<KeyRange>> {
        let ranges = match self {
            Condition::Compare { op, value, .. } => {
                let key = key_operand(value)?;
                match op {
                    CompareOp::Eq => vec![KeyRange::point(key)],
                    CompareOp::NotEq => {
                        let mut ranges = vec![KeyRange::below(key)];
                        if let Some(next) = key.checked_add(1) {
                            ranges.push(KeyRange::at_least(next));
                        }
                        ranges
                    }
                    CompareOp::Lt => vec![KeyRange::below(key)],
                    CompareOp::LtEq => vec![KeyRange::new(None, key.checked_add(1))],
                    CompareOp::Gt => key
                        .checked_add(1)
                        .map(KeyRange::at_least)
                        .into_iter()
                        .collect(),
                    CompareOp::GtEq => vec![KeyRange::at_least(key)],
                }
            }
            Condition::Between { low, high, .. } => {
                let (low, high) = (key_operand(low)?, key_operand(high)?);
                if low > high {
                    Vec::new()
                } else {
                    vec![KeyRange::inclusive(low, high)]
                }
            }
            Condition::In { values, .. } => values
                .iter()
                .map(|v| key_operand(v).map(KeyRange::point))
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(normalize(ranges))
    }
}

fn key_operand(value: &Value) -> Result<Key> {
    value.as_i64().ok_or_else(|| {
        TierError::InvalidQuery(format!(
            "key column can only be compared with integers, found {}",
            value
        ))
    })
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { column, op, value } => write!(f, "{} {} {}", column, op, value),
            Condition::Between { column, low, high } => {
                write!(f, "{} BETWEEN {} AND {}", column, low, high)
            }
            Condition::In { column, values } => {
                let list: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{} IN ({})", column, list.join(", "))
            }
        }
    }
}

/// A conjunction of conditions. The empty conjunction matches every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    conjuncts: Vec<Condition>,
}

impl Predicate {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.conjuncts.push(condition);
        self
    }

    pub fn conjuncts(&self) -> &[Condition] {
        &self.conjuncts
    }

    /// Decompose the key-column conditions into sorted, disjoint sub-ranges.
    ///
    /// With no key condition the result is the full range. A contradiction
    /// (e.g. `key = 1 AND key = 2`) yields no ranges at all.
    pub fn key_ranges(&self, key_column: &str) -> Result<Vec<KeyRange>> {
        let mut ranges = vec![KeyRange::full()];
        for condition in self.conjuncts.iter().filter(|c| c.column() == key_column) {
            ranges = intersect_sets(&ranges, &condition.key_ranges()?);
            if ranges.is_empty() {
                break;
            }
        }
        Ok(ranges)
    }

    /// Conditions on columns other than the key, passed to backends verbatim.
    pub fn residual(&self, key_column: &str) -> Vec<Condition> {
        self.conjuncts
            .iter()
            .filter(|c| c.column() != key_column)
            .cloned()
            .collect()
    }

    pub fn evaluate(&self, schema: &Schema, row: &Row) -> Result<bool> {
        for condition in &self.conjuncts {
            if !condition.evaluate(schema, row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conjuncts.is_empty() {
            return write!(f, "TRUE");
        }
        let parts: Vec<String> = self.conjuncts.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(" AND "))
    }
}
