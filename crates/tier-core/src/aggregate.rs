//! Partial aggregates
//!
//! Per-partition aggregate state that can be combined across partitions
//! without loss: counts and sums add, min/max take the extreme and averages
//! travel as `(sum, count)` until the final division.

use crate::error::{Result, TierError};
use crate::query::{AggregateFunction, Aggregation};
use crate::schema::Schema;
use crate::types::{Row, Value};
use std::collections::BTreeMap;

/// Running numeric sum. Integers are summed exactly in `i128`, floats
/// separately, so integer-only inputs never lose precision.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NumericSum {
    integer: i128,
    float: f64,
    has_float: bool,
    values: u64,
}

impl NumericSum {
    pub fn add(&mut self, value: &Value) {
        match value {
            Value::Int64(v) => self.integer += i128::from(*v),
            Value::Float64(v) => {
                self.float += v;
                self.has_float = true;
            }
            _ => return,
        }
        self.values += 1;
    }

    pub fn merge(&mut self, other: &NumericSum) {
        self.integer += other.integer;
        self.float += other.float;
        self.has_float |= other.has_float;
        self.values += other.values;
    }

    /// Number of non-null numeric values folded in.
    pub fn count(&self) -> u64 {
        self.values
    }

    pub fn total(&self) -> Value {
        if self.values == 0 {
            return Value::Null;
        }
        if self.has_float {
            return Value::Float64(self.integer as f64 + self.float);
        }
        match i64::try_from(self.integer) {
            Ok(v) => Value::Int64(v),
            Err(_) => Value::Float64(self.integer as f64),
        }
    }

    pub fn mean(&self) -> Value {
        if self.values == 0 {
            return Value::Null;
        }
        Value::Float64((self.integer as f64 + self.float) / self.values as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateState {
    Count(u64),
    Sum(NumericSum),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg(NumericSum),
}

impl AggregateState {
    pub fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::Count => AggregateState::Count(0),
            AggregateFunction::Sum => AggregateState::Sum(NumericSum::default()),
            AggregateFunction::Min => AggregateState::Min(None),
            AggregateFunction::Max => AggregateState::Max(None),
            AggregateFunction::Avg => AggregateState::Avg(NumericSum::default()),
        }
    }

    pub fn function(&self) -> AggregateFunction {
        match self {
            AggregateState::Count(_) => AggregateFunction::Count,
            AggregateState::Sum(_) => AggregateFunction::Sum,
            AggregateState::Min(_) => AggregateFunction::Min,
            AggregateState::Max(_) => AggregateFunction::Max,
            AggregateState::Avg(_) => AggregateFunction::Avg,
        }
    }

    /// Fold one input. `None` is a `COUNT(*)` row; NULL values are ignored
    /// by every function.
    pub fn update(&mut self, input: Option<&Value>) {
        let value = match input {
            None => {
                if let AggregateState::Count(n) = self {
                    *n += 1;
                }
                return;
            }
            Some(v) if v.is_null() => return,
            Some(v) => v,
        };

        match self {
            AggregateState::Count(n) => *n += 1,
            AggregateState::Sum(sum) | AggregateState::Avg(sum) => sum.add(value),
            AggregateState::Min(current) => {
                if current.as_ref().map_or(true, |c| value < c) {
                    *current = Some(value.clone());
                }
            }
            AggregateState::Max(current) => {
                if current.as_ref().map_or(true, |c| value > c) {
                    *current = Some(value.clone());
                }
            }
        }
    }

    pub fn merge(&mut self, other: &AggregateState) -> Result<()> {
        match (self, other) {
            (AggregateState::Count(a), AggregateState::Count(b)) => *a += b,
            (AggregateState::Sum(a), AggregateState::Sum(b))
            | (AggregateState::Avg(a), AggregateState::Avg(b)) => a.merge(b),
            (AggregateState::Min(a), AggregateState::Min(b)) => {
                if let Some(b) = b {
                    if a.as_ref().map_or(true, |a| b < a) {
                        *a = Some(b.clone());
                    }
                }
            }
            (AggregateState::Max(a), AggregateState::Max(b)) => {
                if let Some(b) = b {
                    if a.as_ref().map_or(true, |a| b > a) {
                        *a = Some(b.clone());
                    }
                }
            }
            (a, b) => {
                return Err(TierError::InvalidQuery(format!(
                    "cannot merge {} partial into {} partial",
                    b.function(),
                    a.function()
                )))
            }
        }
        Ok(())
    }

    pub fn finish(&self) -> Value {
        match self {
            AggregateState::Count(n) => Value::Int64(i64::try_from(*n).unwrap_or(i64::MAX)),
            AggregateState::Sum(sum) => sum.total(),
            AggregateState::Avg(sum) => sum.mean(),
            AggregateState::Min(v) | AggregateState::Max(v) => v.clone().unwrap_or(Value::Null),
        }
    }
}

/// An [`Aggregation`] with its columns resolved to row positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundAggregation {
    pub function: AggregateFunction,
    pub input: Option<usize>,
    pub group_by: Vec<usize>,
}

impl BoundAggregation {
    pub fn bind(aggregation: &Aggregation, schema: &Schema) -> Result<Self> {
        let input = aggregation
            .column
            .as_deref()
            .map(|c| schema.index_of(c))
            .transpose()?;
        let group_by = aggregation
            .group_by
            .iter()
            .map(|c| schema.index_of(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            function: aggregation.function,
            input,
            group_by,
        })
    }
}

/// Aggregate state for one partition (or the merge of several), keyed by
/// group values. Ungrouped aggregates use the empty group key.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialAggregate {
    function: AggregateFunction,
    groups: BTreeMap<Vec<Value>, AggregateState>,
}

impl PartialAggregate {
    pub fn new(function: AggregateFunction) -> Self {
        Self {
            function,
            groups: BTreeMap::new(),
        }
    }

    pub fn from_rows<'a>(
        bound: &BoundAggregation,
        rows: impl IntoIterator<Item = &'a Row>,
    ) -> Result<Self> {
        let mut partial = Self::new(bound.function);
        for row in rows {
            partial.accumulate(bound, row)?;
        }
        Ok(partial)
    }

    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    pub fn groups(&self) -> &BTreeMap<Vec<Value>, AggregateState> {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn accumulate(&mut self, bound: &BoundAggregation, row: &Row) -> Result<()> {
        let group_key = bound
            .group_by
            .iter()
            .map(|&i| cell(row, i).cloned())
            .collect::<Result<Vec<_>>>()?;
        let input = bound.input.map(|i| cell(row, i)).transpose()?;

        let function = self.function;
        self.groups
            .entry(group_key)
            .or_insert_with(|| AggregateState::new(function))
            .update(input);
        Ok(())
    }

    /// Combine another partial into this one (map union, per-group merge).
    pub fn merge(&mut self, other: &PartialAggregate) -> Result<()> {
        if other.function != self.function {
            return Err(TierError::InvalidQuery(format!(
                "cannot merge {} partial into {} partial",
                other.function, self.function
            )));
        }
        for (key, state) in &other.groups {
            match self.groups.get_mut(key) {
                Some(existing) => existing.merge(state)?,
                None => {
                    self.groups.insert(key.clone(), state.clone());
                }
            }
        }
        Ok(())
    }

    /// Final rows: group values followed by the aggregate value, in group
    /// order. An ungrouped aggregate over no rows still yields one row
    /// (`0` for count, NULL otherwise).
    pub fn finish(&self, grouped: bool) -> Vec<Row> {
        if !grouped && self.groups.is_empty() {
            return vec![vec![AggregateState::new(self.function).finish()]];
        }
        self.groups
            .iter()
            .map(|(key, state)| {
                let mut row = key.clone();
                row.push(state.finish());
                row
            })
            .collect()
    }
}

fn cell(row: &Row, index: usize) -> Result<&Value> {
    row.get(index)
        .ok_or_else(|| TierError::InvalidRow(format!("row has no column {}", index)))
}
