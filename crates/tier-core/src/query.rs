//! Queries over the relation: filter, aggregation, ordering and limit.

use crate::error::{Result, TierError};
use crate::predicate::{Condition, Predicate};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Descending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    /// Whether partial results computed per partition can be combined into
    /// the exact global result. `Avg` qualifies because it travels as
    /// `(sum, count)` rather than as a partial average.
    pub fn is_decomposable(&self) -> bool {
        match self {
            AggregateFunction::Count
            | AggregateFunction::Sum
            | AggregateFunction::Avg
            | AggregateFunction::Min
            | AggregateFunction::Max => true,
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: AggregateFunction,
    /// Input column; `None` is only valid for `COUNT(*)`.
    pub column: Option<String>,
    pub group_by: Vec<String>,
}

impl Aggregation {
    pub fn count_all() -> Self {
        Self {
            function: AggregateFunction::Count,
            column: None,
            group_by: Vec::new(),
        }
    }

    pub fn of(function: AggregateFunction, column: impl Into<String>) -> Self {
        Self {
            function,
            column: Some(column.into()),
            group_by: Vec::new(),
        }
    }

    pub fn grouped_by(mut self, columns: Vec<String>) -> Self {
        self.group_by = columns;
        self
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({})",
            self.function,
            self.column.as_deref().unwrap_or("*")
        )?;
        if self.is_grouped() {
            write!(f, " GROUP BY {}", self.group_by.join(", "))?;
        }
        Ok(())
    }
}

/// An immutable query over the partitioned relation.
///
/// Built with the consuming `filter`/`aggregate`/`order_by`/`limit` methods
/// and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    predicate: Predicate,
    aggregation: Option<Aggregation>,
    order_by: Option<OrderBy>,
    limit: Option<usize>,
}

impl QuerySpec {
    /// A query returning every row.
    pub fn scan() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.predicate = self.predicate.and(condition);
        self
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn aggregation(&self) -> Option<&Aggregation> {
        self.aggregation.as_ref()
    }

    pub fn ordering(&self) -> Option<&OrderBy> {
        self.order_by.as_ref()
    }

    pub fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    /// Direction of the requested order when it is on the key column alone.
    pub fn key_order(&self, schema: &Schema) -> Option<SortDirection> {
        self.order_by
            .as_ref()
            .filter(|o| o.column == schema.key_column())
            .map(|o| o.direction)
    }

    pub fn validate(&self, schema: &Schema) -> Result<()> {
        for condition in self.predicate.conjuncts() {
            let field = schema.field_with_name(condition.column())?;
            for operand in condition.operands() {
                if !operand.fits(field.data_type()) {
                    return Err(TierError::InvalidQuery(format!(
                        "condition '{}' compares column of type {} with {}",
                        condition,
                        field.data_type(),
                        operand
                    )));
                }
            }
        }

        if let Some(aggregation) = &self.aggregation {
            match &aggregation.column {
                Some(column) => {
                    let field = schema.field_with_name(column)?;
                    let needs_numeric = matches!(
                        aggregation.function,
                        AggregateFunction::Sum | AggregateFunction::Avg
                    );
                    if needs_numeric && !field.data_type().is_numeric() {
                        return Err(TierError::InvalidQuery(format!(
                            "{} requires a numeric column, '{}' is {}",
                            aggregation.function,
                            column,
                            field.data_type()
                        )));
                    }
                }
                None if aggregation.function != AggregateFunction::Count => {
                    return Err(TierError::InvalidQuery(format!(
                        "{} requires an input column",
                        aggregation.function
                    )));
                }
                None => {}
            }
            for column in &aggregation.group_by {
                schema.index_of(column)?;
            }
        }

        if let Some(order) = &self.order_by {
            schema.index_of(&order.column)?;
            if let Some(aggregation) = &self.aggregation {
                if !aggregation.group_by.contains(&order.column) {
                    return Err(TierError::InvalidQuery(format!(
                        "cannot order aggregate output by '{}', it is not a grouping column",
                        order.column
                    )));
                }
            }
        }

        if self.limit == Some(0) {
            return Err(TierError::InvalidQuery("limit must be positive".to_string()));
        }

        Ok(())
    }
}
