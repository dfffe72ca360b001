//! Result merger
//!
//! Combines per-fragment rows or partial aggregates into the single result
//! the caller asked for. Inputs arrive indexed by fragment position, so the
//! output depends only on the set of fragment results, never on which
//! backend answered first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tier_core::{
    BoundAggregation, FragmentResult, PartialAggregate, PartitionId, Result, Row, SortDirection,
    TierError, Value,
};

/// Sort column resolved to a row position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub direction: SortDirection,
}

impl SortKey {
    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        let ordering = cell(a, self.column).cmp(cell(b, self.column));
        match self.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }
}

/// What the merger does with the fragment results of one query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    /// Aggregation to finish (or compute locally for fragments that returned rows)
    pub aggregation: Option<BoundAggregation>,
    /// Requested output order
    pub order: Option<SortKey>,
    /// Maximum rows in the output
    pub limit: Option<usize>,
}

/// Result of one fragment as handed to the merger
#[derive(Debug, Clone)]
pub struct FragmentOutput {
    pub partition_id: PartitionId,
    /// Rows are already sorted in the requested order
    pub ordered: bool,
    pub result: FragmentResult,
}

/// Merged output of a query
#[derive(Debug, Clone, PartialEq)]
pub enum MergedOutput {
    Rows(Vec<Row>),
    /// Finished aggregate rows: group values followed by the aggregate value
    Aggregate(Vec<Row>),
}

/// Merges fragment outputs according to a [`MergePlan`]
#[derive(Debug, Clone)]
pub struct ResultMerger {
    plan: MergePlan,
}

impl ResultMerger {
    pub fn new(plan: MergePlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &MergePlan {
        &self.plan
    }

    /// Merge outputs given in fragment order
    pub fn merge(&self, outputs: Vec<FragmentOutput>) -> Result<MergedOutput> {
        match &self.plan.aggregation {
            Some(bound) => self.merge_aggregates(bound, outputs).map(MergedOutput::Aggregate),
            None => self.merge_rows(outputs).map(MergedOutput::Rows),
        }
    }

    fn merge_aggregates(
        &self,
        bound: &BoundAggregation,
        outputs: Vec<FragmentOutput>,
    ) -> Result<Vec<Row>> {
        let mut combined = PartialAggregate::new(bound.function);
        for output in outputs {
            match output.result {
                FragmentResult::Partial(partial) => combined.merge(&partial)?,
                FragmentResult::Rows(rows) => {
                    // Aggregation was not pushed to this backend
                    let partial = PartialAggregate::from_rows(bound, &rows)?;
                    combined.merge(&partial)?;
                }
            }
        }

        let grouped = !bound.group_by.is_empty();
        let mut rows = combined.finish(grouped);

        if let Some(order) = self.plan.order {
            // Output rows carry the group columns first, in group_by order
            if let Some(position) = bound.group_by.iter().position(|&c| c == order.column) {
                let key = SortKey {
                    column: position,
                    direction: order.direction,
                };
                rows.sort_by(|a, b| key.compare(a, b));
            }
        }
        if let Some(limit) = self.plan.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn merge_rows(&self, outputs: Vec<FragmentOutput>) -> Result<Vec<Row>> {
        let mut streams = Vec::with_capacity(outputs.len());
        for output in outputs {
            match output.result {
                FragmentResult::Rows(mut rows) => {
                    if let (Some(key), false) = (self.plan.order, output.ordered) {
                        rows.sort_by(|a, b| key.compare(a, b));
                    }
                    streams.push(rows);
                }
                FragmentResult::Partial(_) => {
                    return Err(TierError::InvalidQuery(format!(
                        "partition {} returned an aggregate for a row query",
                        output.partition_id
                    )))
                }
            }
        }

        let limit = self.plan.limit.unwrap_or(usize::MAX);
        match self.plan.order {
            Some(key) => Ok(merge_sorted(streams, key, limit)),
            None => Ok(streams.into_iter().flatten().take(limit).collect()),
        }
    }
}

/// Next unconsumed row of one sorted stream
struct Head {
    row: Row,
    stream: usize,
    key: SortKey,
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest: the row that sorts first, then the
        // lower stream index
        self.key
            .compare(&other.row, &self.row)
            .then_with(|| other.stream.cmp(&self.stream))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

/// k-way merge of individually sorted streams. Rows comparing equal come out
/// in stream order.
pub fn merge_sorted(streams: Vec<Vec<Row>>, key: SortKey, limit: usize) -> Vec<Row> {
    let mut iters: Vec<_> = streams.into_iter().map(Vec::into_iter).collect();
    let mut heap = BinaryHeap::with_capacity(iters.len());
    for (stream, iter) in iters.iter_mut().enumerate() {
        if let Some(row) = iter.next() {
            heap.push(Head { row, stream, key });
        }
    }

    let mut merged = Vec::new();
    while merged.len() < limit {
        let Some(head) = heap.pop() else { break };
        if let Some(row) = iters[head.stream].next() {
            heap.push(Head {
                row,
                stream: head.stream,
                key,
            });
        }
        merged.push(head.row);
    }
    merged
}

fn cell(row: &Row, index: usize) -> &Value {
    const NULL: &Value = &Value::Null;
    row.get(index).unwrap_or(NULL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tier_core::{AggregateFunction, Aggregation, DataType, Field, Schema};

    fn schema() -> Schema {
        Schema::new(
            vec![
                Field::new("day", DataType::Int64, false),
                Field::new("region", DataType::Utf8, true),
                Field::new("amount", DataType::Int64, true),
            ],
            "day",
        )
        .unwrap()
    }

    fn row(day: i64, region: &str, amount: i64) -> Row {
        vec![Value::Int64(day), Value::from(region), Value::Int64(amount)]
    }

    fn rows_output(partition: u64, ordered: bool, rows: Vec<Row>) -> FragmentOutput {
        FragmentOutput {
            partition_id: PartitionId(partition),
            ordered,
            result: FragmentResult::Rows(rows),
        }
    }

    fn by_day(direction: SortDirection) -> Option<SortKey> {
        Some(SortKey {
            column: 0,
            direction,
        })
    }

    #[test]
    fn test_concat_keeps_fragment_order() {
        let merger = ResultMerger::new(MergePlan::default());
        let merged = merger
            .merge(vec![
                rows_output(0, false, vec![row(3, "eu", 1), row(1, "eu", 2)]),
                rows_output(1, false, vec![row(7, "us", 3)]),
            ])
            .unwrap();
        assert_eq!(
            merged,
            MergedOutput::Rows(vec![row(3, "eu", 1), row(1, "eu", 2), row(7, "us", 3)])
        );
    }

    #[test]
    fn test_sorted_merge_sorts_unordered_streams_and_stops_at_limit() {
        let merger = ResultMerger::new(MergePlan {
            order: by_day(SortDirection::Ascending),
            limit: Some(4),
            ..Default::default()
        });
        let merged = merger
            .merge(vec![
                rows_output(0, true, vec![row(1, "eu", 0), row(4, "eu", 0), row(9, "eu", 0)]),
                rows_output(1, false, vec![row(8, "us", 0), row(2, "us", 0), row(3, "us", 0)]),
            ])
            .unwrap();

        let days: Vec<Value> = match merged {
            MergedOutput::Rows(rows) => rows.into_iter().map(|r| r[0].clone()).collect(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            days,
            vec![Value::Int64(1), Value::Int64(2), Value::Int64(3), Value::Int64(4)]
        );
    }

    #[test]
    fn test_descending_merge_breaks_ties_by_stream() {
        let merged = merge_sorted(
            vec![
                vec![row(5, "a", 0), row(1, "a", 0)],
                vec![row(5, "b", 0), row(3, "b", 0)],
            ],
            SortKey {
                column: 0,
                direction: SortDirection::Descending,
            },
            usize::MAX,
        );
        assert_eq!(
            merged,
            vec![row(5, "a", 0), row(5, "b", 0), row(3, "b", 0), row(1, "a", 0)]
        );
    }

    #[test]
    fn test_avg_merges_sums_not_averages() {
        let schema = schema();
        let aggregation = Aggregation::of(AggregateFunction::Avg, "amount");
        let bound = BoundAggregation::bind(&aggregation, &schema).unwrap();

        // One backend pushed the aggregate down, the other returned rows
        let pushed =
            PartialAggregate::from_rows(&bound, &[row(1, "eu", 10), row(2, "eu", 20)]).unwrap();
        let merger = ResultMerger::new(MergePlan {
            aggregation: Some(bound),
            ..Default::default()
        });
        let merged = merger
            .merge(vec![
                FragmentOutput {
                    partition_id: PartitionId(0),
                    ordered: false,
                    result: FragmentResult::Partial(pushed),
                },
                rows_output(1, false, vec![row(3, "us", 60)]),
            ])
            .unwrap();

        // avg(10, 20, 60) = 30, not avg(15, 60) = 37.5
        assert_eq!(merged, MergedOutput::Aggregate(vec![vec![Value::Float64(30.0)]]));
    }

    #[test]
    fn test_grouped_aggregate_order_and_limit() {
        let schema = schema();
        let aggregation = Aggregation::of(AggregateFunction::Sum, "amount")
            .grouped_by(vec!["region".to_string()]);
        let bound = BoundAggregation::bind(&aggregation, &schema).unwrap();
        let merger = ResultMerger::new(MergePlan {
            aggregation: Some(bound),
            order: Some(SortKey {
                column: 1,
                direction: SortDirection::Descending,
            }),
            limit: Some(2),
        });

        let merged = merger
            .merge(vec![
                rows_output(0, false, vec![row(1, "apac", 1), row(2, "eu", 2)]),
                rows_output(1, false, vec![row(3, "us", 4), row(4, "eu", 8)]),
            ])
            .unwrap();

        assert_eq!(
            merged,
            MergedOutput::Aggregate(vec![
                vec![Value::from("us"), Value::Int64(4)],
                vec![Value::from("eu"), Value::Int64(10)],
            ])
        );
    }

    #[test]
    fn test_empty_count_is_zero() {
        let bound = BoundAggregation::bind(&Aggregation::count_all(), &schema()).unwrap();
        let merger = ResultMerger::new(MergePlan {
            aggregation: Some(bound),
            ..Default::default()
        });
        assert_eq!(
            merger.merge(vec![]).unwrap(),
            MergedOutput::Aggregate(vec![vec![Value::Int64(0)]])
        );
    }
}
