use crate::config::{parse_literal, TopologyConfig};
use anyhow::{Context, Result};
use colored::Colorize;
use comfy_table::{Cell, Color, Table as ComfyTable};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tier_core::{
    AggregateFunction, Aggregation, BackendId, CompareOp, Condition, OrderBy, PartitionId,
    QuerySpec, Schema, Value,
};
use tier_federation::{
    Catalog, CatalogSnapshot, Completeness, FailurePolicy, FederatedRelation, JsonCatalogStore,
    MigrationJob, MigrationPhase, QueryOptions, QueryResult, StatsSnapshot,
};

/// Parse the REPL query language:
///
/// ```text
/// [where COND (and COND)*] [count | sum|avg|min|max COL] [by COL(,COL)*]
/// [order COL [asc|desc]] [limit N] [best-effort] [timeout MS]
///
/// COND := COL OP VALUE | COL between VALUE and VALUE | COL in VALUE(,VALUE)*
/// OP   := = | != | < | <= | > | >=
/// ```
pub fn parse_query(words: &[&str], schema: &Schema) -> Result<(QuerySpec, QueryOptions)> {
    let mut spec = QuerySpec::scan();
    let mut options = QueryOptions::default();
    let mut aggregation: Option<Aggregation> = None;
    let mut i = 0;

    while i < words.len() {
        match words[i].to_ascii_lowercase().as_str() {
            "where" | "and" => {
                let (condition, used) = parse_condition(&words[i + 1..], schema)?;
                spec = spec.filter(condition);
                i += 1 + used;
            }
            "count" => {
                aggregation = Some(Aggregation::count_all());
                i += 1;
            }
            "sum" | "avg" | "min" | "max" => {
                let function = match words[i].to_ascii_lowercase().as_str() {
                    "sum" => AggregateFunction::Sum,
                    "avg" => AggregateFunction::Avg,
                    "min" => AggregateFunction::Min,
                    _ => AggregateFunction::Max,
                };
                let column = word(words, i + 1, "aggregate column")?;
                aggregation = Some(Aggregation::of(function, column));
                i += 2;
            }
            "by" => {
                let columns = word(words, i + 1, "group columns")?
                    .split(',')
                    .map(str::to_string)
                    .collect();
                let base = aggregation
                    .take()
                    .context("'by' needs an aggregate before it")?;
                aggregation = Some(base.grouped_by(columns));
                i += 2;
            }
            "order" => {
                let column = word(words, i + 1, "order column")?;
                i += 2;
                let descending = match words.get(i).map(|w| w.to_ascii_lowercase()) {
                    Some(w) if w == "desc" => {
                        i += 1;
                        true
                    }
                    Some(w) if w == "asc" => {
                        i += 1;
                        false
                    }
                    _ => false,
                };
                spec = spec.order_by(if descending {
                    OrderBy::desc(column)
                } else {
                    OrderBy::asc(column)
                });
            }
            "limit" => {
                let limit = word(words, i + 1, "limit")?
                    .parse()
                    .context("limit must be a number")?;
                spec = spec.limit(limit);
                i += 2;
            }
            "best-effort" => {
                options.policy = Some(FailurePolicy::BestEffort);
                i += 1;
            }
            "fail-fast" => {
                options.policy = Some(FailurePolicy::FailFast);
                i += 1;
            }
            "timeout" => {
                let millis: u64 = word(words, i + 1, "timeout")?
                    .parse()
                    .context("timeout must be milliseconds")?;
                options.timeout = Some(Duration::from_millis(millis));
                i += 2;
            }
            other => anyhow::bail!("Unexpected '{}' in query", other),
        }
    }

    if let Some(aggregation) = aggregation {
        spec = spec.aggregate(aggregation);
    }
    spec.validate(schema)?;
    Ok((spec, options))
}

/// Parse one condition; returns it and the number of words consumed
fn parse_condition(words: &[&str], schema: &Schema) -> Result<(Condition, usize)> {
    let column = word(words, 0, "condition column")?;
    let data_type = schema.field_with_name(column)?.data_type();
    let op = word(words, 1, "comparison operator")?;
    let literal = |i: usize| -> Result<Value> {
        parse_literal(word(words, i, "condition value")?, data_type)
    };

    let compare = |op| -> Result<(Condition, usize)> {
        Ok((Condition::compare(column, op, literal(2)?), 3))
    };
    match op.to_ascii_lowercase().as_str() {
        "=" | "==" => compare(CompareOp::Eq),
        "!=" | "<>" => compare(CompareOp::NotEq),
        "<" => compare(CompareOp::Lt),
        "<=" => compare(CompareOp::LtEq),
        ">" => compare(CompareOp::Gt),
        ">=" => compare(CompareOp::GtEq),
        "between" => {
            if !word(words, 3, "'and'")?.eq_ignore_ascii_case("and") {
                anyhow::bail!("Expected 'and' in between condition");
            }
            Ok((Condition::between(column, literal(2)?, literal(4)?), 5))
        }
        "in" => {
            let values = word(words, 2, "value list")?
                .split(',')
                .map(|v| parse_literal(v, data_type))
                .collect::<Result<Vec<_>>>()?;
            Ok((Condition::in_list(column, values), 3))
        }
        other => anyhow::bail!("Unknown operator '{}'", other),
    }
}

fn word<'a>(words: &[&'a str], index: usize, what: &str) -> Result<&'a str> {
    words
        .get(index)
        .copied()
        .with_context(|| format!("Missing {}", what))
}

pub fn parse_partition(text: &str) -> Result<PartitionId> {
    let digits = text.trim_start_matches('p');
    Ok(PartitionId(digits.parse().with_context(|| {
        format!("'{}' is not a partition id", text)
    })?))
}

pub fn print_catalog(snapshot: &CatalogSnapshot) {
    let mut table = ComfyTable::new();
    table.set_header(vec![
        Cell::new("Partition").fg(Color::Cyan),
        Cell::new("Range").fg(Color::Yellow),
        Cell::new("Backend").fg(Color::Green),
        Cell::new("Kind").fg(Color::Magenta),
        Cell::new("State").fg(Color::Blue),
        Cell::new("Version"),
    ]);
    for partition in snapshot.partitions() {
        let state = partition.state.to_string();
        table.add_row(vec![
            Cell::new(partition.id),
            Cell::new(partition.range),
            Cell::new(&partition.backend),
            Cell::new(partition.storage_kind),
            Cell::new(state),
            Cell::new(partition.version),
        ]);
    }
    println!(
        "{} v{} ({} partitions, {} retired)",
        "Catalog".bright_yellow().bold(),
        snapshot.version(),
        snapshot.partitions().len(),
        snapshot.retired().len()
    );
    println!("{table}");
}

pub fn print_result(result: &QueryResult, spec: &QuerySpec, schema: &Schema, max_rows: usize) {
    let header: Vec<Cell> = match spec.aggregation() {
        Some(aggregation) => aggregation
            .group_by
            .iter()
            .map(|c| Cell::new(c).fg(Color::Cyan))
            .chain(std::iter::once(
                Cell::new(format!(
                    "{}({})",
                    aggregation.function,
                    aggregation.column.as_deref().unwrap_or("*")
                ))
                .fg(Color::Green),
            ))
            .collect(),
        None => schema
            .fields()
            .iter()
            .map(|f| Cell::new(f.name()).fg(Color::Cyan))
            .collect(),
    };

    let mut table = ComfyTable::new();
    table.set_header(header);
    for row in result.rows().iter().take(max_rows) {
        table.add_row(row.iter().map(Cell::new).collect::<Vec<_>>());
    }
    println!("{table}");

    if result.row_count() > max_rows {
        println!(
            "{}",
            format!("... {} more rows", result.row_count() - max_rows).bright_black()
        );
    }
    match &result.completeness {
        Completeness::Complete => {}
        Completeness::Partial { unavailable } => {
            let ids: Vec<String> = unavailable.iter().map(|p| p.to_string()).collect();
            println!(
                "{} unavailable partitions: {}",
                "PARTIAL".bright_red().bold(),
                ids.join(", ")
            );
        }
    }
    println!(
        "{} rows, {} fragments ({} skipped), {} retries, catalog v{}, {}ms",
        result.row_count(),
        result.stats.fragments_dispatched,
        result.stats.fragments_skipped,
        result.stats.retries,
        result.stats.catalog_version,
        result.stats.elapsed_ms
    );
}

pub fn print_job(job: &MigrationJob) {
    let phase = match job.phase {
        MigrationPhase::Done => job.phase.to_string().bright_green(),
        MigrationPhase::Failed => job.phase.to_string().bright_red(),
        _ => job.phase.to_string().bright_yellow(),
    };
    println!(
        "{} {} {} {} -> {} [{}]",
        "Migration".bright_blue(),
        job.id,
        job.partition_id,
        job.range,
        job.target_backend,
        phase
    );
    println!(
        "  copied {} rows, source {}, target {}",
        job.rows_copied,
        count_or_dash(job.row_count_source),
        count_or_dash(job.row_count_target)
    );
    if let Some(failure) = &job.failure {
        println!("  {} {}", "cause:".bright_red(), failure);
    }
}

fn count_or_dash(count: Option<u64>) -> String {
    count.map_or_else(|| "-".to_string(), |c| c.to_string())
}

pub fn print_history(jobs: &[MigrationJob]) {
    if jobs.is_empty() {
        println!("{}", "No finished migrations".bright_black());
        return;
    }
    let mut table = ComfyTable::new();
    table.set_header(vec![
        Cell::new("Job").fg(Color::Cyan),
        Cell::new("Partition").fg(Color::Yellow),
        Cell::new("From").fg(Color::Green),
        Cell::new("To").fg(Color::Green),
        Cell::new("Phase").fg(Color::Magenta),
        Cell::new("Rows"),
        Cell::new("Cause"),
    ]);
    for job in jobs {
        table.add_row(vec![
            Cell::new(job.id),
            Cell::new(job.partition_id),
            Cell::new(&job.source_backend),
            Cell::new(&job.target_backend),
            Cell::new(job.phase),
            Cell::new(count_or_dash(job.row_count_target)),
            Cell::new(job.failure.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");
}

pub fn print_stats(stats: &StatsSnapshot) {
    let mut table = ComfyTable::new();
    table.set_header(vec![
        Cell::new("Metric").fg(Color::Cyan),
        Cell::new("Value").fg(Color::Green),
    ]);
    let rows: [(&str, u64); 11] = [
        ("Queries", stats.queries),
        ("Partial results", stats.partial_results),
        ("Failed queries", stats.failed_queries),
        ("Fragments dispatched", stats.fragments_dispatched),
        ("Fragments skipped", stats.fragments_skipped),
        ("Retries", stats.retries),
        ("Rows returned", stats.rows_returned),
        ("Rows written", stats.rows_written),
        ("Migrations completed", stats.migrations_completed),
        ("Migrations failed", stats.migrations_failed),
        ("Migrations aborted", stats.migrations_aborted),
    ];
    for (metric, value) in rows {
        table.add_row(vec![Cell::new(metric), Cell::new(value)]);
    }
    println!("{table}");
}

pub fn print_pools(relation: &FederatedRelation) {
    let health = relation.backend_health();
    let mut table = ComfyTable::new();
    table.set_header(vec![
        Cell::new("Backend").fg(Color::Cyan),
        Cell::new("Healthy").fg(Color::Green),
        Cell::new("Idle"),
        Cell::new("In use"),
        Cell::new("Max"),
        Cell::new("Created"),
        Cell::new("Reused"),
        Cell::new("Discarded"),
        Cell::new("Exhausted"),
        Cell::new("Last error").fg(Color::Red),
    ]);
    for (backend, pool) in relation.pool_stats() {
        let status = health.iter().find(|h| h.backend == backend);
        let healthy = status.map_or(true, |h| h.healthy);
        table.add_row(vec![
            Cell::new(&backend),
            Cell::new(if healthy { "yes" } else { "no" }).fg(if healthy {
                Color::Green
            } else {
                Color::Red
            }),
            Cell::new(pool.idle),
            Cell::new(pool.in_use),
            Cell::new(pool.max_size),
            Cell::new(pool.created),
            Cell::new(pool.reused),
            Cell::new(pool.discarded),
            Cell::new(pool.exhausted),
            Cell::new(status.and_then(|h| h.last_error.as_deref()).unwrap_or("")),
        ]);
    }
    println!("{table}");
}

/// Run the three-tier walkthrough: routing, aggregation, and a partition
/// migrated while it is being queried
pub async fn run_demo() -> Result<()> {
    let topology = TopologyConfig::demo().build().await?;
    let relation = &topology.relation;
    let schema = relation.schema().clone();

    section("Topology");
    print_catalog(&relation.catalog().snapshot());

    section("Range query across two tiers");
    let words = ["where", "day", "between", "20240601", "and", "20250601", "order", "day"];
    let (spec, options) = parse_query(&words, &schema)?;
    let result = relation.query_with(&spec, options).await?;
    print_result(&result, &spec, &schema, 8);

    section("Total per region");
    let words = ["sum", "amount", "by", "region", "order", "region"];
    let (aggregate, options) = parse_query(&words, &schema)?;
    let totals = relation.query_with(&aggregate, options).await?;
    print_result(&totals, &aggregate, &schema, 10);

    section("Migrating p1 from archive-b to archive-c");
    let partition = PartitionId(1);
    let target = BackendId::from("archive-c");
    relation.begin_migration(partition, target).await?;
    relation.step_migration(partition).await?;
    let job = relation.step_migration(partition).await?;
    print_job(&job);

    let during = relation.query(&spec).await?;
    println!(
        "Mid-copy query: {} rows (archive-c holds {} copied rows, not yet routed)",
        during.row_count(),
        topology.tiers["archive-c"].row_count()
    );

    let job = relation.migrations().run(partition).await?;
    print_job(&job);
    let after = relation.query(&spec).await?;
    println!(
        "After cutover: {} rows, identical to before: {}",
        after.row_count(),
        if after.rows() == result.rows() {
            "yes".bright_green()
        } else {
            "no".bright_red()
        }
    );
    print_catalog(&relation.catalog().snapshot());

    section("Best-effort query with archive-a offline");
    topology.tiers["archive-a"].set_available(false);
    let (count, _) = parse_query(&["count", "best-effort"], &schema)?;
    let partial = relation
        .query_with(&count, QueryOptions::best_effort())
        .await?;
    print_result(&partial, &count, &schema, 1);

    section("Statistics");
    print_stats(&relation.stats());
    print_pools(relation);
    Ok(())
}

/// Load, validate and print a persisted catalog
pub fn show_catalog_file(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("File not found: {:?}", path);
    }
    let catalog = Catalog::open(Arc::new(JsonCatalogStore::new(path)))
        .with_context(|| format!("Invalid catalog in {}", path.display()))?;
    let snapshot = catalog.snapshot();
    println!("{} coverage is valid", "✓".bright_green());
    print_catalog(&snapshot);

    if !snapshot.retired().is_empty() {
        let ids: Vec<String> = snapshot.retired().iter().map(|p| p.id.to_string()).collect();
        println!("Retired: {}", ids.join(", "));
    }
    let backends: Vec<String> = snapshot
        .backends()
        .map(|b| format!("{} ({}, {})", b.id, b.kind, b.address))
        .collect();
    println!("Backends: {}", backends.join(", "));
    Ok(())
}

fn section(title: &str) {
    println!();
    println!("{} {}", "==>".bright_blue().bold(), title.bright_yellow().bold());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        TopologyConfig::demo().schema().unwrap()
    }

    #[test]
    fn test_parse_filtered_ordered_query() {
        let words = [
            "where", "day", ">=", "20240101", "and", "region", "=", "eu", "order", "day", "desc",
            "limit", "3", "best-effort",
        ];
        let (spec, options) = parse_query(&words, &schema()).unwrap();
        assert_eq!(
            spec,
            QuerySpec::scan()
                .filter(Condition::compare("day", CompareOp::GtEq, 20240101i64))
                .filter(Condition::eq("region", "eu"))
                .order_by(OrderBy::desc("day"))
                .limit(3)
        );
        assert_eq!(options.policy, Some(FailurePolicy::BestEffort));
    }

    #[test]
    fn test_parse_grouped_aggregate() {
        let words = ["where", "day", "in", "20240101,20240115", "avg", "amount", "by", "region"];
        let (spec, _) = parse_query(&words, &schema()).unwrap();
        assert_eq!(
            spec.aggregation(),
            Some(
                &Aggregation::of(AggregateFunction::Avg, "amount")
                    .grouped_by(vec!["region".to_string()])
            )
        );
        assert_eq!(spec.predicate().conjuncts().len(), 1);
    }

    #[test]
    fn test_parse_rejects_bad_queries() {
        let schema = schema();
        assert!(parse_query(&["where", "day", "~", "1"], &schema).is_err());
        assert!(parse_query(&["where", "missing", "=", "1"], &schema).is_err());
        assert!(parse_query(&["by", "region"], &schema).is_err());
        assert!(parse_query(&["where", "day", "between", "1", "or", "2"], &schema).is_err());
        assert!(parse_query(&["limit", "many"], &schema).is_err());
    }

    #[test]
    fn test_parse_partition() {
        assert_eq!(parse_partition("p3").unwrap(), PartitionId(3));
        assert_eq!(parse_partition("7").unwrap(), PartitionId(7));
        assert!(parse_partition("x").is_err());
    }

    #[tokio::test]
    async fn test_demo_runs_end_to_end() {
        run_demo().await.unwrap();
    }
}
