use crate::commands::{
    parse_partition, parse_query, print_catalog, print_history, print_job, print_pools,
    print_result, print_stats,
};
use crate::config::{parse_literal, Topology};
use anyhow::{Context, Result};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use tier_core::{BackendId, Row};

const MAX_DISPLAY_ROWS: usize = 50;

/// What the loop should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Repl {
    editor: DefaultEditor,
    history_file: PathBuf,
    session: Session,
}

impl Repl {
    pub fn new(topology: Topology) -> Result<Self> {
        let history_file = Self::get_history_file()?;
        let mut editor = DefaultEditor::new()?;

        let _ = editor.load_history(&history_file);

        Ok(Self {
            editor,
            history_file,
            session: Session::new(topology),
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        println!(
            "{} {}",
            "Tiered relation".bright_green().bold(),
            self.session.topology.relation.name().bright_cyan()
        );
        println!("Type {} for available commands", "help".bright_cyan());
        println!();

        loop {
            let prompt = format!("{} ", "tq>".bright_green().bold());
            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    self.editor.add_history_entry(line)?;

                    match self.session.execute(line).await {
                        Ok(Flow::Exit) => break,
                        Ok(Flow::Continue) => {}
                        Err(e) => eprintln!("{} {:#}", "Error:".bright_red().bold(), e),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "exit".bright_yellow());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {:?}", "Error:".bright_red().bold(), err);
                    break;
                }
            }
        }

        self.editor.save_history(&self.history_file)?;
        println!("{}", "Goodbye!".bright_cyan());
        Ok(())
    }

    fn get_history_file() -> Result<PathBuf> {
        let home = home::home_dir().context("Could not find home directory")?;
        let history_dir = home.join(".tier_federation");
        std::fs::create_dir_all(&history_dir)?;
        Ok(history_dir.join("history.txt"))
    }
}

/// Command interpreter over a running topology
pub struct Session {
    topology: Topology,
}

impl Session {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    pub async fn execute(&mut self, line: &str) -> Result<Flow> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = parts.first() else {
            return Ok(Flow::Continue);
        };
        let args = &parts[1..];
        let relation = &self.topology.relation;

        match command.to_ascii_lowercase().as_str() {
            "help" | "h" | "?" => print_help(),
            "exit" | "quit" | "q" => return Ok(Flow::Exit),
            "catalog" => print_catalog(&relation.catalog().snapshot()),
            "pools" => print_pools(relation),
            "stats" => print_stats(&relation.stats()),
            "history" => print_history(&relation.migration_history()),
            "tiers" => {
                for (name, tier) in &self.topology.tiers {
                    println!("{} {} rows", name.bright_cyan(), tier.row_count());
                }
            }
            "query" | "select" => {
                let schema = relation.schema();
                let (spec, options) = parse_query(args, schema)?;
                let result = relation.query_with(&spec, options).await?;
                print_result(&result, &spec, schema, MAX_DISPLAY_ROWS);
            }
            "insert" => {
                let rows = parse_rows(&args.join(" "), relation.schema())?;
                let written = relation.insert(rows).await?;
                println!("{} Inserted {} rows", "✓".bright_green(), written);
            }
            "migrate" => {
                let partition = parse_partition(arg(args, 0, "migrate <partition> <backend>")?)?;
                let target = BackendId::from(arg(args, 1, "migrate <partition> <backend>")?);
                let job = match args.get(2).copied().unwrap_or("wait") {
                    "wait" => relation.migrate(partition, target).await?,
                    "manual" => relation.begin_migration(partition, target).await?,
                    "background" | "bg" => relation.start_migration(partition, target).await?,
                    other => anyhow::bail!("Unknown migration mode '{}'", other),
                };
                print_job(&job);
            }
            "step" => {
                let partition = parse_partition(arg(args, 0, "step <partition>")?)?;
                print_job(&relation.step_migration(partition).await?);
            }
            "status" => {
                let partition = parse_partition(arg(args, 0, "status <partition>")?)?;
                print_job(&relation.migration_status(partition)?);
            }
            "abort" => {
                let partition = parse_partition(arg(args, 0, "abort <partition>")?)?;
                print_job(&relation.abort_migration(partition).await?);
            }
            "split" => {
                let partition = parse_partition(arg(args, 0, "split <partition> <key>")?)?;
                let at = arg(args, 1, "split <partition> <key>")?
                    .parse()
                    .context("split key must be an integer")?;
                let created = relation.split_partition(partition, at)?;
                println!(
                    "{} Split {} at {}, new partition {}",
                    "✓".bright_green(),
                    partition,
                    at,
                    created
                );
            }
            "merge" => {
                let left = parse_partition(arg(args, 0, "merge <left> <right>")?)?;
                let right = parse_partition(arg(args, 1, "merge <left> <right>")?)?;
                relation.merge_partitions(left, right)?;
                println!("{} Merged {} into {}", "✓".bright_green(), right, left);
            }
            "offline" | "online" => {
                let name = arg(args, 0, "offline <backend>")?;
                let tier = self
                    .topology
                    .tiers
                    .get(name)
                    .with_context(|| format!("Unknown backend '{}'", name))?;
                let available = command.eq_ignore_ascii_case("online");
                tier.set_available(available);
                println!(
                    "{} {} is now {}",
                    "→".bright_blue(),
                    name,
                    if available { "online" } else { "offline" }
                );
            }
            other => anyhow::bail!("Unknown command '{}'. Type 'help' for commands", other),
        }
        Ok(Flow::Continue)
    }
}

fn arg<'a>(args: &[&'a str], index: usize, usage: &str) -> Result<&'a str> {
    args.get(index)
        .copied()
        .with_context(|| format!("Usage: {}", usage))
}

/// Rows are separated by `;`, values by `,`
fn parse_rows(text: &str, schema: &tier_core::Schema) -> Result<Vec<Row>> {
    let rows = text
        .split(';')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(|row| {
            let values: Vec<&str> = row.split(',').map(str::trim).collect();
            if values.len() != schema.fields().len() {
                anyhow::bail!(
                    "Row '{}' has {} values, expected {}",
                    row,
                    values.len(),
                    schema.fields().len()
                );
            }
            values
                .iter()
                .zip(schema.fields())
                .map(|(value, field)| parse_literal(value, field.data_type()))
                .collect()
        })
        .collect::<Result<Vec<Row>>>()?;
    if rows.is_empty() {
        anyhow::bail!("Usage: insert v1,v2,...[; v1,v2,...]");
    }
    Ok(rows)
}

fn print_help() {
    println!("{}", "Commands:".bright_yellow().bold());
    let commands = [
        ("catalog", "Show partitions, ranges and owning backends"),
        ("tiers", "Row counts per backend"),
        ("pools", "Connection pool and backend health"),
        ("query [where ...] [count|sum|avg|min|max col] [by cols]", "Run a query"),
        ("      [order col [asc|desc]] [limit n] [best-effort] [timeout ms]", ""),
        ("insert v1,v2,...; v1,v2,...", "Insert rows"),
        ("migrate <p> <backend> [wait|manual|background]", "Move a partition"),
        ("step <p>", "Advance a manual migration by one step"),
        ("status <p>", "Show a partition's migration"),
        ("abort <p>", "Abort a migration before cutover"),
        ("split <p> <key>", "Split a partition at a key"),
        ("merge <left> <right>", "Merge adjacent partitions on one backend"),
        ("offline|online <backend>", "Simulate a backend outage"),
        ("history", "Finished migrations"),
        ("stats", "Federation counters"),
        ("exit", "Leave the REPL"),
    ];
    for (usage, description) in commands {
        println!("  {:<66} {}", usage.bright_cyan(), description);
    }
    println!();
    println!("{}", "Example:".bright_yellow());
    println!("  query where day between 20240601 and 20250601 sum amount by region");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use tier_core::{PartitionId, Value};
    use tier_federation::MigrationPhase;

    async fn session() -> Session {
        Session::new(TopologyConfig::demo().build().await.unwrap())
    }

    #[test]
    fn test_parse_rows() {
        let schema = TopologyConfig::demo().schema().unwrap();
        let rows = parse_rows("20240105, eu, 30; 20240106,us,null", &schema).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::Int64(20240105), Value::from("eu"), Value::Int64(30)],
                vec![Value::Int64(20240106), Value::from("us"), Value::Null],
            ]
        );
        assert!(parse_rows("1,eu", &schema).is_err());
        assert!(parse_rows(" ; ", &schema).is_err());
    }

    #[tokio::test]
    async fn test_insert_and_query_commands() {
        let mut session = session().await;
        let flow = session.execute("insert 20240105,eu,30").await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(session.topology.tiers["archive-b"].row_count(), 25);

        session
            .execute("query where day >= 20250101 count")
            .await
            .unwrap();
        assert_eq!(session.topology.relation.stats().queries, 1);
    }

    #[tokio::test]
    async fn test_manual_migration_commands() {
        let mut session = session().await;
        session.execute("migrate p0 archive-c manual").await.unwrap();
        session.execute("step p0").await.unwrap();
        session.execute("abort p0").await.unwrap();

        let history = session.topology.relation.migration_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].phase, MigrationPhase::Failed);

        session.execute("migrate p0 archive-c").await.unwrap();
        let snapshot = session.topology.relation.catalog().snapshot();
        let partition = snapshot.partition(PartitionId(0)).unwrap();
        assert_eq!(partition.backend, BackendId::from("archive-c"));
    }

    #[tokio::test]
    async fn test_split_and_exit_commands() {
        let mut session = session().await;
        session.execute("split p1 20240701").await.unwrap();
        assert_eq!(
            session.topology.relation.catalog().snapshot().partitions().len(),
            4
        );
        assert!(session.execute("split p1").await.is_err());
        assert!(session.execute("frobnicate").await.is_err());
        assert_eq!(session.execute("exit").await.unwrap(), Flow::Exit);
    }
}
