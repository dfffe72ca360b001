use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tier_core::{
    BackendAdapter, BackendCapabilities, BackendRef, DataType, Field, KeyRange, Row, Schema,
    StorageKind, Value,
};
use tier_federation::{
    Catalog, CatalogSnapshot, CatalogStore, FederatedRelation, FederationConfig,
    JsonCatalogStore, PartitionDescriptor,
};
use tier_storage::MemoryBackend;

/// A relation and the tiers it spans, loaded from JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub relation: String,
    pub key_column: String,
    pub columns: Vec<ColumnConfig>,
    pub backends: Vec<BackendConfig>,
    /// Initial partitions; together they must cover the whole key domain
    pub partitions: Vec<PartitionConfig>,
    /// Rows inserted through the relation at startup, one JSON array per row
    #[serde(default)]
    pub seed: Vec<Vec<serde_json::Value>>,
    /// Persist the catalog here; an existing file takes precedence over
    /// `partitions`
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,
    #[serde(default)]
    pub federation: FederationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub kind: StorageKind,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "BackendCapabilities::full")]
    pub capabilities: BackendCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Inclusive lower bound; absent means negative infinity
    #[serde(default)]
    pub start: Option<i64>,
    /// Exclusive upper bound; absent means positive infinity
    #[serde(default)]
    pub end: Option<i64>,
    pub backend: String,
}

fn default_nullable() -> bool {
    true
}

impl TopologyConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read topology {}", path.display()))?;
        let config: TopologyConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Three tiers keyed by `yyyymmdd`: 2023 on archive-a, 2024 on
    /// archive-b, 2025 onwards on primary, with archive-c empty
    pub fn demo() -> Self {
        let backend = |id: &str, kind| BackendConfig {
            id: id.to_string(),
            kind,
            address: None,
            capabilities: BackendCapabilities::full(),
        };
        let mut seed = Vec::new();
        for year in 2023..=2025i64 {
            for month in 1..=12i64 {
                for day in [1i64, 15] {
                    let region = if month % 2 == 0 { "eu" } else { "us" };
                    seed.push(vec![
                        serde_json::json!(year * 10_000 + month * 100 + day),
                        serde_json::json!(region),
                        serde_json::json!(month * 10),
                    ]);
                }
            }
        }

        Self {
            relation: "events".to_string(),
            key_column: "day".to_string(),
            columns: vec![
                ColumnConfig {
                    name: "day".to_string(),
                    data_type: DataType::Int64,
                    nullable: false,
                },
                ColumnConfig {
                    name: "region".to_string(),
                    data_type: DataType::Utf8,
                    nullable: true,
                },
                ColumnConfig {
                    name: "amount".to_string(),
                    data_type: DataType::Int64,
                    nullable: true,
                },
            ],
            backends: vec![
                backend("archive-a", StorageKind::Remote),
                backend("archive-b", StorageKind::Remote),
                backend("archive-c", StorageKind::Remote),
                backend("primary", StorageKind::Local),
            ],
            partitions: vec![
                PartitionConfig {
                    start: None,
                    end: Some(20240101),
                    backend: "archive-a".to_string(),
                },
                PartitionConfig {
                    start: Some(20240101),
                    end: Some(20250101),
                    backend: "archive-b".to_string(),
                },
                PartitionConfig {
                    start: Some(20250101),
                    end: None,
                    backend: "primary".to_string(),
                },
            ],
            seed,
            catalog_file: None,
            federation: FederationConfig::default(),
        }
    }

    pub fn schema(&self) -> Result<Schema> {
        let fields = self
            .columns
            .iter()
            .map(|c| Field::new(c.name.clone(), c.data_type, c.nullable))
            .collect();
        Ok(Schema::new(fields, &self.key_column)?)
    }

    /// Create the in-memory tiers and the relation over them, then insert
    /// the seed rows
    pub async fn build(&self) -> Result<Topology> {
        let schema = self.schema()?;

        let mut tiers = BTreeMap::new();
        for backend in &self.backends {
            let address = backend
                .address
                .clone()
                .unwrap_or_else(|| format!("mem://{}", backend.id));
            let handle = BackendRef::new(
                backend.id.clone(),
                address,
                backend.kind,
                backend.capabilities,
            );
            tiers.insert(backend.id.clone(), MemoryBackend::new(handle, schema.clone()));
        }

        let catalog = self.catalog(&tiers)?;
        let relation = FederatedRelation::new(
            self.relation.clone(),
            schema.clone(),
            catalog,
            self.federation.clone(),
        );
        for tier in tiers.values() {
            relation.register_backend(Arc::new(tier.clone()))?;
        }

        if !self.seed.is_empty() {
            let rows = self
                .seed
                .iter()
                .map(|row| json_row(row, &schema))
                .collect::<Result<Vec<_>>>()?;
            let written = relation.insert(rows).await?;
            tracing::info!("Seeded {} rows into {}", written, self.relation);
        }

        Ok(Topology { relation, tiers })
    }

    fn catalog(&self, tiers: &BTreeMap<String, MemoryBackend>) -> Result<Catalog> {
        let store = self
            .catalog_file
            .as_ref()
            .map(|path| Arc::new(JsonCatalogStore::new(path.clone())) as Arc<dyn CatalogStore>);
        if let Some(store) = &store {
            if store.load()?.is_some() {
                return Ok(Catalog::open(Arc::clone(store))?);
            }
        }

        let mut partitions = Vec::with_capacity(self.partitions.len());
        for (id, partition) in self.partitions.iter().enumerate() {
            let tier = tiers.get(&partition.backend).with_context(|| {
                format!("Partition {} names unknown backend {}", id, partition.backend)
            })?;
            partitions.push(PartitionDescriptor::new(
                id as u64,
                KeyRange::new(partition.start, partition.end),
                tier.backend_ref(),
            ));
        }
        let backends = tiers.values().map(|t| t.backend_ref().clone()).collect();
        let snapshot = CatalogSnapshot::new(backends, partitions)?;

        Ok(match store {
            Some(store) => Catalog::create(snapshot, store)?,
            None => Catalog::new(snapshot),
        })
    }
}

/// A running relation and its in-memory tiers
pub struct Topology {
    pub relation: FederatedRelation,
    pub tiers: BTreeMap<String, MemoryBackend>,
}

/// Convert one JSON array into a row of the schema
pub fn json_row(values: &[serde_json::Value], schema: &Schema) -> Result<Row> {
    if values.len() != schema.fields().len() {
        anyhow::bail!(
            "Row has {} values, schema has {} columns",
            values.len(),
            schema.fields().len()
        );
    }
    values
        .iter()
        .zip(schema.fields())
        .map(|(value, field)| json_value(value, field.data_type()))
        .collect()
}

fn json_value(value: &serde_json::Value, data_type: DataType) -> Result<Value> {
    use serde_json::Value as Json;
    Ok(match (value, data_type) {
        (Json::Null, _) => Value::Null,
        (Json::Bool(b), DataType::Boolean) => Value::Boolean(*b),
        (Json::Number(n), DataType::Int64) => Value::Int64(
            n.as_i64()
                .with_context(|| format!("{} is not an integer", n))?,
        ),
        (Json::Number(n), DataType::Float64) => Value::Float64(
            n.as_f64()
                .with_context(|| format!("{} is not a number", n))?,
        ),
        (Json::String(s), DataType::Utf8) => Value::Utf8(s.clone()),
        (other, expected) => anyhow::bail!("Expected {} value, found {}", expected, other),
    })
}

/// Parse a literal typed in the REPL as a value of `data_type`
pub fn parse_literal(text: &str, data_type: DataType) -> Result<Value> {
    if text.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    Ok(match data_type {
        DataType::Boolean => Value::Boolean(
            text.parse()
                .with_context(|| format!("'{}' is not a boolean", text))?,
        ),
        DataType::Int64 => Value::Int64(
            text.parse()
                .with_context(|| format!("'{}' is not an integer", text))?,
        ),
        DataType::Float64 => Value::Float64(
            text.parse()
                .with_context(|| format!("'{}' is not a number", text))?,
        ),
        DataType::Utf8 => Value::Utf8(text.trim_matches(|c| c == '\'' || c == '"').to_string()),
    })
}
