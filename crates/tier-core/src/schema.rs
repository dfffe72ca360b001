use crate::error::{Result, TierError};
use crate::types::{DataType, Key, Row, Value};
use arrow::datatypes::{Field as ArrowField, Schema as ArrowSchema};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    name: String,
    data_type: DataType,
    nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn to_arrow(&self) -> ArrowField {
        ArrowField::new(self.name.clone(), self.data_type.to_arrow(), self.nullable)
    }
}

/// Schema of the single partitioned relation.
///
/// One column is the partitioning key; it must be a non-nullable `Int64`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
    key_index: usize,
}

impl Schema {
    pub fn new(fields: Vec<Field>, key_column: &str) -> Result<Self> {
        let key_index = fields
            .iter()
            .position(|f| f.name() == key_column)
            .ok_or_else(|| TierError::ColumnNotFound(key_column.to_string()))?;

        let key_field = &fields[key_index];
        if key_field.data_type() != DataType::Int64 {
            return Err(TierError::TypeMismatch {
                expected: DataType::Int64.to_string(),
                found: key_field.data_type().to_string(),
            });
        }
        if key_field.nullable() {
            return Err(TierError::InvalidQuery(format!(
                "key column '{}' must not be nullable",
                key_column
            )));
        }

        Ok(Self { fields, key_index })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn key_index(&self) -> usize {
        self.key_index
    }

    pub fn key_column(&self) -> &str {
        self.fields[self.key_index].name()
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name() == name)
            .ok_or_else(|| TierError::ColumnNotFound(name.to_string()))
    }

    pub fn field_with_name(&self, name: &str) -> Result<&Field> {
        self.fields
            .iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| TierError::ColumnNotFound(name.to_string()))
    }

    /// Extract the partitioning key of a row.
    pub fn key_of(&self, row: &Row) -> Result<Key> {
        match row.get(self.key_index) {
            Some(Value::Int64(k)) => Ok(*k),
            Some(other) => Err(TierError::InvalidRow(format!(
                "key column '{}' holds non-integer value {}",
                self.key_column(),
                other
            ))),
            None => Err(TierError::InvalidRow(format!(
                "row has {} columns, key column '{}' missing",
                row.len(),
                self.key_column()
            ))),
        }
    }

    /// Check arity, nullability and types of a row against the schema.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if row.len() != self.fields.len() {
            return Err(TierError::InvalidRow(format!(
                "expected {} columns, found {}",
                self.fields.len(),
                row.len()
            )));
        }
        for (field, value) in self.fields.iter().zip(row) {
            if value.is_null() && !field.nullable() {
                return Err(TierError::InvalidRow(format!(
                    "column '{}' is not nullable",
                    field.name()
                )));
            }
            if !value.fits(field.data_type()) {
                return Err(TierError::TypeMismatch {
                    expected: field.data_type().to_string(),
                    found: value
                        .data_type()
                        .map(|dt| dt.to_string())
                        .unwrap_or_else(|| "null".to_string()),
                });
            }
        }
        Ok(())
    }

    pub fn to_arrow(&self) -> ArrowSchema {
        let fields: Vec<ArrowField> = self.fields.iter().map(|f| f.to_arrow()).collect();
        ArrowSchema::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events_schema() -> Schema {
        Schema::new(
            vec![
                Field::new("day", DataType::Int64, false),
                Field::new("region", DataType::Utf8, true),
                Field::new("amount", DataType::Float64, true),
            ],
            "day",
        )
        .unwrap()
    }

    #[test]
    fn test_key_column_resolution() {
        let schema = events_schema();
        assert_eq!(schema.key_index(), 0);
        assert_eq!(schema.key_column(), "day");
        assert_eq!(schema.index_of("amount").unwrap(), 2);
        assert!(schema.index_of("missing").is_err());
    }

    #[test]
    fn test_key_column_must_be_int64() {
        let result = Schema::new(vec![Field::new("region", DataType::Utf8, false)], "region");
        assert!(matches!(result, Err(TierError::TypeMismatch { .. })));
    }

    #[test]
    fn test_validate_row() {
        let schema = events_schema();
        let ok = vec![Value::Int64(20240101), Value::Utf8("eu".into()), Value::Null];
        assert!(schema.validate_row(&ok).is_ok());
        assert_eq!(schema.key_of(&ok).unwrap(), 20240101);

        let null_key = vec![Value::Null, Value::Null, Value::Null];
        assert!(schema.validate_row(&null_key).is_err());

        let short = vec![Value::Int64(1)];
        assert!(schema.validate_row(&short).is_err());
    }
}
