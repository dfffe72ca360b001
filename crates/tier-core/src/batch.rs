//! Conversion between rows and Arrow record batches.

use crate::error::{Result, TierError};
use crate::schema::Schema;
use crate::types::{DataType, Row, Value};
use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder,
};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

/// Build a record batch from rows. Rows must already match the schema.
pub fn rows_to_record_batch(schema: &Schema, rows: &[Row]) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    for (index, field) in schema.fields().iter().enumerate() {
        let values = rows.iter().map(|row| {
            row.get(index).ok_or_else(|| {
                TierError::InvalidRow(format!("row has no column '{}'", field.name()))
            })
        });

        let array: ArrayRef = match field.data_type() {
            DataType::Boolean => {
                let mut builder = BooleanBuilder::with_capacity(rows.len());
                for value in values {
                    match value? {
                        Value::Boolean(v) => builder.append_value(*v),
                        Value::Null => builder.append_null(),
                        other => return Err(mismatch(DataType::Boolean, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::Int64 => {
                let mut builder = Int64Builder::with_capacity(rows.len());
                for value in values {
                    match value? {
                        Value::Int64(v) => builder.append_value(*v),
                        Value::Null => builder.append_null(),
                        other => return Err(mismatch(DataType::Int64, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::Float64 => {
                let mut builder = Float64Builder::with_capacity(rows.len());
                for value in values {
                    match value? {
                        Value::Null => builder.append_null(),
                        other => match other.as_f64() {
                            Some(v) => builder.append_value(v),
                            None => return Err(mismatch(DataType::Float64, other)),
                        },
                    }
                }
                Arc::new(builder.finish())
            }
            DataType::Utf8 => {
                let mut builder = StringBuilder::with_capacity(rows.len(), rows.len() * 8);
                for value in values {
                    match value? {
                        Value::Utf8(v) => builder.append_value(v),
                        Value::Null => builder.append_null(),
                        other => return Err(mismatch(DataType::Utf8, other)),
                    }
                }
                Arc::new(builder.finish())
            }
        };
        columns.push(array);
    }

    Ok(RecordBatch::try_new(Arc::new(schema.to_arrow()), columns)?)
}

/// Read every row of a record batch back into values.
pub fn record_batch_to_rows(batch: &RecordBatch) -> Result<Vec<Row>> {
    let mut rows: Vec<Row> = (0..batch.num_rows())
        .map(|_| Vec::with_capacity(batch.num_columns()))
        .collect();

    for column in batch.columns() {
        let column = column.as_ref();
        for (index, row) in rows.iter_mut().enumerate() {
            row.push(value_at(column, index)?);
        }
    }
    Ok(rows)
}

/// Extract a single cell as a [`Value`].
pub fn value_at(array: &dyn Array, index: usize) -> Result<Value> {
    if array.is_null(index) {
        return Ok(Value::Null);
    }

    if let Some(arr) = array.as_any().downcast_ref::<Int64Array>() {
        return Ok(Value::Int64(arr.value(index)));
    }
    if let Some(arr) = array.as_any().downcast_ref::<Float64Array>() {
        return Ok(Value::Float64(arr.value(index)));
    }
    if let Some(arr) = array.as_any().downcast_ref::<StringArray>() {
        return Ok(Value::Utf8(arr.value(index).to_string()));
    }
    if let Some(arr) = array.as_any().downcast_ref::<BooleanArray>() {
        return Ok(Value::Boolean(arr.value(index)));
    }

    Err(TierError::TypeMismatch {
        expected: "boolean, int64, float64 or utf8".to_string(),
        found: array.data_type().to_string(),
    })
}

fn mismatch(expected: DataType, found: &Value) -> TierError {
    TierError::TypeMismatch {
        expected: expected.to_string(),
        found: found
            .data_type()
            .map(|dt| dt.to_string())
            .unwrap_or_else(|| "null".to_string()),
    }
}
