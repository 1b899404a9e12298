// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Table - the partition type moved by shuffles

use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::ctx::CylonContext;
use crate::error::{CylonError, CylonResult};

/// A table partition: a schema and zero or more record batches sharing it
#[derive(Clone)]
pub struct Table {
    ctx: Arc<CylonContext>,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl Table {
    /// Create a table from Arrow RecordBatch
    pub fn from_record_batch(ctx: Arc<CylonContext>, batch: RecordBatch) -> CylonResult<Self> {
        Ok(Self {
            ctx,
            schema: batch.schema(),
            batches: vec![batch],
        })
    }

    /// Create a table from multiple Arrow RecordBatches. The schema is taken
    /// from the first batch, so at least one is required.
    pub fn from_record_batches(ctx: Arc<CylonContext>, batches: Vec<RecordBatch>) -> CylonResult<Self> {
        let schema = batches
            .first()
            .map(|b| b.schema())
            .ok_or_else(|| CylonError::Invalid("cannot infer schema from zero batches".into()))?;
        Self::with_schema(ctx, schema, batches)
    }

    /// Create a table with an explicit schema. Every batch must carry the
    /// same fields.
    pub fn with_schema(
        ctx: Arc<CylonContext>,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> CylonResult<Self> {
        for (i, batch) in batches.iter().enumerate() {
            if batch.schema().fields() != schema.fields() {
                return Err(CylonError::SchemaMismatch {
                    expected: schema.to_string(),
                    actual: format!("batch {}: {}", i, batch.schema()),
                });
            }
        }
        Ok(Self { ctx, schema, batches })
    }

    /// A table with no rows
    pub fn empty(ctx: Arc<CylonContext>, schema: SchemaRef) -> Self {
        Self {
            ctx,
            schema,
            batches: Vec::new(),
        }
    }

    /// Get the number of columns
    pub fn columns(&self) -> usize {
        self.schema.fields().len()
    }

    /// Get the number of rows
    pub fn rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn get_context(&self) -> Arc<CylonContext> {
        self.ctx.clone()
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema.fields().iter().map(|f| f.name().clone()).collect()
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn batch(&self, index: usize) -> Option<&RecordBatch> {
        self.batches.get(index)
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        self.batches
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("schema", &self.schema)
            .field("batches", &self.batches.len())
            .field("rows", &self.rows())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn schema(name: &str) -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new(name, DataType::Int32, false)]))
    }

    #[test]
    fn test_table_rows_and_schema() {
        let ctx = CylonContext::init().unwrap();
        let s = schema("id");
        let b1 = RecordBatch::try_new(s.clone(), vec![Arc::new(Int32Array::from(vec![1, 2]))]).unwrap();
        let b2 = RecordBatch::try_new(s.clone(), vec![Arc::new(Int32Array::from(vec![3]))]).unwrap();

        let table = Table::from_record_batches(ctx.clone(), vec![b1, b2]).unwrap();
        assert_eq!(table.rows(), 3);
        assert_eq!(table.columns(), 1);
        assert_eq!(table.num_batches(), 2);
        assert_eq!(table.column_names(), vec!["id".to_string()]);

        let empty = Table::empty(ctx.clone(), s);
        assert!(empty.is_empty());
        assert_eq!(empty.columns(), 1);

        assert!(Table::from_record_batches(ctx, Vec::new()).is_err());
    }

    #[test]
    fn test_with_schema_rejects_foreign_batch() {
        let ctx = CylonContext::init().unwrap();
        let other = RecordBatch::try_new(schema("other"), vec![Arc::new(Int32Array::from(vec![1]))]).unwrap();
        let err = Table::with_schema(ctx, schema("id"), vec![other]).unwrap_err();
        assert!(matches!(err, CylonError::SchemaMismatch { .. }));
    }
}
