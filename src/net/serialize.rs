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

//! Arrow table serialization for network transmission
//!
//! Tables travel as Arrow IPC streams. The stream always carries the schema,
//! so a table without batches survives the trip with its schema intact.

use std::str::FromStr;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::ipc::CompressionType;
use serde::{Deserialize, Serialize};

use crate::ctx::CylonContext;
use crate::error::{Code, CylonError, CylonResult};
use crate::table::Table;

/// Compression algorithm for Arrow IPC serialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcCompression {
    /// No compression
    #[default]
    None,
    /// LZ4 frame compression (fast)
    Lz4,
    /// Zstandard compression (better ratio)
    Zstd,
}

impl IpcCompression {
    fn to_arrow_compression(self) -> Option<CompressionType> {
        match self {
            IpcCompression::None => None,
            IpcCompression::Lz4 => Some(CompressionType::LZ4_FRAME),
            IpcCompression::Zstd => Some(CompressionType::ZSTD),
        }
    }
}

impl FromStr for IpcCompression {
    type Err = CylonError;

    fn from_str(s: &str) -> CylonResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(IpcCompression::None),
            "lz4" => Ok(IpcCompression::Lz4),
            "zstd" => Ok(IpcCompression::Zstd),
            other => Err(CylonError::Invalid(format!("unknown compression '{}'", other))),
        }
    }
}

/// Serialize a Table to bytes using Arrow IPC format
pub fn serialize_table(table: &Table) -> CylonResult<Vec<u8>> {
    serialize_table_with_compression(table, IpcCompression::None)
}

/// Serialize a Table to bytes using Arrow IPC format with compression.
///
/// Compression is applied at the Arrow buffer level.
pub fn serialize_table_with_compression(
    table: &Table,
    compression: IpcCompression,
) -> CylonResult<Vec<u8>> {
    let mut buffer = Vec::new();
    let schema = table.schema();

    {
        let write_options = IpcWriteOptions::default()
            .try_with_compression(compression.to_arrow_compression())
            .map_err(|e| CylonError::new(
                Code::Invalid,
                format!("Failed to set compression options: {}", e)
            ))?;

        let mut writer = StreamWriter::try_new_with_options(&mut buffer, &schema, write_options)
            .map_err(|e| CylonError::new(
                Code::Invalid,
                format!("Failed to create IPC writer: {}", e)
            ))?;

        for (i, batch) in table.batches().iter().enumerate() {
            writer.write(batch)
                .map_err(|e| CylonError::new(
                    Code::IoError,
                    format!("Failed to write batch {}: {}", i, e)
                ))?;
        }

        writer.finish()
            .map_err(|e| CylonError::new(
                Code::IoError,
                format!("Failed to finish writing: {}", e)
            ))?;
    }

    Ok(buffer)
}

/// Deserialize bytes produced by [`serialize_table`] back into a Table
pub fn deserialize_table(ctx: Arc<CylonContext>, data: &[u8]) -> CylonResult<Table> {
    let cursor = std::io::Cursor::new(data);
    let reader = StreamReader::try_new(cursor, None)
        .map_err(|e| CylonError::Serialization(format!("Failed to create IPC reader: {}", e)))?;

    let schema: SchemaRef = reader.schema();
    let mut batches = Vec::new();
    for result in reader {
        let batch = result
            .map_err(|e| CylonError::Serialization(format!("Failed to read batch: {}", e)))?;
        batches.push(batch);
    }

    Table::with_schema(ctx, schema, batches)
}
