// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Chunk wire codec.
//!
//! A serialized chunk is the Arrow IPC stream encoding of its record batch,
//! optionally block-compressed. Column addressing metadata (slot/tuple maps,
//! nullability and constness flags) rides along only on the first chunk of a
//! stream; the receiver caches it as [`ChunkMeta`] and applies it to every
//! subsequent chunk. `ChunkMeta` is shared (`Arc`) so deserialization can run
//! outside the receiver queue lock.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use arrow::datatypes::{DataType, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;

use crate::common::compression::get_block_compression_codec;
use crate::common::ids::{SlotId, TupleId};
use crate::common::status::{Result, Status};
use crate::exec::chunk::Chunk;
use crate::service::proto::{ChunkPb, CompressionTypePb};

/// Column addressing metadata, immutable per stream after the first packet.
#[derive(Debug, Clone, Default)]
pub struct ChunkMeta {
    pub slot_id_to_index: BTreeMap<SlotId, usize>,
    pub tuple_id_to_index: BTreeMap<TupleId, usize>,
    pub is_nulls: Vec<bool>,
    pub is_consts: Vec<bool>,
    pub types: Vec<DataType>,
}

impl ChunkMeta {
    pub fn column_count(&self) -> usize {
        self.slot_id_to_index.len() + self.tuple_id_to_index.len()
    }
}

/// Serialize one chunk. Metadata fields are filled only when `is_first`.
///
/// Compression goes through `scratch`; when the codec's output is not
/// strictly smaller than the input the chunk ships uncompressed with
/// `compress_type = NONE`, and `scratch` keeps its allocation for the next
/// call instead of being moved into the message.
pub fn serialize_chunk(
    chunk: &Chunk,
    compress_type: CompressionTypePb,
    scratch: &mut Vec<u8>,
    is_first: bool,
) -> Result<ChunkPb> {
    let serialized = encode_batch(&chunk.batch)?;
    let uncompressed_size = serialized.len() as i64;

    let mut pb = ChunkPb {
        data: Bytes::new(),
        compress_type: CompressionTypePb::NoCompression as i32,
        uncompressed_size,
        serialized_size: uncompressed_size,
        slot_id_map: Vec::new(),
        tuple_id_map: Vec::new(),
        is_nulls: Vec::new(),
        is_consts: Vec::new(),
    };

    if is_first {
        for (slot_id, idx) in chunk.slot_id_to_index() {
            pb.slot_id_map.push(slot_id.as_u32() as i32);
            pb.slot_id_map.push(*idx as i32);
        }
        for (tuple_id, idx) in chunk.tuple_id_to_index() {
            pb.tuple_id_map.push(tuple_id.as_u32() as i32);
            pb.tuple_id_map.push(*idx as i32);
        }
        for field in chunk.schema().fields() {
            pb.is_nulls.push(field.is_nullable());
            // Const columns are materialized before they reach the exchange.
            pb.is_consts.push(false);
        }
    }

    if compress_type != CompressionTypePb::NoCompression && !serialized.is_empty() {
        let codec = get_block_compression_codec(compress_type)?;
        codec.compress(&serialized, scratch)?;
        if scratch.len() < serialized.len() {
            pb.compress_type = compress_type as i32;
            pb.data = Bytes::from(std::mem::take(scratch));
            return Ok(pb);
        }
    }

    pb.data = Bytes::from(serialized);
    Ok(pb)
}

/// Build the stream metadata from the first metadata-bearing packet.
///
/// When `row_schema` is provided the per-column types are cross-checked
/// against it; streams decoded without a schema take their types from the
/// payload itself.
pub fn build_chunk_meta(pb: &ChunkPb, row_schema: Option<&SchemaRef>) -> Result<Arc<ChunkMeta>> {
    if pb.is_nulls.is_empty() || (pb.slot_id_map.is_empty() && pb.tuple_id_map.is_empty()) {
        return Err(Status::Corruption(
            "chunk meta could not be empty".to_string(),
        ));
    }
    if pb.slot_id_map.len() % 2 != 0 || pb.tuple_id_map.len() % 2 != 0 {
        return Err(Status::Corruption(
            "chunk meta id maps must have even length".to_string(),
        ));
    }

    let mut meta = ChunkMeta::default();
    for pair in pb.slot_id_map.chunks_exact(2) {
        let slot_id = SlotId::try_from(pair[0]).map_err(Status::Corruption)?;
        let idx = usize::try_from(pair[1])
            .map_err(|_| Status::Corruption(format!("invalid column index {}", pair[1])))?;
        meta.slot_id_to_index.insert(slot_id, idx);
    }
    for pair in pb.tuple_id_map.chunks_exact(2) {
        let tuple_id = TupleId::try_from(pair[0]).map_err(Status::Corruption)?;
        let idx = usize::try_from(pair[1])
            .map_err(|_| Status::Corruption(format!("invalid column index {}", pair[1])))?;
        meta.tuple_id_to_index.insert(tuple_id, idx);
    }
    meta.is_nulls = pb.is_nulls.clone();
    meta.is_consts = pb.is_consts.clone();

    if meta.column_count() != meta.is_nulls.len() {
        return Err(Status::Corruption(format!(
            "chunk meta covers {} columns but carries {} null flags",
            meta.column_count(),
            meta.is_nulls.len()
        )));
    }

    if let Some(schema) = row_schema {
        if schema.fields().len() != meta.column_count() {
            return Err(Status::Corruption(format!(
                "chunk meta has {} columns but row schema has {}",
                meta.column_count(),
                schema.fields().len()
            )));
        }
        meta.types = schema
            .fields()
            .iter()
            .map(|f| f.data_type().clone())
            .collect();
    }

    Ok(Arc::new(meta))
}

/// Decode one chunk, decompressing through `scratch` when needed.
pub fn deserialize_chunk(pb: &ChunkPb, meta: &ChunkMeta, scratch: &mut Vec<u8>) -> Result<Chunk> {
    let uncompressed_size = usize::try_from(pb.uncompressed_size).map_err(|_| {
        Status::Corruption(format!(
            "invalid uncompressed size {}",
            pb.uncompressed_size
        ))
    })?;

    let batch = if pb.compress_type_pb() == CompressionTypePb::NoCompression {
        if pb.data.len() != uncompressed_size {
            return Err(Status::Corruption(format!(
                "uncompressed payload size mismatch: expected={} actual={}",
                uncompressed_size,
                pb.data.len()
            )));
        }
        decode_batch(&pb.data)?
    } else {
        let codec = get_block_compression_codec(pb.compress_type_pb())?;
        scratch.clear();
        scratch
            .try_reserve_exact(uncompressed_size)
            .map_err(|e| Status::MemoryAllocFailed(format!("decompress buffer: {e}")))?;
        scratch.resize(uncompressed_size, 0);
        codec.decompress(&pb.data, &mut scratch[..])?;
        decode_batch(scratch)?
    };

    if batch.num_columns() != meta.column_count() {
        return Err(Status::Corruption(format!(
            "decoded batch has {} columns but chunk meta expects {}",
            batch.num_columns(),
            meta.column_count()
        )));
    }

    Chunk::try_new(
        batch,
        meta.slot_id_to_index.clone(),
        meta.tuple_id_to_index.clone(),
    )
}

/// Encode a record batch to the Arrow IPC stream format.
pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let schema = batch.schema();
    let mut writer = StreamWriter::try_new(&mut buffer, schema.as_ref())
        .map_err(|e| Status::internal(format!("failed to create Arrow IPC writer: {e}")))?;
    writer
        .write(batch)
        .map_err(|e| Status::internal(format!("failed to write batch: {e}")))?;
    writer
        .finish()
        .map_err(|e| Status::internal(format!("failed to finish Arrow IPC writer: {e}")))?;
    Ok(buffer)
}

/// Decode a record batch from the Arrow IPC stream format.
pub fn decode_batch(bytes: &[u8]) -> Result<RecordBatch> {
    let mut cursor = Cursor::new(bytes);
    let reader = StreamReader::try_new(&mut cursor, None)
        .map_err(|e| Status::Corruption(format!("failed to create Arrow IPC reader: {e}")))?;

    let mut decoded: Option<RecordBatch> = None;
    for batch_result in reader {
        let batch =
            batch_result.map_err(|e| Status::Corruption(format!("failed to read batch: {e}")))?;
        if decoded.is_some() {
            return Err(Status::Corruption(
                "chunk payload holds more than one batch".to_string(),
            ));
        }
        decoded = Some(batch);
    }
    decoded.ok_or_else(|| Status::Corruption("chunk payload holds no batch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{Field, Schema};

    fn make_chunk(start: i32, rows: usize) -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int32, false),
            Field::new("v", DataType::Utf8, false),
        ]));
        let mut keys = Vec::with_capacity(rows);
        let mut vals = Vec::with_capacity(rows);
        for i in 0..rows {
            keys.push(start + i as i32);
            vals.push(format!("v{}", start + i as i32));
        }
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(keys)),
                Arc::new(StringArray::from(vals)),
            ],
        )
        .expect("build record batch");
        Chunk::from_batch_with_slots(batch, &[SlotId::new(1), SlotId::new(2)]).expect("build chunk")
    }

    fn roundtrip_with(compress_type: CompressionTypePb) {
        let chunk = make_chunk(0, 512);
        let mut scratch = Vec::new();
        let first = serialize_chunk(&chunk, compress_type, &mut scratch, true).expect("serialize");
        assert!(first.has_meta());
        assert_eq!(first.slot_id_map, vec![1, 0, 2, 1]);

        let meta = build_chunk_meta(&first, Some(&chunk.schema())).expect("meta");

        let mut decompress_scratch = Vec::new();
        let decoded =
            deserialize_chunk(&first, &meta, &mut decompress_scratch).expect("deserialize");
        assert_eq!(decoded.num_rows(), chunk.num_rows());
        assert_eq!(decoded.batch, chunk.batch);
        assert_eq!(decoded.slot_id_to_index(), chunk.slot_id_to_index());

        // Subsequent chunks carry data only.
        let second =
            serialize_chunk(&chunk, compress_type, &mut scratch, false).expect("serialize");
        assert!(!second.has_meta());
        let decoded =
            deserialize_chunk(&second, &meta, &mut decompress_scratch).expect("deserialize");
        assert_eq!(decoded.batch, chunk.batch);
    }

    #[test]
    fn roundtrip_uncompressed() {
        roundtrip_with(CompressionTypePb::NoCompression);
    }

    #[test]
    fn roundtrip_lz4() {
        roundtrip_with(CompressionTypePb::Lz4);
    }

    #[test]
    fn roundtrip_snappy() {
        roundtrip_with(CompressionTypePb::Snappy);
    }

    #[test]
    fn roundtrip_zstd() {
        roundtrip_with(CompressionTypePb::Zstd);
    }

    #[test]
    fn incompressible_payload_falls_back_to_none() {
        // A tiny chunk: codec framing overhead can make compression regress;
        // the fallback must still produce a decodable payload either way.
        let chunk = make_chunk(0, 1);
        let mut scratch = Vec::new();
        let pb = serialize_chunk(&chunk, CompressionTypePb::Lz4, &mut scratch, true)
            .expect("serialize");
        if pb.compress_type_pb() == CompressionTypePb::NoCompression {
            assert_eq!(pb.data.len() as i64, pb.uncompressed_size);
        }
        let meta = build_chunk_meta(&pb, Some(&chunk.schema())).expect("meta");
        let decoded = deserialize_chunk(&pb, &meta, &mut Vec::new()).expect("deserialize");
        assert_eq!(decoded.batch, chunk.batch);
    }

    #[test]
    fn corrupt_payload_is_corruption() {
        let chunk = make_chunk(0, 16);
        let mut scratch = Vec::new();
        let mut pb = serialize_chunk(&chunk, CompressionTypePb::NoCompression, &mut scratch, true)
            .expect("serialize");

        let meta = build_chunk_meta(&pb, Some(&chunk.schema())).expect("meta");

        let mut mangled = pb.data.to_vec();
        mangled.truncate(mangled.len() / 2);
        pb.uncompressed_size = mangled.len() as i64;
        pb.data = Bytes::from(mangled);
        let err = deserialize_chunk(&pb, &meta, &mut Vec::new())
            .expect_err("mangled payload must fail");
        assert!(matches!(err, Status::Corruption(_)), "err={err:?}");
    }

    #[test]
    fn meta_must_not_be_empty() {
        let err = build_chunk_meta(&ChunkPb::default(), None).expect_err("empty meta must fail");
        assert!(matches!(err, Status::Corruption(_)));
    }
}
