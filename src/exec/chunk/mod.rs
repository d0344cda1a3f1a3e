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
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use arrow::array::{Array, ArrayRef, RecordBatch};
use arrow::buffer::Buffer;
use arrow::datatypes::{Schema, SchemaRef};

use crate::common::ids::{SlotId, TupleId};
use crate::common::status::{Result, Status};
use crate::runtime::mem_tracker::MemTracker;

pub mod serde;

/// A columnar batch of rows.
///
/// Wraps an Arrow `RecordBatch` and carries the planner-assigned column
/// addressing: slot ids for value columns and tuple ids for tuple-null
/// indicator columns (dedicated Boolean columns). The maps are ordered so the
/// wire codec emits them deterministically.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
    slot_id_to_index: Arc<BTreeMap<SlotId, usize>>,
    tuple_id_to_index: Arc<BTreeMap<TupleId, usize>>,
    accounting: Option<Arc<ChunkAccounting>>,
}

impl Chunk {
    pub fn try_new(
        batch: RecordBatch,
        slot_id_to_index: BTreeMap<SlotId, usize>,
        tuple_id_to_index: BTreeMap<TupleId, usize>,
    ) -> Result<Self> {
        let mapped = slot_id_to_index.len() + tuple_id_to_index.len();
        if mapped != batch.num_columns() {
            return Err(Status::internal(format!(
                "chunk column maps cover {} columns but batch has {}",
                mapped,
                batch.num_columns()
            )));
        }
        let mut seen = HashSet::new();
        for idx in slot_id_to_index
            .values()
            .chain(tuple_id_to_index.values())
        {
            if *idx >= batch.num_columns() || !seen.insert(*idx) {
                return Err(Status::internal(format!(
                    "chunk column map index {} is out of range or duplicated",
                    idx
                )));
            }
        }
        Ok(Self {
            batch,
            slot_id_to_index: Arc::new(slot_id_to_index),
            tuple_id_to_index: Arc::new(tuple_id_to_index),
            accounting: None,
        })
    }

    /// Build a chunk whose columns map to `slot_ids` in schema order.
    pub fn from_batch_with_slots(batch: RecordBatch, slot_ids: &[SlotId]) -> Result<Self> {
        if slot_ids.len() != batch.num_columns() {
            return Err(Status::internal(format!(
                "{} slot ids for a batch with {} columns",
                slot_ids.len(),
                batch.num_columns()
            )));
        }
        let mut slot_map = BTreeMap::new();
        for (idx, slot_id) in slot_ids.iter().enumerate() {
            if slot_map.insert(*slot_id, idx).is_some() {
                return Err(Status::internal(format!(
                    "duplicate slot id {} in chunk",
                    slot_id
                )));
            }
        }
        Self::try_new(batch, slot_map, BTreeMap::new())
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn slot_id_to_index(&self) -> &BTreeMap<SlotId, usize> {
        &self.slot_id_to_index
    }

    pub fn tuple_id_to_index(&self) -> &BTreeMap<TupleId, usize> {
        &self.tuple_id_to_index
    }

    pub fn column_by_slot_id(&self, slot_id: SlotId) -> Result<ArrayRef> {
        let idx = self.slot_id_to_index.get(&slot_id).copied().ok_or_else(|| {
            Status::internal(format!(
                "slot id {} not found in chunk (num_columns={}, slot_ids={:?})",
                slot_id,
                self.batch.num_columns(),
                self.slot_id_to_index.keys().collect::<Vec<_>>()
            ))
        })?;
        self.batch
            .columns()
            .get(idx)
            .cloned()
            .ok_or_else(|| {
                Status::internal(format!("slot id {} mapped to invalid index {}", slot_id, idx))
            })
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    /// Replace the record batch, keeping the column maps. Used for row
    /// projections where the column set is unchanged.
    pub fn with_batch(&self, batch: RecordBatch) -> Self {
        Self {
            batch,
            slot_id_to_index: Arc::clone(&self.slot_id_to_index),
            tuple_id_to_index: Arc::clone(&self.tuple_id_to_index),
            accounting: None,
        }
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        let mut out = self.with_batch(self.batch.slice(offset, length));
        if let Some(accounting) = self.accounting.as_ref() {
            let tracker = accounting.tracker();
            out.transfer_to(&tracker);
        }
        out
    }

    pub fn estimated_bytes(&self) -> usize {
        record_batch_bytes(&self.batch)
    }

    /// Charge this chunk's bytes to `tracker`, releasing them from the
    /// previous holder if any.
    pub fn transfer_to(&mut self, tracker: &Arc<MemTracker>) {
        if let Some(accounting) = self.accounting.as_ref() {
            accounting.transfer_to(tracker);
            return;
        }
        let bytes = chunk_bytes_i64(&self.batch);
        if bytes <= 0 {
            return;
        }
        self.accounting = Some(Arc::new(ChunkAccounting::new(bytes, tracker)));
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self {
            batch: RecordBatch::new_empty(Arc::new(Schema::empty())),
            slot_id_to_index: Arc::new(BTreeMap::new()),
            tuple_id_to_index: Arc::new(BTreeMap::new()),
            accounting: None,
        }
    }
}

#[derive(Debug)]
struct ChunkAccounting {
    bytes: i64,
    tracker: Mutex<Arc<MemTracker>>,
}

impl ChunkAccounting {
    fn new(bytes: i64, tracker: &Arc<MemTracker>) -> Self {
        tracker.consume(bytes);
        Self {
            bytes,
            tracker: Mutex::new(Arc::clone(tracker)),
        }
    }

    fn transfer_to(&self, tracker: &Arc<MemTracker>) {
        let mut guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::ptr_eq(&guard, tracker) {
            return;
        }
        guard.release(self.bytes);
        tracker.consume(self.bytes);
        *guard = Arc::clone(tracker);
    }

    fn tracker(&self) -> Arc<MemTracker> {
        let guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }
}

impl Drop for ChunkAccounting {
    fn drop(&mut self) {
        let guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        guard.release(self.bytes);
    }
}

/// Estimate RecordBatch size by summing unique buffers inside the batch.
///
/// Buffers are de-duplicated only within a single batch; buffers shared
/// across batches (slices, dictionaries) are counted once per batch.
pub fn record_batch_bytes(batch: &RecordBatch) -> usize {
    let mut seen = HashSet::new();
    let mut total = 0usize;
    for column in batch.columns() {
        total = total.saturating_add(array_data_bytes(&column.to_data(), &mut seen));
    }
    total
}

fn array_data_bytes(data: &arrow::array::ArrayData, seen: &mut HashSet<usize>) -> usize {
    let mut total = 0usize;
    for buffer in data.buffers() {
        total = total.saturating_add(buffer_bytes(buffer, seen));
    }
    if let Some(nulls) = data.nulls() {
        total = total.saturating_add(buffer_bytes(nulls.buffer(), seen));
    }
    for child in data.child_data() {
        total = total.saturating_add(array_data_bytes(child, seen));
    }
    total
}

fn buffer_bytes(buffer: &Buffer, seen: &mut HashSet<usize>) -> usize {
    let ptr = buffer.data_ptr().as_ptr() as usize;
    if !seen.insert(ptr) {
        return 0;
    }
    buffer.capacity().max(buffer.len())
}

fn chunk_bytes_i64(batch: &RecordBatch) -> i64 {
    i64::try_from(record_batch_bytes(batch)).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field};

    fn two_column_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Int32, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2])),
                Arc::new(Int32Array::from(vec![3, 4])),
            ],
        )
        .expect("record batch")
    }

    #[test]
    fn column_maps_must_cover_all_columns() {
        let mut slot_map = BTreeMap::new();
        slot_map.insert(SlotId::new(1), 0);
        let err = Chunk::try_new(two_column_batch(), slot_map, BTreeMap::new())
            .expect_err("incomplete map must fail");
        assert!(matches!(err, Status::InternalError(_)));
    }

    #[test]
    fn from_batch_with_slots_rejects_duplicates() {
        let err = Chunk::from_batch_with_slots(two_column_batch(), &[SlotId::new(1), SlotId::new(1)])
            .expect_err("duplicate slot id must fail");
        assert!(matches!(err, Status::InternalError(_)));
    }

    #[test]
    fn column_lookup_by_slot_id() {
        let chunk =
            Chunk::from_batch_with_slots(two_column_batch(), &[SlotId::new(7), SlotId::new(8)])
                .expect("chunk");
        let col = chunk.column_by_slot_id(SlotId::new(8)).expect("column");
        let arr = col.as_any().downcast_ref::<Int32Array>().expect("int32");
        assert_eq!(arr.values(), &[3, 4]);
    }

    #[test]
    fn transfer_accounting_moves_bytes_between_trackers() {
        let root = MemTracker::new_root("test");
        let a = MemTracker::new_child("a", &root);
        let b = MemTracker::new_child("b", &root);

        let mut chunk =
            Chunk::from_batch_with_slots(two_column_batch(), &[SlotId::new(1), SlotId::new(2)])
                .expect("chunk");
        chunk.transfer_to(&a);
        let bytes = a.current();
        assert!(bytes > 0);

        chunk.transfer_to(&b);
        assert_eq!(a.current(), 0);
        assert_eq!(b.current(), bytes);

        drop(chunk);
        assert_eq!(b.current(), 0);
        assert_eq!(root.current(), 0);
    }
}
