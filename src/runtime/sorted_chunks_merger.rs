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
//! K-way merge of individually sorted chunk streams.
//!
//! Sort keys are encoded with the Arrow row format (one converter shared by
//! all inputs), so multi-key comparison with per-key direction and null
//! ordering is a plain byte compare. Ties between inputs break by input
//! index, then by arrival order within an input.
//!
//! The cooperative mode never suspends: when any non-exhausted input has no
//! chunk buffered yet, it returns [`CooperativePull::NotReady`] and the
//! scheduler re-dispatches the driver later. Partially assembled output is
//! kept across calls.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use arrow::array::{Array, ArrayRef};
use arrow::compute::{SortOptions, interleave};
use arrow::record_batch::RecordBatch;
use arrow::row::{OwnedRow, RowConverter, Rows, SortField};

use crate::common::status::{Result, Status};
use crate::exec::chunk::Chunk;
use crate::exec::expr::SortKey;

/// Input handle the merger pulls from. Blocking mode uses `get_chunk`;
/// cooperative mode probes with `has_chunk` before `try_get_chunk`.
pub trait ChunkSupplier: Send {
    /// Blocking read; `Ok(None)` is end of stream.
    fn get_chunk(&self) -> Result<Option<Chunk>>;

    /// Non-blocking read; `Ok(None)` is end of stream. Only meaningful when
    /// `has_chunk` returned true.
    fn try_get_chunk(&self) -> Result<Option<Chunk>>;

    /// True when a chunk is buffered, the stream is exhausted, or it was
    /// cancelled.
    fn has_chunk(&self) -> bool;
}

/// Result of a cooperative pull.
pub enum CooperativePull {
    Chunk(Chunk),
    /// No data ready now; reschedule the driver.
    NotReady,
    Finished,
}

struct InputCursor {
    rows: Option<Rows>,
    batch_slot: usize,
    num_rows: usize,
    pos: usize,
    eos: bool,
}

struct HeapEntry {
    key: OwnedRow,
    input: usize,
    // Stable tie-break (keep_order): equal keys resolve by input index, and
    // arrival order within an input follows from the cursor advancing one
    // row at a time. Without it ties are left equal and the heap order is
    // arbitrary.
    stable: bool,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let by_key = self.key.row().cmp(&other.key.row());
        if self.stable {
            by_key.then_with(|| self.input.cmp(&other.input))
        } else {
            by_key
        }
    }
}

enum FillStatus {
    Full,
    Drained,
    NeedRefill,
}

pub struct SortedChunksMerger {
    suppliers: Vec<Box<dyn ChunkSupplier>>,
    sort_keys: Vec<SortKey>,
    keep_order: bool,
    chunk_size: usize,
    converter: Option<RowConverter>,
    cursors: Vec<InputCursor>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    // Assembly state, carried across cooperative calls.
    pending_batches: Vec<RecordBatch>,
    picks: Vec<(usize, usize)>,
    template: Option<Chunk>,
}

impl SortedChunksMerger {
    pub fn new(
        suppliers: Vec<Box<dyn ChunkSupplier>>,
        sort_keys: Vec<SortKey>,
        keep_order: bool,
        chunk_size: usize,
    ) -> Result<Self> {
        if suppliers.is_empty() {
            return Err(Status::internal("merger needs at least one input"));
        }
        if sort_keys.is_empty() {
            return Err(Status::internal("merger needs at least one sort key"));
        }
        let cursors = suppliers
            .iter()
            .map(|_| InputCursor {
                rows: None,
                batch_slot: 0,
                num_rows: 0,
                pos: 0,
                eos: false,
            })
            .collect();
        Ok(Self {
            suppliers,
            sort_keys,
            keep_order,
            chunk_size: chunk_size.max(1),
            converter: None,
            cursors,
            heap: BinaryHeap::new(),
            pending_batches: Vec::new(),
            picks: Vec::new(),
            template: None,
        })
    }

    /// Blocking merged read; `Ok(None)` is end of stream.
    pub fn get_next(&mut self) -> Result<Option<Chunk>> {
        loop {
            self.ensure_ready_blocking()?;
            match self.fill_picks() {
                FillStatus::Full => return self.emit().map(Some),
                FillStatus::Drained => {
                    if self.picks.is_empty() {
                        return Ok(None);
                    }
                    return self.emit().map(Some);
                }
                FillStatus::NeedRefill => continue,
            }
        }
    }

    /// Cooperative merged read; never waits on an input.
    pub fn get_next_for_pipeline(&mut self) -> Result<CooperativePull> {
        loop {
            if !self.ensure_ready_cooperative()? {
                return Ok(CooperativePull::NotReady);
            }
            match self.fill_picks() {
                FillStatus::Full => return self.emit().map(CooperativePull::Chunk),
                FillStatus::Drained => {
                    if self.picks.is_empty() {
                        return Ok(CooperativePull::Finished);
                    }
                    return self.emit().map(CooperativePull::Chunk);
                }
                FillStatus::NeedRefill => continue,
            }
        }
    }

    /// True when every input the merge is waiting on has data (or is done):
    /// the next `get_next_for_pipeline` call can make progress.
    pub fn is_data_ready(&mut self) -> bool {
        for (idx, cursor) in self.cursors.iter().enumerate() {
            if cursor.rows.is_none() && !cursor.eos && !self.suppliers[idx].has_chunk() {
                return false;
            }
        }
        true
    }

    fn ensure_ready_blocking(&mut self) -> Result<()> {
        for input in 0..self.suppliers.len() {
            if self.cursors[input].rows.is_some() || self.cursors[input].eos {
                continue;
            }
            loop {
                match self.suppliers[input].get_chunk()? {
                    Some(chunk) if chunk.is_empty() => continue,
                    Some(chunk) => {
                        self.install_chunk(input, chunk)?;
                        break;
                    }
                    None => {
                        self.cursors[input].eos = true;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn ensure_ready_cooperative(&mut self) -> Result<bool> {
        for input in 0..self.suppliers.len() {
            if self.cursors[input].rows.is_some() || self.cursors[input].eos {
                continue;
            }
            loop {
                if !self.suppliers[input].has_chunk() {
                    return Ok(false);
                }
                match self.suppliers[input].try_get_chunk()? {
                    Some(chunk) if chunk.is_empty() => continue,
                    Some(chunk) => {
                        self.install_chunk(input, chunk)?;
                        break;
                    }
                    None => {
                        self.cursors[input].eos = true;
                        break;
                    }
                }
            }
        }
        Ok(true)
    }

    fn install_chunk(&mut self, input: usize, chunk: Chunk) -> Result<()> {
        let mut key_arrays = Vec::with_capacity(self.sort_keys.len());
        for key in &self.sort_keys {
            key_arrays.push(key.expr.evaluate(&chunk)?);
        }
        let converter = self.converter_for(&key_arrays)?;
        let rows = converter
            .convert_columns(&key_arrays)
            .map_err(|e| Status::internal(format!("convert sort keys failed: {e}")))?;

        if self.template.is_none() {
            self.template = Some(chunk.clone());
        }
        let batch_slot = self.pending_batches.len();
        self.pending_batches.push(chunk.batch.clone());

        let num_rows = chunk.num_rows();
        let head_key = rows.row(0).owned();
        self.cursors[input] = InputCursor {
            rows: Some(rows),
            batch_slot,
            num_rows,
            pos: 0,
            eos: false,
        };
        self.heap.push(Reverse(HeapEntry {
            key: head_key,
            input,
            stable: self.keep_order,
        }));
        Ok(())
    }

    fn converter_for(&mut self, key_arrays: &[ArrayRef]) -> Result<&RowConverter> {
        if self.converter.is_none() {
            let fields = self
                .sort_keys
                .iter()
                .zip(key_arrays)
                .map(|(key, array)| {
                    SortField::new_with_options(
                        array.data_type().clone(),
                        SortOptions {
                            descending: !key.is_asc,
                            nulls_first: key.is_null_first,
                        },
                    )
                })
                .collect();
            let converter = RowConverter::new(fields)
                .map_err(|e| Status::internal(format!("create row converter failed: {e}")))?;
            self.converter = Some(converter);
        }
        Ok(self.converter.as_ref().expect("row converter"))
    }

    fn fill_picks(&mut self) -> FillStatus {
        loop {
            if self.picks.len() >= self.chunk_size {
                return FillStatus::Full;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                return FillStatus::Drained;
            };
            let cursor = &mut self.cursors[entry.input];
            self.picks.push((cursor.batch_slot, cursor.pos));
            cursor.pos += 1;
            if cursor.pos < cursor.num_rows {
                let rows = cursor.rows.as_ref().expect("cursor rows");
                let key = rows.row(cursor.pos).owned();
                self.heap.push(Reverse(HeapEntry {
                    key,
                    input: entry.input,
                    stable: entry.stable,
                }));
            } else {
                cursor.rows = None;
                return FillStatus::NeedRefill;
            }
        }
    }

    fn emit(&mut self) -> Result<Chunk> {
        let template = self
            .template
            .as_ref()
            .ok_or_else(|| Status::internal("merger emit without any input chunk"))?;
        let num_columns = template.batch.num_columns();
        let mut columns = Vec::with_capacity(num_columns);
        for col_idx in 0..num_columns {
            let values: Vec<&dyn arrow::array::Array> = self
                .pending_batches
                .iter()
                .map(|batch| batch.column(col_idx).as_ref())
                .collect();
            let column = interleave(&values, &self.picks)
                .map_err(|e| Status::internal(format!("interleave failed: {e}")))?;
            columns.push(column);
        }
        let batch = RecordBatch::try_new(template.schema(), columns)
            .map_err(|e| Status::internal(format!("assemble merged batch failed: {e}")))?;
        let chunk = template.with_batch(batch);
        self.picks.clear();
        self.compact_batches();
        Ok(chunk)
    }

    // Drop batches no cursor references anymore; output rows were copied out
    // by interleave.
    fn compact_batches(&mut self) {
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut kept = Vec::new();
        for cursor in self.cursors.iter_mut() {
            if cursor.rows.is_none() {
                continue;
            }
            let slot = cursor.batch_slot;
            let new_slot = *remap.entry(slot).or_insert_with(|| {
                kept.push(self.pending_batches[slot].clone());
                kept.len() - 1
            });
            cursor.batch_slot = new_slot;
        }
        self.pending_batches = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::expr::{SlotRef, SortKey};
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn make_chunk(values: &[i32]) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from(values.to_vec()))],
        )
        .expect("record batch");
        Chunk::from_batch_with_slots(batch, &[SlotId::new(1)]).expect("chunk")
    }

    fn chunk_values(chunk: &Chunk) -> Vec<i32> {
        let arr = chunk
            .columns()
            .first()
            .expect("first column")
            .as_any()
            .downcast_ref::<Int32Array>()
            .expect("int32 column");
        (0..arr.len()).map(|i| arr.value(i)).collect()
    }

    struct StubSupplier {
        chunks: Mutex<VecDeque<Chunk>>,
    }

    impl StubSupplier {
        fn new(chunks: Vec<Chunk>) -> Box<Self> {
            Box::new(Self {
                chunks: Mutex::new(chunks.into()),
            })
        }
    }

    impl ChunkSupplier for StubSupplier {
        fn get_chunk(&self) -> Result<Option<Chunk>> {
            Ok(self.chunks.lock().expect("stub lock").pop_front())
        }

        fn try_get_chunk(&self) -> Result<Option<Chunk>> {
            self.get_chunk()
        }

        fn has_chunk(&self) -> bool {
            true
        }
    }

    fn asc_key() -> Vec<SortKey> {
        vec![SortKey::asc(SlotRef::new(SlotId::new(1)))]
    }

    #[test]
    fn merges_two_sorted_inputs() {
        let suppliers: Vec<Box<dyn ChunkSupplier>> = vec![
            StubSupplier::new(vec![make_chunk(&[1, 3, 5, 7])]),
            StubSupplier::new(vec![make_chunk(&[2, 4, 6, 8])]),
        ];
        let mut merger = SortedChunksMerger::new(suppliers, asc_key(), false, 4096).expect("merger");

        let chunk = merger.get_next().expect("merged").expect("chunk");
        assert_eq!(chunk_values(&chunk), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(merger.get_next().expect("eos").is_none());
    }

    #[test]
    fn merges_across_chunk_boundaries() {
        let suppliers: Vec<Box<dyn ChunkSupplier>> = vec![
            StubSupplier::new(vec![make_chunk(&[1, 2]), make_chunk(&[9, 10])]),
            StubSupplier::new(vec![make_chunk(&[3, 8]), make_chunk(&[11])]),
        ];
        let mut merger = SortedChunksMerger::new(suppliers, asc_key(), false, 3).expect("merger");

        let mut merged = Vec::new();
        while let Some(chunk) = merger.get_next().expect("merged") {
            assert!(chunk.num_rows() <= 3);
            merged.extend(chunk_values(&chunk));
        }
        assert_eq!(merged, vec![1, 2, 3, 8, 9, 10, 11]);
    }

    #[test]
    fn descending_keys_merge_descending() {
        let key = vec![SortKey::desc(SlotRef::new(SlotId::new(1)))];
        let suppliers: Vec<Box<dyn ChunkSupplier>> = vec![
            StubSupplier::new(vec![make_chunk(&[7, 5, 1])]),
            StubSupplier::new(vec![make_chunk(&[8, 2])]),
        ];
        let mut merger = SortedChunksMerger::new(suppliers, key, false, 4096).expect("merger");

        let chunk = merger.get_next().expect("merged").expect("chunk");
        assert_eq!(chunk_values(&chunk), vec![8, 7, 5, 2, 1]);
    }

    fn make_tagged_chunk(keys: &[i32], tags: &[i32]) -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int32, false),
            Field::new("tag", DataType::Int32, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(keys.to_vec())),
                Arc::new(Int32Array::from(tags.to_vec())),
            ],
        )
        .expect("record batch");
        Chunk::from_batch_with_slots(batch, &[SlotId::new(1), SlotId::new(2)]).expect("chunk")
    }

    fn column_values(chunk: &Chunk, slot: u32) -> Vec<i32> {
        let col = chunk
            .column_by_slot_id(SlotId::new(slot))
            .expect("column by slot id");
        let arr = col
            .as_any()
            .downcast_ref::<Int32Array>()
            .expect("int32 column");
        (0..arr.len()).map(|i| arr.value(i)).collect()
    }

    #[test]
    fn keep_order_breaks_key_ties_by_input_then_arrival() {
        // Colliding keys across inputs; the tag column records provenance.
        let suppliers: Vec<Box<dyn ChunkSupplier>> = vec![
            StubSupplier::new(vec![make_tagged_chunk(&[1, 1, 2], &[10, 11, 12])]),
            StubSupplier::new(vec![make_tagged_chunk(&[1, 2, 2], &[20, 21, 22])]),
        ];
        let mut merger = SortedChunksMerger::new(suppliers, asc_key(), true, 4096).expect("merger");

        let chunk = merger.get_next().expect("merged").expect("chunk");
        assert_eq!(column_values(&chunk, 1), vec![1, 1, 1, 2, 2, 2]);
        // Equal keys: input 0's rows first in their arrival order, then
        // input 1's.
        assert_eq!(column_values(&chunk, 2), vec![10, 11, 20, 12, 21, 22]);
        assert!(merger.get_next().expect("eos").is_none());
    }

    #[test]
    fn cooperative_mode_reports_not_ready() {
        struct EmptySupplier;
        impl ChunkSupplier for EmptySupplier {
            fn get_chunk(&self) -> Result<Option<Chunk>> {
                Ok(None)
            }
            fn try_get_chunk(&self) -> Result<Option<Chunk>> {
                Ok(None)
            }
            fn has_chunk(&self) -> bool {
                false
            }
        }

        let suppliers: Vec<Box<dyn ChunkSupplier>> =
            vec![StubSupplier::new(vec![make_chunk(&[1])]), Box::new(EmptySupplier)];
        let mut merger = SortedChunksMerger::new(suppliers, asc_key(), false, 4096).expect("merger");
        assert!(!merger.is_data_ready());
        assert!(matches!(
            merger.get_next_for_pipeline().expect("pull"),
            CooperativePull::NotReady
        ));
    }
}
