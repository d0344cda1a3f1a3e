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
//! Exchange sink: partitions outgoing chunks across per-destination
//! channels, batches serialized payloads, and hands full requests to the
//! asynchronous send queue.
//!
//! Broadcast serializes a chunk once and appends the same payload to every
//! channel. Hash and bucket-shuffle partitioning bucket rows with a two-pass
//! counting layout: per-channel counts, prefix-summed into `start_points`,
//! then row indices scattered into `row_indexes` so the slice
//! `row_indexes[start_points[c]..start_points[c + 1]]` is channel `c`'s row
//! set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rand::seq::SliceRandom;

use crate::chunkflow_logging::debug;
use crate::common::config::exchange_max_transmit_batched_bytes;
use crate::common::status::{Result, Status};
use crate::exec::chunk::Chunk;
use crate::exec::chunk::serde::serialize_chunk;
use crate::exec::expr::PartitionExpr;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::schedule::observer::Observable;
use crate::runtime::mem_tracker::{TrackedBytes, process_mem_tracker};
use crate::runtime::runtime_state::{RuntimeErrorState, RuntimeState};
use crate::service::exchange_sender::{
    ChannelShared, ExchangeSendQueue, ExchangeSendTask, ExchangeSendTracker,
};
use crate::service::proto::{ChunkPb, CompressionTypePb, PTransmitChunkParams, PUniqueId};
use crate::service::transport::Destination;

// Row hashing for shuffle partitioning (vectorized, no row conversion).
mod exchange_sink_hash {
    use std::sync::Arc;

    use arrow::array::{
        Array, ArrayRef, BooleanArray, Date32Array, Decimal128Array, Float64Array, Int64Array,
        StringArray, TimestampMicrosecondArray, TimestampMillisecondArray,
        TimestampNanosecondArray, TimestampSecondArray,
    };
    use arrow::compute::cast;
    use arrow::datatypes::{DataType, TimeUnit};

    use crate::common::status::{Result, Status};

    const FNV_SEED: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    fn fnv_hash_value(value: &[u8]) -> u64 {
        let mut hash = FNV_SEED;
        for &byte in value {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    /// Widen small integer and float types so equal values hash equally
    /// regardless of the physical representation the planner chose.
    pub(super) fn canonicalize_hash_array(array: &ArrayRef) -> Result<ArrayRef> {
        match array.data_type() {
            DataType::Int8 | DataType::Int16 | DataType::Int32 => cast(array, &DataType::Int64)
                .map_err(|e| Status::internal(format!("hash_partition: cast to Int64 failed: {e}"))),
            DataType::Float32 => cast(array, &DataType::Float64).map_err(|e| {
                Status::internal(format!("hash_partition: cast to Float64 failed: {e}"))
            }),
            _ => Ok(Arc::clone(array)),
        }
    }

    fn timestamp_row_value(array: &ArrayRef, unit: &TimeUnit, row: usize) -> Result<i64> {
        let value = match unit {
            TimeUnit::Second => array
                .as_any()
                .downcast_ref::<TimestampSecondArray>()
                .ok_or_else(|| Status::internal("failed to downcast to TimestampSecondArray"))?
                .value(row),
            TimeUnit::Millisecond => array
                .as_any()
                .downcast_ref::<TimestampMillisecondArray>()
                .ok_or_else(|| {
                    Status::internal("failed to downcast to TimestampMillisecondArray")
                })?
                .value(row),
            TimeUnit::Microsecond => array
                .as_any()
                .downcast_ref::<TimestampMicrosecondArray>()
                .ok_or_else(|| {
                    Status::internal("failed to downcast to TimestampMicrosecondArray")
                })?
                .value(row),
            TimeUnit::Nanosecond => array
                .as_any()
                .downcast_ref::<TimestampNanosecondArray>()
                .ok_or_else(|| Status::internal("failed to downcast to TimestampNanosecondArray"))?
                .value(row),
        };
        Ok(value)
    }

    fn hash_rows<F>(array: &ArrayRef, mut row_bytes: F) -> Result<Vec<Option<Vec<u8>>>>
    where
        F: FnMut(usize) -> Result<Vec<u8>>,
    {
        let mut out = Vec::with_capacity(array.len());
        for row in 0..array.len() {
            if array.is_null(row) {
                out.push(None);
            } else {
                out.push(Some(row_bytes(row)?));
            }
        }
        Ok(out)
    }

    fn row_byte_encodings(array: &ArrayRef) -> Result<Vec<Option<Vec<u8>>>> {
        match array.data_type() {
            DataType::Boolean => {
                let arr = array
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .ok_or_else(|| Status::internal("failed to downcast to BooleanArray"))?;
                hash_rows(array, |row| Ok(vec![arr.value(row) as u8]))
            }
            DataType::Int64 => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .ok_or_else(|| Status::internal("failed to downcast to Int64Array"))?;
                hash_rows(array, |row| Ok(arr.value(row).to_le_bytes().to_vec()))
            }
            DataType::Float64 => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| Status::internal("failed to downcast to Float64Array"))?;
                hash_rows(array, |row| {
                    Ok(arr.value(row).to_bits().to_le_bytes().to_vec())
                })
            }
            DataType::Utf8 => {
                let arr = array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| Status::internal("failed to downcast to StringArray"))?;
                hash_rows(array, |row| Ok(arr.value(row).as_bytes().to_vec()))
            }
            DataType::Date32 => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Date32Array>()
                    .ok_or_else(|| Status::internal("failed to downcast to Date32Array"))?;
                hash_rows(array, |row| Ok(arr.value(row).to_le_bytes().to_vec()))
            }
            DataType::Timestamp(unit, _tz) => {
                let unit = unit.clone();
                hash_rows(array, |row| {
                    Ok(timestamp_row_value(array, &unit, row)?.to_le_bytes().to_vec())
                })
            }
            DataType::Decimal128(_, _) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Decimal128Array>()
                    .ok_or_else(|| Status::internal("failed to downcast to Decimal128Array"))?;
                hash_rows(array, |row| Ok(arr.value(row).to_le_bytes().to_vec()))
            }
            other => Err(Status::internal(format!(
                "hash_partition: unsupported array type: {other:?}"
            ))),
        }
    }

    /// FNV-1 per row; null rows contribute only the prime multiplication.
    pub(super) fn compute_fnv_hash_array(array: &ArrayRef) -> Result<Vec<u64>> {
        let encodings = row_byte_encodings(array)?;
        let mut hash_values = vec![FNV_SEED; array.len()];
        for (hash, encoding) in hash_values.iter_mut().zip(&encodings) {
            match encoding {
                Some(bytes) => {
                    *hash ^= fnv_hash_value(bytes);
                    *hash = hash.wrapping_mul(FNV_PRIME);
                }
                None => {
                    *hash = hash.wrapping_mul(FNV_PRIME);
                }
            }
        }
        Ok(hash_values)
    }

    /// CRC32C per row (bucket-shuffle partitioning); null rows hash to 0.
    pub(super) fn compute_crc32_hash_array(array: &ArrayRef) -> Result<Vec<u32>> {
        let encodings = row_byte_encodings(array)?;
        let mut hash_values = vec![0u32; array.len()];
        for (hash, encoding) in hash_values.iter_mut().zip(&encodings) {
            if let Some(bytes) = encoding {
                *hash = crc32c::crc32c(bytes);
            }
        }
        Ok(hash_values)
    }

    pub(super) const FNV_SEED_INIT: u64 = FNV_SEED;
    pub(super) const FNV_PRIME_MUL: u64 = FNV_PRIME;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionType {
    /// All chunks go to the single channel.
    Unpartitioned,
    /// One channel per chunk, rotated through a shuffled permutation.
    Random,
    /// FNV row hash modulo channel count.
    HashPartitioned,
    /// CRC32C row hash; destinations are ordered by bucket.
    BucketShuffleHashPartitioned,
    /// Every channel receives every chunk, serialized once.
    Broadcast,
}

/// One outbound lane. Owns the partially-filled transmit request and the
/// per-destination sequence counter; the send queue keeps at most one of its
/// requests in flight.
struct Channel {
    dest: Destination,
    dest_node_id: i32,
    sender_id: i32,
    be_number: i32,
    next_sequence: i64,
    is_first_chunk: bool,
    request: Option<PTransmitChunkParams>,
    current_request_bytes: usize,
    request_bytes_threshold: usize,
    shared: Arc<ChannelShared>,
    eos_sent: bool,
}

/// Shared handles a channel needs to dispatch a request.
struct SinkRuntime<'a> {
    send_queue: &'a Arc<ExchangeSendQueue>,
    notify: &'a Arc<Observable>,
    error_state: &'a Arc<RuntimeErrorState>,
    tracker: &'a Arc<ExchangeSendTracker>,
}

impl Channel {
    fn new(
        dest: Destination,
        dest_node_id: i32,
        sender_id: i32,
        be_number: i32,
        request_bytes_threshold: usize,
    ) -> Self {
        Self {
            dest,
            dest_node_id,
            sender_id,
            be_number,
            next_sequence: 0,
            is_first_chunk: true,
            request: None,
            current_request_bytes: 0,
            request_bytes_threshold,
            shared: Arc::new(ChannelShared::default()),
            eos_sent: false,
        }
    }

    fn new_request(&self, eos: bool) -> PTransmitChunkParams {
        PTransmitChunkParams {
            finst_id: Some(PUniqueId::from(self.dest.fragment_instance_id)),
            node_id: self.dest_node_id,
            sender_id: self.sender_id,
            be_number: self.be_number,
            sequence: 0,
            eos,
            chunks: Vec::new(),
        }
    }

    fn append_chunk(&mut self, pb: ChunkPb, sink: &SinkRuntime<'_>) {
        // A poisoned channel already failed; appends are no-ops so the other
        // channels keep going.
        if self.shared.is_poisoned() {
            return;
        }
        let bytes = pb.data.len();
        if self.request.is_none() {
            self.request = Some(self.new_request(false));
        }
        self.request.as_mut().expect("pending request").chunks.push(pb);
        self.current_request_bytes += bytes;
        if self.current_request_bytes >= self.request_bytes_threshold {
            self.flush(sink);
        }
    }

    fn flush(&mut self, sink: &SinkRuntime<'_>) {
        let Some(mut request) = self.request.take() else {
            return;
        };
        let payload_bytes = self.current_request_bytes;
        self.current_request_bytes = 0;
        request.sequence = self.next_sequence;
        self.next_sequence += 1;

        let task = ExchangeSendTask {
            dest: self.dest.clone(),
            node_id: self.dest_node_id,
            sender_id: self.sender_id,
            request,
            payload_bytes,
            payload_accounting: Some(TrackedBytes::new(payload_bytes, process_mem_tracker())),
            notify: Arc::clone(sink.notify),
            error_state: Arc::clone(sink.error_state),
            tracker: Arc::clone(sink.tracker),
            channel: Arc::clone(&self.shared),
        };
        // Capacity was checked by need_input; a flush that slips past the
        // budget is absorbed rather than blocking the driver.
        sink.send_queue.try_submit(task, true);
    }

    /// Flush residual data and send the terminal eos request. Every channel
    /// gets a close attempt, even poisoned ones, so remote receivers are not
    /// leaked.
    fn close(&mut self, sink: &SinkRuntime<'_>) {
        if self.eos_sent {
            return;
        }
        self.flush(sink);

        let mut request = self.new_request(true);
        request.sequence = self.next_sequence;
        self.next_sequence += 1;
        let task = ExchangeSendTask {
            dest: self.dest.clone(),
            node_id: self.dest_node_id,
            sender_id: self.sender_id,
            request,
            payload_bytes: 0,
            payload_accounting: None,
            notify: Arc::clone(sink.notify),
            error_state: Arc::clone(sink.error_state),
            tracker: Arc::clone(sink.tracker),
            channel: Arc::clone(&self.shared),
        };
        sink.send_queue.try_submit(task, true);
        self.eos_sent = true;
    }

    /// Discard buffered data and poison the channel; in-flight requests run
    /// to completion and their replies are ignored.
    fn cancel(&mut self) {
        self.request = None;
        self.current_request_bytes = 0;
        self.shared
            .poison(Status::Cancelled("exchange sink cancelled".to_string()));
    }

    fn has_pending(&self) -> bool {
        self.request.is_some()
    }

    fn close_status(&self) -> Option<Status> {
        self.shared.close_status()
    }
}

pub struct ExchangeSinkParams {
    pub part_type: PartitionType,
    pub destinations: Vec<Destination>,
    pub dest_node_id: i32,
    pub sender_id: i32,
    pub be_number: i32,
    pub partition_exprs: Vec<Arc<dyn PartitionExpr>>,
    pub compress_type: CompressionTypePb,
    pub send_queue: Arc<ExchangeSendQueue>,
}

pub struct ExchangeSinkOperatorFactory {
    name: String,
    params: ExchangeSinkParams,
}

impl ExchangeSinkOperatorFactory {
    pub fn new(params: ExchangeSinkParams, plan_node_id: i32) -> Self {
        let name = if plan_node_id >= 0 {
            format!("EXCHANGE_SINK (id={plan_node_id})")
        } else {
            "EXCHANGE_SINK".to_string()
        };
        Self { name, params }
    }

    pub fn create(&self) -> ExchangeSinkOperator {
        ExchangeSinkOperator::new(
            self.name.clone(),
            ExchangeSinkParams {
                part_type: self.params.part_type,
                destinations: self.params.destinations.clone(),
                dest_node_id: self.params.dest_node_id,
                sender_id: self.params.sender_id,
                be_number: self.params.be_number,
                partition_exprs: self.params.partition_exprs.clone(),
                compress_type: self.params.compress_type,
                send_queue: Arc::clone(&self.params.send_queue),
            },
        )
    }
}

pub struct ExchangeSinkOperator {
    name: String,
    part_type: PartitionType,
    channels: Vec<Channel>,
    // Random order for walking channels so concurrent senders do not
    // hot-spot the same destination.
    channel_indices: Vec<usize>,
    curr_random_channel_idx: usize,
    partition_exprs: Vec<Arc<dyn PartitionExpr>>,
    compress_type: CompressionTypePb,
    compression_scratch: Vec<u8>,
    send_queue: Arc<ExchangeSendQueue>,
    send_tracker: Arc<ExchangeSendTracker>,
    send_observable: Arc<Observable>,
    request_bytes_threshold: usize,
    broadcast_is_first_chunk: bool,
    finishing: AtomicBool,
    finished: AtomicBool,
    // Shuffle scratch, reused across chunks.
    hash_values: Vec<u64>,
    start_points: Vec<usize>,
    row_indexes: Vec<u32>,
    serialize_ns: u64,
    bytes_sent: u64,
    uncompressed_bytes_sent: u64,
}

impl ExchangeSinkOperator {
    pub fn new(name: String, params: ExchangeSinkParams) -> Self {
        let request_bytes_threshold = exchange_max_transmit_batched_bytes().max(1);
        let channels = params
            .destinations
            .into_iter()
            .map(|dest| {
                Channel::new(
                    dest,
                    params.dest_node_id,
                    params.sender_id,
                    params.be_number,
                    request_bytes_threshold,
                )
            })
            .collect::<Vec<_>>();
        let channel_indices: Vec<usize> = (0..channels.len()).collect();
        let send_observable = Arc::new(Observable::new());
        params.send_queue.register_send_observer(&send_observable);

        Self {
            name,
            part_type: params.part_type,
            channels,
            channel_indices,
            curr_random_channel_idx: 0,
            partition_exprs: params.partition_exprs,
            compress_type: params.compress_type,
            compression_scratch: Vec::new(),
            send_queue: params.send_queue,
            send_tracker: ExchangeSendTracker::new(),
            send_observable,
            request_bytes_threshold,
            broadcast_is_first_chunk: true,
            finishing: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            hash_values: Vec::new(),
            start_points: Vec::new(),
            row_indexes: Vec::new(),
            serialize_ns: 0,
            bytes_sent: 0,
            uncompressed_bytes_sent: 0,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn uncompressed_bytes_sent(&self) -> u64 {
        self.uncompressed_bytes_sent
    }

    pub fn serialize_ns(&self) -> u64 {
        self.serialize_ns
    }

    /// Aggregated channel failures; surfaced at close.
    pub fn close_status(&self) -> Option<Status> {
        self.channels.iter().find_map(|c| c.close_status())
    }

    fn serialize_timed(&mut self, chunk: &Chunk, is_first: bool) -> Result<ChunkPb> {
        let start = Instant::now();
        let pb = serialize_chunk(
            chunk,
            self.compress_type,
            &mut self.compression_scratch,
            is_first,
        )?;
        self.serialize_ns += start.elapsed().as_nanos() as u64;
        self.bytes_sent += pb.data.len() as u64;
        self.uncompressed_bytes_sent += pb.uncompressed_size.max(0) as u64;
        Ok(pb)
    }

    fn push_unpartitioned(&mut self, state: &RuntimeState, chunk: &Chunk) -> Result<()> {
        let is_first = self.channels[0].is_first_chunk;
        let pb = self.serialize_timed(chunk, is_first)?;
        let error_state = state.error_state();
        let runtime = SinkRuntime {
            send_queue: &self.send_queue,
            notify: &self.send_observable,
            error_state: &error_state,
            tracker: &self.send_tracker,
        };
        self.channels[0].is_first_chunk = false;
        self.channels[0].append_chunk(pb, &runtime);
        Ok(())
    }

    fn push_broadcast(&mut self, state: &RuntimeState, chunk: &Chunk) -> Result<()> {
        // Serialize once; every channel gets the same payload. The byte
        // buffer is shared, not copied.
        let is_first = self.broadcast_is_first_chunk;
        self.broadcast_is_first_chunk = false;
        let pb = self.serialize_timed(chunk, is_first)?;
        let error_state = state.error_state();
        let runtime = SinkRuntime {
            send_queue: &self.send_queue,
            notify: &self.send_observable,
            error_state: &error_state,
            tracker: &self.send_tracker,
        };
        for channel in self.channels.iter_mut() {
            channel.is_first_chunk = false;
            channel.append_chunk(pb.clone(), &runtime);
        }
        Ok(())
    }

    fn push_random(&mut self, state: &RuntimeState, chunk: &Chunk) -> Result<()> {
        let n = self.channels.len();
        let channel_idx = self.channel_indices[self.curr_random_channel_idx % n];
        self.curr_random_channel_idx = self.curr_random_channel_idx.wrapping_add(1);

        let is_first = self.channels[channel_idx].is_first_chunk;
        let pb = self.serialize_timed(chunk, is_first)?;
        let error_state = state.error_state();
        let runtime = SinkRuntime {
            send_queue: &self.send_queue,
            notify: &self.send_observable,
            error_state: &error_state,
            tracker: &self.send_tracker,
        };
        self.channels[channel_idx].is_first_chunk = false;
        self.channels[channel_idx].append_chunk(pb, &runtime);
        Ok(())
    }

    fn push_shuffle(&mut self, state: &RuntimeState, chunk: &Chunk) -> Result<()> {
        if self.partition_exprs.is_empty() {
            return Err(Status::internal(
                "shuffle partitioning requires partition exprs",
            ));
        }
        self.compute_row_layout(chunk)?;

        let n = self.channels.len();
        for channel_idx in 0..n {
            let begin = self.start_points[channel_idx];
            let end = self.start_points[channel_idx + 1];
            if begin == end {
                continue;
            }
            let sub_chunk = project_rows(chunk, &self.row_indexes[begin..end])?;
            let is_first = self.channels[channel_idx].is_first_chunk;
            let pb = self.serialize_timed(&sub_chunk, is_first)?;
            let error_state = state.error_state();
            let runtime = SinkRuntime {
                send_queue: &self.send_queue,
                notify: &self.send_observable,
                error_state: &error_state,
                tracker: &self.send_tracker,
            };
            self.channels[channel_idx].is_first_chunk = false;
            self.channels[channel_idx].append_chunk(pb, &runtime);
        }
        Ok(())
    }

    /// Hash every row and lay out per-channel row index runs:
    /// per-channel counts, prefix sum into `start_points`, then scatter.
    fn compute_row_layout(&mut self, chunk: &Chunk) -> Result<()> {
        let n = self.channels.len();
        let num_rows = chunk.num_rows();
        let use_crc32 = self.part_type == PartitionType::BucketShuffleHashPartitioned;

        let mut partition_arrays = Vec::with_capacity(self.partition_exprs.len());
        for expr in &self.partition_exprs {
            let array = expr.evaluate(chunk)?;
            partition_arrays.push(exchange_sink_hash::canonicalize_hash_array(&array)?);
        }

        self.hash_values.clear();
        if use_crc32 {
            let mut crc32_hashes = vec![0u32; num_rows];
            for array in &partition_arrays {
                let arr_hashes = exchange_sink_hash::compute_crc32_hash_array(array)?;
                for i in 0..num_rows {
                    crc32_hashes[i] = crc32_hashes[i].wrapping_add(arr_hashes[i]);
                }
            }
            self.hash_values.extend(crc32_hashes.iter().map(|&h| h as u64));
        } else {
            self.hash_values
                .resize(num_rows, exchange_sink_hash::FNV_SEED_INIT);
            for array in &partition_arrays {
                let arr_hashes = exchange_sink_hash::compute_fnv_hash_array(array)?;
                for i in 0..num_rows {
                    self.hash_values[i] ^= arr_hashes[i];
                    self.hash_values[i] =
                        self.hash_values[i].wrapping_mul(exchange_sink_hash::FNV_PRIME_MUL);
                }
            }
        }

        self.start_points.clear();
        self.start_points.resize(n + 1, 0);
        for &hash in &self.hash_values {
            self.start_points[(hash as usize % n) + 1] += 1;
        }
        for i in 0..n {
            self.start_points[i + 1] += self.start_points[i];
        }

        self.row_indexes.clear();
        self.row_indexes.resize(num_rows, 0);
        let mut cursors = self.start_points[..n].to_vec();
        for (row, &hash) in self.hash_values.iter().enumerate() {
            let channel = hash as usize % n;
            self.row_indexes[cursors[channel]] = row as u32;
            cursors[channel] += 1;
        }
        Ok(())
    }

    fn maybe_mark_finished(&self) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return true;
        }
        if self.finishing.load(Ordering::Acquire)
            && !self.channels.iter().any(|c| c.has_pending())
            && self.send_tracker.is_idle()
        {
            self.finished.store(true, Ordering::Release);
            return true;
        }
        false
    }
}

impl Operator for ExchangeSinkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(Status::internal("exchange sink has no destinations"));
        }
        if self.part_type == PartitionType::Unpartitioned && self.channels.len() != 1 {
            return Err(Status::internal(format!(
                "unpartitioned exchange expects one destination, got {}",
                self.channels.len()
            )));
        }
        // Shuffle once so concurrent senders do not walk destinations in the
        // same order and pile onto one receiver.
        let mut rng = rand::thread_rng();
        self.channel_indices.shuffle(&mut rng);
        debug!(
            "exchange sink prepared: name={} part_type={:?} channels={}",
            self.name,
            self.part_type,
            self.channels.len()
        );
        Ok(())
    }

    fn cancel(&mut self) {
        self.finishing.store(true, Ordering::Release);
        for channel in self.channels.iter_mut() {
            channel.cancel();
        }
    }

    fn is_finished(&self) -> bool {
        self.maybe_mark_finished()
    }

    fn pending_finish(&self) -> bool {
        self.finishing.load(Ordering::Acquire) && !self.maybe_mark_finished()
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for ExchangeSinkOperator {
    fn need_input(&self) -> bool {
        !self.finishing.load(Ordering::Acquire)
            && self.send_queue.can_reserve(self.request_bytes_threshold)
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        debug_assert!(!self.finishing.load(Ordering::Acquire));
        if chunk.is_empty() {
            return Ok(());
        }
        match self.part_type {
            PartitionType::Unpartitioned => self.push_unpartitioned(state, &chunk),
            PartitionType::Broadcast => self.push_broadcast(state, &chunk),
            PartitionType::Random => self.push_random(state, &chunk),
            PartitionType::HashPartitioned | PartitionType::BucketShuffleHashPartitioned => {
                self.push_shuffle(state, &chunk)
            }
        }
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(None)
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<()> {
        if self.finishing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let error_state = state.error_state();
        let runtime = SinkRuntime {
            send_queue: &self.send_queue,
            notify: &self.send_observable,
            error_state: &error_state,
            tracker: &self.send_tracker,
        };
        for channel in self.channels.iter_mut() {
            channel.close(&runtime);
        }
        Ok(())
    }

    fn sink_observable(&self) -> Option<Arc<Observable>> {
        Some(Arc::clone(&self.send_observable))
    }
}

/// Project a row subset into a sub-chunk with the take kernel.
fn project_rows(chunk: &Chunk, rows: &[u32]) -> Result<Chunk> {
    let indices = arrow::array::UInt32Array::from(rows.to_vec());
    let mut columns = Vec::with_capacity(chunk.batch.num_columns());
    for col in chunk.batch.columns() {
        let taken = arrow::compute::take(col.as_ref(), &indices, None)
            .map_err(|e| Status::internal(format!("arrow take failed: {e}")))?;
        columns.push(taken);
    }
    let batch = arrow::record_batch::RecordBatch::try_new(chunk.batch.schema(), columns)
        .map_err(|e| Status::internal(format!("failed to create record batch: {e}")))?;
    Ok(chunk.with_batch(batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::common::types::UniqueId;
    use crate::exec::chunk::serde::{build_chunk_meta, deserialize_chunk};
    use crate::exec::expr::SlotRef;
    use crate::service::transport::{ExchangeTransport, TransmitDone};
    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport that records every request and completes immediately.
    struct CaptureTransport {
        requests: Mutex<Vec<PTransmitChunkParams>>,
    }

    impl CaptureTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<PTransmitChunkParams> {
            self.requests.lock().expect("capture lock").clone()
        }
    }

    impl ExchangeTransport for CaptureTransport {
        fn transmit_chunk(
            &self,
            _dest: &Destination,
            request: PTransmitChunkParams,
            done: TransmitDone,
        ) {
            self.requests.lock().expect("capture lock").push(request);
            done(Ok(()));
        }
    }

    fn destinations(n: usize) -> Vec<Destination> {
        (0..n)
            .map(|i| Destination {
                fragment_instance_id: UniqueId::new(0, i as i64 + 1),
                address: format!("backend-{i}"),
            })
            .collect()
    }

    fn make_chunk(rows: usize) -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Utf8, false),
        ]));
        let keys: Vec<i64> = (0..rows as i64).collect();
        let vals: Vec<String> = (0..rows).map(|i| format!("row{i}")).collect();
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(keys)),
                Arc::new(StringArray::from(vals)),
            ],
        )
        .expect("record batch");
        Chunk::from_batch_with_slots(batch, &[SlotId::new(1), SlotId::new(2)]).expect("chunk")
    }

    fn make_operator(
        part_type: PartitionType,
        num_dests: usize,
        transport: Arc<CaptureTransport>,
    ) -> ExchangeSinkOperator {
        let send_queue = ExchangeSendQueue::new(transport);
        let factory = ExchangeSinkOperatorFactory::new(
            ExchangeSinkParams {
                part_type,
                destinations: destinations(num_dests),
                dest_node_id: 2,
                sender_id: 0,
                be_number: 1,
                partition_exprs: vec![SlotRef::new(SlotId::new(1))],
                compress_type: CompressionTypePb::NoCompression,
                send_queue,
            },
            7,
        );
        let mut op = factory.create();
        op.prepare().expect("prepare");
        op
    }

    fn wait_finished(op: &ExchangeSinkOperator) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !op.is_finished() {
            assert!(Instant::now() < deadline, "sink did not drain in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn decode_rows_per_dest(requests: &[PTransmitChunkParams]) -> HashMap<i64, Vec<i64>> {
        let mut metas = HashMap::new();
        let mut rows: HashMap<i64, Vec<i64>> = HashMap::new();
        for request in requests {
            let dest = request.finst_id.clone().expect("finst id").lo;
            for pb in &request.chunks {
                if pb.has_meta() {
                    metas.insert(dest, build_chunk_meta(pb, None).expect("meta"));
                }
                let meta = metas.get(&dest).expect("meta before data");
                let chunk = deserialize_chunk(pb, meta.as_ref(), &mut Vec::new()).expect("chunk");
                let keys = chunk
                    .column_by_slot_id(SlotId::new(1))
                    .expect("key column");
                let keys = keys.as_any().downcast_ref::<Int64Array>().expect("int64");
                rows.entry(dest)
                    .or_default()
                    .extend((0..keys.len()).map(|i| keys.value(i)));
            }
        }
        rows
    }

    #[test]
    fn hash_partition_covers_every_row_exactly_once() {
        let transport = CaptureTransport::new();
        let mut op = make_operator(PartitionType::HashPartitioned, 3, Arc::clone(&transport));
        let state = RuntimeState::default();

        op.push_chunk(&state, make_chunk(100)).expect("push");
        op.set_finishing(&state).expect("finish");
        wait_finished(&op);

        let rows = decode_rows_per_dest(&transport.requests());
        let mut all: Vec<i64> = rows.values().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<i64>>());
    }

    #[test]
    fn hash_partition_is_deterministic_per_key() {
        let transport_a = CaptureTransport::new();
        let transport_b = CaptureTransport::new();
        let state = RuntimeState::default();

        for transport in [&transport_a, &transport_b] {
            let mut op =
                make_operator(PartitionType::HashPartitioned, 4, Arc::clone(transport));
            op.push_chunk(&state, make_chunk(64)).expect("push");
            op.set_finishing(&state).expect("finish");
            wait_finished(&op);
        }

        let mut rows_a: Vec<(i64, Vec<i64>)> =
            decode_rows_per_dest(&transport_a.requests()).into_iter().collect();
        let mut rows_b: Vec<(i64, Vec<i64>)> =
            decode_rows_per_dest(&transport_b.requests()).into_iter().collect();
        rows_a.sort();
        rows_b.sort();
        assert_eq!(rows_a, rows_b);
    }

    #[test]
    fn broadcast_sends_identical_payload_to_every_channel() {
        let transport = CaptureTransport::new();
        let mut op = make_operator(PartitionType::Broadcast, 4, Arc::clone(&transport));
        let state = RuntimeState::default();

        op.push_chunk(&state, make_chunk(256)).expect("push");
        op.set_finishing(&state).expect("finish");
        wait_finished(&op);

        let requests = transport.requests();
        let data_requests: Vec<_> = requests.iter().filter(|r| !r.chunks.is_empty()).collect();
        assert_eq!(data_requests.len(), 4);
        let reference = &data_requests[0].chunks[0].data;
        for request in &data_requests {
            assert_eq!(&request.chunks[0].data, reference);
            // Channels stamp their own dense sequence counters.
            assert_eq!(request.sequence, 0);
        }
        let dests: std::collections::HashSet<i64> = data_requests
            .iter()
            .map(|r| r.finst_id.clone().expect("finst").lo)
            .collect();
        assert_eq!(dests.len(), 4);

        let eos_requests: Vec<_> = requests.iter().filter(|r| r.eos).collect();
        assert_eq!(eos_requests.len(), 4);
    }

    #[test]
    fn random_rotates_whole_chunks_across_channels() {
        let transport = CaptureTransport::new();
        let mut op = make_operator(PartitionType::Random, 2, Arc::clone(&transport));
        let state = RuntimeState::default();

        for _ in 0..4 {
            op.push_chunk(&state, make_chunk(8)).expect("push");
        }
        op.set_finishing(&state).expect("finish");
        wait_finished(&op);

        let rows = decode_rows_per_dest(&transport.requests());
        // Round-robin over two channels: each gets two of the four chunks.
        assert_eq!(rows.len(), 2);
        for dest_rows in rows.values() {
            assert_eq!(dest_rows.len(), 16);
        }
    }

    #[test]
    fn channel_failure_poisons_only_that_channel() {
        struct FailOneTransport {
            fail_dest: i64,
            inner: Arc<CaptureTransport>,
        }
        impl ExchangeTransport for FailOneTransport {
            fn transmit_chunk(
                &self,
                dest: &Destination,
                request: PTransmitChunkParams,
                done: TransmitDone,
            ) {
                if dest.fragment_instance_id.lo == self.fail_dest {
                    done(Err(Status::RpcError("connection reset".to_string())));
                } else {
                    self.inner.transmit_chunk(dest, request, done);
                }
            }
        }

        let capture = CaptureTransport::new();
        let transport = Arc::new(FailOneTransport {
            fail_dest: 1,
            inner: Arc::clone(&capture),
        });
        let send_queue = ExchangeSendQueue::new(transport);
        let factory = ExchangeSinkOperatorFactory::new(
            ExchangeSinkParams {
                part_type: PartitionType::Broadcast,
                destinations: destinations(2),
                dest_node_id: 2,
                sender_id: 0,
                be_number: 1,
                partition_exprs: vec![],
                compress_type: CompressionTypePb::NoCompression,
                send_queue,
            },
            7,
        );
        let mut op = factory.create();
        op.prepare().expect("prepare");
        let state = RuntimeState::default();

        op.push_chunk(&state, make_chunk(16)).expect("push");
        op.set_finishing(&state).expect("finish");
        wait_finished(&op);

        assert!(matches!(op.close_status(), Some(Status::RpcError(_))));
        // The healthy channel still got its data and its eos.
        let healthy: Vec<_> = capture
            .requests()
            .into_iter()
            .filter(|r| r.finst_id.clone().expect("finst").lo == 2)
            .collect();
        assert!(healthy.iter().any(|r| !r.chunks.is_empty()));
        assert!(healthy.iter().any(|r| r.eos));
    }
}
