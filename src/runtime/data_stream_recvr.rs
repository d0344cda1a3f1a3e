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
//! Receiver side of the exchange: per-stream ingest queues with bounded
//! memory admission and deferred RPC acks.
//!
//! A receiver owns one queue per remote sender when merging (each sender's
//! substream is individually sorted), otherwise a single queue multiplexing
//! all senders. Backpressure is ack retention: when buffered bytes exceed
//! the limit, the last enqueued item keeps the request's completion closure
//! and the remote sender stays blocked until that item is consumed.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Instant;

use arrow::datatypes::SchemaRef;

use crate::chunkflow_logging::{debug, warn};
use crate::common::config;
use crate::common::status::{Result, Status};
use crate::common::types::UniqueId;
use crate::exec::chunk::serde::{ChunkMeta, build_chunk_meta, deserialize_chunk};
use crate::exec::chunk::Chunk;
use crate::exec::expr::SortKey;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::runtime::data_stream_mgr::DataStreamMgr;
use crate::runtime::mem_tracker::{
    MemTracker, ScopedMemTracker, current_mem_tracker, process_mem_tracker,
};
use crate::runtime::runtime_state::RuntimeErrorState;
use crate::runtime::sorted_chunks_merger::{
    ChunkSupplier, CooperativePull, SortedChunksMerger,
};
use crate::service::proto::PTransmitChunkParams;
use crate::service::transport::AckClosure;

struct ChunkItem {
    chunk_bytes: i64,
    chunk: Chunk,
    // When the receiver's buffered bytes exceed the limit we hold the
    // request's completion closure so the sender cannot continue. A request
    // may carry multiple chunks; only the last chunk of the request keeps
    // the closure, and running it lets the sender resume.
    closure: Option<AckClosure>,
}

/// Shared admission state between a receiver and its queues.
struct BufferControl {
    num_buffered_bytes: AtomicI64,
    total_buffer_limit: i64,
    bytes_received: AtomicU64,
    request_received: AtomicU64,
    deserialize_ns: AtomicU64,
}

impl BufferControl {
    // Soft bound: read without the queue lock; going slightly over is fine.
    fn exceeds_limit(&self, extra: i64) -> bool {
        self.num_buffered_bytes.load(Ordering::Relaxed) + extra > self.total_buffer_limit
    }
}

#[derive(Default)]
struct SenderQueueState {
    is_cancelled: bool,
    num_remaining_senders: i32,
    chunk_queue: VecDeque<ChunkItem>,
    chunk_meta: Option<Arc<ChunkMeta>>,
    sender_eos_set: HashSet<i32>,          // be_number
    packet_seq_map: HashMap<i32, i64>,     // be_number -> packet_seq
    // Out-of-order requests parked until their sequence becomes contiguous.
    // Keyed by (be_number, sequence); cross-source order is irrelevant.
    max_processed_sequences: HashMap<i32, i64>,
    buffered_chunk_queues: BTreeMap<(i32, i64), Vec<ChunkItem>>,
}

/// Blocking queue of chunks from one or more senders.
pub(crate) struct SenderQueue {
    control: Arc<BufferControl>,
    row_schema: Option<SchemaRef>,
    mu: Mutex<SenderQueueState>,
    data_arrival_cv: Condvar,
    observable: Arc<Observable>,
    instance_mem_tracker: Arc<MemTracker>,
}

impl SenderQueue {
    fn new(
        control: Arc<BufferControl>,
        row_schema: Option<SchemaRef>,
        num_senders: i32,
        observable: Arc<Observable>,
        instance_mem_tracker: Arc<MemTracker>,
    ) -> Self {
        Self {
            control,
            row_schema,
            mu: Mutex::new(SenderQueueState {
                num_remaining_senders: num_senders,
                ..SenderQueueState::default()
            }),
            data_arrival_cv: Condvar::new(),
            observable,
            instance_mem_tracker,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SenderQueueState> {
        self.mu.lock().expect("sender queue lock")
    }

    pub(crate) fn has_output(&self) -> bool {
        let st = self.lock();
        !st.is_cancelled && !st.chunk_queue.is_empty()
    }

    pub(crate) fn is_finished(&self) -> bool {
        let st = self.lock();
        st.is_cancelled || (st.num_remaining_senders == 0 && st.chunk_queue.is_empty())
    }

    /// True when a chunk is ready, the stream is exhausted, or the queue was
    /// cancelled (so pollers wake up and observe the cancel).
    pub(crate) fn has_chunk(&self) -> bool {
        let st = self.lock();
        if st.is_cancelled {
            return true;
        }
        !(st.chunk_queue.is_empty() && st.num_remaining_senders > 0)
    }

    /// Non-blocking pop for cooperative pipelines. `Ok(None)` means the
    /// stream is exhausted; callers gate on `has_chunk` first.
    pub(crate) fn try_get_chunk(&self) -> Result<Option<Chunk>> {
        let mut st = self.lock();
        if st.is_cancelled {
            return Err(Status::Cancelled("SenderQueue::try_get_chunk".to_string()));
        }
        if st.chunk_queue.is_empty() {
            debug_assert_eq!(st.num_remaining_senders, 0);
            return Ok(None);
        }
        Ok(Some(self.pop_front_item(&mut st)))
    }

    /// Blocking pop: waits until a chunk arrives, all senders sent EOS, or
    /// the queue is cancelled. `Ok(None)` means end of stream.
    pub(crate) fn get_chunk(&self) -> Result<Option<Chunk>> {
        let mut st = self.lock();
        while !st.is_cancelled && st.chunk_queue.is_empty() && st.num_remaining_senders > 0 {
            st = self
                .data_arrival_cv
                .wait(st)
                .expect("sender queue cv wait");
        }
        self.do_get_chunk(&mut st)
    }

    /// Non-waiting variant used by the legacy pipeline path. An empty queue
    /// with live senders returns `Ok(None)` without waiting.
    pub(crate) fn get_chunk_for_pipeline(&self) -> Result<Option<Chunk>> {
        let mut st = self.lock();
        self.do_get_chunk(&mut st)
    }

    fn do_get_chunk(
        &self,
        st: &mut std::sync::MutexGuard<'_, SenderQueueState>,
    ) -> Result<Option<Chunk>> {
        if st.is_cancelled {
            return Err(Status::Cancelled("SenderQueue::get_chunk".to_string()));
        }
        if st.chunk_queue.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.pop_front_item(st)))
    }

    fn pop_front_item(&self, st: &mut std::sync::MutexGuard<'_, SenderQueueState>) -> Chunk {
        let item = st.chunk_queue.pop_front().expect("non-empty chunk queue");
        self.control
            .num_buffered_bytes
            .fetch_sub(item.chunk_bytes, Ordering::AcqRel);
        if let Some(closure) = item.closure {
            // The ack's lifetime is detached from the fragment: the freed
            // bytes belong to the process, not the instance tracker.
            let _scope = ScopedMemTracker::swap_to(process_mem_tracker());
            closure.run();
        }
        item.chunk
    }

    /// Deserialize and enqueue all chunks of `request`.
    ///
    /// The queue lock is released while deserializing: decompression and
    /// decode are CPU-bound and would serialize all senders otherwise. The
    /// cancel flag is re-checked after relocking; a cancelled queue drops
    /// the incoming items and leaves `done` with the caller, which completes
    /// the request immediately.
    pub(crate) fn add_chunks(
        &self,
        request: &PTransmitChunkParams,
        done: &mut Option<AckClosure>,
        is_pipeline: bool,
    ) -> Result<()> {
        let be_number = request.be_number;
        let sequence = request.sequence;

        let meta = {
            let mut st = self.lock();
            if st.is_cancelled {
                return Ok(());
            }
            match st.packet_seq_map.entry(be_number) {
                Entry::Occupied(mut entry) => {
                    if *entry.get() >= sequence && !is_pipeline {
                        // Transport retry; the original request was already
                        // applied.
                        warn!(
                            "packet already exist [cur_packet_id={} receive_packet_id={}]",
                            entry.get(),
                            sequence
                        );
                        return Ok(());
                    }
                    entry.insert(sequence);
                }
                Entry::Vacant(entry) => {
                    entry.insert(sequence);
                }
            }

            // A failed send can race with the channel close: the eos packet
            // lands first and the retried data packet arrives afterwards.
            if st.num_remaining_senders <= 0 {
                debug_assert!(st.sender_eos_set.contains(&be_number));
                return Ok(());
            }

            if st.chunk_meta.is_none() {
                let first = request
                    .chunks
                    .first()
                    .ok_or_else(|| Status::internal("transmit request carries no chunks"))?;
                st.chunk_meta = Some(build_chunk_meta(first, self.row_schema.as_ref())?);
            }
            Arc::clone(st.chunk_meta.as_ref().expect("chunk meta built"))
        };

        let (mut items, total_chunk_bytes) = self.deserialize_request(request, &meta)?;

        {
            let mut st = self.lock();
            // The cancel flag may have flipped while the lock was released
            // for deserialization.
            if st.is_cancelled {
                return Ok(());
            }

            let had_items = !items.is_empty();
            if had_items && done.is_some() && self.control.exceeds_limit(total_chunk_bytes) {
                items.last_mut().expect("non-empty items").closure = done.take();
            }
            for item in items {
                st.chunk_queue.push_back(item);
            }
            self.control
                .num_buffered_bytes
                .fetch_add(total_chunk_bytes, Ordering::AcqRel);
        }
        self.data_arrival_cv.notify_one();
        let notify = self.observable.defer_notify();
        notify.arm();
        Ok(())
    }

    /// Like `add_chunks`, but parks the request under `(be_number,
    /// sequence)` and only splices contiguous sequences to the ready queue,
    /// so consumers see each source's chunks in sender order.
    pub(crate) fn add_chunks_and_keep_order(
        &self,
        request: &PTransmitChunkParams,
        done: &mut Option<AckClosure>,
    ) -> Result<()> {
        let be_number = request.be_number;
        let sequence = request.sequence;

        let meta = {
            let mut st = self.lock();
            if st.is_cancelled {
                return Ok(());
            }
            if st.num_remaining_senders <= 0 {
                debug_assert!(st.sender_eos_set.contains(&be_number));
                return Ok(());
            }
            if st.chunk_meta.is_none() {
                let first = request
                    .chunks
                    .first()
                    .ok_or_else(|| Status::internal("transmit request carries no chunks"))?;
                st.chunk_meta = Some(build_chunk_meta(first, self.row_schema.as_ref())?);
            }
            Arc::clone(st.chunk_meta.as_ref().expect("chunk meta built"))
        };

        let (mut items, total_chunk_bytes) = self.deserialize_request(request, &meta)?;

        {
            let mut st = self.lock();
            if st.is_cancelled {
                return Ok(());
            }

            if !items.is_empty() && done.is_some() && self.control.exceeds_limit(total_chunk_bytes)
            {
                items.last_mut().expect("non-empty items").closure = done.take();
            }
            st.buffered_chunk_queues.insert((be_number, sequence), items);

            // max_processed_sequence + 1 is the first unprocessed sequence;
            // splice every request that became contiguous.
            let mut cursor = *st
                .max_processed_sequences
                .entry(be_number)
                .or_insert(-1);
            while let Some(batch) = st.buffered_chunk_queues.remove(&(be_number, cursor + 1)) {
                for item in batch {
                    st.chunk_queue.push_back(item);
                }
                cursor += 1;
            }
            st.max_processed_sequences.insert(be_number, cursor);

            self.control
                .num_buffered_bytes
                .fetch_add(total_chunk_bytes, Ordering::AcqRel);
        }
        // No cv notify here: keep-order is pipeline-only and consumers are
        // woken through the observable by the dispatch thread.
        let notify = self.observable.defer_notify();
        notify.arm();
        Ok(())
    }

    fn deserialize_request(
        &self,
        request: &PTransmitChunkParams,
        meta: &ChunkMeta,
    ) -> Result<(Vec<ChunkItem>, i64)> {
        let _scope = ScopedMemTracker::swap_to(Arc::clone(&self.instance_mem_tracker));
        let deserialize_start = Instant::now();
        let mut items = Vec::with_capacity(request.chunks.len());
        let mut total_chunk_bytes = 0i64;
        let mut scratch = Vec::new();
        for pchunk in &request.chunks {
            let chunk_bytes = pchunk.data.len() as i64;
            let mut chunk = deserialize_chunk(pchunk, meta, &mut scratch)?;
            chunk.transfer_to(&current_mem_tracker());
            items.push(ChunkItem {
                chunk_bytes,
                chunk,
                closure: None,
            });
            total_chunk_bytes += chunk_bytes;
        }
        self.control
            .deserialize_ns
            .fetch_add(deserialize_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.control
            .bytes_received
            .fetch_add(total_chunk_bytes as u64, Ordering::Relaxed);
        Ok((items, total_chunk_bytes))
    }

    /// Idempotent per source. Signals end-of-stream when the last sender
    /// leaves.
    pub(crate) fn decrement_senders(&self, be_number: i32) {
        let mut st = self.lock();
        if st.sender_eos_set.contains(&be_number) {
            return;
        }
        st.sender_eos_set.insert(be_number);
        debug_assert!(st.num_remaining_senders > 0);
        st.num_remaining_senders -= 1;
        debug!(
            "decremented senders: be_number={} remaining={}",
            be_number, st.num_remaining_senders
        );
        if st.num_remaining_senders == 0 {
            self.data_arrival_cv.notify_all();
            drop(st);
            let notify = self.observable.defer_notify();
            notify.arm();
        }
    }

    /// Set the cancel flag, wake all waiters, and drain both queues running
    /// every held ack exactly once so remote senders unblock.
    pub(crate) fn cancel(&self) {
        {
            let mut st = self.lock();
            if st.is_cancelled {
                return;
            }
            st.is_cancelled = true;
        }
        self.data_arrival_cv.notify_all();
        let notify = self.observable.defer_notify();
        notify.arm();

        self.drain_queues();
    }

    /// Terminal cleanup. Sets the cancel flag so a concurrent `add_chunks`
    /// that re-locks after deserializing drops its items instead of leaking
    /// them past the drain.
    pub(crate) fn close(&self) {
        {
            let mut st = self.lock();
            st.is_cancelled = true;
        }
        self.drain_queues();
    }

    fn drain_queues(&self) {
        let mut st = self.lock();
        let _scope = ScopedMemTracker::swap_to(process_mem_tracker());
        let mut released = 0i64;
        for item in st.chunk_queue.drain(..) {
            released += item.chunk_bytes;
            if let Some(closure) = item.closure {
                closure.run();
            }
        }
        let buffered = std::mem::take(&mut st.buffered_chunk_queues);
        for (_, batch) in buffered {
            for item in batch {
                released += item.chunk_bytes;
                if let Some(closure) = item.closure {
                    closure.run();
                }
            }
        }
        self.control
            .num_buffered_bytes
            .fetch_sub(released, Ordering::AcqRel);
    }
}

struct SenderQueueSupplier {
    queue: Arc<SenderQueue>,
}

impl ChunkSupplier for SenderQueueSupplier {
    fn get_chunk(&self) -> Result<Option<Chunk>> {
        self.queue.get_chunk()
    }

    fn try_get_chunk(&self) -> Result<Option<Chunk>> {
        self.queue.try_get_chunk()
    }

    fn has_chunk(&self) -> bool {
        self.queue.has_chunk()
    }
}

/// Receiver construction parameters.
#[derive(Clone)]
pub struct DataStreamRecvrParams {
    pub fragment_instance_id: UniqueId,
    pub dest_node_id: i32,
    pub num_senders: usize,
    pub is_merging: bool,
    pub is_pipeline: bool,
    pub keep_order: bool,
    pub total_buffer_limit: usize,
    pub row_schema: Option<SchemaRef>,
}

impl DataStreamRecvrParams {
    /// Plain non-merging receiver with the configured buffer limit.
    pub fn new(fragment_instance_id: UniqueId, dest_node_id: i32, num_senders: usize) -> Self {
        Self {
            fragment_instance_id,
            dest_node_id,
            num_senders,
            is_merging: false,
            is_pipeline: false,
            keep_order: false,
            total_buffer_limit: config::exchange_buffer_mem_limit(),
            row_schema: None,
        }
    }
}

/// Receiver endpoint of one exchange edge: owns the sender queues, routes
/// incoming requests, and drives the merger when ordered output is required.
pub struct DataStreamRecvr {
    fragment_instance_id: UniqueId,
    dest_node_id: i32,
    is_merging: bool,
    is_pipeline: bool,
    keep_order: bool,
    control: Arc<BufferControl>,
    sender_queues: Vec<Arc<SenderQueue>>,
    merger: Mutex<Option<SortedChunksMerger>>,
    observable: Arc<Observable>,
    instance_mem_tracker: Arc<MemTracker>,
    mgr: Mutex<Option<Weak<DataStreamMgr>>>,
    // First stream-fatal error (e.g. Corruption); surfaced on the next
    // consumer call instead of the generic Cancelled.
    error_state: RuntimeErrorState,
    closed: AtomicBool,
}

impl DataStreamRecvr {
    pub(crate) fn new(params: DataStreamRecvrParams, mgr: Weak<DataStreamMgr>) -> Arc<Self> {
        let control = Arc::new(BufferControl {
            num_buffered_bytes: AtomicI64::new(0),
            total_buffer_limit: i64::try_from(params.total_buffer_limit).unwrap_or(i64::MAX),
            bytes_received: AtomicU64::new(0),
            request_received: AtomicU64::new(0),
            deserialize_ns: AtomicU64::new(0),
        });
        let observable = Arc::new(Observable::new());
        let instance_mem_tracker = MemTracker::new_child(
            format!(
                "exchange receiver: finst={} node_id={}",
                params.fragment_instance_id, params.dest_node_id
            ),
            &process_mem_tracker(),
        );

        // One queue per sender when merging, one shared queue otherwise.
        let num_queues = if params.is_merging { params.num_senders } else { 1 };
        let num_senders_per_queue = if params.is_merging {
            1
        } else {
            params.num_senders as i32
        };
        let mut sender_queues = Vec::with_capacity(num_queues);
        for _ in 0..num_queues {
            sender_queues.push(Arc::new(SenderQueue::new(
                Arc::clone(&control),
                params.row_schema.clone(),
                num_senders_per_queue,
                Arc::clone(&observable),
                Arc::clone(&instance_mem_tracker),
            )));
        }

        Arc::new(Self {
            fragment_instance_id: params.fragment_instance_id,
            dest_node_id: params.dest_node_id,
            is_merging: params.is_merging,
            is_pipeline: params.is_pipeline,
            keep_order: params.keep_order,
            control,
            sender_queues,
            merger: Mutex::new(None),
            observable,
            instance_mem_tracker,
            mgr: Mutex::new(Some(mgr)),
            error_state: RuntimeErrorState::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn fragment_instance_id(&self) -> UniqueId {
        self.fragment_instance_id
    }

    pub fn dest_node_id(&self) -> i32 {
        self.dest_node_id
    }

    pub fn observable(&self) -> Arc<Observable> {
        Arc::clone(&self.observable)
    }

    pub fn bytes_received(&self) -> u64 {
        self.control.bytes_received.load(Ordering::Relaxed)
    }

    pub fn requests_received(&self) -> u64 {
        self.control.request_received.load(Ordering::Relaxed)
    }

    pub fn deserialize_ns(&self) -> u64 {
        self.control.deserialize_ns.load(Ordering::Relaxed)
    }

    pub fn buffered_bytes(&self) -> i64 {
        self.control.num_buffered_bytes.load(Ordering::Relaxed)
    }

    /// Route one incoming transmit request to its queue.
    pub fn add_chunks(
        &self,
        request: &PTransmitChunkParams,
        done: &mut Option<AckClosure>,
    ) -> Result<()> {
        let _scope = ScopedMemTracker::swap_to(Arc::clone(&self.instance_mem_tracker));
        self.control
            .request_received
            .fetch_add(1, Ordering::Relaxed);
        let use_sender_id = if self.is_merging {
            request.sender_id as usize
        } else {
            0
        };
        let queue = self.sender_queues.get(use_sender_id).ok_or_else(|| {
            Status::internal(format!(
                "sender_id {} out of range ({} queues)",
                request.sender_id,
                self.sender_queues.len()
            ))
        })?;

        let result = if self.keep_order {
            debug_assert!(self.is_pipeline);
            queue.add_chunks_and_keep_order(request, done)
        } else {
            queue.add_chunks(request, done, self.is_pipeline)
        };

        // A malformed stream is fatal for the whole receiver: record the
        // error and cancel so consumers and the remaining senders observe it.
        if let Err(err) = &result {
            warn!(
                "add_chunks failed: finst={} node_id={} sender_id={} error={}",
                self.fragment_instance_id, self.dest_node_id, request.sender_id, err
            );
            self.error_state.set_error(err.clone());
            self.cancel_stream();
        }
        result
    }

    fn check_error(&self) -> Result<()> {
        match self.error_state.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// A sender closed its channel; forwarded to the queue that owns it.
    pub fn remove_sender(&self, sender_id: i32, be_number: i32) {
        let use_sender_id = if self.is_merging { sender_id as usize } else { 0 };
        if let Some(queue) = self.sender_queues.get(use_sender_id) {
            queue.decrement_senders(be_number);
        }
    }

    /// Create the k-way merger over the per-sender queues. Blocking
    /// consumers use `get_next`; cooperative consumers use
    /// `get_next_for_pipeline`.
    pub fn create_merger(&self, sort_keys: Vec<SortKey>, chunk_size: usize) -> Result<()> {
        debug_assert!(self.is_merging);
        let suppliers: Vec<Box<dyn ChunkSupplier>> = self
            .sender_queues
            .iter()
            .map(|q| {
                Box::new(SenderQueueSupplier {
                    queue: Arc::clone(q),
                }) as Box<dyn ChunkSupplier>
            })
            .collect();
        let merger = SortedChunksMerger::new(suppliers, sort_keys, self.keep_order, chunk_size)?;
        *self.merger.lock().expect("merger lock") = Some(merger);
        Ok(())
    }

    /// Blocking merged read. `Ok(None)` is end of stream.
    pub fn get_next(&self) -> Result<Option<Chunk>> {
        self.check_error()?;
        let mut guard = self.merger.lock().expect("merger lock");
        let merger = guard
            .as_mut()
            .ok_or_else(|| Status::internal("merger not created"))?;
        merger.get_next()
    }

    /// Cooperative merged read; never suspends.
    pub fn get_next_for_pipeline(&self) -> Result<CooperativePull> {
        self.check_error()?;
        let mut guard = self.merger.lock().expect("merger lock");
        let merger = guard
            .as_mut()
            .ok_or_else(|| Status::internal("merger not created"))?;
        merger.get_next_for_pipeline()
    }

    /// True when the merger can make progress without blocking.
    pub fn is_data_ready(&self) -> bool {
        let mut guard = self.merger.lock().expect("merger lock");
        match guard.as_mut() {
            Some(merger) => merger.is_data_ready(),
            None => false,
        }
    }

    /// Blocking single-queue read (non-merging receivers only).
    pub fn get_chunk(&self) -> Result<Option<Chunk>> {
        debug_assert!(!self.is_merging);
        self.check_error()?;
        self.sender_queues[0].get_chunk()
    }

    /// Non-waiting single-queue read for the cooperative path.
    pub fn get_chunk_for_pipeline(&self) -> Result<Option<Chunk>> {
        debug_assert!(!self.is_merging);
        self.check_error()?;
        self.sender_queues[0].get_chunk_for_pipeline()
    }

    pub fn has_output(&self) -> bool {
        debug_assert!(!self.is_merging);
        self.sender_queues[0].has_output()
    }

    pub fn is_finished(&self) -> bool {
        debug_assert!(!self.is_merging);
        self.sender_queues[0].is_finished()
    }

    /// Fragment cancel: fan out to every queue, releasing held acks.
    pub fn cancel_stream(&self) {
        debug!(
            "cancelled stream: finst={} node_id={}",
            self.fragment_instance_id, self.dest_node_id
        );
        for queue in &self.sender_queues {
            queue.cancel();
        }
    }

    /// Terminal cleanup: drain queues, release the merger, and deregister
    /// from the stream manager.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for queue in &self.sender_queues {
            queue.close();
        }
        *self.merger.lock().expect("merger lock") = None;
        let mgr = self.mgr.lock().expect("mgr slot lock").take();
        if let Some(mgr) = mgr.and_then(|weak| weak.upgrade()) {
            mgr.deregister_recvr(self.fragment_instance_id, self.dest_node_id);
        }
    }
}

impl Drop for DataStreamRecvr {
    fn drop(&mut self) {
        debug_assert!(
            self.closed.load(Ordering::Acquire),
            "DataStreamRecvr dropped without close()"
        );
    }
}
