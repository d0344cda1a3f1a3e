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
//! Asynchronous transmit dispatch for exchange sinks.
//!
//! Requests are serialized per `(destination, node, sender)` lane: at most
//! one request of a lane is in flight, later requests queue behind it in
//! FIFO order. This is what gives each channel its strictly increasing
//! sequence delivery without receiver-side locking across lanes. A global
//! in-flight byte budget provides sender-side backpressure; sinks check
//! `can_reserve` from `need_input` and yield instead of blocking.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::chunkflow_logging::{debug, error};
use crate::common::config::exchange_io_max_inflight_bytes;
use crate::common::status::Status;
use crate::common::types::UniqueId;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::runtime::mem_tracker::TrackedBytes;
use crate::runtime::runtime_state::RuntimeErrorState;
use crate::service::proto::PTransmitChunkParams;
use crate::service::transport::{Destination, ExchangeTransport, TransmitDone};

/// Per-operator in-flight accounting, used by `pending_finish`.
pub struct ExchangeSendTracker {
    inflight_tasks: AtomicUsize,
    inflight_bytes: AtomicUsize,
}

impl ExchangeSendTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inflight_tasks: AtomicUsize::new(0),
            inflight_bytes: AtomicUsize::new(0),
        })
    }

    pub fn on_enqueue(&self, bytes: usize) {
        self.inflight_tasks.fetch_add(1, Ordering::AcqRel);
        self.inflight_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn on_complete(&self, bytes: usize) {
        self.inflight_tasks.fetch_sub(1, Ordering::AcqRel);
        self.inflight_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn is_idle(&self) -> bool {
        self.inflight_tasks.load(Ordering::Acquire) == 0
    }

    pub fn inflight_bytes(&self) -> usize {
        self.inflight_bytes.load(Ordering::Acquire)
    }
}

/// Failure latch shared between a channel and its in-flight requests. The
/// first failure poisons the channel; later appends become no-ops.
#[derive(Default)]
pub struct ChannelShared {
    close_status: Mutex<Option<Status>>,
}

impl ChannelShared {
    pub fn poison(&self, status: Status) {
        let mut guard = self.close_status.lock().expect("channel status lock");
        if guard.is_none() {
            *guard = Some(status);
        }
    }

    pub fn close_status(&self) -> Option<Status> {
        self.close_status.lock().expect("channel status lock").clone()
    }

    pub fn is_poisoned(&self) -> bool {
        self.close_status
            .lock()
            .expect("channel status lock")
            .is_some()
    }
}

pub struct ExchangeSendTask {
    pub dest: Destination,
    pub node_id: i32,
    pub sender_id: i32,
    pub request: PTransmitChunkParams,
    pub payload_bytes: usize,
    /// Serialized payload bytes charged to a tracker while the request is
    /// queued or in flight; released when the completion fires.
    pub payload_accounting: Option<TrackedBytes>,
    pub notify: Arc<Observable>,
    pub error_state: Arc<RuntimeErrorState>,
    pub tracker: Arc<ExchangeSendTracker>,
    pub channel: Arc<ChannelShared>,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct ExchangeSendKey {
    dest_finst_id: UniqueId,
    address: String,
    node_id: i32,
    sender_id: i32,
}

impl ExchangeSendKey {
    fn from_task(task: &ExchangeSendTask) -> Self {
        Self {
            dest_finst_id: task.dest.fragment_instance_id,
            address: task.dest.address.clone(),
            node_id: task.node_id,
            sender_id: task.sender_id,
        }
    }
}

struct QueuedSendTask {
    task: ExchangeSendTask,
    reserve_bytes: usize,
}

#[derive(Debug)]
pub enum ExchangeSendEnqueue {
    Enqueued,
    NoCapacity,
}

pub struct ExchangeSendQueue {
    transport: Arc<dyn ExchangeTransport>,
    inflight_bytes: Arc<AtomicUsize>,
    max_inflight_bytes: usize,
    queues: Mutex<HashMap<ExchangeSendKey, VecDeque<QueuedSendTask>>>,
    send_observers: Mutex<Vec<std::sync::Weak<Observable>>>,
}

impl ExchangeSendQueue {
    pub fn new(transport: Arc<dyn ExchangeTransport>) -> Arc<Self> {
        Self::with_max_inflight_bytes(transport, exchange_io_max_inflight_bytes())
    }

    pub fn with_max_inflight_bytes(
        transport: Arc<dyn ExchangeTransport>,
        max_inflight_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            inflight_bytes: Arc::new(AtomicUsize::new(0)),
            max_inflight_bytes: max_inflight_bytes.max(1),
            queues: Mutex::new(HashMap::new()),
            send_observers: Mutex::new(Vec::new()),
        })
    }

    /// Register a sink observable to poke when capacity frees up.
    pub fn register_send_observer(&self, observer: &Arc<Observable>) {
        let mut guard = self
            .send_observers
            .lock()
            .expect("exchange send observer lock");
        guard.push(Arc::downgrade(observer));
    }

    pub fn notify_send_observers(&self) {
        let observers = {
            let mut guard = self
                .send_observers
                .lock()
                .expect("exchange send observer lock");
            let mut alive = Vec::new();
            guard.retain(|weak| {
                if let Some(obs) = weak.upgrade() {
                    alive.push(obs);
                    true
                } else {
                    false
                }
            });
            alive
        };
        for observer in observers {
            let notify = observer.defer_notify();
            notify.arm();
        }
    }

    pub fn can_reserve(&self, bytes: usize) -> bool {
        let bytes = bytes.max(1);
        let cur = self.inflight_bytes.load(Ordering::Acquire);
        cur.saturating_add(bytes) <= self.max_inflight_bytes
    }

    pub fn max_inflight_bytes(&self) -> usize {
        self.max_inflight_bytes
    }

    pub fn inflight_bytes(&self) -> usize {
        self.inflight_bytes.load(Ordering::Acquire)
    }

    /// Enqueue a request. `allow_overflow` bypasses the byte budget; used
    /// for requests larger than the whole budget and for eos flushes, which
    /// must go out regardless of pressure.
    pub fn try_submit(
        self: &Arc<Self>,
        task: ExchangeSendTask,
        allow_overflow: bool,
    ) -> ExchangeSendEnqueue {
        let reserve_bytes = task.payload_bytes.max(1);
        if allow_overflow {
            self.inflight_bytes
                .fetch_add(reserve_bytes, Ordering::AcqRel);
        } else if !self.reserve_bytes(reserve_bytes) {
            return ExchangeSendEnqueue::NoCapacity;
        }

        task.tracker.on_enqueue(reserve_bytes);
        self.enqueue_task(task, reserve_bytes);
        ExchangeSendEnqueue::Enqueued
    }

    fn reserve_bytes(&self, bytes: usize) -> bool {
        loop {
            let cur = self.inflight_bytes.load(Ordering::Acquire);
            let next = cur.saturating_add(bytes);
            if next > self.max_inflight_bytes {
                return false;
            }
            if self
                .inflight_bytes
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn enqueue_task(self: &Arc<Self>, task: ExchangeSendTask, reserve_bytes: usize) {
        let key = ExchangeSendKey::from_task(&task);
        let queued = QueuedSendTask {
            task,
            reserve_bytes,
        };

        let start_now = {
            let mut guard = self.queues.lock().expect("exchange send queue lock");
            if let Some(queue) = guard.get_mut(&key) {
                queue.push_back(queued);
                None
            } else {
                // An entry in the map marks the lane as having one request
                // in flight; the backlog queue holds the rest.
                guard.insert(key.clone(), VecDeque::new());
                Some(queued)
            }
        };

        if let Some(queued) = start_now {
            self.dispatch(key, queued);
        }
    }

    fn dispatch(self: &Arc<Self>, key: ExchangeSendKey, queued: QueuedSendTask) {
        let QueuedSendTask {
            task,
            reserve_bytes,
        } = queued;
        let ExchangeSendTask {
            dest,
            node_id,
            sender_id,
            request,
            payload_bytes,
            payload_accounting,
            notify,
            error_state,
            tracker,
            channel,
        } = task;

        let this = Arc::clone(self);
        let sequence = request.sequence;
        let eos = request.eos;
        let dest_for_call = dest.clone();
        let done: TransmitDone = Box::new(move |result| {
            match result {
                Ok(()) => {
                    debug!(
                        "exchange send completed: dest={} finst={} node_id={} sender_id={} eos={} seq={} bytes={}",
                        dest.address,
                        dest.fragment_instance_id,
                        node_id,
                        sender_id,
                        eos,
                        sequence,
                        payload_bytes
                    );
                }
                Err(err) => {
                    error!(
                        "exchange send failed: dest={} finst={} node_id={} sender_id={} seq={} error={}",
                        dest.address, dest.fragment_instance_id, node_id, sender_id, sequence, err
                    );
                    channel.poison(err.clone());
                    error_state.set_error(err);
                }
            }

            drop(payload_accounting);
            this.inflight_bytes.fetch_sub(reserve_bytes, Ordering::AcqRel);
            tracker.on_complete(reserve_bytes);
            let defer = notify.defer_notify();
            defer.arm();
            this.notify_send_observers();
            this.on_task_complete(key);
        });

        self.transport.transmit_chunk(&dest_for_call, request, done);
    }

    fn on_task_complete(self: &Arc<Self>, key: ExchangeSendKey) {
        let next = {
            let mut guard = self.queues.lock().expect("exchange send queue lock");
            let Some(queue) = guard.get_mut(&key) else {
                return;
            };
            if let Some(next) = queue.pop_front() {
                Some(next)
            } else {
                guard.remove(&key);
                None
            }
        };

        if let Some(task) = next {
            self.dispatch(key, task);
        }
    }
}
