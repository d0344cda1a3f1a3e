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
//! Transport seam between the exchange sender and the receiver side.
//!
//! The wire transport is pluggable: the sender only needs best-effort
//! at-least-once delivery with a single-shot completion per request, and the
//! receiver only needs a way to defer that completion while it applies
//! backpressure. `LocalExchangeTransport` is the in-process implementation
//! used by single-node deployments and the tests.

use std::sync::{Arc, Mutex};

use crate::chunkflow_logging::warn;
use crate::common::status::Result;
use crate::common::types::UniqueId;
use crate::runtime::data_stream_mgr::DataStreamMgr;
use crate::runtime::io::io_executor;
use crate::service::proto::PTransmitChunkParams;

/// One outbound destination: a fragment instance on some backend. The
/// `address` is opaque to the exchange runtime; remote transports resolve it,
/// the local transport ignores it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Destination {
    pub fragment_instance_id: UniqueId,
    pub address: String,
}

/// Sender-side completion callback, invoked exactly once per request.
pub type TransmitDone = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Receiver-side deferred completion of an incoming transmit request.
///
/// Running the closure signals the remote sender that the request has been
/// processed and it may advance. The receiver guarantees it runs exactly
/// once; dropping an unrun closure is a bug, so `Drop` runs it as a backstop
/// to keep the sender live.
pub struct AckClosure {
    inner: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl AckClosure {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Some(Box::new(f)),
        }
    }

    pub fn run(mut self) {
        if let Some(f) = self.inner.take() {
            f();
        }
    }
}

impl Drop for AckClosure {
    fn drop(&mut self) {
        if let Some(f) = self.inner.take() {
            warn!("ack closure dropped without run; completing request");
            f();
        }
    }
}

impl std::fmt::Debug for AckClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckClosure")
            .field("pending", &self.inner.is_some())
            .finish()
    }
}

/// Asynchronous request transport. Implementations must not block the
/// caller; `done` fires when the receiver completes (or fails) the request.
pub trait ExchangeTransport: Send + Sync {
    fn transmit_chunk(&self, dest: &Destination, request: PTransmitChunkParams, done: TransmitDone);
}

/// In-process transport routing requests straight into a [`DataStreamMgr`]
/// on the exchange io executor.
pub struct LocalExchangeTransport {
    mgr: Arc<DataStreamMgr>,
}

impl LocalExchangeTransport {
    pub fn new(mgr: Arc<DataStreamMgr>) -> Arc<Self> {
        Arc::new(Self { mgr })
    }
}

impl ExchangeTransport for LocalExchangeTransport {
    fn transmit_chunk(
        &self,
        _dest: &Destination,
        request: PTransmitChunkParams,
        done: TransmitDone,
    ) {
        let mgr = Arc::clone(&self.mgr);
        io_executor().submit(move |_ctx| {
            // The receiver may retain the ack past this call; share the
            // completion so whichever side runs first wins.
            let done_cell: Arc<Mutex<Option<TransmitDone>>> = Arc::new(Mutex::new(Some(done)));
            let ack = {
                let done_cell = Arc::clone(&done_cell);
                AckClosure::new(move || {
                    if let Some(done) = done_cell.lock().expect("transmit done lock").take() {
                        done(Ok(()));
                    }
                })
            };
            let mut ack_slot = Some(ack);
            match mgr.transmit_chunk(&request, &mut ack_slot) {
                Ok(()) => {
                    // Not retained for backpressure: complete immediately.
                    if let Some(ack) = ack_slot.take() {
                        ack.run();
                    }
                }
                Err(err) => {
                    if let Some(done) = done_cell.lock().expect("transmit done lock").take() {
                        done(Err(err));
                    }
                    // The completion was already taken; running the ack is a
                    // no-op that keeps the exactly-once discipline explicit.
                    if let Some(ack) = ack_slot.take() {
                        ack.run();
                    }
                }
            }
        });
    }
}
