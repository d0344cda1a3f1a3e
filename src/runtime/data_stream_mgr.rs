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
//! Process registry of stream receivers.
//!
//! Incoming transmit requests are routed by `(fragment_instance_id,
//! dest_node_id)`. A request that finds no receiver is acked immediately:
//! the receiver side may already be closed while a sender retry is still in
//! flight, and holding the sender hostage would leak it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::chunkflow_logging::debug;
use crate::common::status::Result;
use crate::common::types::UniqueId;
use crate::runtime::data_stream_recvr::{DataStreamRecvr, DataStreamRecvrParams};
use crate::service::proto::PTransmitChunkParams;
use crate::service::transport::AckClosure;

pub struct DataStreamMgr {
    receivers: Mutex<HashMap<(UniqueId, i32), Arc<DataStreamRecvr>>>,
}

impl DataStreamMgr {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            receivers: Mutex::new(HashMap::new()),
        })
    }

    /// Create and register a receiver for one exchange edge.
    pub fn create_recvr(self: &Arc<Self>, params: DataStreamRecvrParams) -> Arc<DataStreamRecvr> {
        let key = (params.fragment_instance_id, params.dest_node_id);
        let recvr = DataStreamRecvr::new(params, Arc::downgrade(self));
        let mut guard = self.receivers.lock().expect("stream mgr lock");
        guard.insert(key, Arc::clone(&recvr));
        debug!(
            "exchange receiver CREATED: finst={} node_id={}",
            key.0, key.1
        );
        recvr
    }

    pub fn find_recvr(
        &self,
        fragment_instance_id: UniqueId,
        node_id: i32,
    ) -> Option<Arc<DataStreamRecvr>> {
        let guard = self.receivers.lock().expect("stream mgr lock");
        guard.get(&(fragment_instance_id, node_id)).cloned()
    }

    pub(crate) fn deregister_recvr(&self, fragment_instance_id: UniqueId, node_id: i32) {
        let mut guard = self.receivers.lock().expect("stream mgr lock");
        guard.remove(&(fragment_instance_id, node_id));
    }

    /// Fragment cancel: every receiver of the fragment instance fans the
    /// cancel out to its queues, releasing held acks.
    pub fn cancel_fragment(&self, fragment_instance_id: UniqueId) {
        let receivers: Vec<Arc<DataStreamRecvr>> = {
            let guard = self.receivers.lock().expect("stream mgr lock");
            guard
                .iter()
                .filter(|((finst_id, _), _)| *finst_id == fragment_instance_id)
                .map(|(_, recvr)| Arc::clone(recvr))
                .collect()
        };
        for recvr in receivers {
            recvr.cancel_stream();
        }
    }

    /// Dispatch one incoming transmit request. `done` is consumed when the
    /// receiving queue retains it for backpressure; otherwise the caller
    /// completes the request after this returns.
    pub fn transmit_chunk(
        &self,
        request: &PTransmitChunkParams,
        done: &mut Option<AckClosure>,
    ) -> Result<()> {
        let finst_id = UniqueId::from(request.finst_id.clone().unwrap_or_default());
        let Some(recvr) = self.find_recvr(finst_id, request.node_id) else {
            debug!(
                "transmit to unknown receiver: finst={} node_id={} eos={}",
                finst_id, request.node_id, request.eos
            );
            return Ok(());
        };

        if !request.chunks.is_empty() {
            recvr.add_chunks(request, done)?;
        }
        if request.eos {
            recvr.remove_sender(request.sender_id, request.be_number);
        }
        Ok(())
    }
}
