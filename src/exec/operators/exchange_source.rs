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
//! Exchange source: pipeline-side consumer of a stream receiver.
//!
//! Pulls chunks cooperatively: a pull that finds no data returns `None`
//! without suspending, and the receiver's observable wakes the driver when
//! data or end-of-stream arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::status::Result;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::schedule::observer::Observable;
use crate::runtime::data_stream_recvr::DataStreamRecvr;
use crate::runtime::runtime_state::RuntimeState;
use crate::runtime::sorted_chunks_merger::CooperativePull;

pub struct ExchangeSourceOperatorFactory {
    name: String,
    recvr: Arc<DataStreamRecvr>,
    is_merging: bool,
}

impl ExchangeSourceOperatorFactory {
    pub fn new(recvr: Arc<DataStreamRecvr>, is_merging: bool, plan_node_id: i32) -> Self {
        let name = if plan_node_id >= 0 {
            format!("EXCHANGE_SOURCE (id={plan_node_id})")
        } else {
            "EXCHANGE_SOURCE".to_string()
        };
        Self {
            name,
            recvr,
            is_merging,
        }
    }

    pub fn create(&self) -> ExchangeSourceOperator {
        ExchangeSourceOperator {
            name: self.name.clone(),
            recvr: Arc::clone(&self.recvr),
            is_merging: self.is_merging,
            finished: AtomicBool::new(false),
        }
    }
}

pub struct ExchangeSourceOperator {
    name: String,
    recvr: Arc<DataStreamRecvr>,
    is_merging: bool,
    finished: AtomicBool,
}

impl Operator for ExchangeSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        self.recvr.close();
        Ok(())
    }

    fn cancel(&mut self) {
        self.recvr.cancel_stream();
    }

    fn is_finished(&self) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return true;
        }
        if !self.is_merging && self.recvr.is_finished() {
            self.finished.store(true, Ordering::Release);
            return true;
        }
        false
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for ExchangeSourceOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return false;
        }
        if self.is_merging {
            self.recvr.is_data_ready()
        } else {
            self.recvr.has_output() || self.recvr.is_finished()
        }
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> Result<()> {
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        if self.finished.load(Ordering::Acquire) {
            return Ok(None);
        }
        if self.is_merging {
            match self.recvr.get_next_for_pipeline()? {
                CooperativePull::Chunk(chunk) => Ok(Some(chunk)),
                CooperativePull::NotReady => Ok(None),
                CooperativePull::Finished => {
                    self.finished.store(true, Ordering::Release);
                    Ok(None)
                }
            }
        } else {
            let chunk = self.recvr.get_chunk_for_pipeline()?;
            if chunk.is_none() && self.recvr.is_finished() {
                self.finished.store(true, Ordering::Release);
            }
            Ok(chunk)
        }
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn source_observable(&self) -> Option<Arc<Observable>> {
        Some(self.recvr.observable())
    }
}
