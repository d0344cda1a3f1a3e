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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::config;
use crate::common::status::Status;
use crate::common::types::UniqueId;
use crate::runtime::mem_tracker::{MemTracker, process_mem_tracker};

/// First-writer-wins error latch shared by the operators of one fragment
/// instance. The first failure surfaces on the next consumer call; later
/// failures are dropped.
#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: Mutex<Option<Status>>,
}

impl RuntimeErrorState {
    pub fn set_error(&self, err: Status) {
        let mut guard = self.error.lock().expect("runtime error lock");
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<Status> {
        self.error.lock().expect("runtime error lock").clone()
    }
}

/// Per-fragment-instance execution context.
#[derive(Debug)]
pub struct RuntimeState {
    fragment_instance_id: UniqueId,
    be_number: i32,
    chunk_size: usize,
    instance_mem_tracker: Arc<MemTracker>,
    error_state: Arc<RuntimeErrorState>,
    cancelled: AtomicBool,
}

impl RuntimeState {
    pub fn new(fragment_instance_id: UniqueId, be_number: i32) -> Self {
        let instance_mem_tracker = MemTracker::new_child(
            format!("fragment instance: {}", fragment_instance_id),
            &process_mem_tracker(),
        );
        Self {
            fragment_instance_id,
            be_number,
            chunk_size: config::chunk_size(),
            instance_mem_tracker,
            error_state: Arc::new(RuntimeErrorState::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn fragment_instance_id(&self) -> UniqueId {
        self.fragment_instance_id
    }

    pub fn be_number(&self) -> i32 {
        self.be_number
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn instance_mem_tracker(&self) -> Arc<MemTracker> {
        Arc::clone(&self.instance_mem_tracker)
    }

    pub fn error_state(&self) -> Arc<RuntimeErrorState> {
        Arc::clone(&self.error_state)
    }

    pub fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new(UniqueId::default(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_state_keeps_first_error() {
        let state = RuntimeErrorState::default();
        assert!(state.error().is_none());
        state.set_error(Status::RpcError("first".to_string()));
        state.set_error(Status::RpcError("second".to_string()));
        assert_eq!(state.error(), Some(Status::RpcError("first".to_string())));
    }
}
