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
//! Expression seam for partition and sort keys.
//!
//! The full expression evaluator lives outside this crate; exchange only
//! needs "evaluate a chunk into one column". `SlotRef` covers the common
//! case of keying on an existing column.

use std::sync::Arc;

use arrow::array::ArrayRef;

use crate::common::ids::SlotId;
use crate::common::status::Result;
use crate::exec::chunk::Chunk;

pub trait PartitionExpr: Send + Sync {
    fn evaluate(&self, chunk: &Chunk) -> Result<ArrayRef>;
}

/// References a column of the chunk by slot id.
pub struct SlotRef {
    slot_id: SlotId,
}

impl SlotRef {
    pub fn new(slot_id: SlotId) -> Arc<Self> {
        Arc::new(Self { slot_id })
    }
}

impl PartitionExpr for SlotRef {
    fn evaluate(&self, chunk: &Chunk) -> Result<ArrayRef> {
        chunk.column_by_slot_id(self.slot_id)
    }
}

/// Sort key specification for the merging receiver.
#[derive(Clone)]
pub struct SortKey {
    pub expr: Arc<dyn PartitionExpr>,
    pub is_asc: bool,
    pub is_null_first: bool,
}

impl SortKey {
    pub fn asc(expr: Arc<dyn PartitionExpr>) -> Self {
        Self {
            expr,
            is_asc: true,
            is_null_first: true,
        }
    }

    pub fn desc(expr: Arc<dyn PartitionExpr>) -> Self {
        Self {
            expr,
            is_asc: false,
            is_null_first: false,
        }
    }
}
