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
use thiserror::Error;

/// Error taxonomy for the exchange runtime.
///
/// Receivers and senders must be able to tell cancellation apart from data
/// corruption and transport failures, so errors are carried as an enum rather
/// than opaque strings.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Status {
    /// Fragment cancel observed. Never retried; drained silently.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Malformed wire message. Fatal for the stream.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Allocation failure during decompression or chunk decode.
    #[error("Memory allocation failed: {0}")]
    MemoryAllocFailed(String),

    /// Channel-level transport failure; poisons the channel.
    #[error("Rpc error: {0}")]
    RpcError(String),

    /// Terminal stream marker, not a failure.
    #[error("End of stream")]
    EndOfStream,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl Status {
    pub fn internal(msg: impl Into<String>) -> Self {
        Status::InternalError(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Status::Cancelled(_))
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Status::EndOfStream)
    }
}

pub type Result<T> = std::result::Result<T, Status>;
