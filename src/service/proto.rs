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
//! Exchange wire messages.
//!
//! The transport carrying these messages is pluggable (see
//! [`crate::service::transport`]), so the messages are defined directly with
//! prost derives instead of build-time codegen from a service definition.

use crate::common::types::UniqueId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CompressionTypePb {
    NoCompression = 0,
    Lz4 = 1,
    Snappy = 2,
    Zstd = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PUniqueId {
    #[prost(int64, tag = "1")]
    pub hi: i64,
    #[prost(int64, tag = "2")]
    pub lo: i64,
}

impl From<UniqueId> for PUniqueId {
    fn from(id: UniqueId) -> Self {
        Self { hi: id.hi, lo: id.lo }
    }
}

impl From<PUniqueId> for UniqueId {
    fn from(id: PUniqueId) -> Self {
        Self { hi: id.hi, lo: id.lo }
    }
}

/// One serialized chunk. Metadata fields (`slot_id_map`, `tuple_id_map`,
/// `is_nulls`, `is_consts`) are populated only on the first chunk of a
/// stream; metadata is invariant within a stream and is not re-shipped.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkPb {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: ::bytes::Bytes,
    #[prost(enumeration = "CompressionTypePb", tag = "2")]
    pub compress_type: i32,
    #[prost(int64, tag = "3")]
    pub uncompressed_size: i64,
    #[prost(int64, tag = "4")]
    pub serialized_size: i64,
    /// Flat `[slot_id, column_index, ...]` pairs, even length.
    #[prost(int32, repeated, tag = "5")]
    pub slot_id_map: ::prost::alloc::vec::Vec<i32>,
    /// Flat `[tuple_id, column_index, ...]` pairs, even length.
    #[prost(int32, repeated, tag = "6")]
    pub tuple_id_map: ::prost::alloc::vec::Vec<i32>,
    #[prost(bool, repeated, tag = "7")]
    pub is_nulls: ::prost::alloc::vec::Vec<bool>,
    #[prost(bool, repeated, tag = "8")]
    pub is_consts: ::prost::alloc::vec::Vec<bool>,
}

impl ChunkPb {
    pub fn compress_type_pb(&self) -> CompressionTypePb {
        CompressionTypePb::try_from(self.compress_type)
            .unwrap_or(CompressionTypePb::NoCompression)
    }

    pub fn has_meta(&self) -> bool {
        !self.slot_id_map.is_empty() || !self.tuple_id_map.is_empty()
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PTransmitChunkParams {
    /// Destination fragment instance.
    #[prost(message, optional, tag = "1")]
    pub finst_id: ::core::option::Option<PUniqueId>,
    /// Destination exchange plan node.
    #[prost(int32, tag = "2")]
    pub node_id: i32,
    /// Sender identity within the fragment.
    #[prost(int32, tag = "3")]
    pub sender_id: i32,
    /// Backend identity; sequence numbers are scoped per (be_number, destination).
    #[prost(int32, tag = "4")]
    pub be_number: i32,
    #[prost(int64, tag = "5")]
    pub sequence: i64,
    /// Terminal marker; an eos request carries no chunks.
    #[prost(bool, tag = "6")]
    pub eos: bool,
    #[prost(message, repeated, tag = "7")]
    pub chunks: ::prost::alloc::vec::Vec<ChunkPb>,
}
