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
//! Block compression codecs for exchange payloads.
//!
//! Codecs operate on whole payloads into caller-supplied buffers so the
//! serializer can reuse one scratch buffer per stream.

use crate::common::status::{Result, Status};
use crate::service::proto::CompressionTypePb;

const ZSTD_COMPRESSION_LEVEL: i32 = 3;

pub trait BlockCompressionCodec: Send + Sync {
    fn compression_type(&self) -> CompressionTypePb;

    /// Compress `input` into `output`, replacing its contents.
    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<()>;

    /// Decompress `input` into `output`. `output` must be sized to the exact
    /// uncompressed length; a short or long result is a corrupt payload.
    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<()>;
}

struct Lz4BlockCodec;

impl BlockCompressionCodec for Lz4BlockCodec {
    fn compression_type(&self) -> CompressionTypePb {
        CompressionTypePb::Lz4
    }

    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        let max_len = lz4_flex::block::get_maximum_output_size(input.len());
        output.clear();
        output.resize(max_len, 0);
        let written = lz4_flex::block::compress_into(input, output)
            .map_err(|e| Status::InternalError(format!("lz4 compress failed: {e}")))?;
        output.truncate(written);
        Ok(())
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let written = lz4_flex::block::decompress_into(input, output)
            .map_err(|e| Status::Corruption(format!("lz4 decompress failed: {e}")))?;
        if written != output.len() {
            return Err(Status::Corruption(format!(
                "lz4 decompressed size mismatch: expected={} actual={}",
                output.len(),
                written
            )));
        }
        Ok(())
    }
}

struct SnappyCodec;

impl BlockCompressionCodec for SnappyCodec {
    fn compression_type(&self) -> CompressionTypePb {
        CompressionTypePb::Snappy
    }

    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        let max_len = snap::raw::max_compress_len(input.len());
        output.clear();
        output.resize(max_len, 0);
        let written = snap::raw::Encoder::new()
            .compress(input, output)
            .map_err(|e| Status::InternalError(format!("snappy compress failed: {e}")))?;
        output.truncate(written);
        Ok(())
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let written = snap::raw::Decoder::new()
            .decompress(input, output)
            .map_err(|e| Status::Corruption(format!("snappy decompress failed: {e}")))?;
        if written != output.len() {
            return Err(Status::Corruption(format!(
                "snappy decompressed size mismatch: expected={} actual={}",
                output.len(),
                written
            )));
        }
        Ok(())
    }
}

struct ZstdCodec;

impl BlockCompressionCodec for ZstdCodec {
    fn compression_type(&self) -> CompressionTypePb {
        CompressionTypePb::Zstd
    }

    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        output.clear();
        let compressed = zstd::bulk::compress(input, ZSTD_COMPRESSION_LEVEL)
            .map_err(|e| Status::InternalError(format!("zstd compress failed: {e}")))?;
        *output = compressed;
        Ok(())
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let written = zstd::bulk::decompress_to_buffer(input, output)
            .map_err(|e| Status::Corruption(format!("zstd decompress failed: {e}")))?;
        if written != output.len() {
            return Err(Status::Corruption(format!(
                "zstd decompressed size mismatch: expected={} actual={}",
                output.len(),
                written
            )));
        }
        Ok(())
    }
}

static LZ4_CODEC: Lz4BlockCodec = Lz4BlockCodec;
static SNAPPY_CODEC: SnappyCodec = SnappyCodec;
static ZSTD_CODEC: ZstdCodec = ZstdCodec;

/// Codec lookup. `NoCompression` has no codec; callers skip the compression
/// step entirely for it.
pub fn get_block_compression_codec(
    compress_type: CompressionTypePb,
) -> Result<&'static dyn BlockCompressionCodec> {
    match compress_type {
        CompressionTypePb::Lz4 => Ok(&LZ4_CODEC),
        CompressionTypePb::Snappy => Ok(&SNAPPY_CODEC),
        CompressionTypePb::Zstd => Ok(&ZSTD_CODEC),
        CompressionTypePb::NoCompression => Err(Status::InternalError(
            "no codec for NO_COMPRESSION".to_string(),
        )),
    }
}
