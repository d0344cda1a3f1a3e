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
use crate::chunkflow_config::config as chunkflow_app_config;

pub(crate) fn chunk_size() -> usize {
    chunkflow_app_config()
        .ok()
        .map(|c| c.runtime.chunk_size)
        .unwrap_or(4096)
}

pub(crate) fn exchange_max_transmit_batched_bytes() -> usize {
    chunkflow_app_config()
        .ok()
        .map(|c| c.runtime.exchange_max_transmit_batched_bytes)
        .unwrap_or(262_144)
}

pub(crate) fn exchange_io_threads() -> usize {
    chunkflow_app_config()
        .ok()
        .map(|c| c.runtime.exchange_io_threads)
        .unwrap_or(4)
}

pub(crate) fn exchange_io_max_inflight_bytes() -> usize {
    chunkflow_app_config()
        .ok()
        .map(|c| c.runtime.exchange_io_max_inflight_bytes)
        .unwrap_or(64 * 1024 * 1024)
}

pub(crate) fn exchange_buffer_mem_limit() -> usize {
    chunkflow_app_config()
        .ok()
        .map(|c| c.runtime.exchange_buffer_mem_limit)
        .unwrap_or(8 * 1024 * 1024)
}
