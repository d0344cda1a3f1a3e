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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<ChunkflowConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static ChunkflowConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = ChunkflowConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static ChunkflowConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = ChunkflowConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static ChunkflowConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("CHUNKFLOW_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("chunkflow.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $CHUNKFLOW_CONFIG or create ./chunkflow.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct ChunkflowConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "chunkflow=debug,h2=off"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl ChunkflowConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let cfg: ChunkflowConfig = toml::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.display()))?;
        Ok(cfg)
    }
}

#[derive(Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Rows per output chunk produced by the merger and operators.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Flush threshold for a channel's batched transmit request.
    #[serde(default = "default_exchange_max_transmit_batched_bytes")]
    pub exchange_max_transmit_batched_bytes: usize,

    /// Worker threads of the exchange io executor.
    #[serde(default = "default_exchange_io_threads")]
    pub exchange_io_threads: usize,

    /// Upper bound on serialized bytes in flight across all channels.
    #[serde(default = "default_exchange_io_max_inflight_bytes")]
    pub exchange_io_max_inflight_bytes: usize,

    /// Default receiver-side buffer limit when the fragment does not set one.
    #[serde(default = "default_exchange_buffer_mem_limit")]
    pub exchange_buffer_mem_limit: usize,
}

fn default_chunk_size() -> usize {
    4096
}

fn default_exchange_max_transmit_batched_bytes() -> usize {
    262_144
}

fn default_exchange_io_threads() -> usize {
    4
}

fn default_exchange_io_max_inflight_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_exchange_buffer_mem_limit() -> usize {
    8 * 1024 * 1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            exchange_max_transmit_batched_bytes: default_exchange_max_transmit_batched_bytes(),
            exchange_io_threads: default_exchange_io_threads(),
            exchange_io_max_inflight_bytes: default_exchange_io_max_inflight_bytes(),
            exchange_buffer_mem_limit: default_exchange_buffer_mem_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_config_defaults_apply_to_empty_toml() {
        let cfg: ChunkflowConfig = toml::from_str("").expect("parse empty config");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.runtime.chunk_size, 4096);
        assert_eq!(cfg.runtime.exchange_max_transmit_batched_bytes, 262_144);
    }

    #[test]
    fn runtime_config_overrides() {
        let cfg: ChunkflowConfig = toml::from_str(
            "log_level = \"debug\"\n[runtime]\nexchange_io_threads = 8\nchunk_size = 1024\n",
        )
        .expect("parse config");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.runtime.exchange_io_threads, 8);
        assert_eq!(cfg.runtime.chunk_size, 1024);
    }
}
