#![forbid(unsafe_code)]

use palisade_core::{EngineConfig, RulePolicy};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub default_policy: String,
    pub frag_shards: u16,
    pub frag_capacity_per_shard: u32,
    pub frag_ttl_secs: u64,
    pub state_max: u32,
    pub log_verdicts: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let stock = EngineConfig::default();
        RuntimeConfig {
            default_policy: "block".to_string(),
            frag_shards: stock.frag_shards,
            frag_capacity_per_shard: stock.frag_capacity_per_shard,
            frag_ttl_secs: stock.frag_idle_window.as_secs(),
            state_max: stock.state_max,
            log_verdicts: stock.log_verdicts,
        }
    }
}

impl RuntimeConfig {
    pub fn engine_config(&self) -> Result<EngineConfig, String> {
        let default_policy = match self.default_policy.as_str() {
            "pass" => RulePolicy::Pass,
            "block" => RulePolicy::Block,
            other => return Err(format!("default_policy must be pass or block, got {other}")),
        };
        Ok(EngineConfig {
            default_policy,
            frag_shards: self.frag_shards,
            frag_capacity_per_shard: self.frag_capacity_per_shard,
            frag_idle_window: Duration::from_secs(self.frag_ttl_secs),
            state_max: self.state_max,
            log_verdicts: self.log_verdicts,
        })
    }
}

pub fn load_runtime_config(root: &Path) -> Result<RuntimeConfig, String> {
    let path = root.join("palisade.yaml");
    if !path.exists() {
        return Ok(RuntimeConfig::default());
    }
    let body = fs::read_to_string(&path)
        .map_err(|e| format!("read runtime config {}: {e}", path.display()))?;
    if body.trim().is_empty() {
        return Ok(RuntimeConfig::default());
    }
    let cfg: RuntimeConfig = serde_yaml::from_str(&body)
        .map_err(|e| format!("parse runtime config {}: {e}", path.display()))?;
    Ok(cfg)
}
