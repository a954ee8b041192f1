//! Run configuration: YAML file first, then `HARVEST_*` environment overrides.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use harvest_dispatch::{DispatchOptions, Selection};
use harvest_gather::GatherSettings;
use harvest_kubehub::{PageBudget, ProfileEndpoints, RateLimiter};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{HarvestError, HarvestResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationConfig {
    /// Mask IPv4 addresses and the cluster base domain in every record.
    pub networking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatherConfig {
    /// Task ids, groups, or `ALL`.
    pub disabled: Vec<String>,
    pub task_timeout_secs: u64,
    pub run_timeout_secs: u64,
    /// Zero picks four per CPU.
    pub workers: usize,
    pub archive_max_bytes: usize,
    pub log_compression_ratio: usize,
    pub node_log_tail_lines: u32,
    pub page_limit: u32,
    pub record_budget: usize,
    pub rate_limit_qps: f64,
    pub rate_limit_burst: u32,
    pub obfuscation: ObfuscationConfig,
    pub endpoints: ProfileEndpoints,
}

impl Default for GatherConfig {
    fn default() -> Self {
        let settings = GatherSettings::default();
        let budget = PageBudget::default();
        Self {
            disabled: Vec::new(),
            task_timeout_secs: 300,
            run_timeout_secs: 900,
            workers: 0,
            archive_max_bytes: settings.archive_max_bytes,
            log_compression_ratio: settings.log_compression_ratio,
            node_log_tail_lines: settings.node_log_tail_lines,
            page_limit: budget.page_limit,
            record_budget: budget.max_items,
            rate_limit_qps: 10.0,
            rate_limit_burst: 20,
            obfuscation: ObfuscationConfig::default(),
            endpoints: ProfileEndpoints::default(),
        }
    }
}

fn parsed<T: FromStr>(key: &str, raw: &str) -> HarvestResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| HarvestError::Config(format!("{key}={raw}: {e}")))
}

impl GatherConfig {
    pub fn from_yaml(text: &str) -> HarvestResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| HarvestError::Config(format!("parsing config: {e}")))
    }

    /// Defaults, then the file if given, then the process environment.
    pub fn load(path: Option<&Path>) -> HarvestResult<Self> {
        let mut cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| HarvestError::Config(format!("reading {}: {e}", p.display())))?;
                Self::from_yaml(&text)?
            }
            None => Self::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> HarvestResult<()> {
        if let Some(v) = lookup("HARVEST_DISABLED") {
            self.disabled = v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        }
        if let Some(v) = lookup("HARVEST_TASK_TIMEOUT_SECS") {
            self.task_timeout_secs = parsed("HARVEST_TASK_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("HARVEST_RUN_TIMEOUT_SECS") {
            self.run_timeout_secs = parsed("HARVEST_RUN_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("HARVEST_WORKERS") {
            self.workers = parsed("HARVEST_WORKERS", &v)?;
        }
        if let Some(v) = lookup("HARVEST_ARCHIVE_MAX_BYTES") {
            self.archive_max_bytes = parsed("HARVEST_ARCHIVE_MAX_BYTES", &v)?;
        }
        if let Some(v) = lookup("HARVEST_OBFUSCATE_NETWORKING") {
            self.obfuscation.networking = parsed("HARVEST_OBFUSCATE_NETWORKING", &v)?;
        }
        debug!(disabled = self.disabled.len(), workers = self.workers, "config: environment applied");
        Ok(())
    }

    pub fn gather_settings(&self) -> GatherSettings {
        GatherSettings {
            archive_max_bytes: self.archive_max_bytes,
            log_compression_ratio: self.log_compression_ratio,
            node_log_tail_lines: self.node_log_tail_lines,
        }
    }

    /// `only` narrows the run to those ids when non-empty.
    pub fn dispatch_options(&self, only: &[String]) -> DispatchOptions {
        DispatchOptions {
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            run_timeout: Duration::from_secs(self.run_timeout_secs),
            workers: self.workers,
            selection: Selection::disabled(&self.disabled).only(only),
            obfuscate_networking: self.obfuscation.networking,
        }
    }

    pub fn budget(&self) -> PageBudget { PageBudget::new(self.page_limit, self.record_budget) }

    pub fn limiter(&self) -> RateLimiter { RateLimiter::new(self.rate_limit_qps, self.rate_limit_burst) }
}
