//! Differentiation settings
//!
//! Settings can be overridden through the environment:
//! - `TILEGRAD_FORCE_ATOMIC=1`: every gradient scatter accumulates atomically
//! - `TILEGRAD_TIE_POLICY=all|split`: gradient routing for max/min reductions
//! - `TILEGRAD_MAX_UNROLL=<n>`: limit on unrolled loop iterations per trace
//! - `TILEGRAD_DUMP_DIR=<path>`: write rendered kernels for each specialization

use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::rules::TiePolicy;

/// How gradient scatters are committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScatterPolicy {
    /// Plain stores where injectivity can be certified, atomics elsewhere.
    #[default]
    Auto,
    ForceAtomic,
}

pub const DEFAULT_MAX_UNROLL: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffConfig {
    pub scatter: ScatterPolicy,
    pub tie_policy: TiePolicy,
    pub max_unroll: u64,
    pub dump_dir: Option<PathBuf>,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            scatter: ScatterPolicy::Auto,
            tie_policy: TiePolicy::RouteAll,
            max_unroll: DEFAULT_MAX_UNROLL,
            dump_dir: None,
        }
    }
}

impl DiffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = lookup("TILEGRAD_FORCE_ATOMIC") {
            if matches!(value.trim(), "1" | "true" | "yes") {
                config.scatter = ScatterPolicy::ForceAtomic;
            }
        }
        if let Some(value) = lookup("TILEGRAD_TIE_POLICY") {
            match value.trim() {
                "all" => config.tie_policy = TiePolicy::RouteAll,
                "split" => config.tie_policy = TiePolicy::Split,
                other => warn!("ignoring TILEGRAD_TIE_POLICY={other:?}, expected `all` or `split`"),
            }
        }
        if let Some(value) = lookup("TILEGRAD_MAX_UNROLL") {
            match value.trim().parse::<u64>() {
                Ok(limit) => config.max_unroll = limit,
                Err(_) => warn!("ignoring TILEGRAD_MAX_UNROLL={value:?}, expected an integer"),
            }
        }
        if let Some(dir) = lookup("TILEGRAD_DUMP_DIR") {
            if !dir.is_empty() {
                config.dump_dir = Some(PathBuf::from(dir));
            }
        }
        config
    }

    pub fn with_scatter(mut self, scatter: ScatterPolicy) -> Self {
        self.scatter = scatter;
        self
    }

    pub fn with_tie_policy(mut self, tie_policy: TiePolicy) -> Self {
        self.tie_policy = tie_policy;
        self
    }

    pub fn with_max_unroll(mut self, max_unroll: u64) -> Self {
        self.max_unroll = max_unroll;
        self
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DiffConfig::from_lookup(lookup(&[]));
        assert_eq!(config, DiffConfig::default());
        assert_eq!(config.max_unroll, 4096);
    }

    #[test]
    fn test_environment_overrides() {
        let config = DiffConfig::from_lookup(lookup(&[
            ("TILEGRAD_FORCE_ATOMIC", "1"),
            ("TILEGRAD_TIE_POLICY", "split"),
            ("TILEGRAD_MAX_UNROLL", "64"),
            ("TILEGRAD_DUMP_DIR", "/tmp/kernels"),
        ]));
        assert_eq!(config.scatter, ScatterPolicy::ForceAtomic);
        assert_eq!(config.tie_policy, TiePolicy::Split);
        assert_eq!(config.max_unroll, 64);
        assert_eq!(config.dump_dir, Some(PathBuf::from("/tmp/kernels")));
    }

    #[test]
    fn test_invalid_values_are_ignored() {
        let config = DiffConfig::from_lookup(lookup(&[
            ("TILEGRAD_TIE_POLICY", "random"),
            ("TILEGRAD_MAX_UNROLL", "lots"),
        ]));
        assert_eq!(config.tie_policy, TiePolicy::RouteAll);
        assert_eq!(config.max_unroll, DEFAULT_MAX_UNROLL);
    }

    #[test]
    fn test_builders() {
        let config = DiffConfig::new()
            .with_scatter(ScatterPolicy::ForceAtomic)
            .with_max_unroll(8)
            .with_dump_dir("out");
        assert_eq!(config.scatter, ScatterPolicy::ForceAtomic);
        assert_eq!(config.max_unroll, 8);
        assert_eq!(config.dump_dir, Some(PathBuf::from("out")));
    }
}
