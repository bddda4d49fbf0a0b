//! World configuration.

use serde::{Deserialize, Serialize};

use crate::component::Phase;

/// Sizing and execution settings for a [`World`](crate::World).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Slots per storage block, unless a kind overrides it.
    pub block_size: usize,
    /// Ceiling on live objects.
    pub max_objects: usize,
    /// Ceiling on live components per kind, unless a kind overrides it.
    pub max_components_per_kind: usize,
    /// Run independent managers on the worker pool.
    pub parallel: bool,
    /// Worker pool size. 0 lets rayon pick.
    pub worker_threads: usize,
    /// Phases run each frame, in order.
    pub phases: Vec<Phase>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            block_size: 64,
            max_objects: 1 << 20,
            max_components_per_kind: 1 << 20,
            parallel: true,
            worker_threads: 0,
            phases: Phase::ALL.to_vec(),
        }
    }
}

impl WorldConfig {
    /// Defaults overlaid with `SCENE_WORKER_THREADS`, `SCENE_PARALLEL`,
    /// `SCENE_BLOCK_SIZE` and `SCENE_MAX_OBJECTS`. Unparsable values are
    /// logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(threads) = override_var(&lookup, "SCENE_WORKER_THREADS", |v| v.parse().ok()) {
            self.worker_threads = threads;
        }
        if let Some(parallel) = override_var(&lookup, "SCENE_PARALLEL", parse_flag) {
            self.parallel = parallel;
        }
        if let Some(block_size) = override_var(&lookup, "SCENE_BLOCK_SIZE", |v| {
            v.parse().ok().filter(|&size: &usize| size > 0)
        }) {
            self.block_size = block_size;
        }
        if let Some(max_objects) = override_var(&lookup, "SCENE_MAX_OBJECTS", |v| v.parse().ok()) {
            self.max_objects = max_objects;
        }
        self
    }

    /// Single-threaded execution.
    #[must_use]
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }
}

fn override_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "ignoring invalid environment override");
    }
    parsed
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
