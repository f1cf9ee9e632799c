//! Configuration surface for the keys spec.md §6 names by convention
//! (`WORK_QUEUEING_POLICY.<phase>.<stage>`, `NUM_WORKERS.<phase>.<stage>`,
//! `ALLOCATOR_CAPACITY`, the caching-allocator keys). The dotted-key
//! naming maps onto nested structs deserialized with `serde` + `toml`,
//! modeled on the teacher's `common/config` crate (`config.rs`,
//! `toml_config.rs`): a typed root struct loaded in one shot rather than
//! looked up key-by-key at each call site.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Result, ThemisError};
use crate::policy::QueueingPolicyKind;

/// `ALLOCATOR_CAPACITY` / `ALLOCATOR_FRAGMENTATION_SLEEP` (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct AllocatorConfig {
    /// Total byte budget shared across all stages.
    pub capacity_bytes: u64,
    /// Microseconds to sleep after a failed real-memory allocation before
    /// retrying (spec §4.4.2).
    #[serde(default = "default_fragmentation_sleep_micros")]
    pub fragmentation_sleep_micros: u64,
}

fn default_fragmentation_sleep_micros() -> u64 {
    1000
}

/// `CACHING_ALLOCATOR.<phase>.<stage>` and its sibling keys (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct CachingAllocatorConfig {
    /// `CACHED_MEMORY.<phase>.<stage>`: total bytes to preallocate.
    pub cached_memory_bytes: u64,
    /// `DEFAULT_BUFFER_SIZE.<phase>.<stage>`: size of each lent buffer.
    pub default_buffer_size_bytes: u64,
    /// `ALIGNMENT.<phase>.<stage>`, optional.
    #[serde(default)]
    pub alignment_bytes: Option<u64>,
}

/// `NUM_WORKERS.<phase>.<stage>` / `WORKER_IMPLS.<phase>.<stage>` /
/// `WORK_QUEUEING_POLICY.<phase>.<stage>` (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Number of parallel workers for this stage. Must be positive.
    pub num_workers: usize,
    /// Key the worker factory resolves to a constructor.
    pub worker_impl: String,
    /// Which queueing policy routes work units to this stage's workers.
    #[serde(default)]
    pub queueing_policy: QueueingPolicyKind,
    /// Present iff `CACHING_ALLOCATOR.<phase>.<stage>` is set.
    #[serde(default)]
    pub caching_allocator: Option<CachingAllocatorConfig>,
}

/// All stages for one phase.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhaseConfig {
    /// Stage name -> its configuration.
    #[serde(default)]
    pub stages: HashMap<String, StageConfig>,
}

/// The root configuration object: one allocator budget shared by every
/// phase, plus per-phase stage tables.
#[derive(Debug, Clone, Deserialize)]
pub struct ThemisConfig {
    /// The central allocator's configuration.
    pub allocator: AllocatorConfig,
    /// Phase name -> its stage table.
    #[serde(default)]
    pub phases: HashMap<String, PhaseConfig>,
}

impl ThemisConfig {
    /// Parse a TOML document into a `ThemisConfig`.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|err| ThemisError::Config(err.to_string()))
    }

    /// Look up `(phase, stage)`'s configuration, the Rust-native
    /// equivalent of resolving `NUM_WORKERS.<phase>.<stage>` etc.
    pub fn stage(&self, phase: &str, stage: &str) -> Result<&StageConfig> {
        self.phases
            .get(phase)
            .and_then(|p| p.stages.get(stage))
            .ok_or_else(|| ThemisError::Config(format!("missing stage config {phase}.{stage}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [allocator]
        capacity_bytes = 1073741824
        fragmentation_sleep_micros = 500

        [phases.sort.stages.mapper]
        num_workers = 4
        worker_impl = "default_mapper"
        queueing_policy = "partitioned"

        [phases.sort.stages.reducer]
        num_workers = 2
        worker_impl = "default_reducer"

        [phases.sort.stages.reducer.caching_allocator]
        cached_memory_bytes = 67108864
        default_buffer_size_bytes = 1048576
    "#;

    #[test]
    fn parses_nested_dotted_keys_into_stage_configs() {
        let config = ThemisConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.allocator.capacity_bytes, 1073741824);
        assert_eq!(config.allocator.fragmentation_sleep_micros, 500);

        let mapper = config.stage("sort", "mapper").unwrap();
        assert_eq!(mapper.num_workers, 4);
        assert_eq!(mapper.queueing_policy, QueueingPolicyKind::Partitioned);
        assert!(mapper.caching_allocator.is_none());

        let reducer = config.stage("sort", "reducer").unwrap();
        assert_eq!(reducer.queueing_policy, QueueingPolicyKind::Shared);
        let caching = reducer.caching_allocator.as_ref().unwrap();
        assert_eq!(caching.cached_memory_bytes, 67108864);
    }

    #[test]
    fn missing_fragmentation_sleep_falls_back_to_default() {
        let config = ThemisConfig::from_toml_str(
            r#"
            [allocator]
            capacity_bytes = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.allocator.fragmentation_sleep_micros, 1000);
    }

    #[test]
    fn unknown_stage_is_a_config_error() {
        let config = ThemisConfig::from_toml_str(SAMPLE).unwrap();
        let err = config.stage("sort", "nonexistent").unwrap_err();
        assert!(matches!(err, ThemisError::Config(_)));
    }
}
