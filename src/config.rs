//! Cache configuration

use std::time::Duration;

use serde::Deserialize;

use crate::CacheError;
use crate::patterns::{Pattern, ResourceStrategyBinding};

/// Thresholds used by `optimize_strategy` to rebind a resource from observed traffic
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Minimum reads + writes before a resource is considered for rebinding
    pub min_samples: u64,
    /// Read share at or above which reads switch to read-through
    pub high_read_ratio: f64,
    /// Write share at or above which writes switch to write-back
    pub high_write_ratio: f64,
    /// Hit rate below which a write-heavy resource stops populating the cache
    pub low_hit_rate: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_samples: 100,
            high_read_ratio: 0.8,
            high_write_ratio: 0.6,
            low_hit_rate: 0.2,
        }
    }
}

/// Configuration for the caching engine
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Connection URL of the shared Redis backend
    pub redis_url: String,
    /// TTL used when a caller does not pass one
    pub default_ttl: Duration,
    /// Share of the TTL after which an entry is considered stale (soft expiry)
    pub soft_ttl_ratio: f64,
    /// Failures before the circuit opens
    pub circuit_threshold: u32,
    /// Time the circuit stays open before it closes again
    pub circuit_cooldown: Duration,
    /// Serialized size above which payloads are gzip-compressed
    pub compression_threshold: usize,
    /// Encoded size above which entries are not cached at all
    pub max_entry_size: usize,
    /// Share of the TTL after which a background refresh re-populates the key
    pub background_refresh_fraction: f64,
    /// Consumed share of the soft lifetime at which refresh-ahead kicks in
    pub refresh_threshold: f64,
    /// Per-call timeout applied to backend requests
    pub backend_timeout: Duration,
    /// Pub/sub channel carrying invalidation events
    pub invalidation_channel: String,
    /// Publish and subscribe to invalidation events
    pub enable_pubsub: bool,
    /// Maximum number of entries in the process-local level
    pub l1_max_capacity: u64,
    /// Time-to-live for process-local entries
    pub l1_ttl: Duration,
    /// Bounded queue size for background jobs
    pub task_queue_capacity: usize,
    /// Resource bindings seeded into the strategy table
    pub strategies: Vec<ResourceStrategyBinding>,
    /// Read pattern for resources without a binding
    pub fallback_read_pattern: Pattern,
    /// Write pattern for resources without a binding
    pub fallback_write_pattern: Pattern,
    pub optimizer: OptimizerConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_owned(),
            default_ttl: Duration::from_secs(300), // 5 minutes
            soft_ttl_ratio: 0.9,
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
            compression_threshold: 100 * 1024,
            max_entry_size: 1024 * 1024,
            background_refresh_fraction: 0.75,
            refresh_threshold: 0.75,
            backend_timeout: Duration::from_secs(2),
            invalidation_channel: "cache:invalidation".to_owned(),
            enable_pubsub: true,
            l1_max_capacity: 10_000,
            l1_ttl: Duration::from_secs(60),
            task_queue_capacity: 1024,
            strategies: default_strategies(),
            fallback_read_pattern: Pattern::CacheAside,
            fallback_write_pattern: Pattern::WriteThrough,
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// Bindings for the resources served by the platform
pub fn default_strategies() -> Vec<ResourceStrategyBinding> {
    vec![
        ResourceStrategyBinding::new("course", Pattern::RefreshAhead, Pattern::WriteThrough),
        ResourceStrategyBinding::new("assessment", Pattern::ReadThrough, Pattern::WriteThrough),
        ResourceStrategyBinding::new("content", Pattern::Hierarchical, Pattern::WriteAround),
        ResourceStrategyBinding::new("enrollment", Pattern::CacheAside, Pattern::WriteBack),
        ResourceStrategyBinding::new("user", Pattern::CacheAside, Pattern::WriteThrough),
    ]
}

/// Values read from `CACHE_*` environment variables; unset fields keep defaults
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    redis_url: Option<String>,
    default_ttl_secs: Option<u64>,
    soft_ttl_ratio: Option<f64>,
    circuit_threshold: Option<u32>,
    circuit_cooldown_secs: Option<u64>,
    compression_threshold: Option<usize>,
    max_entry_size: Option<usize>,
    background_refresh_fraction: Option<f64>,
    refresh_threshold: Option<f64>,
    backend_timeout_ms: Option<u64>,
    invalidation_channel: Option<String>,
    enable_pubsub: Option<bool>,
    l1_max_capacity: Option<u64>,
    l1_ttl_secs: Option<u64>,
    task_queue_capacity: Option<usize>,
    strategies: Option<String>,
}

impl CacheConfig {
    /// Load configuration from `CACHE_*` environment variables on top of the defaults.
    ///
    /// `CACHE_STRATEGIES` takes a table such as
    /// `course=refresh-ahead/write-through,content=hierarchical/write-around`;
    /// listed resources replace their default binding.
    pub fn from_env() -> Result<Self, CacheError> {
        let overrides: EnvOverrides = config::Config::builder()
            .add_source(config::Environment::with_prefix("CACHE").try_parsing(true))
            .build()?
            .try_deserialize()?;

        let mut cfg = Self::default();
        cfg.apply(overrides)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply(&mut self, env: EnvOverrides) -> Result<(), CacheError> {
        if let Some(v) = env.redis_url {
            self.redis_url = v;
        }
        if let Some(v) = env.default_ttl_secs {
            self.default_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env.soft_ttl_ratio {
            self.soft_ttl_ratio = v;
        }
        if let Some(v) = env.circuit_threshold {
            self.circuit_threshold = v;
        }
        if let Some(v) = env.circuit_cooldown_secs {
            self.circuit_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = env.compression_threshold {
            self.compression_threshold = v;
        }
        if let Some(v) = env.max_entry_size {
            self.max_entry_size = v;
        }
        if let Some(v) = env.background_refresh_fraction {
            self.background_refresh_fraction = v;
        }
        if let Some(v) = env.refresh_threshold {
            self.refresh_threshold = v;
        }
        if let Some(v) = env.backend_timeout_ms {
            self.backend_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env.invalidation_channel {
            self.invalidation_channel = v;
        }
        if let Some(v) = env.enable_pubsub {
            self.enable_pubsub = v;
        }
        if let Some(v) = env.l1_max_capacity {
            self.l1_max_capacity = v;
        }
        if let Some(v) = env.l1_ttl_secs {
            self.l1_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env.task_queue_capacity {
            self.task_queue_capacity = v;
        }
        if let Some(table) = env.strategies {
            for binding in parse_strategy_table(&table)? {
                self.strategies.retain(|b| b.resource != binding.resource);
                self.strategies.push(binding);
            }
        }
        Ok(())
    }

    /// Reject values that would make the engine misbehave silently
    pub fn validate(&self) -> Result<(), CacheError> {
        let unit = |name: &str, v: f64| {
            if v > 0.0 && v <= 1.0 {
                Ok(())
            } else {
                Err(config::ConfigError::Message(format!(
                    "{name} must be in (0, 1], got {v}"
                )))
            }
        };
        unit("soft_ttl_ratio", self.soft_ttl_ratio)?;
        unit("background_refresh_fraction", self.background_refresh_fraction)?;
        unit("refresh_threshold", self.refresh_threshold)?;

        if self.circuit_threshold == 0 {
            return Err(config::ConfigError::Message(
                "circuit_threshold must be at least 1".to_owned(),
            )
            .into());
        }
        if self.task_queue_capacity == 0 {
            return Err(config::ConfigError::Message(
                "task_queue_capacity must be at least 1".to_owned(),
            )
            .into());
        }
        for binding in &self.strategies {
            binding.check()?;
        }
        Ok(())
    }
}

/// Parse `resource=read/write` pairs separated by commas
pub fn parse_strategy_table(table: &str) -> Result<Vec<ResourceStrategyBinding>, CacheError> {
    table
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (resource, patterns) = entry.split_once('=').ok_or_else(|| {
                CacheError::InvalidStrategy(format!("missing '=' in strategy entry '{entry}'"))
            })?;
            let (read, write) = patterns.split_once('/').ok_or_else(|| {
                CacheError::InvalidStrategy(format!("missing '/' in strategy entry '{entry}'"))
            })?;
            let binding = ResourceStrategyBinding::new(
                resource.trim(),
                read.trim().parse()?,
                write.trim().parse()?,
            );
            binding.check()?;
            Ok(binding)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = CacheConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.circuit_threshold, 5);
        assert_eq!(cfg.compression_threshold, 102_400);
        assert_eq!(cfg.max_entry_size, 1_048_576);
    }

    #[test]
    fn parses_strategy_table() {
        let table = parse_strategy_table(
            "course = read-through/write-back, content=hierarchical/write-around,",
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].resource, "course");
        assert_eq!(table[0].read_pattern, Pattern::ReadThrough);
        assert_eq!(table[0].write_pattern, Pattern::WriteBack);
        assert_eq!(table[1].read_pattern, Pattern::Hierarchical);
    }

    #[test]
    fn rejects_unknown_or_misplaced_patterns() {
        assert!(matches!(
            parse_strategy_table("course=lru/write-through"),
            Err(CacheError::InvalidStrategy(_))
        ));
        assert!(matches!(
            parse_strategy_table("course=write-back/write-through"),
            Err(CacheError::InvalidStrategy(_))
        ));
        assert!(parse_strategy_table("course").is_err());
    }

    #[test]
    fn env_overrides_replace_bindings() {
        let mut cfg = CacheConfig::default();
        cfg.apply(EnvOverrides {
            default_ttl_secs: Some(30),
            strategies: Some("course=cache-aside/write-around".to_owned()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(cfg.default_ttl, Duration::from_secs(30));
        let course: Vec<_> = cfg.strategies.iter().filter(|b| b.resource == "course").collect();
        assert_eq!(course.len(), 1);
        assert_eq!(course[0].read_pattern, Pattern::CacheAside);
        assert_eq!(course[0].write_pattern, Pattern::WriteAround);
    }

    #[test]
    fn rejects_out_of_range_ratios() {
        let cfg = CacheConfig {
            soft_ttl_ratio: 0.0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(CacheError::Config(_))));
    }
}
