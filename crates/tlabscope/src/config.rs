use serde::{Deserialize, Serialize};

use crate::aggregator::Verdict;
use crate::error::ConfigError;
use crate::layout::{LayoutDescriptor, RuntimeLayout};
use crate::stack::{DEFAULT_STACK_CAPACITY, MAX_STACK_DEPTH};
use crate::table::DEFAULT_TABLE_CAPACITY;

pub const ENV_RUNTIME: &str = "TLABSCOPE_RUNTIME";
pub const ENV_TABLE_CAPACITY: &str = "TLABSCOPE_TABLE_CAPACITY";
pub const ENV_STACK_CAPACITY: &str = "TLABSCOPE_STACK_CAPACITY";
pub const ENV_STACK_DEPTH: &str = "TLABSCOPE_STACK_DEPTH";
pub const ENV_FORWARD: &str = "TLABSCOPE_FORWARD";

/// Plain-data form of every [`AggregatorBuilder`](crate::AggregatorBuilder) setting.
///
/// Missing JSON fields take their defaults:
///
/// ```rust
/// use tlabscope::{AggregatorConfig, RuntimeLayout};
///
/// let config = AggregatorConfig::from_json(r#"{ "runtime": "hotspot-jdk17" }"#).unwrap();
/// assert_eq!(config.runtime, RuntimeLayout::HotspotJdk17);
/// assert_eq!(config.table_capacity, 10240);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub runtime: RuntimeLayout,
    /// Overrides `runtime` when set.
    pub layout: Option<LayoutDescriptor>,
    pub stack_capacity: usize,
    pub stack_depth: usize,
    pub table_capacity: usize,
    pub verdict: Verdict,
    pub process_id: Option<u32>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeLayout::default(),
            layout: None,
            stack_capacity: DEFAULT_STACK_CAPACITY,
            stack_depth: MAX_STACK_DEPTH,
            table_capacity: DEFAULT_TABLE_CAPACITY,
            verdict: Verdict::Suppress,
            process_id: None,
        }
    }
}

impl AggregatorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Effective layout: the custom descriptor if any, else the runtime preset.
    pub fn layout(&self) -> LayoutDescriptor {
        self.layout.unwrap_or_else(|| self.runtime.descriptor())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                field: "stack_capacity",
            });
        }
        if self.table_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                field: "table_capacity",
            });
        }
        if self.stack_depth == 0 || self.stack_depth > MAX_STACK_DEPTH {
            return Err(ConfigError::StackDepth {
                depth: self.stack_depth,
                max: MAX_STACK_DEPTH,
            });
        }
        self.layout().validate()
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|var| std::env::var(var).ok())
    }

    /// Overrides settings from `TLABSCOPE_*` variables resolved through `lookup`.
    ///
    /// A runtime preset from the environment also clears a custom layout.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_RUNTIME) {
            self.runtime = value.parse()?;
            self.layout = None;
            tracing::debug!(target: "tlabscope::config", runtime = %self.runtime, "runtime from {}", ENV_RUNTIME);
        }
        if let Some(value) = lookup(ENV_TABLE_CAPACITY) {
            self.table_capacity = parse_usize(ENV_TABLE_CAPACITY, value)?;
        }
        if let Some(value) = lookup(ENV_STACK_CAPACITY) {
            self.stack_capacity = parse_usize(ENV_STACK_CAPACITY, value)?;
        }
        if let Some(value) = lookup(ENV_STACK_DEPTH) {
            self.stack_depth = parse_usize(ENV_STACK_DEPTH, value)?;
        }
        if let Some(value) = lookup(ENV_FORWARD) {
            self.verdict = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Verdict::Forward,
                "0" | "false" | "no" | "off" => Verdict::Suppress,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: ENV_FORWARD,
                        value,
                    })
                }
            };
        }
        Ok(())
    }
}

fn parse_usize(var: &'static str, value: String) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_match_table_sizes() {
        let config = AggregatorConfig::default();
        assert_eq!(config.stack_capacity, 8192);
        assert_eq!(config.table_capacity, 10240);
        assert_eq!(config.stack_depth, 127);
        assert_eq!(config.verdict, Verdict::Suppress);
        assert_eq!(config.layout(), RuntimeLayout::HotspotJdk8.descriptor());
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_builder_values() {
        let mut config = AggregatorConfig {
            layout: Some(RuntimeLayout::HotspotJdk17.descriptor()),
            ..AggregatorConfig::default()
        };
        config
            .apply_env_with(env(&[
                (ENV_RUNTIME, "HotSpot-JDK11"),
                (ENV_TABLE_CAPACITY, "512"),
                (ENV_STACK_DEPTH, " 32 "),
                (ENV_FORWARD, "true"),
            ]))
            .unwrap();

        assert_eq!(config.runtime, RuntimeLayout::HotspotJdk11);
        assert_eq!(config.layout, None);
        assert_eq!(config.table_capacity, 512);
        assert_eq!(config.stack_depth, 32);
        assert_eq!(config.stack_capacity, 8192);
        assert_eq!(config.verdict, Verdict::Forward);
    }

    #[test]
    fn malformed_env_values_are_errors() {
        let mut config = AggregatorConfig::default();
        let err = config
            .apply_env_with(env(&[(ENV_TABLE_CAPACITY, "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                var: ENV_TABLE_CAPACITY,
                ..
            }
        ));
        assert!(config
            .apply_env_with(env(&[(ENV_FORWARD, "maybe")]))
            .is_err());
        assert!(config
            .apply_env_with(env(&[(ENV_RUNTIME, "openj9")]))
            .is_err());
    }

    #[test]
    fn depth_is_bounded() {
        let config = AggregatorConfig {
            stack_depth: 128,
            ..AggregatorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::StackDepth { depth: 128, max: 127 })
        ));
    }

    #[test]
    fn json_with_custom_layout() {
        let config = AggregatorConfig::from_json(
            r#"{
                "layout": {
                    "class_name": { "offset": 40, "size": 8 },
                    "name_chars": { "offset": 6, "size": 64 }
                },
                "verdict": "forward",
                "process_id": 99
            }"#,
        )
        .unwrap();
        assert_eq!(config.layout().class_name.offset, 40);
        assert_eq!(config.verdict, Verdict::Forward);
        assert_eq!(config.process_id, Some(99));

        assert!(matches!(
            AggregatorConfig::from_json("{ not json"),
            Err(ConfigError::Json(_))
        ));
        assert!(AggregatorConfig::from_json(r#"{ "table_capacity": 0 }"#).is_err());
    }
}
