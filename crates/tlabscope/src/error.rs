use thiserror::Error;

/// Errors raised while resolving an [`AggregatorConfig`](crate::AggregatorConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown runtime layout `{0}` (expected one of: hotspot-jdk8, hotspot-jdk11, hotspot-jdk17)")]
    UnknownRuntime(String),

    #[error("unknown report format `{0}` (expected one of: table, text, json, json-pretty)")]
    UnknownFormat(String),

    #[error("{field} must be greater than zero")]
    ZeroCapacity { field: &'static str },

    #[error("stack depth {depth} is out of range (1..={max})")]
    StackDepth { depth: usize, max: usize },

    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("invalid value `{value}` for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the process-wide hook registry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallError {
    #[error("an aggregator is already installed; uninstall it first")]
    AlreadyInstalled,
}

/// A raw memory read that touched unmapped or inaccessible memory.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unreadable memory at {addr:#x}")]
pub struct ReadFault {
    pub addr: u64,
}
