//! Object layout descriptors for the monitored runtime.
//!
//! Type names are recovered by following `class handle -> name object -> inline
//! characters`. The byte offsets of those two hops are properties of a specific runtime
//! build and are kept here rather than in the resolver, so a new runtime version only needs
//! a new descriptor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::type_name::TYPE_NAME_LEN;

/// Byte offset and size of one field inside an opaque runtime object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLayout {
    pub offset: u64,
    pub size: usize,
}

impl FieldLayout {
    pub const fn new(offset: u64, size: usize) -> Self {
        Self { offset, size }
    }
}

/// Where the type name lives relative to a class handle.
///
/// * `class_name` - the pointer-sized field of the class descriptor that points at the
///   name object (HotSpot: `Klass::_name`, a `Symbol*`)
/// * `name_chars` - the inline character buffer inside the name object (HotSpot:
///   `Symbol::_body`); `size` is how many bytes are copied, at most [`TYPE_NAME_LEN`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutDescriptor {
    pub class_name: FieldLayout,
    pub name_chars: FieldLayout,
}

impl LayoutDescriptor {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.class_name.size != 8 {
            return Err(ConfigError::InvalidLayout(format!(
                "class_name must be an 8-byte pointer, got {} bytes",
                self.class_name.size
            )));
        }
        if self.name_chars.size == 0 || self.name_chars.size > TYPE_NAME_LEN {
            return Err(ConfigError::InvalidLayout(format!(
                "name_chars size must be within 1..={}, got {}",
                TYPE_NAME_LEN, self.name_chars.size
            )));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let layout: Self = serde_json::from_str(json)?;
        layout.validate()?;
        Ok(layout)
    }
}

impl Default for LayoutDescriptor {
    fn default() -> Self {
        RuntimeLayout::default().descriptor()
    }
}

/// Known runtime builds with a verified descriptor.
///
/// These are version-fragile by construction: the offsets follow the in-memory layout of
/// HotSpot's `Klass` and `Symbol` classes, which changes between major releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeLayout {
    /// `Klass::_name` at +16, `Symbol::_body` at +8.
    #[default]
    HotspotJdk8,
    /// `Klass::_name` at +16, `Symbol::_body` at +6 (u4 hash/refcount, u2 length).
    HotspotJdk11,
    /// `Klass::_name` at +24 (`_id` and `_vtable_len` precede it), `Symbol::_body` at +6.
    HotspotJdk17,
}

impl RuntimeLayout {
    pub const ALL: [RuntimeLayout; 3] = [
        RuntimeLayout::HotspotJdk8,
        RuntimeLayout::HotspotJdk11,
        RuntimeLayout::HotspotJdk17,
    ];

    pub fn descriptor(self) -> LayoutDescriptor {
        let (class_name, name_chars) = match self {
            RuntimeLayout::HotspotJdk8 => (16, 8),
            RuntimeLayout::HotspotJdk11 => (16, 6),
            RuntimeLayout::HotspotJdk17 => (24, 6),
        };
        LayoutDescriptor {
            class_name: FieldLayout::new(class_name, 8),
            name_chars: FieldLayout::new(name_chars, TYPE_NAME_LEN),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeLayout::HotspotJdk8 => "hotspot-jdk8",
            RuntimeLayout::HotspotJdk11 => "hotspot-jdk11",
            RuntimeLayout::HotspotJdk17 => "hotspot-jdk17",
        }
    }
}

impl fmt::Display for RuntimeLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RuntimeLayout {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuntimeLayout::ALL
            .into_iter()
            .find(|layout| layout.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownRuntime(s.to_string()))
    }
}
