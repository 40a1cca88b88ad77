use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;

use crate::layout::LayoutDescriptor;
use crate::memory::MemoryReader;

/// Length of the fixed type-name buffer stored per aggregation bucket.
pub const TYPE_NAME_LEN: usize = 64;

/// A NUL-padded, possibly truncated type name copied out of runtime memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeName([u8; TYPE_NAME_LEN]);

impl TypeName {
    pub const EMPTY: TypeName = TypeName([0; TYPE_NAME_LEN]);

    /// Builds a name from raw bytes, truncating to [`TYPE_NAME_LEN`].
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; TYPE_NAME_LEN];
        let n = bytes.len().min(TYPE_NAME_LEN);
        raw[..n].copy_from_slice(&bytes[..n]);
        Self(raw)
    }

    pub const fn from_array(raw: [u8; TYPE_NAME_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; TYPE_NAME_LEN] {
        &self.0
    }

    /// Bytes up to the first NUL.
    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(TYPE_NAME_LEN);
        &self.0[..end]
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.trimmed())
    }
}

impl Default for TypeName {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl From<&str> for TypeName {
    fn from(name: &str) -> Self {
        Self::from_bytes(name.as_bytes())
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}

impl fmt::Debug for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeName({:?})", self.to_string_lossy())
    }
}

impl Serialize for TypeName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string_lossy())
    }
}

/// Recovers type names from class handles with exactly two bounded reads.
///
/// 1. the pointer-sized `class_name` field at `class_handle + offset`
/// 2. `name_chars.size` bytes at `name_object + offset`
///
/// A failed first read leaves the whole name empty. A failed or short second read keeps
/// whatever prefix was copied and zeroes the rest. Nothing is retried and no error reaches
/// the caller.
#[derive(Debug, Clone)]
pub struct TypeNameResolver<M> {
    layout: LayoutDescriptor,
    memory: M,
}

impl<M: MemoryReader> TypeNameResolver<M> {
    pub fn new(layout: LayoutDescriptor, memory: M) -> Self {
        Self { layout, memory }
    }

    pub fn layout(&self) -> &LayoutDescriptor {
        &self.layout
    }

    pub fn resolve(&self, class_handle: u64) -> TypeName {
        let mut raw = [0u8; TYPE_NAME_LEN];

        let name_object = match self
            .memory
            .read_u64(class_handle.wrapping_add(self.layout.class_name.offset))
        {
            Ok(ptr) if ptr != 0 => ptr,
            _ => return TypeName::EMPTY,
        };

        let len = self.layout.name_chars.size.min(TYPE_NAME_LEN);
        let _ = self.memory.read(
            name_object.wrapping_add(self.layout.name_chars.offset),
            &mut raw[..len],
        );

        TypeName(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::RuntimeLayout;
    use crate::memory::SyntheticMemory;

    const KLASS: u64 = 0x10_000;
    const SYMBOL: u64 = 0x20_000;

    fn jdk8_heap(name: &[u8]) -> SyntheticMemory {
        let mut memory = SyntheticMemory::new().map(KLASS, 64).map(SYMBOL, 128);
        memory.write_u64(KLASS + 16, SYMBOL).unwrap();
        memory.write(SYMBOL + 8, name).unwrap();
        memory
    }

    #[test]
    fn resolves_name_through_klass_and_symbol() {
        let resolver = TypeNameResolver::new(
            RuntimeLayout::HotspotJdk8.descriptor(),
            jdk8_heap(b"java/lang/String"),
        );
        let name = resolver.resolve(KLASS);
        assert_eq!(name.to_string_lossy(), "java/lang/String");
        assert_eq!(name.as_bytes()[16..], [0u8; 48]);
    }

    #[test]
    fn long_names_are_truncated_to_buffer() {
        let long = [b'x'; 100];
        let mut memory = SyntheticMemory::new().map(KLASS, 64).map(SYMBOL, 256);
        memory.write_u64(KLASS + 16, SYMBOL).unwrap();
        memory.write(SYMBOL + 8, &long).unwrap();

        let resolver = TypeNameResolver::new(RuntimeLayout::HotspotJdk8.descriptor(), memory);
        let name = resolver.resolve(KLASS);
        assert_eq!(name.trimmed().len(), TYPE_NAME_LEN);
    }

    #[test]
    fn unmapped_class_handle_yields_empty_name() {
        let resolver =
            TypeNameResolver::new(RuntimeLayout::HotspotJdk8.descriptor(), jdk8_heap(b"Foo"));
        assert!(resolver.resolve(0xdead_0000).is_empty());
        assert!(resolver.resolve(0).is_empty());
    }

    #[test]
    fn dangling_name_pointer_yields_empty_name() {
        let mut memory = SyntheticMemory::new().map(KLASS, 64);
        memory.write_u64(KLASS + 16, 0x7777_0000).unwrap();
        let resolver = TypeNameResolver::new(RuntimeLayout::HotspotJdk8.descriptor(), memory);
        assert_eq!(resolver.resolve(KLASS), TypeName::EMPTY);
    }

    #[test]
    fn name_running_into_unmapped_memory_keeps_prefix() {
        let mut memory = SyntheticMemory::new().map(KLASS, 64).map(SYMBOL, 14);
        memory.write_u64(KLASS + 16, SYMBOL).unwrap();
        memory.write(SYMBOL + 8, b"Foo\x01\x02\x03").unwrap();

        let resolver = TypeNameResolver::new(RuntimeLayout::HotspotJdk8.descriptor(), memory);
        let name = resolver.resolve(KLASS);
        assert_eq!(&name.as_bytes()[..6], b"Foo\x01\x02\x03");
        assert!(name.as_bytes()[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn layout_offsets_are_honoured() {
        let mut memory = SyntheticMemory::new().map(KLASS, 64).map(SYMBOL, 128);
        memory.write_u64(KLASS + 24, SYMBOL).unwrap();
        memory.write(SYMBOL + 6, b"[I").unwrap();

        let resolver = TypeNameResolver::new(RuntimeLayout::HotspotJdk17.descriptor(), &memory);
        assert_eq!(resolver.resolve(KLASS).to_string_lossy(), "[I");

        let jdk8 = TypeNameResolver::new(RuntimeLayout::HotspotJdk8.descriptor(), &memory);
        assert!(jdk8.resolve(KLASS).is_empty());
    }

    #[test]
    fn serializes_as_trimmed_string() {
        let json = serde_json::to_string(&TypeName::from("java/util/HashMap")).unwrap();
        assert_eq!(json, "\"java/util/HashMap\"");
    }
}
