//! Process-wide string interning pool.
//!
//! Every column of text storage stores a 32-bit [`StringId`] rather than an
//! owned `String`; the pool is the single place that owns the bytes. Id `0`
//! is reserved for the null/empty string, matching `StringPool::Id::Null()`
//! in the source engine this is modeled on.

use std::collections::HashMap;

/// A stable identifier into a [`StringPool`]. Valid for the lifetime of the
/// pool that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StringId(u32);

impl StringId {
    pub const NULL: StringId = StringId(0);

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Append-only string interner. Single-writer: `intern` takes `&mut self`,
/// while `resolve`/`get` are read-only and may be called freely once interior
/// mutability is no longer required by the caller (the engine serializes
/// writes by construction, see the concurrency notes in the crate root).
#[derive(Debug, Default)]
pub struct StringPool {
    strings: Vec<Box<str>>,
    index: HashMap<Box<str>, StringId>,
}

impl StringPool {
    pub fn new() -> Self {
        let mut pool = Self {
            strings: Vec::new(),
            index: HashMap::new(),
        };
        // Reserve id 0 for null/empty so every other id is strictly positive.
        let empty: Box<str> = "".into();
        pool.index.insert(empty.clone(), StringId(0));
        pool.strings.push(empty);
        pool
    }

    /// Interns `value`, returning its stable id. Interning the same bytes
    /// twice always returns the same id.
    pub fn intern(&mut self, value: &str) -> StringId {
        if value.is_empty() {
            return StringId::NULL;
        }
        if let Some(id) = self.index.get(value) {
            return *id;
        }
        let id = StringId(self.strings.len() as u32);
        let boxed: Box<str> = value.into();
        self.strings.push(boxed.clone());
        self.index.insert(boxed, id);
        id
    }

    /// Resolves a previously-interned id back to its bytes. Panics if `id`
    /// was never returned by this pool: a foreign id is a programming error,
    /// not a recoverable one.
    pub fn resolve(&self, id: StringId) -> &str {
        self.strings
            .get(id.0 as usize)
            .unwrap_or_else(|| panic!("string id {} not present in this pool", id.0))
    }

    pub fn null_id(&self) -> StringId {
        StringId::NULL
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_bytes_returns_same_id() {
        let mut pool = StringPool::new();
        let a = pool.intern("hello");
        let b = pool.intern("hello");
        assert_eq!(a, b);
        assert_eq!(pool.resolve(a), "hello");
    }

    #[test]
    fn empty_string_maps_to_null_id() {
        let mut pool = StringPool::new();
        assert_eq!(pool.intern(""), StringId::NULL);
        assert!(StringId::NULL.is_null());
    }

    #[test]
    fn distinct_strings_get_distinct_ids() {
        let mut pool = StringPool::new();
        let a = pool.intern("foo");
        let b = pool.intern("bar");
        assert_ne!(a, b);
    }
}
