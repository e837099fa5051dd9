//! Stream scope tracking
//!
//! While an input-stream clause is being built, every stream identifier
//! (and join alias or pattern event reference) that comes into scope is
//! recorded here, verbatim. Inner streams keep their `#` prefix so that
//! `#name` lookups can tell an inner-stream reference from a function
//! call. The scope is owned by the builder and cleared at well-defined
//! boundaries: the end of each query and each partition-with clause, and
//! swapped out wholesale around anonymous query compilation.

use std::collections::HashSet;

#[derive(Debug, Default, Clone)]
pub struct StreamScope {
    active: HashSet<String>,
}

impl StreamScope {
    pub fn new() -> Self {
        StreamScope::default()
    }

    pub fn declare(&mut self, name: impl Into<String>) {
        self.active.insert(name.into());
    }

    pub fn remove(&mut self, name: &str) {
        self.active.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.active.contains(name)
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}
