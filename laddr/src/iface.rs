// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network interface handles.
//!
//! Local addresses are bound to an interface; the rest of the crate only
//! needs a cheap copyable handle, resolved once from the operator-supplied
//! name at configuration time.

use std::collections::HashMap;
use std::fmt;

/// Opaque handle to a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IfaceId(u32);

impl fmt::Display for IfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if#{}", self.0)
    }
}

/// Name-to-handle registry, populated at device bring-up.
#[derive(Debug, Default)]
pub struct IfaceTable {
    by_name: HashMap<String, IfaceId>,
    next: u32,
}

impl IfaceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` if unseen and returns its handle.
    pub fn register(&mut self, name: &str) -> IfaceId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = IfaceId(self.next);
        self.next += 1;
        self.by_name.insert(name.to_string(), id);
        id
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<IfaceId> {
        self.by_name.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let mut table = IfaceTable::new();
        let eth0 = table.register("eth0");
        let eth1 = table.register("eth1");
        assert_ne!(eth0, eth1);
        assert_eq!(table.register("eth0"), eth0);
        assert_eq!(table.lookup("eth1"), Some(eth1));
        assert_eq!(table.lookup("bond0"), None);
    }
}
