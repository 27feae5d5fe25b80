//! Statement registry: which connection currently owns each statement name.
//!
//! Backed by a sharded [`DashMap`], so registering or removing one name
//! never waits on statements living in other shards. A name maps to at
//! most one connection; removal is compare-and-remove so a late cleanup
//! cannot evict a newer registration.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{ClientError, Result};
use crate::lifecycle::ConnectionHandle;
use crate::message::StatementName;

#[derive(Default)]
pub struct StatementRegistry {
    entries: DashMap<StatementName, ConnectionHandle>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` unless another connection already owns it.
    pub fn put_if_absent(&self, name: StatementName, conn: ConnectionHandle) -> Result<()> {
        match self.entries.entry(name) {
            Entry::Occupied(occupied) => {
                Err(ClientError::DuplicateStatement(occupied.key().to_string()))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(conn);
                Ok(())
            }
        }
    }

    /// The connection pinned to `name`.
    pub fn get(&self, name: &StatementName) -> Option<ConnectionHandle> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    /// Remove `name` only if it is still pinned to `conn`.
    pub fn remove_if_matches(&self, name: &StatementName, conn: &ConnectionHandle) -> bool {
        self.entries
            .remove_if(name, |_, pinned| pinned.id() == conn.id())
            .is_some()
    }

    pub fn contains(&self, name: &StatementName) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
