use std::net::SocketAddr;

use rustc_hash::FxHashMap;

use crate::{ConnectionHandle, ConnectionId};

/// Key a connection is published under
///
/// Normally one key per published CID; in address-routed modes a single key
/// made of the local port.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) enum Key {
    Cid(ConnectionId),
    Port(u16),
}

impl Key {
    /// The address-mode key is just the local port number
    pub(crate) fn from_local_addr(addr: &SocketAddr) -> Self {
        Self::Port(addr.port())
    }
}

/// Table mapping CIDs (or local ports) to connections
#[derive(Debug, Default)]
pub(crate) struct Registry {
    map: FxHashMap<Key, ConnectionHandle>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Publish `handle` under `key`; fails if the key is taken
    pub(crate) fn insert(&mut self, key: Key, handle: ConnectionHandle) -> Result<(), ()> {
        use std::collections::hash_map::Entry;
        match self.map.entry(key) {
            Entry::Occupied(_) => Err(()),
            Entry::Vacant(e) => {
                e.insert(handle);
                Ok(())
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &Key) -> Option<ConnectionHandle> {
        self.map.remove(key)
    }

    pub(crate) fn get(&self, key: &Key) -> Option<ConnectionHandle> {
        self.map.get(key).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Number of keys pointing at `handle`; queue membership audits only
    #[cfg(test)]
    pub(crate) fn count_of(&self, handle: ConnectionHandle) -> usize {
        self.map.values().filter(|&&h| h == handle).count()
    }
}
