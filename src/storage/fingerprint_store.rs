//! Fingerprint Store (C1). Maps a connection's remote address to the JA3/
//! JA4 fingerprint captured from its TLS ClientHello. The only component
//! that persists the fingerprint past the handshake; request scope reads
//! it once, copied into the `X-JA4` internal header (§4.1).

use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;

use crate::models::fingerprint::FingerprintEntry;

pub struct FingerprintStore {
    entries: DashMap<SocketAddr, FingerprintEntry>,
}

impl FingerprintStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Invoked from the TLS handshake callback after computing JA3/JA4.
    pub fn store(&self, remote_addr: SocketAddr, ja3: String, ja4: String) {
        self.entries
            .insert(remote_addr, FingerprintEntry::new(ja3, ja4));
    }

    /// Updates `last_access` on hit.
    pub fn lookup(&self, remote_addr: SocketAddr) -> Option<FingerprintEntry> {
        let mut entry = self.entries.get_mut(&remote_addr)?;
        entry.touch();
        Some(entry.clone())
    }

    /// Invoked on connection state `closed` or `hijacked`.
    pub fn forget(&self, remote_addr: SocketAddr) {
        self.entries.remove(&remote_addr);
    }

    /// Safety-net reaper: deletes any entry idle past `max_idle` (10 min by
    /// default), guarding against lost close notifications.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_idle(max_idle));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FingerprintStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_lookup_round_trips() {
        let store = FingerprintStore::new();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        store.store(addr, "ja3hash".to_string(), "ja4hash".to_string());

        let entry = store.lookup(addr).expect("entry present");
        assert_eq!(entry.ja4, "ja4hash");
    }

    #[test]
    fn forget_removes_entry() {
        let store = FingerprintStore::new();
        let addr: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        store.store(addr, "a".to_string(), "b".to_string());
        store.forget(addr);
        assert!(store.lookup(addr).is_none());
    }

    #[test]
    fn reaper_evicts_idle_entries() {
        let store = FingerprintStore::new();
        let addr: SocketAddr = "127.0.0.1:4002".parse().unwrap();
        store.store(addr, "a".to_string(), "b".to_string());
        let evicted = store.reap_idle(Duration::from_secs(0));
        assert_eq!(evicted, 1);
        assert!(store.is_empty());
    }
}
