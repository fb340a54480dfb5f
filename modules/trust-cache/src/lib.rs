//! Two-level cache of certificate trust decisions.
//!
//! The first level is a small in-memory ring of the most recently used
//! entries; the second is the cert_trust table in the persistent store.
//! Most page loads touch the same host several times in a row, so the ring
//! answers nearly all lookups without a store query.

use certhunt_core::{now_unix, CertHash};
use log::warn;
use store_sqlite::{lock_db, SharedDb};

/// The ring is searched linearly on every miss of the fast path, so it
/// stays small.
pub const MEMORY_RING_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheVerdict {
    Ok,
    NotValid,
    ServerOk,
    ServerNotValid,
    NotInCache,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    hash: CertHash,
    host: String,
    trust: bool,
    valid_until: i64,
}

pub struct TrustDecisionCache {
    // front = most recently added; searched front-to-back
    ring: Vec<CacheEntry>,
    server_host: String,
    pinned_server_hash: CertHash,
    db: SharedDb,
}

impl TrustDecisionCache {
    pub fn new(db: SharedDb, server_host: String, pinned_server_hash: CertHash) -> Self {
        TrustDecisionCache {
            ring: Vec::new(),
            server_host,
            pinned_server_hash,
            db,
        }
    }

    /// Record a trust decision for (hash, host). Write-through: the store
    /// row is replaced by key and the ring gets a fresh front entry, which
    /// supersedes any older entry for the same key without deleting it.
    pub fn add(&mut self, hash: CertHash, host: &str, trust: bool, valid_until: i64) {
        if let Err(e) =
            lock_db(&self.db).upsert_trust(&hash.to_string(), host, trust, valid_until)
        {
            warn!("persisting trust decision for {host} failed: {e}");
        }
        self.add_to_ring(CacheEntry {
            hash,
            host: host.to_string(),
            trust,
            valid_until,
        });
    }

    /// Forget a trust decision. The ring entry is masked rather than
    /// removed: a fresh never-valid entry at the front shadows the old one.
    pub fn remove(&mut self, hash: CertHash, host: &str) {
        self.add_to_ring(CacheEntry {
            hash,
            host: host.to_string(),
            trust: false,
            valid_until: 0,
        });
        if let Err(e) = lock_db(&self.db).delete_trust(&hash.to_string(), host) {
            warn!("deleting trust decision for {host} failed: {e}");
        }
    }

    /// Is `hash` known for `host`, and should it be trusted?
    ///
    /// The verification server itself is special-cased: exactly one pinned
    /// certificate is ever acceptable for it, no matter what the cache
    /// says. Everything else would let an interceptor take over the
    /// verification channel. In restricted mode all other hosts pass.
    pub fn check_validity(&mut self, hash: CertHash, host: &str, restricted: bool) -> CacheVerdict {
        if host == self.server_host {
            return if hash == self.pinned_server_hash {
                CacheVerdict::ServerOk
            } else {
                CacheVerdict::ServerNotValid
            };
        }
        if restricted {
            return CacheVerdict::Ok;
        }

        let entry = match self.find_in_ring(hash, host) {
            Some(e) => e,
            None => match self.load_from_store(hash, host) {
                Some(e) => e,
                None => return CacheVerdict::NotInCache,
            },
        };

        // Lazy expiry: an expired entry behaves as absent. It is not
        // deleted here; a newer add shadows it and startup sweeps the
        // store.
        if entry.valid_until > now_unix() {
            if entry.trust {
                CacheVerdict::Ok
            } else {
                CacheVerdict::NotValid
            }
        } else {
            CacheVerdict::NotInCache
        }
    }

    fn add_to_ring(&mut self, entry: CacheEntry) {
        self.ring.insert(0, entry);
        self.ring.truncate(MEMORY_RING_CAPACITY);
    }

    fn find_in_ring(&self, hash: CertHash, host: &str) -> Option<CacheEntry> {
        self.ring
            .iter()
            .find(|e| e.hash == hash && e.host == host)
            .cloned()
    }

    fn load_from_store(&mut self, hash: CertHash, host: &str) -> Option<CacheEntry> {
        let row = match lock_db(&self.db).lookup_trust(&hash.to_string(), host) {
            Ok(row) => row?,
            Err(e) => {
                warn!("trust lookup for {host} failed: {e}");
                return None;
            }
        };
        let entry = CacheEntry {
            hash,
            host: row.host,
            trust: row.trust,
            valid_until: row.valid_until,
        };
        self.add_to_ring(entry.clone());
        Some(entry)
    }
}
