use dashmap::DashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::remittance::RemittanceId;

/// Record of remittances already internalized.
///
/// Implementations must be thread-safe (`Send + Sync`) and `try_claim` must
/// be a single atomic check-and-insert: two concurrent claims of the same id
/// must never both succeed.
pub trait ReplayStore: Send + Sync {
    /// Atomically claim a remittance id.
    /// Returns `true` if this call claimed it, `false` if it was already claimed.
    fn try_claim(&self, id: RemittanceId) -> bool;

    /// Release a claim whose internalization failed, so the payer may retry.
    fn release(&self, id: &RemittanceId);

    /// Purge claims older than `max_age_secs`. Returns number purged.
    fn purge_expired(&self, max_age_secs: u64) -> usize;
}

/// In-memory replay store backed by DashMap. Fast but lost on restart.
pub struct InMemoryReplayStore {
    claims: DashMap<RemittanceId, Instant>,
}

impl InMemoryReplayStore {
    pub fn new() -> Self {
        Self {
            claims: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

impl Default for InMemoryReplayStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayStore for InMemoryReplayStore {
    fn try_claim(&self, id: RemittanceId) -> bool {
        // the entry holds the shard lock across check and insert
        use dashmap::mapref::entry::Entry;
        match self.claims.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Instant::now());
                true
            }
        }
    }

    fn release(&self, id: &RemittanceId) {
        self.claims.remove(id);
    }

    fn purge_expired(&self, max_age_secs: u64) -> usize {
        let before = self.claims.len();
        self.claims
            .retain(|_, claimed| claimed.elapsed().as_secs() < max_age_secs);
        before.saturating_sub(self.claims.len())
    }
}

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS remittance_claims (
        id          BLOB PRIMARY KEY NOT NULL,
        claimed_at  INTEGER NOT NULL
    ) WITHOUT ROWID;
    CREATE INDEX IF NOT EXISTS remittance_claims_by_age ON remittance_claims (claimed_at);
";

/// Replay store kept in a SQLite file, so a payment accepted before a
/// restart is still refused after it.
///
/// The primary key on the remittance id does the deduplication: a second
/// insert of the same id fails inside SQLite, which also holds across
/// processes sharing the file.
pub struct SqliteReplayStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteReplayStore {
    /// Open the claim database at `path`, creating the table if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, rusqlite::Error> {
        let path = path.as_ref();
        let db = rusqlite::Connection::open(path)?;
        db.execute_batch(SCHEMA)?;
        restrict_to_owner(path);
        tracing::debug!(path = %path.display(), "replay database ready");
        Ok(Self { db: Mutex::new(db) })
    }

    fn db(&self) -> MutexGuard<'_, rusqlite::Connection> {
        // each statement is atomic, so a poisoned connection is still consistent
        self.db.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("replay database lock was poisoned");
            poisoned.into_inner()
        })
    }

    fn oldest_claim(db: &rusqlite::Connection) -> Option<i64> {
        db.query_row("SELECT MIN(claimed_at) FROM remittance_claims", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .ok()
        .flatten()
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!(path = %path.display(), error = %e, "could not make replay database owner-only");
    }
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) {}

/// Seconds since the epoch. A clock set before 1970 reads as the far
/// future, so nothing looks old enough to purge.
fn epoch_secs() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(_) => {
            tracing::error!("system clock reads before 1970");
            i64::MAX
        }
    }
}

impl ReplayStore for SqliteReplayStore {
    fn try_claim(&self, id: RemittanceId) -> bool {
        let db = self.db();
        match db.execute(
            "INSERT INTO remittance_claims (id, claimed_at) VALUES (?1, ?2)",
            rusqlite::params![id.as_slice(), epoch_secs()],
        ) {
            Ok(_) => true,
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                false
            }
            Err(e) => {
                // treated as already claimed
                tracing::error!(remittance = %id, error = %e, "replay claim insert failed");
                false
            }
        }
    }

    fn release(&self, id: &RemittanceId) {
        let db = self.db();
        match db.execute(
            "DELETE FROM remittance_claims WHERE id = ?1",
            rusqlite::params![id.as_slice()],
        ) {
            Ok(0) => tracing::debug!(remittance = %id, "released a remittance that was never claimed"),
            Ok(_) => {}
            Err(e) => tracing::error!(remittance = %id, error = %e, "replay claim stuck after failed payment"),
        }
    }

    fn purge_expired(&self, max_age_secs: u64) -> usize {
        let db = self.db();
        let now = epoch_secs();

        if let Some(oldest) = Self::oldest_claim(&db) {
            if now < oldest {
                tracing::warn!(now, oldest, "clock is behind the oldest claim; not purging");
                return 0;
            }
        }

        let cutoff = now.saturating_sub(i64::try_from(max_age_secs).unwrap_or(i64::MAX));
        match db.execute(
            "DELETE FROM remittance_claims WHERE claimed_at < ?1",
            rusqlite::params![cutoff],
        ) {
            Ok(purged) => purged,
            Err(e) => {
                tracing::error!(error = %e, "replay purge failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(n: u8) -> RemittanceId {
        RemittanceId([n; 32])
    }

    fn temp_store() -> (tempfile::TempDir, SqliteReplayStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteReplayStore::open(dir.path().join("replay.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_in_memory_try_claim_atomic() {
        let store = InMemoryReplayStore::new();
        assert!(store.try_claim(id(0x99)));
        assert!(!store.try_claim(id(0x99)));
        assert!(store.try_claim(id(0x98)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_in_memory_release_allows_retry() {
        let store = InMemoryReplayStore::new();
        assert!(store.try_claim(id(1)));
        store.release(&id(1));
        assert!(store.try_claim(id(1)));
    }

    #[test]
    fn test_in_memory_concurrent_claims_single_winner() {
        let store = Arc::new(InMemoryReplayStore::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.try_claim(id(7)))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_in_memory_purge() {
        let store = InMemoryReplayStore::new();
        store.try_claim(id(1));
        assert_eq!(store.purge_expired(0), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sqlite_try_claim_atomic() {
        let (_dir, store) = temp_store();
        assert!(store.try_claim(id(0x99)));
        assert!(!store.try_claim(id(0x99)));
        assert!(store.try_claim(id(0x98)));
    }

    #[test]
    fn test_sqlite_claims_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.db");

        {
            let store = SqliteReplayStore::open(&path).unwrap();
            assert!(store.try_claim(id(0xaa)));
        }

        let store = SqliteReplayStore::open(&path).unwrap();
        assert!(!store.try_claim(id(0xaa)));
    }

    #[test]
    fn test_sqlite_purge_drops_only_old_claims() {
        let (_dir, store) = temp_store();
        store
            .db()
            .execute(
                "INSERT INTO remittance_claims (id, claimed_at) VALUES (?1, ?2)",
                rusqlite::params![id(0xbb).as_slice(), 1000i64],
            )
            .unwrap();
        assert!(store.try_claim(id(0xcc)));

        assert_eq!(store.purge_expired(60), 1);
        assert!(!store.try_claim(id(0xcc)));
        assert!(store.try_claim(id(0xbb)));
    }

    #[test]
    fn test_sqlite_purge_skipped_when_clock_is_behind() {
        let (_dir, store) = temp_store();
        store
            .db()
            .execute(
                "INSERT INTO remittance_claims (id, claimed_at) VALUES (?1, ?2)",
                rusqlite::params![id(0xdd).as_slice(), i64::MAX],
            )
            .unwrap();
        assert_eq!(store.purge_expired(0), 0);
        assert!(!store.try_claim(id(0xdd)));
    }

    #[test]
    fn test_sqlite_release() {
        let (_dir, store) = temp_store();
        assert!(store.try_claim(id(3)));
        store.release(&id(3));
        assert!(store.try_claim(id(3)));
        // releasing an unknown id is harmless
        store.release(&id(4));
    }
}
