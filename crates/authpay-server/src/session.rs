use std::collections::HashSet;

use authpay::auth::PeerSession;
use authpay::certificate::VerifiedCertificate;
use dashmap::DashMap;

struct SessionEntry {
    session: PeerSession,
    /// Per-request nonces already used on this session.
    seen_nonces: HashSet<String>,
}

/// Live peer sessions, keyed by the server-issued session nonce.
pub struct SessionManager {
    sessions: DashMap<String, SessionEntry>,
    ttl_secs: u64,
}

impl SessionManager {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl_secs,
        }
    }

    pub fn insert(&self, session: PeerSession) {
        self.sessions.insert(
            session.session_nonce.clone(),
            SessionEntry {
                session,
                seen_nonces: HashSet::new(),
            },
        );
    }

    /// Live session for `session_nonce`. Expired sessions are dropped.
    pub fn get(&self, session_nonce: &str) -> Option<PeerSession> {
        {
            let entry = self.sessions.get(session_nonce)?;
            if !entry.session.is_expired(self.ttl_secs) {
                return Some(entry.session.clone());
            }
        }
        // read guard released above; removing while holding it deadlocks the shard
        self.sessions.remove(session_nonce);
        tracing::debug!("session expired");
        None
    }

    /// Record the client's verified certificates and open the session.
    pub fn authenticate(&self, session_nonce: &str, certificates: Vec<VerifiedCertificate>) -> bool {
        match self.sessions.get_mut(session_nonce) {
            Some(mut entry) => {
                entry.session.certificates = certificates;
                entry.session.authenticated = true;
                true
            }
            None => false,
        }
    }

    /// Claim a per-request nonce. Returns `false` if it was already used on
    /// this session or the session is gone.
    pub fn claim_request_nonce(&self, session_nonce: &str, nonce: &str) -> bool {
        match self.sessions.get_mut(session_nonce) {
            Some(mut entry) => entry.seen_nonces.insert(nonce.to_string()),
            None => false,
        }
    }

    pub fn remove(&self, session_nonce: &str) {
        self.sessions.remove(session_nonce);
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| !entry.session.is_expired(self.ttl_secs));
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
