use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::models::{NewSession, Session, SessionKind};
use crate::repo::{Repository, SessionRepository, StoreError, StoreResult};
use crate::tasks;

const TOKEN_BYTES: usize = 32;

/// `last_seen_at` is only rewritten when it is older than this.
const TOUCH_INTERVAL_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
pub struct IssuedSession {
    /// Returned to the caller once; only its digest is stored.
    pub raw_token: String,
    pub session: Session,
}

impl IssuedSession {
    pub fn expires_at(&self) -> NaiveDateTime {
        self.session.expires_at
    }
}

/// Issues, validates and revokes tenant-scoped bearer tokens.
#[derive(Clone)]
pub struct SessionManager {
    repo: Arc<dyn Repository>,
    admin_ttl: ChronoDuration,
    field_ttl: ChronoDuration,
}

impl SessionManager {
    pub fn new(repo: Arc<dyn Repository>, admin_ttl_days: i64, field_ttl_days: i64) -> Self {
        Self {
            repo,
            admin_ttl: ChronoDuration::days(admin_ttl_days),
            field_ttl: ChronoDuration::days(field_ttl_days),
        }
    }

    pub fn ttl(&self, kind: SessionKind) -> ChronoDuration {
        match kind {
            SessionKind::Admin => self.admin_ttl,
            SessionKind::Field => self.field_ttl,
        }
    }

    pub fn issue(&self, org_id: Uuid, kind: SessionKind) -> StoreResult<IssuedSession> {
        self.issue_at(org_id, kind, Utc::now().naive_utc())
    }

    pub fn issue_at(
        &self,
        org_id: Uuid,
        kind: SessionKind,
        now: NaiveDateTime,
    ) -> StoreResult<IssuedSession> {
        let raw_token = generate_token();
        let session = self.repo.insert_session(NewSession {
            id: Uuid::new_v4(),
            org_id,
            session_kind: kind.as_str().to_string(),
            token_hash: hash_token(&raw_token),
            expires_at: now + self.ttl(kind),
            last_seen_at: now,
        })?;

        let repo = self.repo.clone();
        tasks::spawn_blocking_best_effort("prune_expired_sessions", move || {
            let pruned = repo.delete_expired_sessions(org_id, now)?;
            if pruned > 0 {
                debug!(org_id = %org_id, pruned, "pruned expired sessions");
            }
            Ok::<_, StoreError>(())
        });

        Ok(IssuedSession { raw_token, session })
    }

    pub fn validate(&self, raw_token: &str) -> StoreResult<Option<Session>> {
        self.validate_at(raw_token, Utc::now().naive_utc())
    }

    /// Missing and expired tokens both yield `None`.
    pub fn validate_at(&self, raw_token: &str, now: NaiveDateTime) -> StoreResult<Option<Session>> {
        if raw_token.is_empty() {
            return Ok(None);
        }

        let Some(session) = self.repo.find_session_by_hash(&hash_token(raw_token))? else {
            return Ok(None);
        };
        if session.expires_at <= now {
            return Ok(None);
        }

        if now - session.last_seen_at > ChronoDuration::minutes(TOUCH_INTERVAL_MINUTES) {
            let repo = self.repo.clone();
            let session_id = session.id;
            tasks::spawn_blocking_best_effort("touch_session", move || {
                repo.touch_session(session_id, now)
            });
        }

        Ok(Some(session))
    }

    /// Unknown tokens are a no-op.
    pub fn revoke(&self, raw_token: &str) -> StoreResult<()> {
        if raw_token.is_empty() {
            return Ok(());
        }
        self.repo.delete_session_by_hash(&hash_token(raw_token))?;
        Ok(())
    }
}

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{MemoryRepository, SessionRepository};

    fn manager() -> (Arc<MemoryRepository>, SessionManager) {
        let repo = Arc::new(MemoryRepository::new());
        let manager = SessionManager::new(repo.clone(), 30, 7);
        (repo, manager)
    }

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let first = generate_token();
        let second = generate_token();
        assert_ne!(first, second);
        assert_eq!(first.len(), 43);
        assert!(first
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'));
    }

    #[test]
    fn only_the_digest_is_stored() {
        let (repo, manager) = manager();
        let issued = manager.issue(Uuid::new_v4(), SessionKind::Admin).unwrap();

        assert_ne!(issued.session.token_hash, issued.raw_token);
        let stored = repo
            .find_session_by_hash(&hash_token(&issued.raw_token))
            .unwrap()
            .expect("session stored");
        assert_eq!(stored.id, issued.session.id);
        assert!(repo
            .find_session_by_hash(&issued.raw_token)
            .unwrap()
            .is_none());
    }

    #[test]
    fn validate_returns_live_sessions_only() {
        let (_repo, manager) = manager();
        let org_id = Uuid::new_v4();
        let now = Utc::now().naive_utc();
        let issued = manager.issue_at(org_id, SessionKind::Field, now).unwrap();

        let session = manager
            .validate_at(&issued.raw_token, now)
            .unwrap()
            .expect("valid session");
        assert_eq!(session.org_id, org_id);
        assert_eq!(session.kind(), Some(SessionKind::Field));
        assert_eq!(session.expires_at, now + ChronoDuration::days(7));

        assert!(manager.validate_at("not-a-token", now).unwrap().is_none());
        assert!(manager.validate_at("", now).unwrap().is_none());
    }

    #[test]
    fn expired_session_is_never_returned() {
        let (repo, manager) = manager();
        let issued_at = Utc::now().naive_utc() - ChronoDuration::days(31);
        let issued = manager
            .issue_at(Uuid::new_v4(), SessionKind::Admin, issued_at)
            .unwrap();

        let now = Utc::now().naive_utc();
        assert!(manager.validate_at(&issued.raw_token, now).unwrap().is_none());
        assert!(repo
            .find_session_by_hash(&hash_token(&issued.raw_token))
            .unwrap()
            .is_some());

        let at_expiry = issued.expires_at();
        assert!(manager
            .validate_at(&issued.raw_token, at_expiry)
            .unwrap()
            .is_none());
    }

    #[test]
    fn revoke_is_idempotent() {
        let (repo, manager) = manager();
        let issued = manager.issue(Uuid::new_v4(), SessionKind::Admin).unwrap();

        manager.revoke(&issued.raw_token).unwrap();
        manager.revoke(&issued.raw_token).unwrap();
        manager.revoke("never-issued").unwrap();

        assert!(manager.validate(&issued.raw_token).unwrap().is_none());
        assert_eq!(repo.session_count(), 0);
    }

    #[test]
    fn issuing_prunes_expired_sessions_of_the_same_org() {
        let (repo, manager) = manager();
        let org_id = Uuid::new_v4();
        let long_ago = Utc::now().naive_utc() - ChronoDuration::days(60);
        manager
            .issue_at(org_id, SessionKind::Admin, long_ago)
            .unwrap();
        manager
            .issue_at(Uuid::new_v4(), SessionKind::Admin, long_ago)
            .unwrap();

        // No runtime here, so pruning runs inline.
        manager.issue(org_id, SessionKind::Admin).unwrap();
        assert_eq!(repo.session_count(), 2);
    }
}
