//! File-backed session store: one JSON document per identity
//!
//! Writes go to a sibling temp file that is then renamed over the target, so a
//! reader sees either the previous snapshot or the new one, never a torn file.
//! The worker is the only writer.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{SessionSnapshot, StoredCookie};
use crate::utils::errors::{RpaError, RpaResult};

const FILE_PREFIX: &str = "session_";
const FILE_SUFFIX: &str = ".json";

pub struct SessionStore {
    dir: PathBuf,
    target_domain: String,
}

impl SessionStore {
    /// Open (and create if needed) the snapshot directory
    pub fn open<P: AsRef<Path>>(dir: P, target_domain: impl Into<String>) -> RpaResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            RpaError::Storage(format!("Failed to create sessions dir {}: {}", dir.display(), e))
        })?;

        info!("Opened session store at {}", dir.display());

        Ok(Self {
            dir,
            target_domain: target_domain.into(),
        })
    }

    pub fn target_domain(&self) -> &str {
        &self.target_domain
    }

    fn path_for(&self, identity: &str) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", encode_identity(identity)))
    }

    /// Persist cookies for `identity`, replacing any previous snapshot
    pub fn save(&self, identity: &str, cookies: Vec<StoredCookie>) -> RpaResult<SessionSnapshot> {
        self.save_at(identity, cookies, Utc::now())
    }

    /// [`save`](Self::save) with an explicit timestamp
    pub fn save_at(
        &self,
        identity: &str,
        cookies: Vec<StoredCookie>,
        now: DateTime<Utc>,
    ) -> RpaResult<SessionSnapshot> {
        let created_at = match self.load(identity) {
            Ok(previous) => previous.created_at,
            Err(_) => now,
        };

        let snapshot = SessionSnapshot {
            identity: identity.to_string(),
            cookies,
            created_at,
            last_used_at: now,
        };

        let path = self.path_for(identity);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&snapshot)?;

        fs::write(&tmp, body)
            .map_err(|e| RpaError::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| RpaError::Storage(format!("Failed to replace {}: {}", path.display(), e)))?;

        info!(
            identity,
            cookies = snapshot.cookies.len(),
            "Session snapshot saved: {}",
            path.display()
        );
        Ok(snapshot)
    }

    pub fn load(&self, identity: &str) -> RpaResult<SessionSnapshot> {
        let path = self.path_for(identity);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RpaError::NotFound(format!("session '{}'", identity)));
            }
            Err(e) => {
                return Err(RpaError::Storage(format!("Failed to read {}: {}", path.display(), e)));
            }
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Freshness against the wall clock; unreadable snapshots count as stale
    pub fn is_fresh(&self, identity: &str, max_age: Duration) -> bool {
        self.is_fresh_at(identity, max_age, Utc::now())
    }

    pub fn is_fresh_at(&self, identity: &str, max_age: Duration, now: DateTime<Utc>) -> bool {
        match self.load(identity) {
            Ok(snapshot) => snapshot.is_fresh_at(&self.target_domain, max_age, now),
            Err(RpaError::NotFound(_)) => false,
            Err(e) => {
                warn!("Ignoring unreadable session snapshot for '{}': {}", identity, e);
                false
            }
        }
    }

    /// Delete the snapshot for `identity`; returns whether one existed
    pub fn remove(&self, identity: &str) -> RpaResult<bool> {
        let path = self.path_for(identity);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(identity, "Session snapshot removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RpaError::Storage(format!("Failed to remove {}: {}", path.display(), e))),
        }
    }

    /// All readable snapshots, most recently used first
    pub fn list(&self) -> RpaResult<Vec<SessionSnapshot>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !is_snapshot_file(&path) {
                continue;
            }
            match fs::read(&path)
                .map_err(RpaError::from)
                .and_then(|bytes| serde_json::from_slice::<SessionSnapshot>(&bytes).map_err(RpaError::from))
            {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }
        snapshots.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(snapshots)
    }

    /// Remove snapshots unused for longer than `max_age`. Returns how many went.
    pub fn cleanup_older_than(&self, max_age: Duration) -> RpaResult<usize> {
        self.cleanup_older_than_at(max_age, Utc::now())
    }

    pub fn cleanup_older_than_at(&self, max_age: Duration, now: DateTime<Utc>) -> RpaResult<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| RpaError::Configuration(format!("Invalid cleanup age: {}", e)))?;
        let mut removed = 0;
        for snapshot in self.list()? {
            if snapshot.age(now) > max_age && self.remove(&snapshot.identity)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} stale session snapshot(s)", removed);
        }
        Ok(removed)
    }
}

fn is_snapshot_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
}

/// Filename-safe, one-to-one encoding of an identity: ASCII alphanumerics and
/// `-` pass through, every other byte (including `_`) becomes `_xx` hex
fn encode_identity(identity: &str) -> String {
    let mut encoded = String::with_capacity(identity.len());
    for byte in identity.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("_{:02x}", byte));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn portal_cookie() -> StoredCookie {
        StoredCookie {
            name: "session".into(),
            value: "token".into(),
            domain: ".proordersistem.com.mx".into(),
            path: "/".into(),
            expires: None,
            http_only: true,
            secure: true,
        }
    }

    #[test]
    fn load_missing_identity_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), "proordersistem.com.mx").unwrap();
        assert!(matches!(store.load("nobody"), Err(RpaError::NotFound(_))));
        assert!(!store.is_fresh("nobody", Duration::from_secs(3600)));
    }

    #[test]
    fn last_write_wins_and_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), "proordersistem.com.mx").unwrap();
        let first = Utc::now() - chrono::Duration::hours(2);

        store.save_at("taller-1", vec![portal_cookie()], first).unwrap();
        let mut replacement = portal_cookie();
        replacement.value = "rotated".into();
        store.save("taller-1", vec![replacement]).unwrap();

        let loaded = store.load("taller-1").unwrap();
        assert_eq!(loaded.cookies[0].value, "rotated");
        assert_eq!(loaded.created_at, first);
        assert!(loaded.last_used_at > first);
        assert!(!dir.path().join("session_taller-1.json.tmp").exists());
    }

    #[test]
    fn identities_are_escaped_into_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), "proordersistem.com.mx").unwrap();
        store.save("../escape me", vec![portal_cookie()]).unwrap();
        assert!(dir.path().join("session__2e_2e_2fescape_20me.json").exists());
        assert_eq!(dir.path().read_dir().unwrap().count(), 1);
    }

    #[test]
    fn similar_identities_keep_separate_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), "proordersistem.com.mx").unwrap();
        let mut other = portal_cookie();
        other.value = "other".into();

        store.save("a b", vec![portal_cookie()]).unwrap();
        store.save("a_b", vec![other]).unwrap();

        assert_eq!(store.load("a b").unwrap().cookies[0].value, "token");
        assert_eq!(store.load("a_b").unwrap().cookies[0].value, "other");
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn cleanup_removes_only_old_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), "proordersistem.com.mx").unwrap();
        let now = Utc::now();
        store.save_at("old", vec![portal_cookie()], now - chrono::Duration::days(10)).unwrap();
        store.save_at("recent", vec![portal_cookie()], now - chrono::Duration::hours(1)).unwrap();

        let removed = store
            .cleanup_older_than_at(Duration::from_secs(7 * 24 * 3600), now)
            .unwrap();

        assert_eq!(removed, 1);
        let remaining: Vec<_> = store.list().unwrap().into_iter().map(|s| s.identity).collect();
        assert_eq!(remaining, vec!["recent".to_string()]);
    }

    #[test]
    fn remove_reports_whether_snapshot_existed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), "proordersistem.com.mx").unwrap();
        store.save("default", vec![portal_cookie()]).unwrap();
        assert!(store.remove("default").unwrap());
        assert!(!store.remove("default").unwrap());
    }
}
