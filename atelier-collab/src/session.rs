//! Session registry: the authoritative state for every live file session.
//!
//! One [`CollaborationSession`] exists per `(container, file path)` pair while
//! at least one user is joined. Sessions are created lazily on first join and
//! destroyed on last leave. All content mutations flow through
//! [`SessionRegistry::apply_update`], which either applies the update
//! directly, auto-merges it via the [`ConflictResolver`], or reports a
//! conflict back to the caller without mutating anything.
//!
//! Sessions are stored in an arena keyed by opaque [`SessionId`]s with a
//! secondary `(container, path) → id` lookup, so nothing outside the registry
//! holds references into session records.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resolver::{ConflictResolution, ConflictResolver};

/// Opaque server-issued session handle.
pub type SessionId = Uuid;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Locks
// ───────────────────────────────────────────────────────────────────

/// A held advisory lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub holder_id: String,
    /// Milliseconds since the Unix epoch
    pub acquired_at: u64,
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    /// Denied; carries the current holder
    Denied { holder_id: String },
}

/// Per-session advisory lock table: path → holder.
///
/// Locks signal edit intent only; they never block `apply_update`.
#[derive(Debug, Default, Clone)]
pub struct LockTable {
    locks: HashMap<String, LockState>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant if the path is unlocked or already held by `user_id`.
    pub fn try_acquire(&mut self, path: &str, user_id: &str) -> LockOutcome {
        match self.locks.get(path) {
            Some(state) if state.holder_id != user_id => LockOutcome::Denied {
                holder_id: state.holder_id.clone(),
            },
            Some(_) => LockOutcome::Granted, // idempotent re-acquire
            None => {
                self.locks.insert(
                    path.to_string(),
                    LockState {
                        holder_id: user_id.to_string(),
                        acquired_at: now_ms(),
                    },
                );
                LockOutcome::Granted
            }
        }
    }

    /// Release a lock; only the holder may release.
    pub fn release(&mut self, path: &str, user_id: &str) -> bool {
        match self.locks.get(path) {
            Some(state) if state.holder_id == user_id => {
                self.locks.remove(path);
                true
            }
            _ => false,
        }
    }

    /// Drop every lock held by `user_id`, returning the released paths.
    pub fn release_all(&mut self, user_id: &str) -> Vec<String> {
        let released: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, s)| s.holder_id == user_id)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &released {
            self.locks.remove(path);
        }
        released
    }

    pub fn holder(&self, path: &str) -> Option<&LockState> {
        self.locks.get(path)
    }

    /// Snapshot of all held locks for the join reply.
    pub fn snapshot(&self) -> HashMap<String, LockState> {
        self.locks.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// History
// ───────────────────────────────────────────────────────────────────

/// What kind of mutation produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Merge,
    ConflictResolution,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Merge => "merge",
            Operation::ConflictResolution => "conflict-resolution",
        }
    }
}

/// Immutable record of one accepted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub content: String,
    pub user_id: String,
    pub timestamp: u64,
    pub operation: Operation,
}

// ───────────────────────────────────────────────────────────────────
// Session record
// ───────────────────────────────────────────────────────────────────

/// Live collaborative state for one `(container, file path)` pair.
#[derive(Debug, Clone)]
pub struct CollaborationSession {
    pub id: SessionId,
    pub container_id: String,
    pub file_path: String,
    pub users: HashSet<String>,
    /// Starts at 1, +1 per accepted mutation
    pub version: u64,
    pub content: String,
    /// Snapshot of `content` before the last applied mutation; the common
    /// ancestor for the next 3-way merge
    pub base_content: String,
    pub locks: LockTable,
    history: VecDeque<HistoryEntry>,
    max_history: usize,
}

impl CollaborationSession {
    fn new(container_id: &str, file_path: &str, user_id: &str, max_history: usize) -> Self {
        let mut history = VecDeque::new();
        history.push_back(HistoryEntry {
            version: 1,
            content: String::new(),
            user_id: user_id.to_string(),
            timestamp: now_ms(),
            operation: Operation::Create,
        });
        let mut users = HashSet::new();
        users.insert(user_id.to_string());
        Self {
            id: Uuid::new_v4(),
            container_id: container_id.to_string(),
            file_path: file_path.to_string(),
            users,
            version: 1,
            content: String::new(),
            base_content: String::new(),
            locks: LockTable::new(),
            history,
            max_history,
        }
    }

    fn record(&mut self, user_id: &str, operation: Operation) {
        self.history.push_back(HistoryEntry {
            version: self.version,
            content: self.content.clone(),
            user_id: user_id.to_string(),
            timestamp: now_ms(),
            operation,
        });
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    /// Most recent entries, newest last, at most `limit`.
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// Result of `apply_update`.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Versions matched; content replaced
    Applied { version: u64 },
    /// Versions diverged but the resolver merged automatically
    AutoResolved {
        resolution: ConflictResolution,
        version: u64,
    },
    /// Versions diverged and the merge needs a human; session untouched
    Conflict {
        resolution: ConflictResolution,
        current_version: u64,
    },
}

/// What happened when a user left a session.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub remaining_users: usize,
    pub destroyed: bool,
    pub released_locks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    SessionNotFound(SessionId),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "unknown session: {id}"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    container_id: String,
    file_path: String,
}

/// Owns every live session and serializes all mutations of them.
pub struct SessionRegistry {
    sessions: HashMap<SessionId, CollaborationSession>,
    by_key: HashMap<SessionKey, SessionId>,
    resolver: ConflictResolver,
    max_history: usize,
}

impl SessionRegistry {
    pub fn new(max_history: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            by_key: HashMap::new(),
            resolver: ConflictResolver::new(),
            max_history,
        }
    }

    /// Join an existing session for `(container, path)` or create one.
    ///
    /// Returns the session id and whether it was newly created. New sessions
    /// start at `version = 1` with empty content; initial content comes from
    /// the caller's file store, not from the registry.
    pub fn join_or_create(
        &mut self,
        container_id: &str,
        file_path: &str,
        user_id: &str,
    ) -> (SessionId, bool) {
        let key = SessionKey {
            container_id: container_id.to_string(),
            file_path: file_path.to_string(),
        };
        if let Some(&id) = self.by_key.get(&key) {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.users.insert(user_id.to_string());
                return (id, false);
            }
        }
        let session = CollaborationSession::new(container_id, file_path, user_id, self.max_history);
        let id = session.id;
        log::info!("session {id} created for {container_id}:{file_path}");
        self.by_key.insert(key, id);
        self.sessions.insert(id, session);
        (id, true)
    }

    /// Remove a user, releasing their locks; destroys the session when empty.
    pub fn leave(&mut self, id: SessionId, user_id: &str) -> Result<LeaveOutcome, RegistryError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(RegistryError::SessionNotFound(id))?;
        session.users.remove(user_id);
        let released_locks = session.locks.release_all(user_id);
        let remaining = session.user_count();
        if remaining == 0 {
            let key = SessionKey {
                container_id: session.container_id.clone(),
                file_path: session.file_path.clone(),
            };
            self.by_key.remove(&key);
            self.sessions.remove(&id);
            log::info!("session {id} destroyed (empty)");
            return Ok(LeaveOutcome {
                remaining_users: 0,
                destroyed: true,
                released_locks,
            });
        }
        Ok(LeaveOutcome {
            remaining_users: remaining,
            destroyed: false,
            released_locks,
        })
    }

    /// The optimistic-concurrency update path.
    ///
    /// A matching `expected_version` applies directly; a mismatch goes
    /// through the resolver. A resolver-internal failure downgrades to
    /// last-write-wins on the incoming content so the session always makes
    /// forward progress.
    pub fn apply_update(
        &mut self,
        id: SessionId,
        user_id: &str,
        expected_version: u64,
        new_content: &str,
    ) -> Result<UpdateOutcome, RegistryError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(RegistryError::SessionNotFound(id))?;

        if expected_version == session.version {
            session.base_content = std::mem::take(&mut session.content);
            session.content = new_content.to_string();
            session.version += 1;
            session.record(user_id, Operation::Update);
            return Ok(UpdateOutcome::Applied {
                version: session.version,
            });
        }

        let resolution = match self.resolver.resolve(
            &session.base_content,
            &session.content,
            new_content,
            &session.file_path,
            user_id,
        ) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("resolver failed for session {id}: {e}; falling back to last-write-wins");
                ConflictResolution::last_write_wins(new_content, user_id)
            }
        };

        if resolution.metadata.auto_resolved {
            session.base_content = std::mem::take(&mut session.content);
            session.content = resolution.resolved_content.clone();
            session.version += 1;
            session.record(user_id, Operation::Merge);
            let version = session.version;
            Ok(UpdateOutcome::AutoResolved {
                resolution,
                version,
            })
        } else {
            Ok(UpdateOutcome::Conflict {
                current_version: session.version,
                resolution,
            })
        }
    }

    /// Apply a user's explicit conflict resolution. Always succeeds for a
    /// live session: the last manual choice wins regardless of version.
    pub fn resolve_manually(
        &mut self,
        id: SessionId,
        user_id: &str,
        resolved_content: &str,
    ) -> Result<u64, RegistryError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(RegistryError::SessionNotFound(id))?;
        session.base_content = std::mem::take(&mut session.content);
        session.content = resolved_content.to_string();
        session.version += 1;
        session.record(user_id, Operation::ConflictResolution);
        Ok(session.version)
    }

    pub fn get(&self, id: SessionId) -> Option<&CollaborationSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut CollaborationSession> {
        self.sessions.get_mut(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(100)
    }

    #[test]
    fn test_join_creates_session_once() {
        let mut reg = registry();
        let (id, created) = reg.join_or_create("c1", "a.rs", "u1");
        assert!(created);
        let (id2, created2) = reg.join_or_create("c1", "a.rs", "u2");
        assert!(!created2);
        assert_eq!(id, id2);
        assert_eq!(reg.get(id).unwrap().user_count(), 2);
        assert_eq!(reg.get(id).unwrap().version, 1);
    }

    #[test]
    fn test_distinct_files_get_distinct_sessions() {
        let mut reg = registry();
        let (a, _) = reg.join_or_create("c1", "a.rs", "u1");
        let (b, _) = reg.join_or_create("c1", "b.rs", "u1");
        let (c, _) = reg.join_or_create("c2", "a.rs", "u1");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(reg.session_count(), 3);
    }

    #[test]
    fn test_last_leave_destroys_session() {
        let mut reg = registry();
        let (id, _) = reg.join_or_create("c1", "a.rs", "u1");
        reg.join_or_create("c1", "a.rs", "u2");

        let out = reg.leave(id, "u1").unwrap();
        assert!(!out.destroyed);
        assert_eq!(out.remaining_users, 1);

        let out = reg.leave(id, "u2").unwrap();
        assert!(out.destroyed);
        assert!(reg.get(id).is_none());

        // A fresh join creates a brand new session at version 1.
        let (id2, created) = reg.join_or_create("c1", "a.rs", "u3");
        assert!(created);
        assert_ne!(id, id2);
        assert_eq!(reg.get(id2).unwrap().version, 1);
    }

    #[test]
    fn test_versions_increment_by_one() {
        let mut reg = registry();
        let (id, _) = reg.join_or_create("c1", "a.rs", "u1");
        for (i, content) in ["one", "two", "three"].iter().enumerate() {
            let outcome = reg.apply_update(id, "u1", (i as u64) + 1, content).unwrap();
            match outcome {
                UpdateOutcome::Applied { version } => assert_eq!(version, (i as u64) + 2),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        let session = reg.get(id).unwrap();
        assert_eq!(session.version, 4);
        assert_eq!(session.content, "three");
        assert_eq!(session.base_content, "two");

        // history[i].version == i + 1
        let history = session.history(10);
        for (i, entry) in history.iter().enumerate() {
            assert_eq!(entry.version, (i as u64) + 1);
        }
        assert_eq!(history.last().unwrap().version, session.version);
    }

    #[test]
    fn test_stale_update_auto_merges() {
        let mut reg = registry();
        let (id, _) = reg.join_or_create("c1", "a.rs", "u1");
        reg.apply_update(id, "u1", 1, "a\nb\nc").unwrap();
        reg.apply_update(id, "u1", 2, "a\nB\nc").unwrap();

        // u2 edits from the old base with a stale version.
        let outcome = reg.apply_update(id, "u2", 2, "a\nb\nC").unwrap();
        match outcome {
            UpdateOutcome::AutoResolved { version, .. } => assert_eq!(version, 4),
            other => panic!("expected auto-resolve, got {other:?}"),
        }
        let session = reg.get(id).unwrap();
        assert_eq!(session.content, "a\nB\nC");
        let history = session.history(10);
        assert_eq!(history.last().unwrap().operation, Operation::Merge);
    }

    #[test]
    fn test_conflict_leaves_session_untouched() {
        let mut reg = registry();
        let (id, _) = reg.join_or_create("c1", "a.rs", "u1");
        reg.apply_update(id, "u1", 1, "x = 1").unwrap();
        reg.apply_update(id, "u1", 2, "x = 2").unwrap();

        let outcome = reg.apply_update(id, "u2", 2, "x = 3").unwrap();
        match outcome {
            UpdateOutcome::Conflict {
                current_version,
                resolution,
            } => {
                assert_eq!(current_version, 3);
                assert!(!resolution.metadata.auto_resolved);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let session = reg.get(id).unwrap();
        assert_eq!(session.version, 3);
        assert_eq!(session.content, "x = 2");
        assert_eq!(session.history_len(), 3);
    }

    #[test]
    fn test_manual_resolution_always_wins() {
        let mut reg = registry();
        let (id, _) = reg.join_or_create("c1", "a.rs", "u1");
        reg.apply_update(id, "u1", 1, "x = 1").unwrap();

        let version = reg.resolve_manually(id, "u2", "x = 42").unwrap();
        assert_eq!(version, 3);
        let session = reg.get(id).unwrap();
        assert_eq!(session.content, "x = 42");
        assert_eq!(
            session.history(1)[0].operation,
            Operation::ConflictResolution
        );
    }

    #[test]
    fn test_history_trims_oldest_first() {
        let mut reg = SessionRegistry::new(3);
        let (id, _) = reg.join_or_create("c1", "a.rs", "u1");
        for v in 1..=5 {
            reg.apply_update(id, "u1", v, &format!("v{v}")).unwrap();
        }
        let session = reg.get(id).unwrap();
        assert_eq!(session.history_len(), 3);
        let history = session.history(10);
        assert_eq!(history[0].version, 4);
        assert_eq!(history.last().unwrap().version, 6);
    }

    #[test]
    fn test_unknown_session_is_an_error() {
        let mut reg = registry();
        let ghost = Uuid::new_v4();
        assert!(matches!(
            reg.apply_update(ghost, "u1", 1, "x"),
            Err(RegistryError::SessionNotFound(_))
        ));
        assert!(reg.leave(ghost, "u1").is_err());
        assert!(reg.resolve_manually(ghost, "u1", "x").is_err());
    }

    #[test]
    fn test_lock_exclusivity() {
        let mut table = LockTable::new();
        assert_eq!(table.try_acquire("a.txt", "u1"), LockOutcome::Granted);
        assert_eq!(
            table.try_acquire("a.txt", "u2"),
            LockOutcome::Denied {
                holder_id: "u1".to_string()
            }
        );
        // Idempotent re-acquire by the holder.
        assert_eq!(table.try_acquire("a.txt", "u1"), LockOutcome::Granted);

        assert!(table.release("a.txt", "u1"));
        assert_eq!(table.try_acquire("a.txt", "u2"), LockOutcome::Granted);
    }

    #[test]
    fn test_release_requires_holder() {
        let mut table = LockTable::new();
        table.try_acquire("a.txt", "u1");
        assert!(!table.release("a.txt", "u2"));
        assert!(table.holder("a.txt").is_some());
    }

    #[test]
    fn test_release_all_on_leave() {
        let mut table = LockTable::new();
        table.try_acquire("a.txt", "u1");
        table.try_acquire("b.txt", "u1");
        table.try_acquire("c.txt", "u2");

        let mut released = table.release_all("u1");
        released.sort();
        assert_eq!(released, vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert!(table.holder("c.txt").is_some());
    }

    #[test]
    fn test_leave_releases_locks() {
        let mut reg = registry();
        let (id, _) = reg.join_or_create("c1", "a.rs", "u1");
        reg.join_or_create("c1", "a.rs", "u2");
        reg.get_mut(id).unwrap().locks.try_acquire("a.rs", "u1");

        let out = reg.leave(id, "u1").unwrap();
        assert_eq!(out.released_locks, vec!["a.rs".to_string()]);
        assert!(reg.get(id).unwrap().locks.is_empty());
    }
}
