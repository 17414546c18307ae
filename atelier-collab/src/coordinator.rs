//! Event dispatch: transport events in, routed messages out.
//!
//! The coordinator is the single authority that drives the session registry.
//! It holds no sockets and performs no I/O; the transport layer hands it one
//! decoded [`ClientEvent`] at a time and sends whatever [`Outgoing`] messages
//! come back. Serializing calls into `handle` is what gives every session its
//! total mutation order, so the transport must wrap the coordinator in a
//! mutual-exclusion region when connections are handled concurrently.

use std::collections::HashMap;

use uuid::Uuid;

use crate::protocol::{ClientEvent, CursorPosition, Outgoing, ServerMessage};
use crate::session::{
    LockOutcome, RegistryError, SessionId, SessionRegistry, UpdateOutcome,
};

/// Transport-assigned connection handle.
pub type ConnectionId = Uuid;

/// Sessions a connection has joined, and as which user.
#[derive(Debug, Default)]
struct ConnectionSessions {
    sessions: HashMap<SessionId, String>,
}

/// Translates protocol events into registry calls and routed replies.
pub struct SyncCoordinator {
    registry: SessionRegistry,
    connections: HashMap<ConnectionId, ConnectionSessions>,
}

impl SyncCoordinator {
    pub fn new(max_history: usize) -> Self {
        Self {
            registry: SessionRegistry::new(max_history),
            connections: HashMap::new(),
        }
    }

    /// Handle one event from one connection.
    pub fn handle(&mut self, conn: ConnectionId, event: ClientEvent) -> Vec<Outgoing> {
        match event {
            ClientEvent::Join {
                container_id,
                file_path,
                user_id,
            } => self.on_join(conn, &container_id, &file_path, &user_id),
            ClientEvent::Leave {
                session_id,
                user_id,
            } => self.on_leave(conn, session_id, &user_id),
            ClientEvent::Update {
                session_id,
                content,
                version,
                user_id,
            } => self.on_update(session_id, &user_id, version, &content),
            ClientEvent::Lock {
                session_id,
                file_path,
                user_id,
                lock,
            } => self.on_lock(session_id, &file_path, &user_id, lock),
            ClientEvent::Cursor {
                session_id,
                user_id,
                position,
            } => self.on_cursor(session_id, &user_id, position),
            ClientEvent::ResolveConflict {
                session_id,
                resolved_content,
                strategy,
                user_id,
            } => self.on_resolve_conflict(session_id, &resolved_content, &strategy, &user_id),
            ClientEvent::History { session_id, limit } => self.on_history(session_id, limit),
            ClientEvent::Ping => vec![Outgoing::ToSender(ServerMessage::Pong)],
        }
    }

    /// Treat a dropped connection as a leave for every session it joined.
    pub fn disconnect(&mut self, conn: ConnectionId) -> Vec<Outgoing> {
        let Some(info) = self.connections.remove(&conn) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (session_id, user_id) in info.sessions {
            out.extend(self.leave_session(session_id, &user_id));
        }
        out
    }

    /// Session ids a connection currently belongs to.
    pub fn sessions_of(&self, conn: ConnectionId) -> Vec<SessionId> {
        self.connections
            .get(&conn)
            .map(|info| info.sessions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.registry.session_count()
    }

    fn on_join(
        &mut self,
        conn: ConnectionId,
        container_id: &str,
        file_path: &str,
        user_id: &str,
    ) -> Vec<Outgoing> {
        let (session_id, created) = self.registry.join_or_create(container_id, file_path, user_id);
        self.connections
            .entry(conn)
            .or_default()
            .sessions
            .insert(session_id, user_id.to_string());

        // Registry just created or returned the session; it must exist.
        let Some(session) = self.registry.get(session_id) else {
            return vec![not_found(session_id)];
        };
        log::debug!(
            "{user_id} joined session {session_id} ({}, {} users)",
            if created { "new" } else { "existing" },
            session.user_count()
        );

        let mut users: Vec<String> = session.users.iter().cloned().collect();
        users.sort();
        vec![
            Outgoing::ToSender(ServerMessage::SessionSnapshot {
                session_id,
                content: session.content.clone(),
                version: session.version,
                users,
                locks: session.locks.snapshot(),
            }),
            Outgoing::ToRoom {
                session_id,
                message: ServerMessage::UserJoined {
                    user_id: user_id.to_string(),
                    user_count: session.user_count(),
                },
                include_sender: false,
            },
        ]
    }

    fn on_leave(
        &mut self,
        conn: ConnectionId,
        session_id: SessionId,
        user_id: &str,
    ) -> Vec<Outgoing> {
        if let Some(info) = self.connections.get_mut(&conn) {
            info.sessions.remove(&session_id);
        }
        self.leave_session(session_id, user_id)
    }

    fn leave_session(&mut self, session_id: SessionId, user_id: &str) -> Vec<Outgoing> {
        let outcome = match self.registry.leave(session_id, user_id) {
            Ok(o) => o,
            Err(RegistryError::SessionNotFound(_)) => return vec![not_found(session_id)],
        };
        if outcome.destroyed {
            // Nobody left to notify.
            return Vec::new();
        }
        let mut out: Vec<Outgoing> = outcome
            .released_locks
            .into_iter()
            .map(|path| Outgoing::ToRoom {
                session_id,
                message: ServerMessage::FileLockChanged {
                    file_path: path,
                    locked: false,
                    user_id: user_id.to_string(),
                },
                include_sender: false,
            })
            .collect();
        out.push(Outgoing::ToRoom {
            session_id,
            message: ServerMessage::UserLeft {
                user_id: user_id.to_string(),
                user_count: outcome.remaining_users,
            },
            include_sender: false,
        });
        out
    }

    fn on_update(
        &mut self,
        session_id: SessionId,
        user_id: &str,
        version: u64,
        content: &str,
    ) -> Vec<Outgoing> {
        match self.registry.apply_update(session_id, user_id, version, content) {
            Ok(UpdateOutcome::Applied { version }) => vec![Outgoing::ToRoom {
                session_id,
                message: ServerMessage::FileUpdated {
                    content: content.to_string(),
                    version,
                    user_id: user_id.to_string(),
                },
                include_sender: false,
            }],
            Ok(UpdateOutcome::AutoResolved {
                resolution,
                version,
            }) => {
                log::info!(
                    "session {session_id}: auto-resolved {} conflict from {user_id} (v{version})",
                    resolution.strategy.as_str()
                );
                vec![Outgoing::ToRoom {
                    session_id,
                    message: ServerMessage::AutoConflictResolved {
                        content: resolution.resolved_content.clone(),
                        version,
                        resolution,
                    },
                    include_sender: true,
                }]
            }
            Ok(UpdateOutcome::Conflict {
                resolution,
                current_version,
            }) => {
                log::info!(
                    "session {session_id}: manual conflict for {user_id} at v{current_version}"
                );
                vec![Outgoing::ToSender(ServerMessage::ConflictDetected {
                    resolution,
                    current_version,
                })]
            }
            Err(RegistryError::SessionNotFound(_)) => vec![not_found(session_id)],
        }
    }

    fn on_lock(
        &mut self,
        session_id: SessionId,
        file_path: &str,
        user_id: &str,
        lock: bool,
    ) -> Vec<Outgoing> {
        let Some(session) = self.registry.get_mut(session_id) else {
            return vec![not_found(session_id)];
        };
        if lock {
            match session.locks.try_acquire(file_path, user_id) {
                LockOutcome::Granted => vec![Outgoing::ToRoom {
                    session_id,
                    message: ServerMessage::FileLockChanged {
                        file_path: file_path.to_string(),
                        locked: true,
                        user_id: user_id.to_string(),
                    },
                    include_sender: true,
                }],
                LockOutcome::Denied { holder_id } => {
                    vec![Outgoing::ToSender(ServerMessage::LockFailed {
                        file_path: file_path.to_string(),
                        locked_by: Some(holder_id),
                    })]
                }
            }
        } else if session.locks.release(file_path, user_id) {
            vec![Outgoing::ToRoom {
                session_id,
                message: ServerMessage::FileLockChanged {
                    file_path: file_path.to_string(),
                    locked: false,
                    user_id: user_id.to_string(),
                },
                include_sender: true,
            }]
        } else {
            let holder = session.locks.holder(file_path).map(|s| s.holder_id.clone());
            vec![Outgoing::ToSender(ServerMessage::LockFailed {
                file_path: file_path.to_string(),
                locked_by: holder,
            })]
        }
    }

    fn on_cursor(
        &mut self,
        session_id: SessionId,
        user_id: &str,
        position: CursorPosition,
    ) -> Vec<Outgoing> {
        // Stateless relay; nothing is recorded.
        if self.registry.get(session_id).is_none() {
            return vec![not_found(session_id)];
        }
        vec![Outgoing::ToRoom {
            session_id,
            message: ServerMessage::CursorMoved {
                user_id: user_id.to_string(),
                position,
            },
            include_sender: false,
        }]
    }

    fn on_resolve_conflict(
        &mut self,
        session_id: SessionId,
        resolved_content: &str,
        strategy: &str,
        user_id: &str,
    ) -> Vec<Outgoing> {
        match self.registry.resolve_manually(session_id, user_id, resolved_content) {
            Ok(version) => vec![Outgoing::ToRoom {
                session_id,
                message: ServerMessage::ConflictResolved {
                    content: resolved_content.to_string(),
                    version,
                    user_id: user_id.to_string(),
                    strategy: strategy.to_string(),
                },
                include_sender: true,
            }],
            Err(RegistryError::SessionNotFound(_)) => vec![not_found(session_id)],
        }
    }

    fn on_history(&mut self, session_id: SessionId, limit: usize) -> Vec<Outgoing> {
        let Some(session) = self.registry.get(session_id) else {
            return vec![not_found(session_id)];
        };
        vec![Outgoing::ToSender(ServerMessage::FileHistory {
            session_id,
            history: session.history(limit),
            total_versions: session.version,
        })]
    }
}

fn not_found(session_id: SessionId) -> Outgoing {
    Outgoing::ToSender(ServerMessage::Error {
        message: format!("unknown session: {session_id}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> SyncCoordinator {
        SyncCoordinator::new(100)
    }

    fn join(
        coord: &mut SyncCoordinator,
        conn: ConnectionId,
        user: &str,
    ) -> (SessionId, Vec<Outgoing>) {
        let out = coord.handle(
            conn,
            ClientEvent::Join {
                container_id: "c1".to_string(),
                file_path: "main.rs".to_string(),
                user_id: user.to_string(),
            },
        );
        let session_id = match &out[0] {
            Outgoing::ToSender(ServerMessage::SessionSnapshot { session_id, .. }) => *session_id,
            other => panic!("expected snapshot, got {other:?}"),
        };
        (session_id, out)
    }

    #[test]
    fn test_join_replies_snapshot_and_broadcasts() {
        let mut coord = coordinator();
        let conn = Uuid::new_v4();
        let (_, out) = join(&mut coord, conn, "alice");
        assert_eq!(out.len(), 2);
        match &out[1] {
            Outgoing::ToRoom {
                message: ServerMessage::UserJoined { user_id, user_count },
                include_sender,
                ..
            } => {
                assert_eq!(user_id, "alice");
                assert_eq!(*user_count, 1);
                assert!(!include_sender);
            }
            other => panic!("expected user-joined, got {other:?}"),
        }
    }

    #[test]
    fn test_second_join_sees_existing_state() {
        let mut coord = coordinator();
        let (sid, _) = join(&mut coord, Uuid::new_v4(), "alice");
        coord.handle(
            Uuid::new_v4(),
            ClientEvent::Update {
                session_id: sid,
                content: "hello".to_string(),
                version: 1,
                user_id: "alice".to_string(),
            },
        );
        let (sid2, out) = join(&mut coord, Uuid::new_v4(), "bob");
        assert_eq!(sid, sid2);
        match &out[0] {
            Outgoing::ToSender(ServerMessage::SessionSnapshot {
                content,
                version,
                users,
                ..
            }) => {
                assert_eq!(content, "hello");
                assert_eq!(*version, 2);
                assert_eq!(users, &vec!["alice".to_string(), "bob".to_string()]);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_clean_update_broadcasts_excluding_sender() {
        let mut coord = coordinator();
        let (sid, _) = join(&mut coord, Uuid::new_v4(), "alice");
        let out = coord.handle(
            Uuid::new_v4(),
            ClientEvent::Update {
                session_id: sid,
                content: "v2".to_string(),
                version: 1,
                user_id: "alice".to_string(),
            },
        );
        match &out[0] {
            Outgoing::ToRoom {
                message: ServerMessage::FileUpdated { version, .. },
                include_sender,
                ..
            } => {
                assert_eq!(*version, 2);
                assert!(!include_sender);
            }
            other => panic!("expected file-updated, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_update_auto_resolves_to_whole_room() {
        let mut coord = coordinator();
        let conn = Uuid::new_v4();
        let (sid, _) = join(&mut coord, conn, "alice");
        let update = |content: &str, version, user: &str| ClientEvent::Update {
            session_id: sid,
            content: content.to_string(),
            version,
            user_id: user.to_string(),
        };
        coord.handle(conn, update("a\nb\nc", 1, "alice"));
        coord.handle(conn, update("a\nB\nc", 2, "alice"));

        let out = coord.handle(conn, update("a\nb\nC", 2, "bob"));
        match &out[0] {
            Outgoing::ToRoom {
                message: ServerMessage::AutoConflictResolved { content, version, .. },
                include_sender,
                ..
            } => {
                assert_eq!(content, "a\nB\nC");
                assert_eq!(*version, 4);
                assert!(include_sender);
            }
            other => panic!("expected auto-resolve, got {other:?}"),
        }
    }

    #[test]
    fn test_conflict_goes_only_to_sender() {
        let mut coord = coordinator();
        let conn = Uuid::new_v4();
        let (sid, _) = join(&mut coord, conn, "alice");
        let update = |content: &str, version, user: &str| ClientEvent::Update {
            session_id: sid,
            content: content.to_string(),
            version,
            user_id: user.to_string(),
        };
        coord.handle(conn, update("x = 1", 1, "alice"));
        coord.handle(conn, update("x = 2", 2, "alice"));

        let out = coord.handle(conn, update("x = 3", 2, "bob"));
        assert_eq!(out.len(), 1);
        match &out[0] {
            Outgoing::ToSender(ServerMessage::ConflictDetected {
                current_version, ..
            }) => assert_eq!(*current_version, 3),
            other => panic!("expected conflict-detected, got {other:?}"),
        }
    }

    #[test]
    fn test_lock_grant_and_denial() {
        let mut coord = coordinator();
        let (sid, _) = join(&mut coord, Uuid::new_v4(), "alice");
        let lock = |user: &str, lock| ClientEvent::Lock {
            session_id: sid,
            file_path: "main.rs".to_string(),
            user_id: user.to_string(),
            lock,
        };

        let out = coord.handle(Uuid::new_v4(), lock("alice", true));
        assert!(matches!(
            &out[0],
            Outgoing::ToRoom {
                message: ServerMessage::FileLockChanged { locked: true, .. },
                include_sender: true,
                ..
            }
        ));

        let out = coord.handle(Uuid::new_v4(), lock("bob", true));
        match &out[0] {
            Outgoing::ToSender(ServerMessage::LockFailed { locked_by, .. }) => {
                assert_eq!(locked_by.as_deref(), Some("alice"));
            }
            other => panic!("expected lock-failed, got {other:?}"),
        }

        let out = coord.handle(Uuid::new_v4(), lock("alice", false));
        assert!(matches!(
            &out[0],
            Outgoing::ToRoom {
                message: ServerMessage::FileLockChanged { locked: false, .. },
                ..
            }
        ));
    }

    #[test]
    fn test_cursor_relays_excluding_sender() {
        let mut coord = coordinator();
        let (sid, _) = join(&mut coord, Uuid::new_v4(), "alice");
        let out = coord.handle(
            Uuid::new_v4(),
            ClientEvent::Cursor {
                session_id: sid,
                user_id: "alice".to_string(),
                position: CursorPosition::new(3, 14),
            },
        );
        match &out[0] {
            Outgoing::ToRoom {
                message: ServerMessage::CursorMoved { position, .. },
                include_sender,
                ..
            } => {
                assert_eq!(position.line, 3);
                assert!(!include_sender);
            }
            other => panic!("expected cursor-moved, got {other:?}"),
        }
    }

    #[test]
    fn test_manual_resolution_broadcasts_to_all() {
        let mut coord = coordinator();
        let (sid, _) = join(&mut coord, Uuid::new_v4(), "alice");
        let out = coord.handle(
            Uuid::new_v4(),
            ClientEvent::ResolveConflict {
                session_id: sid,
                resolved_content: "settled".to_string(),
                strategy: "manual".to_string(),
                user_id: "bob".to_string(),
            },
        );
        match &out[0] {
            Outgoing::ToRoom {
                message:
                    ServerMessage::ConflictResolved {
                        content,
                        version,
                        strategy,
                        ..
                    },
                include_sender,
                ..
            } => {
                assert_eq!(content, "settled");
                assert_eq!(*version, 2);
                assert_eq!(strategy, "manual");
                assert!(include_sender);
            }
            other => panic!("expected conflict-resolved, got {other:?}"),
        }
    }

    #[test]
    fn test_history_reply() {
        let mut coord = coordinator();
        let conn = Uuid::new_v4();
        let (sid, _) = join(&mut coord, conn, "alice");
        for v in 1..=3 {
            coord.handle(
                conn,
                ClientEvent::Update {
                    session_id: sid,
                    content: format!("v{v}"),
                    version: v,
                    user_id: "alice".to_string(),
                },
            );
        }
        let out = coord.handle(conn, ClientEvent::History {
            session_id: sid,
            limit: 2,
        });
        match &out[0] {
            Outgoing::ToSender(ServerMessage::FileHistory {
                history,
                total_versions,
                ..
            }) => {
                assert_eq!(history.len(), 2);
                assert_eq!(*total_versions, 4);
                assert_eq!(history.last().unwrap().version, 4);
            }
            other => panic!("expected file-history, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_session_replies_error() {
        let mut coord = coordinator();
        let out = coord.handle(
            Uuid::new_v4(),
            ClientEvent::Update {
                session_id: Uuid::new_v4(),
                content: "x".to_string(),
                version: 1,
                user_id: "alice".to_string(),
            },
        );
        assert!(matches!(
            &out[0],
            Outgoing::ToSender(ServerMessage::Error { .. })
        ));
        assert_eq!(coord.session_count(), 0);
    }

    #[test]
    fn test_disconnect_leaves_every_session() {
        let mut coord = coordinator();
        let conn = Uuid::new_v4();
        let (sid, _) = join(&mut coord, conn, "alice");
        // alice also joins a second file on the same connection.
        coord.handle(
            conn,
            ClientEvent::Join {
                container_id: "c1".to_string(),
                file_path: "lib.rs".to_string(),
                user_id: "alice".to_string(),
            },
        );
        // bob keeps the first session alive.
        let (sid_b, _) = join(&mut coord, Uuid::new_v4(), "bob");
        assert_eq!(sid, sid_b);
        assert_eq!(coord.session_count(), 2);

        let out = coord.disconnect(conn);
        // Second session (alice alone) is destroyed silently; the shared one
        // broadcasts user-left to bob.
        assert_eq!(coord.session_count(), 1);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Outgoing::ToRoom {
                message: ServerMessage::UserLeft { user_id, user_count },
                ..
            } => {
                assert_eq!(user_id, "alice");
                assert_eq!(*user_count, 1);
            }
            other => panic!("expected user-left, got {other:?}"),
        }
    }

    #[test]
    fn test_disconnect_releases_locks_with_broadcast() {
        let mut coord = coordinator();
        let conn = Uuid::new_v4();
        let (sid, _) = join(&mut coord, conn, "alice");
        join(&mut coord, Uuid::new_v4(), "bob");
        coord.handle(
            conn,
            ClientEvent::Lock {
                session_id: sid,
                file_path: "main.rs".to_string(),
                user_id: "alice".to_string(),
                lock: true,
            },
        );

        let out = coord.disconnect(conn);
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0],
            Outgoing::ToRoom {
                message: ServerMessage::FileLockChanged { locked: false, .. },
                ..
            }
        ));
        assert!(matches!(
            &out[1],
            Outgoing::ToRoom {
                message: ServerMessage::UserLeft { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_ping_pong() {
        let mut coord = coordinator();
        let out = coord.handle(Uuid::new_v4(), ClientEvent::Ping);
        assert_eq!(out, vec![Outgoing::ToSender(ServerMessage::Pong)]);
    }
}
