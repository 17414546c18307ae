//! Fan-out of encoded frames to session room members with backpressure.
//!
//! Each live session has one [`SessionRoom`] holding the outbox of every
//! member connection. Frames are encoded once and shared as `Arc<Vec<u8>>`.
//! A member whose outbox is full has the frame dropped rather than stalling
//! the room; drops are counted and logged.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::session::SessionId;

/// Shared pre-encoded frame.
pub type Frame = Arc<Vec<u8>>;

/// Snapshot of room delivery counters.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub members: usize,
}

/// One session's broadcast domain: connection id → outbox.
pub struct SessionRoom {
    members: RwLock<HashMap<Uuid, mpsc::Sender<Frame>>>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl SessionRoom {
    fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Register a connection's outbox with this room.
    pub async fn join(&self, conn: Uuid, outbox: mpsc::Sender<Frame>) {
        self.members.write().await.insert(conn, outbox);
    }

    pub async fn leave(&self, conn: Uuid) {
        self.members.write().await.remove(&conn);
    }

    /// Deliver a frame to every member except `exclude`.
    ///
    /// Returns the number of outboxes the frame reached. Full outboxes drop
    /// the frame so one slow consumer cannot stall the room.
    pub async fn broadcast(&self, frame: Frame, exclude: Option<Uuid>) -> usize {
        let members = self.members.read().await;
        let mut delivered = 0;
        for (conn, outbox) in members.iter() {
            if Some(*conn) == exclude {
                continue;
            }
            match outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("room frame dropped for lagging connection {conn}");
                }
            }
        }
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            members: self.members.read().await.len(),
        }
    }
}

/// Maps session ids to their rooms; rooms are created on demand and reaped
/// when empty.
pub struct RoomManager {
    rooms: RwLock<HashMap<SessionId, Arc<SessionRoom>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, session_id: SessionId) -> Arc<SessionRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&session_id) {
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionRoom::new()))
            .clone()
    }

    /// Register a connection with a session room.
    pub async fn join(&self, session_id: SessionId, conn: Uuid, outbox: mpsc::Sender<Frame>) {
        self.get_or_create(session_id).await.join(conn, outbox).await;
    }

    /// Remove a connection from a session room.
    pub async fn leave(&self, session_id: SessionId, conn: Uuid) {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(&session_id).cloned()
        };
        if let Some(room) = room {
            room.leave(conn).await;
        }
    }

    /// Deliver a frame to a session room, if it exists.
    pub async fn broadcast(
        &self,
        session_id: SessionId,
        frame: Frame,
        exclude: Option<Uuid>,
    ) -> usize {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(&session_id).cloned()
        };
        match room {
            Some(room) => room.broadcast(frame, exclude).await,
            None => 0,
        }
    }

    /// Drop the room if no members remain. Returns true when removed.
    pub async fn remove_if_empty(&self, session_id: SessionId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&session_id) {
            if room.member_count().await == 0 {
                rooms.remove(&session_id);
                log::debug!("room {session_id} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
