pub mod events;

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{
    Mutex, Notify, OwnedMutexGuard,
    mpsc::{self, error::TrySendError},
};
use uuid::Uuid;

use crate::{
    metrics::MetricsRegistry,
    models::{Language, Session},
    session::{SessionStore, StoreError},
};

pub use events::{ClientEvent, ServerEvent};

pub type ClientId = Uuid;

/// One connected client: an id plus the bounded outbound queue its
/// transport drains.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<ServerEvent>,
    evicted: Arc<Notify>,
}

impl ClientHandle {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                tx,
                evicted: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queues without waiting. A client whose queue is full is evicted and
    /// the event is dropped for it.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(client_id = %self.id, "outbound queue full, evicting client");
                self.evicted.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Resolves once the client has been evicted for falling behind.
    pub async fn evicted(&self) {
        self.evicted.notified().await;
    }
}

#[derive(Default)]
struct Room {
    members: HashMap<ClientId, ClientHandle>,
    // Set once the room has been dropped from the registry; holders of a
    // stale handle must look the room up again.
    closed: bool,
}

/// Tracks which clients are subscribed to each session and fans changes out
/// to them.
///
/// Each room has its own lock. A change is committed to the store and
/// delivered while that lock is held, so every member observes changes in
/// commit order. Rooms for different sessions never contend.
#[derive(Clone)]
pub struct RoomBroadcaster {
    rooms: Arc<DashMap<String, Arc<Mutex<Room>>>>,
    store: SessionStore,
    metrics: Arc<MetricsRegistry>,
}

impl RoomBroadcaster {
    pub fn new(store: SessionStore, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            store,
            metrics,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub async fn member_count(&self, session_id: &str) -> usize {
        let Some(room) = self.rooms.get(session_id).map(|r| r.value().clone()) else {
            return 0;
        };
        let room = room.lock().await;
        room.members.len()
    }

    /// Registers the client and replies to it alone with the stored state.
    pub async fn join(&self, client: &ClientHandle, session_id: &str) -> Result<Session, StoreError> {
        let mut room = self.open_room(session_id).await;
        let session = match self.store.get_or_create(session_id).await {
            Ok(session) => session,
            Err(err) => {
                self.release_if_empty(session_id, &mut room);
                return Err(err);
            }
        };

        room.members.insert(client.id(), client.clone());
        client.send(ServerEvent::CodeUpdate {
            session_id: session_id.to_string(),
            code: session.code.clone(),
            language: Some(session.language),
        });
        tracing::info!(
            session_id,
            client_id = %client.id(),
            members = room.members.len(),
            "client joined session"
        );
        Ok(session)
    }

    /// Returns whether the client was a member. The room is discarded once
    /// its last member leaves.
    pub async fn leave(&self, client_id: ClientId, session_id: &str) -> bool {
        let Some(room) = self.rooms.get(session_id).map(|r| r.value().clone()) else {
            return false;
        };
        let mut room = room.lock_owned().await;
        if room.closed {
            return false;
        }
        let removed = room.members.remove(&client_id).is_some();
        if removed {
            tracing::info!(
                session_id,
                client_id = %client_id,
                members = room.members.len(),
                "client left session"
            );
        }
        self.release_if_empty(session_id, &mut room);
        removed
    }

    /// Persists `code` (creating the session under this id if needed) and
    /// sends it to every member except `origin`. Returns the number of
    /// deliveries.
    pub async fn submit_change(
        &self,
        origin: Option<ClientId>,
        session_id: &str,
        code: &str,
    ) -> Result<usize, StoreError> {
        let mut room = self.open_room(session_id).await;
        let committed = self.commit_code(session_id, code).await;
        let delivered = match committed {
            Ok(()) => self.fan_out(
                &mut room,
                origin,
                ServerEvent::CodeUpdate {
                    session_id: session_id.to_string(),
                    code: code.to_string(),
                    language: None,
                },
            ),
            Err(_) => 0,
        };
        self.release_if_empty(session_id, &mut room);
        committed.map(|()| delivered)
    }

    pub async fn submit_language_change(
        &self,
        origin: Option<ClientId>,
        session_id: &str,
        language: Language,
    ) -> Result<usize, StoreError> {
        let mut room = self.open_room(session_id).await;
        let committed = self.commit_language(session_id, language).await;
        let delivered = match committed {
            Ok(()) => self.fan_out(
                &mut room,
                origin,
                ServerEvent::LanguageUpdate {
                    session_id: session_id.to_string(),
                    language,
                },
            ),
            Err(_) => 0,
        };
        self.release_if_empty(session_id, &mut room);
        committed.map(|()| delivered)
    }

    /// Updates an existing session on behalf of a non-member (the HTTP
    /// surface) and pushes each change to every member. Unknown ids yield
    /// `None` and are never created.
    pub async fn apply_update(
        &self,
        session_id: &str,
        code: Option<String>,
        language: Option<Language>,
    ) -> Result<Option<Session>, StoreError> {
        let mut room = self.open_room(session_id).await;
        let result = self.apply_update_locked(&mut room, session_id, code, language).await;
        self.release_if_empty(session_id, &mut room);
        result
    }

    async fn apply_update_locked(
        &self,
        room: &mut Room,
        session_id: &str,
        code: Option<String>,
        language: Option<Language>,
    ) -> Result<Option<Session>, StoreError> {
        if let Some(code) = code {
            if !self.store.update_code(session_id, &code).await? {
                return Ok(None);
            }
            self.fan_out(
                room,
                None,
                ServerEvent::CodeUpdate {
                    session_id: session_id.to_string(),
                    code,
                    language: None,
                },
            );
        }
        if let Some(language) = language {
            if !self.store.update_language(session_id, language).await? {
                return Ok(None);
            }
            self.fan_out(
                room,
                None,
                ServerEvent::LanguageUpdate {
                    session_id: session_id.to_string(),
                    language,
                },
            );
        }
        self.store.get(session_id).await
    }

    async fn commit_code(&self, session_id: &str, code: &str) -> Result<(), StoreError> {
        if !self.store.update_code(session_id, code).await? {
            self.store.get_or_create(session_id).await?;
            self.store.update_code(session_id, code).await?;
        }
        Ok(())
    }

    async fn commit_language(&self, session_id: &str, language: Language) -> Result<(), StoreError> {
        if !self.store.update_language(session_id, language).await? {
            self.store.get_or_create(session_id).await?;
            self.store.update_language(session_id, language).await?;
        }
        Ok(())
    }

    async fn open_room(&self, session_id: &str) -> OwnedMutexGuard<Room> {
        loop {
            let room = self
                .rooms
                .entry(session_id.to_string())
                .or_insert_with(|| {
                    self.metrics.room_opened();
                    Arc::new(Mutex::new(Room::default()))
                })
                .clone();
            let guard = room.lock_owned().await;
            if !guard.closed {
                return guard;
            }
        }
    }

    fn release_if_empty(&self, session_id: &str, room: &mut OwnedMutexGuard<Room>) {
        if !room.members.is_empty() || room.closed {
            return;
        }
        room.closed = true;
        let handle = OwnedMutexGuard::mutex(room);
        self.rooms
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, handle));
        self.metrics.room_closed();
    }

    fn fan_out(&self, room: &mut Room, origin: Option<ClientId>, event: ServerEvent) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, member) in &room.members {
            if Some(*id) == origin {
                continue;
            }
            if member.send(event.clone()) {
                delivered += 1;
            } else {
                gone.push(*id);
            }
        }
        for id in gone {
            room.members.remove(&id);
            tracing::debug!(client_id = %id, "pruned disconnected member");
        }
        self.metrics.broadcast(delivered as u64);
        delivered
    }
}
