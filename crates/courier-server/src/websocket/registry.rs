//! Per-user connection registry.
//!
//! Maps each user to the set of its live connections. The first connection
//! of a user fires the connected callback and the removal of the last one
//! fires the disconnected callback, both while the map's write lock is held.
//! Callbacks must therefore not call back into the registry.
//!
//! A set that loses its last member is marked destroyed and unlinked under
//! the write lock. An add that raced with that removal and still holds the
//! old set sees the mark and retries against a fresh set, so each user's
//! disconnect callback always precedes the next connect callback.

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::{ConnectionId, UserId};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::connection::Connection;
use super::frame::WsMessage;
use crate::errors::RegistryError;

/// Callback fired with the user id on connect or disconnect.
pub type UserCallback = Arc<dyn Fn(&UserId) + Send + Sync>;

/// What the registry needs from a connection.
pub trait Outbound: Send + Sync + 'static {
    /// Unique connection id.
    fn id(&self) -> &ConnectionId;
    /// Queue a message without blocking.
    fn send(&self, message: WsMessage) -> bool;
    /// Whether the connection is closing or closed.
    fn is_terminating(&self) -> bool;
    /// Request close.
    fn close(&self);
}

impl Outbound for Connection {
    fn id(&self) -> &ConnectionId {
        Connection::id(self)
    }

    fn send(&self, message: WsMessage) -> bool {
        Connection::send(self, message)
    }

    fn is_terminating(&self) -> bool {
        Connection::is_terminating(self)
    }

    fn close(&self) {
        Connection::close(self);
    }
}

/// Marker: the set was emptied and unlinked.
struct Destroyed;

enum Removal {
    NotMember,
    Remaining(usize),
    Emptied,
}

struct SetState<C> {
    members: Vec<Arc<C>>,
    destroyed: bool,
}

struct UserConnections<C> {
    state: Mutex<SetState<C>>,
}

impl<C: Outbound> UserConnections<C> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SetState {
                members: Vec::new(),
                destroyed: false,
            }),
        }
    }

    fn insert(&self, conn: Arc<C>) -> Result<usize, Destroyed> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Destroyed);
        }
        state.members.push(conn);
        Ok(state.members.len())
    }

    fn remove(&self, id: &ConnectionId) -> Removal {
        let mut state = self.state.lock();
        let Some(pos) = state.members.iter().position(|c| c.id() == id) else {
            return Removal::NotMember;
        };
        drop(state.members.swap_remove(pos));
        if state.members.is_empty() {
            state.destroyed = true;
            Removal::Emptied
        } else {
            Removal::Remaining(state.members.len())
        }
    }

    fn snapshot(&self) -> Vec<Arc<C>> {
        self.state.lock().members.clone()
    }

    fn len(&self) -> usize {
        self.state.lock().members.len()
    }
}

#[derive(Default)]
struct Callbacks {
    on_connect: Option<UserCallback>,
    on_disconnect: Option<UserCallback>,
}

/// Tracks live connections per user.
pub struct ConnectionRegistry<C: Outbound = Connection> {
    users: RwLock<HashMap<UserId, Arc<UserConnections<C>>>>,
    callbacks: RwLock<Callbacks>,
}

impl<C: Outbound> ConnectionRegistry<C> {
    /// Empty registry with no callbacks.
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Callbacks::default()),
        }
    }

    /// Set the callback fired when a user gets its first connection.
    pub fn on_user_connected(&self, callback: UserCallback) {
        self.callbacks.write().on_connect = Some(callback);
    }

    /// Set the callback fired when a user loses its last connection.
    pub fn on_user_disconnected(&self, callback: UserCallback) {
        self.callbacks.write().on_disconnect = Some(callback);
    }

    /// Track `conn` for `user`.
    pub fn add_connection(&self, user: &UserId, conn: Arc<C>) {
        loop {
            let set = self.get_or_create(user);
            match set.insert(Arc::clone(&conn)) {
                Ok(count) => {
                    debug!(user = %user, conn_id = %conn.id(), count, "connection added");
                    return;
                }
                Err(Destroyed) => {
                    self.unlink(user, &set);
                    debug!(user = %user, "connection set destroyed concurrently, retrying");
                }
            }
        }
    }

    /// Stop tracking connection `id` of `user`.
    pub fn remove_connection(&self, user: &UserId, id: &ConnectionId) -> Result<(), RegistryError> {
        let mut users = self.users.write();
        let Some(set) = users.get(user).cloned() else {
            return Err(RegistryError::NotFound(user.clone()));
        };
        match set.remove(id) {
            Removal::NotMember => Err(RegistryError::NotFound(user.clone())),
            Removal::Remaining(count) => {
                debug!(user = %user, conn_id = %id, count, "connection removed");
                Ok(())
            }
            Removal::Emptied => {
                drop(users.remove(user));
                info!(user = %user, "user disconnected");
                if let Some(cb) = &self.callbacks.read().on_disconnect {
                    cb(user);
                }
                Ok(())
            }
        }
    }

    /// Queue `message` on every open connection of `user`.
    ///
    /// Returns how many connections accepted it. Delivery is best effort:
    /// terminating connections are skipped and full queues drop.
    pub fn send_message(&self, user: &UserId, message: &WsMessage) -> Result<usize, RegistryError> {
        let set = self
            .users
            .read()
            .get(user)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(user.clone()))?;

        let delivered = set
            .snapshot()
            .iter()
            .filter(|conn| !conn.is_terminating())
            .filter(|conn| conn.send(message.clone()))
            .count();
        Ok(delivered)
    }

    /// Queue a text message for `user`.
    pub fn send_text(&self, user: &UserId, text: impl Into<String>) -> Result<usize, RegistryError> {
        self.send_message(user, &WsMessage::text(text))
    }

    /// Queue a binary message for `user`.
    pub fn send_binary(
        &self,
        user: &UserId,
        data: impl Into<bytes::Bytes>,
    ) -> Result<usize, RegistryError> {
        self.send_message(user, &WsMessage::binary(data))
    }

    /// Whether `user` has at least one tracked connection.
    pub fn is_connected(&self, user: &UserId) -> bool {
        self.users.read().contains_key(user)
    }

    /// Number of users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    /// Number of tracked connections across all users.
    pub fn connection_count(&self) -> usize {
        self.users.read().values().map(|set| set.len()).sum()
    }

    /// Close every tracked connection. Sessions remove them as they exit.
    pub fn close_all(&self) {
        let sets: Vec<_> = self.users.read().values().cloned().collect();
        for conn in sets.iter().flat_map(|set| set.snapshot()) {
            conn.close();
        }
    }

    fn get_or_create(&self, user: &UserId) -> Arc<UserConnections<C>> {
        if let Some(set) = self.users.read().get(user) {
            return Arc::clone(set);
        }

        let mut users = self.users.write();
        if let Some(set) = users.get(user) {
            return Arc::clone(set);
        }
        let set = Arc::new(UserConnections::new());
        drop(users.insert(user.clone(), Arc::clone(&set)));
        info!(user = %user, "user connected");
        if let Some(cb) = &self.callbacks.read().on_connect {
            cb(user);
        }
        set
    }

    fn unlink(&self, user: &UserId, set: &Arc<UserConnections<C>>) {
        let mut users = self.users.write();
        if users.get(user).is_some_and(|current| Arc::ptr_eq(current, set)) {
            drop(users.remove(user));
        }
    }
}

impl<C: Outbound> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
